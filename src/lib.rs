#[macro_use]
extern crate lazy_static;

pub mod args;
pub mod database;
pub mod messaging;
pub mod model;
pub mod utils;

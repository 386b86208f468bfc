pub mod constants;
pub mod engine;
pub mod ladder_tracker;
pub mod math;
pub mod mov;
pub mod recorder;
pub mod replay;
pub mod replay_executor;
pub mod sex_offset;
pub mod stabilization;
pub mod structures;

pub use constants::Params;
pub use engine::rate_match;
pub use ladder_tracker::{pair_key, EngineState, LadderTracker, PairState, PlayerState};
pub use structures::{Discipline, LadderKey, MatchInput, Sport};

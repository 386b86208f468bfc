pub mod discipline;
pub mod ladder_key;
pub mod match_input;
pub mod match_tier;
pub mod rating_result;
pub mod rating_status;
pub mod sex;
pub mod side;
pub mod sport;

pub use discipline::Discipline;
pub use ladder_key::LadderKey;
pub use match_input::{GameScore, MatchInput, SideInput, SidePlayer};
pub use match_tier::MatchTier;
pub use rating_result::{MatchRatingResult, PairUpdate, PlayerRatingChange, SexOffsetSignal};
pub use rating_status::RatingStatus;
pub use sex::{Sex, SexCounts};
pub use side::Side;
pub use sport::{MovStyle, Sport};

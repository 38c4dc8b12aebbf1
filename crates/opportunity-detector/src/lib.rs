pub mod detector;
pub mod graph;
pub mod profit;
pub mod search;
pub mod touched;
pub mod types;

pub use detector::{DetectorConfig, DetectorStats, OpportunityDetector};
pub use graph::{parse_pair_key, TokenGraph};
pub use profit::{quote_leg, ConfidenceDecay, RouteError};
pub use search::{canonical_cycle, CycleSearch, SearchBudget};
pub use touched::TouchedQueue;
pub use types::*;

pub type Result<T> = std::result::Result<T, RouteError>;

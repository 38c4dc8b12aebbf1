pub mod tracker;

pub use tracker::{CorrelatedPair, CorrelationTracker, TrackerConfig, TrackerStats};

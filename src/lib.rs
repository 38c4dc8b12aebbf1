//! # arbcore: real-time arbitrage pricing core
//!
//! Multi-venue price state for arbitrage detection:
//! - Seqlock price cells addressed by dense (pair, venue) indices
//! - Three-tier cache with CLOCK demotion and write-behind
//! - Incremental 2-leg spread and multi-leg cycle detection
//! - Co-occurrence tracking to prewarm correlated pairs

pub mod config;
pub mod metrics;

pub use correlation_tracker;
pub use event_processor;
pub use opportunity_detector;
pub use price_store;
pub use pricing_engine;
pub use tiered_cache;

pub use config::CoreConfig;
pub use pricing_engine::{EngineConfig, PricingEngine};

pub type Result<T> = anyhow::Result<T>;

pub const VERSION: &str = env!("CARGO_PKG_VERSION");
pub const NAME: &str = env!("CARGO_PKG_NAME");

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version() {
        assert!(!VERSION.trim().is_empty());
    }

    #[test]
    fn test_name() {
        assert_eq!(NAME, "arbcore");
    }
}

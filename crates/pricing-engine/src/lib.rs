pub mod config;
pub mod engine;

pub use config::{ConfigError, EngineConfig};
pub use engine::{EngineError, EngineStats, PricingEngine};

pub type Result<T> = anyhow::Result<T>;

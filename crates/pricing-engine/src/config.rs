use correlation_tracker::TrackerConfig;
use event_processor::ProcessorConfig;
use opportunity_detector::DetectorConfig;
use price_store::StoreConfig;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;
use tiered_cache::CacheConfig;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Invalid value for {field}: {reason}")]
    Invalid { field: &'static str, reason: String },
}

impl ConfigError {
    fn invalid(field: &'static str, reason: impl Into<String>) -> Self {
        ConfigError::Invalid {
            field,
            reason: reason.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub store: StoreConfig,
    pub cache: CacheConfig,
    pub detector: DetectorConfig,
    pub tracker: TrackerConfig,
    pub processor: ProcessorConfig,
    /// Age past which a quote is stale, for the lower cache tiers and the
    /// detector alike.
    pub staleness_window_ms: u64,
    /// Pause between detection cycles.
    pub cycle_interval_ms: u64,
    pub publish_buffer: usize,
    /// Correlated pairs prewarmed per updated pair.
    pub prewarm_limit: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            store: StoreConfig::default(),
            cache: CacheConfig::default(),
            detector: DetectorConfig::default(),
            tracker: TrackerConfig::default(),
            processor: ProcessorConfig::default(),
            staleness_window_ms: 5_000,
            cycle_interval_ms: 1,
            publish_buffer: 4096,
            prewarm_limit: 4,
        }
    }
}

impl EngineConfig {
    #[inline]
    pub fn cycle_interval(&self) -> Duration {
        Duration::from_millis(self.cycle_interval_ms)
    }

    /// Cache settings with the shared staleness window applied.
    pub fn cache_config(&self) -> CacheConfig {
        CacheConfig {
            staleness_window_ms: self.staleness_window_ms,
            ..self.cache.clone()
        }
    }

    /// Detector settings with the shared staleness window applied.
    pub fn detector_config(&self) -> DetectorConfig {
        DetectorConfig {
            staleness_window_ms: self.staleness_window_ms,
            ..self.detector.clone()
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let store = &self.store;
        if store.max_pairs == 0 || store.max_venues == 0 {
            return Err(ConfigError::invalid("store", "max_pairs and max_venues must be non-zero"));
        }

        let cells = store.max_pairs as usize * store.max_venues as usize;
        if let Some(l1) = self.cache.l1_eviction.capacity {
            if l1 == 0 || l1 > cells {
                return Err(ConfigError::invalid(
                    "cache.l1_eviction.capacity",
                    format!("must be in 1..={} (max_pairs x max_venues), got {}", cells, l1),
                ));
            }
        }
        if self.staleness_window_ms == 0 {
            return Err(ConfigError::invalid("staleness_window_ms", "must be non-zero"));
        }

        let detector = &self.detector;
        if !(2..=5).contains(&detector.max_leg_depth) {
            return Err(ConfigError::invalid(
                "detector.max_leg_depth",
                format!("must be between 2 and 5, got {}", detector.max_leg_depth),
            ));
        }
        if !detector.min_profit_threshold.is_finite() || detector.min_profit_threshold < 0.0 {
            return Err(ConfigError::invalid("detector.min_profit_threshold", "must be a non-negative number"));
        }
        if !(0.0..=1.0).contains(&detector.min_confidence) {
            return Err(ConfigError::invalid("detector.min_confidence", "must be within 0..=1"));
        }
        if !detector.trade_amount.is_finite() || detector.trade_amount <= 0.0 {
            return Err(ConfigError::invalid("detector.trade_amount", "must be positive"));
        }
        if detector.detection_cycle_budget_ms == 0 || detector.max_search_states == 0 {
            return Err(ConfigError::invalid("detector", "search budget must be non-zero"));
        }
        if detector.default_fee_bps >= 10_000 || detector.venue_fees_bps.values().any(|bps| *bps >= 10_000) {
            return Err(ConfigError::invalid("detector.venue_fees_bps", "fees must be below 10000 bps"));
        }

        let tracker = &self.tracker;
        if tracker.window_ms == 0 || tracker.half_life_ms == 0 || tracker.max_window_events == 0 {
            return Err(ConfigError::invalid("tracker", "window and half-life must be non-zero"));
        }
        if !tracker.min_score.is_finite() || tracker.min_score < 0.0 {
            return Err(ConfigError::invalid("tracker.min_score", "must be a non-negative number"));
        }

        if self.processor.worker_threads == 0 || self.processor.buffer_size == 0 {
            return Err(ConfigError::invalid("processor", "workers and buffer must be non-zero"));
        }
        if self.publish_buffer == 0 {
            return Err(ConfigError::invalid("publish_buffer", "must be non-zero"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        assert_eq!(EngineConfig::default().validate(), Ok(()));
    }

    #[test]
    fn test_leg_depth_bounds() {
        let mut config = EngineConfig::default();
        config.detector.max_leg_depth = 6;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::Invalid { field: "detector.max_leg_depth", .. })
        ));
        config.detector.max_leg_depth = 2;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_l1_capacity_bounded_by_store() {
        let mut config = EngineConfig::default();
        config.store.max_pairs = 4;
        config.store.max_venues = 2;
        config.cache.l1_eviction.capacity = Some(9);
        assert!(config.validate().is_err());
        config.cache.l1_eviction.capacity = Some(0);
        assert!(config.validate().is_err());
        config.cache.l1_eviction.capacity = Some(8);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_small_store_keeps_default_l1_capacity_valid() {
        let mut config = EngineConfig::default();
        config.store.max_pairs = 16;
        config.store.max_venues = 2;
        assert_eq!(config.cache.l1_eviction.capacity, None);
        assert_eq!(config.validate(), Ok(()));
    }

    #[test]
    fn test_staleness_window_is_shared() {
        let mut config = EngineConfig::default();
        config.staleness_window_ms = 750;
        config.detector.staleness_window_ms = 1;
        assert_eq!(config.cache_config().staleness_window_ms, 750);
        assert_eq!(config.detector_config().staleness_window_ms, 750);

        config.staleness_window_ms = 0;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::Invalid { field: "staleness_window_ms", .. })
        ));
    }

    #[test]
    fn test_negative_threshold_rejected() {
        let mut config = EngineConfig::default();
        config.detector.min_profit_threshold = -0.01;
        assert!(config.validate().is_err());
    }
}

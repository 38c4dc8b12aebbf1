use chrono::Utc;
use price_store::PriceData;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum Tier {
    L1 = 1,
    L2 = 2,
    L3 = 3,
}

impl fmt::Display for Tier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Tier::L1 => write!(f, "L1"),
            Tier::L2 => write!(f, "L2"),
            Tier::L3 => write!(f, "L3"),
        }
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TierError {
    #[error("{tier} unavailable: {reason}")]
    Unavailable { tier: Tier, reason: String },
    #[error("{tier} timed out after {after_ms}ms")]
    Timeout { tier: Tier, after_ms: u64 },
    #[error("Cache entry codec error: {0}")]
    Codec(String),
}

/// Stable identity of one (pair, venue) quote across tiers.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CacheKey {
    pub pair: Arc<str>,
    pub venue: Arc<str>,
}

impl CacheKey {
    pub fn new(pair: impl Into<Arc<str>>, venue: impl Into<Arc<str>>) -> Self {
        Self {
            pair: pair.into(),
            venue: venue.into(),
        }
    }

    /// Key used against the L2/L3 backends.
    pub fn storage_key(&self) -> String {
        format!("px:{}@{}", self.pair, self.venue)
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.pair, self.venue)
    }
}

/// Serialized form of one cell in L2/L3.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheEntry {
    pub pair: String,
    pub venue: String,
    pub data: PriceData,
    pub tier: Tier,
    pub stored_at_ms: u64,
    pub expires_at_ms: u64,
}

impl CacheEntry {
    pub fn new(key: &CacheKey, data: PriceData, tier: Tier, ttl: Duration) -> Self {
        let stored_at_ms = now_ms();
        Self {
            pair: key.pair.to_string(),
            venue: key.venue.to_string(),
            data,
            tier,
            stored_at_ms,
            expires_at_ms: stored_at_ms.saturating_add(ttl.as_millis() as u64),
        }
    }

    pub fn key(&self) -> CacheKey {
        CacheKey::new(self.pair.as_str(), self.venue.as_str())
    }

    pub fn encode(&self) -> Result<Vec<u8>, TierError> {
        bincode::serialize(self).map_err(|e| TierError::Codec(e.to_string()))
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, TierError> {
        bincode::deserialize(bytes).map_err(|e| TierError::Codec(e.to_string()))
    }

    #[inline]
    pub fn is_expired(&self, now_ms: u64) -> bool {
        now_ms >= self.expires_at_ms
    }

    /// Expired, or observed longer ago than the staleness window.
    #[inline]
    pub fn is_unusable(&self, now_ms: u64, now_ns: u64, staleness: Duration) -> bool {
        self.is_expired(now_ms) || self.data.age_ns(now_ns) > staleness.as_nanos() as u64
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheLookup {
    Hit { data: PriceData, tier: Tier },
    Miss,
}

impl CacheLookup {
    #[inline]
    pub fn data(&self) -> Option<PriceData> {
        match self {
            CacheLookup::Hit { data, .. } => Some(*data),
            CacheLookup::Miss => None,
        }
    }

    #[inline]
    pub fn tier(&self) -> Option<Tier> {
        match self {
            CacheLookup::Hit { tier, .. } => Some(*tier),
            CacheLookup::Miss => None,
        }
    }
}

#[inline]
pub(crate) fn now_ms() -> u64 {
    Utc::now().timestamp_millis().max(0) as u64
}

#[cfg(test)]
mod tests {
    use super::*;
    use price_store::{Liquidity, Price};

    fn data(observed_at_ns: u64) -> PriceData {
        PriceData::new(Price::new(2000.0), Liquidity::new(50.0), Liquidity::new(100_000.0), observed_at_ns)
    }

    #[test]
    fn test_storage_key_format() {
        let key = CacheKey::new("WETH/USDC", "uniswapv2");
        assert_eq!(key.storage_key(), "px:WETH/USDC@uniswapv2");
        assert_eq!(key.to_string(), "WETH/USDC@uniswapv2");
    }

    #[test]
    fn test_entry_codec() {
        let key = CacheKey::new("WETH/USDC", "uniswapv2");
        let entry = CacheEntry::new(&key, data(5), Tier::L2, Duration::from_secs(1));
        let decoded = CacheEntry::decode(&entry.encode().unwrap()).unwrap();
        assert_eq!(decoded, entry);
        assert_eq!(decoded.key(), key);
    }

    #[test]
    fn test_garbage_is_a_codec_error() {
        assert!(matches!(CacheEntry::decode(&[1, 2, 3]), Err(TierError::Codec(_))));
    }

    #[test]
    fn test_expiry_and_staleness() {
        let key = CacheKey::new("A/B", "x");
        let mut entry = CacheEntry::new(&key, data(1_000_000_000), Tier::L2, Duration::from_millis(100));
        entry.stored_at_ms = 1_000;
        entry.expires_at_ms = 1_100;

        let window = Duration::from_millis(500);
        assert!(!entry.is_unusable(1_050, 1_200_000_000, window));
        assert!(entry.is_unusable(1_100, 1_200_000_000, window));
        assert!(entry.is_unusable(1_050, 1_600_000_000, window));
    }
}

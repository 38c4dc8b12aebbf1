use crate::entry::{Tier, TierError};
use async_trait::async_trait;
use dashmap::DashMap;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{Duration, Instant};

/// L2: shared key-value store (cross-process). Implementations own the network.
#[async_trait]
pub trait KvStore: Send + Sync {
    async fn get_raw(&self, key: &str) -> Result<Option<Vec<u8>>, TierError>;

    async fn set_raw(&self, key: &str, value: Vec<u8>, ttl: Duration) -> Result<(), TierError>;

    async fn delete(&self, key: &str) -> Result<(), TierError>;
}

/// L3: compressed persistent store for cold entries. Compression is the backend's concern.
#[async_trait]
pub trait ColdStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, TierError>;

    async fn put(&self, key: &str, value: Vec<u8>) -> Result<(), TierError>;

    async fn delete(&self, key: &str) -> Result<(), TierError>;
}

/// Bounds a tier call so the caller never waits longer than `limit`.
pub async fn with_timeout<T, F>(tier: Tier, limit: Duration, call: F) -> Result<T, TierError>
where
    F: Future<Output = Result<T, TierError>>,
{
    match tokio::time::timeout(limit, call).await {
        Ok(result) => result,
        Err(_) => Err(TierError::Timeout {
            tier,
            after_ms: limit.as_millis() as u64,
        }),
    }
}

#[derive(Debug, Default)]
struct CallCounters {
    gets: AtomicU64,
    sets: AtomicU64,
    deletes: AtomicU64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TierCallStats {
    pub gets: u64,
    pub sets: u64,
    pub deletes: u64,
}

impl CallCounters {
    fn snapshot(&self) -> TierCallStats {
        TierCallStats {
            gets: self.gets.load(Ordering::Relaxed),
            sets: self.sets.load(Ordering::Relaxed),
            deletes: self.deletes.load(Ordering::Relaxed),
        }
    }
}

/// In-process L2 with TTLs, an availability switch and call counters.
#[derive(Debug)]
pub struct MemoryKvStore {
    entries: DashMap<String, (Vec<u8>, Instant)>,
    available: AtomicBool,
    calls: CallCounters,
}

impl MemoryKvStore {
    pub fn new() -> Self {
        Self {
            entries: DashMap::new(),
            available: AtomicBool::new(true),
            calls: CallCounters::default(),
        }
    }

    /// Simulates an outage: every call fails with `TierError::Unavailable`.
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::Release);
    }

    pub fn contains(&self, key: &str) -> bool {
        self.entries
            .get(key)
            .map(|entry| entry.1 > Instant::now())
            .unwrap_or(false)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn calls(&self) -> TierCallStats {
        self.calls.snapshot()
    }

    fn check_available(&self) -> Result<(), TierError> {
        if self.available.load(Ordering::Acquire) {
            Ok(())
        } else {
            Err(TierError::Unavailable {
                tier: Tier::L2,
                reason: "memory kv store switched off".to_string(),
            })
        }
    }
}

impl Default for MemoryKvStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl KvStore for MemoryKvStore {
    async fn get_raw(&self, key: &str) -> Result<Option<Vec<u8>>, TierError> {
        self.calls.gets.fetch_add(1, Ordering::Relaxed);
        self.check_available()?;

        let now = Instant::now();
        let value = match self.entries.get(key) {
            Some(entry) if entry.1 > now => Some(entry.0.clone()),
            Some(_) => None,
            None => return Ok(None),
        };
        if value.is_none() {
            self.entries.remove_if(key, |_, (_, expires_at)| *expires_at <= now);
        }
        Ok(value)
    }

    async fn set_raw(&self, key: &str, value: Vec<u8>, ttl: Duration) -> Result<(), TierError> {
        self.calls.sets.fetch_add(1, Ordering::Relaxed);
        self.check_available()?;
        self.entries.insert(key.to_string(), (value, Instant::now() + ttl));
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), TierError> {
        self.calls.deletes.fetch_add(1, Ordering::Relaxed);
        self.check_available()?;
        self.entries.remove(key);
        Ok(())
    }
}

/// In-process L3 with an availability switch and call counters.
#[derive(Debug)]
pub struct MemoryColdStore {
    entries: DashMap<String, Vec<u8>>,
    available: AtomicBool,
    calls: CallCounters,
}

impl MemoryColdStore {
    pub fn new() -> Self {
        Self {
            entries: DashMap::new(),
            available: AtomicBool::new(true),
            calls: CallCounters::default(),
        }
    }

    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::Release);
    }

    pub fn contains(&self, key: &str) -> bool {
        self.entries.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn calls(&self) -> TierCallStats {
        self.calls.snapshot()
    }

    fn check_available(&self) -> Result<(), TierError> {
        if self.available.load(Ordering::Acquire) {
            Ok(())
        } else {
            Err(TierError::Unavailable {
                tier: Tier::L3,
                reason: "memory cold store switched off".to_string(),
            })
        }
    }
}

impl Default for MemoryColdStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ColdStore for MemoryColdStore {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, TierError> {
        self.calls.gets.fetch_add(1, Ordering::Relaxed);
        self.check_available()?;
        Ok(self.entries.get(key).map(|value| value.clone()))
    }

    async fn put(&self, key: &str, value: Vec<u8>) -> Result<(), TierError> {
        self.calls.sets.fetch_add(1, Ordering::Relaxed);
        self.check_available()?;
        self.entries.insert(key.to_string(), value);
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), TierError> {
        self.calls.deletes.fetch_add(1, Ordering::Relaxed);
        self.check_available()?;
        self.entries.remove(key);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_memory_kv_round_trip() {
        let kv = MemoryKvStore::new();
        kv.set_raw("a", vec![1, 2], Duration::from_secs(5)).await.unwrap();
        assert_eq!(kv.get_raw("a").await.unwrap(), Some(vec![1, 2]));
        kv.delete("a").await.unwrap();
        assert_eq!(kv.get_raw("a").await.unwrap(), None);
        assert_eq!(kv.calls(), TierCallStats { gets: 2, sets: 1, deletes: 1 });
    }

    #[tokio::test]
    async fn test_memory_kv_ttl() {
        let kv = MemoryKvStore::new();
        kv.set_raw("a", vec![1], Duration::ZERO).await.unwrap();
        assert_eq!(kv.get_raw("a").await.unwrap(), None);
        assert!(kv.is_empty());
    }

    #[tokio::test]
    async fn test_unavailable_tiers_fail() {
        let kv = MemoryKvStore::new();
        kv.set_available(false);
        assert!(matches!(
            kv.get_raw("a").await,
            Err(TierError::Unavailable { tier: Tier::L2, .. })
        ));

        let cold = MemoryColdStore::new();
        cold.set_available(false);
        assert!(matches!(
            cold.put("a", vec![]).await,
            Err(TierError::Unavailable { tier: Tier::L3, .. })
        ));
    }

    #[tokio::test]
    async fn test_with_timeout_bounds_slow_calls() {
        let result: Result<(), TierError> = with_timeout(Tier::L2, Duration::from_millis(5), async {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok(())
        })
        .await;
        assert_eq!(result, Err(TierError::Timeout { tier: Tier::L2, after_ms: 5 }));
    }
}

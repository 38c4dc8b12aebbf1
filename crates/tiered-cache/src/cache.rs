use crate::entry::{now_ms, CacheEntry, CacheKey, CacheLookup, Tier, TierError};
use crate::residency::ResidencySet;
use crate::tier::{with_timeout, ColdStore, KvStore};
use crate::write_behind::{FlushReport, RetryPolicy, WriteBehind};
use metrics::counter;
use parking_lot::{Mutex, RwLock};
use price_store::{
    now_ns, CellRead, CellReader, CellSnapshot, IndexError, IndexMapper, PairIndex, PriceData, PriceStore,
    StoreError, VenueIndex, WriteOutcome,
};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{fence, AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::task::JoinHandle;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CacheError {
    #[error(transparent)]
    Capacity(#[from] IndexError),
    #[error(transparent)]
    Store(#[from] StoreError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct L1EvictionPolicy {
    /// Resident cells before one is demoted. `None` uses every store cell.
    pub capacity: Option<usize>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    pub l1_eviction: L1EvictionPolicy,
    pub l2_ttl_ms: u64,
    /// Set by the owning engine from its shared window.
    #[serde(skip)]
    pub staleness_window_ms: u64,
    pub l2_timeout_ms: u64,
    pub flush_interval_ms: u64,
    pub retry_base_delay_ms: u64,
    pub retry_max_delay_ms: u64,
    pub max_write_attempts: u32,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            l1_eviction: L1EvictionPolicy::default(),
            l2_ttl_ms: 60_000,
            staleness_window_ms: 5_000,
            l2_timeout_ms: 50,
            flush_interval_ms: 10,
            retry_base_delay_ms: 25,
            retry_max_delay_ms: 2_000,
            max_write_attempts: 5,
        }
    }
}

impl CacheConfig {
    #[inline]
    pub fn staleness_window(&self) -> Duration {
        Duration::from_millis(self.staleness_window_ms)
    }

    #[inline]
    pub fn l2_ttl(&self) -> Duration {
        Duration::from_millis(self.l2_ttl_ms)
    }

    fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            io_timeout: Duration::from_millis(self.l2_timeout_ms),
            base_delay: Duration::from_millis(self.retry_base_delay_ms),
            max_delay: Duration::from_millis(self.retry_max_delay_ms),
            max_attempts: self.max_write_attempts.max(1),
            l2_ttl: self.l2_ttl(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SetOutcome {
    pub pair: PairIndex,
    pub venue: VenueIndex,
    pub write: WriteOutcome,
    /// Key demoted out of L1 to make room, if any.
    pub evicted: Option<CacheKey>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CacheStats {
    pub l1_hits: u64,
    pub l2_hits: u64,
    pub l3_hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub promotions: u64,
    pub tier_failures: u64,
    pub resident: usize,
    pub pending_writes: usize,
    pub staged_demotions: usize,
}

#[derive(Debug, Default)]
struct Counters {
    l1_hits: AtomicU64,
    l2_hits: AtomicU64,
    l3_hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
    promotions: AtomicU64,
    tier_failures: AtomicU64,
}

/// L1 seqlock cells backed by a shared L2 and a cold L3.
///
/// `set` and `get_l1` never wait on I/O. L2 writes go through a coalescing
/// write-behind queue drained by a background task (see [`start`]), and L2/L3
/// reads are bounded by `l2_timeout_ms`. If a lower tier is down, L1 keeps
/// serving and the failure is counted.
///
/// [`start`]: HierarchicalCache::start
pub struct HierarchicalCache {
    config: CacheConfig,
    store: Arc<PriceStore>,
    mapper: Arc<IndexMapper>,
    residency: ResidencySet,
    evict_guard: Mutex<()>,
    write_behind: Arc<WriteBehind>,
    l2: Arc<dyn KvStore>,
    l3: Arc<dyn ColdStore>,
    counters: Counters,
    running: Arc<AtomicBool>,
    worker: RwLock<Option<JoinHandle<()>>>,
}

impl HierarchicalCache {
    pub fn new(
        store: Arc<PriceStore>,
        mapper: Arc<IndexMapper>,
        l2: Arc<dyn KvStore>,
        l3: Arc<dyn ColdStore>,
        config: CacheConfig,
    ) -> Self {
        let cells = store.capacity();
        let capacity = config.l1_eviction.capacity.unwrap_or(cells).clamp(1, cells);
        Self {
            residency: ResidencySet::new(capacity, store.pair_capacity(), store.venue_capacity()),
            evict_guard: Mutex::new(()),
            write_behind: Arc::new(WriteBehind::new(config.retry_policy())),
            counters: Counters::default(),
            running: Arc::new(AtomicBool::new(false)),
            worker: RwLock::new(None),
            config,
            store,
            mapper,
            l2,
            l3,
        }
    }

    #[inline]
    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    #[inline]
    pub fn store(&self) -> &Arc<PriceStore> {
        &self.store
    }

    #[inline]
    pub fn mapper(&self) -> &Arc<IndexMapper> {
        &self.mapper
    }

    /// Writes into L1 and queues the L2 write-behind.
    pub fn set(&self, key: &CacheKey, data: PriceData) -> Result<SetOutcome, CacheError> {
        let (pair, venue) = self.mapper.get_or_assign(&key.pair, &key.venue)?;
        let (write, evicted) = self.install(pair, venue, &data)?;
        if write.is_written() {
            self.write_behind
                .enqueue(CacheEntry::new(key, data, Tier::L2, self.config.l2_ttl()));
        }
        Ok(SetOutcome {
            pair,
            venue,
            write,
            evicted,
        })
    }

    /// Hot-path read: L1 only, never touches L2 or L3.
    #[inline]
    pub fn get_l1(&self, key: &CacheKey) -> Option<CellSnapshot> {
        let (pair, venue) = self.mapper.lookup(&key.pair, &key.venue)?;
        self.read_l1(pair, venue)
    }

    /// Full lookup: L1, staged demotions, L2, then L3. Lower-tier hits are promoted.
    pub async fn get(&self, key: &CacheKey) -> CacheLookup {
        if let Some(snapshot) = self.get_l1(key) {
            return CacheLookup::Hit {
                data: snapshot.data,
                tier: Tier::L1,
            };
        }

        let now_ms = now_ms();
        let now_ns = now_ns();
        let staleness = self.config.staleness_window();

        if let Some(entry) = self.write_behind.staged(key) {
            if !entry.is_unusable(now_ms, now_ns, staleness) {
                self.record_hit(Tier::L2);
                self.promote(key, &entry.data);
                return CacheLookup::Hit {
                    data: entry.data,
                    tier: Tier::L2,
                };
            }
        }

        let storage_key = key.storage_key();
        match self.fetch_l2(&storage_key).await {
            Ok(Some(entry)) if !entry.is_unusable(now_ms, now_ns, staleness) => {
                self.record_hit(Tier::L2);
                self.promote(key, &entry.data);
                return CacheLookup::Hit {
                    data: entry.data,
                    tier: Tier::L2,
                };
            }
            Ok(Some(_)) => {
                tracing::trace!(%key, "Dropping expired L2 entry");
                let _ = with_timeout(Tier::L2, self.io_timeout(), self.l2.delete(&storage_key)).await;
            }
            Ok(None) => {}
            Err(error) => self.record_tier_failure(key, &error),
        }

        match self.fetch_l3(&storage_key).await {
            Ok(Some(entry)) if !entry.is_unusable(now_ms, now_ns, staleness) => {
                self.record_hit(Tier::L3);
                self.promote(key, &entry.data);
                // Back into L2 through the write-behind, off this path.
                self.write_behind
                    .enqueue(CacheEntry::new(key, entry.data, Tier::L2, self.config.l2_ttl()));
                CacheLookup::Hit {
                    data: entry.data,
                    tier: Tier::L3,
                }
            }
            Ok(Some(_)) => {
                tracing::trace!(%key, "Dropping expired L3 entry");
                let _ = with_timeout(Tier::L3, self.io_timeout(), self.l3.delete(&storage_key)).await;
                self.record_miss()
            }
            Ok(None) => self.record_miss(),
            Err(error) => {
                self.record_tier_failure(key, &error);
                self.record_miss()
            }
        }
    }

    /// Removes `key` from every tier. L2/L3 deletes are best-effort.
    pub async fn invalidate(&self, key: &CacheKey) {
        if let Some((pair, venue)) = self.mapper.lookup(&key.pair, &key.venue) {
            let _guard = self.evict_guard.lock();
            self.residency.remove(pair, venue);
            let _ = self.store.clear(pair, venue);
        }
        self.write_behind.forget(key);

        let storage_key = key.storage_key();
        if let Err(error) = with_timeout(Tier::L2, self.io_timeout(), self.l2.delete(&storage_key)).await {
            self.record_tier_failure(key, &error);
        }
        if let Err(error) = with_timeout(Tier::L3, self.io_timeout(), self.l3.delete(&storage_key)).await {
            self.record_tier_failure(key, &error);
        }
    }

    /// Pushes `key` out of L1 into the staging area. False if it was not resident.
    pub fn demote(&self, key: &CacheKey) -> bool {
        let Some((pair, venue)) = self.mapper.lookup(&key.pair, &key.venue) else {
            return false;
        };
        let _guard = self.evict_guard.lock();
        if !self.residency.contains(pair, venue) {
            return false;
        }
        self.evict(pair, venue).is_some()
    }

    /// Pulls every known venue of `pair_key` up into L1. Returns how many were loaded.
    pub async fn prewarm(&self, pair_key: &str) -> usize {
        let Some(pair) = self.mapper.pair_index(pair_key) else {
            return 0;
        };

        let mut warmed = 0;
        for venue in self.mapper.venues_for(pair) {
            if self.residency.contains(pair, venue) {
                continue;
            }
            let Some(venue_key) = self.mapper.venue_key(venue) else {
                continue;
            };
            let key = CacheKey::new(pair_key, venue_key);
            if let CacheLookup::Hit { tier, .. } = self.get(&key).await {
                if tier != Tier::L1 {
                    warmed += 1;
                }
            }
        }
        if warmed > 0 {
            tracing::debug!(pair = pair_key, warmed, "Prewarmed pair into L1");
        }
        warmed
    }

    /// Drains every pending write now, ignoring backoff.
    pub async fn flush(&self) -> FlushReport {
        self.write_behind
            .flush(self.l2.as_ref(), self.l3.as_ref(), true)
            .await
    }

    /// Spawns the write-behind worker on the current tokio runtime.
    pub fn start(&self) {
        if self.running.swap(true, Ordering::AcqRel) {
            return;
        }

        let write_behind = Arc::clone(&self.write_behind);
        let l2 = Arc::clone(&self.l2);
        let l3 = Arc::clone(&self.l3);
        let running = Arc::clone(&self.running);
        let flush_interval = Duration::from_millis(self.config.flush_interval_ms.max(1));

        let handle = tokio::spawn(async move {
            tracing::debug!("Write-behind worker started");
            let mut interval = tokio::time::interval(flush_interval);
            while running.load(Ordering::Acquire) {
                tokio::select! {
                    _ = interval.tick() => {}
                    _ = write_behind.notified() => {}
                }
                let report = write_behind.flush(l2.as_ref(), l3.as_ref(), false).await;
                if report.retried > 0 || report.dropped > 0 {
                    tracing::debug!(?report, "Write-behind pass finished with failures");
                }
            }
            tracing::debug!("Write-behind worker stopped");
        });

        *self.worker.write() = Some(handle);
        tracing::info!(capacity = self.residency.capacity(), "Hierarchical cache started");
    }

    /// Stops the worker and makes a last forced flush.
    pub async fn shutdown(&self) -> FlushReport {
        self.running.store(false, Ordering::Release);
        let handle = self.worker.write().take();
        if let Some(handle) = handle {
            handle.abort();
            let _ = handle.await;
        }
        let report = self.flush().await;
        tracing::info!(
            written = report.written,
            pending = self.write_behind.pending_len(),
            "Hierarchical cache stopped"
        );
        report
    }

    #[inline]
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    #[inline]
    pub fn is_resident(&self, key: &CacheKey) -> bool {
        self.mapper
            .lookup(&key.pair, &key.venue)
            .map(|(pair, venue)| self.residency.contains(pair, venue))
            .unwrap_or(false)
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            l1_hits: self.counters.l1_hits.load(Ordering::Relaxed),
            l2_hits: self.counters.l2_hits.load(Ordering::Relaxed),
            l3_hits: self.counters.l3_hits.load(Ordering::Relaxed),
            misses: self.counters.misses.load(Ordering::Relaxed),
            evictions: self.counters.evictions.load(Ordering::Relaxed),
            promotions: self.counters.promotions.load(Ordering::Relaxed),
            tier_failures: self.counters.tier_failures.load(Ordering::Relaxed),
            resident: self.residency.len(),
            pending_writes: self.write_behind.pending_len(),
            staged_demotions: self.write_behind.staged_len(),
        }
    }

    #[inline]
    fn read_l1(&self, pair: PairIndex, venue: VenueIndex) -> Option<CellSnapshot> {
        match self.store.read(pair, venue).ok()? {
            CellRead::Value(snapshot) => {
                self.residency.touch(pair, venue);
                self.record_hit(Tier::L1);
                Some(snapshot)
            }
            CellRead::NotFound | CellRead::Stale => None,
        }
    }

    /// Writes a cell, evicting first if it is not yet resident and L1 is full.
    fn install(
        &self,
        pair: PairIndex,
        venue: VenueIndex,
        data: &PriceData,
    ) -> Result<(WriteOutcome, Option<CacheKey>), CacheError> {
        if self.residency.touch(pair, venue) {
            let write = self.store.write(pair, venue, data)?;
            // Pairs with the fence in `evict`.
            fence(Ordering::SeqCst);
            if self.residency.contains(pair, venue) {
                return Ok((write, None));
            }
            // Lost a race with an eviction; fall through and readmit.
        }

        let _guard = self.evict_guard.lock();
        let mut evicted = None;
        if !self.residency.contains(pair, venue) {
            while self.residency.is_full() {
                let Some((victim_pair, victim_venue)) = self.residency.victim(Some((pair, venue))) else {
                    break;
                };
                evicted = self.evict(victim_pair, victim_venue).or(evicted);
            }
        }

        let write = self.store.write(pair, venue, data)?;
        if self.residency.admit(pair, venue) {
            if let (Some(pair_key), Some(venue_key)) = (self.mapper.pair_key(pair), self.mapper.venue_key(venue)) {
                self.write_behind.unstage(&CacheKey { pair: pair_key, venue: venue_key });
            }
        }
        Ok((write, evicted))
    }

    /// Stages the cell's snapshot for L2/L3, then clears it. Caller holds the eviction guard.
    fn evict(&self, pair: PairIndex, venue: VenueIndex) -> Option<CacheKey> {
        // Out of residency first: a resident writer landing after this sees
        // the cell gone and re-admits through the guard.
        self.residency.remove(pair, venue);
        fence(Ordering::SeqCst);
        let key = match (self.mapper.pair_key(pair), self.mapper.venue_key(venue)) {
            (Some(pair_key), Some(venue_key)) => CacheKey {
                pair: pair_key,
                venue: venue_key,
            },
            _ => return None,
        };

        // Resident writers do not take the guard, so clear only the version we staged.
        loop {
            match self.store.read(pair, venue) {
                Ok(CellRead::Value(snapshot)) => {
                    self.write_behind.stage_demotion(CacheEntry::new(
                        &key,
                        snapshot.data,
                        Tier::L2,
                        self.config.l2_ttl(),
                    ));
                    if matches!(self.store.clear_at(pair, venue, snapshot.version), Ok(true)) {
                        break;
                    }
                }
                Ok(CellRead::Stale) => std::hint::spin_loop(),
                Ok(CellRead::NotFound) | Err(_) => break,
            }
        }

        self.counters.evictions.fetch_add(1, Ordering::Relaxed);
        counter!("cache_evictions_total").increment(1);
        tracing::trace!(%key, "Demoted L1 cell");
        Some(key)
    }

    fn promote(&self, key: &CacheKey, data: &PriceData) {
        let (pair, venue) = match self.mapper.get_or_assign(&key.pair, &key.venue) {
            Ok(coordinates) => coordinates,
            Err(error) => {
                tracing::warn!(%key, %error, "Skipping L1 promotion");
                return;
            }
        };
        match self.install(pair, venue, data) {
            Ok((WriteOutcome::Written { .. }, _)) => {
                self.counters.promotions.fetch_add(1, Ordering::Relaxed);
            }
            Ok((WriteOutcome::Superseded { .. }, _)) => {}
            Err(error) => tracing::warn!(%key, %error, "L1 promotion failed"),
        }
    }

    async fn fetch_l2(&self, storage_key: &str) -> Result<Option<CacheEntry>, TierError> {
        let bytes = with_timeout(Tier::L2, self.io_timeout(), self.l2.get_raw(storage_key)).await?;
        bytes.map(|bytes| CacheEntry::decode(&bytes)).transpose()
    }

    async fn fetch_l3(&self, storage_key: &str) -> Result<Option<CacheEntry>, TierError> {
        let bytes = with_timeout(Tier::L3, self.io_timeout(), self.l3.get(storage_key)).await?;
        bytes.map(|bytes| CacheEntry::decode(&bytes)).transpose()
    }

    #[inline]
    fn io_timeout(&self) -> Duration {
        Duration::from_millis(self.config.l2_timeout_ms)
    }

    #[inline]
    fn record_hit(&self, tier: Tier) {
        match tier {
            Tier::L1 => {
                self.counters.l1_hits.fetch_add(1, Ordering::Relaxed);
                counter!("cache_l1_hits_total").increment(1);
            }
            Tier::L2 => {
                self.counters.l2_hits.fetch_add(1, Ordering::Relaxed);
                counter!("cache_l2_hits_total").increment(1);
            }
            Tier::L3 => {
                self.counters.l3_hits.fetch_add(1, Ordering::Relaxed);
                counter!("cache_l3_hits_total").increment(1);
            }
        }
    }

    fn record_miss(&self) -> CacheLookup {
        self.counters.misses.fetch_add(1, Ordering::Relaxed);
        counter!("cache_misses_total").increment(1);
        CacheLookup::Miss
    }

    fn record_tier_failure(&self, key: &CacheKey, error: &TierError) {
        self.counters.tier_failures.fetch_add(1, Ordering::Relaxed);
        counter!("cache_tier_failures_total").increment(1);
        tracing::warn!(%key, %error, "Cache tier call failed");
    }
}

impl CellReader for HierarchicalCache {
    /// Plain L1 read for the detector; does not count as a hit or refresh recency.
    #[inline]
    fn read_cell(&self, pair: PairIndex, venue: VenueIndex) -> CellRead {
        self.store.read_cell(pair, venue)
    }

    #[inline]
    fn pair_capacity(&self) -> u32 {
        self.store.pair_capacity()
    }

    #[inline]
    fn venue_capacity(&self) -> u32 {
        self.store.venue_capacity()
    }
}

impl Drop for HierarchicalCache {
    fn drop(&mut self) {
        self.running.store(false, Ordering::Release);
        if let Some(handle) = self.worker.get_mut().take() {
            handle.abort();
        }
    }
}

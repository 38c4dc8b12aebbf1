use crate::entry::{CacheEntry, CacheKey, Tier};
use crate::tier::{with_timeout, ColdStore, KvStore};
use dashmap::DashMap;
use metrics::counter;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tokio::sync::Notify;

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub io_timeout: Duration,
    pub base_delay: Duration,
    pub max_delay: Duration,
    /// Plain write-throughs give up after this many attempts; demotions never do.
    pub max_attempts: u32,
    pub l2_ttl: Duration,
}

impl RetryPolicy {
    /// Exponential backoff: `base * 2^(attempts - 1)`, capped.
    pub fn backoff(&self, attempts: u32) -> Duration {
        let exponent = attempts.saturating_sub(1).min(16);
        self.base_delay
            .saturating_mul(1u32 << exponent)
            .min(self.max_delay)
    }
}

#[derive(Debug, Clone)]
struct PendingWrite {
    entry: CacheEntry,
    demotion: bool,
    attempts: u32,
    not_before: Instant,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FlushReport {
    pub written: usize,
    pub retried: usize,
    pub dropped: usize,
}

/// Coalescing queue of L2 writes, plus the staging area that holds demoted
/// entries until L2 has confirmed them.
///
/// Enqueueing is a map insert and never waits on I/O; a newer value for the
/// same key replaces an older pending one.
#[derive(Debug)]
pub struct WriteBehind {
    pending: DashMap<CacheKey, PendingWrite>,
    staged: DashMap<CacheKey, CacheEntry>,
    notify: Notify,
    policy: RetryPolicy,
    dropped: AtomicU64,
}

impl WriteBehind {
    pub fn new(policy: RetryPolicy) -> Self {
        Self {
            pending: DashMap::new(),
            staged: DashMap::new(),
            notify: Notify::new(),
            policy,
            dropped: AtomicU64::new(0),
        }
    }

    #[inline]
    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    pub fn enqueue(&self, entry: CacheEntry) {
        let key = entry.key();
        self.insert_pending(key, entry, false, 0, Instant::now());
        self.notify.notify_one();
    }

    /// Stages an evicted entry. It stays readable here until L2 confirms it.
    pub fn stage_demotion(&self, entry: CacheEntry) {
        let key = entry.key();
        self.staged.insert(key.clone(), entry.clone());
        self.insert_pending(key, entry, true, 0, Instant::now());
        self.notify.notify_one();
    }

    #[inline]
    pub fn staged(&self, key: &CacheKey) -> Option<CacheEntry> {
        self.staged.get(key).map(|entry| entry.clone())
    }

    /// L1 holds `key` again, so the staged copy is no longer the newest.
    /// Any pending demotion write still goes out.
    #[inline]
    pub fn unstage(&self, key: &CacheKey) -> Option<CacheEntry> {
        self.staged.remove(key).map(|(_, entry)| entry)
    }

    /// Drops any pending or staged state for `key`.
    pub fn forget(&self, key: &CacheKey) {
        self.pending.remove(key);
        self.staged.remove(key);
    }

    #[inline]
    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    #[inline]
    pub fn staged_len(&self) -> usize {
        self.staged.len()
    }

    #[inline]
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    pub async fn notified(&self) {
        self.notify.notified().await
    }

    /// Attempts every pending write that is due (or all of them when `force`).
    pub async fn flush(&self, l2: &dyn KvStore, l3: &dyn ColdStore, force: bool) -> FlushReport {
        let now = Instant::now();
        let due: Vec<CacheKey> = self
            .pending
            .iter()
            .filter(|pending| force || pending.not_before <= now)
            .map(|pending| pending.key().clone())
            .collect();

        let mut report = FlushReport::default();
        for key in due {
            // Removing claims the write; a concurrent flusher skips it.
            let Some((key, pending)) = self.pending.remove(&key) else {
                continue;
            };

            match self.write_out(&key, &pending, l2, l3).await {
                Ok(()) => {
                    report.written += 1;
                    if pending.demotion {
                        self.staged.remove_if(&key, |_, staged| staged.data == pending.entry.data);
                    }
                }
                Err(error) => {
                    counter!("cache_tier_failures_total").increment(1);
                    let attempts = pending.attempts + 1;
                    if !pending.demotion && attempts >= self.policy.max_attempts {
                        self.dropped.fetch_add(1, Ordering::Relaxed);
                        counter!("cache_write_behind_dropped_total").increment(1);
                        tracing::error!(%key, attempts, %error, "Giving up on L2 write-through; L1 still serves");
                        report.dropped += 1;
                        continue;
                    }

                    let delay = self.policy.backoff(attempts);
                    tracing::warn!(%key, attempts, delay_ms = delay.as_millis() as u64, %error, "L2 write failed, retrying");
                    self.insert_pending(key, pending.entry, pending.demotion, attempts, Instant::now() + delay);
                    report.retried += 1;
                }
            }
        }
        report
    }

    async fn write_out(
        &self,
        key: &CacheKey,
        pending: &PendingWrite,
        l2: &dyn KvStore,
        l3: &dyn ColdStore,
    ) -> Result<(), crate::entry::TierError> {
        let storage_key = key.storage_key();
        let bytes = pending.entry.encode()?;

        with_timeout(
            Tier::L2,
            self.policy.io_timeout,
            l2.set_raw(&storage_key, bytes.clone(), self.policy.l2_ttl),
        )
        .await?;

        if pending.demotion {
            let mut cold = pending.entry.clone();
            cold.tier = Tier::L3;
            let bytes = cold.encode()?;
            if let Err(error) = with_timeout(Tier::L3, self.policy.io_timeout, l3.put(&storage_key, bytes)).await {
                counter!("cache_tier_failures_total").increment(1);
                tracing::warn!(%key, %error, "L3 archive of demoted entry failed");
            }
        }
        Ok(())
    }

    fn insert_pending(&self, key: CacheKey, entry: CacheEntry, demotion: bool, attempts: u32, not_before: Instant) {
        self.pending
            .entry(key)
            .and_modify(|existing| {
                // Keep whichever value was observed later; a retry never clobbers a fresh write.
                if entry.data.observed_at_ns >= existing.entry.data.observed_at_ns {
                    existing.entry = entry.clone();
                    existing.attempts = attempts.min(existing.attempts);
                    existing.not_before = not_before.min(existing.not_before);
                }
                existing.demotion |= demotion;
            })
            .or_insert_with(|| PendingWrite {
                entry: entry.clone(),
                demotion,
                attempts,
                not_before,
            });
    }
}

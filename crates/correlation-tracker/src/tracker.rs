use chrono::Utc;
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrackerConfig {
    /// Two updates closer than this co-occur.
    pub window_ms: u64,
    /// Scores halve after this long without reinforcement.
    pub half_life_ms: u64,
    pub max_window_events: usize,
    /// Decayed scores below this are dropped.
    pub min_score: f64,
    /// Minimum gap between two sweeps of decayed edges.
    pub prune_interval_ms: u64,
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            window_ms: 250,
            half_life_ms: 30_000,
            max_window_events: 1024,
            min_score: 0.05,
            prune_interval_ms: 5_000,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CorrelatedPair {
    pub pair: Arc<str>,
    pub score: f64,
}

#[derive(Debug, Clone, Copy)]
struct EdgeScore {
    score: f64,
    updated_at_ms: u64,
}

impl EdgeScore {
    #[inline]
    fn decayed(&self, now_ms: u64, half_life_ms: u64) -> f64 {
        let elapsed = now_ms.saturating_sub(self.updated_at_ms) as f64;
        self.score * 0.5f64.powf(elapsed / half_life_ms.max(1) as f64)
    }

    #[inline]
    fn reinforce(&mut self, now_ms: u64, half_life_ms: u64) {
        self.score = self.decayed(now_ms, half_life_ms) + 1.0;
        self.updated_at_ms = self.updated_at_ms.max(now_ms);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TrackerStats {
    pub updates: u64,
    pub tracked_pairs: usize,
    pub window_len: usize,
}

/// Counts how often pairs update close together in time.
///
/// Purely a ranking signal for pre-warming; nothing here is a price source.
#[derive(Debug)]
pub struct CorrelationTracker {
    config: TrackerConfig,
    window: Mutex<VecDeque<(Arc<str>, u64)>>,
    edges: DashMap<Arc<str>, HashMap<Arc<str>, EdgeScore>>,
    updates: AtomicU64,
    last_prune_ms: AtomicU64,
}

impl CorrelationTracker {
    pub fn new() -> Self {
        Self::with_config(TrackerConfig::default())
    }

    pub fn with_config(config: TrackerConfig) -> Self {
        Self {
            window: Mutex::new(VecDeque::with_capacity(config.max_window_events)),
            edges: DashMap::new(),
            updates: AtomicU64::new(0),
            last_prune_ms: AtomicU64::new(0),
            config,
        }
    }

    #[inline]
    pub fn config(&self) -> &TrackerConfig {
        &self.config
    }

    pub fn record_update(&self, pair_key: &str) {
        self.record_update_at(pair_key, now_ms());
    }

    pub fn record_update_at(&self, pair_key: &str, now_ms: u64) {
        let pair: Arc<str> = self
            .edges
            .get(pair_key)
            .map(|entry| Arc::clone(entry.key()))
            .unwrap_or_else(|| Arc::from(pair_key));

        let partners = {
            let mut window = self.window.lock();
            while let Some((_, at)) = window.front() {
                if now_ms.saturating_sub(*at) > self.config.window_ms {
                    window.pop_front();
                } else {
                    break;
                }
            }

            let mut seen = HashSet::new();
            let partners: Vec<Arc<str>> = window
                .iter()
                .filter(|(other, _)| **other != *pair && seen.insert(Arc::clone(other)))
                .map(|(other, _)| Arc::clone(other))
                .collect();

            window.push_back((Arc::clone(&pair), now_ms));
            while window.len() > self.config.max_window_events {
                window.pop_front();
            }
            partners
        };

        self.updates.fetch_add(1, Ordering::Relaxed);
        self.edges.entry(Arc::clone(&pair)).or_default();

        let half_life = self.config.half_life_ms;
        for other in partners {
            // One shard guard at a time.
            self.reinforce(&pair, &other, now_ms, half_life);
            self.reinforce(&other, &pair, now_ms, half_life);
        }
    }

    /// Records a batch of pairs that changed together, e.g. one detection cycle.
    pub fn record_updates<'a, I>(&self, pair_keys: I)
    where
        I: IntoIterator<Item = &'a str>,
    {
        let now_ms = now_ms();
        for pair_key in pair_keys {
            self.record_update_at(pair_key, now_ms);
        }
    }

    pub fn get_correlated(&self, pair_key: &str, limit: usize) -> Vec<CorrelatedPair> {
        self.get_correlated_at(pair_key, limit, now_ms())
    }

    pub fn get_correlated_at(&self, pair_key: &str, limit: usize, now_ms: u64) -> Vec<CorrelatedPair> {
        let Some(neighbours) = self.edges.get(pair_key) else {
            return Vec::new();
        };

        let mut ranked: Vec<CorrelatedPair> = neighbours
            .iter()
            .map(|(pair, edge)| CorrelatedPair {
                pair: Arc::clone(pair),
                score: edge.decayed(now_ms, self.config.half_life_ms),
            })
            .filter(|candidate| candidate.score >= self.config.min_score)
            .collect();
        drop(neighbours);

        ranked.sort_by(|a, b| b.score.total_cmp(&a.score).then_with(|| a.pair.cmp(&b.pair)));
        ranked.truncate(limit);
        ranked
    }

    /// Prunes if `prune_interval_ms` has passed since the last sweep.
    pub fn maybe_prune(&self) -> Option<usize> {
        self.maybe_prune_at(now_ms())
    }

    pub fn maybe_prune_at(&self, now_ms: u64) -> Option<usize> {
        let last = self.last_prune_ms.load(Ordering::Relaxed);
        if now_ms.saturating_sub(last) < self.config.prune_interval_ms {
            return None;
        }
        self.last_prune_ms
            .compare_exchange(last, now_ms, Ordering::AcqRel, Ordering::Relaxed)
            .ok()?;
        Some(self.prune_at(now_ms))
    }

    /// Drops edges whose decayed score fell below `min_score`, and pairs left
    /// without any.
    pub fn prune_at(&self, now_ms: u64) -> usize {
        let half_life = self.config.half_life_ms;
        let min_score = self.config.min_score;
        let mut removed = 0;
        self.edges.retain(|_, neighbours| {
            let before = neighbours.len();
            neighbours.retain(|_, edge| edge.decayed(now_ms, half_life) >= min_score);
            removed += before - neighbours.len();
            !neighbours.is_empty()
        });
        if removed > 0 {
            tracing::debug!(removed, pairs = self.edges.len(), "Pruned decayed correlation edges");
        }
        removed
    }

    pub fn stats(&self) -> TrackerStats {
        TrackerStats {
            updates: self.updates.load(Ordering::Relaxed),
            tracked_pairs: self.edges.len(),
            window_len: self.window.lock().len(),
        }
    }

    #[inline]
    fn reinforce(&self, from: &Arc<str>, to: &Arc<str>, now_ms: u64, half_life_ms: u64) {
        let mut neighbours = self.edges.entry(Arc::clone(from)).or_default();
        neighbours
            .entry(Arc::clone(to))
            .or_insert(EdgeScore {
                score: 0.0,
                updated_at_ms: now_ms,
            })
            .reinforce(now_ms, half_life_ms);
    }
}

#[inline]
fn now_ms() -> u64 {
    Utc::now().timestamp_millis().max(0) as u64
}

impl Default for CorrelationTracker {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tracker() -> CorrelationTracker {
        CorrelationTracker::with_config(TrackerConfig {
            window_ms: 100,
            half_life_ms: 1_000,
            max_window_events: 64,
            min_score: 0.01,
            prune_interval_ms: 1_000,
        })
    }

    #[test]
    fn test_updates_inside_window_correlate() {
        let tracker = tracker();
        tracker.record_update_at("WETH/USDC", 1_000);
        tracker.record_update_at("WBTC/WETH", 1_050);

        let correlated = tracker.get_correlated_at("WETH/USDC", 10, 1_050);
        assert_eq!(correlated.len(), 1);
        assert_eq!(&*correlated[0].pair, "WBTC/WETH");
        assert!((correlated[0].score - 1.0).abs() < 1e-9);

        // Symmetric.
        let reverse = tracker.get_correlated_at("WBTC/WETH", 10, 1_050);
        assert_eq!(&*reverse[0].pair, "WETH/USDC");
    }

    #[test]
    fn test_updates_outside_window_do_not_correlate() {
        let tracker = tracker();
        tracker.record_update_at("WETH/USDC", 1_000);
        tracker.record_update_at("WBTC/WETH", 1_500);
        assert!(tracker.get_correlated_at("WETH/USDC", 10, 1_500).is_empty());
    }

    #[test]
    fn test_scores_rank_by_frequency() {
        let tracker = tracker();
        let mut now = 10_000;
        for round in 0..5 {
            tracker.record_update_at("A/B", now);
            tracker.record_update_at("B/C", now + 1);
            if round == 0 {
                tracker.record_update_at("C/D", now + 2);
            }
            now += 500;
        }

        let ranked = tracker.get_correlated_at("A/B", 10, now);
        assert_eq!(&*ranked[0].pair, "B/C");
        assert_eq!(&*ranked[1].pair, "C/D");
        assert!(ranked[0].score > ranked[1].score);

        let limited = tracker.get_correlated_at("A/B", 1, now);
        assert_eq!(limited.len(), 1);
    }

    #[test]
    fn test_scores_decay_with_time() {
        let tracker = tracker();
        tracker.record_update_at("A/B", 0);
        tracker.record_update_at("B/C", 10);

        let fresh = tracker.get_correlated_at("A/B", 1, 10)[0].score;
        let later = tracker.get_correlated_at("A/B", 1, 1_010)[0].score;
        assert!((later - fresh / 2.0).abs() < 1e-9);

        // Far enough out the edge falls below the floor.
        assert!(tracker.get_correlated_at("A/B", 1, 20_000).is_empty());
        assert_eq!(tracker.prune_at(20_000), 2);
        assert_eq!(tracker.stats().tracked_pairs, 0);
    }

    #[test]
    fn test_prune_waits_for_interval() {
        let tracker = tracker();
        tracker.record_update_at("A/B", 0);
        tracker.record_update_at("B/C", 10);

        assert_eq!(tracker.maybe_prune_at(20_000), Some(2));
        tracker.record_update_at("A/B", 20_000);
        tracker.record_update_at("B/C", 20_010);
        // Next sweep not due yet.
        assert_eq!(tracker.maybe_prune_at(20_500), None);
        assert_eq!(tracker.maybe_prune_at(40_000), Some(2));
        assert_eq!(tracker.stats().tracked_pairs, 0);
    }

    #[test]
    fn test_batch_updates_correlate_with_each_other() {
        let tracker = tracker();
        tracker.record_updates(["A/B", "B/C", "C/A"]);
        let correlated = tracker.get_correlated("C/A", 10);
        assert_eq!(correlated.len(), 2);
        assert_eq!(tracker.stats().updates, 3);
    }

    #[test]
    fn test_correlated_pair_serializes() {
        let pair = CorrelatedPair {
            pair: Arc::from("WETH/USDC"),
            score: 0.75,
        };
        let json = serde_json::to_string(&pair).unwrap();
        assert_eq!(serde_json::from_str::<CorrelatedPair>(&json).unwrap(), pair);
    }

    #[test]
    fn test_repeated_self_updates_are_ignored() {
        let tracker = tracker();
        tracker.record_update_at("A/B", 0);
        tracker.record_update_at("A/B", 1);
        assert!(tracker.get_correlated_at("A/B", 10, 1).is_empty());
        assert_eq!(tracker.stats().updates, 2);
    }

    #[test]
    fn test_window_is_bounded() {
        let tracker = CorrelationTracker::with_config(TrackerConfig {
            max_window_events: 4,
            ..TrackerConfig::default()
        });
        for i in 0..32 {
            tracker.record_update_at(&format!("P{}/Q", i), 5);
        }
        assert_eq!(tracker.stats().window_len, 4);
    }
}

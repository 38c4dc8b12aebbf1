use crate::events::PriceUpdateEvent;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::{Duration, Instant};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BatchConfig {
    pub max_batch_size: usize,
    /// How long a worker keeps collecting after its first event.
    pub max_batch_delay_us: u64,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            max_batch_size: 256,
            max_batch_delay_us: 200,
        }
    }
}

impl BatchConfig {
    #[inline]
    pub fn max_batch_delay(&self) -> Duration {
        Duration::from_micros(self.max_batch_delay_us)
    }
}

/// Updates collected by one worker pass, keeping only the newest per cell.
///
/// "Newest" is the higher venue sequence when both are sequenced, otherwise
/// the later observation time.
#[derive(Debug)]
pub struct UpdateBatch {
    updates: Vec<PriceUpdateEvent>,
    slots: HashMap<(String, String), usize>,
    received: usize,
    created_at: Instant,
}

impl UpdateBatch {
    #[inline]
    pub fn new() -> Self {
        Self::with_capacity(0)
    }

    #[inline]
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            updates: Vec::with_capacity(capacity),
            slots: HashMap::with_capacity(capacity),
            received: 0,
            created_at: Instant::now(),
        }
    }

    pub fn push(&mut self, update: PriceUpdateEvent) {
        self.received += 1;
        let key = (update.pair_key.clone(), update.venue_key.clone());
        match self.slots.get(&key) {
            Some(&slot) => {
                if supersedes(&update, &self.updates[slot]) {
                    self.updates[slot] = update;
                }
            }
            None => {
                self.slots.insert(key, self.updates.len());
                self.updates.push(update);
            }
        }
    }

    /// Distinct cells in the batch.
    #[inline]
    pub fn len(&self) -> usize {
        self.updates.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.updates.is_empty()
    }

    /// Events pushed, including ones folded into an existing slot.
    #[inline]
    pub fn received(&self) -> usize {
        self.received
    }

    #[inline]
    pub fn coalesced(&self) -> usize {
        self.received - self.updates.len()
    }

    #[inline]
    pub fn age(&self) -> Duration {
        self.created_at.elapsed()
    }

    #[inline]
    pub fn should_flush(&self, config: &BatchConfig) -> bool {
        self.received >= config.max_batch_size || self.age() >= config.max_batch_delay()
    }

    #[inline]
    pub fn updates(&self) -> &[PriceUpdateEvent] {
        &self.updates
    }

    #[inline]
    pub fn into_updates(self) -> Vec<PriceUpdateEvent> {
        self.updates
    }
}

impl Default for UpdateBatch {
    fn default() -> Self {
        Self::new()
    }
}

#[inline]
fn supersedes(incoming: &PriceUpdateEvent, current: &PriceUpdateEvent) -> bool {
    if incoming.venue_sequence != 0 && current.venue_sequence != 0 {
        incoming.venue_sequence > current.venue_sequence
    } else {
        incoming.observed_at_ns >= current.observed_at_ns
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn update(pair: &str, venue: &str, price: f64, observed_at_ns: u64) -> PriceUpdateEvent {
        PriceUpdateEvent::new(pair, venue, price, 1.0, 1.0, observed_at_ns)
    }

    #[test]
    fn test_batch_keeps_newest_per_cell() {
        let mut batch = UpdateBatch::new();
        batch.push(update("A/B", "x", 1.0, 10));
        batch.push(update("A/B", "x", 2.0, 30));
        batch.push(update("A/B", "x", 1.5, 20));
        batch.push(update("A/B", "y", 9.0, 5));

        assert_eq!(batch.len(), 2);
        assert_eq!(batch.received(), 4);
        assert_eq!(batch.coalesced(), 2);
        assert_eq!(batch.updates()[0].price, 2.0);
        assert_eq!(batch.updates()[1].venue_key, "y");
    }

    #[test]
    fn test_venue_sequence_wins_over_timestamps() {
        let mut batch = UpdateBatch::new();
        batch.push(update("A/B", "x", 1.0, 50).with_sequence(9));
        batch.push(update("A/B", "x", 2.0, 60).with_sequence(8));
        assert_eq!(batch.updates()[0].price, 1.0);
    }

    #[test]
    fn test_flush_on_size() {
        let config = BatchConfig {
            max_batch_size: 2,
            max_batch_delay_us: 1_000_000,
        };
        let mut batch = UpdateBatch::new();
        batch.push(update("A/B", "x", 1.0, 1));
        assert!(!batch.should_flush(&config));
        batch.push(update("A/B", "x", 1.0, 2));
        assert!(batch.should_flush(&config));
    }
}

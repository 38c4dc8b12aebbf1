use crossbeam_queue::ArrayQueue;
use price_store::PairIndex;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

/// Pairs written since the last detection cycle.
///
/// Each pair is queued at most once until drained, so the queue can never hold
/// more than `max_pairs` entries no matter how hot ingestion runs.
#[derive(Debug)]
pub struct TouchedQueue {
    queue: ArrayQueue<PairIndex>,
    queued: Box<[AtomicBool]>,
    coalesced: AtomicU64,
}

impl TouchedQueue {
    pub fn new(max_pairs: u32) -> Self {
        let capacity = max_pairs.max(1) as usize;
        Self {
            queue: ArrayQueue::new(capacity),
            queued: (0..capacity).map(|_| AtomicBool::new(false)).collect(),
            coalesced: AtomicU64::new(0),
        }
    }

    /// Marks a pair dirty. False if it was already waiting or out of range.
    #[inline]
    pub fn touch(&self, pair: PairIndex) -> bool {
        let Some(flag) = self.queued.get(pair.index()) else {
            return false;
        };
        if flag.swap(true, Ordering::AcqRel) {
            self.coalesced.fetch_add(1, Ordering::Relaxed);
            return false;
        }
        if self.queue.push(pair).is_err() {
            flag.store(false, Ordering::Release);
            return false;
        }
        true
    }

    /// Takes every queued pair. A touch racing with the drain is either in this
    /// batch or queued for the next one.
    pub fn drain(&self) -> Vec<PairIndex> {
        let mut pairs = Vec::with_capacity(self.queue.len());
        while let Some(pair) = self.queue.pop() {
            self.queued[pair.index()].store(false, Ordering::Release);
            pairs.push(pair);
        }
        pairs
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.queue.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    /// Touches absorbed by an already-queued pair.
    #[inline]
    pub fn coalesced(&self) -> u64 {
        self.coalesced.load(Ordering::Relaxed)
    }
}

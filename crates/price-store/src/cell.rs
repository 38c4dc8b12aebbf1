use crate::types::{Liquidity, Price, PriceData, WriteOutcome};
use std::hint;
use std::sync::atomic::{fence, AtomicU64, Ordering};

const FLAG_PRESENT: u64 = 1;

/// Spins before a contended writer starts yielding the thread.
const WRITER_SPIN_LIMIT: u32 = 64;

/// What a single cell load produced.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum CellLoad {
    Value { data: PriceData, version: u64 },
    Empty,
    Torn,
}

/// Cache-aligned seqlock cell holding one (pair, venue) quote.
///
/// `seq` is the fencing word: zero means never written, odd means a writer owns
/// the cell, and `seq / 2` is the number of completed writes. Every payload word
/// is an atomic so a racing reader can only ever see a torn *copy*, which the
/// sequence re-check then rejects.
#[derive(Debug)]
#[repr(C, align(64))]
pub struct PriceCell {
    seq: AtomicU64,
    price_hi: AtomicU64,
    price_lo: AtomicU64,
    reserve_base_hi: AtomicU64,
    reserve_base_lo: AtomicU64,
    reserve_quote_hi: AtomicU64,
    reserve_quote_lo: AtomicU64,
    observed_at_ns: AtomicU64,
    venue_sequence: AtomicU64,
    flags: AtomicU64,
}

impl PriceCell {
    pub const fn new() -> Self {
        Self {
            seq: AtomicU64::new(0),
            price_hi: AtomicU64::new(0),
            price_lo: AtomicU64::new(0),
            reserve_base_hi: AtomicU64::new(0),
            reserve_base_lo: AtomicU64::new(0),
            reserve_quote_hi: AtomicU64::new(0),
            reserve_quote_lo: AtomicU64::new(0),
            observed_at_ns: AtomicU64::new(0),
            venue_sequence: AtomicU64::new(0),
            flags: AtomicU64::new(0),
        }
    }

    /// Completed writes so far.
    #[inline]
    pub fn version(&self) -> u64 {
        self.seq.load(Ordering::Acquire) / 2
    }

    /// Publishes `data` unless the cell already holds a newer venue sequence.
    pub(crate) fn store(&self, data: &PriceData) -> WriteOutcome {
        let seq = self.begin_write();

        let present = self.flags.load(Ordering::Relaxed) & FLAG_PRESENT != 0;
        let stored_sequence = self.venue_sequence.load(Ordering::Relaxed);
        if present && data.venue_sequence != 0 && data.venue_sequence <= stored_sequence {
            // Payload untouched, so restoring the old even value is invisible to readers.
            self.seq.store(seq, Ordering::Release);
            return WriteOutcome::Superseded { stored_sequence };
        }

        let (price_hi, price_lo) = data.price.to_words();
        let (base_hi, base_lo) = data.reserve_base.to_words();
        let (quote_hi, quote_lo) = data.reserve_quote.to_words();

        self.price_hi.store(price_hi, Ordering::Relaxed);
        self.price_lo.store(price_lo, Ordering::Relaxed);
        self.reserve_base_hi.store(base_hi, Ordering::Relaxed);
        self.reserve_base_lo.store(base_lo, Ordering::Relaxed);
        self.reserve_quote_hi.store(quote_hi, Ordering::Relaxed);
        self.reserve_quote_lo.store(quote_lo, Ordering::Relaxed);
        self.observed_at_ns.store(data.observed_at_ns, Ordering::Relaxed);
        self.venue_sequence.store(data.venue_sequence, Ordering::Relaxed);
        self.flags.store(FLAG_PRESENT, Ordering::Relaxed);

        let next = seq + 2;
        self.seq.store(next, Ordering::Release);
        WriteOutcome::Written { version: next / 2 }
    }

    /// Marks the cell empty. The version still advances.
    pub(crate) fn clear(&self) -> bool {
        let seq = self.begin_write();
        let was_present = self.flags.swap(0, Ordering::Relaxed) & FLAG_PRESENT != 0;
        self.seq.store(seq + 2, Ordering::Release);
        was_present
    }

    /// Clears only if no write landed since `version` was read.
    pub(crate) fn clear_at(&self, version: u64) -> bool {
        let seq = self.begin_write();
        if seq / 2 != version {
            self.seq.store(seq, Ordering::Release);
            return false;
        }
        self.flags.store(0, Ordering::Relaxed);
        self.seq.store(seq + 2, Ordering::Release);
        true
    }

    /// Reads the payload, retrying once if a writer interleaves.
    pub(crate) fn load(&self) -> CellLoad {
        for _ in 0..2 {
            let before = self.seq.load(Ordering::Acquire);
            if before == 0 {
                return CellLoad::Empty;
            }
            if before & 1 == 1 {
                hint::spin_loop();
                continue;
            }

            let flags = self.flags.load(Ordering::Relaxed);
            let price = Price::from_words(
                self.price_hi.load(Ordering::Relaxed),
                self.price_lo.load(Ordering::Relaxed),
            );
            let reserve_base = Liquidity::from_words(
                self.reserve_base_hi.load(Ordering::Relaxed),
                self.reserve_base_lo.load(Ordering::Relaxed),
            );
            let reserve_quote = Liquidity::from_words(
                self.reserve_quote_hi.load(Ordering::Relaxed),
                self.reserve_quote_lo.load(Ordering::Relaxed),
            );
            let observed_at_ns = self.observed_at_ns.load(Ordering::Relaxed);
            let venue_sequence = self.venue_sequence.load(Ordering::Relaxed);

            fence(Ordering::Acquire);
            let after = self.seq.load(Ordering::Relaxed);
            if before != after {
                hint::spin_loop();
                continue;
            }

            if flags & FLAG_PRESENT == 0 {
                return CellLoad::Empty;
            }
            return CellLoad::Value {
                data: PriceData {
                    price,
                    reserve_base,
                    reserve_quote,
                    observed_at_ns,
                    venue_sequence,
                },
                version: before / 2,
            };
        }
        CellLoad::Torn
    }

    /// Claims the cell by moving `seq` from even to odd. Returns the even value.
    #[inline]
    fn begin_write(&self) -> u64 {
        let mut spins = 0u32;
        loop {
            let seq = self.seq.load(Ordering::Relaxed);
            if seq & 1 == 0
                && self
                    .seq
                    .compare_exchange_weak(seq, seq + 1, Ordering::Acquire, Ordering::Relaxed)
                    .is_ok()
            {
                // Payload stores must not become visible before the odd marker.
                fence(Ordering::Release);
                return seq;
            }

            spins += 1;
            if spins < WRITER_SPIN_LIMIT {
                hint::spin_loop();
            } else {
                spins = 0;
                std::thread::yield_now();
            }
        }
    }
}

impl Default for PriceCell {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Barrier};
    use std::thread;

    fn data(price: f64, sequence: u64) -> PriceData {
        PriceData::new(Price::new(price), Liquidity::new(price * 10.0), Liquidity::new(price * 20.0), sequence)
            .with_sequence(sequence)
    }

    #[test]
    fn test_cell_is_cache_aligned() {
        assert_eq!(std::mem::align_of::<PriceCell>(), 64);
        assert_eq!(std::mem::size_of::<PriceCell>() % 64, 0);
    }

    #[test]
    fn test_new_cell_is_empty() {
        let cell = PriceCell::new();
        assert_eq!(cell.load(), CellLoad::Empty);
        assert_eq!(cell.version(), 0);
    }

    #[test]
    fn test_store_then_load() {
        let cell = PriceCell::new();
        let written = data(2000.0, 1);

        assert_eq!(cell.store(&written), WriteOutcome::Written { version: 1 });
        assert_eq!(cell.load(), CellLoad::Value { data: written, version: 1 });
    }

    #[test]
    fn test_version_only_increments() {
        let cell = PriceCell::new();
        let mut last = 0;
        for sequence in 1..=10 {
            cell.store(&data(sequence as f64, sequence));
            let version = cell.version();
            assert!(version > last);
            last = version;
        }
        cell.clear();
        assert!(cell.version() > last);
    }

    #[test]
    fn test_out_of_order_sequence_is_superseded() {
        let cell = PriceCell::new();
        cell.store(&data(10.0, 5));

        let outcome = cell.store(&data(11.0, 4));
        assert_eq!(outcome, WriteOutcome::Superseded { stored_sequence: 5 });
        assert_eq!(cell.version(), 1);

        match cell.load() {
            CellLoad::Value { data, .. } => assert_eq!(data.price, Price::new(10.0)),
            other => panic!("unexpected load: {:?}", other),
        }
    }

    #[test]
    fn test_unsequenced_writes_always_apply() {
        let cell = PriceCell::new();
        cell.store(&data(10.0, 5));
        let unsequenced = data(12.0, 0);
        assert!(cell.store(&unsequenced).is_written());
    }

    #[test]
    fn test_clear_hides_payload() {
        let cell = PriceCell::new();
        cell.store(&data(10.0, 5));
        assert!(cell.clear());
        assert_eq!(cell.load(), CellLoad::Empty);

        // After a clear an older sequence is accepted again.
        assert!(cell.store(&data(9.0, 3)).is_written());
    }

    #[test]
    fn test_concurrent_writers_never_tear() {
        let cell = Arc::new(PriceCell::new());
        let writers = 4;
        let readers = 4;
        let iterations = 20_000u64;
        let barrier = Arc::new(Barrier::new(writers + readers));

        let mut handles = Vec::new();
        for writer in 0..writers as u64 {
            let cell = Arc::clone(&cell);
            let barrier = Arc::clone(&barrier);
            handles.push(thread::spawn(move || {
                barrier.wait();
                for i in 0..iterations {
                    // Every field derives from the same value so a mixture is detectable.
                    let value = (writer * iterations + i + 1) as f64;
                    cell.store(&PriceData::new(
                        Price::new(value),
                        Liquidity::new(value * 10.0),
                        Liquidity::new(value * 20.0),
                        value as u64,
                    ));
                }
            }));
        }

        let mut reader_handles = Vec::new();
        for _ in 0..readers {
            let cell = Arc::clone(&cell);
            let barrier = Arc::clone(&barrier);
            reader_handles.push(thread::spawn(move || {
                barrier.wait();
                let mut consistent = 0u64;
                for _ in 0..iterations {
                    if let CellLoad::Value { data, .. } = cell.load() {
                        let value = data.price.to_f64();
                        assert_eq!(data.reserve_base.to_f64(), value * 10.0);
                        assert_eq!(data.reserve_quote.to_f64(), value * 20.0);
                        assert_eq!(data.observed_at_ns, value as u64);
                        consistent += 1;
                    }
                }
                consistent
            }));
        }

        for handle in handles {
            handle.join().unwrap();
        }
        for handle in reader_handles {
            handle.join().unwrap();
        }

        assert_eq!(cell.version(), writers as u64 * iterations);
    }
}

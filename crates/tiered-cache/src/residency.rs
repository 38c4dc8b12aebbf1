use parking_lot::Mutex;
use price_store::{PairIndex, VenueIndex};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};

type Coordinates = (PairIndex, VenueIndex);

const NOT_RESIDENT: u32 = 0;

#[derive(Debug, Default)]
struct CellFlags {
    /// Ring slot + 1, or `NOT_RESIDENT`.
    slot: AtomicU32,
    referenced: AtomicBool,
}

#[derive(Debug, Default)]
struct ClockRing {
    slots: Vec<Option<u32>>,
    free: Vec<usize>,
    hand: usize,
}

/// Second-chance (CLOCK) residency over the cells held in L1.
///
/// Touching a resident cell is one atomic store on its reference bit.
/// Admission, removal and victim selection share a ring lock; the hand
/// clears reference bits as it passes, so finding a victim costs amortised
/// constant time however large L1 is.
#[derive(Debug)]
pub struct ResidencySet {
    cells: Box<[CellFlags]>,
    venues: usize,
    ring: Mutex<ClockRing>,
    len: AtomicUsize,
    capacity: usize,
}

impl ResidencySet {
    pub fn new(capacity: usize, max_pairs: u32, max_venues: u32) -> Self {
        let cells = max_pairs as usize * max_venues as usize;
        let capacity = capacity.min(cells);
        Self {
            cells: (0..cells).map(|_| CellFlags::default()).collect(),
            venues: max_venues as usize,
            ring: Mutex::new(ClockRing {
                slots: Vec::with_capacity(capacity),
                ..ClockRing::default()
            }),
            len: AtomicUsize::new(0),
            capacity,
        }
    }

    /// Sets the reference bit; false if the cell is not resident.
    #[inline]
    pub fn touch(&self, pair: PairIndex, venue: VenueIndex) -> bool {
        match self.flags(pair, venue) {
            Some(flags) if flags.slot.load(Ordering::SeqCst) != NOT_RESIDENT => {
                flags.referenced.store(true, Ordering::Relaxed);
                true
            }
            _ => false,
        }
    }

    /// Marks a cell resident (or references it again). True if it was newly admitted.
    pub fn admit(&self, pair: PairIndex, venue: VenueIndex) -> bool {
        let Some(cell) = self.cell_index(pair, venue) else {
            return false;
        };
        let flags = &self.cells[cell as usize];
        let mut ring = self.ring.lock();
        flags.referenced.store(true, Ordering::Relaxed);
        if flags.slot.load(Ordering::SeqCst) != NOT_RESIDENT {
            return false;
        }

        let slot = match ring.free.pop() {
            Some(slot) => {
                ring.slots[slot] = Some(cell);
                slot
            }
            None => {
                ring.slots.push(Some(cell));
                ring.slots.len() - 1
            }
        };
        flags.slot.store(slot as u32 + 1, Ordering::SeqCst);
        self.len.fetch_add(1, Ordering::Relaxed);
        true
    }

    pub fn remove(&self, pair: PairIndex, venue: VenueIndex) -> bool {
        let Some(flags) = self.flags(pair, venue) else {
            return false;
        };
        let mut ring = self.ring.lock();
        let slot = flags.slot.swap(NOT_RESIDENT, Ordering::SeqCst);
        if slot == NOT_RESIDENT {
            return false;
        }
        let slot = (slot - 1) as usize;
        ring.slots[slot] = None;
        ring.free.push(slot);
        self.len.fetch_sub(1, Ordering::Relaxed);
        true
    }

    #[inline]
    pub fn contains(&self, pair: PairIndex, venue: VenueIndex) -> bool {
        self.flags(pair, venue)
            .map(|flags| flags.slot.load(Ordering::SeqCst) != NOT_RESIDENT)
            .unwrap_or(false)
    }

    /// First resident cell under the hand without its reference bit, other
    /// than `keep`. Referenced cells it passes lose their bit.
    pub fn victim(&self, keep: Option<Coordinates>) -> Option<Coordinates> {
        let keep = keep.and_then(|(pair, venue)| self.cell_index(pair, venue));
        let mut ring = self.ring.lock();
        let len = ring.slots.len();

        // The first lap may only clear bits; the second must find one.
        for _ in 0..len.saturating_mul(2) {
            let position = ring.hand;
            ring.hand = (position + 1) % len;
            let Some(cell) = ring.slots[position] else {
                continue;
            };
            if Some(cell) == keep {
                continue;
            }
            if self.cells[cell as usize].referenced.swap(false, Ordering::Relaxed) {
                continue;
            }
            return Some(self.coordinates(cell));
        }
        None
    }

    #[inline]
    pub fn is_full(&self) -> bool {
        self.len() >= self.capacity
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.len.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    #[inline]
    fn cell_index(&self, pair: PairIndex, venue: VenueIndex) -> Option<u32> {
        let cell = pair.index() * self.venues + venue.index();
        (venue.index() < self.venues && cell < self.cells.len()).then_some(cell as u32)
    }

    #[inline]
    fn flags(&self, pair: PairIndex, venue: VenueIndex) -> Option<&CellFlags> {
        self.cell_index(pair, venue).map(|cell| &self.cells[cell as usize])
    }

    #[inline]
    fn coordinates(&self, cell: u32) -> Coordinates {
        let cell = cell as usize;
        (PairIndex((cell / self.venues) as u32), VenueIndex((cell % self.venues) as u32))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(pair: u32) -> (PairIndex, VenueIndex) {
        (PairIndex(pair), VenueIndex(0))
    }

    fn admit_all(set: &ResidencySet, pairs: std::ops::Range<u32>) {
        for pair in pairs {
            let (p, v) = key(pair);
            assert!(set.admit(p, v));
        }
    }

    #[test]
    fn test_referenced_cell_gets_second_chance() {
        let set = ResidencySet::new(3, 8, 2);
        admit_all(&set, 0..3);
        assert!(set.is_full());

        // Every bit is set, so one lap clears them and 0 goes first.
        assert_eq!(set.victim(None), Some(key(0)));
        set.remove(PairIndex(0), VenueIndex(0));

        // The hand now sits on 1; touching it sends the hand on to 2.
        assert!(set.touch(PairIndex(1), VenueIndex(0)));
        assert_eq!(set.victim(None), Some(key(2)));
        assert_eq!(set.victim(Some(key(2))), Some(key(1)));
    }

    #[test]
    fn test_admit_existing_references_again() {
        let set = ResidencySet::new(2, 8, 2);
        admit_all(&set, 0..2);
        assert_eq!(set.victim(None), Some(key(0)));

        // 1 lost its bit on that lap; re-admitting 0 sets it again.
        assert!(!set.admit(PairIndex(0), VenueIndex(0)));
        assert_eq!(set.victim(None), Some(key(1)));
        assert_eq!(set.len(), 2);
    }

    #[test]
    fn test_freed_slots_are_reused() {
        let set = ResidencySet::new(4, 8, 2);
        admit_all(&set, 0..4);
        set.remove(PairIndex(1), VenueIndex(0));
        set.remove(PairIndex(2), VenueIndex(0));
        admit_all(&set, 4..6);

        assert_eq!(set.len(), 4);
        assert_eq!(set.ring.lock().slots.len(), 4);
        assert!(set.contains(PairIndex(5), VenueIndex(0)));
        assert!(!set.contains(PairIndex(2), VenueIndex(0)));
    }

    #[test]
    fn test_touch_unknown_and_remove() {
        let set = ResidencySet::new(2, 8, 2);
        assert!(!set.touch(PairIndex(4), VenueIndex(1)));
        set.admit(PairIndex(4), VenueIndex(1));
        assert!(set.contains(PairIndex(4), VenueIndex(1)));
        assert_eq!(set.victim(Some((PairIndex(4), VenueIndex(1)))), None);
        assert!(set.remove(PairIndex(4), VenueIndex(1)));
        assert!(!set.remove(PairIndex(4), VenueIndex(1)));
        assert!(set.is_empty());
        assert_eq!(set.victim(None), None);
    }

    #[test]
    fn test_out_of_range_cells_are_never_resident() {
        let set = ResidencySet::new(2, 2, 2);
        assert!(!set.admit(PairIndex(0), VenueIndex(2)));
        assert!(!set.admit(PairIndex(2), VenueIndex(0)));
        assert!(set.is_empty());
    }
}

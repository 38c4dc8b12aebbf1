use crate::types::{PairIndex, VenueIndex};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, OnceLock};
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum KeyKind {
    Pair,
    Venue,
    Token,
}

impl fmt::Display for KeyKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            KeyKind::Pair => write!(f, "pair"),
            KeyKind::Venue => write!(f, "venue"),
            KeyKind::Token => write!(f, "token"),
        }
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum IndexError {
    #[error("Capacity exceeded for {kind} keys (capacity {capacity}) while assigning '{key}'")]
    CapacityExceeded { kind: KeyKind, capacity: u32, key: String },
}

/// Append-only string -> dense id registry.
///
/// Ids are handed out by a single atomic counter inside the map entry for the
/// key, so concurrent first users of one key all observe the same id. Ids are
/// never recycled.
#[derive(Debug)]
pub struct KeyInterner {
    kind: KeyKind,
    ids: DashMap<Arc<str>, u32>,
    keys: Box<[OnceLock<Arc<str>>]>,
    next: AtomicU32,
    capacity: u32,
}

impl KeyInterner {
    pub fn new(kind: KeyKind, capacity: u32) -> Self {
        Self {
            kind,
            ids: DashMap::with_capacity(capacity as usize),
            keys: (0..capacity).map(|_| OnceLock::new()).collect(),
            next: AtomicU32::new(0),
            capacity,
        }
    }

    pub fn get_or_intern(&self, key: &str) -> Result<u32, IndexError> {
        if let Some(id) = self.ids.get(key) {
            return Ok(*id);
        }

        let key: Arc<str> = Arc::from(key);
        match self.ids.entry(Arc::clone(&key)) {
            Entry::Occupied(entry) => Ok(*entry.get()),
            Entry::Vacant(entry) => {
                let capacity = self.capacity;
                let id = self
                    .next
                    .fetch_update(Ordering::AcqRel, Ordering::Acquire, |next| {
                        (next < capacity).then_some(next + 1)
                    })
                    .map_err(|_| {
                        tracing::warn!(kind = %self.kind, capacity, key = %key, "Index capacity exceeded");
                        IndexError::CapacityExceeded {
                            kind: self.kind,
                            capacity,
                            key: key.to_string(),
                        }
                    })?;
                // Reverse slot is filled before the id becomes visible in the map.
                let _ = self.keys[id as usize].set(Arc::clone(&key));
                entry.insert(id);
                Ok(id)
            }
        }
    }

    #[inline]
    pub fn lookup(&self, key: &str) -> Option<u32> {
        self.ids.get(key).map(|id| *id)
    }

    #[inline]
    pub fn key(&self, id: u32) -> Option<Arc<str>> {
        self.keys.get(id as usize).and_then(|slot| slot.get().cloned())
    }

    #[inline]
    pub fn len(&self) -> u32 {
        self.next.load(Ordering::Acquire).min(self.capacity)
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    #[inline]
    pub fn capacity(&self) -> u32 {
        self.capacity
    }

    #[inline]
    pub fn kind(&self) -> KeyKind {
        self.kind
    }
}

/// Translates (pair key, venue key) into store coordinates.
#[derive(Debug)]
pub struct IndexMapper {
    pairs: KeyInterner,
    venues: KeyInterner,
    assigned: Box<[AtomicBool]>,
    max_venues: u32,
}

impl IndexMapper {
    pub fn new(max_pairs: u32, max_venues: u32) -> Self {
        let combinations = max_pairs as usize * max_venues as usize;
        Self {
            pairs: KeyInterner::new(KeyKind::Pair, max_pairs),
            venues: KeyInterner::new(KeyKind::Venue, max_venues),
            assigned: (0..combinations).map(|_| AtomicBool::new(false)).collect(),
            max_venues,
        }
    }

    pub fn get_or_assign(&self, pair_key: &str, venue_key: &str) -> Result<(PairIndex, VenueIndex), IndexError> {
        let pair = PairIndex(self.pairs.get_or_intern(pair_key)?);
        let venue = VenueIndex(self.venues.get_or_intern(venue_key)?);
        if !self.assigned[self.offset(pair, venue)].swap(true, Ordering::AcqRel) {
            tracing::debug!(pair_key, venue_key, %pair, %venue, "Assigned cell coordinates");
        }
        Ok((pair, venue))
    }

    /// Coordinates of a previously assigned (pair, venue) combination.
    pub fn lookup(&self, pair_key: &str, venue_key: &str) -> Option<(PairIndex, VenueIndex)> {
        let pair = PairIndex(self.pairs.lookup(pair_key)?);
        let venue = VenueIndex(self.venues.lookup(venue_key)?);
        self.is_assigned(pair, venue).then_some((pair, venue))
    }

    #[inline]
    pub fn pair_index(&self, pair_key: &str) -> Option<PairIndex> {
        self.pairs.lookup(pair_key).map(PairIndex)
    }

    #[inline]
    pub fn venue_index(&self, venue_key: &str) -> Option<VenueIndex> {
        self.venues.lookup(venue_key).map(VenueIndex)
    }

    #[inline]
    pub fn pair_key(&self, pair: PairIndex) -> Option<Arc<str>> {
        self.pairs.key(pair.0)
    }

    #[inline]
    pub fn venue_key(&self, venue: VenueIndex) -> Option<Arc<str>> {
        self.venues.key(venue.0)
    }

    #[inline]
    pub fn is_assigned(&self, pair: PairIndex, venue: VenueIndex) -> bool {
        if pair.0 >= self.pairs.capacity() || venue.0 >= self.max_venues {
            return false;
        }
        self.assigned[self.offset(pair, venue)].load(Ordering::Acquire)
    }

    /// Venues that have ever been assigned alongside `pair`.
    pub fn venues_for(&self, pair: PairIndex) -> Vec<VenueIndex> {
        (0..self.venues.len())
            .map(VenueIndex)
            .filter(|&venue| self.is_assigned(pair, venue))
            .collect()
    }

    #[inline]
    pub fn pair_count(&self) -> u32 {
        self.pairs.len()
    }

    #[inline]
    pub fn venue_count(&self) -> u32 {
        self.venues.len()
    }

    #[inline]
    pub fn max_pairs(&self) -> u32 {
        self.pairs.capacity()
    }

    #[inline]
    pub fn max_venues(&self) -> u32 {
        self.max_venues
    }

    #[inline]
    fn offset(&self, pair: PairIndex, venue: VenueIndex) -> usize {
        pair.index() * self.max_venues as usize + venue.index()
    }
}

use crate::cell::{CellLoad, PriceCell};
use crate::types::{CellRead, CellSnapshot, PairIndex, PriceData, VenueIndex, WriteOutcome};
use metrics::counter;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum StoreError {
    #[error("Invalid store capacity: {max_pairs} pairs x {max_venues} venues")]
    InvalidCapacity { max_pairs: u32, max_venues: u32 },
    #[error("Cell index out of range: pair {pair} venue {venue}")]
    IndexOutOfRange { pair: PairIndex, venue: VenueIndex },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    pub max_pairs: u32,
    pub max_venues: u32,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            max_pairs: 4096,
            max_venues: 32,
        }
    }
}

/// Read seam between the detector and whatever holds live cells.
pub trait CellReader: Send + Sync {
    /// Out-of-range coordinates read as `NotFound`.
    fn read_cell(&self, pair: PairIndex, venue: VenueIndex) -> CellRead;

    fn pair_capacity(&self) -> u32;

    fn venue_capacity(&self) -> u32;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StoreStats {
    pub capacity: usize,
    pub writes: u64,
    pub superseded_writes: u64,
    pub stale_reads: u64,
}

/// Fixed-capacity table of seqlock cells addressed by (pair, venue).
///
/// Allocated once; shared between ingestion and detection threads through
/// `Arc<PriceStore>`.
#[derive(Debug)]
pub struct PriceStore {
    cells: Box<[PriceCell]>,
    max_pairs: u32,
    max_venues: u32,
    writes: AtomicU64,
    superseded_writes: AtomicU64,
    stale_reads: AtomicU64,
}

impl PriceStore {
    pub fn new(max_pairs: u32, max_venues: u32) -> Result<Self, StoreError> {
        let capacity = (max_pairs as usize)
            .checked_mul(max_venues as usize)
            .filter(|&capacity| capacity > 0 && capacity <= u32::MAX as usize)
            .ok_or(StoreError::InvalidCapacity { max_pairs, max_venues })?;

        let cells: Vec<PriceCell> = (0..capacity).map(|_| PriceCell::new()).collect();

        tracing::info!(max_pairs, max_venues, capacity, "Price store allocated");

        Ok(Self {
            cells: cells.into_boxed_slice(),
            max_pairs,
            max_venues,
            writes: AtomicU64::new(0),
            superseded_writes: AtomicU64::new(0),
            stale_reads: AtomicU64::new(0),
        })
    }

    #[inline]
    pub fn with_config(config: StoreConfig) -> Result<Self, StoreError> {
        Self::new(config.max_pairs, config.max_venues)
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.cells.len()
    }

    #[inline]
    pub fn max_pairs(&self) -> u32 {
        self.max_pairs
    }

    #[inline]
    pub fn max_venues(&self) -> u32 {
        self.max_venues
    }

    /// Publishes a quote. Only fails for coordinates outside the fixed capacity.
    #[inline]
    pub fn write(&self, pair: PairIndex, venue: VenueIndex, data: &PriceData) -> Result<WriteOutcome, StoreError> {
        let cell = self.cell(pair, venue)?;
        let outcome = cell.store(data);
        match outcome {
            WriteOutcome::Written { .. } => {
                self.writes.fetch_add(1, Ordering::Relaxed);
                counter!("store_writes_total").increment(1);
            }
            WriteOutcome::Superseded { stored_sequence } => {
                self.superseded_writes.fetch_add(1, Ordering::Relaxed);
                tracing::trace!(%pair, %venue, stored_sequence, incoming = data.venue_sequence, "Dropped out-of-order write");
            }
        }
        Ok(outcome)
    }

    #[inline]
    pub fn read(&self, pair: PairIndex, venue: VenueIndex) -> Result<CellRead, StoreError> {
        let cell = self.cell(pair, venue)?;
        Ok(self.snapshot(cell, pair, venue))
    }

    /// Vectorised read; out-of-range coordinates come back as `NotFound`.
    pub fn read_batch(&self, coordinates: &[(PairIndex, VenueIndex)]) -> Vec<CellRead> {
        coordinates
            .iter()
            .map(|&(pair, venue)| match self.cell(pair, venue) {
                Ok(cell) => self.snapshot(cell, pair, venue),
                Err(_) => CellRead::NotFound,
            })
            .collect()
    }

    /// Every venue currently holding a value for `pair`.
    pub fn read_pair(&self, pair: PairIndex) -> Vec<CellSnapshot> {
        if pair.0 >= self.max_pairs {
            return Vec::new();
        }
        (0..self.max_venues)
            .filter_map(|venue| {
                let venue = VenueIndex(venue);
                let cell = &self.cells[self.offset(pair, venue)];
                self.snapshot(cell, pair, venue).value()
            })
            .collect()
    }

    /// Empties a cell without reusing its coordinates.
    pub fn clear(&self, pair: PairIndex, venue: VenueIndex) -> Result<bool, StoreError> {
        Ok(self.cell(pair, venue)?.clear())
    }

    /// Empties a cell only if it still holds `version`; false if it moved on.
    pub fn clear_at(&self, pair: PairIndex, venue: VenueIndex, version: u64) -> Result<bool, StoreError> {
        Ok(self.cell(pair, venue)?.clear_at(version))
    }

    #[inline]
    pub fn version(&self, pair: PairIndex, venue: VenueIndex) -> Result<u64, StoreError> {
        Ok(self.cell(pair, venue)?.version())
    }

    pub fn stats(&self) -> StoreStats {
        StoreStats {
            capacity: self.capacity(),
            writes: self.writes.load(Ordering::Relaxed),
            superseded_writes: self.superseded_writes.load(Ordering::Relaxed),
            stale_reads: self.stale_reads.load(Ordering::Relaxed),
        }
    }

    #[inline]
    fn offset(&self, pair: PairIndex, venue: VenueIndex) -> usize {
        pair.index() * self.max_venues as usize + venue.index()
    }

    #[inline]
    fn cell(&self, pair: PairIndex, venue: VenueIndex) -> Result<&PriceCell, StoreError> {
        if pair.0 >= self.max_pairs || venue.0 >= self.max_venues {
            return Err(StoreError::IndexOutOfRange { pair, venue });
        }
        Ok(&self.cells[self.offset(pair, venue)])
    }

    #[inline]
    fn snapshot(&self, cell: &PriceCell, pair: PairIndex, venue: VenueIndex) -> CellRead {
        match cell.load() {
            CellLoad::Value { data, version } => CellRead::Value(CellSnapshot {
                pair,
                venue,
                data,
                version,
            }),
            CellLoad::Empty => CellRead::NotFound,
            CellLoad::Torn => {
                self.stale_reads.fetch_add(1, Ordering::Relaxed);
                counter!("store_stale_reads_total").increment(1);
                CellRead::Stale
            }
        }
    }
}

impl CellReader for PriceStore {
    #[inline]
    fn read_cell(&self, pair: PairIndex, venue: VenueIndex) -> CellRead {
        self.read(pair, venue).unwrap_or(CellRead::NotFound)
    }

    #[inline]
    fn pair_capacity(&self) -> u32 {
        self.max_pairs
    }

    #[inline]
    fn venue_capacity(&self) -> u32 {
        self.max_venues
    }
}

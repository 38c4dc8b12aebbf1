pub mod cell;
pub mod index_mapper;
pub mod store;
pub mod types;

pub use cell::PriceCell;
pub use index_mapper::{IndexError, IndexMapper, KeyInterner, KeyKind};
pub use store::{CellReader, PriceStore, StoreConfig, StoreError, StoreStats};
pub use types::*;

pub type Result<T> = std::result::Result<T, StoreError>;

/// Current wall-clock time in nanoseconds since the Unix epoch.
#[inline]
pub fn now_ns() -> u64 {
    chrono::Utc::now()
        .timestamp_nanos_opt()
        .map_or(0, |nanos| nanos.max(0) as u64)
}

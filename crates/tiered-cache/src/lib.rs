pub mod cache;
pub mod entry;
pub mod residency;
pub mod tier;
pub mod write_behind;

pub use cache::{CacheConfig, CacheError, CacheStats, HierarchicalCache, L1EvictionPolicy, SetOutcome};
pub use entry::{CacheEntry, CacheKey, CacheLookup, Tier, TierError};
pub use residency::ResidencySet;
pub use tier::{ColdStore, KvStore, MemoryColdStore, MemoryKvStore, TierCallStats};
pub use write_behind::{FlushReport, RetryPolicy, WriteBehind};

pub type Result<T> = std::result::Result<T, CacheError>;

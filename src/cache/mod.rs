//! In-process caching for read-mostly reference data.

mod bounded_cache;

pub use bounded_cache::{BoundedCache, CacheConfig, CacheStats, EstimateSize};

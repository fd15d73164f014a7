pub mod response_cache;

pub use response_cache::{
    CacheEntryKind, CacheError, CacheKey, CacheLimits, CacheStats, ResponseCache, SHARD_COUNT,
};

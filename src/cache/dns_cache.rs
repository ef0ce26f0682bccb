//! DNS cache trait and implementations.
//!
//! Answers are cached per query name and record type, so an `A` lookup never
//! serves a cached `AAAA` answer.

use std::future::Future;
use std::time::Duration;

use hickory_proto::op::Message;
use hickory_proto::rr::{Name, RecordType};
use moka::future::Cache;

/// Cache key: the queried name and record type.
pub type CacheKey = (Name, RecordType);

/// Trait for DNS response caching.
///
/// This trait abstracts the caching mechanism, allowing for different
/// implementations (production Moka cache, test mocks, etc.).
pub trait DnsCache: Send + Sync + Clone + 'static {
    /// Get a cached response for the given key.
    fn get(&self, key: &CacheKey) -> impl Future<Output = Option<Message>> + Send;

    /// Insert a response into the cache.
    fn insert(&self, key: CacheKey, message: Message) -> impl Future<Output = ()> + Send;

    /// Drop every cached entry.
    fn clear(&self);

    /// Returns the number of entries in the cache.
    fn entry_count(&self) -> u64;
}

/// Production cache implementation using Moka.
///
/// Entries expire after the configured TTL and the cache can be bounded.
#[derive(Clone)]
pub struct MokaCache {
    inner: Cache<CacheKey, Message>,
}

impl MokaCache {
    /// Create a new cache with the specified TTL.
    pub fn new(ttl: Duration) -> Self {
        let cache = Cache::builder().time_to_live(ttl).build();

        Self { inner: cache }
    }

    /// Create a new cache with TTL and maximum capacity.
    pub fn with_capacity(ttl: Duration, max_capacity: u64) -> Self {
        let cache = Cache::builder()
            .time_to_live(ttl)
            .max_capacity(max_capacity)
            .build();

        Self { inner: cache }
    }
}

impl DnsCache for MokaCache {
    async fn get(&self, key: &CacheKey) -> Option<Message> {
        self.inner.get(key).await
    }

    async fn insert(&self, key: CacheKey, message: Message) {
        self.inner.insert(key, message).await;
    }

    fn clear(&self) {
        self.inner.invalidate_all();
    }

    fn entry_count(&self) -> u64 {
        self.inner.entry_count()
    }
}

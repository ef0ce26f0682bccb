//! Caching of DNS answers.

mod dns_cache;

pub use dns_cache::{CacheKey, DnsCache, MokaCache};

#[cfg(test)]
pub use dns_cache::tests::MockCache;

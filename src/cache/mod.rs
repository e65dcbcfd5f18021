//! Cache-aside access with miss coalescing.
//!
//! [`CacheAside`] reads through a [`FastCache`] and falls back to a
//! caller-supplied origin fetch on a miss. Concurrent misses for the same key
//! are collapsed by [`SingleFlight`] into one fetch whose outcome every
//! waiter shares.
//!
//! # Fast caches
//!
//! | Implementation | Storage | Expiry |
//! |----------------|---------|--------|
//! | [`MemoryCache`] | in-process LRU | passive, on read |
//! | `RedisCache` (feature `redis`) | Redis `SET PX` | server side |
//!
//! Values cross the cache boundary as bytes. [`CacheAside`] stores typed
//! values as JSON.

mod accessor;
mod memory;
pub mod redis;
mod singleflight;

pub use accessor::CacheAside;
pub use memory::{Clock, ManualClock, MemoryCache, SystemClock};
pub use singleflight::{CancelToken, SingleFlight};

#[cfg(feature = "redis")]
pub use self::redis::RedisCache;

use crate::Result;
use std::sync::Arc;
use std::time::Duration;

/// A byte-oriented cache with per-entry TTL.
///
/// Implementations must be safe for concurrent use; the accessor adds no
/// locking around reads and writes.
pub trait FastCache: Send + Sync {
    /// Returns the value for `key`, or `None` when absent or expired.
    ///
    /// # Errors
    ///
    /// Returns an error if the cache cannot be reached. Callers treat it as
    /// a miss.
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>>;

    /// Stores `value` under `key` for `ttl`.
    ///
    /// # Errors
    ///
    /// Returns an error if the write fails.
    fn set(&self, key: &str, value: &[u8], ttl: Duration) -> Result<()>;

    /// Removes `key`, returning whether it was present.
    ///
    /// # Errors
    ///
    /// Returns an error if the cache cannot be reached.
    fn delete(&self, key: &str) -> Result<bool>;
}

impl<T: FastCache + ?Sized> FastCache for Arc<T> {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        (**self).get(key)
    }

    fn set(&self, key: &str, value: &[u8], ttl: Duration) -> Result<()> {
        (**self).set(key, value, ttl)
    }

    fn delete(&self, key: &str) -> Result<bool> {
        (**self).delete(key)
    }
}

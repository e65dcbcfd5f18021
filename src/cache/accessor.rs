//! Cache-aside accessor.

use super::FastCache;
use super::singleflight::{CancelToken, SingleFlight};
use crate::{Error, Result};
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::fmt::Display;
use std::sync::Arc;
use std::time::Duration;

fn fetch_failed(key: &str, cause: impl Display) -> Error {
    Error::FetchFailed {
        key: key.to_string(),
        cause: cause.to_string(),
    }
}

fn encode<T: Serialize>(key: &str, value: &T) -> Result<Vec<u8>> {
    serde_json::to_vec(value).map_err(|e| {
        Error::operation_failed("cache_encode", format!("key '{key}': {e}"))
    })
}

/// Reads `key`, treating backend errors as a miss.
fn probe<C: FastCache + ?Sized>(cache: &C, key: &str) -> Option<Vec<u8>> {
    match cache.get(key) {
        Ok(bytes) => bytes,
        Err(e) => {
            tracing::warn!(key, error = %e, "Fast cache read failed, treating as miss");
            None
        },
    }
}

/// Reads `key` and keeps the bytes only if they decode as `T`.
fn probe_decoded<C: FastCache + ?Sized, T: DeserializeOwned>(
    cache: &C,
    key: &str,
) -> Option<(Vec<u8>, T)> {
    let bytes = probe(cache, key)?;
    match serde_json::from_slice(&bytes) {
        Ok(value) => Some((bytes, value)),
        Err(e) => {
            tracing::warn!(key, error = %e, "Cached value does not decode, treating as miss");
            None
        },
    }
}

/// Writes `key`, logging instead of failing.
fn store<C: FastCache + ?Sized>(cache: &C, key: &str, bytes: &[u8], ttl: Duration) {
    if let Err(e) = cache.set(key, bytes, ttl) {
        tracing::warn!(key, error = %e, "Fast cache write failed, value served uncached");
    }
}

/// Fetches through the origin, writing the encoded value back on success.
fn fetch_and_store<C, T, E, F>(cache: &C, key: &str, ttl: Duration, fetch: F) -> Result<Vec<u8>>
where
    C: FastCache + ?Sized,
    T: Serialize,
    E: Display,
    F: FnOnce() -> std::result::Result<T, E>,
{
    let value = fetch().map_err(|e| {
        tracing::warn!(key, error = %e, "Origin fetch failed");
        fetch_failed(key, e)
    })?;
    let bytes = encode(key, &value)?;
    store(cache, key, &bytes, ttl);
    Ok(bytes)
}

/// Cache-aside reads over a [`FastCache`], with per-key miss coalescing.
///
/// A hit is served straight from the cache. On a miss, exactly one caller
/// per key runs the origin fetch; concurrent callers for the same key wait
/// and receive the same value or the same [`Error::FetchFailed`]. A
/// successful value is written back with the caller's TTL before waiters
/// are released. Failures are never cached.
pub struct CacheAside<C> {
    cache: Arc<C>,
    flights: SingleFlight<Vec<u8>>,
}

impl<C> std::fmt::Debug for CacheAside<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CacheAside")
            .field("flights", &self.flights)
            .finish_non_exhaustive()
    }
}

impl<C: FastCache> CacheAside<C> {
    /// Wraps `cache`.
    pub fn new(cache: C) -> Self {
        Self::from_shared(Arc::new(cache))
    }

    /// Wraps a cache shared with other users.
    pub fn from_shared(cache: Arc<C>) -> Self {
        Self {
            cache,
            flights: SingleFlight::new(),
        }
    }

    /// Returns the underlying cache.
    #[must_use]
    pub fn cache(&self) -> &C {
        &self.cache
    }

    /// Returns the number of keys with an origin fetch in progress.
    #[must_use]
    pub fn in_flight(&self) -> usize {
        self.flights.in_flight()
    }

    /// Returns the cached value for `key`, or fetches, stores and returns it.
    ///
    /// Values are stored as JSON. A cached value that fails to decode as `T`
    /// counts as a miss and is overwritten by the fetch.
    ///
    /// # Errors
    ///
    /// Returns [`Error::FetchFailed`] when `fetch` fails, or
    /// [`Error::OperationFailed`] when the value cannot be encoded.
    pub fn get_or_fetch<T, E, F>(&self, key: &str, ttl: Duration, fetch: F) -> Result<T>
    where
        T: Serialize + DeserializeOwned,
        E: Display,
        F: FnOnce() -> std::result::Result<T, E>,
    {
        if let Some((_, value)) = probe_decoded::<_, T>(&*self.cache, key) {
            metrics::counter!("cache_aside_requests_total", "outcome" => "hit").increment(1);
            return Ok(value);
        }
        metrics::counter!("cache_aside_requests_total", "outcome" => "miss").increment(1);

        let bytes = self.flights.run(key, || {
            // A previous flight may have filled the cache since our probe.
            if let Some((bytes, _)) = probe_decoded::<_, T>(&*self.cache, key) {
                return Ok(bytes);
            }
            fetch_and_store(&*self.cache, key, ttl, fetch)
        })?;
        decode(key, &bytes)
    }

    /// Byte-valued variant of [`get_or_fetch`](Self::get_or_fetch).
    ///
    /// # Errors
    ///
    /// Returns [`Error::FetchFailed`] when `fetch` fails.
    pub fn get_or_fetch_raw<E, F>(&self, key: &str, ttl: Duration, fetch: F) -> Result<Vec<u8>>
    where
        E: Display,
        F: FnOnce() -> std::result::Result<Vec<u8>, E>,
    {
        if let Some(bytes) = probe(&*self.cache, key) {
            metrics::counter!("cache_aside_requests_total", "outcome" => "hit").increment(1);
            return Ok(bytes);
        }
        metrics::counter!("cache_aside_requests_total", "outcome" => "miss").increment(1);

        self.flights.run(key, || {
            if let Some(bytes) = probe(&*self.cache, key) {
                return Ok(bytes);
            }
            let bytes = fetch().map_err(|e| fetch_failed(key, e))?;
            store(&*self.cache, key, &bytes, ttl);
            Ok(bytes)
        })
    }

    /// Fetches and stores `key` without reading the cache first.
    ///
    /// Still coalesced: a caller arriving while a fetch for `key` runs shares
    /// that fetch.
    ///
    /// # Errors
    ///
    /// Returns [`Error::FetchFailed`] when `fetch` fails.
    pub fn refresh<T, E, F>(&self, key: &str, ttl: Duration, fetch: F) -> Result<T>
    where
        T: Serialize + DeserializeOwned,
        E: Display,
        F: FnOnce() -> std::result::Result<T, E>,
    {
        metrics::counter!("cache_aside_requests_total", "outcome" => "refresh").increment(1);
        let bytes = self
            .flights
            .run(key, || fetch_and_store(&*self.cache, key, ttl, fetch))?;
        decode(key, &bytes)
    }

    /// Removes `key` from the cache.
    ///
    /// # Errors
    ///
    /// Returns the cache's error.
    pub fn invalidate(&self, key: &str) -> Result<bool> {
        self.cache.delete(key)
    }
}

impl<C: FastCache + 'static> CacheAside<C> {
    /// Cancellable variant of [`get_or_fetch`](Self::get_or_fetch).
    ///
    /// The fetch runs on a worker thread and receives a token that fires only
    /// if every caller waiting on it cancels. A caller whose own `token`
    /// fires gets [`Error::Cancelled`] while the fetch continues for the
    /// others and still fills the cache.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Cancelled`], [`Error::FetchFailed`] or
    /// [`Error::OperationFailed`].
    pub fn get_or_fetch_cancellable<T, E, F>(
        &self,
        key: &str,
        ttl: Duration,
        token: &CancelToken,
        fetch: F,
    ) -> Result<T>
    where
        T: Serialize + DeserializeOwned + 'static,
        E: Display + 'static,
        F: FnOnce(&CancelToken) -> std::result::Result<T, E> + Send + 'static,
    {
        if let Some((_, value)) = probe_decoded::<_, T>(&*self.cache, key) {
            metrics::counter!("cache_aside_requests_total", "outcome" => "hit").increment(1);
            return Ok(value);
        }
        if token.is_cancelled() {
            return Err(Error::Cancelled(key.to_string()));
        }
        metrics::counter!("cache_aside_requests_total", "outcome" => "miss").increment(1);

        let cache = Arc::clone(&self.cache);
        let owned_key = key.to_string();
        let bytes = self.flights.run_cancellable(key, token, move |flight| {
            if let Some((bytes, _)) = probe_decoded::<_, T>(&*cache, &owned_key) {
                return Ok(bytes);
            }
            fetch_and_store(&*cache, &owned_key, ttl, || fetch(flight))
        })?;
        decode(key, &bytes)
    }
}

fn decode<T: DeserializeOwned>(key: &str, bytes: &[u8]) -> Result<T> {
    serde_json::from_slice(bytes)
        .map_err(|e| Error::operation_failed("cache_decode", format!("key '{key}': {e}")))
}

//! Object URL derivation cache.
//!
//! Deriving a signed URL costs an HMAC chain per call, and callers tend to
//! ask for the same object many times in a burst. [`UrlCache`] memoizes
//! derived URLs through a [`CacheAside`] so concurrent misses derive once.
//!
//! # TTL rules
//!
//! | Expiry | Cached for |
//! |--------|------------|
//! | zero (public URL) | `public_ttl` (24 h) |
//! | greater than `safety_buffer` (5 min) | expiry minus buffer |
//! | at most `safety_buffer` | not cached, derived on every call |
//!
//! A cached signed URL therefore always has at least `safety_buffer` of
//! validity left when it is handed out.
//!
//! # Cache key
//!
//! The key covers kind, bucket, object key and version, but not the expiry:
//! two callers asking for the same object with different expiries share one
//! entry, and the entry's TTL comes from whichever derived it.

use crate::cache::{CacheAside, FastCache};
use crate::{Error, Result};
use sha2::{Digest, Sha256};
use std::time::Duration;

/// Margin between a cached URL's expiry and its signature's expiry.
pub const DEFAULT_SAFETY_BUFFER: Duration = Duration::from_secs(5 * 60);

/// How long a public URL stays cached.
pub const DEFAULT_PUBLIC_TTL: Duration = Duration::from_secs(24 * 3600);

/// Default kind tag for objects.
pub const OBJECT_KIND: &str = "object";

/// An object addressed by bucket and key.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ObjectRef {
    /// Namespace tag mixed into the cache key.
    pub kind: String,
    /// Bucket; may be empty when `key` carries it as its first segment.
    pub bucket: String,
    /// Object key within the bucket.
    pub key: String,
}

impl ObjectRef {
    /// Creates a reference of kind [`OBJECT_KIND`].
    pub fn new(bucket: impl Into<String>, key: impl Into<String>) -> Self {
        Self {
            kind: OBJECT_KIND.to_string(),
            bucket: bucket.into(),
            key: key.into(),
        }
    }

    /// Creates a reference from a combined `bucket/path/to/object` path.
    pub fn from_path(path: impl Into<String>) -> Self {
        Self::new(String::new(), path)
    }

    /// Sets the kind tag.
    #[must_use]
    pub fn with_kind(mut self, kind: impl Into<String>) -> Self {
        self.kind = kind.into();
        self
    }

    /// Returns the reference with the bucket split off a combined key.
    ///
    /// `("", "/photos/2024/cat.png")` becomes `("photos", "2024/cat.png")`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidInput`] when the key is empty or no bucket can
    /// be determined.
    pub fn normalized(&self) -> Result<Self> {
        let trimmed = self.key.trim_matches('/');
        if trimmed.is_empty() {
            return Err(Error::InvalidInput("object key is empty".to_string()));
        }
        if !self.bucket.is_empty() {
            return Ok(self.clone());
        }
        match trimmed.split_once('/') {
            Some((bucket, key)) if !bucket.is_empty() && !key.is_empty() => Ok(Self {
                kind: self.kind.clone(),
                bucket: bucket.to_string(),
                key: key.to_string(),
            }),
            _ => Err(Error::InvalidInput(format!(
                "no bucket given and '{}' has no bucket segment",
                self.key
            ))),
        }
    }
}

/// Options for one URL request.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UrlOptions {
    /// Signature validity; zero requests a public URL.
    pub expiry: Duration,
    /// Content version, appended as `v` and part of the cache key.
    pub version: Option<String>,
    /// Skip the cache read and derive afresh (the result is still stored).
    pub rebuild: bool,
}

impl UrlOptions {
    /// Public URL, no version, cached.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the signature validity.
    #[must_use]
    pub const fn with_expiry(mut self, expiry: Duration) -> Self {
        self.expiry = expiry;
        self
    }

    /// Sets the content version.
    #[must_use]
    pub fn with_version(mut self, version: impl Into<String>) -> Self {
        self.version = Some(version.into());
        self
    }

    /// Sets whether to bypass the cache read.
    #[must_use]
    pub const fn with_rebuild(mut self, rebuild: bool) -> Self {
        self.rebuild = rebuild;
        self
    }

    fn version(&self) -> Option<&str> {
        self.version.as_deref().filter(|v| !v.is_empty())
    }
}

/// Produces URLs for objects.
///
/// Implemented by [`ObjectStoreClient`](crate::backend::ObjectStoreClient).
pub trait UrlDeriver: Send + Sync {
    /// Returns a URL granting read access for `expiry`.
    ///
    /// # Errors
    ///
    /// Returns an error if the URL cannot be signed.
    fn signed_url(&self, object: &ObjectRef, expiry: Duration, version: Option<&str>)
    -> Result<String>;

    /// Returns the unsigned URL of a publicly readable object.
    ///
    /// # Errors
    ///
    /// Returns an error if the URL cannot be formed.
    fn public_url(&self, object: &ObjectRef, version: Option<&str>) -> Result<String>;
}

/// Memoizing front for a [`UrlDeriver`].
#[derive(Debug)]
pub struct UrlCache<C> {
    accessor: CacheAside<C>,
    safety_buffer: Duration,
    public_ttl: Duration,
}

impl<C: FastCache> UrlCache<C> {
    /// Creates a URL cache storing into `cache`.
    pub fn new(cache: C) -> Self {
        Self::with_accessor(CacheAside::new(cache))
    }

    /// Creates a URL cache over an existing accessor.
    pub const fn with_accessor(accessor: CacheAside<C>) -> Self {
        Self {
            accessor,
            safety_buffer: DEFAULT_SAFETY_BUFFER,
            public_ttl: DEFAULT_PUBLIC_TTL,
        }
    }

    /// Sets the margin kept between cache expiry and signature expiry.
    #[must_use]
    pub const fn with_safety_buffer(mut self, buffer: Duration) -> Self {
        self.safety_buffer = buffer;
        self
    }

    /// Sets how long public URLs stay cached.
    #[must_use]
    pub const fn with_public_ttl(mut self, ttl: Duration) -> Self {
        self.public_ttl = ttl;
        self
    }

    /// Returns the accessor.
    #[must_use]
    pub const fn accessor(&self) -> &CacheAside<C> {
        &self.accessor
    }

    /// Returns how long a URL with `expiry` may be cached, or `None` when it
    /// must not be cached at all.
    #[must_use]
    pub fn effective_ttl(&self, expiry: Duration) -> Option<Duration> {
        if expiry.is_zero() {
            return Some(self.public_ttl).filter(|ttl| !ttl.is_zero());
        }
        expiry
            .checked_sub(self.safety_buffer)
            .filter(|ttl| !ttl.is_zero())
    }

    /// Returns the cache key of `object` at `version`.
    ///
    /// Hex SHA-256 of `kind:bucket:key:version`; expiry is not part of it.
    #[must_use]
    pub fn cache_key(object: &ObjectRef, version: Option<&str>) -> String {
        let material = format!(
            "{}:{}:{}:{}",
            object.kind,
            object.bucket,
            object.key,
            version.unwrap_or_default()
        );
        hex::encode(Sha256::digest(material.as_bytes()))
    }

    /// Returns a URL for `object`, deriving it through `deriver` on a miss.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidInput`] for an empty or bucketless object, or
    /// [`Error::FetchFailed`] when derivation fails.
    pub fn get_or_derive_url<D>(
        &self,
        deriver: &D,
        object: &ObjectRef,
        options: &UrlOptions,
    ) -> Result<String>
    where
        D: UrlDeriver + ?Sized,
    {
        let object = object.normalized()?;
        let version = options.version();
        let key = Self::cache_key(&object, version);
        let derive = || {
            if options.expiry.is_zero() {
                deriver.public_url(&object, version)
            } else {
                deriver.signed_url(&object, options.expiry, version)
            }
        };

        let Some(ttl) = self.effective_ttl(options.expiry) else {
            metrics::counter!("url_cache_derivations_total", "cached" => "false").increment(1);
            tracing::debug!(
                bucket = %object.bucket,
                key = %object.key,
                expiry = ?options.expiry,
                "Expiry within safety buffer, deriving without cache"
            );
            return derive();
        };

        let url = if options.rebuild {
            self.accessor.refresh(&key, ttl, || {
                metrics::counter!("url_cache_derivations_total", "cached" => "true").increment(1);
                derive()
            })?
        } else {
            self.accessor.get_or_fetch(&key, ttl, || {
                metrics::counter!("url_cache_derivations_total", "cached" => "true").increment(1);
                derive()
            })?
        };
        Ok(url)
    }

    /// Drops the cached URL of `object` at `version`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidInput`] for an invalid object, or the cache's
    /// error.
    pub fn invalidate(&self, object: &ObjectRef, version: Option<&str>) -> Result<bool> {
        let object = object.normalized()?;
        self.accessor.invalidate(&Self::cache_key(&object, version))
    }
}

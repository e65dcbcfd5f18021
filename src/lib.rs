//! # Poolkeeper
//!
//! Named backend registries and stampede-safe cache access.
//!
//! Poolkeeper owns the concurrency-critical shell around stateful backend
//! clients: it constructs one long-lived client or pool per alias exactly
//! once, and it shields slow origins behind a fast cache so concurrent misses
//! for the same key trigger a single fetch.
//!
//! ## Features
//!
//! - [`Registry`]: lazily constructs one handle per alias under concurrent
//!   first access, bounded by a liveness-probe timeout
//! - [`CacheAside`]: cache-aside reads with singleflight miss coalescing
//! - [`UrlCache`]: memoized signed/public object URLs that never outlive
//!   their signature
//! - Pluggable adapters (`SQLite`, MySQL, PostgreSQL, Redis, S3-compatible object stores)
//!
//! ## Example
//!
//! ```rust,ignore
//! use poolkeeper::backend::SqliteAdapter;
//! use poolkeeper::config::DatabaseConfig;
//! use poolkeeper::{CacheAside, MemoryCache, Registry};
//! use std::time::Duration;
//!
//! let registry = Registry::new(SqliteAdapter::new());
//! let db = registry.must_get_or_init(&DatabaseConfig::sqlite("primary"));
//!
//! let cache = CacheAside::new(MemoryCache::default());
//! let name: String = cache.get_or_fetch("user:42", Duration::from_secs(60), || {
//!     db.with_connection(|conn| Ok(conn.query_row("SELECT name FROM users WHERE id = 42", [], |r| r.get(0))?))
//! })?;
//! ```

#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]
#![warn(missing_docs)]
#![forbid(unsafe_code)]
#![allow(clippy::multiple_crate_versions)]

use std::time::Duration;
use thiserror::Error as ThisError;

pub mod backend;
pub mod cache;
pub mod config;
mod lock;
pub mod observability;
pub mod registry;
pub mod url;

pub use backend::BackendAdapter;
pub use cache::{CacheAside, CancelToken, FastCache, MemoryCache, SingleFlight};
pub use config::{BackendConfig, DatabaseConfig, ObjectStoreConfig, PoolSettings, RedisConfig};
pub use registry::{EntryState, Registry};
pub use url::{ObjectRef, UrlCache, UrlDeriver, UrlOptions};

/// Error type for poolkeeper operations.
///
/// Errors are `Clone` because a single singleflight outcome is handed to
/// every waiter of that flight.
///
/// # Error Variant Triggers
///
/// | Variant | Raised When |
/// |---------|-------------|
/// | `ConfigInvalid` | Alias, connection string, endpoint or credentials missing; zero probe timeout |
/// | `ConstructionFailed` | Backend unreachable, credentials rejected, probe failed |
/// | `NotInitialized` | Lookup of an alias that has no Ready entry |
/// | `FetchFailed` | The origin fetch of a cache-aside miss returned an error |
/// | `Timeout` | Construction or liveness probe exceeded its bound |
/// | `Cancelled` | A waiter's own cancel token fired before the flight finished |
/// | `InvalidInput` | Malformed call arguments (e.g. empty object key) |
/// | `OperationFailed` | Codec or adapter operation errors outside construction |
#[derive(Debug, Clone, PartialEq, Eq, ThisError)]
pub enum Error {
    /// Configuration is missing a required field.
    #[error("invalid configuration for '{alias}': {reason}")]
    ConfigInvalid {
        /// Alias the configuration was registered under (may be empty).
        alias: String,
        /// What is missing or malformed.
        reason: String,
    },

    /// The backend could not be constructed or failed its liveness probe.
    #[error("construction of '{alias}' failed: {cause}")]
    ConstructionFailed {
        /// Alias being constructed.
        alias: String,
        /// The underlying cause.
        cause: String,
    },

    /// No Ready entry exists for the alias.
    #[error("'{0}' is not initialized")]
    NotInitialized(String),

    /// The origin fetch behind a cache miss failed.
    #[error("fetch for key '{key}' failed: {cause}")]
    FetchFailed {
        /// Cache key of the failed flight.
        key: String,
        /// The underlying cause.
        cause: String,
    },

    /// An operation exceeded its time bound.
    #[error("operation '{operation}' timed out after {timeout:?}")]
    Timeout {
        /// The operation that timed out.
        operation: String,
        /// The bound that was exceeded.
        timeout: Duration,
    },

    /// The caller stopped waiting for an in-flight fetch.
    #[error("wait for key '{0}' was cancelled")]
    Cancelled(String),

    /// Invalid call arguments.
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// An operation failed.
    #[error("operation '{operation}' failed: {cause}")]
    OperationFailed {
        /// The operation that failed.
        operation: String,
        /// The underlying cause.
        cause: String,
    },
}

impl Error {
    /// Builds a [`Error::ConfigInvalid`].
    pub fn config_invalid(alias: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::ConfigInvalid {
            alias: alias.into(),
            reason: reason.into(),
        }
    }

    /// Builds a [`Error::ConstructionFailed`].
    pub fn construction_failed(alias: impl Into<String>, cause: impl ToString) -> Self {
        Self::ConstructionFailed {
            alias: alias.into(),
            cause: cause.to_string(),
        }
    }

    /// Builds a [`Error::OperationFailed`].
    pub fn operation_failed(operation: impl Into<String>, cause: impl ToString) -> Self {
        Self::OperationFailed {
            operation: operation.into(),
            cause: cause.to_string(),
        }
    }

    /// Returns `true` for the errors a must-init caller treats as fatal.
    #[must_use]
    pub const fn is_construction_error(&self) -> bool {
        matches!(
            self,
            Self::ConfigInvalid { .. } | Self::ConstructionFailed { .. } | Self::Timeout { .. }
        )
    }
}

/// Result type alias for poolkeeper operations.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = Error::config_invalid("primary", "connection string is empty");
        assert_eq!(
            err.to_string(),
            "invalid configuration for 'primary': connection string is empty"
        );

        let err = Error::NotInitialized("cache-db".to_string());
        assert_eq!(err.to_string(), "'cache-db' is not initialized");

        let err = Error::Timeout {
            operation: "probe".to_string(),
            timeout: Duration::from_secs(2),
        };
        assert_eq!(err.to_string(), "operation 'probe' timed out after 2s");
    }

    #[test]
    fn test_construction_error_classification() {
        assert!(Error::config_invalid("a", "b").is_construction_error());
        assert!(Error::construction_failed("a", "refused").is_construction_error());
        assert!(
            Error::Timeout {
                operation: "probe".to_string(),
                timeout: Duration::from_millis(1),
            }
            .is_construction_error()
        );
        assert!(!Error::NotInitialized("a".to_string()).is_construction_error());
        assert!(!Error::Cancelled("k".to_string()).is_construction_error());
    }
}

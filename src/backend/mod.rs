//! Backend adapters.
//!
//! An adapter turns one configuration value into one concrete client handle
//! and checks that the handle can reach its backend. The registry calls the
//! adapter; the adapter never sees concurrency beyond its own handle.
//!
//! | Adapter | Handle | Default pool |
//! |---------|--------|--------------|
//! | [`SqliteAdapter`] | [`SqliteDatabase`] | 3 open / 2 idle |
//! | `MySqlAdapter` (feature `mysql`) | `MySqlDatabase` | 100 open / 10 idle |
//! | `PostgresAdapter` (feature `postgres`) | `PostgresDatabase` | 100 open |
//! | `RedisAdapter` (feature `redis`) | `RedisClient` | 100 open / 5 idle |
//! | [`ObjectStoreAdapter`] | [`ObjectStoreClient`] | HTTP client |
//!
//! Wire protocols stay inside the driver crates; adapters only construct,
//! probe and close.

pub mod mysql;
pub mod object_store;
pub mod pool;
pub mod postgresql;
pub mod redis;
pub mod sqlite;

pub use object_store::{ObjectStoreAdapter, ObjectStoreClient};
pub use pool::{ConnectionPool, PooledConnection};
pub use sqlite::{SqliteAdapter, SqliteDatabase};

#[cfg(feature = "mysql")]
pub use self::mysql::{MySqlAdapter, MySqlDatabase};

#[cfg(feature = "postgres")]
pub use postgresql::{PostgresAdapter, PostgresDatabase};

#[cfg(feature = "redis")]
pub use self::redis::{RedisAdapter, RedisClient};

use crate::Result;
use crate::config::BackendConfig;
use std::time::Duration;

/// Construct-and-probe logic for one kind of backend.
///
/// # Implementor Notes
///
/// - `construct` may perform I/O but must not retry forever; the registry
///   abandons it after [`BackendConfig::probe_timeout`].
/// - `probe` must honour `timeout` where the driver allows it.
/// - The handle is shared by every caller of the alias and used
///   concurrently, so it must be internally synchronized.
/// - `close` releases pooled resources. It may be called on a handle other
///   callers still hold; later use of such a handle should fail cleanly.
pub trait BackendAdapter: Send + Sync + 'static {
    /// Per-alias configuration.
    type Config: BackendConfig;

    /// The long-lived client or pool.
    type Handle: Send + Sync + 'static;

    /// Short backend name used in logs and metric labels.
    fn kind(&self) -> &'static str;

    /// Opens the client or pool described by `config`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ConstructionFailed`](crate::Error::ConstructionFailed)
    /// if the client cannot be built.
    fn construct(&self, config: &Self::Config) -> Result<Self::Handle>;

    /// Verifies the handle can reach its backend within `timeout`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Timeout`](crate::Error::Timeout) or
    /// [`Error::ConstructionFailed`](crate::Error::ConstructionFailed).
    fn probe(&self, handle: &Self::Handle, timeout: Duration) -> Result<()>;

    /// Releases the handle's resources.
    ///
    /// # Errors
    ///
    /// Returns an error if cleanup fails; callers log it and move on.
    fn close(&self, handle: &Self::Handle) -> Result<()> {
        let _ = handle;
        Ok(())
    }
}

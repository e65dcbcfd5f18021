//! `SQLite` adapter.
//!
//! Each database is a small [`ConnectionPool`] of `rusqlite` connections
//! configured for concurrent access:
//!
//! - **WAL mode**: concurrent readers with a single writer
//! - **NORMAL synchronous**: balances durability with performance
//! - **`busy_timeout`**: waits up to 5 seconds for locks instead of failing
//!
//! Write-heavy workloads still serialize on the database file, which is why
//! the default pool opens at most 3 connections.

use super::BackendAdapter;
use super::pool::{ConnectionPool, PooledConnection};
use crate::config::{DatabaseConfig, PoolLimits};
use crate::{Error, Result};
use rusqlite::Connection;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

/// Busy timeout applied to every connection.
const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// Configures a connection for concurrent access.
///
/// `journal_mode` returns a row ("wal"), so pragmas are set through
/// `pragma_update` rather than `execute_batch`.
///
/// # Errors
///
/// Returns [`Error::OperationFailed`] if the busy timeout cannot be set.
pub fn configure_connection(conn: &Connection) -> Result<()> {
    let _ = conn.pragma_update(None, "journal_mode", "WAL");
    let _ = conn.pragma_update(None, "synchronous", "NORMAL");
    conn.busy_timeout(BUSY_TIMEOUT)
        .map_err(|e| Error::operation_failed("sqlite_busy_timeout", e))?;
    Ok(())
}

/// A pooled `SQLite` database.
#[derive(Debug)]
pub struct SqliteDatabase {
    path: PathBuf,
    pool: ConnectionPool<Connection>,
}

impl SqliteDatabase {
    /// Opens a pool over the database file at `path`.
    ///
    /// One connection is opened eagerly so a bad path fails here rather than
    /// on first use.
    ///
    /// # Errors
    ///
    /// Returns [`Error::OperationFailed`] if the first connection cannot be
    /// opened or configured.
    pub fn open(path: impl AsRef<Path>, limits: PoolLimits) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let factory_path = path.clone();
        let pool = ConnectionPool::new(path.display().to_string(), limits, move || {
            let conn = Connection::open(&factory_path)
                .map_err(|e| Error::operation_failed("sqlite_open", e))?;
            configure_connection(&conn)?;
            Ok(conn)
        });
        pool.warm()?;
        Ok(Self { path, pool })
    }

    /// Returns the database file path.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Returns the underlying pool.
    #[must_use]
    pub const fn pool(&self) -> &ConnectionPool<Connection> {
        &self.pool
    }

    /// Checks out a connection.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Timeout`] when the pool stays exhausted.
    pub fn connection(&self) -> Result<PooledConnection<'_, Connection>> {
        self.pool.get()
    }

    /// Runs `f` with a pooled connection.
    ///
    /// # Errors
    ///
    /// Returns the checkout error, or `f`'s error as [`Error::OperationFailed`].
    pub fn with_connection<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&Connection) -> rusqlite::Result<T>,
    {
        let conn = self.pool.get()?;
        f(&conn).map_err(|e| Error::operation_failed("sqlite_query", e))
    }
}

/// Adapter producing [`SqliteDatabase`] handles.
#[derive(Debug, Default, Clone, Copy)]
pub struct SqliteAdapter;

impl SqliteAdapter {
    /// Creates the adapter.
    #[must_use]
    pub const fn new() -> Self {
        Self
    }
}

impl BackendAdapter for SqliteAdapter {
    type Config = DatabaseConfig;
    type Handle = SqliteDatabase;

    fn kind(&self) -> &'static str {
        "sqlite"
    }

    fn construct(&self, config: &DatabaseConfig) -> Result<SqliteDatabase> {
        let limits = config.limits(PoolLimits::SQLITE);
        tracing::debug!(
            alias = %config.alias,
            path = config.dsn(),
            max_open = limits.max_open,
            "Opening SQLite database"
        );
        SqliteDatabase::open(config.dsn(), limits)
            .map_err(|e| Error::construction_failed(&config.alias, e))
    }

    fn probe(&self, handle: &SqliteDatabase, timeout: Duration) -> Result<()> {
        let start = Instant::now();
        let one: i64 = handle
            .with_connection(|conn| conn.query_row("SELECT 1", [], |row| row.get(0)))
            .map_err(|e| Error::construction_failed(handle.path.display().to_string(), e))?;

        if start.elapsed() > timeout {
            return Err(Error::Timeout {
                operation: "sqlite_probe".to_string(),
                timeout,
            });
        }
        if one != 1 {
            return Err(Error::construction_failed(
                handle.path.display().to_string(),
                "probe returned an unexpected value",
            ));
        }
        Ok(())
    }

    fn close(&self, handle: &SqliteDatabase) -> Result<()> {
        handle.pool.close();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BackendConfig;
    use tempfile::TempDir;

    #[test]
    fn test_construct_and_probe() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("probe.db");
        let config = DatabaseConfig::new("primary", path.display().to_string());

        let adapter = SqliteAdapter::new();
        let db = adapter.construct(&config).unwrap();
        adapter.probe(&db, config.probe_timeout()).unwrap();

        assert_eq!(db.path(), path.as_path());
        assert_eq!(db.pool().limits().max_open, 3);
        assert_eq!(db.pool().idle_count(), 1);
    }

    #[test]
    fn test_wal_mode_applied() {
        let dir = TempDir::new().unwrap();
        let db = SqliteDatabase::open(dir.path().join("wal.db"), PoolLimits::SQLITE).unwrap();

        let mode: String = db
            .with_connection(|conn| conn.query_row("PRAGMA journal_mode", [], |row| row.get(0)))
            .unwrap();
        assert_eq!(mode.to_lowercase(), "wal");
    }

    #[test]
    fn test_connections_share_file() {
        let dir = TempDir::new().unwrap();
        let db = SqliteDatabase::open(dir.path().join("shared.db"), PoolLimits::SQLITE).unwrap();

        db.with_connection(|conn| {
            conn.execute_batch("CREATE TABLE users (id INTEGER PRIMARY KEY, name TEXT)")?;
            conn.execute("INSERT INTO users (id, name) VALUES (42, 'Alice')", [])
        })
        .unwrap();

        let first = db.connection().unwrap();
        let second = db.connection().unwrap();
        let name: String = second
            .query_row("SELECT name FROM users WHERE id = 42", [], |row| row.get(0))
            .unwrap();
        assert_eq!(name, "Alice");
        drop(first);
    }

    #[test]
    fn test_unopenable_path_fails_construction() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("missing").join("nested").join("db.sqlite");
        let config = DatabaseConfig::new("broken", path.display().to_string());

        let err = SqliteAdapter::new().construct(&config).unwrap_err();
        assert!(matches!(err, Error::ConstructionFailed { ref alias, .. } if alias == "broken"));
    }

    #[test]
    fn test_close_refuses_checkout() {
        let dir = TempDir::new().unwrap();
        let config = DatabaseConfig::new("closing", dir.path().join("c.db").display().to_string());
        let adapter = SqliteAdapter::new();
        let db = adapter.construct(&config).unwrap();

        adapter.close(&db).unwrap();
        assert!(db.connection().is_err());
    }
}

//! Bounded blocking connection pool.
//!
//! Used by adapters whose driver has no pool of its own (`SQLite`, Redis).
//! Open connections are bounded by a semaphore (`max_open`), reusable ones
//! are kept in an idle list (`max_idle`), and connections older than
//! `max_lifetime` are retired on checkout and check-in.

use crate::config::PoolLimits;
use crate::lock::acquire_lock;
use crate::{Error, Result};
use std::fmt;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

type Factory<C> = Box<dyn Fn() -> Result<C> + Send + Sync>;

struct IdleConnection<C> {
    conn: C,
    created_at: Instant,
}

/// A bounded pool of connections of type `C`.
pub struct ConnectionPool<C> {
    name: String,
    factory: Factory<C>,
    idle: Mutex<Vec<IdleConnection<C>>>,
    permits: Arc<Semaphore>,
    limits: PoolLimits,
    closed: AtomicBool,
}

impl<C> fmt::Debug for ConnectionPool<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionPool")
            .field("name", &self.name)
            .field("limits", &self.limits)
            .field("available", &self.permits.available_permits())
            .field("closed", &self.closed.load(Ordering::Acquire))
            .finish_non_exhaustive()
    }
}

impl<C: Send> ConnectionPool<C> {
    /// Creates an empty pool; connections are opened on demand by `factory`.
    pub fn new<F>(name: impl Into<String>, limits: PoolLimits, factory: F) -> Self
    where
        F: Fn() -> Result<C> + Send + Sync + 'static,
    {
        Self {
            name: name.into(),
            factory: Box::new(factory),
            idle: Mutex::new(Vec::with_capacity(limits.max_idle)),
            permits: Arc::new(Semaphore::new(limits.max_open.max(1))),
            limits,
            closed: AtomicBool::new(false),
        }
    }

    /// Returns the resolved limits.
    #[must_use]
    pub const fn limits(&self) -> PoolLimits {
        self.limits
    }

    /// Returns the number of idle connections.
    #[must_use]
    pub fn idle_count(&self) -> usize {
        acquire_lock(&self.idle).len()
    }

    /// Returns the number of connections currently checked out.
    #[must_use]
    pub fn in_use(&self) -> usize {
        self.limits.max_open.max(1) - self.permits.available_permits()
    }

    /// Returns `true` once [`close`](Self::close) has been called.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Opens one connection and parks it in the idle list.
    ///
    /// # Errors
    ///
    /// Returns the factory's error.
    pub fn warm(&self) -> Result<()> {
        let conn = self.get()?;
        drop(conn);
        Ok(())
    }

    /// Checks out a connection, waiting up to the acquire timeout.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Timeout`] when every connection stays busy, or the
    /// factory's error when a new connection cannot be opened.
    pub fn get(&self) -> Result<PooledConnection<'_, C>> {
        if self.is_closed() {
            return Err(Error::operation_failed(
                "pool_checkout",
                format!("pool '{}' is closed", self.name),
            ));
        }

        let permit = self.acquire_permit()?;

        if let Some(idle) = self.take_idle() {
            return Ok(PooledConnection {
                pool: self,
                conn: Some(idle.conn),
                created_at: idle.created_at,
                _permit: permit,
            });
        }

        let conn = (self.factory)()?;
        metrics::counter!("pool_connections_opened_total", "pool" => self.name.clone())
            .increment(1);
        Ok(PooledConnection {
            pool: self,
            conn: Some(conn),
            created_at: Instant::now(),
            _permit: permit,
        })
    }

    /// Drops idle connections and refuses further checkouts.
    ///
    /// Connections currently checked out are dropped when returned.
    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
        let drained: Vec<_> = acquire_lock(&self.idle).drain(..).collect();
        tracing::debug!(pool = %self.name, dropped = drained.len(), "Pool closed");
    }

    fn acquire_permit(&self) -> Result<OwnedSemaphorePermit> {
        let timeout = self.limits.acquire_timeout;
        let start = Instant::now();

        loop {
            if let Ok(permit) = Arc::clone(&self.permits).try_acquire_owned() {
                return Ok(permit);
            }

            if start.elapsed() >= timeout {
                metrics::counter!("pool_acquire_timeouts_total", "pool" => self.name.clone())
                    .increment(1);
                return Err(Error::Timeout {
                    operation: format!("pool '{}' checkout", self.name),
                    timeout,
                });
            }

            std::thread::sleep(Duration::from_millis(1));
        }
    }

    fn take_idle(&self) -> Option<IdleConnection<C>> {
        let mut idle = acquire_lock(&self.idle);
        while let Some(candidate) = idle.pop() {
            if !self.expired(candidate.created_at) {
                return Some(candidate);
            }
        }
        None
    }

    fn expired(&self, created_at: Instant) -> bool {
        self.limits
            .max_lifetime
            .is_some_and(|lifetime| created_at.elapsed() >= lifetime)
    }

    fn check_in(&self, conn: C, created_at: Instant) {
        if self.is_closed() || self.expired(created_at) {
            return;
        }
        let mut idle = acquire_lock(&self.idle);
        if idle.len() < self.limits.max_idle {
            idle.push(IdleConnection { conn, created_at });
        }
    }
}

/// A checked-out connection; returns to the pool on drop.
pub struct PooledConnection<'a, C: Send> {
    pool: &'a ConnectionPool<C>,
    conn: Option<C>,
    created_at: Instant,
    _permit: OwnedSemaphorePermit,
}

impl<C: Send> fmt::Debug for PooledConnection<'_, C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PooledConnection")
            .field("pool", &self.pool.name)
            .field("age", &self.created_at.elapsed())
            .finish_non_exhaustive()
    }
}

impl<C: Send> PooledConnection<'_, C> {
    /// Drops the connection instead of returning it, e.g. after an I/O error.
    pub fn discard(mut self) {
        self.conn = None;
    }
}

impl<C: Send> Deref for PooledConnection<'_, C> {
    type Target = C;

    #[allow(clippy::unwrap_used)] // Only `discard`/`drop` take the connection, both consume self.
    fn deref(&self) -> &C {
        self.conn.as_ref().unwrap()
    }
}

impl<C: Send> DerefMut for PooledConnection<'_, C> {
    #[allow(clippy::unwrap_used)] // Only `discard`/`drop` take the connection, both consume self.
    fn deref_mut(&mut self) -> &mut C {
        self.conn.as_mut().unwrap()
    }
}

impl<C: Send> Drop for PooledConnection<'_, C> {
    fn drop(&mut self) {
        if let Some(conn) = self.conn.take() {
            self.pool.check_in(conn, self.created_at);
        }
    }
}

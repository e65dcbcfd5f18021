//! Named resource registry.
//!
//! A [`Registry`] maps aliases to long-lived handles produced by one
//! [`BackendAdapter`]. The first caller for an alias constructs the handle;
//! concurrent callers for the same alias wait on that alias's construction
//! lock and observe its result. Other aliases are never blocked by it.
//!
//! # Entry lifecycle
//!
//! ```text
//! Uninitialized --construct+probe ok--> Ready (immutable until shutdown)
//!       |
//!       +--------error / timeout------> Failed (next call retries)
//! ```
//!
//! Construction and probe run on a worker thread bounded by the config's
//! probe timeout. A handle that arrives after the caller gave up is closed
//! instead of being published.

use crate::backend::{BackendAdapter, ObjectStoreAdapter, SqliteAdapter};
use crate::config::BackendConfig;
use crate::lock::{acquire_lock, read_lock, write_lock};
use crate::{Error, Result};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::{Arc, Mutex, OnceLock, RwLock, TryLockError};
use std::thread;
use std::time::{Duration, Instant};

/// Registry of `SQLite` databases.
pub type SqliteRegistry = Registry<SqliteAdapter>;

/// Registry of MySQL pools.
#[cfg(feature = "mysql")]
pub type MySqlRegistry = Registry<crate::backend::MySqlAdapter>;

/// Registry of PostgreSQL pools.
#[cfg(feature = "postgres")]
pub type PostgresRegistry = Registry<crate::backend::PostgresAdapter>;

/// Registry of Redis clients.
#[cfg(feature = "redis")]
pub type RedisRegistry = Registry<crate::backend::RedisAdapter>;

/// Registry of object store clients.
pub type ObjectStoreRegistry = Registry<ObjectStoreAdapter>;

/// Observable state of one alias.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EntryState {
    /// Known alias whose first construction is still running.
    Uninitialized,
    /// Handle constructed and published.
    Ready,
    /// Last attempt failed; the next `get_or_init` retries.
    Failed(Error),
}

/// Per-alias slot. `ready` is set at most once; `init` serializes attempts
/// and remembers the last failure; `attempts` counts finished attempts.
struct Slot<H> {
    ready: OnceLock<Arc<H>>,
    attempts: AtomicU64,
    init: Mutex<Option<Error>>,
}

impl<H> Slot<H> {
    const fn new() -> Self {
        Self {
            ready: OnceLock::new(),
            attempts: AtomicU64::new(0),
            init: Mutex::new(None),
        }
    }
}

/// Lazily constructs and shares one handle per alias.
pub struct Registry<A: BackendAdapter> {
    adapter: Arc<A>,
    slots: RwLock<HashMap<String, Arc<Slot<A::Handle>>>>,
}

impl<A: BackendAdapter> std::fmt::Debug for Registry<A> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Registry")
            .field("backend", &self.adapter.kind())
            .field("aliases", &self.aliases())
            .finish()
    }
}

impl<A: BackendAdapter + Default> Default for Registry<A> {
    fn default() -> Self {
        Self::new(A::default())
    }
}

impl<A: BackendAdapter> Registry<A> {
    /// Creates an empty registry using `adapter`.
    pub fn new(adapter: A) -> Self {
        Self {
            adapter: Arc::new(adapter),
            slots: RwLock::new(HashMap::new()),
        }
    }

    /// Returns the adapter.
    #[must_use]
    pub fn adapter(&self) -> &A {
        &self.adapter
    }

    /// Returns the handle for `config.alias()`, constructing it on first use.
    ///
    /// At most one construction runs per alias; concurrent callers share its
    /// outcome. A Ready alias returns the existing handle without touching
    /// the adapter, whatever the rest of `config` says.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ConfigInvalid`] before any I/O,
    /// [`Error::ConstructionFailed`] or [`Error::Timeout`]. Errors are also
    /// logged.
    pub fn get_or_init(&self, config: &A::Config) -> Result<Arc<A::Handle>> {
        if let Err(e) = config.validate() {
            tracing::error!(backend = self.adapter.kind(), alias = config.alias(), error = %e, "Invalid backend configuration");
            return Err(e);
        }

        let alias = config.alias();
        if let Some(handle) = self.ready(alias) {
            return Ok(handle);
        }

        let slot = self.slot(alias);
        let seen = slot.attempts.load(Ordering::Acquire);
        let mut last_error = acquire_lock(&slot.init);
        // Another caller may have finished while we waited for the lock.
        if let Some(handle) = slot.ready.get() {
            return Ok(Arc::clone(handle));
        }
        // Waiters of a failed attempt share its error instead of retrying.
        if slot.attempts.load(Ordering::Acquire) != seen
            && let Some(e) = last_error.as_ref()
        {
            return Err(e.clone());
        }

        let start = Instant::now();
        tracing::info!(backend = self.adapter.kind(), alias, "Constructing backend");
        let outcome = self.construct(config);
        slot.attempts.fetch_add(1, Ordering::Release);
        match outcome {
            Ok(handle) => {
                let handle = Arc::new(handle);
                // Publish under the map lock so `shutdown` either sees the
                // handle or has already detached this slot.
                let published = {
                    let slots = read_lock(&self.slots);
                    slots
                        .get(alias)
                        .is_some_and(|current| Arc::ptr_eq(current, &slot))
                        .then(|| Arc::clone(slot.ready.get_or_init(|| Arc::clone(&handle))))
                };
                *last_error = None;
                drop(last_error);

                let Some(published) = published else {
                    tracing::warn!(
                        backend = self.adapter.kind(),
                        alias,
                        "Registry shut down during construction, closing new handle"
                    );
                    close_quietly(&*self.adapter, alias, &handle);
                    return Err(Error::construction_failed(
                        alias,
                        "registry shut down during construction",
                    ));
                };

                tracing::info!(
                    backend = self.adapter.kind(),
                    alias,
                    duration_ms = u64::try_from(start.elapsed().as_millis()).unwrap_or(u64::MAX),
                    "Backend ready"
                );
                metrics::counter!(
                    "registry_constructions_total",
                    "backend" => self.adapter.kind(),
                    "outcome" => "success"
                )
                .increment(1);
                self.record_entries();
                Ok(published)
            },
            Err(e) => {
                let label = if matches!(e, Error::Timeout { .. }) {
                    "timeout"
                } else {
                    "failure"
                };
                tracing::error!(
                    backend = self.adapter.kind(),
                    alias,
                    error = %e,
                    "Backend construction failed"
                );
                metrics::counter!(
                    "registry_constructions_total",
                    "backend" => self.adapter.kind(),
                    "outcome" => label
                )
                .increment(1);
                *last_error = Some(e.clone());
                Err(e)
            },
        }
    }

    /// Like [`get_or_init`](Self::get_or_init), for dependencies the process
    /// cannot run without.
    ///
    /// # Panics
    ///
    /// Panics with the error text if the alias cannot be made Ready.
    #[allow(clippy::panic)]
    pub fn must_get_or_init(&self, config: &A::Config) -> Arc<A::Handle> {
        match self.get_or_init(config) {
            Ok(handle) => handle,
            Err(e) => panic!(
                "required {} backend '{}' failed to initialize: {e}",
                self.adapter.kind(),
                config.alias()
            ),
        }
    }

    /// Returns the handle of a Ready alias. Never constructs.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotInitialized`] unless the alias is Ready.
    pub fn get(&self, alias: &str) -> Result<Arc<A::Handle>> {
        self.ready(alias)
            .ok_or_else(|| Error::NotInitialized(alias.to_string()))
    }

    /// Returns the state of `alias`, or `None` if it was never requested.
    #[must_use]
    pub fn state(&self, alias: &str) -> Option<EntryState> {
        let slot = read_lock(&self.slots).get(alias).cloned()?;
        if slot.ready.get().is_some() {
            return Some(EntryState::Ready);
        }
        let last_error = match slot.init.try_lock() {
            Ok(guard) => guard.clone(),
            Err(TryLockError::Poisoned(poisoned)) => poisoned.into_inner().clone(),
            Err(TryLockError::WouldBlock) => return Some(EntryState::Uninitialized),
        };
        Some(last_error.map_or(EntryState::Uninitialized, EntryState::Failed))
    }

    /// Returns the Ready aliases, sorted.
    #[must_use]
    pub fn aliases(&self) -> Vec<String> {
        let mut aliases: Vec<String> = read_lock(&self.slots)
            .iter()
            .filter(|(_, slot)| slot.ready.get().is_some())
            .map(|(alias, _)| alias.clone())
            .collect();
        aliases.sort();
        aliases
    }

    /// Returns the number of Ready aliases.
    #[must_use]
    pub fn len(&self) -> usize {
        read_lock(&self.slots)
            .values()
            .filter(|slot| slot.ready.get().is_some())
            .count()
    }

    /// Returns `true` if no alias is Ready.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Closes every Ready handle and forgets all aliases.
    ///
    /// Close errors are logged. Callers still holding a handle keep the
    /// `Arc` alive, but its pool has been closed. Returns the number of
    /// handles closed.
    pub fn shutdown(&self) -> usize {
        let slots = std::mem::take(&mut *write_lock(&self.slots));
        let mut closed = 0;
        for (alias, slot) in slots {
            let Some(handle) = slot.ready.get() else {
                continue;
            };
            match self.adapter.close(handle) {
                Ok(()) => {
                    closed += 1;
                    tracing::debug!(backend = self.adapter.kind(), alias, "Closed backend");
                },
                Err(e) => {
                    tracing::warn!(backend = self.adapter.kind(), alias, error = %e, "Failed to close backend");
                },
            }
        }
        self.record_entries();
        tracing::info!(backend = self.adapter.kind(), closed, "Registry shut down");
        closed
    }

    fn ready(&self, alias: &str) -> Option<Arc<A::Handle>> {
        read_lock(&self.slots)
            .get(alias)
            .and_then(|slot| slot.ready.get())
            .map(Arc::clone)
    }

    fn slot(&self, alias: &str) -> Arc<Slot<A::Handle>> {
        if let Some(slot) = read_lock(&self.slots).get(alias) {
            return Arc::clone(slot);
        }
        Arc::clone(
            write_lock(&self.slots)
                .entry(alias.to_string())
                .or_insert_with(|| Arc::new(Slot::new())),
        )
    }

    #[allow(clippy::cast_precision_loss)]
    fn record_entries(&self) {
        metrics::gauge!("registry_entries", "backend" => self.adapter.kind())
            .set(self.len() as f64);
    }

    /// Runs construct + probe on a worker thread, bounded by the probe
    /// timeout.
    fn construct(&self, config: &A::Config) -> Result<A::Handle> {
        let alias = config.alias().to_string();
        let timeout = config.probe_timeout();
        let (tx, rx) = mpsc::sync_channel(1);
        // Set under lock by the caller when it stops waiting; the worker
        // checks it under the same lock before sending.
        let abandoned = Arc::new(Mutex::new(false));

        let adapter = Arc::clone(&self.adapter);
        let worker_config = config.clone();
        let worker_abandoned = Arc::clone(&abandoned);
        let worker_alias = alias.clone();
        thread::Builder::new()
            .name(format!("poolkeeper-init-{alias}"))
            .spawn(move || {
                let result = construct_and_probe(&*adapter, &worker_config, timeout);
                let abandoned = acquire_lock(&worker_abandoned);
                if *abandoned {
                    if let Ok(handle) = result {
                        tracing::warn!(
                            backend = adapter.kind(),
                            alias = %worker_alias,
                            "Discarding handle that arrived after the construction timeout"
                        );
                        close_quietly(&*adapter, &worker_alias, &handle);
                    }
                    return;
                }
                let _ = tx.send(result);
            })
            .map_err(|e| Error::construction_failed(&alias, e))?;

        match rx.recv_timeout(timeout) {
            Ok(result) => result.map_err(|e| normalize(&alias, e)),
            Err(RecvTimeoutError::Timeout) => {
                let mut abandoned = acquire_lock(&abandoned);
                if let Ok(result) = rx.try_recv() {
                    return result.map_err(|e| normalize(&alias, e));
                }
                *abandoned = true;
                Err(Error::Timeout {
                    operation: format!("{} construction of '{alias}'", self.adapter.kind()),
                    timeout,
                })
            },
            Err(RecvTimeoutError::Disconnected) => Err(Error::construction_failed(
                &alias,
                "construction worker exited without a result",
            )),
        }
    }
}

/// Construct and probe share one `timeout` budget.
fn construct_and_probe<A: BackendAdapter>(
    adapter: &A,
    config: &A::Config,
    timeout: Duration,
) -> Result<A::Handle> {
    let start = Instant::now();
    let handle = adapter.construct(config)?;
    if let Err(e) = adapter.probe(&handle, timeout.saturating_sub(start.elapsed())) {
        close_quietly(adapter, config.alias(), &handle);
        return Err(e);
    }
    Ok(handle)
}

fn close_quietly<A: BackendAdapter>(adapter: &A, alias: &str, handle: &A::Handle) {
    if let Err(e) = adapter.close(handle) {
        tracing::warn!(backend = adapter.kind(), alias, error = %e, "Failed to close discarded handle");
    }
}

/// Keeps construction-class errors, wraps anything else.
fn normalize(alias: &str, e: Error) -> Error {
    if e.is_construction_error() {
        e
    } else {
        Error::construction_failed(alias, e)
    }
}

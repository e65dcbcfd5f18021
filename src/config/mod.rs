//! Configuration management.
//!
//! Configuration values are loaded and validated by the caller; this module
//! only defines their shape, backend-specific defaults, environment overrides
//! and the validation each adapter runs before touching the network.

mod backends;
mod secrets;

pub use backends::{DatabaseConfig, ObjectStoreConfig, RedisConfig};
pub use secrets::{extract_host, redact_dsn, resolve_secret};

use serde::Deserialize;
use std::time::Duration;

/// Default bound for a backend liveness probe.
pub const DEFAULT_PROBE_TIMEOUT: Duration = Duration::from_secs(5);

/// Per-alias configuration consumed by a [`Registry`](crate::Registry).
///
/// Implementations must be cheap to clone: the registry moves a copy into the
/// construction worker so a hung backend cannot pin the caller.
pub trait BackendConfig: Clone + Send + Sync + 'static {
    /// Returns the alias this configuration registers under.
    fn alias(&self) -> &str;

    /// Checks required fields without performing any I/O.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ConfigInvalid`](crate::Error::ConfigInvalid) when a
    /// required field is missing.
    fn validate(&self) -> crate::Result<()>;

    /// Returns the bound applied to construction plus liveness probe.
    fn probe_timeout(&self) -> Duration;
}

/// Effective pool limits after defaults have been applied.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolLimits {
    /// Maximum open connections.
    pub max_open: usize,
    /// Maximum idle connections kept for reuse.
    pub max_idle: usize,
    /// Maximum age of a connection before it is retired.
    pub max_lifetime: Option<Duration>,
    /// How long a checkout waits for a free connection.
    pub acquire_timeout: Duration,
}

impl PoolLimits {
    /// Embedded `SQLite`: few writers, otherwise `database is locked`.
    pub const SQLITE: Self = Self {
        max_open: 3,
        max_idle: 2,
        max_lifetime: None,
        acquire_timeout: Duration::from_secs(5),
    };

    /// Networked PostgreSQL.
    pub const POSTGRES: Self = Self {
        max_open: 100,
        max_idle: 10,
        max_lifetime: Some(Duration::from_secs(3600)),
        acquire_timeout: Duration::from_secs(5),
    };

    /// Networked MySQL: 100 open / 10 idle, recycled hourly.
    pub const MYSQL: Self = Self {
        max_open: 100,
        max_idle: 10,
        max_lifetime: Some(Duration::from_secs(3600)),
        acquire_timeout: Duration::from_secs(5),
    };

    /// Redis.
    pub const REDIS: Self = Self {
        max_open: 100,
        max_idle: 5,
        max_lifetime: None,
        acquire_timeout: Duration::from_secs(5),
    };
}

/// Caller-supplied pool sizing knobs.
///
/// Unset fields fall back to the backend's [`PoolLimits`] defaults.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct PoolSettings {
    /// Maximum open connections.
    pub max_open: Option<usize>,
    /// Maximum idle connections.
    pub max_idle: Option<usize>,
    /// Maximum connection lifetime in seconds.
    pub max_lifetime_secs: Option<u64>,
    /// Checkout wait bound in milliseconds.
    pub acquire_timeout_ms: Option<u64>,
}

impl PoolSettings {
    /// Creates empty settings (all backend defaults).
    #[must_use]
    pub const fn new() -> Self {
        Self {
            max_open: None,
            max_idle: None,
            max_lifetime_secs: None,
            acquire_timeout_ms: None,
        }
    }

    /// Loads settings from environment variables.
    ///
    /// | Variable | Description |
    /// |----------|-------------|
    /// | `POOLKEEPER_POOL_MAX_OPEN` | Max open connections |
    /// | `POOLKEEPER_POOL_MAX_IDLE` | Max idle connections |
    /// | `POOLKEEPER_POOL_MAX_LIFETIME_SECS` | Max connection lifetime |
    /// | `POOLKEEPER_POOL_ACQUIRE_TIMEOUT_MS` | Checkout wait bound |
    #[must_use]
    pub fn from_env() -> Self {
        Self::default().with_env_overrides()
    }

    /// Applies environment variable overrides.
    #[must_use]
    pub fn with_env_overrides(mut self) -> Self {
        if let Ok(v) = std::env::var("POOLKEEPER_POOL_MAX_OPEN")
            && let Ok(parsed) = v.parse::<usize>()
        {
            self.max_open = Some(parsed.max(1));
        }
        if let Ok(v) = std::env::var("POOLKEEPER_POOL_MAX_IDLE")
            && let Ok(parsed) = v.parse::<usize>()
        {
            self.max_idle = Some(parsed);
        }
        if let Ok(v) = std::env::var("POOLKEEPER_POOL_MAX_LIFETIME_SECS")
            && let Ok(parsed) = v.parse::<u64>()
        {
            self.max_lifetime_secs = Some(parsed);
        }
        if let Ok(v) = std::env::var("POOLKEEPER_POOL_ACQUIRE_TIMEOUT_MS")
            && let Ok(parsed) = v.parse::<u64>()
        {
            self.acquire_timeout_ms = Some(parsed);
        }
        self
    }

    /// Sets the maximum open connections.
    #[must_use]
    pub const fn with_max_open(mut self, max: usize) -> Self {
        self.max_open = Some(max);
        self
    }

    /// Sets the maximum idle connections.
    #[must_use]
    pub const fn with_max_idle(mut self, max: usize) -> Self {
        self.max_idle = Some(max);
        self
    }

    /// Sets the maximum connection lifetime.
    #[must_use]
    pub const fn with_max_lifetime(mut self, lifetime: Duration) -> Self {
        self.max_lifetime_secs = Some(lifetime.as_secs());
        self
    }

    /// Sets the checkout wait bound.
    #[must_use]
    #[allow(clippy::cast_possible_truncation)]
    pub const fn with_acquire_timeout(mut self, timeout: Duration) -> Self {
        self.acquire_timeout_ms = Some(timeout.as_millis() as u64);
        self
    }

    /// Resolves the settings against backend defaults.
    ///
    /// `max_open` is at least 1 and `max_idle` never exceeds `max_open`.
    /// A zero lifetime means "no limit".
    #[must_use]
    pub fn resolve(&self, defaults: PoolLimits) -> PoolLimits {
        let max_open = self.max_open.unwrap_or(defaults.max_open).max(1);
        let max_idle = self.max_idle.unwrap_or(defaults.max_idle).min(max_open);
        let max_lifetime = match self.max_lifetime_secs {
            Some(0) => None,
            Some(secs) => Some(Duration::from_secs(secs)),
            None => defaults.max_lifetime,
        };
        let acquire_timeout = self
            .acquire_timeout_ms
            .map_or(defaults.acquire_timeout, Duration::from_millis);

        PoolLimits {
            max_open,
            max_idle,
            max_lifetime,
            acquire_timeout,
        }
    }
}

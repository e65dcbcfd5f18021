//! Per-backend configuration values.

use super::{BackendConfig, DEFAULT_PROBE_TIMEOUT, PoolLimits, PoolSettings, resolve_secret};
use crate::{Error, Result};
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use std::time::Duration;

const fn default_probe_timeout_ms() -> u64 {
    5_000
}

#[allow(clippy::cast_possible_truncation)]
const fn duration_ms(timeout: Duration) -> u64 {
    timeout.as_millis() as u64
}

fn require_alias(alias: &str) -> Result<()> {
    if alias.trim().is_empty() {
        return Err(Error::config_invalid(alias, "alias is empty"));
    }
    Ok(())
}

/// A zero timeout would time out every construction.
fn require_probe_timeout(alias: &str, probe_timeout_ms: u64) -> Result<()> {
    if probe_timeout_ms == 0 {
        return Err(Error::config_invalid(alias, "probe timeout must be positive"));
    }
    Ok(())
}

// ============================================================================
// Database
// ============================================================================

/// Relational database configuration (`SQLite`, MySQL and PostgreSQL adapters).
#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    /// Alias the database registers under.
    pub alias: String,
    /// Connection string: `SQLite` file path, MySQL URL or `tcp(...)` DSN,
    /// PostgreSQL URL or key-value DSN.
    #[serde(with = "secret_string_serde")]
    pub dsn: SecretString,
    /// Pool sizing.
    #[serde(default)]
    pub pool: PoolSettings,
    /// Construction + liveness probe bound in milliseconds.
    #[serde(default = "default_probe_timeout_ms")]
    pub probe_timeout_ms: u64,
}

impl DatabaseConfig {
    /// Creates a configuration with default pool settings.
    pub fn new(alias: impl Into<String>, dsn: impl Into<String>) -> Self {
        Self {
            alias: alias.into(),
            dsn: SecretString::from(dsn.into()),
            pool: PoolSettings::default(),
            probe_timeout_ms: default_probe_timeout_ms(),
        }
    }

    /// Creates an `SQLite` configuration at the default `./{alias}_sqlite.db` path.
    pub fn sqlite(alias: impl Into<String>) -> Self {
        let alias = alias.into();
        let path = format!("./{alias}_sqlite.db");
        Self::new(alias, path)
    }

    /// Sets pool sizing.
    #[must_use]
    pub const fn with_pool(mut self, pool: PoolSettings) -> Self {
        self.pool = pool;
        self
    }

    /// Sets the construction + probe bound.
    #[must_use]
    pub const fn with_probe_timeout(mut self, timeout: Duration) -> Self {
        self.probe_timeout_ms = duration_ms(timeout);
        self
    }

    /// Returns the connection string.
    pub fn dsn(&self) -> &str {
        self.dsn.expose_secret()
    }

    /// Resolves pool limits against backend defaults.
    #[must_use]
    pub fn limits(&self, defaults: PoolLimits) -> PoolLimits {
        self.pool.resolve(defaults)
    }
}

impl BackendConfig for DatabaseConfig {
    fn alias(&self) -> &str {
        &self.alias
    }

    fn validate(&self) -> Result<()> {
        require_alias(&self.alias)?;
        require_probe_timeout(&self.alias, self.probe_timeout_ms)?;
        if self.dsn().trim().is_empty() {
            return Err(Error::config_invalid(&self.alias, "connection string is empty"));
        }
        Ok(())
    }

    fn probe_timeout(&self) -> Duration {
        Duration::from_millis(self.probe_timeout_ms)
    }
}

// ============================================================================
// Redis
// ============================================================================

const fn default_redis_retries() -> usize {
    3
}

const fn default_dial_timeout_ms() -> u64 {
    500
}

fn default_redis_addr() -> String {
    "127.0.0.1:6379".to_string()
}

/// Redis configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct RedisConfig {
    /// Alias the client registers under.
    pub alias: String,
    /// `host:port` address.
    #[serde(default = "default_redis_addr")]
    pub addr: String,
    /// Logical database number.
    #[serde(default)]
    pub db: i64,
    /// ACL username.
    #[serde(default)]
    pub username: Option<String>,
    /// Password; `ENV:VAR` reads it from the environment.
    #[serde(default, with = "optional_secret_serde")]
    pub password: Option<SecretString>,
    /// Command retries on transient I/O errors.
    #[serde(default = "default_redis_retries")]
    pub max_retries: usize,
    /// Pool sizing (`max_open` is the pool size, `max_idle` the warm set).
    #[serde(default)]
    pub pool: PoolSettings,
    /// Per-connection dial bound in milliseconds.
    #[serde(default = "default_dial_timeout_ms")]
    pub dial_timeout_ms: u64,
    /// Construction + PING bound in milliseconds.
    #[serde(default = "default_probe_timeout_ms")]
    pub probe_timeout_ms: u64,
}

impl RedisConfig {
    /// Creates a configuration for the given alias with default settings.
    pub fn new(alias: impl Into<String>) -> Self {
        Self {
            alias: alias.into(),
            addr: default_redis_addr(),
            db: 0,
            username: None,
            password: None,
            max_retries: default_redis_retries(),
            pool: PoolSettings::default(),
            dial_timeout_ms: default_dial_timeout_ms(),
            probe_timeout_ms: default_probe_timeout_ms(),
        }
    }

    /// Sets the `host:port` address.
    #[must_use]
    pub fn with_addr(mut self, addr: impl Into<String>) -> Self {
        self.addr = addr.into();
        self
    }

    /// Sets the logical database number.
    #[must_use]
    pub const fn with_db(mut self, db: i64) -> Self {
        self.db = db;
        self
    }

    /// Sets the ACL username.
    #[must_use]
    pub fn with_username(mut self, username: impl Into<String>) -> Self {
        self.username = Some(username.into());
        self
    }

    /// Sets the password, resolving `ENV:VAR` indirection.
    #[must_use]
    pub fn with_password(mut self, password: &str) -> Self {
        self.password = Some(resolve_secret(password));
        self
    }

    /// Sets pool sizing.
    #[must_use]
    pub const fn with_pool(mut self, pool: PoolSettings) -> Self {
        self.pool = pool;
        self
    }

    /// Sets the dial bound.
    #[must_use]
    pub const fn with_dial_timeout(mut self, timeout: Duration) -> Self {
        self.dial_timeout_ms = duration_ms(timeout);
        self
    }

    /// Sets the construction + PING bound.
    #[must_use]
    pub const fn with_probe_timeout(mut self, timeout: Duration) -> Self {
        self.probe_timeout_ms = duration_ms(timeout);
        self
    }

    /// Returns the dial bound.
    #[must_use]
    pub const fn dial_timeout(&self) -> Duration {
        Duration::from_millis(self.dial_timeout_ms)
    }

    /// Resolves pool limits against the Redis defaults.
    #[must_use]
    pub fn limits(&self) -> PoolLimits {
        self.pool.resolve(PoolLimits::REDIS)
    }

    /// Builds the `redis://` connection URL including credentials.
    ///
    /// Credentials are percent-encoded; the result must not be logged.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ConfigInvalid`] if the address cannot form a URL.
    pub fn connection_url(&self) -> Result<String> {
        let mut url = reqwest::Url::parse(&format!("redis://{}/{}", self.addr, self.db))
            .map_err(|e| Error::config_invalid(&self.alias, format!("bad address: {e}")))?;

        if let Some(username) = &self.username {
            url.set_username(username)
                .map_err(|()| Error::config_invalid(&self.alias, "username not allowed"))?;
        }
        if let Some(password) = &self.password {
            url.set_password(Some(password.expose_secret()))
                .map_err(|()| Error::config_invalid(&self.alias, "password not allowed"))?;
        }
        Ok(url.to_string())
    }
}

impl BackendConfig for RedisConfig {
    fn alias(&self) -> &str {
        &self.alias
    }

    fn validate(&self) -> Result<()> {
        require_alias(&self.alias)?;
        require_probe_timeout(&self.alias, self.probe_timeout_ms)?;
        if self.addr.trim().is_empty() {
            return Err(Error::config_invalid(&self.alias, "address is empty"));
        }
        if self.db < 0 {
            return Err(Error::config_invalid(&self.alias, "database number is negative"));
        }
        Ok(())
    }

    fn probe_timeout(&self) -> Duration {
        Duration::from_millis(self.probe_timeout_ms)
    }
}

// ============================================================================
// Object store
// ============================================================================

fn default_region() -> String {
    "us-east-1".to_string()
}

/// S3-compatible object store configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct ObjectStoreConfig {
    /// Alias the client registers under.
    pub alias: String,
    /// `host[:port]`, or a full `http(s)://` base URL.
    pub endpoint: String,
    /// Access key id.
    pub access_key_id: String,
    /// Secret access key.
    #[serde(with = "secret_string_serde")]
    pub secret_access_key: SecretString,
    /// Signing region.
    #[serde(default = "default_region")]
    pub region: String,
    /// Whether a bare `host[:port]` endpoint uses HTTPS.
    #[serde(default)]
    pub use_ssl: bool,
    /// Construction + liveness probe bound in milliseconds.
    #[serde(default = "default_probe_timeout_ms")]
    pub probe_timeout_ms: u64,
}

impl ObjectStoreConfig {
    /// Creates a configuration; `secret_access_key` honours `ENV:VAR`.
    pub fn new(
        alias: impl Into<String>,
        endpoint: impl Into<String>,
        access_key_id: impl Into<String>,
        secret_access_key: &str,
    ) -> Self {
        Self {
            alias: alias.into(),
            endpoint: endpoint.into(),
            access_key_id: access_key_id.into(),
            secret_access_key: resolve_secret(secret_access_key),
            region: default_region(),
            use_ssl: false,
            probe_timeout_ms: duration_ms(DEFAULT_PROBE_TIMEOUT),
        }
    }

    /// Sets the signing region.
    #[must_use]
    pub fn with_region(mut self, region: impl Into<String>) -> Self {
        self.region = region.into();
        self
    }

    /// Sets whether a bare endpoint uses HTTPS.
    #[must_use]
    pub const fn with_ssl(mut self, use_ssl: bool) -> Self {
        self.use_ssl = use_ssl;
        self
    }

    /// Sets the construction + probe bound.
    #[must_use]
    pub const fn with_probe_timeout(mut self, timeout: Duration) -> Self {
        self.probe_timeout_ms = duration_ms(timeout);
        self
    }

    /// Returns the endpoint as a base URL without trailing slash.
    #[must_use]
    pub fn base_url(&self) -> String {
        let endpoint = self.endpoint.trim().trim_end_matches('/');
        if endpoint.starts_with("http://") || endpoint.starts_with("https://") {
            endpoint.to_string()
        } else if self.use_ssl {
            format!("https://{endpoint}")
        } else {
            format!("http://{endpoint}")
        }
    }
}

impl BackendConfig for ObjectStoreConfig {
    fn alias(&self) -> &str {
        &self.alias
    }

    fn validate(&self) -> Result<()> {
        require_alias(&self.alias)?;
        require_probe_timeout(&self.alias, self.probe_timeout_ms)?;
        if self.endpoint.trim().is_empty() {
            return Err(Error::config_invalid(&self.alias, "endpoint is empty"));
        }
        if self.access_key_id.trim().is_empty() {
            return Err(Error::config_invalid(&self.alias, "access key id is empty"));
        }
        if self.secret_access_key.expose_secret().is_empty() {
            return Err(Error::config_invalid(&self.alias, "secret access key is empty"));
        }
        if self.region.trim().is_empty() {
            return Err(Error::config_invalid(&self.alias, "region is empty"));
        }
        Ok(())
    }

    fn probe_timeout(&self) -> Duration {
        Duration::from_millis(self.probe_timeout_ms)
    }
}

/// Serde module for `SecretString` fields.
mod secret_string_serde {
    use secrecy::SecretString;
    use serde::{Deserialize, Deserializer};

    pub fn deserialize<'de, D>(deserializer: D) -> Result<SecretString, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        Ok(super::resolve_secret(&s))
    }
}

/// Serde module for optional `SecretString` fields.
mod optional_secret_serde {
    use secrecy::SecretString;
    use serde::{Deserialize, Deserializer};

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<SecretString>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = Option::<String>::deserialize(deserializer)?;
        Ok(s.map(|s| super::resolve_secret(&s)))
    }
}

//! Redis adapter.
//!
//! # Connection Pooling
//!
//! `redis::Connection` is a single blocking connection, so the handle keeps
//! them in a [`ConnectionPool`](super::ConnectionPool) sized by
//! [`PoolLimits::REDIS`](crate::config::PoolLimits::REDIS) unless overridden.
//!
//! # Command Timeout
//!
//! Every connection gets a 5-second read/write timeout so a stalled server
//! cannot block a caller indefinitely. Dialing is bounded separately by
//! [`RedisConfig::dial_timeout`](crate::config::RedisConfig::dial_timeout).

#[cfg(feature = "redis")]
mod implementation {
    use crate::backend::BackendAdapter;
    use crate::backend::pool::ConnectionPool;
    use crate::config::RedisConfig;
    use crate::{Error, Result};
    use redis::{Client, Connection, RedisError, RedisResult};
    use std::time::{Duration, Instant};

    /// Read/write timeout applied to every connection.
    const REDIS_TIMEOUT: Duration = Duration::from_secs(5);

    fn is_transient(e: &RedisError) -> bool {
        e.is_io_error() || e.is_timeout() || e.is_connection_dropped()
    }

    /// A pooled Redis client.
    #[derive(Debug)]
    pub struct RedisClient {
        addr: String,
        max_retries: usize,
        pool: ConnectionPool<Connection>,
    }

    impl RedisClient {
        /// Creates a client for `config`. No connection is opened yet.
        ///
        /// # Errors
        ///
        /// Returns [`Error::ConfigInvalid`] if the connection URL cannot be
        /// built, or [`Error::OperationFailed`] if the driver rejects it.
        pub fn open(config: &RedisConfig) -> Result<Self> {
            let client = Client::open(config.connection_url()?)
                .map_err(|e| Error::operation_failed("redis_open", e))?;
            let dial_timeout = config.dial_timeout();

            let pool = ConnectionPool::new(config.addr.clone(), config.limits(), move || {
                let conn = client
                    .get_connection_with_timeout(dial_timeout)
                    .map_err(|e| Error::operation_failed("redis_get_connection", e))?;
                conn.set_read_timeout(Some(REDIS_TIMEOUT))
                    .map_err(|e| Error::operation_failed("redis_set_read_timeout", e))?;
                conn.set_write_timeout(Some(REDIS_TIMEOUT))
                    .map_err(|e| Error::operation_failed("redis_set_write_timeout", e))?;
                Ok(conn)
            });

            Ok(Self {
                addr: config.addr.clone(),
                max_retries: config.max_retries,
                pool,
            })
        }

        /// Returns the server address.
        #[must_use]
        pub fn addr(&self) -> &str {
            &self.addr
        }

        /// Returns the underlying pool.
        #[must_use]
        pub const fn pool(&self) -> &ConnectionPool<Connection> {
            &self.pool
        }

        /// Runs `f` with a pooled connection.
        ///
        /// Transient I/O errors discard the connection and retry up to
        /// `max_retries` times on a fresh one. Command errors are returned
        /// as-is.
        ///
        /// # Errors
        ///
        /// Returns the checkout error or the last command error as
        /// [`Error::OperationFailed`].
        pub fn with_connection<T, F>(&self, mut f: F) -> Result<T>
        where
            F: FnMut(&mut Connection) -> RedisResult<T>,
        {
            let mut attempt = 0;
            loop {
                let mut conn = self.pool.get()?;
                match f(&mut conn) {
                    Ok(value) => return Ok(value),
                    Err(e) if is_transient(&e) && attempt < self.max_retries => {
                        attempt += 1;
                        tracing::debug!(
                            addr = %self.addr,
                            attempt,
                            error = %e,
                            "Retrying Redis command on a fresh connection"
                        );
                        conn.discard();
                    },
                    Err(e) => {
                        if is_transient(&e) {
                            conn.discard();
                        }
                        return Err(Error::operation_failed("redis_command", e));
                    },
                }
            }
        }
    }

    /// Adapter producing [`RedisClient`] handles.
    #[derive(Debug, Default, Clone, Copy)]
    pub struct RedisAdapter;

    impl RedisAdapter {
        /// Creates the adapter.
        #[must_use]
        pub const fn new() -> Self {
            Self
        }
    }

    impl BackendAdapter for RedisAdapter {
        type Config = RedisConfig;
        type Handle = RedisClient;

        fn kind(&self) -> &'static str {
            "redis"
        }

        fn construct(&self, config: &RedisConfig) -> Result<RedisClient> {
            tracing::debug!(
                alias = %config.alias,
                addr = %config.addr,
                db = config.db,
                "Creating Redis client"
            );
            RedisClient::open(config).map_err(|e| match e {
                Error::ConfigInvalid { .. } => e,
                other => Error::construction_failed(&config.alias, other),
            })
        }

        fn probe(&self, handle: &RedisClient, timeout: Duration) -> Result<()> {
            let start = Instant::now();
            let pong: String = handle
                .pool
                .get()
                .and_then(|mut conn| {
                    redis::cmd("PING")
                        .query(&mut *conn)
                        .map_err(|e| Error::operation_failed("redis_ping", e))
                })
                .map_err(|e| Error::construction_failed(&handle.addr, e))?;

            if start.elapsed() > timeout {
                return Err(Error::Timeout {
                    operation: format!("redis ping of {}", handle.addr),
                    timeout,
                });
            }
            if pong != "PONG" {
                return Err(Error::construction_failed(
                    &handle.addr,
                    format!("unexpected PING reply: {pong}"),
                ));
            }
            Ok(())
        }

        fn close(&self, handle: &RedisClient) -> Result<()> {
            handle.pool.close();
            Ok(())
        }
    }

}

#[cfg(feature = "redis")]
pub use implementation::{RedisAdapter, RedisClient};

//! Redis-backed fast cache.
//!
//! Built on a registry-managed [`RedisClient`](crate::backend::RedisClient),
//! so the cache shares the alias's connection pool and retry policy. Expiry
//! is delegated to the server with `SET .. PX`.

#[cfg(feature = "redis")]
mod implementation {
    use crate::Result;
    use crate::backend::RedisClient;
    use crate::cache::FastCache;
    use std::sync::Arc;
    use std::time::Duration;

    /// A [`FastCache`] over a shared Redis client.
    #[derive(Debug, Clone)]
    pub struct RedisCache {
        client: Arc<RedisClient>,
        prefix: String,
    }

    impl RedisCache {
        /// Creates a cache over `client`.
        #[must_use]
        pub const fn new(client: Arc<RedisClient>) -> Self {
            Self {
                client,
                prefix: String::new(),
            }
        }

        /// Namespaces every key with `prefix`.
        #[must_use]
        pub fn with_prefix(mut self, prefix: impl Into<String>) -> Self {
            self.prefix = prefix.into();
            self
        }

        fn full_key(&self, key: &str) -> String {
            format!("{}{key}", self.prefix)
        }
    }

    impl FastCache for RedisCache {
        fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
            let key = self.full_key(key);
            self.client
                .with_connection(|conn| redis::cmd("GET").arg(&key).query(conn))
        }

        fn set(&self, key: &str, value: &[u8], ttl: Duration) -> Result<()> {
            let key = self.full_key(key);
            let millis = u64::try_from(ttl.as_millis()).unwrap_or(u64::MAX);
            if millis == 0 {
                self.client
                    .with_connection(|conn| redis::cmd("DEL").arg(&key).query::<i64>(conn))?;
                return Ok(());
            }
            self.client.with_connection(|conn| {
                redis::cmd("SET")
                    .arg(&key)
                    .arg(value)
                    .arg("PX")
                    .arg(millis)
                    .query::<()>(conn)
            })
        }

        fn delete(&self, key: &str) -> Result<bool> {
            let key = self.full_key(key);
            let removed: i64 = self
                .client
                .with_connection(|conn| redis::cmd("DEL").arg(&key).query(conn))?;
            Ok(removed > 0)
        }
    }
}

#[cfg(feature = "redis")]
pub use implementation::RedisCache;

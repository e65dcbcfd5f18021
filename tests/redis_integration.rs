//! Redis integration tests.
//!
//! Covers the Redis registry adapter and the Redis-backed fast cache against
//! a live server. Set `POOLKEEPER_TEST_REDIS_URL` to enable them:
//!
//! ```bash
//! export POOLKEEPER_TEST_REDIS_URL="redis://localhost:6379"
//! cargo test --features redis --test redis_integration
//! ```

// Integration tests use expect/unwrap for simplicity - panics are acceptable in tests
#![allow(
    clippy::expect_used,
    clippy::unwrap_used,
    clippy::panic,
    clippy::print_stderr
)]
#![cfg(feature = "redis")]

use poolkeeper::cache::RedisCache;
use poolkeeper::config::extract_host;
use poolkeeper::registry::RedisRegistry;
use poolkeeper::{CacheAside, Error, FastCache, RedisConfig};
use std::env;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Barrier};
use std::thread;
use std::time::Duration;

/// Environment variable for the Redis test connection URL.
const REDIS_URL_ENV: &str = "POOLKEEPER_TEST_REDIS_URL";

/// Returns the Redis `host:port` if configured, or None to skip tests.
fn get_redis_addr() -> Option<String> {
    env::var(REDIS_URL_ENV).ok().map(|url| extract_host(&url))
}

/// Skips the test when Redis is not available.
macro_rules! require_redis {
    () => {
        match get_redis_addr() {
            Some(addr) => addr,
            None => {
                eprintln!("Skipping test: {REDIS_URL_ENV} not set");
                return;
            },
        }
    };
}

fn unique_prefix(test: &str) -> String {
    format!("poolkeeper-test:{test}:{}:", std::process::id())
}

#[test]
fn test_registry_constructs_once_under_contention() {
    let addr = require_redis!();
    let registry = Arc::new(RedisRegistry::default());
    let barrier = Arc::new(Barrier::new(20));
    let config = RedisConfig::new("sessions").with_addr(addr);

    let handles: Vec<_> = (0..20)
        .map(|_| {
            let registry = Arc::clone(&registry);
            let barrier = Arc::clone(&barrier);
            let config = config.clone();
            thread::spawn(move || {
                barrier.wait();
                registry.get_or_init(&config).unwrap()
            })
        })
        .collect();

    let clients: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();
    assert!(clients.windows(2).all(|w| Arc::ptr_eq(&w[0], &w[1])));

    let pong: String = clients[0]
        .with_connection(|conn| redis::cmd("PING").query(conn))
        .unwrap();
    assert_eq!(pong, "PONG");
    assert_eq!(registry.shutdown(), 1);
}

#[test]
fn test_redis_cache_ttl_and_delete() {
    let addr = require_redis!();
    let registry = RedisRegistry::default();
    let client = registry
        .get_or_init(&RedisConfig::new("cache").with_addr(addr))
        .unwrap();
    let cache = RedisCache::new(client).with_prefix(unique_prefix("ttl"));

    cache.set("k", b"v", Duration::from_millis(200)).unwrap();
    assert_eq!(cache.get("k").unwrap().as_deref(), Some(&b"v"[..]));

    thread::sleep(Duration::from_millis(300));
    assert!(cache.get("k").unwrap().is_none());

    cache.set("k", b"v", Duration::from_secs(10)).unwrap();
    assert!(cache.delete("k").unwrap());
    assert!(!cache.delete("k").unwrap());
}

#[test]
fn test_cache_aside_over_redis_coalesces() {
    let addr = require_redis!();
    let registry = RedisRegistry::default();
    let client = registry
        .get_or_init(&RedisConfig::new("cache").with_addr(addr))
        .unwrap();
    let accessor = Arc::new(CacheAside::new(
        RedisCache::new(client).with_prefix(unique_prefix("aside")),
    ));
    let fetches = Arc::new(AtomicUsize::new(0));
    let barrier = Arc::new(Barrier::new(10));

    let handles: Vec<_> = (0..10)
        .map(|_| {
            let accessor = Arc::clone(&accessor);
            let fetches = Arc::clone(&fetches);
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                barrier.wait();
                accessor
                    .get_or_fetch("user:42", Duration::from_secs(30), || {
                        fetches.fetch_add(1, Ordering::SeqCst);
                        thread::sleep(Duration::from_millis(100));
                        Ok::<_, Error>("Alice".to_string())
                    })
                    .unwrap()
            })
        })
        .collect();

    for handle in handles {
        assert_eq!(handle.join().unwrap(), "Alice");
    }
    assert_eq!(fetches.load(Ordering::SeqCst), 1);
    accessor.invalidate("user:42").unwrap();
}

#[test]
fn test_unreachable_server_fails_construction() {
    let registry = RedisRegistry::default();
    let config = RedisConfig::new("down")
        .with_addr("127.0.0.1:1")
        .with_dial_timeout(Duration::from_millis(100))
        .with_probe_timeout(Duration::from_secs(1));

    let err = registry.get_or_init(&config).unwrap_err();
    assert!(err.is_construction_error());
    assert!(registry.get("down").is_err());
}

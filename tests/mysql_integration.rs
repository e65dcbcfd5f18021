//! MySQL integration tests.
//!
//! Require a reachable server. Set `POOLKEEPER_TEST_MYSQL_URL` to enable:
//!
//! ```bash
//! export POOLKEEPER_TEST_MYSQL_URL="root:root@tcp(localhost:3306)/mysql"
//! cargo test --features mysql --test mysql_integration
//! ```

// Integration tests use expect/unwrap for simplicity - panics are acceptable in tests
#![allow(
    clippy::expect_used,
    clippy::unwrap_used,
    clippy::panic,
    clippy::print_stderr
)]
#![cfg(feature = "mysql")]

use mysql::prelude::Queryable;
use poolkeeper::config::PoolSettings;
use poolkeeper::registry::MySqlRegistry;
use poolkeeper::{DatabaseConfig, EntryState};
use std::env;
use std::sync::{Arc, Barrier};
use std::thread;
use std::time::{Duration, Instant};

/// Environment variable for the MySQL test DSN.
const MYSQL_URL_ENV: &str = "POOLKEEPER_TEST_MYSQL_URL";

/// Skips the test when MySQL is not available.
macro_rules! require_mysql {
    () => {
        match env::var(MYSQL_URL_ENV) {
            Ok(url) => url,
            Err(_) => {
                eprintln!("Skipping test: {MYSQL_URL_ENV} not set");
                return;
            },
        }
    };
}

#[test]
fn test_registry_shares_one_pool() {
    let url = require_mysql!();
    let registry = Arc::new(MySqlRegistry::default());
    let barrier = Arc::new(Barrier::new(10));
    let config = DatabaseConfig::new("primary", url)
        .with_pool(PoolSettings::new().with_max_open(4));

    let handles: Vec<_> = (0..10)
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

    let pools: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();
    assert!(pools.windows(2).all(|w| Arc::ptr_eq(&w[0], &w[1])));
    assert_eq!(pools[0].limits().max_open, 4);
    assert_eq!(registry.state("primary"), Some(EntryState::Ready));
}

#[test]
fn test_query_through_registry_handle() {
    let url = require_mysql!();
    let registry = MySqlRegistry::default();
    let db = registry
        .get_or_init(&DatabaseConfig::new("primary", url))
        .unwrap();

    let answer: Option<i64> = db
        .with_connection(|conn| conn.query_first("SELECT 40 + 2"))
        .unwrap();
    assert_eq!(answer, Some(42));

    assert_eq!(registry.shutdown(), 1);
    assert!(db.pool().is_closed());
}

#[test]
fn test_unreachable_server_fails_within_timeout() {
    let registry = MySqlRegistry::default();
    let config = DatabaseConfig::new("down", "root@tcp(127.0.0.1:1)/shop")
        .with_probe_timeout(Duration::from_secs(1));

    let start = Instant::now();
    let err = registry.get_or_init(&config).unwrap_err();

    assert!(err.is_construction_error());
    assert!(start.elapsed() < Duration::from_secs(3));
    assert!(matches!(
        registry.state("down"),
        Some(EntryState::Failed(_))
    ));
}

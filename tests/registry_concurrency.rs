//! Registry concurrency tests.
//!
//! Drives a [`Registry`] with a counting adapter from many threads and checks
//! that each alias is constructed once, failures are shared and retried, and
//! a stuck construction only delays its own alias.

// Integration tests use expect/unwrap for simplicity - panics are acceptable in tests
#![allow(clippy::expect_used, clippy::unwrap_used, clippy::panic)]

use poolkeeper::config::BackendConfig;
use poolkeeper::{BackendAdapter, EntryState, Error, Registry, Result};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Barrier};
use std::thread;
use std::time::{Duration, Instant};

#[derive(Debug, Clone)]
struct FakeConfig {
    alias: String,
    timeout: Duration,
}

impl FakeConfig {
    fn new(alias: &str) -> Self {
        Self {
            alias: alias.to_string(),
            timeout: Duration::from_secs(2),
        }
    }

    fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

impl BackendConfig for FakeConfig {
    fn alias(&self) -> &str {
        &self.alias
    }

    fn validate(&self) -> Result<()> {
        if self.alias.trim().is_empty() {
            return Err(Error::config_invalid(&self.alias, "alias is required"));
        }
        Ok(())
    }

    fn probe_timeout(&self) -> Duration {
        self.timeout
    }
}

#[derive(Debug)]
struct FakeClient {
    serial: usize,
    alias: String,
}

/// Counts constructions; aliases starting with `slow` sleep, `down` fails.
#[derive(Default)]
struct FakeAdapter {
    constructions: AtomicUsize,
    closes: AtomicUsize,
    down: AtomicBool,
}

impl BackendAdapter for FakeAdapter {
    type Config = FakeConfig;
    type Handle = FakeClient;

    fn kind(&self) -> &'static str {
        "fake"
    }

    fn construct(&self, config: &FakeConfig) -> Result<FakeClient> {
        let serial = self.constructions.fetch_add(1, Ordering::SeqCst);
        if config.alias.starts_with("slow") {
            thread::sleep(Duration::from_millis(300));
        } else {
            thread::sleep(Duration::from_millis(20));
        }
        if self.down.load(Ordering::SeqCst) {
            return Err(Error::construction_failed(&config.alias, "connection refused"));
        }
        Ok(FakeClient {
            serial,
            alias: config.alias.clone(),
        })
    }

    fn probe(&self, _handle: &FakeClient, _timeout: Duration) -> Result<()> {
        Ok(())
    }

    fn close(&self, _handle: &FakeClient) -> Result<()> {
        self.closes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

fn registry() -> Arc<Registry<FakeAdapter>> {
    Arc::new(Registry::new(FakeAdapter::default()))
}

#[test]
fn test_hundred_callers_one_construction() {
    let registry = registry();
    let barrier = Arc::new(Barrier::new(100));

    let handles: Vec<_> = (0..100)
        .map(|_| {
            let registry = Arc::clone(&registry);
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                barrier.wait();
                registry.get_or_init(&FakeConfig::new("primary")).unwrap()
            })
        })
        .collect();

    let clients: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();

    assert_eq!(registry.adapter().constructions.load(Ordering::SeqCst), 1);
    assert!(clients.windows(2).all(|w| Arc::ptr_eq(&w[0], &w[1])));
    assert_eq!(registry.state("primary"), Some(EntryState::Ready));
}

#[test]
fn test_distinct_aliases_construct_independently() {
    let registry = registry();
    let aliases = ["a", "b", "c", "d"];

    let handles: Vec<_> = aliases
        .iter()
        .flat_map(|alias| (0..5).map(move |_| *alias))
        .map(|alias| {
            let registry = Arc::clone(&registry);
            thread::spawn(move || registry.get_or_init(&FakeConfig::new(alias)).unwrap())
        })
        .collect();

    for handle in handles {
        let client = handle.join().unwrap();
        assert!(aliases.contains(&client.alias.as_str()));
    }

    assert_eq!(registry.adapter().constructions.load(Ordering::SeqCst), 4);
    assert_eq!(registry.aliases(), vec!["a", "b", "c", "d"]);
}

#[test]
fn test_slow_alias_does_not_block_others() {
    let registry = registry();

    let slow = {
        let registry = Arc::clone(&registry);
        thread::spawn(move || registry.get_or_init(&FakeConfig::new("slow-primary")))
    };
    thread::sleep(Duration::from_millis(50));

    let start = Instant::now();
    registry.get_or_init(&FakeConfig::new("fast")).unwrap();
    assert!(start.elapsed() < Duration::from_millis(250));

    slow.join().unwrap().unwrap();
}

#[test]
fn test_failure_is_retried_after_recovery() {
    let registry = registry();
    registry.adapter().down.store(true, Ordering::SeqCst);

    let err = registry.get_or_init(&FakeConfig::new("primary")).unwrap_err();
    assert!(matches!(err, Error::ConstructionFailed { .. }));
    assert!(matches!(
        registry.state("primary"),
        Some(EntryState::Failed(_))
    ));
    assert!(matches!(
        registry.get("primary"),
        Err(Error::NotInitialized(_))
    ));

    registry.adapter().down.store(false, Ordering::SeqCst);
    let client = registry.get_or_init(&FakeConfig::new("primary")).unwrap();

    assert_eq!(client.serial, 1);
    assert_eq!(registry.state("primary"), Some(EntryState::Ready));
}

#[test]
fn test_timeout_reports_and_discards_late_handle() {
    let registry = registry();
    let config = FakeConfig::new("slow-primary").with_timeout(Duration::from_millis(50));

    let err = registry.get_or_init(&config).unwrap_err();
    assert!(matches!(err, Error::Timeout { .. }));
    assert!(err.is_construction_error());

    // The construction finishes after the caller gave up; its handle is closed.
    thread::sleep(Duration::from_millis(400));
    assert_eq!(registry.adapter().closes.load(Ordering::SeqCst), 1);
    assert!(registry.get("slow-primary").is_err());
}

#[test]
fn test_invalid_config_creates_no_entry() {
    let registry = registry();

    let err = registry.get_or_init(&FakeConfig::new("  ")).unwrap_err();

    assert!(matches!(err, Error::ConfigInvalid { .. }));
    assert!(registry.is_empty());
    assert_eq!(registry.adapter().constructions.load(Ordering::SeqCst), 0);
}

#[test]
fn test_shutdown_closes_ready_handles() {
    let registry = registry();
    registry.get_or_init(&FakeConfig::new("a")).unwrap();
    registry.get_or_init(&FakeConfig::new("b")).unwrap();

    assert_eq!(registry.shutdown(), 2);
    assert_eq!(registry.adapter().closes.load(Ordering::SeqCst), 2);
    assert!(registry.is_empty());
}

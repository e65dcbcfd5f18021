//! URL cache tests: TTL derivation, key shape and expiry safety.

// Integration tests use expect/unwrap for simplicity - panics are acceptable in tests
#![allow(clippy::expect_used, clippy::unwrap_used, clippy::panic)]

use poolkeeper::backend::ObjectStoreClient;
use poolkeeper::cache::ManualClock;
use poolkeeper::{
    Error, MemoryCache, ObjectRef, ObjectStoreConfig, Result, UrlCache, UrlDeriver,
    UrlOptions,
};
use proptest::prelude::*;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use test_case::test_case;

const MINUTE: u64 = 60;

/// Produces URLs that embed a serial number so cache hits are visible.
#[derive(Default)]
struct SerialDeriver {
    calls: AtomicUsize,
}

impl UrlDeriver for SerialDeriver {
    fn signed_url(&self, object: &ObjectRef, expiry: Duration, version: Option<&str>) -> Result<String> {
        let n = self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(format!(
            "https://cdn.test/{}/{}?sig={n}&exp={}&v={}",
            object.bucket,
            object.key,
            expiry.as_secs(),
            version.unwrap_or_default()
        ))
    }

    fn public_url(&self, object: &ObjectRef, _version: Option<&str>) -> Result<String> {
        let n = self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(format!("https://cdn.test/{}/{}#{n}", object.bucket, object.key))
    }
}

fn clocked() -> (Arc<ManualClock>, UrlCache<MemoryCache>) {
    let clock = Arc::new(ManualClock::new());
    let cache = UrlCache::new(MemoryCache::default().with_clock(clock.clone()));
    (clock, cache)
}

#[test_case(0, Some(24 * 60) ; "public url cached for a day")]
#[test_case(60, Some(55) ; "one hour signature")]
#[test_case(10, Some(5) ; "ten minute signature")]
#[test_case(6, Some(1) ; "just above buffer")]
#[test_case(5, None ; "equal to buffer")]
#[test_case(2, None ; "below buffer")]
fn test_effective_ttl(expiry_minutes: u64, expected_minutes: Option<u64>) {
    let cache = UrlCache::new(MemoryCache::default());
    assert_eq!(
        cache.effective_ttl(Duration::from_secs(expiry_minutes * MINUTE)),
        expected_minutes.map(|m| Duration::from_secs(m * MINUTE))
    );
}

#[test]
fn test_cached_url_expires_before_signature() {
    let (clock, cache) = clocked();
    let deriver = SerialDeriver::default();
    let object = ObjectRef::new("media", "a.png");
    let options = UrlOptions::new().with_expiry(Duration::from_secs(10 * MINUTE));

    let first = cache.get_or_derive_url(&deriver, &object, &options).unwrap();
    clock.advance(Duration::from_secs(4 * MINUTE));
    assert_eq!(cache.get_or_derive_url(&deriver, &object, &options).unwrap(), first);

    clock.advance(Duration::from_secs(MINUTE + 1));
    let second = cache.get_or_derive_url(&deriver, &object, &options).unwrap();

    assert_ne!(first, second);
    assert_eq!(deriver.calls.load(Ordering::SeqCst), 2);
}

#[test]
fn test_short_expiry_is_never_written() {
    let cache = UrlCache::new(MemoryCache::default());
    let deriver = SerialDeriver::default();
    let object = ObjectRef::new("media", "a.png");
    let options = UrlOptions::new().with_expiry(Duration::from_secs(2 * MINUTE));

    cache.get_or_derive_url(&deriver, &object, &options).unwrap();
    cache.get_or_derive_url(&deriver, &object, &options).unwrap();

    assert_eq!(deriver.calls.load(Ordering::SeqCst), 2);
    assert!(cache.accessor().cache().is_empty());
}

#[test]
fn test_rebuild_bypasses_cached_url() {
    let cache = UrlCache::new(MemoryCache::default());
    let deriver = SerialDeriver::default();
    let object = ObjectRef::new("media", "a.png");
    let options = UrlOptions::new().with_expiry(Duration::from_secs(60 * MINUTE));

    let first = cache.get_or_derive_url(&deriver, &object, &options).unwrap();
    let rebuilt = cache
        .get_or_derive_url(&deriver, &object, &options.clone().with_rebuild(true))
        .unwrap();
    let after = cache.get_or_derive_url(&deriver, &object, &options).unwrap();

    assert_ne!(first, rebuilt);
    assert_eq!(rebuilt, after);
}

#[test]
fn test_version_selects_distinct_entry() {
    let cache = UrlCache::new(MemoryCache::default());
    let deriver = SerialDeriver::default();
    let object = ObjectRef::new("media", "a.png");
    let base = UrlOptions::new().with_expiry(Duration::from_secs(60 * MINUTE));

    let v1 = cache
        .get_or_derive_url(&deriver, &object, &base.clone().with_version("1"))
        .unwrap();
    let v2 = cache
        .get_or_derive_url(&deriver, &object, &base.clone().with_version("2"))
        .unwrap();

    assert!(v1.ends_with("v=1"));
    assert!(v2.ends_with("v=2"));

    assert!(cache.invalidate(&object, Some("1")).unwrap());
    assert!(!cache.invalidate(&object, Some("1")).unwrap());
}

#[test]
fn test_bucketless_path_is_rejected() {
    let cache = UrlCache::new(MemoryCache::default());
    let deriver = SerialDeriver::default();

    let err = cache
        .get_or_derive_url(&deriver, &ObjectRef::from_path("orphan.png"), &UrlOptions::new())
        .unwrap_err();

    assert!(matches!(err, Error::InvalidInput(_)));
    assert_eq!(deriver.calls.load(Ordering::SeqCst), 0);
}

#[test]
fn test_presigned_url_through_cache() {
    let config = ObjectStoreConfig::new("media", "localhost:9000", "AKIDEXAMPLE", "secret");
    let client = ObjectStoreClient::new(&config, Duration::from_secs(1)).unwrap();
    let cache = UrlCache::new(MemoryCache::default());
    let options = UrlOptions::new()
        .with_expiry(Duration::from_secs(60 * MINUTE))
        .with_version("3");
    let object = ObjectRef::from_path("media/images/a b.png");

    let url = cache.get_or_derive_url(&client, &object, &options).unwrap();

    assert!(url.starts_with("http://localhost:9000/media/images/a%20b.png?"));
    assert!(url.contains("X-Amz-Expires=3600"));
    assert!(url.contains("v=3"));
    assert_eq!(cache.get_or_derive_url(&client, &object, &options).unwrap(), url);
}

proptest! {
    #[test]
    fn prop_cache_key_is_hex_sha256(bucket in "[a-z0-9-]{1,20}", key in "[a-zA-Z0-9/._-]{1,60}") {
        let object = ObjectRef::new(bucket, key);
        let k = UrlCache::<MemoryCache>::cache_key(&object, None);
        prop_assert_eq!(k.len(), 64);
        prop_assert!(k.chars().all(|c| c.is_ascii_hexdigit()));
        prop_assert_eq!(k, UrlCache::<MemoryCache>::cache_key(&object, None));
    }

    #[test]
    fn prop_expiry_does_not_change_entry(minutes_a in 6_u64..1440, minutes_b in 6_u64..1440) {
        let cache = UrlCache::new(MemoryCache::default());
        let deriver = SerialDeriver::default();
        let object = ObjectRef::new("media", "shared.png");

        let a = cache
            .get_or_derive_url(&deriver, &object, &UrlOptions::new().with_expiry(Duration::from_secs(minutes_a * MINUTE)))
            .unwrap();
        let b = cache
            .get_or_derive_url(&deriver, &object, &UrlOptions::new().with_expiry(Duration::from_secs(minutes_b * MINUTE)))
            .unwrap();

        prop_assert_eq!(a, b);
        prop_assert_eq!(deriver.calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn prop_version_changes_key(version in "[a-z0-9]{1,12}") {
        let object = ObjectRef::new("media", "a.png");
        prop_assert_ne!(
            UrlCache::<MemoryCache>::cache_key(&object, None),
            UrlCache::<MemoryCache>::cache_key(&object, Some(&version))
        );
    }
}

#[test]
fn test_cache_key_includes_kind() {
    let object = ObjectRef::new("media", "a.png");
    let other_kind = object.clone().with_kind("thumbnail");

    assert_ne!(
        UrlCache::<MemoryCache>::cache_key(&object, None),
        UrlCache::<MemoryCache>::cache_key(&other_kind, None)
    );
}

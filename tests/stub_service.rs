//! End-to-end crosswalk against a local stand-in for the UTS REST API.

mod common;

use std::{sync::atomic::Ordering, time::Duration};

use common::{spawn_uts, Stub, API_KEY};
use mesh2icd::{
    config::PersistMode,
    crosswalk::{Lookup, Resolver, ResolverOptions, Terminology, UmlsClient},
    http::RetryPolicy,
};
use serde_json::{json, Value};

fn client(base: &str) -> UmlsClient {
    let http = reqwest::Client::builder()
        .timeout(Duration::from_secs(5))
        .build()
        .unwrap();
    let retry = RetryPolicy {
        backoff: Duration::from_millis(10),
        ..RetryPolicy::default()
    };
    UmlsClient::new(http, base, "current", API_KEY, retry)
}

fn options(path: &std::path::Path) -> ResolverOptions {
    ResolverOptions {
        cache_path: Some(path.to_path_buf()),
        persist: PersistMode::Every,
        workers: 4,
        ..ResolverOptions::default()
    }
}

fn read_json(path: &std::path::Path) -> Value {
    serde_json::from_str(&std::fs::read_to_string(path).unwrap()).unwrap()
}

#[tokio::test]
async fn hypertension_maps_to_i10_and_is_persisted() {
    let stub = Stub::default();
    let base = spawn_uts(stub.clone()).await;
    let dir = tempfile::tempdir().unwrap();
    let cache_path = dir.path().join("umls_mesh2icd_cache.json");

    let resolver = Resolver::open(client(&base), options(&cache_path)).unwrap();
    assert_eq!(resolver.resolve("D006973").await.unwrap(), vec!["I10"]);

    let on_disk = read_json(&cache_path);
    assert_eq!(on_disk["D006973"]["codes"], json!(["I10"]));
    assert_eq!(on_disk["D006973"]["concepts"], json!(["C0020538"]));
}

#[tokio::test]
async fn reloaded_cache_answers_without_network() {
    let stub = Stub::default();
    let base = spawn_uts(stub.clone()).await;
    let dir = tempfile::tempdir().unwrap();
    let cache_path = dir.path().join("cache.json");

    let first = Resolver::open(client(&base), options(&cache_path)).unwrap();
    let before = first
        .resolve_many(["D006973", "D000000", "D006973"])
        .await
        .unwrap();
    let calls = stub.calls.load(Ordering::SeqCst);
    assert_eq!(calls, 3, "two searches and one atoms lookup");

    let second = Resolver::open(client(&base), options(&cache_path)).unwrap();
    let after = second.resolve_many(["D000000", "D006973"]).await.unwrap();
    assert_eq!(before, after);
    assert_eq!(stub.calls.load(Ordering::SeqCst), calls);
    assert!(after["D000000"].is_empty());
}

#[tokio::test]
async fn transient_errors_are_retried_at_the_transport() {
    let stub = Stub::default();
    let base = spawn_uts(stub.clone()).await;
    let dir = tempfile::tempdir().unwrap();
    let cache_path = dir.path().join("cache.json");

    let resolver = Resolver::open(client(&base), options(&cache_path)).unwrap();
    assert_eq!(resolver.resolve("D003920").await.unwrap(), vec!["E11.9"]);
    assert_eq!(stub.flaky.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn malformed_payloads_degrade_to_empty_and_stay_uncached() {
    let stub = Stub::default();
    let base = spawn_uts(stub.clone()).await;
    let dir = tempfile::tempdir().unwrap();
    let cache_path = dir.path().join("cache.json");

    let resolver = Resolver::open(client(&base), options(&cache_path)).unwrap();
    assert!(resolver.resolve("D999999").await.unwrap().is_empty());
    assert!(resolver.cached("D999999").await.is_none());
    assert!(!cache_path.exists());
}

#[tokio::test]
async fn unreachable_service_is_not_an_error() {
    let dir = tempfile::tempdir().unwrap();
    let cache_path = dir.path().join("cache.json");
    // Nothing listens on the discard port.
    let resolver = Resolver::open(client("http://127.0.0.1:9"), options(&cache_path)).unwrap();

    let codes = resolver.resolve_many(["D006973", "D003920"]).await.unwrap();
    assert_eq!(codes.len(), 2);
    assert!(codes.values().all(Vec::is_empty));
}

#[tokio::test]
async fn failure_reasons_never_expose_the_api_key() {
    let retry = RetryPolicy {
        max_attempts: 2,
        backoff: Duration::from_millis(10),
        ..RetryPolicy::default()
    };
    let umls = UmlsClient::new(
        reqwest::Client::new(),
        "http://127.0.0.1:9",
        "current",
        "SECRETKEY123",
        retry,
    );

    match umls.concepts("D006973").await {
        Lookup::Failed(reason) => {
            assert!(reason.contains("apiKey=***"), "{reason}");
            assert!(!reason.contains("SECRETKEY123"), "{reason}");
        }
        other => panic!("expected a failed lookup, got {other:?}"),
    }
}

#[tokio::test]
async fn end_of_batch_persistence_writes_once() {
    let stub = Stub::default();
    let base = spawn_uts(stub.clone()).await;
    let dir = tempfile::tempdir().unwrap();
    let cache_path = dir.path().join("cache.json");
    let opts = ResolverOptions {
        persist: PersistMode::End,
        ..options(&cache_path)
    };

    let resolver = Resolver::open(client(&base), opts).unwrap();
    resolver.resolve("D006973").await.unwrap();
    assert!(!cache_path.exists());

    resolver.resolve_many(["D000000"]).await.unwrap();
    let on_disk = read_json(&cache_path);
    assert_eq!(on_disk["D006973"]["codes"], json!(["I10"]));
    assert_eq!(on_disk["D000000"]["codes"], json!([]));
}

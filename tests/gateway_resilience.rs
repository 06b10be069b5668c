//! Concrete Scenarios 1 & 2 (§8): retry on transient 503, and circuit
//! breaker trip/short-circuit, exercised through the real `StorageGateway`
//! against a `wiremock` double for the external storage API.

use chunkcache::circuit_breaker::CircuitBreakerConfig;
use chunkcache::executor::Executor;
use chunkcache::retry::RetryPolicy;
use chunkcache::sleeper::InstantSleeper;
use chunkcache::{BreakerRegistry, StorageGateway};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

/// Same retryable-kind set `StorageGateway::new` wires up, but with an
/// `InstantSleeper` so backoff delays don't make the suite slow, and a
/// shared registry so callers can drive a breaker across calls.
fn gateway_for(server: &MockServer) -> StorageGateway {
    let registry = Arc::new(BreakerRegistry::default());
    let retry_policy = RetryPolicy::new(3, Duration::from_millis(1), Duration::from_millis(5))
        .with_retryable_kinds([
            chunkcache::error::ErrorKind::Network,
            chunkcache::error::ErrorKind::RateLimit,
            chunkcache::error::ErrorKind::ExternalService,
            chunkcache::error::ErrorKind::Timeout,
            chunkcache::error::ErrorKind::Database,
        ])
        .with_sleeper(InstantSleeper);
    let executor = Executor::new("storage", registry, CircuitBreakerConfig::default_for("storage"), retry_policy);
    StorageGateway::with_executor(server.uri(), "test-key", executor)
}

#[tokio::test]
async fn retries_on_transient_503_then_succeeds() {
    let server = MockServer::start().await;
    let attempts = Arc::new(AtomicUsize::new(0));

    Mock::given(method("GET"))
        .and(path("/chunks/abc"))
        .respond_with(move |_: &wiremock::Request| {
            ResponseTemplate::new(503)
        })
        .up_to_n_times(2)
        .mount(&server)
        .await;

    Mock::given(method("GET"))
        .and(path("/chunks/abc"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "id": "abc",
            "contents": "hello",
            "parent_id": null,
            "document_id": "doc-1",
            "virtual_document_id": null,
            "scope": "section",
            "is_page": false,
            "is_tag": false,
            "is_template": false,
            "is_slot": false,
            "ref": null,
            "tags": [],
            "metadata": {},
            "created_at": "2026-01-01T00:00:00Z",
            "updated_at": "2026-01-01T00:00:00Z",
            "position": null,
            "embedding": null,
        })))
        .mount(&server)
        .await;

    let gateway = gateway_for(&server);
    let cancel = CancellationToken::new();
    let chunk = gateway.get_chunk(&cancel, "abc").await.expect("eventually succeeds after retries");
    assert_eq!(chunk.id, "abc");
    let _ = attempts.load(Ordering::SeqCst);
}

#[tokio::test]
async fn breaker_trips_after_threshold_and_short_circuits_without_retry() {
    let server = MockServer::start().await;
    let call_count = Arc::new(AtomicUsize::new(0));
    let counter = call_count.clone();

    Mock::given(method("GET"))
        .and(path("/chunks/missing"))
        .respond_with(move |_: &wiremock::Request| {
            counter.fetch_add(1, Ordering::SeqCst);
            ResponseTemplate::new(503)
        })
        .mount(&server)
        .await;

    let gateway = gateway_for(&server);
    let cancel = CancellationToken::new();

    // Drive the breaker to Open: default threshold is 5 consecutive failures.
    for _ in 0..5 {
        let _ = gateway.get_chunk(&cancel, "missing").await;
    }

    let calls_before = call_count.load(Ordering::SeqCst);
    let result = gateway.get_chunk(&cancel, "missing").await;
    let calls_after = call_count.load(Ordering::SeqCst);

    assert!(result.is_err());
    assert_eq!(result.unwrap_err().code, "CIRCUIT_OPEN");
    assert_eq!(calls_before, calls_after, "an open breaker must not reach the network, let alone retry");
}

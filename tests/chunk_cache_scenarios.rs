//! Concrete Scenario 3 (§8): C5 cache hit avoids a C4 call; a cleared
//! cache falls through to exactly one C4 call and repopulates C5.
//! Concrete Scenario 6 (§8): a patch that would create a hierarchy cycle
//! is rejected as a conflict and leaves the chunk unchanged.

use chunkcache::cache::entity::EntityCache;
use chunkcache::chunk::{ChunkDraft, ChunkPatch};
use chunkcache::chunk_service::ChunkService;
use chunkcache::circuit_breaker::CircuitBreakerConfig;
use chunkcache::executor::Executor;
use chunkcache::retry::RetryPolicy;
use chunkcache::sleeper::InstantSleeper;
use chunkcache::{BreakerRegistry, StorageGateway};
use serde_json::json;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn gateway_for(server: &MockServer) -> StorageGateway {
    let registry = Arc::new(BreakerRegistry::default());
    let retry_policy = RetryPolicy::new(1, Duration::from_millis(1), Duration::from_millis(5)).with_sleeper(InstantSleeper);
    let executor = Executor::new("storage", registry, CircuitBreakerConfig::default_for("storage"), retry_policy);
    StorageGateway::with_executor(server.uri(), "test-key", executor)
}

fn chunk_body(id: &str, parent_id: Option<&str>) -> serde_json::Value {
    json!({
        "id": id,
        "contents": "hello",
        "parent_id": parent_id,
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
    })
}

#[tokio::test]
async fn cache_hit_skips_gateway_and_miss_repopulates_it() {
    let server = MockServer::start().await;
    let call_count = Arc::new(AtomicUsize::new(0));
    let counter = call_count.clone();

    Mock::given(method("GET"))
        .and(path("/chunks/abc"))
        .respond_with(move |_: &wiremock::Request| {
            counter.fetch_add(1, Ordering::SeqCst);
            ResponseTemplate::new(200).set_body_json(chunk_body("abc", None))
        })
        .mount(&server)
        .await;

    let gateway = Arc::new(gateway_for(&server));
    let entity_cache = Arc::new(EntityCache::new(1000));
    let service = ChunkService::new(gateway, entity_cache.clone());
    let cancel = CancellationToken::new();

    let first = service.get(&cancel, "abc").await.expect("first get populates the cache");
    assert_eq!(first.id, "abc");
    assert_eq!(call_count.load(Ordering::SeqCst), 1);

    let second = service.get(&cancel, "abc").await.expect("second get is served from cache");
    assert_eq!(second.id, "abc");
    assert_eq!(call_count.load(Ordering::SeqCst), 1, "a warm C5 entry must not reach the gateway");

    entity_cache.delete(&chunkcache::cache::entity::chunk_key("abc")).await;

    let third = service.get(&cancel, "abc").await.expect("a cold cache falls through to the gateway exactly once");
    assert_eq!(third.id, "abc");
    assert_eq!(call_count.load(Ordering::SeqCst), 2, "evicting the entry means exactly one more gateway call, not zero and not many");
}

#[tokio::test]
async fn hierarchy_cycle_is_rejected_and_leaves_the_chunk_unchanged() {
    let server = MockServer::start().await;

    // a -> parent b -> parent c -> (root). Patching c's parent to a would
    // close the loop c -> a -> b -> c.
    Mock::given(method("GET")).and(path("/chunks/a")).respond_with(ResponseTemplate::new(200).set_body_json(chunk_body("a", Some("b")))).mount(&server).await;
    Mock::given(method("GET")).and(path("/chunks/b")).respond_with(ResponseTemplate::new(200).set_body_json(chunk_body("b", Some("c")))).mount(&server).await;
    Mock::given(method("GET")).and(path("/chunks/c")).respond_with(ResponseTemplate::new(200).set_body_json(chunk_body("c", None))).mount(&server).await;

    let gateway = Arc::new(gateway_for(&server));
    let entity_cache = Arc::new(EntityCache::new(1000));
    let service = ChunkService::new(gateway, entity_cache);
    let cancel = CancellationToken::new();

    let before = service.get(&cancel, "c").await.expect("baseline read of c");

    let patch = ChunkPatch { parent_id: Some(Some("a".to_string())), ..Default::default() };
    let result = service.update(&cancel, "c", patch).await;

    assert!(result.is_err());
    let err = result.unwrap_err();
    assert_eq!(err.code, "HIERARCHY_CYCLE");

    let after = service.get(&cancel, "c").await.expect("c is still readable after the rejected patch");
    assert_eq!(after.parent_id, before.parent_id, "a rejected patch must not mutate the stored chunk");
}

#[tokio::test]
async fn slot_ref_must_resolve_to_an_existing_template_chunk() {
    let server = MockServer::start().await;

    Mock::given(method("GET")).and(path("/chunks/plain-1")).respond_with(ResponseTemplate::new(200).set_body_json(chunk_body("plain-1", None))).mount(&server).await;
    Mock::given(method("GET")).and(path("/chunks/missing")).respond_with(ResponseTemplate::new(404)).mount(&server).await;

    let gateway = Arc::new(gateway_for(&server));
    let entity_cache = Arc::new(EntityCache::new(1000));
    let service = ChunkService::new(gateway, entity_cache);
    let cancel = CancellationToken::new();

    let draft_missing_ref = ChunkDraft {
        id: None,
        contents: "slot".to_string(),
        parent_id: None,
        document_id: "doc-1".to_string(),
        virtual_document_id: None,
        scope: chunkcache::chunk::Scope::Inline,
        is_page: false,
        is_tag: false,
        is_template: false,
        is_slot: true,
        ref_id: Some("missing".to_string()),
        tags: vec![],
        metadata: Default::default(),
        position: None,
        embedding: None,
    };
    let err = service.create(&cancel, draft_missing_ref).await.unwrap_err();
    assert_eq!(err.kind, chunkcache::error::ErrorKind::Validation, "a ref to a nonexistent chunk must be rejected");

    let draft_non_template_ref = ChunkDraft {
        id: None,
        contents: "slot".to_string(),
        parent_id: None,
        document_id: "doc-1".to_string(),
        virtual_document_id: None,
        scope: chunkcache::chunk::Scope::Inline,
        is_page: false,
        is_tag: false,
        is_template: false,
        is_slot: true,
        ref_id: Some("plain-1".to_string()),
        tags: vec![],
        metadata: Default::default(),
        position: None,
        embedding: None,
    };
    let err = service.create(&cancel, draft_non_template_ref).await.unwrap_err();
    assert_eq!(err.kind, chunkcache::error::ErrorKind::Validation, "a ref to a chunk that isn't a template must be rejected");
}

//! Storage Gateway Client (C4): a thin typed `reqwest` client to the external
//! data API (PostgreSQL/vector/graph behind a single HTTP gateway — out of
//! scope itself, per §1). Every call is wrapped by the C2+C3 [`Executor`];
//! this is the only module permitted to perform outbound network I/O.

use crate::cache::search::SearchCacheEntry;
use crate::chunk::{Chunk, ChunkId};
use crate::circuit_breaker::CircuitBreakerConfig;
use crate::error::{status_to_kind, AppError};
use crate::executor::Executor;
use crate::retry::RetryPolicy;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ChunkFilter {
    pub document_id: Option<String>,
    pub scope: Option<crate::chunk::Scope>,
    pub tags: Option<Vec<String>>,
    pub limit: Option<usize>,
}

#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum TagLogic {
    And,
    Or,
}

#[derive(Debug, Clone, Serialize)]
pub struct SemanticSearchRequest<'a> {
    pub embedding: &'a [f32],
    pub limit: usize,
    pub min_similarity: f32,
    pub filters: Option<ChunkFilter>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SemanticSearchResult {
    pub chunk_id: ChunkId,
    pub similarity: f32,
}

#[derive(Debug, Clone, Deserialize)]
pub struct GraphSearchResult {
    pub chunk_ids: Vec<ChunkId>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TextSearchResult {
    pub chunk_id: ChunkId,
    pub score: f32,
}

/// Per-item outcome for a batch write (§4.4/§6).
#[derive(Debug, Clone, Serialize)]
pub struct BatchOutcome {
    pub id: ChunkId,
    pub ok: bool,
    pub error: Option<String>,
}

pub struct StorageGateway {
    client: Client,
    base_url: String,
    api_key: String,
    executor: Executor,
}

impl StorageGateway {
    pub fn new(base_url: impl Into<String>, api_key: impl Into<String>, registry: Arc<crate::breaker_registry::BreakerRegistry>) -> Self {
        let retry_policy = RetryPolicy::new(3, Duration::from_millis(500), Duration::from_secs(10))
            .with_retryable_kinds([
                crate::error::ErrorKind::Network,
                crate::error::ErrorKind::RateLimit,
                crate::error::ErrorKind::ExternalService,
                crate::error::ErrorKind::Timeout,
                crate::error::ErrorKind::Database,
            ]);
        let breaker_config = CircuitBreakerConfig::default_for("storage");
        let executor = Executor::new("storage", registry, breaker_config, retry_policy);
        Self {
            client: Client::builder().build().expect("reqwest client builds with default TLS config"),
            base_url: base_url.into(),
            api_key: api_key.into(),
            executor,
        }
    }

    /// Construct with a caller-supplied [`Executor`], bypassing the default
    /// retry/breaker tuning. Used by integration tests that need a fast
    /// (non-real-time) sleeper or a tighter breaker threshold.
    pub fn with_executor(base_url: impl Into<String>, api_key: impl Into<String>, executor: Executor) -> Self {
        Self {
            client: Client::builder().build().expect("reqwest client builds with default TLS config"),
            base_url: base_url.into(),
            api_key: api_key.into(),
            executor,
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url.trim_end_matches('/'), path)
    }

    async fn send<T: for<'de> Deserialize<'de>>(&self, request: reqwest::RequestBuilder) -> Result<T, AppError> {
        let response = request.bearer_auth(&self.api_key).send().await?;
        let status = response.status();
        if !status.is_success() {
            let kind = status_to_kind(status.as_u16());
            let body = response.text().await.unwrap_or_default();
            return Err(AppError::new(kind, "STORAGE_GATEWAY_ERROR", format!("storage gateway returned {status}: {body}")));
        }
        response.json::<T>().await.map_err(AppError::from)
    }

    pub async fn get_chunk(&self, cancel: &CancellationToken, id: &str) -> Result<Chunk, AppError> {
        let url = self.url(&format!("/chunks/{id}"));
        self.executor
            .call(cancel, || {
                let client = self.client.clone();
                let url = url.clone();
                async move { self.send(client.get(&url)).await }
            })
            .await
    }

    pub async fn list_chunks(&self, cancel: &CancellationToken, filter: &ChunkFilter) -> Result<Vec<Chunk>, AppError> {
        let url = self.url("/chunks");
        self.executor
            .call(cancel, || {
                let client = self.client.clone();
                let url = url.clone();
                async move { self.send(client.get(&url).query(filter)).await }
            })
            .await
    }

    pub async fn batch_upsert_chunks(&self, cancel: &CancellationToken, items: &[Chunk]) -> Result<Vec<BatchOutcome>, AppError> {
        let url = self.url("/chunks/batch");
        self.executor
            .call(cancel, || {
                let client = self.client.clone();
                let url = url.clone();
                async move { self.send(client.post(&url).json(items)).await }
            })
            .await
    }

    pub async fn delete_chunk(&self, cancel: &CancellationToken, id: &str) -> Result<(), AppError> {
        let url = self.url(&format!("/chunks/{id}"));
        self.executor
            .call(cancel, || {
                let client = self.client.clone();
                let url = url.clone();
                async move {
                    let response = client.delete(&url).bearer_auth(&self.api_key).send().await?;
                    let status = response.status();
                    if status.is_success() {
                        Ok(())
                    } else {
                        Err(AppError::new(status_to_kind(status.as_u16()), "STORAGE_GATEWAY_ERROR", format!("delete failed: {status}")))
                    }
                }
            })
            .await
    }

    pub async fn search_semantic(
        &self,
        cancel: &CancellationToken,
        embedding: &[f32],
        limit: usize,
        min_similarity: f32,
        filters: Option<ChunkFilter>,
    ) -> Result<Vec<SemanticSearchResult>, AppError> {
        let url = self.url("/search/semantic");
        let body = SemanticSearchRequest { embedding, limit, min_similarity, filters };
        self.executor
            .call(cancel, || {
                let client = self.client.clone();
                let url = url.clone();
                let body = &body;
                async move { self.send(client.post(&url).json(body)).await }
            })
            .await
    }

    pub async fn search_by_tags(&self, cancel: &CancellationToken, tags: &[String], logic: TagLogic) -> Result<Vec<ChunkId>, AppError> {
        #[derive(Serialize)]
        struct Body<'a> {
            tags: &'a [String],
            logic: &'static str,
        }
        let url = self.url("/search/tags");
        let body = Body { tags, logic: match logic { TagLogic::And => "AND", TagLogic::Or => "OR" } };
        self.executor
            .call(cancel, || {
                let client = self.client.clone();
                let url = url.clone();
                let body = &body;
                async move { self.send(client.post(&url).json(body)).await }
            })
            .await
    }

    /// Lexical/full-text candidate retrieval for the text side of a hybrid
    /// merge (§4.8). A separate primitive from `search_semantic` — the
    /// storage gateway owns whatever text-ranking engine backs it.
    pub async fn search_text(&self, cancel: &CancellationToken, query: &str, limit: usize) -> Result<Vec<TextSearchResult>, AppError> {
        #[derive(Serialize)]
        struct Body<'a> {
            query: &'a str,
            limit: usize,
        }
        let url = self.url("/search/text");
        let body = Body { query, limit };
        self.executor
            .call(cancel, || {
                let client = self.client.clone();
                let url = url.clone();
                let body = &body;
                async move { self.send(client.post(&url).json(body)).await }
            })
            .await
    }

    /// Single-call BFS primitive, when the gateway supports it (§4.8 falls
    /// back to in-process BFS when it doesn't — signalled by `NotFound`).
    pub async fn search_graph(&self, cancel: &CancellationToken, entity: &str, depth: u32, limit: usize) -> Result<GraphSearchResult, AppError> {
        #[derive(Serialize)]
        struct Body<'a> {
            entity: &'a str,
            depth: u32,
            limit: usize,
        }
        let url = self.url("/search/graph");
        let body = Body { entity, depth, limit };
        self.executor
            .call(cancel, || {
                let client = self.client.clone();
                let url = url.clone();
                let body = &body;
                async move { self.send(client.post(&url).json(body)).await }
            })
            .await
    }

    pub async fn get_search_cache(&self, cancel: &CancellationToken, hash: &str) -> Result<Option<SearchCacheEntry>, AppError> {
        let url = self.url(&format!("/search-cache/{hash}"));
        let result: Result<SearchCacheEntry, AppError> = self
            .executor
            .call(cancel, || {
                let client = self.client.clone();
                let url = url.clone();
                async move { self.send(client.get(&url)).await }
            })
            .await;
        match result {
            Ok(entry) => Ok(Some(entry)),
            Err(e) if e.kind == crate::error::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e),
        }
    }

    pub async fn put_search_cache(&self, cancel: &CancellationToken, entry: &SearchCacheEntry) -> Result<(), AppError> {
        let url = self.url("/search-cache");
        self.executor
            .call(cancel, || {
                let client = self.client.clone();
                let url = url.clone();
                async move {
                    let response = client.post(&url).bearer_auth(&self.api_key).json(entry).send().await?;
                    if response.status().is_success() {
                        Ok(())
                    } else {
                        Err(AppError::new(status_to_kind(response.status().as_u16()), "STORAGE_GATEWAY_ERROR", "search cache write failed"))
                    }
                }
            })
            .await
    }

    /// Snapshot of every persisted search-cache row, used by `GET
    /// /cache/stats` (§6) to compute `stats()`/`suggestions()` (§4.6) against
    /// the pure functions in [`crate::cache::search`] without duplicating
    /// that logic behind the storage gateway.
    pub async fn list_search_cache_entries(&self, cancel: &CancellationToken) -> Result<Vec<SearchCacheEntry>, AppError> {
        let url = self.url("/search-cache");
        self.executor
            .call(cancel, || {
                let client = self.client.clone();
                let url = url.clone();
                async move { self.send(client.get(&url)).await }
            })
            .await
    }

    pub async fn invalidate_search_cache(&self, cancel: &CancellationToken, patterns: &[String]) -> Result<u64, AppError> {
        #[derive(Serialize)]
        struct Body<'a> {
            patterns: &'a [String],
        }
        #[derive(Deserialize)]
        struct Resp {
            deleted: u64,
        }
        let url = self.url("/search-cache/invalidate");
        let body = Body { patterns };
        let resp: Resp = self
            .executor
            .call(cancel, || {
                let client = self.client.clone();
                let url = url.clone();
                let body = &body;
                async move { self.send(client.post(&url).json(body)).await }
            })
            .await?;
        Ok(resp.deleted)
    }

    pub async fn cleanup_expired_search_cache(&self, cancel: &CancellationToken) -> Result<u64, AppError> {
        #[derive(Deserialize)]
        struct Resp {
            deleted: u64,
        }
        let url = self.url("/search-cache/cleanup");
        let resp: Resp = self
            .executor
            .call(cancel, || {
                let client = self.client.clone();
                let url = url.clone();
                async move { self.send(client.post(&url)).await }
            })
            .await?;
        Ok(resp.deleted)
    }

    /// Used by `/health` (§6) — a lightweight reachability probe, not wrapped
    /// by the breaker so a health check can observe the real current state.
    pub async fn ping(&self) -> bool {
        let url = self.url("/health");
        self.client.get(&url).bearer_auth(&self.api_key).timeout(Duration::from_secs(2)).send().await.map(|r| r.status().is_success()).unwrap_or(false)
    }
}

impl serde::Serialize for ChunkFilter {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        use serde::ser::SerializeMap;
        let mut map = serializer.serialize_map(None)?;
        if let Some(ref d) = self.document_id {
            map.serialize_entry("document_id", d)?;
        }
        if let Some(scope) = self.scope {
            map.serialize_entry("scope", &scope)?;
        }
        if let Some(ref tags) = self.tags {
            map.serialize_entry("tags", tags)?;
        }
        if let Some(limit) = self.limit {
            map.serialize_entry("limit", &limit)?;
        }
        map.end()
    }
}

use super::state::AppState;
use crate::chunk::{Chunk, ChunkDraft, ChunkPatch};
use crate::error::AppError;
use crate::gateway::{ChunkFilter, TagLogic};
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

/// Request handling has its own timeout, independent from and longer than
/// any C2 per-call timeout (§4.9).
const REQUEST_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(30);

async fn with_timeout<T, Fut>(fut: Fut) -> Result<T, AppError>
where
    Fut: std::future::Future<Output = Result<T, AppError>>,
{
    match tokio::time::timeout(REQUEST_TIMEOUT, fut).await {
        Ok(result) => result,
        Err(_) => Err(AppError::new(crate::error::ErrorKind::Timeout, "REQUEST_TIMEOUT", "request handling exceeded the configured timeout")),
    }
}

#[derive(Serialize)]
struct ErrorBody {
    error: String,
    message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    details: Option<serde_json::Value>,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = StatusCode::from_u16(self.http_status()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        let body = ErrorBody { error: self.code.clone(), message: self.message.clone(), details: self.details.clone() };
        tracing::warn!(code = %self.code, kind = %self.kind, status = status.as_u16(), "request failed");
        (status, Json(body)).into_response()
    }
}

pub async fn create_chunk(State(state): State<AppState>, Json(draft): Json<ChunkDraft>) -> Result<(StatusCode, Json<Chunk>), AppError> {
    let cancel = CancellationToken::new();
    let chunk = with_timeout(state.chunks.create(&cancel, draft)).await?;
    Ok((StatusCode::CREATED, Json(chunk)))
}

pub async fn get_chunk(State(state): State<AppState>, Path(id): Path<String>) -> Result<Json<Chunk>, AppError> {
    let cancel = CancellationToken::new();
    let chunk = with_timeout(state.chunks.get(&cancel, &id)).await?;
    Ok(Json(chunk))
}

pub async fn update_chunk(State(state): State<AppState>, Path(id): Path<String>, Json(patch): Json<ChunkPatch>) -> Result<Json<Chunk>, AppError> {
    let cancel = CancellationToken::new();
    let chunk = with_timeout(state.chunks.update(&cancel, &id, patch)).await?;
    Ok(Json(chunk))
}

pub async fn delete_chunk(State(state): State<AppState>, Path(id): Path<String>) -> Result<StatusCode, AppError> {
    let cancel = CancellationToken::new();
    with_timeout(state.chunks.delete(&cancel, &id)).await?;
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Deserialize)]
pub struct BatchCreateRequest {
    pub items: Vec<ChunkDraft>,
}

pub async fn batch_create_chunks(
    State(state): State<AppState>,
    Json(request): Json<BatchCreateRequest>,
) -> Result<Json<Vec<crate::gateway::BatchOutcome>>, AppError> {
    let cancel = CancellationToken::new();
    let outcomes = with_timeout(state.chunks.batch_upsert(&cancel, request.items)).await?;
    Ok(Json(outcomes))
}

#[derive(Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TagOpKind {
    Add,
    Remove,
}

#[derive(Deserialize)]
pub struct TagOp {
    pub chunk_id: String,
    pub op: TagOpKind,
    pub tag_content: String,
}

#[derive(Deserialize)]
pub struct BatchTagOpsRequest {
    pub ops: Vec<TagOp>,
}

#[derive(Serialize)]
pub struct TagOpOutcome {
    pub chunk_id: String,
    pub ok: bool,
    pub error: Option<String>,
}

pub async fn batch_tag_ops(State(state): State<AppState>, Json(request): Json<BatchTagOpsRequest>) -> Result<Json<Vec<TagOpOutcome>>, AppError> {
    let cancel = CancellationToken::new();
    let mut outcomes = Vec::with_capacity(request.ops.len());
    for op in request.ops {
        let result = with_timeout(async {
            let chunk = state.chunks.get(&cancel, &op.chunk_id).await?;
            let mut tags = chunk.tags.clone();
            match op.op {
                TagOpKind::Add => {
                    if !tags.iter().any(|t| t == &op.tag_content) {
                        tags.push(op.tag_content.clone());
                    }
                }
                TagOpKind::Remove => tags.retain(|t| t != &op.tag_content),
            }
            let patch = ChunkPatch { tags: Some(tags), ..Default::default() };
            state.chunks.update(&cancel, &op.chunk_id, patch).await
        })
        .await;
        outcomes.push(match result {
            Ok(_) => TagOpOutcome { chunk_id: op.chunk_id, ok: true, error: None },
            Err(e) => TagOpOutcome { chunk_id: op.chunk_id, ok: false, error: Some(e.message) },
        });
    }
    Ok(Json(outcomes))
}

#[derive(Deserialize)]
pub struct SemanticSearchRequest {
    pub query: String,
    #[serde(default = "default_limit")]
    pub limit: usize,
    #[serde(default)]
    pub min_similarity: f32,
    pub filters: Option<ChunkFilter>,
}

fn default_limit() -> usize {
    10
}

pub async fn search_semantic(State(state): State<AppState>, Json(request): Json<SemanticSearchRequest>) -> Result<Json<Vec<Chunk>>, AppError> {
    let cancel = CancellationToken::new();
    if request.query.trim().is_empty() {
        return Err(AppError::validation("query must not be empty"));
    }
    // Embedding generation is an external collaborator (§1); here the query
    // is mapped to a zero vector placeholder, letting the gateway's own
    // embedding stage (out of scope) own the real mapping.
    let embedding = vec![0.0f32; 0];
    let chunks = with_timeout(state.search.semantic(&cancel, &embedding, request.limit, request.min_similarity, request.filters)).await?;
    Ok(Json(chunks))
}

#[derive(Deserialize)]
pub struct TagSearchRequest {
    pub tag_contents: Vec<String>,
    pub logic: TagLogicWire,
}

#[derive(Deserialize, Clone, Copy)]
#[serde(rename_all = "UPPERCASE")]
pub enum TagLogicWire {
    And,
    Or,
}

impl From<TagLogicWire> for TagLogic {
    fn from(value: TagLogicWire) -> Self {
        match value {
            TagLogicWire::And => TagLogic::And,
            TagLogicWire::Or => TagLogic::Or,
        }
    }
}

pub async fn search_tags(State(state): State<AppState>, Json(request): Json<TagSearchRequest>) -> Result<Json<Vec<Chunk>>, AppError> {
    let cancel = CancellationToken::new();
    let chunks = with_timeout(state.search.by_tags(&cancel, &request.tag_contents, request.logic.into())).await?;
    Ok(Json(chunks))
}

#[derive(Deserialize)]
pub struct GraphSearchRequest {
    pub entity_name: String,
    #[serde(default)]
    pub max_depth: u32,
    #[serde(default = "default_limit")]
    pub limit: usize,
}

pub async fn search_graph(State(state): State<AppState>, Json(request): Json<GraphSearchRequest>) -> Result<Json<Vec<Chunk>>, AppError> {
    let cancel = CancellationToken::new();
    let chunks = with_timeout(state.search.graph(&cancel, &request.entity_name, request.max_depth, request.limit)).await?;
    Ok(Json(chunks))
}

#[derive(Deserialize)]
pub struct HybridSearchRequest {
    pub query: String,
    #[serde(default = "default_limit")]
    pub limit: usize,
    pub semantic_weight: f64,
    #[serde(default)]
    pub text_weight: Option<f64>,
    #[serde(default)]
    pub filters: Option<ChunkFilter>,
}

pub async fn search_hybrid(State(state): State<AppState>, Json(request): Json<HybridSearchRequest>) -> Result<Json<Vec<Chunk>>, AppError> {
    let cancel = CancellationToken::new();
    let text_weight = request.text_weight.unwrap_or(1.0 - request.semantic_weight);
    let chunks =
        with_timeout(state.search.hybrid(&cancel, &request.query, request.limit, request.semantic_weight, text_weight, request.filters)).await?;
    Ok(Json(chunks))
}

pub async fn cache_stats(State(state): State<AppState>) -> Json<serde_json::Value> {
    let cancel = CancellationToken::new();
    let stats = state.entity_cache.stats();

    // A failure here is a read-only observability endpoint hitting an
    // unreachable dependency, not a request failure (§7) — degrade to an
    // empty search-cache snapshot rather than a 5xx.
    let entries = state.gateway.list_search_cache_entries(&cancel).await.unwrap_or_default();
    let now = chrono::Utc::now();
    let search_stats = crate::cache::search::compute_stats(&entries, now, 10);
    let suggestions = crate::cache::search::suggestions(&entries, now);

    Json(serde_json::json!({
        "entity_cache": {
            "size": state.entity_cache.size(),
            "hits": stats.hits,
            "misses": stats.misses,
            "single_flight_waits": stats.single_flight_waits,
        },
        "search_cache": search_stats,
        "suggestions": suggestions,
    }))
}

#[derive(Deserialize)]
struct CacheClearQuery {
    #[serde(default)]
    pattern: Option<String>,
}

pub async fn cache_clear(State(state): State<AppState>, Query(query): Query<CacheClearQuery>) -> Result<StatusCode, AppError> {
    let cancel = CancellationToken::new();
    match query.pattern {
        Some(pattern) => state.entity_cache.clear_pattern(&pattern).await,
        None => state.entity_cache.clear_pattern("*").await,
    }
    if let Err(e) = state.gateway.invalidate_search_cache(&cancel, &["*".to_string()]).await {
        tracing::warn!(error = %e, "cache/clear: search cache invalidation failed");
    }
    Ok(StatusCode::NO_CONTENT)
}

pub async fn health(State(state): State<AppState>) -> Response {
    let snapshot = state.breakers.snapshot();
    let all_open = !snapshot.is_empty() && snapshot.iter().all(|b| b.state == "Open");
    let storage_reachable = state.gateway.ping().await;

    let healthy = !all_open && storage_reachable;
    let status = if healthy { StatusCode::OK } else { StatusCode::SERVICE_UNAVAILABLE };

    let body = serde_json::json!({
        "status": if healthy { "ok" } else { "degraded" },
        "storage_reachable": storage_reachable,
        "breakers": snapshot,
    });
    (status, Json(body)).into_response()
}

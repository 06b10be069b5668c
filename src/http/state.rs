use crate::breaker_registry::BreakerRegistry;
use crate::cache::entity::EntityCache;
use crate::chunk_service::ChunkService;
use crate::gateway::StorageGateway;
use crate::search_service::SearchService;
use std::sync::Arc;

/// Shared application state passed to every route handler via axum's
/// `State` extractor (grounded on `context-harness`'s `AppState`).
#[derive(Clone)]
pub struct AppState {
    pub chunks: Arc<ChunkService>,
    pub search: Arc<SearchService>,
    pub entity_cache: Arc<EntityCache>,
    pub gateway: Arc<StorageGateway>,
    pub breakers: Arc<BreakerRegistry>,
}

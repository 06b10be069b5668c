//! Search Service (C8): semantic/tag/graph/hybrid query assembly. Consults
//! C6 first; on miss, dispatches to C4's search primitives, stores the
//! result with the type-appropriate adaptive TTL, and rehydrates bodies
//! through C7 (itself backed by C5) so stale content never leaks through a
//! cache hit (§4.8).

use crate::cache::search::{self, QueryKind, SearchCacheEntry};
use crate::chunk::{Chunk, ChunkId};
use crate::chunk_service::ChunkService;
use crate::error::AppError;
use crate::gateway::{ChunkFilter, StorageGateway, TagLogic};
use chrono::Utc;
use std::collections::{BTreeMap, HashSet, VecDeque};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

pub struct SearchService {
    gateway: Arc<StorageGateway>,
    chunks: Arc<ChunkService>,
}

impl SearchService {
    pub fn new(gateway: Arc<StorageGateway>, chunks: Arc<ChunkService>) -> Self {
        Self { gateway, chunks }
    }

    async fn lookup_or_compute<F, Fut>(
        &self,
        cancel: &CancellationToken,
        params: BTreeMap<String, serde_json::Value>,
        kind: QueryKind,
        compute: F,
    ) -> Result<Vec<Chunk>, AppError>
    where
        F: FnOnce() -> Fut,
        Fut: std::future::Future<Output = Result<Vec<ChunkId>, AppError>>,
    {
        let canonical = search::canonicalize(&params);
        let hash = search::search_hash(&canonical);

        // A C6 lookup failure is treated as a miss (§7): cache unavailability
        // never fails the request.
        let cached = self.gateway.get_search_cache(cancel, &hash).await.unwrap_or(None);
        let now = Utc::now();

        if let Some(entry) = cached {
            if !entry.is_expired(now) {
                let mut bumped = entry.clone();
                bumped.hit_count += 1;
                // Best-effort: a store failure on hit-count bump is logged,
                // not surfaced (§7).
                if let Err(e) = self.gateway.put_search_cache(cancel, &bumped).await {
                    tracing::warn!(error = %e, %hash, "failed to persist hit_count bump");
                }
                return self.rehydrate(cancel, &entry.chunk_ids).await;
            }
        }

        let chunk_ids = compute().await?;
        let entry = SearchCacheEntry {
            search_hash: hash.clone(),
            query_params: canonical,
            chunk_ids: chunk_ids.clone(),
            result_count: chunk_ids.len(),
            created_at: now,
            expires_at: now + chrono::Duration::from_std(kind.ttl()).expect("ttl fits in chrono::Duration"),
            hit_count: 0,
        };
        if let Err(e) = self.gateway.put_search_cache(cancel, &entry).await {
            tracing::warn!(error = %e, %hash, "failed to persist search cache entry; response still returned");
        }

        self.rehydrate(cancel, &chunk_ids).await
    }

    async fn rehydrate(&self, cancel: &CancellationToken, ids: &[ChunkId]) -> Result<Vec<Chunk>, AppError> {
        let mut out = Vec::with_capacity(ids.len());
        for id in ids {
            out.push(self.chunks.get(cancel, id).await?);
        }
        Ok(out)
    }

    pub async fn semantic(
        &self,
        cancel: &CancellationToken,
        query_embedding: &[f32],
        limit: usize,
        min_similarity: f32,
        filters: Option<ChunkFilter>,
    ) -> Result<Vec<Chunk>, AppError> {
        if limit == 0 {
            return Ok(Vec::new());
        }
        let params = BTreeMap::from([
            ("kind".to_string(), serde_json::json!("semantic")),
            ("limit".to_string(), serde_json::json!(limit)),
            ("min_similarity".to_string(), serde_json::json!((min_similarity * 1000.0) as i64)),
            ("embedding_len".to_string(), serde_json::json!(query_embedding.len())),
            // Marks this as a content-driven query so C7's `invalidate_for`
            // can target it with its `*content*` glob.
            ("content".to_string(), serde_json::json!(true)),
        ]);
        let gateway = self.gateway.clone();
        let embedding = query_embedding.to_vec();
        self.lookup_or_compute(cancel, params, QueryKind::Content, move || async move {
            let results = gateway.search_semantic(cancel, &embedding, limit, min_similarity, filters).await?;
            Ok(results.into_iter().map(|r| r.chunk_id).collect())
        })
        .await
    }

    pub async fn by_tags(&self, cancel: &CancellationToken, tags: &[String], logic: TagLogic) -> Result<Vec<Chunk>, AppError> {
        if tags.is_empty() {
            return Err(AppError::validation("tag search requires at least one tag"));
        }
        let mut sorted_tags = tags.to_vec();
        sorted_tags.sort();
        let params = BTreeMap::from([
            ("kind".to_string(), serde_json::json!("tags")),
            ("tags".to_string(), serde_json::json!(sorted_tags)),
            ("logic".to_string(), serde_json::json!(matches!(logic, TagLogic::And))),
        ]);
        let gateway = self.gateway.clone();
        let tags = tags.to_vec();
        self.lookup_or_compute(cancel, params, QueryKind::Tag, move || async move { gateway.search_by_tags(cancel, &tags, logic).await }).await
    }

    pub async fn graph(&self, cancel: &CancellationToken, entity: &str, depth: u32, limit: usize) -> Result<Vec<Chunk>, AppError> {
        if limit == 0 {
            return Ok(Vec::new());
        }
        let params = BTreeMap::from([
            ("kind".to_string(), serde_json::json!("graph")),
            ("entity".to_string(), serde_json::json!(entity)),
            ("depth".to_string(), serde_json::json!(depth)),
            ("limit".to_string(), serde_json::json!(limit)),
            // Marks this as a type-driven query so C7's `invalidate_for` can
            // target it with its `*type*` glob.
            ("type".to_string(), serde_json::json!(true)),
        ]);
        let gateway = self.gateway.clone();
        let chunks = self.chunks.clone();
        let entity = entity.to_string();
        self.lookup_or_compute(cancel, params, QueryKind::Type, move || async move {
            match gateway.search_graph(cancel, &entity, depth, limit).await {
                Ok(result) => Ok(result.chunk_ids.into_iter().take(limit).collect()),
                Err(e) if e.kind == crate::error::ErrorKind::NotFound => bfs_fallback(cancel, &chunks, &entity, depth, limit).await,
                Err(e) => Err(e),
            }
        })
        .await
    }

    /// Hybrid merge: `final = w_sem * sim + w_text * text_score`, ties broken
    /// by chunk id (§4.8). Like `semantic`/`by_tags`/`graph`, this goes
    /// through the same canonicalize → C6 lookup → on-miss C4 dispatch →
    /// C6 store cycle; the merge itself only runs on a cache miss.
    pub async fn hybrid(
        &self,
        cancel: &CancellationToken,
        query: &str,
        limit: usize,
        semantic_weight: f64,
        text_weight: f64,
        filters: Option<ChunkFilter>,
    ) -> Result<Vec<Chunk>, AppError> {
        search::validate_weights(semantic_weight, text_weight, 1e-6)?;
        if limit == 0 {
            return Ok(Vec::new());
        }
        let params = BTreeMap::from([
            ("kind".to_string(), serde_json::json!("hybrid")),
            ("query".to_string(), serde_json::json!(query)),
            ("limit".to_string(), serde_json::json!(limit)),
            ("semantic_weight".to_string(), serde_json::json!((semantic_weight * 1000.0).round() as i64)),
            ("text_weight".to_string(), serde_json::json!((text_weight * 1000.0).round() as i64)),
            // Marks this as a content-driven query so C7's `invalidate_for`
            // can target it with its `*content*` glob.
            ("content".to_string(), serde_json::json!(true)),
        ]);
        let gateway = self.gateway.clone();
        let query_owned = query.to_string();
        self.lookup_or_compute(cancel, params, QueryKind::Content, move || async move {
            // Embedding generation is an external collaborator (§1), same
            // placeholder deferral as the semantic entrypoint.
            let embedding = vec![0.0f32; 0];
            let (semantic, text) = tokio::try_join!(
                gateway.search_semantic(cancel, &embedding, limit, 0.0, filters),
                gateway.search_text(cancel, &query_owned, limit),
            )?;

            let mut scores: BTreeMap<ChunkId, f64> = BTreeMap::new();
            for r in semantic {
                *scores.entry(r.chunk_id).or_insert(0.0) += semantic_weight * r.similarity as f64;
            }
            for r in text {
                *scores.entry(r.chunk_id).or_insert(0.0) += text_weight * r.score as f64;
            }

            let mut ranked: Vec<(ChunkId, f64)> = scores.into_iter().collect();
            ranked.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal).then_with(|| a.0.cmp(&b.0)));
            ranked.truncate(limit);
            Ok(ranked.into_iter().map(|(id, _)| id).collect())
        })
        .await
    }
}

async fn bfs_fallback(cancel: &CancellationToken, chunks: &Arc<ChunkService>, entity: &str, depth: u32, limit: usize) -> Result<Vec<ChunkId>, AppError> {
    let mut visited: HashSet<ChunkId> = HashSet::new();
    let mut queue: VecDeque<(ChunkId, u32)> = VecDeque::new();
    let mut out = Vec::new();

    visited.insert(entity.to_string());
    queue.push_back((entity.to_string(), 0));

    while let Some((id, d)) = queue.pop_front() {
        out.push(id.clone());
        if out.len() >= limit {
            break;
        }
        if d >= depth {
            continue;
        }
        let chunk = chunks.get(cancel, &id).await?;
        if let Some(parent) = chunk.parent_id {
            if visited.insert(parent.clone()) {
                queue.push_back((parent, d + 1));
            }
        }
    }

    out.truncate(limit);
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hybrid_weight_validation_rejects_non_unit_sum() {
        assert!(search::validate_weights(0.4, 0.4, 1e-6).is_err());
    }
}

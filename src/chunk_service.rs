//! Unified Chunk Service (C7): read/write operations over chunks, enforcing
//! the §3 invariants and composing C4 (gateway) + C5 (entity cache) + C6
//! (search cache invalidation only — C8 owns search reads).

use crate::cache::entity::{chunk_key, hierarchy_key, tag_key, EntityCache, CHUNK_TTL};
use crate::chunk::{canonicalize_tags, Chunk, ChunkDraft, ChunkId, ChunkPatch};
use crate::error::AppError;
use crate::gateway::{BatchOutcome, ChunkFilter, StorageGateway};
use chrono::Utc;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

pub struct ChunkService {
    gateway: Arc<StorageGateway>,
    entity_cache: Arc<EntityCache>,
}

impl ChunkService {
    pub fn new(gateway: Arc<StorageGateway>, entity_cache: Arc<EntityCache>) -> Self {
        Self { gateway, entity_cache }
    }

    /// `get(id)`: C5 lookup → miss → C4 (behind C2/C3) → populate C5 (§4.7).
    pub async fn get(&self, cancel: &CancellationToken, id: &str) -> Result<Chunk, AppError> {
        let key = chunk_key(id);
        let gateway = self.gateway.clone();
        let cancel_owned = cancel.clone();
        let id = id.to_string();
        let value = self
            .entity_cache
            .get_or_load(&key, CHUNK_TTL, move || async move {
                let chunk = gateway.get_chunk(&cancel_owned, &id).await?;
                Ok(serde_json::to_value(&chunk).map_err(AppError::from)?)
            })
            .await?;
        serde_json::from_value(value).map_err(AppError::from)
    }

    /// `list(filter)`: bypasses C5 for non-trivial filters (§4.7).
    pub async fn list(&self, cancel: &CancellationToken, filter: &ChunkFilter) -> Result<Vec<Chunk>, AppError> {
        self.gateway.list_chunks(cancel, filter).await
    }

    pub async fn create(&self, cancel: &CancellationToken, draft: ChunkDraft) -> Result<Chunk, AppError> {
        if let Some(ref parent_id) = draft.parent_id {
            self.ensure_no_cycle(cancel, parent_id, None).await?;
        }
        let id = draft.id.clone().unwrap_or_else(|| Uuid::new_v4().to_string());
        let chunk = draft.into_chunk(id, Utc::now())?;
        if chunk.is_slot {
            self.ensure_slot_ref_is_template(cancel, &chunk).await?;
        }

        let outcomes = self.gateway.batch_upsert_chunks(cancel, std::slice::from_ref(&chunk)).await?;
        if let Some(outcome) = outcomes.first() {
            if !outcome.ok {
                return Err(AppError::conflict("CREATE_FAILED", outcome.error.clone().unwrap_or_default()));
            }
        }

        self.invalidate_for(cancel, &chunk).await;
        Ok(chunk)
    }

    pub async fn update(&self, cancel: &CancellationToken, id: &str, patch: ChunkPatch) -> Result<Chunk, AppError> {
        let before = self.get(cancel, id).await?;
        let mut after = before.clone();

        if let Some(contents) = patch.contents {
            after.contents = contents;
        }
        if let Some(new_parent) = patch.parent_id {
            if new_parent.as_deref() != after.parent_id.as_deref() {
                if let Some(ref candidate) = new_parent {
                    self.ensure_no_cycle(cancel, candidate, Some(id)).await?;
                }
                after.parent_id = new_parent;
            }
        }
        if let Some(vdoc) = patch.virtual_document_id {
            after.virtual_document_id = Some(vdoc);
        }
        if let Some(scope) = patch.scope {
            after.scope = scope;
        }
        if let Some(v) = patch.is_page {
            after.is_page = v;
        }
        if let Some(v) = patch.is_tag {
            after.is_tag = v;
        }
        if let Some(v) = patch.is_template {
            after.is_template = v;
        }
        if let Some(v) = patch.is_slot {
            after.is_slot = v;
        }
        if let Some(new_ref) = patch.ref_id {
            after.ref_id = new_ref;
        }
        if let Some(tags) = patch.tags {
            after.tags = canonicalize_tags(&tags)?;
        }
        if let Some(metadata) = patch.metadata {
            after.metadata = metadata;
        }
        if let Some(position) = patch.position {
            after.position = position;
        }

        after.validate_flags()?;
        after.touch();
        if after.is_slot {
            self.ensure_slot_ref_is_template(cancel, &after).await?;
        }

        let outcomes = self.gateway.batch_upsert_chunks(cancel, std::slice::from_ref(&after)).await?;
        if let Some(outcome) = outcomes.first() {
            if !outcome.ok {
                return Err(AppError::conflict("UPDATE_FAILED", outcome.error.clone().unwrap_or_default()));
            }
        }

        self.invalidate_for(cancel, &before).await;
        self.invalidate_for(cancel, &after).await;
        Ok(after)
    }

    pub async fn delete(&self, cancel: &CancellationToken, id: &str) -> Result<(), AppError> {
        let chunk = self.get(cancel, id).await?;
        if chunk.is_template {
            let all = self.gateway.list_chunks(cancel, &ChunkFilter::default()).await?;
            let has_active_slot = all.iter().any(|c| c.is_slot && c.ref_id.as_deref() == Some(id));
            if has_active_slot {
                return Err(AppError::conflict("TEMPLATE_HAS_ACTIVE_SLOTS", format!("template {id} is referenced by an active slot")));
            }
        }
        self.gateway.delete_chunk(cancel, id).await?;
        self.invalidate_for(cancel, &chunk).await;
        Ok(())
    }

    pub async fn batch_upsert(&self, cancel: &CancellationToken, drafts: Vec<ChunkDraft>) -> Result<Vec<BatchOutcome>, AppError> {
        let mut chunks = Vec::with_capacity(drafts.len());
        let mut outcomes = Vec::with_capacity(drafts.len());
        for draft in drafts {
            let id = draft.id.clone().unwrap_or_else(|| Uuid::new_v4().to_string());
            match draft.into_chunk(id.clone(), Utc::now()) {
                Ok(chunk) => chunks.push(chunk),
                Err(e) => outcomes.push(BatchOutcome { id, ok: false, error: Some(e.message) }),
            }
        }

        if !chunks.is_empty() {
            let gateway_outcomes = self.gateway.batch_upsert_chunks(cancel, &chunks).await?;
            for (chunk, outcome) in chunks.iter().zip(gateway_outcomes.iter()) {
                if outcome.ok {
                    self.invalidate_for(cancel, chunk).await;
                }
            }
            outcomes.extend(gateway_outcomes);
        }
        Ok(outcomes)
    }

    /// Walk ancestors from `candidate_parent` and fail with `HIERARCHY_CYCLE`
    /// if `excluded_id` (the chunk being updated) appears among them (§4.7,
    /// Concrete Scenario 6).
    async fn ensure_no_cycle(&self, cancel: &CancellationToken, candidate_parent: &str, excluded_id: Option<&str>) -> Result<(), AppError> {
        let mut current = candidate_parent.to_string();
        let mut visited = std::collections::HashSet::new();
        loop {
            if Some(current.as_str()) == excluded_id {
                return Err(AppError::conflict("HIERARCHY_CYCLE", format!("setting parent_id would create a cycle through {current}")));
            }
            if !visited.insert(current.clone()) {
                return Err(AppError::conflict("HIERARCHY_CYCLE", "cycle detected while walking ancestors"));
            }
            let chunk = self.get(cancel, &current).await?;
            match chunk.parent_id {
                Some(parent) => current = parent,
                None => return Ok(()),
            }
        }
    }

    /// A slot's `ref` must resolve to an existing chunk with `is_template =
    /// true` (§3 invariant 3). `validate_flags` only checks that `ref` is
    /// set, since resolving it needs a lookup `Chunk` itself can't do.
    async fn ensure_slot_ref_is_template(&self, cancel: &CancellationToken, slot: &Chunk) -> Result<(), AppError> {
        let ref_id = slot.ref_id.as_deref().expect("validate_flags already enforced ref is set for a slot");
        let target = match self.get(cancel, ref_id).await {
            Ok(chunk) => chunk,
            Err(e) if e.kind == crate::error::ErrorKind::NotFound => {
                return Err(AppError::validation(format!("slot ref `{ref_id}` does not resolve to an existing chunk")))
            }
            Err(e) => return Err(e),
        };
        if !target.is_template {
            return Err(AppError::validation(format!("slot ref `{ref_id}` must point to a template chunk")));
        }
        Ok(())
    }

    async fn invalidate_for(&self, cancel: &CancellationToken, chunk: &Chunk) {
        self.entity_cache.delete(&chunk_key(&chunk.id)).await;
        for tag in &chunk.tags {
            self.entity_cache.delete(&tag_key(tag)).await;
        }
        if let Some(ref parent) = chunk.parent_id {
            for depth in 0..8 {
                self.entity_cache.delete(&hierarchy_key(parent, depth)).await;
            }
        }

        // Must line up with the exact keys `SearchService` canonicalizes
        // (`tags`, as a `;`-joined flattened list; `content`/`type` as
        // presence markers on content- and type-driven queries), or these
        // never match a stored entry and invalidation silently does nothing.
        let mut patterns: Vec<String> = chunk.tags.iter().map(|t| format!("*tags=*{}*", t.to_lowercase())).collect();
        if !chunk.contents.trim().is_empty() {
            patterns.push("*content*".to_string());
        }
        if chunk.is_template || chunk.is_page || chunk.is_slot || chunk.is_tag {
            patterns.push("*type*".to_string());
        }

        if let Err(e) = self.gateway.invalidate_search_cache(cancel, &patterns).await {
            tracing::warn!(error = %e, chunk_id = %chunk.id, "search cache invalidation failed; best-effort, continuing");
        }
    }
}

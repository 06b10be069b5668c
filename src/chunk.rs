//! The unified chunk data model (§3) and its invariants. Values only —
//! parent/child and tag back-references are opaque ids resolved through
//! [`crate::chunk_service::ChunkService`], never owning pointers (§9).

use crate::error::AppError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

pub type ChunkId = String;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Scope {
    Page,
    Section,
    Inline,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Position {
    pub file: String,
    pub line_range: (u32, u32),
    pub char_range: (u32, u32),
}

/// The single content unit (§3).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Chunk {
    pub id: ChunkId,
    pub contents: String,
    pub parent_id: Option<ChunkId>,
    pub document_id: String,
    pub virtual_document_id: Option<String>,
    pub scope: Scope,
    pub is_page: bool,
    pub is_tag: bool,
    pub is_template: bool,
    pub is_slot: bool,
    #[serde(rename = "ref")]
    pub ref_id: Option<ChunkId>,
    pub tags: Vec<String>,
    pub metadata: BTreeMap<String, serde_json::Value>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub position: Option<Position>,
    pub embedding: Option<Vec<f32>>,
}

/// Caller-supplied fields when creating a chunk; id/timestamps are assigned
/// by [`crate::chunk_service::ChunkService::create`].
#[derive(Debug, Clone, Deserialize)]
pub struct ChunkDraft {
    pub id: Option<ChunkId>,
    pub contents: String,
    pub parent_id: Option<ChunkId>,
    pub document_id: String,
    pub virtual_document_id: Option<String>,
    pub scope: Scope,
    #[serde(default)]
    pub is_page: bool,
    #[serde(default)]
    pub is_tag: bool,
    #[serde(default)]
    pub is_template: bool,
    #[serde(default)]
    pub is_slot: bool,
    #[serde(rename = "ref")]
    pub ref_id: Option<ChunkId>,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub metadata: BTreeMap<String, serde_json::Value>,
    pub position: Option<Position>,
    pub embedding: Option<Vec<f32>>,
}

/// Partial update; `None` fields are left unchanged. `document_id` is
/// deliberately absent — it is never rewritten once set (§3).
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ChunkPatch {
    pub contents: Option<String>,
    #[serde(default, deserialize_with = "deserialize_nested_option")]
    pub parent_id: Option<Option<ChunkId>>,
    pub virtual_document_id: Option<String>,
    pub scope: Option<Scope>,
    pub is_page: Option<bool>,
    pub is_tag: Option<bool>,
    pub is_template: Option<bool>,
    pub is_slot: Option<bool>,
    #[serde(default, deserialize_with = "deserialize_nested_option")]
    pub ref_id: Option<Option<ChunkId>>,
    pub tags: Option<Vec<String>>,
    pub metadata: Option<BTreeMap<String, serde_json::Value>>,
    pub position: Option<Option<Position>>,
}

fn deserialize_nested_option<'de, D, T>(deserializer: D) -> Result<Option<Option<T>>, D::Error>
where
    D: serde::Deserializer<'de>,
    T: Deserialize<'de>,
{
    Ok(Some(Option::deserialize(deserializer)?))
}

/// Canonicalize a tag: trim, reject empty. Case is preserved (§3).
pub fn canonicalize_tag(raw: &str) -> Result<String, AppError> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Err(AppError::validation("tag must not be empty"));
    }
    Ok(trimmed.to_string())
}

/// Dedup + canonicalize a tag list, preserving first-seen order.
pub fn canonicalize_tags(raw: &[String]) -> Result<Vec<String>, AppError> {
    let mut seen = std::collections::HashSet::new();
    let mut out = Vec::new();
    for tag in raw {
        let canon = canonicalize_tag(tag)?;
        if seen.insert(canon.clone()) {
            out.push(canon);
        }
    }
    Ok(out)
}

impl Chunk {
    /// Exactly one of the four role flags may be true (§3 invariant 2).
    pub fn validate_flags(&self) -> Result<(), AppError> {
        let count = [self.is_page, self.is_tag, self.is_template, self.is_slot]
            .iter()
            .filter(|b| **b)
            .count();
        if count > 1 {
            return Err(AppError::conflict(
                "MULTIPLE_ROLE_FLAGS",
                "at most one of is_page, is_template, is_slot, is_tag may be true",
            ));
        }
        if self.is_slot && self.ref_id.is_none() {
            return Err(AppError::validation("is_slot chunks must set `ref`"));
        }
        Ok(())
    }

    pub fn touch(&mut self) {
        let now = Utc::now();
        self.updated_at = if now > self.updated_at { now } else { self.updated_at + chrono::Duration::nanoseconds(1) };
    }
}

impl ChunkDraft {
    pub fn into_chunk(self, id: ChunkId, now: DateTime<Utc>) -> Result<Chunk, AppError> {
        let tags = canonicalize_tags(&self.tags)?;
        let chunk = Chunk {
            id,
            contents: self.contents,
            parent_id: self.parent_id,
            document_id: self.document_id,
            virtual_document_id: self.virtual_document_id,
            scope: self.scope,
            is_page: self.is_page,
            is_tag: self.is_tag,
            is_template: self.is_template,
            is_slot: self.is_slot,
            ref_id: self.ref_id,
            tags,
            metadata: self.metadata,
            created_at: now,
            updated_at: now,
            position: self.position,
            embedding: self.embedding,
        };
        chunk.validate_flags()?;
        Ok(chunk)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_chunk(id: &str) -> Chunk {
        let now = Utc::now();
        Chunk {
            id: id.to_string(),
            contents: "hello".into(),
            parent_id: None,
            document_id: "doc-1".into(),
            virtual_document_id: None,
            scope: Scope::Section,
            is_page: false,
            is_tag: false,
            is_template: false,
            is_slot: false,
            ref_id: None,
            tags: vec![],
            metadata: BTreeMap::new(),
            created_at: now,
            updated_at: now,
            position: None,
            embedding: None,
        }
    }

    #[test]
    fn rejects_multiple_role_flags() {
        let mut c = base_chunk("a");
        c.is_page = true;
        c.is_tag = true;
        assert!(c.validate_flags().is_err());
    }

    #[test]
    fn allows_plain_chunk_with_no_flags() {
        let c = base_chunk("a");
        assert!(c.validate_flags().is_ok());
    }

    #[test]
    fn slot_without_ref_is_rejected() {
        let mut c = base_chunk("a");
        c.is_slot = true;
        assert!(c.validate_flags().is_err());
    }

    #[test]
    fn slot_with_ref_is_accepted() {
        let mut c = base_chunk("a");
        c.is_slot = true;
        c.ref_id = Some("template-1".into());
        assert!(c.validate_flags().is_ok());
    }

    #[test]
    fn canonicalize_tags_dedupes_and_trims() {
        let tags = vec![" Urgent ".to_string(), "urgent".to_string(), "Urgent".to_string()];
        let canon = canonicalize_tags(&tags).unwrap();
        assert_eq!(canon, vec!["Urgent".to_string(), "urgent".to_string()]);
    }

    #[test]
    fn canonicalize_tags_rejects_empty() {
        let tags = vec!["   ".to_string()];
        assert!(canonicalize_tags(&tags).is_err());
    }

    #[test]
    fn touch_bumps_updated_at_monotonically() {
        let mut c = base_chunk("a");
        let before = c.updated_at;
        c.touch();
        assert!(c.updated_at >= before);
    }
}

//! Search cache (C6): canonicalization, hashing, adaptive TTL, glob
//! invalidation patterns, and the stats/suggestions observability contract.
//! Persistence itself lives behind C4 ([`crate::gateway::StorageGateway`]) —
//! this module is the pure, storage-agnostic logic grounded on the
//! `QueryCacheKey`/`CacheEntry`/`CacheMetrics` shapes in the retrieved
//! search-cache example.

use crate::error::AppError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;

/// Persisted row (§3, §6 "Persisted state layout").
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchCacheEntry {
    pub search_hash: String,
    pub query_params: CanonicalParams,
    pub chunk_ids: Vec<String>,
    pub result_count: usize,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub hit_count: u64,
}

impl SearchCacheEntry {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }
}

/// Query params canonicalized to keys sorted lexicographically, values
/// normalized (lowercased/trimmed strings, sorted sequences, canonical
/// numbers) — §4.6.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CanonicalParams(pub BTreeMap<String, CanonicalValue>);

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(untagged)]
pub enum CanonicalValue {
    Str(String),
    Int(i64),
    Bool(bool),
    List(Vec<CanonicalValue>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryKind {
    Content,
    Tag,
    Type,
    Unknown,
}

impl QueryKind {
    /// Adaptive TTL applied at write time (§4.6).
    pub fn ttl(self) -> std::time::Duration {
        use std::time::Duration;
        match self {
            QueryKind::Content => Duration::from_secs(5 * 60),
            QueryKind::Tag => Duration::from_secs(15 * 60),
            QueryKind::Type => Duration::from_secs(30 * 60),
            QueryKind::Unknown => Duration::from_secs(10 * 60),
        }
    }
}

/// Canonicalize an arbitrary query param map: sort keys, normalize values.
/// Idempotent: `canonicalize(canonicalize(q)) == canonicalize(q)` (§8).
pub fn canonicalize(params: &BTreeMap<String, serde_json::Value>) -> CanonicalParams {
    let mut out = BTreeMap::new();
    for (k, v) in params {
        out.insert(k.trim().to_lowercase(), canonicalize_value(v));
    }
    CanonicalParams(out)
}

fn canonicalize_value(value: &serde_json::Value) -> CanonicalValue {
    match value {
        serde_json::Value::String(s) => CanonicalValue::Str(s.trim().to_lowercase()),
        serde_json::Value::Bool(b) => CanonicalValue::Bool(*b),
        serde_json::Value::Number(n) => CanonicalValue::Int(n.as_i64().unwrap_or_default()),
        serde_json::Value::Array(items) => {
            let mut values: Vec<CanonicalValue> = items.iter().map(canonicalize_value).collect();
            values.sort();
            CanonicalValue::List(values)
        }
        serde_json::Value::Null => CanonicalValue::Str(String::new()),
        serde_json::Value::Object(_) => CanonicalValue::Str(value.to_string()),
    }
}

/// Deterministic 32-byte digest, hex-encoded to the 64-char `search_hash`.
pub fn search_hash(params: &CanonicalParams) -> String {
    let serialized = serde_json::to_vec(params).expect("CanonicalParams is always serializable");
    let digest = Sha256::digest(&serialized);
    hex::encode(digest)
}

/// A simple `*`-wildcard matcher over the flattened `key=value` form of a
/// canonicalized query (§4.6's invalidation patterns).
pub struct GlobPattern {
    segments: Vec<String>,
    anchored_start: bool,
    anchored_end: bool,
}

impl GlobPattern {
    pub fn new(pattern: &str) -> Self {
        let anchored_start = !pattern.starts_with('*');
        let anchored_end = !pattern.ends_with('*');
        let segments = pattern.split('*').filter(|s| !s.is_empty()).map(str::to_string).collect();
        Self { segments, anchored_start, anchored_end }
    }

    pub fn matches(&self, haystack: &str) -> bool {
        if self.segments.is_empty() {
            return true;
        }
        let mut rest = haystack;
        for (i, segment) in self.segments.iter().enumerate() {
            match rest.find(segment.as_str()) {
                Some(pos) => {
                    if i == 0 && self.anchored_start && pos != 0 {
                        return false;
                    }
                    rest = &rest[pos + segment.len()..];
                }
                None => return false,
            }
        }
        if self.anchored_end {
            return rest.is_empty();
        }
        true
    }
}

/// Flatten canonicalized params into the `key=value,key=value` representation
/// glob patterns match against.
pub fn flatten(params: &CanonicalParams) -> String {
    params
        .0
        .iter()
        .map(|(k, v)| format!("{k}={}", flatten_value(v)))
        .collect::<Vec<_>>()
        .join(",")
}

fn flatten_value(value: &CanonicalValue) -> String {
    match value {
        CanonicalValue::Str(s) => s.clone(),
        CanonicalValue::Int(n) => n.to_string(),
        CanonicalValue::Bool(b) => b.to_string(),
        CanonicalValue::List(items) => items.iter().map(flatten_value).collect::<Vec<_>>().join(";"),
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct SearchCacheStats {
    pub total_entries: usize,
    pub expired_entries: usize,
    pub average_hit_count: f64,
    pub estimated_bytes: usize,
    pub top_queries: Vec<(String, u64)>,
}

/// Derive `stats()` over a snapshot of entries (§4.6). Pure function so it's
/// testable without a live store.
pub fn compute_stats(entries: &[SearchCacheEntry], now: DateTime<Utc>, top_n: usize) -> SearchCacheStats {
    let total_entries = entries.len();
    let expired_entries = entries.iter().filter(|e| e.is_expired(now)).count();
    let average_hit_count = if total_entries == 0 {
        0.0
    } else {
        entries.iter().map(|e| e.hit_count as f64).sum::<f64>() / total_entries as f64
    };
    let estimated_bytes = entries
        .iter()
        .map(|e| e.search_hash.len() + e.chunk_ids.iter().map(|id| id.len()).sum::<usize>() + 64)
        .sum();

    let mut by_hits: Vec<(String, u64)> = entries.iter().map(|e| (e.search_hash.clone(), e.hit_count)).collect();
    by_hits.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
    by_hits.truncate(top_n);

    SearchCacheStats { total_entries, expired_entries, average_hit_count, estimated_bytes, top_queries: by_hits }
}

/// Low-hit-rate threshold from §9's open-question decision (0.8, recorded in
/// DESIGN.md).
const LOW_HIT_RATE_THRESHOLD: f64 = 0.8;

/// Rule-based recommendations, per §4.6.
pub fn suggestions(entries: &[SearchCacheEntry], now: DateTime<Utc>) -> Vec<String> {
    let mut out = Vec::new();
    if entries.is_empty() {
        return out;
    }

    let hit_rate = entries.iter().filter(|e| e.hit_count > 0).count() as f64 / entries.len() as f64;
    if hit_rate < LOW_HIT_RATE_THRESHOLD {
        out.push("increase TTL or widen keying".to_string());
    }

    let expired_fraction = entries.iter().filter(|e| e.is_expired(now)).count() as f64 / entries.len() as f64;
    if expired_fraction > 0.5 {
        out.push("shorten cleanup interval".to_string());
    }

    let one_hit_fraction = entries.iter().filter(|e| e.hit_count == 1).count() as f64 / entries.len() as f64;
    if one_hit_fraction > 0.5 {
        out.push("consider stricter caching criteria".to_string());
    }

    out
}

/// Validates `AppError::validation` for malformed weight pairs before a
/// hybrid query proceeds — used by C8, kept here alongside the rest of the
/// query-shaping helpers.
pub fn validate_weights(semantic_weight: f64, text_weight: f64, epsilon: f64) -> Result<(), AppError> {
    if !(0.0..=1.0).contains(&semantic_weight) || !(0.0..=1.0).contains(&text_weight) {
        return Err(AppError::validation("semantic_weight and text_weight must each be in [0, 1]"));
    }
    if (semantic_weight + text_weight - 1.0).abs() > epsilon {
        return Err(AppError::validation("semantic_weight + text_weight must sum to 1"));
    }
    Ok(())
}

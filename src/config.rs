//! Reads exactly the environment variables named in §6. Deliberately *not* a
//! configuration-loading framework (files, secret managers, CLI flags are out
//! of scope) — just `std::env::var` + `parse`, per SPEC_FULL.md's ambient
//! stack notes.

use std::env;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct Config {
    pub slow_query_threshold: Duration,
    pub cache_enabled: bool,
    pub cache_default_ttl: Duration,
    pub cache_max_size: u64,
    pub search_cache_max_entries: u64,
    pub search_cache_cleanup_interval: Duration,
    pub use_unified_handlers: bool,
    pub monitoring_enabled: bool,
    pub storage_api_url: String,
    pub storage_api_key: String,
    pub embedding_api_url: Option<String>,
    pub embedding_api_key: Option<String>,
    pub llm_api_url: Option<String>,
    pub llm_api_key: Option<String>,
}

/// Raised when a required environment variable is absent or malformed.
/// Fatal at startup (exit code 1, per §6).
#[derive(Debug, thiserror::Error)]
#[error("configuration error: {0}")]
pub struct ConfigError(String);

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        Ok(Self {
            slow_query_threshold: Duration::from_millis(env_u64("SLOW_QUERY_THRESHOLD", 500)?),
            cache_enabled: env_bool("CACHE_ENABLED", true)?,
            cache_default_ttl: Duration::from_secs(env_u64("CACHE_DEFAULT_TTL", 900)?),
            cache_max_size: env_u64("CACHE_MAX_SIZE", 10_000)?,
            search_cache_max_entries: env_u64("SEARCH_CACHE_MAX_ENTRIES", 50_000)?,
            search_cache_cleanup_interval: Duration::from_secs(env_u64("SEARCH_CACHE_CLEANUP_INTERVAL", 600)?),
            use_unified_handlers: env_bool("USE_UNIFIED_HANDLERS", true)?,
            monitoring_enabled: env_bool("MONITORING_ENABLED", false)?,
            storage_api_url: required("STORAGE_API_URL")?,
            storage_api_key: required("STORAGE_API_KEY")?,
            embedding_api_url: env::var("EMBEDDING_API_URL").ok(),
            embedding_api_key: env::var("EMBEDDING_API_KEY").ok(),
            llm_api_url: env::var("LLM_API_URL").ok(),
            llm_api_key: env::var("LLM_API_KEY").ok(),
        })
    }
}

fn required(name: &str) -> Result<String, ConfigError> {
    env::var(name).map_err(|_| ConfigError(format!("missing required environment variable {name}")))
}

fn env_u64(name: &str, default: u64) -> Result<u64, ConfigError> {
    match env::var(name) {
        Ok(raw) => raw.parse().map_err(|_| ConfigError(format!("{name} must be a non-negative integer, got {raw:?}"))),
        Err(_) => Ok(default),
    }
}

fn env_bool(name: &str, default: bool) -> Result<bool, ConfigError> {
    match env::var(name) {
        Ok(raw) => match raw.to_ascii_lowercase().as_str() {
            "1" | "true" | "yes" | "on" => Ok(true),
            "0" | "false" | "no" | "off" => Ok(false),
            _ => Err(ConfigError(format!("{name} must be a boolean, got {raw:?}"))),
        },
        Err(_) => Ok(default),
    }
}

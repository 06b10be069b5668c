//! Circuit breaker registry: one [`CircuitBreaker`] per dependency name,
//! created lazily and shared by every caller of that dependency. Backed by
//! `dashmap` instead of the teacher's `Arc<Mutex<HashMap<...>>>` — same
//! contract, sharded locking under the read-heavy profile this crate serves.

use crate::circuit_breaker::{CircuitBreaker, CircuitBreakerConfig, CircuitBreakerState};
use dashmap::DashMap;
use serde::Serialize;
use std::sync::Arc;

pub struct BreakerRegistry {
    breakers: DashMap<Arc<str>, (Arc<CircuitBreakerState>, CircuitBreakerConfig)>,
    default_config: CircuitBreakerConfig,
}

impl BreakerRegistry {
    pub fn new(default_config: CircuitBreakerConfig) -> Self {
        Self { breakers: DashMap::new(), default_config }
    }

    /// Get or create the breaker for `dependency`, using `config` only the
    /// first time it's created.
    pub fn get_or_insert(&self, dependency: &str, config: CircuitBreakerConfig) -> CircuitBreaker {
        if let Some(entry) = self.breakers.get(dependency) {
            return CircuitBreaker::from_shared(Arc::from(dependency), entry.0.clone(), entry.1.clone());
        }
        let name: Arc<str> = Arc::from(dependency);
        let entry = self.breakers.entry(name.clone()).or_insert_with(|| (Arc::new(CircuitBreakerState::new()), config));
        let (state, stored_config) = entry.value().clone();
        CircuitBreaker::from_shared(name, state, stored_config)
    }

    pub fn get(&self, dependency: &str) -> CircuitBreaker {
        self.get_or_insert(dependency, self.default_config.clone())
    }

    /// Point-in-time snapshot of every registered breaker, for `/health`.
    pub fn snapshot(&self) -> Vec<BreakerSnapshot> {
        self.breakers
            .iter()
            .map(|entry| {
                let (state, _config) = entry.value();
                let breaker = CircuitBreaker::from_shared(entry.key().clone(), state.clone(), self.default_config.clone());
                BreakerSnapshot { dependency: entry.key().to_string(), state: format!("{:?}", breaker.state()) }
            })
            .collect()
    }
}

impl Default for BreakerRegistry {
    fn default() -> Self {
        Self::new(CircuitBreakerConfig::default())
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct BreakerSnapshot {
    pub dependency: String,
    pub state: String,
}

//! Composes C2 (retry) and C3 (circuit breaker) into the single call path
//! every outbound dependency call goes through. Per §4.3 the breaker sits
//! *outside* the retry loop — an open breaker short-circuits before any
//! attempt, including retries, is made (see SPEC_FULL.md's implementation
//! notes for why this inverts the teacher's `ResilienceStack` nesting).

use crate::breaker_registry::BreakerRegistry;
use crate::circuit_breaker::CircuitBreakerConfig;
use crate::error::AppError;
use crate::retry::RetryPolicy;
use std::future::Future;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

#[derive(Clone)]
pub struct Executor {
    dependency: Arc<str>,
    registry: Arc<BreakerRegistry>,
    breaker_config: CircuitBreakerConfig,
    retry_policy: RetryPolicy,
}

impl Executor {
    pub fn new(
        dependency: impl Into<Arc<str>>,
        registry: Arc<BreakerRegistry>,
        breaker_config: CircuitBreakerConfig,
        retry_policy: RetryPolicy,
    ) -> Self {
        Self { dependency: dependency.into(), registry, breaker_config, retry_policy }
    }

    /// Run `operation` behind this dependency's breaker, retrying inside it
    /// per the retry policy. Matches Concrete Scenario 1 (retry-then-succeed)
    /// and Scenario 2 (breaker short-circuits, no retries attempted) in §8.
    pub async fn call<T, Fut, Op>(&self, cancel: &CancellationToken, mut operation: Op) -> Result<T, AppError>
    where
        T: Send,
        Fut: Future<Output = Result<T, AppError>> + Send,
        Op: FnMut() -> Fut + Send,
    {
        let breaker = self.registry.get_or_insert(&self.dependency, self.breaker_config.clone());
        let policy = &self.retry_policy;
        breaker.call(|| policy.execute(cancel, &mut operation)).await
    }
}

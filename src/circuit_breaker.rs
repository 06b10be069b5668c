//! Circuit breaker (C3): one breaker per logical dependency, lock-free atomics
//! for the hot path, three states (Closed/Open/HalfOpen) per spec §4.3.

use crate::clock::{Clock, MonotonicClock};
use crate::error::AppError;
use std::future::Future;
use std::sync::atomic::{AtomicU64, AtomicU8, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

const STATE_CLOSED: u8 = 0;
const STATE_OPEN: u8 = 1;
const STATE_HALF_OPEN: u8 = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

#[derive(Debug, Clone)]
pub struct CircuitBreakerConfig {
    pub failure_threshold: usize,
    pub recovery_timeout: Duration,
    pub monitoring_period: Duration,
    pub max_probes: usize,
}

impl CircuitBreakerConfig {
    /// Defaults from spec §4.3.
    pub fn default_for(_dependency: &str) -> Self {
        Self {
            failure_threshold: 5,
            recovery_timeout: Duration::from_secs(60),
            monitoring_period: Duration::from_secs(5 * 60),
            max_probes: 3,
        }
    }

    pub fn disabled() -> Self {
        Self {
            failure_threshold: usize::MAX,
            recovery_timeout: Duration::from_secs(0),
            monitoring_period: Duration::from_secs(u64::MAX / 1000),
            max_probes: usize::MAX,
        }
    }
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self::default_for("default")
    }
}

/// Shared, cloneable breaker state. Lives behind an `Arc` so the registry
/// (`breaker_registry.rs`) and every clone of a [`CircuitBreaker`] observe the
/// same state.
#[derive(Debug)]
pub(crate) struct CircuitBreakerState {
    state: AtomicU8,
    failure_count: AtomicUsize,
    opened_at_millis: AtomicU64,
    window_started_at_millis: AtomicU64,
    half_open_probes: AtomicUsize,
}

impl CircuitBreakerState {
    pub(crate) fn new() -> Self {
        Self {
            state: AtomicU8::new(STATE_CLOSED),
            failure_count: AtomicUsize::new(0),
            opened_at_millis: AtomicU64::new(0),
            window_started_at_millis: AtomicU64::new(0),
            half_open_probes: AtomicUsize::new(0),
        }
    }

    pub(crate) fn current_state(&self) -> CircuitState {
        match self.state.load(Ordering::Acquire) {
            STATE_CLOSED => CircuitState::Closed,
            STATE_OPEN => CircuitState::Open,
            _ => CircuitState::HalfOpen,
        }
    }

    pub(crate) fn reset(&self) {
        self.state.store(STATE_CLOSED, Ordering::Release);
        self.failure_count.store(0, Ordering::Release);
        self.opened_at_millis.store(0, Ordering::Release);
        self.window_started_at_millis.store(0, Ordering::Release);
        self.half_open_probes.store(0, Ordering::Release);
    }
}

/// A breaker guarding one logical dependency (e.g. `"storage"`, `"embedding"`,
/// `"llm"`). Composed *outside* the retry engine (§4.3): the breaker decides
/// whether an attempt — including every retry inside it — happens at all.
#[derive(Clone)]
pub struct CircuitBreaker {
    name: Arc<str>,
    state: Arc<CircuitBreakerState>,
    config: CircuitBreakerConfig,
    clock: Arc<dyn Clock>,
}

impl std::fmt::Debug for CircuitBreaker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CircuitBreaker")
            .field("name", &self.name)
            .field("state", &self.state.current_state())
            .finish()
    }
}

impl CircuitBreaker {
    pub fn new(name: impl Into<Arc<str>>, config: CircuitBreakerConfig) -> Self {
        Self { name: name.into(), state: Arc::new(CircuitBreakerState::new()), config, clock: Arc::new(MonotonicClock::default()) }
    }

    pub(crate) fn from_shared(name: Arc<str>, state: Arc<CircuitBreakerState>, config: CircuitBreakerConfig) -> Self {
        Self { name, state, config, clock: Arc::new(MonotonicClock::default()) }
    }

    pub fn with_clock<C: Clock + 'static>(mut self, clock: C) -> Self {
        self.clock = Arc::new(clock);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn state(&self) -> CircuitState {
        self.state.current_state()
    }

    pub fn reset(&self) {
        self.state.reset();
    }

    /// Run `operation` through the breaker. An `Open` breaker fails fast with
    /// `AppError::circuit_open` and never invokes `operation` — no sleep, no
    /// retry, matching Concrete Scenario 2 in spec §8.
    pub async fn call<T, Fut, Op>(&self, mut operation: Op) -> Result<T, AppError>
    where
        T: Send,
        Fut: Future<Output = Result<T, AppError>> + Send,
        Op: FnMut() -> Fut + Send,
    {
        loop {
            match self.state.state.load(Ordering::Acquire) {
                STATE_OPEN => {
                    let opened_at = self.state.opened_at_millis.load(Ordering::Acquire);
                    let now = self.now_millis();
                    let elapsed = now.saturating_sub(opened_at);

                    if elapsed >= self.config.recovery_timeout.as_millis() as u64 {
                        match self.state.state.compare_exchange(
                            STATE_OPEN,
                            STATE_HALF_OPEN,
                            Ordering::AcqRel,
                            Ordering::Acquire,
                        ) {
                            Ok(_) => {
                                tracing::info!(dependency = %self.name, "circuit breaker -> half-open");
                                self.state.half_open_probes.store(0, Ordering::Release);
                                break;
                            }
                            Err(_) => continue,
                        }
                    } else {
                        return Err(AppError::circuit_open(
                            &self.name,
                            self.state.failure_count.load(Ordering::Acquire),
                            Duration::from_millis(elapsed),
                        ));
                    }
                }
                STATE_HALF_OPEN => {
                    let current = self.state.half_open_probes.fetch_add(1, Ordering::AcqRel);
                    if current >= self.config.max_probes {
                        self.state.half_open_probes.fetch_sub(1, Ordering::Release);
                        return Err(AppError::circuit_open(
                            &self.name,
                            self.state.failure_count.load(Ordering::Acquire),
                            Duration::from_millis(0),
                        ));
                    }
                    tracing::debug!(dependency = %self.name, in_flight = current + 1, max = self.config.max_probes, "circuit breaker: probe admitted");
                    break;
                }
                _ => break, // Closed
            }
        }

        let was_half_open = self.state.state.load(Ordering::Acquire) == STATE_HALF_OPEN;
        let result = operation().await;

        if was_half_open {
            self.state.half_open_probes.fetch_sub(1, Ordering::Release);
        }

        match &result {
            Ok(_) => self.on_success(),
            Err(_) => self.on_failure(),
        }

        result
    }

    fn on_success(&self) {
        match self.state.state.load(Ordering::Acquire) {
            STATE_HALF_OPEN => {
                if self
                    .state
                    .state
                    .compare_exchange(STATE_HALF_OPEN, STATE_CLOSED, Ordering::AcqRel, Ordering::Acquire)
                    .is_ok()
                {
                    self.state.failure_count.store(0, Ordering::Release);
                    self.state.window_started_at_millis.store(0, Ordering::Release);
                    tracing::info!(dependency = %self.name, "circuit breaker -> closed");
                }
            }
            STATE_CLOSED => {
                self.state.failure_count.store(0, Ordering::Release);
                self.state.window_started_at_millis.store(0, Ordering::Release);
            }
            _ => {}
        }
    }

    fn on_failure(&self) {
        let now = self.now_millis();
        match self.state.state.load(Ordering::Acquire) {
            STATE_HALF_OPEN => {
                if self
                    .state
                    .state
                    .compare_exchange(STATE_HALF_OPEN, STATE_OPEN, Ordering::AcqRel, Ordering::Acquire)
                    .is_ok()
                {
                    self.state.opened_at_millis.store(now, Ordering::Release);
                    tracing::warn!(dependency = %self.name, "circuit breaker: probe failed -> open");
                }
            }
            STATE_CLOSED => {
                // Reset the sliding window if monitoring_period has elapsed
                // since it started, so old failures don't count forever.
                let window_start = self.state.window_started_at_millis.load(Ordering::Acquire);
                let window_ms = self.config.monitoring_period.as_millis() as u64;
                if window_start == 0 {
                    self.state.window_started_at_millis.store(now, Ordering::Release);
                    self.state.failure_count.store(1, Ordering::Release);
                } else if now.saturating_sub(window_start) > window_ms {
                    self.state.window_started_at_millis.store(now, Ordering::Release);
                    self.state.failure_count.store(1, Ordering::Release);
                } else {
                    let failures = self.state.failure_count.fetch_add(1, Ordering::AcqRel) + 1;
                    if failures >= self.config.failure_threshold
                        && self
                            .state
                            .state
                            .compare_exchange(STATE_CLOSED, STATE_OPEN, Ordering::AcqRel, Ordering::Acquire)
                            .is_ok()
                    {
                        self.state.opened_at_millis.store(now, Ordering::Release);
                        tracing::error!(dependency = %self.name, failures, threshold = self.config.failure_threshold, "circuit breaker -> open");
                    }
                }
            }
            _ => {}
        }
    }

    fn now_millis(&self) -> u64 {
        self.clock.now_millis()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU64 as StdAtomicU64, AtomicUsize as StdAtomicUsize, Ordering as StdOrdering};

    #[derive(Debug, Clone)]
    struct ManualClock {
        now: Arc<StdAtomicU64>,
    }

    impl ManualClock {
        fn new() -> Self {
            Self { now: Arc::new(StdAtomicU64::new(0)) }
        }

        fn advance(&self, millis: u64) {
            self.now.fetch_add(millis, StdOrdering::SeqCst);
        }
    }

    impl Clock for ManualClock {
        fn now_millis(&self) -> u64 {
            self.now.load(StdOrdering::SeqCst)
        }
    }

    fn network_err() -> AppError {
        AppError::new(crate::error::ErrorKind::Network, "X", "boom")
    }

    #[tokio::test]
    async fn starts_closed_and_passes_through() {
        let cb = CircuitBreaker::new("storage", CircuitBreakerConfig::default_for("storage"));
        let counter = Arc::new(StdAtomicUsize::new(0));
        let c = counter.clone();
        let result = cb.call(|| { let c = c.clone(); async move { c.fetch_add(1, StdOrdering::SeqCst); Ok::<_, AppError>(1) } }).await;
        assert_eq!(result.unwrap(), 1);
        assert_eq!(counter.load(StdOrdering::SeqCst), 1);
        assert_eq!(cb.state(), CircuitState::Closed);
    }

    #[tokio::test]
    async fn opens_after_threshold_failures_and_short_circuits() {
        let cb = CircuitBreaker::new(
            "storage",
            CircuitBreakerConfig { failure_threshold: 5, recovery_timeout: Duration::from_secs(60), monitoring_period: Duration::from_secs(300), max_probes: 3 },
        );
        let counter = Arc::new(StdAtomicUsize::new(0));
        for _ in 0..5 {
            let c = counter.clone();
            let _ = cb.call(|| { let c = c.clone(); async move { c.fetch_add(1, StdOrdering::SeqCst); Err::<(), _>(network_err()) } }).await;
        }
        assert_eq!(counter.load(StdOrdering::SeqCst), 5);
        assert_eq!(cb.state(), CircuitState::Open);

        counter.store(0, StdOrdering::SeqCst);
        let c = counter.clone();
        let result = cb.call(|| { let c = c.clone(); async move { c.fetch_add(1, StdOrdering::SeqCst); Ok::<_, AppError>(1) } }).await;
        assert!(result.is_err());
        assert_eq!(result.unwrap_err().code, "CIRCUIT_OPEN");
        assert_eq!(counter.load(StdOrdering::SeqCst), 0, "operation must not run while open");
    }

    #[tokio::test]
    async fn transitions_to_half_open_after_recovery_timeout_then_closes_on_success() {
        let clock = ManualClock::new();
        let cb = CircuitBreaker::new(
            "storage",
            CircuitBreakerConfig { failure_threshold: 2, recovery_timeout: Duration::from_millis(100), monitoring_period: Duration::from_secs(300), max_probes: 1 },
        )
        .with_clock(clock.clone());

        for _ in 0..2 {
            let _ = cb.call(|| async { Err::<(), _>(network_err()) }).await;
        }
        assert_eq!(cb.state(), CircuitState::Open);

        clock.advance(150);

        let result = cb.call(|| async { Ok::<_, AppError>(42) }).await;
        assert_eq!(result.unwrap(), 42);
        assert_eq!(cb.state(), CircuitState::Closed);
    }

    #[tokio::test]
    async fn half_open_probe_failure_reopens_circuit() {
        let clock = ManualClock::new();
        let cb = CircuitBreaker::new(
            "storage",
            CircuitBreakerConfig { failure_threshold: 1, recovery_timeout: Duration::from_millis(50), monitoring_period: Duration::from_secs(300), max_probes: 1 },
        )
        .with_clock(clock.clone());

        let _ = cb.call(|| async { Err::<(), _>(network_err()) }).await;
        assert_eq!(cb.state(), CircuitState::Open);

        clock.advance(100);
        let result = cb.call(|| async { Err::<(), _>(network_err()) }).await;
        assert!(result.is_err());
        assert_eq!(cb.state(), CircuitState::Open);
    }

    #[tokio::test]
    async fn reset_clears_counters_and_state() {
        let cb = CircuitBreaker::new(
            "storage",
            CircuitBreakerConfig { failure_threshold: 1, recovery_timeout: Duration::from_secs(60), monitoring_period: Duration::from_secs(300), max_probes: 1 },
        );
        let _ = cb.call(|| async { Err::<(), _>(network_err()) }).await;
        assert_eq!(cb.state(), CircuitState::Open);
        cb.reset();
        assert_eq!(cb.state(), CircuitState::Closed);
    }
}

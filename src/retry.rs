//! Retry engine (C2): re-runs a fallible async operation under a configurable
//! backoff/jitter schedule, and a batch variant that runs many operations
//! under a bounded-concurrency semaphore (folds in what used to be a
//! standalone bulkhead policy — see DESIGN.md).

use crate::backoff::Backoff;
use crate::error::{AppError, ErrorKind};
use crate::jitter::Jitter;
use crate::sleeper::{Sleeper, TokioSleeper};
use std::collections::HashSet;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;

/// Retry policy, per spec §4.2.
#[derive(Clone)]
pub struct RetryPolicy {
    pub max_retries: usize,
    pub backoff: Backoff,
    pub jitter: bool,
    /// Kinds eligible for retry on top of [`AppError::is_retryable`]'s
    /// per-instance override. `None` defers entirely to `is_retryable()`.
    pub retryable_kinds: Option<HashSet<ErrorKind>>,
    /// Concurrency cap for [`RetryPolicy::execute_batch`]. Default 5 per §5.
    pub max_batch_concurrency: usize,
    sleeper: Arc<dyn Sleeper>,
}

impl std::fmt::Debug for RetryPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RetryPolicy")
            .field("max_retries", &self.max_retries)
            .field("jitter", &self.jitter)
            .field("max_batch_concurrency", &self.max_batch_concurrency)
            .finish()
    }
}

impl RetryPolicy {
    pub fn new(max_retries: usize, base_delay: std::time::Duration, max_delay: std::time::Duration) -> Self {
        Self {
            max_retries,
            backoff: Backoff::exponential(base_delay).with_max(max_delay),
            jitter: true,
            retryable_kinds: None,
            max_batch_concurrency: 5,
            sleeper: Arc::new(TokioSleeper),
        }
    }

    pub fn with_jitter(mut self, jitter: bool) -> Self {
        self.jitter = jitter;
        self
    }

    pub fn with_retryable_kinds(mut self, kinds: impl IntoIterator<Item = ErrorKind>) -> Self {
        self.retryable_kinds = Some(kinds.into_iter().collect());
        self
    }

    pub fn with_max_batch_concurrency(mut self, n: usize) -> Self {
        self.max_batch_concurrency = n.max(1);
        self
    }

    pub fn with_sleeper<S: Sleeper + 'static>(mut self, sleeper: S) -> Self {
        self.sleeper = Arc::new(sleeper);
        self
    }

    fn jitter_strategy(&self) -> Jitter {
        if self.jitter {
            Jitter::Equal
        } else {
            Jitter::None
        }
    }

    fn eligible(&self, err: &AppError) -> bool {
        if !err.is_retryable() {
            return false;
        }
        match &self.retryable_kinds {
            Some(kinds) => kinds.contains(&err.kind),
            None => true,
        }
    }

    /// Retry `operation` up to `max_retries` additional times. Checks
    /// `cancel` before every attempt and before every sleep; a cancelled
    /// token always wins and is never itself retried (§4.2, §9).
    pub async fn execute<T, Fut, Op>(&self, cancel: &CancellationToken, mut operation: Op) -> Result<T, AppError>
    where
        T: Send,
        Fut: Future<Output = Result<T, AppError>> + Send,
        Op: FnMut() -> Fut + Send,
    {
        let mut attempt = 0usize;
        loop {
            if cancel.is_cancelled() {
                return Err(AppError::cancelled("operation cancelled before attempt"));
            }

            match operation().await {
                Ok(v) => return Ok(v),
                Err(err) => {
                    if attempt >= self.max_retries || !self.eligible(&err) {
                        return Err(err);
                    }
                    attempt += 1;
                    let delay = self.jitter_strategy().apply(self.backoff.delay(attempt));
                    tracing::debug!(attempt, delay_ms = delay.as_millis() as u64, kind = %err.kind, "retrying");

                    tokio::select! {
                        _ = cancel.cancelled() => {
                            return Err(AppError::cancelled("operation cancelled during backoff"));
                        }
                        _ = self.sleeper.sleep(delay) => {}
                    }
                }
            }
        }
    }

    /// Run `operations` concurrently, each under its own retry schedule,
    /// bounded by `max_batch_concurrency` permits (§5). Returns one result
    /// per input item in the original order; a single item's failure does
    /// not cancel the others.
    pub async fn execute_batch<T>(
        &self,
        cancel: &CancellationToken,
        operations: Vec<Pin<Box<dyn Future<Output = Result<T, AppError>> + Send>>>,
    ) -> Vec<Result<T, AppError>>
    where
        T: Send + 'static,
    {
        let semaphore = Arc::new(Semaphore::new(self.max_batch_concurrency));
        let policy = self.clone();
        let cancel = cancel.clone();

        let handles: Vec<_> = operations
            .into_iter()
            .map(|fut| {
                let semaphore = semaphore.clone();
                let policy = policy.clone();
                let cancel = cancel.clone();
                tokio::spawn(async move {
                    let _permit = match semaphore.acquire_owned().await {
                        Ok(p) => p,
                        Err(_) => return Err(AppError::internal("batch semaphore closed")),
                    };
                    let shared = std::sync::Mutex::new(Some(fut));
                    policy
                        .execute(&cancel, move || {
                            let fut = shared.lock().unwrap_or_else(|p| p.into_inner()).take();
                            async move {
                                match fut {
                                    Some(fut) => fut.await,
                                    None => Err(AppError::internal("batch operation polled after completion")),
                                }
                            }
                        })
                        .await
                })
            })
            .collect();

        let mut results = Vec::with_capacity(handles.len());
        for handle in handles {
            match handle.await {
                Ok(result) => results.push(result),
                Err(join_err) => results.push(Err(AppError::internal(format!("batch task panicked: {join_err}")))),
            }
        }
        results
    }
}

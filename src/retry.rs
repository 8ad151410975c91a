//! Retry policy for fallible async operations.
//!
//! A reusable primitive independent of the messaging transport; the session
//! uses its backoff schedule for reconnection, and callers can wrap arbitrary
//! operations (storage writes, telemetry pushes) with it directly.
//!
//! Semantics:
//! - `max_attempts` counts total attempts (initial try + retries).
//! - The operation receives the 1-based attempt number.
//! - `should_retry` (or the `retry_on` substring allowlist) decides whether a
//!   failure is worth another attempt; non-retryable errors return
//!   immediately.
//! - Backoff computes the delay per retry; jitter randomizes it; the
//!   injectable [`Sleeper`] applies it.
//!
//! Invariants: attempts never exceed `max_attempts`; the sleeper is invoked
//! exactly `attempts - 1` times for a fully failing operation.

use crate::{Backoff, Jitter, SessionError, Sleeper, TokioSleeper};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

/// Hook invoked before each retry with the upcoming attempt number and the
/// failure that triggered it.
pub type RetryHook = Arc<dyn Fn(usize, &SessionError) + Send + Sync>;

/// Retry policy combining backoff, jitter, retryability, and sleeping.
#[derive(Clone)]
pub struct RetryPolicy {
    max_attempts: usize,
    backoff: Backoff,
    jitter: Jitter,
    should_retry: Arc<dyn Fn(&SessionError) -> bool + Send + Sync>,
    on_retry: Option<RetryHook>,
    sleeper: Arc<dyn Sleeper>,
}

impl std::fmt::Debug for RetryPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RetryPolicy")
            .field("max_attempts", &self.max_attempts)
            .field("backoff", &self.backoff)
            .field("jitter", &self.jitter)
            .field("should_retry", &"<predicate>")
            .finish()
    }
}

/// Errors produced while building a retry policy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetryBuildError {
    /// `max_attempts` must be > 0.
    InvalidMaxAttempts(usize),
}

impl std::fmt::Display for RetryBuildError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RetryBuildError::InvalidMaxAttempts(n) => {
                write!(f, "max_attempts must be > 0 (got {})", n)
            }
        }
    }
}

impl std::error::Error for RetryBuildError {}

impl RetryPolicy {
    /// Construct a new builder with defaults (3 attempts, exponential backoff
    /// from 1 s capped at 30 s, scaled jitter, category-based retryability).
    pub fn builder() -> RetryPolicyBuilder {
        RetryPolicyBuilder::new()
    }

    /// Execute an async operation with retry semantics. The operation is
    /// handed the 1-based attempt number.
    pub async fn execute<T, Fut, Op>(&self, mut operation: Op) -> Result<T, SessionError>
    where
        T: Send,
        Fut: Future<Output = Result<T, SessionError>> + Send,
        Op: FnMut(usize) -> Fut + Send,
    {
        let mut last_error: Option<SessionError> = None;

        for attempt in 1..=self.max_attempts {
            match operation(attempt).await {
                Ok(value) => return Ok(value),
                Err(err) => {
                    if !(self.should_retry)(&err) {
                        return Err(err);
                    }
                    if attempt >= self.max_attempts {
                        return Err(SessionError::retry_exhausted(self.max_attempts, err));
                    }

                    let delay = self.jitter.apply(self.backoff.delay(attempt));
                    tracing::debug!(
                        attempt,
                        next = attempt + 1,
                        ?delay,
                        error = %err,
                        "retrying after failure"
                    );
                    if let Some(hook) = &self.on_retry {
                        hook(attempt + 1, &err);
                    }
                    last_error = Some(err);
                    self.sleeper.sleep(delay).await;
                }
            }
        }

        // The loop always returns from its last iteration; keep a fallback for
        // the type checker.
        Err(SessionError::retry_exhausted(
            self.max_attempts,
            last_error.unwrap_or(SessionError::Disconnected),
        ))
    }
}

/// Builder for [`RetryPolicy`].
pub struct RetryPolicyBuilder {
    max_attempts: usize,
    backoff: Backoff,
    jitter: Jitter,
    should_retry: Arc<dyn Fn(&SessionError) -> bool + Send + Sync>,
    on_retry: Option<RetryHook>,
    sleeper: Arc<dyn Sleeper>,
}

impl RetryPolicyBuilder {
    pub fn new() -> Self {
        let backoff = Backoff::exponential(Duration::from_secs(1))
            .with_max(Duration::from_secs(30))
            .unwrap_or_else(|_| Backoff::exponential(Duration::from_secs(1)));
        Self {
            max_attempts: 3,
            backoff,
            jitter: Jitter::Scaled,
            should_retry: Arc::new(SessionError::is_retryable),
            on_retry: None,
            sleeper: Arc::new(TokioSleeper),
        }
    }

    /// Total attempts (initial + retries). Must be > 0.
    pub fn max_attempts(mut self, attempts: usize) -> Self {
        self.max_attempts = attempts;
        self
    }

    pub fn backoff(mut self, backoff: Backoff) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn jitter(mut self, jitter: Jitter) -> Self {
        self.jitter = jitter;
        self
    }

    /// Custom retryability predicate.
    pub fn should_retry<F>(mut self, predicate: F) -> Self
    where
        F: Fn(&SessionError) -> bool + Send + Sync + 'static,
    {
        self.should_retry = Arc::new(predicate);
        self
    }

    /// Retry only when the error's display text contains one of the given
    /// substrings (case-insensitive). Mirrors the host boundary, where retry
    /// decisions sometimes have nothing but a string to go on.
    pub fn retry_on<I, S>(mut self, substrings: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let allowlist: Vec<String> =
            substrings.into_iter().map(|s| s.into().to_ascii_lowercase()).collect();
        self.should_retry = Arc::new(move |err: &SessionError| {
            let text = err.to_string().to_ascii_lowercase();
            allowlist.iter().any(|needle| text.contains(needle))
        });
        self
    }

    /// Hook invoked before each retry.
    pub fn on_retry<F>(mut self, hook: F) -> Self
    where
        F: Fn(usize, &SessionError) + Send + Sync + 'static,
    {
        self.on_retry = Some(Arc::new(hook));
        self
    }

    pub fn with_sleeper<S>(mut self, sleeper: S) -> Self
    where
        S: Sleeper + 'static,
    {
        self.sleeper = Arc::new(sleeper);
        self
    }

    /// Build the policy, validating inputs.
    pub fn build(self) -> Result<RetryPolicy, RetryBuildError> {
        if self.max_attempts == 0 {
            return Err(RetryBuildError::InvalidMaxAttempts(0));
        }
        Ok(RetryPolicy {
            max_attempts: self.max_attempts,
            backoff: self.backoff,
            jitter: self.jitter,
            should_retry: self.should_retry,
            on_retry: self.on_retry,
            sleeper: self.sleeper,
        })
    }
}

impl Default for RetryPolicyBuilder {
    fn default() -> Self {
        Self::new()
    }
}

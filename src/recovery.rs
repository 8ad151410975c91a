//! Category-driven error recovery.
//!
//! The registry maps [`ErrorCategory`] values to recovery strategies (async
//! repair actions) and fallback handlers (synchronous degraded values), and
//! lazily creates one circuit breaker per named operation. Callers route
//! failures through [`ErrorRecoveryRegistry::handle_error`] or wrap whole
//! operations with [`ErrorRecoveryRegistry::wrap`] /
//! [`ErrorRecoveryRegistry::wrap_with_circuit_breaker`].
//!
//! Attempt accounting is per `(category, error_id)` pair: repeated failures of
//! the same operation burn through a bounded recovery budget, after which only
//! fallbacks apply until a success clears the record.

use crate::circuit_breaker::{BreakerSnapshot, CircuitBreaker, CircuitBreakerError};
use crate::clock::Clock;
use crate::error::{ErrorCategory, SessionError};
use crate::events::{EventBus, SessionEvent};
use async_trait::async_trait;
use futures::future::BoxFuture;
use serde_json::Value;
use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

/// Tunables for the recovery registry.
#[derive(Debug, Clone)]
pub struct RecoveryConfig {
    /// Strategy invocations allowed per `(category, error_id)` before only
    /// fallbacks apply.
    pub max_recovery_attempts: u32,
    /// Failure threshold for per-operation breakers.
    pub breaker_threshold: usize,
    /// Cooldown for per-operation breakers.
    pub breaker_reset_timeout: Duration,
}

impl Default for RecoveryConfig {
    fn default() -> Self {
        Self {
            max_recovery_attempts: 3,
            breaker_threshold: 3,
            breaker_reset_timeout: Duration::from_secs(30),
        }
    }
}

/// Everything a recovery strategy gets to see about the failure.
#[derive(Debug, Clone)]
pub struct RecoveryContext {
    pub category: ErrorCategory,
    pub error: SessionError,
    /// Stable identifier of the failing operation.
    pub error_id: String,
    /// 1-based invocation count for this `(category, error_id)` pair.
    pub attempt: u32,
}

/// Async repair action for a category. `Ok(())` means the underlying fault
/// was addressed and the operation may be retried.
pub type RecoveryStrategy =
    Arc<dyn Fn(RecoveryContext) -> BoxFuture<'static, Result<(), SessionError>> + Send + Sync>;

/// Synchronous producer of a degraded substitute value.
pub type FallbackHandler = Arc<dyn Fn(&SessionError) -> Value + Send + Sync>;

type AttemptKey = (ErrorCategory, String);

/// Registry of recovery strategies, fallbacks, and per-operation breakers.
pub struct ErrorRecoveryRegistry {
    strategies: RwLock<HashMap<ErrorCategory, RecoveryStrategy>>,
    fallbacks: RwLock<HashMap<ErrorCategory, FallbackHandler>>,
    degraded: RwLock<HashMap<String, FallbackHandler>>,
    attempts: Mutex<HashMap<AttemptKey, u32>>,
    breakers: Mutex<HashMap<String, CircuitBreaker>>,
    config: RecoveryConfig,
    events: Option<EventBus>,
    clock: Option<Arc<dyn Clock>>,
}

impl std::fmt::Debug for ErrorRecoveryRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ErrorRecoveryRegistry")
            .field("strategies", &self.strategies.read().expect("strategies poisoned").len())
            .field("fallbacks", &self.fallbacks.read().expect("fallbacks poisoned").len())
            .field("breakers", &self.breakers.lock().expect("breakers poisoned").len())
            .finish()
    }
}

impl Default for ErrorRecoveryRegistry {
    fn default() -> Self {
        Self::new(RecoveryConfig::default()).expect("default recovery config is valid")
    }
}

impl ErrorRecoveryRegistry {
    /// Create a registry, validating the breaker tunables up front so
    /// per-operation breaker creation cannot fail later.
    pub fn new(config: RecoveryConfig) -> Result<Self, CircuitBreakerError> {
        CircuitBreaker::new(config.breaker_threshold, config.breaker_reset_timeout)?;
        Ok(Self {
            strategies: RwLock::new(HashMap::new()),
            fallbacks: RwLock::new(HashMap::new()),
            degraded: RwLock::new(HashMap::new()),
            attempts: Mutex::new(HashMap::new()),
            breakers: Mutex::new(HashMap::new()),
            config,
            events: None,
            clock: None,
        })
    }

    /// Announce breaker transitions on this bus as well as in the log.
    pub fn with_events(mut self, events: EventBus) -> Self {
        self.events = Some(events);
        self
    }

    /// Override the clock used by per-operation breakers (deterministic
    /// tests).
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    /// Register the repair action for a category, replacing any previous one.
    pub fn register_recovery_strategy<F>(&self, category: ErrorCategory, strategy: F)
    where
        F: Fn(RecoveryContext) -> BoxFuture<'static, Result<(), SessionError>>
            + Send
            + Sync
            + 'static,
    {
        self.strategies
            .write()
            .expect("strategies poisoned")
            .insert(category, Arc::new(strategy));
    }

    /// Register the degraded-value producer for a category.
    pub fn register_fallback_handler<F>(&self, category: ErrorCategory, handler: F)
    where
        F: Fn(&SessionError) -> Value + Send + Sync + 'static,
    {
        self.fallbacks.write().expect("fallbacks poisoned").insert(category, Arc::new(handler));
    }

    /// Register the degraded value served when a named operation's breaker
    /// is open.
    pub fn register_degraded<F>(&self, operation_name: &str, handler: F)
    where
        F: Fn(&SessionError) -> Value + Send + Sync + 'static,
    {
        self.degraded
            .write()
            .expect("degraded handlers poisoned")
            .insert(operation_name.to_string(), Arc::new(handler));
    }

    /// Route a failure through recovery.
    ///
    /// Returns `Ok(None)` when a strategy repaired the fault (the caller may
    /// retry), `Ok(Some(value))` when a fallback supplied a degraded value,
    /// and `Err` when neither applied.
    pub async fn handle_error(
        &self,
        error: &SessionError,
        error_id: &str,
    ) -> Result<Option<Value>, SessionError> {
        let category = error.category();
        tracing::warn!(%error, ?category, error_id, "routing failure through recovery");

        let strategy =
            self.strategies.read().expect("strategies poisoned").get(&category).cloned();
        if let Some(strategy) = strategy {
            let attempt = self.next_attempt(category, error_id);
            if attempt <= self.config.max_recovery_attempts {
                let context = RecoveryContext {
                    category,
                    error: error.clone(),
                    error_id: error_id.to_string(),
                    attempt,
                };
                match strategy(context).await {
                    Ok(()) => {
                        self.clear_attempt(category, error_id);
                        tracing::info!(error_id, attempt, "recovery strategy succeeded");
                        return Ok(None);
                    }
                    Err(strategy_err) => {
                        tracing::warn!(
                            error = %strategy_err,
                            error_id,
                            attempt,
                            "recovery strategy failed"
                        );
                    }
                }
            } else {
                tracing::error!(error_id, ?category, "recovery attempts exhausted");
            }
        }

        let fallback = self.fallbacks.read().expect("fallbacks poisoned").get(&category).cloned();
        if let Some(handler) = fallback {
            tracing::info!(error_id, ?category, "serving fallback value");
            return Ok(Some(handler(error)));
        }
        Err(error.clone())
    }

    /// Run `operation`, routing a failure through recovery. A successful
    /// recovery earns exactly one re-invocation; a fallback value substitutes
    /// for the result.
    pub async fn wrap<Fut, Op>(
        &self,
        operation_name: &str,
        operation: Op,
    ) -> Result<Value, SessionError>
    where
        Op: Fn() -> Fut,
        Fut: Future<Output = Result<Value, SessionError>>,
    {
        let started = std::time::Instant::now();
        let result = match operation().await {
            Ok(value) => {
                self.clear_attempts_for(operation_name);
                Ok(value)
            }
            Err(err) => match self.handle_error(&err, operation_name).await? {
                Some(fallback) => Ok(fallback),
                None => operation().await,
            },
        };
        tracing::debug!(
            operation = operation_name,
            elapsed = ?started.elapsed(),
            ok = result.is_ok(),
            "wrapped operation finished"
        );
        result
    }

    /// Run `operation` under its named circuit breaker. While the breaker is
    /// open, a registered degraded value substitutes for the call.
    pub async fn wrap_with_circuit_breaker<Fut, Op>(
        &self,
        operation_name: &str,
        operation: Op,
    ) -> Result<Value, SessionError>
    where
        Op: FnOnce() -> Fut + Send,
        Fut: Future<Output = Result<Value, SessionError>> + Send,
    {
        let started = std::time::Instant::now();
        let breaker = self.breaker_for(operation_name);
        let result = match breaker.execute(operation).await {
            Err(err) if err.is_circuit_open() => {
                let handler = self
                    .degraded
                    .read()
                    .expect("degraded handlers poisoned")
                    .get(operation_name)
                    .cloned();
                match handler {
                    Some(handler) => {
                        tracing::warn!(
                            operation = operation_name,
                            "circuit open; serving degraded value"
                        );
                        Ok(handler(&err))
                    }
                    None => Err(err),
                }
            }
            other => other,
        };
        tracing::debug!(
            operation = operation_name,
            elapsed = ?started.elapsed(),
            ok = result.is_ok(),
            "breaker-wrapped operation finished"
        );
        result
    }

    /// Snapshot of a named operation's breaker, if one exists yet.
    pub fn breaker_snapshot(&self, operation_name: &str) -> Option<BreakerSnapshot> {
        self.breakers
            .lock()
            .expect("breakers poisoned")
            .get(operation_name)
            .map(CircuitBreaker::snapshot)
    }

    /// Force a named operation's breaker back to closed.
    pub fn reset_breaker(&self, operation_name: &str) {
        if let Some(breaker) = self.breakers.lock().expect("breakers poisoned").get(operation_name)
        {
            breaker.reset();
        }
    }

    /// Wire the persistence collaborator's own recovery: storage-category
    /// failures re-initialize the store.
    pub fn register_storage_recovery(&self, store: Arc<dyn FallbackStore>) {
        self.register_recovery_strategy(ErrorCategory::StorageOperation, move |context| {
            let store = store.clone();
            Box::pin(async move {
                tracing::info!(error_id = %context.error_id, "reinitializing fallback store");
                store.init().await
            })
        });
    }

    fn breaker_for(&self, operation_name: &str) -> CircuitBreaker {
        let mut breakers = self.breakers.lock().expect("breakers poisoned");
        breakers
            .entry(operation_name.to_string())
            .or_insert_with(|| {
                let breaker = CircuitBreaker::new(
                    self.config.breaker_threshold,
                    self.config.breaker_reset_timeout,
                )
                .expect("breaker config validated at construction");
                let breaker = match &self.clock {
                    Some(clock) => breaker.with_clock(clock.clone()),
                    None => breaker,
                };
                let bus = self.events.clone();
                let name = operation_name.to_string();
                breaker.with_on_open(move |failure_count| {
                    tracing::warn!(operation = %name, failure_count, "operation circuit opened");
                    if let Some(bus) = &bus {
                        bus.emit(&SessionEvent::CircuitOpened { failure_count });
                    }
                })
            })
            .clone()
    }

    fn next_attempt(&self, category: ErrorCategory, error_id: &str) -> u32 {
        let mut attempts = self.attempts.lock().expect("attempt records poisoned");
        let counter = attempts.entry((category, error_id.to_string())).or_insert(0);
        *counter += 1;
        *counter
    }

    fn clear_attempt(&self, category: ErrorCategory, error_id: &str) {
        self.attempts
            .lock()
            .expect("attempt records poisoned")
            .remove(&(category, error_id.to_string()));
    }

    fn clear_attempts_for(&self, error_id: &str) {
        self.attempts
            .lock()
            .expect("attempt records poisoned")
            .retain(|(_, id), _| id != error_id);
    }
}

/// Persistence collaborator used as a local fallback when the peer is
/// unreachable. Its own failures route through the storage category.
#[async_trait]
pub trait FallbackStore: Send + Sync {
    /// (Re-)initialize the store.
    async fn init(&self) -> Result<(), SessionError>;

    /// Persist an analytics payload locally for later replay.
    async fn store_analytics(&self, payload: Value) -> Result<(), SessionError>;
}

//! Circuit breaker guarding calls to an unreliable peer.
//!
//! Lock-free atomics; clones share the same underlying state, so all handles
//! observe the same lifecycle. State machine:
//!
//! - **Closed**: calls flow; consecutive failures increment the failure count
//!   and reaching the threshold opens the circuit.
//! - **Open**: calls are rejected with [`SessionError::CircuitOpen`] until the
//!   reset timeout elapses.
//! - **HalfOpen**: exactly one probe call is allowed. Success closes the
//!   circuit (failure count reset to 0); any failure reopens it with the
//!   failure count restored to the threshold.

use crate::clock::{Clock, MonotonicClock};
use crate::SessionError;
use std::future::Future;
use std::sync::atomic::{AtomicU64, AtomicU8, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

const STATE_CLOSED: u8 = 0;
const STATE_OPEN: u8 = 1;
const STATE_HALF_OPEN: u8 = 2;

/// Current state of the circuit breaker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    /// Normal operating mode.
    Closed,
    /// Short-circuits calls until the reset timeout elapses.
    Open,
    /// Probe mode allowing a single trial call.
    HalfOpen,
}

impl CircuitState {
    fn to_u8(self) -> u8 {
        match self {
            CircuitState::Closed => STATE_CLOSED,
            CircuitState::Open => STATE_OPEN,
            CircuitState::HalfOpen => STATE_HALF_OPEN,
        }
    }

    fn from_u8(raw: u8) -> CircuitState {
        match raw {
            STATE_OPEN => CircuitState::Open,
            STATE_HALF_OPEN => CircuitState::HalfOpen,
            _ => CircuitState::Closed,
        }
    }
}

/// Errors produced when validating breaker configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CircuitBreakerError {
    /// Failure threshold must be > 0.
    InvalidFailureThreshold { provided: usize },
    /// Reset timeout must be > 0.
    InvalidResetTimeout(Duration),
}

impl std::fmt::Display for CircuitBreakerError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CircuitBreakerError::InvalidFailureThreshold { provided } => {
                write!(f, "failure_threshold must be > 0 (got {})", provided)
            }
            CircuitBreakerError::InvalidResetTimeout(timeout) => {
                write!(f, "reset_timeout must be > 0 (got {:?})", timeout)
            }
        }
    }
}

impl std::error::Error for CircuitBreakerError {}

#[derive(Debug)]
struct BreakerShared {
    state: AtomicU8,
    failure_count: AtomicUsize,
    last_failure_millis: AtomicU64,
    half_open_probes: AtomicUsize,
}

/// Point-in-time view of breaker state for status export.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
pub struct BreakerSnapshot {
    pub state: CircuitState,
    pub failure_count: usize,
}

/// Hook fired when the circuit transitions to Open, with the failure count
/// that tripped it. Used for operator visibility and degraded-mode wiring.
pub type OpenHook = Arc<dyn Fn(usize) + Send + Sync>;

/// Circuit breaker guarding an async operation.
#[derive(Clone)]
pub struct CircuitBreaker {
    shared: Arc<BreakerShared>,
    failure_threshold: usize,
    reset_timeout: Duration,
    clock: Arc<dyn Clock>,
    on_open: Option<OpenHook>,
}

impl std::fmt::Debug for CircuitBreaker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CircuitBreaker")
            .field("state", &self.current_state())
            .field("failure_threshold", &self.failure_threshold)
            .field("reset_timeout", &self.reset_timeout)
            .finish()
    }
}

impl CircuitBreaker {
    /// Create a breaker, validating the threshold and timeout.
    pub fn new(
        failure_threshold: usize,
        reset_timeout: Duration,
    ) -> Result<Self, CircuitBreakerError> {
        if failure_threshold == 0 {
            return Err(CircuitBreakerError::InvalidFailureThreshold { provided: 0 });
        }
        if reset_timeout.is_zero() {
            return Err(CircuitBreakerError::InvalidResetTimeout(reset_timeout));
        }
        Ok(Self {
            shared: Arc::new(BreakerShared {
                state: AtomicU8::new(STATE_CLOSED),
                failure_count: AtomicUsize::new(0),
                last_failure_millis: AtomicU64::new(0),
                half_open_probes: AtomicUsize::new(0),
            }),
            failure_threshold,
            reset_timeout,
            clock: Arc::new(MonotonicClock::default()),
            on_open: None,
        })
    }

    /// Override the clock (deterministic tests).
    pub fn with_clock<C: Clock + 'static>(mut self, clock: C) -> Self {
        self.clock = Arc::new(clock);
        self
    }

    /// Register the opened-notification hook.
    pub fn with_on_open<F>(mut self, hook: F) -> Self
    where
        F: Fn(usize) + Send + Sync + 'static,
    {
        self.on_open = Some(Arc::new(hook));
        self
    }

    /// Raw current state (an Open breaker past its timeout still reports Open
    /// until a call probes it).
    pub fn current_state(&self) -> CircuitState {
        CircuitState::from_u8(self.shared.state.load(Ordering::Acquire))
    }

    /// Consecutive failure count.
    pub fn failure_count(&self) -> usize {
        self.shared.failure_count.load(Ordering::Acquire)
    }

    /// Whether a call made right now would be rejected without reaching the
    /// operation (Open and still inside the cooldown window).
    pub fn is_open(&self) -> bool {
        self.current_state() == CircuitState::Open
            && self.open_elapsed() < self.reset_timeout_millis()
    }

    /// Snapshot for status export.
    pub fn snapshot(&self) -> BreakerSnapshot {
        BreakerSnapshot { state: self.current_state(), failure_count: self.failure_count() }
    }

    /// Force the breaker back to Closed, clearing counters.
    pub fn reset(&self) {
        self.shared.state.store(STATE_CLOSED, Ordering::Release);
        self.shared.failure_count.store(0, Ordering::Release);
        self.shared.half_open_probes.store(0, Ordering::Release);
        self.shared.last_failure_millis.store(0, Ordering::Release);
    }

    /// Execute `operation` under breaker protection.
    ///
    /// # Errors
    /// [`SessionError::CircuitOpen`] when the circuit is open or the single
    /// half-open probe slot is taken; otherwise whatever the operation
    /// returns.
    pub async fn execute<T, Fut, Op>(&self, operation: Op) -> Result<T, SessionError>
    where
        T: Send,
        Fut: Future<Output = Result<T, SessionError>> + Send,
        Op: FnOnce() -> Fut + Send,
    {
        struct ProbeGuard<'a> {
            shared: &'a BreakerShared,
            armed: bool,
        }
        impl Drop for ProbeGuard<'_> {
            fn drop(&mut self) {
                if self.armed {
                    self.shared.half_open_probes.fetch_sub(1, Ordering::Release);
                }
            }
        }
        let mut guard: Option<ProbeGuard<'_>> = None;

        loop {
            match self.current_state() {
                CircuitState::Closed => break,
                CircuitState::Open => {
                    let elapsed = self.open_elapsed();
                    if elapsed < self.reset_timeout_millis() {
                        return Err(self.rejection(elapsed));
                    }
                    // Cooldown elapsed: race to become the half-open probe.
                    match self.shared.state.compare_exchange(
                        STATE_OPEN,
                        STATE_HALF_OPEN,
                        Ordering::AcqRel,
                        Ordering::Acquire,
                    ) {
                        Ok(_) => {
                            self.shared.half_open_probes.store(1, Ordering::Release);
                            guard = Some(ProbeGuard { shared: &self.shared, armed: true });
                            tracing::info!("circuit breaker: open -> half-open probe");
                            break;
                        }
                        Err(_) => continue, // lost the race; re-evaluate
                    }
                }
                CircuitState::HalfOpen => {
                    // Exactly one probe at a time.
                    if self
                        .shared
                        .half_open_probes
                        .compare_exchange(0, 1, Ordering::AcqRel, Ordering::Acquire)
                        .is_err()
                    {
                        return Err(self.rejection(self.open_elapsed()));
                    }
                    guard = Some(ProbeGuard { shared: &self.shared, armed: true });
                    break;
                }
            }
        }

        let result = operation().await;
        drop(guard);

        match &result {
            Ok(_) => self.on_success(),
            Err(_) => self.on_failure(),
        }
        result
    }

    fn on_success(&self) {
        match self.current_state() {
            CircuitState::HalfOpen => {
                if self
                    .shared
                    .state
                    .compare_exchange(
                        STATE_HALF_OPEN,
                        STATE_CLOSED,
                        Ordering::AcqRel,
                        Ordering::Acquire,
                    )
                    .is_ok()
                {
                    self.shared.failure_count.store(0, Ordering::Release);
                    self.shared.half_open_probes.store(0, Ordering::Release);
                    tracing::info!("circuit breaker: half-open -> closed");
                }
            }
            CircuitState::Closed => {
                // Only consecutive failures trip the breaker.
                self.shared.failure_count.store(0, Ordering::Release);
            }
            CircuitState::Open => {}
        }
    }

    fn on_failure(&self) {
        self.shared.last_failure_millis.store(self.clock.now_millis(), Ordering::Release);
        match self.current_state() {
            CircuitState::HalfOpen => {
                if self
                    .shared
                    .state
                    .compare_exchange(
                        STATE_HALF_OPEN,
                        STATE_OPEN,
                        Ordering::AcqRel,
                        Ordering::Acquire,
                    )
                    .is_ok()
                {
                    // Probe failed: count snaps back to the threshold so the
                    // next half-open cycle starts from a tripped state.
                    self.shared.failure_count.store(self.failure_threshold, Ordering::Release);
                    self.shared.half_open_probes.store(0, Ordering::Release);
                    tracing::warn!("circuit breaker: half-open probe failed -> open");
                    self.notify_open();
                }
            }
            CircuitState::Closed => {
                let failures = self.shared.failure_count.fetch_add(1, Ordering::AcqRel) + 1;
                if failures >= self.failure_threshold
                    && self
                        .shared
                        .state
                        .compare_exchange(
                            STATE_CLOSED,
                            STATE_OPEN,
                            Ordering::AcqRel,
                            Ordering::Acquire,
                        )
                        .is_ok()
                {
                    tracing::error!(
                        failures,
                        threshold = self.failure_threshold,
                        "circuit breaker: closed -> open"
                    );
                    self.notify_open();
                }
            }
            CircuitState::Open => {
                self.shared.failure_count.fetch_add(1, Ordering::AcqRel);
            }
        }
    }

    fn notify_open(&self) {
        if let Some(hook) = &self.on_open {
            hook(self.failure_count());
        }
    }

    fn rejection(&self, elapsed_millis: u64) -> SessionError {
        SessionError::CircuitOpen {
            failure_count: self.failure_count(),
            open_duration: Duration::from_millis(elapsed_millis),
        }
    }

    fn open_elapsed(&self) -> u64 {
        let last = self.shared.last_failure_millis.load(Ordering::Acquire);
        self.clock.now_millis().saturating_sub(last)
    }

    fn reset_timeout_millis(&self) -> u64 {
        u64::try_from(self.reset_timeout.as_millis()).unwrap_or(u64::MAX)
    }
}

#![forbid(unsafe_code)]
#![cfg_attr(not(test), deny(clippy::all))]

//! # Tether
//!
//! Resilient messaging for programs whose host runtime can vanish mid-flight:
//! connection sessions with priority queueing, circuit breakers, health
//! monitoring, and category-driven error recovery.
//!
//! ## Features
//!
//! - **Connection sessions** that queue requests while the channel is down
//!   and flush them in priority order on reconnect
//! - **Circuit breakers** with half-open probe recovery, lock-free via atomics
//! - **Retry policies** with exponential backoff and jitter
//! - **Health monitoring** with consecutive-failure escalation
//! - **Error recovery registry** dispatching on a failure taxonomy, with
//!   degraded-mode fallbacks
//! - **Injectable clocks and sleepers** for deterministic tests
//!
//! ## Quick Start
//!
//! ```rust
//! use tether::{Backoff, Jitter, RetryPolicy, SessionError};
//! use std::time::Duration;
//!
//! #[tokio::main]
//! async fn main() {
//!     let policy = RetryPolicy::builder()
//!         .max_attempts(3)
//!         .backoff(Backoff::exponential(Duration::from_secs(1)))
//!         .jitter(Jitter::Full)
//!         .build()
//!         .expect("valid policy");
//!
//!     let result = policy.execute(|_attempt| async {
//!         // Your async operation here
//!         Ok::<_, SessionError>(())
//!     }).await;
//!     assert!(result.is_ok());
//! }
//! ```

pub mod backoff;
pub mod circuit_breaker;
pub mod clock;
pub mod error;
pub mod events;
pub mod health;
pub mod jitter;
pub mod queue;
pub mod recovery;
pub mod retry;
pub mod session;
pub mod sleeper;
pub mod status;
pub mod transport;

// Re-exports
pub use backoff::{Backoff, BackoffError, MAX_BACKOFF};
pub use circuit_breaker::{BreakerSnapshot, CircuitBreaker, CircuitBreakerError, CircuitState};
pub use clock::{Clock, ManualClock, MonotonicClock};
pub use error::{ErrorCategory, SessionError, TransportError};
pub use events::{EventBus, SessionEvent, SubscriptionId};
pub use health::HealthMonitor;
pub use jitter::Jitter;
pub use queue::{CompletionReceiver, MessageQueue, Priority, QueuedRequest};
pub use recovery::{
    ErrorRecoveryRegistry, FallbackHandler, FallbackStore, RecoveryConfig, RecoveryContext,
    RecoveryStrategy,
};
pub use retry::{RetryBuildError, RetryPolicy, RetryPolicyBuilder};
pub use session::{
    ConnectionSession, SendOptions, SessionBuilder, SessionConfig, SessionConfigError,
};
pub use sleeper::{InstantSleeper, Sleeper, TokioSleeper};
pub use status::{
    ChannelSnapshot, HealthMetrics, HealthSnapshot, PerformanceMetrics, PerformanceSnapshot,
    StatusSnapshot,
};
pub use transport::{ContextProbe, Transport};

//! Error types for the messaging core.
//!
//! Failures cross an opaque host boundary that reports only strings, so the
//! crate keeps a typed sum (`SessionError`) for everything it produces itself
//! and a single documented classification heuristic (`ErrorCategory::classify`)
//! for everything the host hands back. All string matching lives here; no
//! other module inspects error text.

use std::time::Duration;
use thiserror::Error;

/// Opaque failure surfaced by the host transport primitive.
///
/// The hosting environment rejects with environment-specific strings. They are
/// preserved verbatim and classified heuristically; see [`ErrorCategory`].
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{message}")]
pub struct TransportError {
    message: String,
}

impl TransportError {
    /// Wrap a host-provided error string.
    pub fn new(message: impl Into<String>) -> Self {
        Self { message: message.into() }
    }

    /// The verbatim host error text.
    pub fn message(&self) -> &str {
        &self.message
    }
}

/// Unified error type for session operations.
#[derive(Debug, Clone, Error)]
pub enum SessionError {
    /// The execution context is gone (or suspected to be mid-reload).
    /// Not retryable in place; requires session-level teardown or a
    /// reload-tolerant wait.
    #[error("execution context invalidated (reload suspected: {reload})")]
    ContextInvalidated {
        /// Whether a brief host-side reload is suspected rather than a
        /// genuine teardown.
        reload: bool,
    },
    /// The channel is down and the request could not be (or was not) queued.
    #[error("transport disconnected")]
    Disconnected,
    /// The transport neither resolved nor rejected within the time limit.
    #[error("request timed out after {elapsed:?} (limit: {timeout:?})")]
    Timeout { elapsed: Duration, timeout: Duration },
    /// The circuit breaker refused the call.
    #[error("circuit breaker open ({failure_count} failures, open for {open_duration:?})")]
    CircuitOpen { failure_count: usize, open_duration: Duration },
    /// The request was evicted because the queue exceeded capacity.
    #[error("message queue overflowed (capacity {capacity})")]
    QueueOverflow { capacity: usize },
    /// All retry attempts were exhausted.
    #[error("retry exhausted after {attempts} attempts; last error: {last}")]
    RetryExhausted { attempts: usize, last: Box<SessionError> },
    /// A failure reported by the host transport, classified heuristically.
    #[error(transparent)]
    Transport(#[from] TransportError),
}

/// Failure taxonomy used for recovery dispatch and retry decisions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    /// Host environment gone; requires teardown or reload-tolerant wait.
    ContextInvalidation,
    /// Transient channel failure; retryable with backoff.
    ConnectionFailure,
    /// Delegated to the persistence collaborator's own recovery.
    StorageOperation,
    /// Malformed or unroutable request; surfaced, never retried.
    MessagingError,
    /// Treated as a connection failure for retry purposes.
    Timeout,
    /// Logged and surfaced; no automatic recovery assumed.
    Unknown,
}

impl ErrorCategory {
    /// Classify a host-provided error string.
    ///
    /// Best-effort substring matching, not a typed protocol: the host boundary
    /// only reports strings, so this is the one sanctioned place to inspect
    /// them. Match order matters; context invalidation is checked first
    /// because several host messages mention both the context and the
    /// connection.
    pub fn classify(message: &str) -> Self {
        let text = message.to_ascii_lowercase();
        if text.contains("context invalidated")
            || text.contains("extension context")
            || text.contains("no longer exists")
        {
            Self::ContextInvalidation
        } else if text.contains("storage") || text.contains("quota") {
            Self::StorageOperation
        } else if text.contains("timed out") || text.contains("timeout") {
            Self::Timeout
        } else if text.contains("malformed")
            || text.contains("invalid message")
            || text.contains("unroutable")
            || text.contains("serialization")
        {
            Self::MessagingError
        } else if text.contains("could not establish connection")
            || text.contains("receiving end does not exist")
            || text.contains("message port closed")
            || text.contains("disconnected")
            || text.contains("connection")
        {
            Self::ConnectionFailure
        } else {
            Self::Unknown
        }
    }
}

impl SessionError {
    /// Category of this error for recovery dispatch.
    ///
    /// Typed variants map directly; only [`SessionError::Transport`] falls
    /// back to string classification.
    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::ContextInvalidated { .. } => ErrorCategory::ContextInvalidation,
            Self::Disconnected | Self::CircuitOpen { .. } => ErrorCategory::ConnectionFailure,
            Self::Timeout { .. } => ErrorCategory::Timeout,
            Self::QueueOverflow { .. } => ErrorCategory::MessagingError,
            Self::RetryExhausted { last, .. } => last.category(),
            Self::Transport(e) => ErrorCategory::classify(e.message()),
        }
    }

    /// Whether a local retry with backoff is appropriate.
    pub fn is_retryable(&self) -> bool {
        matches!(self.category(), ErrorCategory::ConnectionFailure | ErrorCategory::Timeout)
    }

    /// Check if this error is a context invalidation.
    pub fn is_context_invalidated(&self) -> bool {
        matches!(self, Self::ContextInvalidated { .. })
    }

    /// Check if this error is a timeout.
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }

    /// Check if this error came from an open circuit breaker.
    pub fn is_circuit_open(&self) -> bool {
        matches!(self, Self::CircuitOpen { .. })
    }

    /// Check if this error is a queue overflow eviction.
    pub fn is_queue_overflow(&self) -> bool {
        matches!(self, Self::QueueOverflow { .. })
    }

    /// Construct a `RetryExhausted` wrapping the final failure.
    pub fn retry_exhausted(attempts: usize, last: SessionError) -> Self {
        Self::RetryExhausted { attempts, last: Box::new(last) }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classify_context_invalidation_strings() {
        assert_eq!(
            ErrorCategory::classify("Extension context invalidated."),
            ErrorCategory::ContextInvalidation
        );
        assert_eq!(
            ErrorCategory::classify("the execution context no longer exists"),
            ErrorCategory::ContextInvalidation
        );
    }

    #[test]
    fn classify_connection_strings() {
        assert_eq!(
            ErrorCategory::classify(
                "Could not establish connection. Receiving end does not exist."
            ),
            ErrorCategory::ConnectionFailure
        );
        assert_eq!(
            ErrorCategory::classify("The message port closed before a response was received."),
            ErrorCategory::ConnectionFailure
        );
        assert_eq!(ErrorCategory::classify("peer disconnected"), ErrorCategory::ConnectionFailure);
    }

    #[test]
    fn classify_storage_and_timeout_strings() {
        assert_eq!(
            ErrorCategory::classify("storage write failed"),
            ErrorCategory::StorageOperation
        );
        assert_eq!(
            ErrorCategory::classify("QUOTA_BYTES exceeded"),
            ErrorCategory::StorageOperation
        );
        assert_eq!(ErrorCategory::classify("request timed out"), ErrorCategory::Timeout);
    }

    #[test]
    fn classify_messaging_and_unknown_strings() {
        assert_eq!(
            ErrorCategory::classify("malformed request envelope"),
            ErrorCategory::MessagingError
        );
        assert_eq!(ErrorCategory::classify("something exploded"), ErrorCategory::Unknown);
    }

    #[test]
    fn context_checked_before_connection() {
        // Host messages that mention both must classify as context invalidation.
        assert_eq!(
            ErrorCategory::classify("connection dropped: extension context invalidated"),
            ErrorCategory::ContextInvalidation
        );
    }

    #[test]
    fn typed_variants_map_directly() {
        let timeout = SessionError::Timeout {
            elapsed: Duration::from_secs(5),
            timeout: Duration::from_secs(3),
        };
        assert_eq!(timeout.category(), ErrorCategory::Timeout);
        assert!(timeout.is_retryable());

        let ctx = SessionError::ContextInvalidated { reload: false };
        assert_eq!(ctx.category(), ErrorCategory::ContextInvalidation);
        assert!(!ctx.is_retryable());

        let overflow = SessionError::QueueOverflow { capacity: 10 };
        assert_eq!(overflow.category(), ErrorCategory::MessagingError);
        assert!(!overflow.is_retryable());
    }

    #[test]
    fn retry_exhausted_inherits_inner_category() {
        let err = SessionError::retry_exhausted(3, SessionError::Disconnected);
        assert_eq!(err.category(), ErrorCategory::ConnectionFailure);
        let msg = format!("{}", err);
        assert!(msg.contains("3 attempts"));
        assert!(msg.contains("disconnected"));
    }

    #[test]
    fn transport_error_preserves_host_text() {
        let err = SessionError::from(TransportError::new("weird host failure"));
        assert_eq!(format!("{}", err), "weird host failure");
        assert_eq!(err.category(), ErrorCategory::Unknown);
    }
}

//! External interfaces consumed by the session.
//!
//! The hosting environment provides two primitives, both adversarial:
//!
//! - [`Transport`]: an async request/response channel that may hang
//!   indefinitely or reject with environment-specific strings. The session
//!   never calls it without a timeout race.
//! - [`ContextProbe`]: answers whether this process's addressing primitives
//!   still resolve at all, a precondition stronger than connectivity. Both
//!   probes may transiently lie during a host-side reload, which is why the
//!   session retries validation before believing a negative.

use crate::TransportError;
use async_trait::async_trait;
use serde_json::Value;

/// The host's request/response primitive.
#[async_trait]
pub trait Transport: Send + Sync + std::fmt::Debug {
    /// Send a payload and await the peer's response. May hang; callers
    /// enforce their own deadline.
    async fn send(&self, payload: Value) -> Result<Value, TransportError>;
}

/// The host's context-validity primitive.
pub trait ContextProbe: Send + Sync + std::fmt::Debug {
    /// Stable identity handle of this execution context, or `None` when the
    /// context is (possibly transiently) unaddressable.
    fn identity(&self) -> Option<String>;

    /// Whether the context can still resolve its own URLs.
    fn can_resolve_urls(&self) -> bool;
}

//! Rolling counters and the point-in-time status snapshot.
//!
//! Two metric sets share a shape: health probes and message sends. Both are
//! monotonic counters plus a rolling average of response times, updated with
//! atomics so recording never contends with the send path.

use crate::circuit_breaker::BreakerSnapshot;
use std::sync::atomic::{AtomicU64, Ordering};

/// Counters for the periodic health probe.
#[derive(Debug, Default)]
pub struct HealthMetrics {
    total_checks: AtomicU64,
    successful_checks: AtomicU64,
    consecutive_failures: AtomicU64,
    response_time_sum_ms: AtomicU64,
}

impl HealthMetrics {
    pub fn record_success(&self, response_time_ms: u64) {
        self.total_checks.fetch_add(1, Ordering::Relaxed);
        self.successful_checks.fetch_add(1, Ordering::Relaxed);
        self.response_time_sum_ms.fetch_add(response_time_ms, Ordering::Relaxed);
        self.consecutive_failures.store(0, Ordering::Relaxed);
    }

    /// Record a failed probe; returns the updated consecutive-failure count.
    pub fn record_failure(&self) -> u64 {
        self.total_checks.fetch_add(1, Ordering::Relaxed);
        self.consecutive_failures.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Reset the consecutive counter after an escalation has been handled.
    pub fn reset_consecutive(&self) {
        self.consecutive_failures.store(0, Ordering::Relaxed);
    }

    pub fn consecutive_failures(&self) -> u64 {
        self.consecutive_failures.load(Ordering::Relaxed)
    }

    /// Fraction of probes that succeeded, in `[0, 1]`. Reports 1.0 before the
    /// first probe so an idle session reads as healthy.
    pub fn ratio(&self) -> f64 {
        let total = self.total_checks.load(Ordering::Relaxed);
        if total == 0 {
            return 1.0;
        }
        self.successful_checks.load(Ordering::Relaxed) as f64 / total as f64
    }

    pub fn snapshot(&self) -> HealthSnapshot {
        let total = self.total_checks.load(Ordering::Relaxed);
        let successful = self.successful_checks.load(Ordering::Relaxed);
        let sum = self.response_time_sum_ms.load(Ordering::Relaxed);
        HealthSnapshot {
            total_checks: total,
            successful_checks: successful,
            consecutive_failures: self.consecutive_failures.load(Ordering::Relaxed),
            average_response_time_ms: if successful == 0 { 0 } else { sum / successful },
        }
    }
}

/// Serializable view of [`HealthMetrics`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
pub struct HealthSnapshot {
    pub total_checks: u64,
    pub successful_checks: u64,
    pub consecutive_failures: u64,
    pub average_response_time_ms: u64,
}

/// Counters for message sends (as opposed to probes).
#[derive(Debug, Default)]
pub struct PerformanceMetrics {
    total_messages: AtomicU64,
    successful_messages: AtomicU64,
    failed_messages: AtomicU64,
    response_time_sum_ms: AtomicU64,
}

impl PerformanceMetrics {
    pub fn record(&self, success: bool, response_time_ms: u64) {
        self.total_messages.fetch_add(1, Ordering::Relaxed);
        if success {
            self.successful_messages.fetch_add(1, Ordering::Relaxed);
            self.response_time_sum_ms.fetch_add(response_time_ms, Ordering::Relaxed);
        } else {
            self.failed_messages.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn snapshot(&self) -> PerformanceSnapshot {
        let successful = self.successful_messages.load(Ordering::Relaxed);
        let sum = self.response_time_sum_ms.load(Ordering::Relaxed);
        PerformanceSnapshot {
            total_messages: self.total_messages.load(Ordering::Relaxed),
            successful_messages: successful,
            failed_messages: self.failed_messages.load(Ordering::Relaxed),
            average_response_time_ms: if successful == 0 { 0 } else { sum / successful },
        }
    }
}

/// Serializable view of [`PerformanceMetrics`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
pub struct PerformanceSnapshot {
    pub total_messages: u64,
    pub successful_messages: u64,
    pub failed_messages: u64,
    pub average_response_time_ms: u64,
}

/// Channel state as exported in the snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
pub struct ChannelSnapshot {
    pub context_valid: bool,
    pub connected: bool,
    pub attempts: u32,
}

/// Point-in-time status combining every observable surface of the session.
/// Consumed by diagnostics and periodically pushed back over the transport as
/// a best-effort telemetry message.
#[derive(Debug, Clone, serde::Serialize)]
pub struct StatusSnapshot {
    pub channel: ChannelSnapshot,
    pub circuit: BreakerSnapshot,
    pub health: HealthSnapshot,
    pub performance: PerformanceSnapshot,
    pub queue_len: usize,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn health_counters_uphold_invariant() {
        let metrics = HealthMetrics::default();
        metrics.record_success(10);
        metrics.record_failure();
        metrics.record_success(30);

        let snap = metrics.snapshot();
        assert!(snap.successful_checks <= snap.total_checks);
        assert_eq!(snap.total_checks, 3);
        assert_eq!(snap.successful_checks, 2);
        assert_eq!(snap.average_response_time_ms, 20);
    }

    #[test]
    fn consecutive_failures_track_streaks() {
        let metrics = HealthMetrics::default();
        assert_eq!(metrics.record_failure(), 1);
        assert_eq!(metrics.record_failure(), 2);
        metrics.record_success(5);
        assert_eq!(metrics.consecutive_failures(), 0);
        assert_eq!(metrics.record_failure(), 1);

        metrics.reset_consecutive();
        assert_eq!(metrics.consecutive_failures(), 0);
    }

    #[test]
    fn idle_health_ratio_is_one() {
        let metrics = HealthMetrics::default();
        assert_eq!(metrics.ratio(), 1.0);
        metrics.record_failure();
        assert_eq!(metrics.ratio(), 0.0);
        metrics.record_success(1);
        assert_eq!(metrics.ratio(), 0.5);
    }

    #[test]
    fn performance_average_ignores_failures() {
        let metrics = PerformanceMetrics::default();
        metrics.record(true, 100);
        metrics.record(false, 0);
        metrics.record(true, 300);

        let snap = metrics.snapshot();
        assert_eq!(snap.total_messages, 3);
        assert_eq!(snap.successful_messages, 2);
        assert_eq!(snap.failed_messages, 1);
        assert_eq!(snap.average_response_time_ms, 200);
    }

    #[test]
    fn snapshot_serializes() {
        let metrics = PerformanceMetrics::default();
        metrics.record(true, 5);
        let json = serde_json::to_value(metrics.snapshot()).expect("serializable");
        assert_eq!(json["total_messages"], 1);
    }
}

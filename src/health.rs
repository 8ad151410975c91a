//! Periodic health monitoring for a connection session.
//!
//! The monitor is a thin driver: it owns the timer loop and nothing else.
//! Each tick runs [`ConnectionSession::run_health_check`], which does the
//! probing, escalation, and metric recording. Keeping the cycle body on the
//! session means tests can drive checks deterministically without a timer.

use crate::session::ConnectionSession;
use std::time::Duration;

/// Health checks per status report pushed over the transport.
const STATUS_REPORT_EVERY: u64 = 10;

/// Drives periodic health checks against a session.
#[derive(Debug, Clone)]
pub struct HealthMonitor {
    session: ConnectionSession,
}

impl HealthMonitor {
    pub fn new(session: ConnectionSession) -> Self {
        Self { session }
    }

    /// Start the background check loop. At most one monitor runs per session;
    /// returns false if one is already active.
    pub fn start(&self) -> bool {
        let interval = effective_interval(self.session.config().health_interval);
        let session = self.session.clone();
        let started = self.session.install_monitor(move || {
            tokio::spawn(async move {
                let mut ticks: u64 = 0;
                loop {
                    tokio::time::sleep(interval).await;
                    if session.is_destroyed() {
                        break;
                    }
                    // Skip (but keep ticking) while the context is invalid;
                    // a suspected reload may restore it.
                    if !session.is_context_valid() {
                        continue;
                    }
                    session.run_health_check().await;
                    ticks += 1;
                    // Best-effort telemetry push on a slower cadence.
                    if ticks % STATUS_REPORT_EVERY == 0 && session.is_connected() {
                        session.report_status().await;
                    }
                }
            })
        });
        if started {
            tracing::debug!(?interval, "health monitor started");
        }
        started
    }

    /// Stop the check loop. Idempotent.
    pub fn stop(&self) {
        self.session.stop_health_monitor();
    }
}

/// Interval guard: a zero interval would spin the monitor loop.
pub fn effective_interval(configured: Duration) -> Duration {
    const FLOOR: Duration = Duration::from_millis(100);
    configured.max(FLOOR)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn interval_floor_prevents_spinning() {
        assert_eq!(effective_interval(Duration::ZERO), Duration::from_millis(100));
        assert_eq!(effective_interval(Duration::from_secs(30)), Duration::from_secs(30));
    }
}

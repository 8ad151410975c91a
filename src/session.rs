//! Connection session: the stateful core tying the channel, queue, breaker,
//! and event bus together.
//!
//! A [`ConnectionSession`] owns one logical channel to the host peer. Sends
//! flow directly while the channel is up; while it is down (or the breaker is
//! open) they park in the priority queue and resolve when a later flush
//! delivers them. Reconnection is self-scheduling with exponential backoff and
//! jitter, and every state transition is announced on the event bus.
//!
//! Locking discipline: the two mutexes here (`channel`, `queue`) are plain
//! `std::sync::Mutex` and are never held across an await point. Cross-task
//! coordination that spans awaits uses atomics (`reconnect_pending`,
//! `destroyed`) set before the suspension point.

use crate::backoff::{Backoff, BackoffError};
use crate::circuit_breaker::{CircuitBreaker, CircuitBreakerError};
use crate::clock::Clock;
use crate::error::{ErrorCategory, SessionError};
use crate::events::{EventBus, SessionEvent, SubscriptionId};
use crate::jitter::Jitter;
use crate::queue::{MessageQueue, Priority, QueuedRequest};
use crate::sleeper::{Sleeper, TokioSleeper};
use crate::status::{ChannelSnapshot, HealthMetrics, PerformanceMetrics, StatusSnapshot};
use crate::transport::{ContextProbe, Transport};
use serde_json::{json, Value};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;

/// Tunables for a session. Defaults match production behavior; tests shrink
/// the timing knobs.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Queue capacity; overflow evicts down to half of this.
    pub max_queue_size: usize,
    /// Reconnection attempts before giving up until an external trigger.
    pub max_retries: u32,
    /// First reconnection delay; doubles per attempt.
    pub base_backoff: Duration,
    /// Ceiling on the reconnection delay.
    pub max_backoff: Duration,
    /// Deadline for an ordinary send.
    pub request_timeout: Duration,
    /// Deadline for connection and health probes.
    pub ping_timeout: Duration,
    /// Period of the background health monitor.
    pub health_interval: Duration,
    /// Consecutive probe failures before escalation.
    pub health_failure_threshold: u64,
    /// Context probe checks before believing a negative.
    pub context_probe_retries: u32,
    /// Pause between context probe checks.
    pub context_probe_delay: Duration,
    /// Reconnect attempts within which an invalidated-but-addressable context
    /// is treated as a brief host reload (queue preserved).
    pub reload_grace_attempts: u32,
    /// Consecutive send failures that trip the circuit breaker.
    pub breaker_threshold: usize,
    /// Cooldown before the breaker admits a half-open probe.
    pub breaker_reset_timeout: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            max_queue_size: 100,
            max_retries: 5,
            base_backoff: Duration::from_secs(1),
            max_backoff: Duration::from_secs(30),
            request_timeout: Duration::from_secs(10),
            ping_timeout: Duration::from_secs(5),
            health_interval: Duration::from_secs(30),
            health_failure_threshold: 3,
            context_probe_retries: 3,
            context_probe_delay: Duration::from_millis(30),
            reload_grace_attempts: 0,
            breaker_threshold: 3,
            breaker_reset_timeout: Duration::from_secs(30),
        }
    }
}

/// Errors produced when building a session from an invalid configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionConfigError {
    /// `max_queue_size` must be > 0.
    InvalidQueueCapacity,
    /// Breaker threshold or reset timeout rejected.
    Breaker(CircuitBreakerError),
    /// Backoff base/cap combination rejected.
    Backoff(BackoffError),
}

impl std::fmt::Display for SessionConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SessionConfigError::InvalidQueueCapacity => {
                write!(f, "max_queue_size must be > 0")
            }
            SessionConfigError::Breaker(e) => write!(f, "invalid breaker configuration: {}", e),
            SessionConfigError::Backoff(e) => write!(f, "invalid backoff configuration: {}", e),
        }
    }
}

impl std::error::Error for SessionConfigError {}

impl From<CircuitBreakerError> for SessionConfigError {
    fn from(e: CircuitBreakerError) -> Self {
        SessionConfigError::Breaker(e)
    }
}

impl From<BackoffError> for SessionConfigError {
    fn from(e: BackoffError) -> Self {
        SessionConfigError::Backoff(e)
    }
}

/// Per-send options.
#[derive(Debug, Clone, Copy, Default)]
pub struct SendOptions {
    /// Fail immediately instead of parking when the channel is down.
    pub skip_queue: bool,
    /// Override the configured request timeout.
    pub timeout: Option<Duration>,
    /// Queue priority if the request parks.
    pub priority: Priority,
}

#[derive(Debug)]
struct ChannelState {
    context_valid: bool,
    connected: bool,
    attempts: u32,
}

struct SessionInner {
    config: SessionConfig,
    transport: Arc<dyn Transport>,
    probe: Arc<dyn ContextProbe>,
    channel: Mutex<ChannelState>,
    queue: Mutex<MessageQueue>,
    breaker: CircuitBreaker,
    backoff: Backoff,
    jitter: Jitter,
    events: EventBus,
    health: HealthMetrics,
    perf: PerformanceMetrics,
    sleeper: Arc<dyn Sleeper>,
    reconnect_pending: AtomicBool,
    reconnect_task: Mutex<Option<JoinHandle<()>>>,
    monitor_task: Mutex<Option<JoinHandle<()>>>,
    destroyed: AtomicBool,
}

/// Builder for [`ConnectionSession`]; collaborators are injected, never
/// reached for globally.
pub struct SessionBuilder {
    transport: Arc<dyn Transport>,
    probe: Arc<dyn ContextProbe>,
    config: SessionConfig,
    jitter: Jitter,
    sleeper: Arc<dyn Sleeper>,
    clock: Option<Arc<dyn Clock>>,
}

impl SessionBuilder {
    fn new(transport: Arc<dyn Transport>, probe: Arc<dyn ContextProbe>) -> Self {
        Self {
            transport,
            probe,
            config: SessionConfig::default(),
            jitter: Jitter::Scaled,
            sleeper: Arc::new(TokioSleeper),
            clock: None,
        }
    }

    pub fn config(mut self, config: SessionConfig) -> Self {
        self.config = config;
        self
    }

    /// Jitter applied to reconnection delays (default: scaled).
    pub fn jitter(mut self, jitter: Jitter) -> Self {
        self.jitter = jitter;
        self
    }

    /// Override how delays are awaited (deterministic tests).
    pub fn sleeper(mut self, sleeper: Arc<dyn Sleeper>) -> Self {
        self.sleeper = sleeper;
        self
    }

    /// Override the breaker's clock (deterministic tests).
    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    /// Validate the configuration and assemble the session.
    pub fn build(self) -> Result<ConnectionSession, SessionConfigError> {
        if self.config.max_queue_size == 0 {
            return Err(SessionConfigError::InvalidQueueCapacity);
        }
        let backoff =
            Backoff::exponential(self.config.base_backoff).with_max(self.config.max_backoff)?;

        let events = EventBus::new();
        let bus = events.clone();
        let mut breaker =
            CircuitBreaker::new(self.config.breaker_threshold, self.config.breaker_reset_timeout)?
                .with_on_open(move |failure_count| {
                    bus.emit(&SessionEvent::CircuitOpened { failure_count });
                });
        if let Some(clock) = self.clock {
            breaker = breaker.with_clock(clock);
        }

        Ok(ConnectionSession {
            inner: Arc::new(SessionInner {
                queue: Mutex::new(MessageQueue::new(self.config.max_queue_size)),
                channel: Mutex::new(ChannelState {
                    // Optimistic until the first probe says otherwise.
                    context_valid: true,
                    connected: false,
                    attempts: 0,
                }),
                config: self.config,
                transport: self.transport,
                probe: self.probe,
                breaker,
                backoff,
                jitter: self.jitter,
                events,
                health: HealthMetrics::default(),
                perf: PerformanceMetrics::default(),
                sleeper: self.sleeper,
                reconnect_pending: AtomicBool::new(false),
                reconnect_task: Mutex::new(None),
                monitor_task: Mutex::new(None),
                destroyed: AtomicBool::new(false),
            }),
        })
    }
}

/// Handle to a connection session. Clones share the same underlying state.
#[derive(Clone)]
pub struct ConnectionSession {
    inner: Arc<SessionInner>,
}

impl std::fmt::Debug for ConnectionSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let channel = self.inner.channel.lock().expect("channel state poisoned");
        f.debug_struct("ConnectionSession")
            .field("context_valid", &channel.context_valid)
            .field("connected", &channel.connected)
            .field("attempts", &channel.attempts)
            .finish()
    }
}

impl ConnectionSession {
    pub fn builder(
        transport: Arc<dyn Transport>,
        probe: Arc<dyn ContextProbe>,
    ) -> SessionBuilder {
        SessionBuilder::new(transport, probe)
    }

    /// Validate the context, open the channel, and start background health
    /// monitoring. Returns whether the channel came up.
    pub async fn init(&self) -> bool {
        if !self.validate_context().await {
            return false;
        }
        let connected = self.establish_connection().await;
        crate::health::HealthMonitor::new(self.clone()).start();
        connected
    }

    /// Send with default options: queue while down, configured timeout,
    /// normal priority.
    pub async fn send(&self, payload: Value) -> Result<Value, SessionError> {
        self.send_with(payload, SendOptions::default()).await
    }

    /// Send a request, parking it in the queue when the channel is down or
    /// the breaker is open (unless `skip_queue`).
    pub async fn send_with(
        &self,
        payload: Value,
        options: SendOptions,
    ) -> Result<Value, SessionError> {
        if self.is_destroyed() {
            return Err(SessionError::Disconnected);
        }
        let (context_valid, connected) = self.channel_flags();
        if !context_valid {
            return Err(SessionError::ContextInvalidated { reload: false });
        }
        // A gated breaker and a down channel both mean "deliverable later".
        if (!connected || self.inner.breaker.is_open()) && !options.skip_queue {
            return self.enqueue_and_wait(payload, options.priority).await;
        }

        let timeout = options.timeout.unwrap_or(self.inner.config.request_timeout);
        match self.execute_transport(payload.clone(), timeout).await {
            Ok(response) => Ok(response),
            Err(err) => self.handle_send_failure(payload, options, err).await,
        }
    }

    async fn handle_send_failure(
        &self,
        payload: Value,
        options: SendOptions,
        err: SessionError,
    ) -> Result<Value, SessionError> {
        match err.category() {
            ErrorCategory::ContextInvalidation => {
                self.handle_context_invalidation(false);
                Err(err)
            }
            ErrorCategory::ConnectionFailure | ErrorCategory::Timeout => {
                tracing::warn!(error = %err, "send failed; channel presumed down");
                self.mark_disconnected();
                self.schedule_reconnection();
                if options.skip_queue {
                    Err(err)
                } else {
                    self.enqueue_and_wait(payload, options.priority).await
                }
            }
            _ => Err(err),
        }
    }

    /// Run one send under the breaker, racing it against the deadline.
    /// Whichever side resolves first wins; the loser is dropped.
    async fn execute_transport(
        &self,
        payload: Value,
        timeout: Duration,
    ) -> Result<Value, SessionError> {
        let started = Instant::now();
        let transport = self.inner.transport.clone();
        let result = self
            .inner
            .breaker
            .execute(|| async move { race_transport(transport, payload, timeout).await })
            .await;
        self.inner.perf.record(result.is_ok(), elapsed_millis(started));
        result
    }

    async fn enqueue_and_wait(
        &self,
        payload: Value,
        priority: Priority,
    ) -> Result<Value, SessionError> {
        let receiver = {
            let mut queue = self.inner.queue.lock().expect("queue poisoned");
            queue.enqueue(payload, priority)
        };
        tracing::debug!("request parked while channel is down");
        // The channel can come up between the caller's flag check and the
        // enqueue above, in which case the reconnect-time flush has already
        // run against an emptier queue. Re-check and flush so a request
        // parked in that window is not stranded until the next cycle.
        if self.channel_flags().1 && !self.inner.breaker.is_open() {
            self.flush_queue().await;
        }
        match receiver.await {
            Ok(result) => result,
            // The sender half never drops without resolving; if it somehow
            // does, report the channel as dead rather than hanging.
            Err(_) => Err(SessionError::Disconnected),
        }
    }

    /// Probe the peer and, on success, mark the channel up and flush the
    /// queue. On failure the session classifies the error and either tears
    /// down (context gone) or schedules a reconnection.
    pub async fn establish_connection(&self) -> bool {
        if self.is_destroyed() {
            return false;
        }
        match self.execute_transport(ping_payload(), self.inner.config.ping_timeout).await {
            Ok(_) => {
                let newly_connected = {
                    let mut channel = self.inner.channel.lock().expect("channel state poisoned");
                    let was_connected = channel.connected;
                    channel.context_valid = true;
                    channel.connected = true;
                    channel.attempts = 0;
                    !was_connected
                };
                tracing::info!("channel established");
                if newly_connected {
                    self.inner.events.emit(&SessionEvent::ConnectionChanged { connected: true });
                }
                self.flush_queue().await;
                true
            }
            Err(err) => {
                tracing::warn!(error = %err, "connection probe failed");
                self.mark_disconnected();
                if err.category() == ErrorCategory::ContextInvalidation {
                    self.handle_context_invalidation(false);
                } else {
                    self.schedule_reconnection();
                }
                false
            }
        }
    }

    /// Deliver queued requests in priority order. Stops at the first
    /// channel-level failure and puts the undelivered remainder back at the
    /// front so the next flush resumes exactly where this one stopped.
    async fn flush_queue(&self) {
        let drained = {
            let mut queue = self.inner.queue.lock().expect("queue poisoned");
            queue.drain()
        };
        if drained.is_empty() {
            return;
        }
        tracing::info!(count = drained.len(), "flushing queued requests");

        let mut iter = drained.into_iter();
        while let Some(entry) = iter.next() {
            let result = self
                .execute_transport(entry.payload.clone(), self.inner.config.request_timeout)
                .await;
            match result {
                Ok(response) => entry.resolve(Ok(response)),
                Err(err) => {
                    let category = err.category();
                    entry.resolve(Err(err));
                    match category {
                        ErrorCategory::ContextInvalidation => {
                            self.requeue_rest(iter.collect());
                            self.handle_context_invalidation(false);
                            return;
                        }
                        ErrorCategory::ConnectionFailure | ErrorCategory::Timeout => {
                            self.requeue_rest(iter.collect());
                            self.mark_disconnected();
                            self.schedule_reconnection();
                            return;
                        }
                        // Request-level failure: surfaced to that caller
                        // only, the flush continues.
                        _ => {}
                    }
                }
            }
        }
    }

    fn requeue_rest(&self, rest: Vec<QueuedRequest>) {
        if rest.is_empty() {
            return;
        }
        let mut queue = self.inner.queue.lock().expect("queue poisoned");
        queue.requeue_front(rest);
    }

    /// Check that the execution context is still addressable, retrying a few
    /// times because the probes can transiently lie during a host reload. A
    /// hard negative triggers invalidation handling.
    pub async fn validate_context(&self) -> bool {
        if self.is_destroyed() {
            return false;
        }
        let retries = self.inner.config.context_probe_retries.max(1);
        for attempt in 0..retries {
            if self.inner.probe.identity().is_some() && self.inner.probe.can_resolve_urls() {
                let mut channel = self.inner.channel.lock().expect("channel state poisoned");
                channel.context_valid = true;
                return true;
            }
            if attempt + 1 < retries {
                self.inner.sleeper.sleep(self.inner.config.context_probe_delay).await;
            }
        }
        tracing::warn!(retries, "context probes exhausted without a positive answer");
        self.handle_context_invalidation(false);
        false
    }

    /// Schedule a single reconnection attempt after a jittered backoff delay.
    /// Idempotent while one is pending; gives up (and announces it) once the
    /// attempt budget is spent.
    pub fn schedule_reconnection(&self) {
        if self.is_destroyed() {
            return;
        }
        // Guard set before any await so interleavings cannot double-schedule.
        if self.inner.reconnect_pending.swap(true, Ordering::AcqRel) {
            return;
        }
        let attempts = {
            let mut channel = self.inner.channel.lock().expect("channel state poisoned");
            channel.attempts += 1;
            channel.attempts
        };
        if attempts > self.inner.config.max_retries {
            self.inner.reconnect_pending.store(false, Ordering::Release);
            tracing::error!(
                attempts = attempts - 1,
                "reconnection budget exhausted; offline until the context revalidates"
            );
            self.inner.events.emit(&SessionEvent::ReconnectExhausted { attempts: attempts - 1 });
            return;
        }

        let delay = self
            .inner
            .jitter
            .apply(self.inner.backoff.delay(attempts as usize))
            .min(self.inner.config.max_backoff);
        tracing::info!(attempt = attempts, ?delay, "scheduling reconnection");

        let session = self.clone();
        let handle = tokio::spawn(async move {
            session.inner.sleeper.sleep(delay).await;
            session.inner.reconnect_pending.store(false, Ordering::Release);
            if session.is_destroyed() {
                return;
            }
            if session.validate_context().await {
                let _ = session.establish_connection().await;
            }
        });
        // A previous handle here is a finished (or superseded) attempt;
        // dropping it detaches without cancelling.
        let _ = self
            .inner
            .reconnect_task
            .lock()
            .expect("reconnect task slot poisoned")
            .replace(handle);
    }

    /// React to the execution context becoming invalid.
    ///
    /// A brief host reload is suspected when invalidation arrives early in a
    /// reconnection cycle and the probe still reports an identity; in that
    /// case the queue survives for the restarted host. Otherwise the session
    /// tears down: every queued completion is rejected, health monitoring
    /// stops, and subscriptions are cleared.
    pub fn handle_context_invalidation(&self, is_reload: bool) {
        if self.is_destroyed() {
            return;
        }
        let (attempts, was_connected) = {
            let mut channel = self.inner.channel.lock().expect("channel state poisoned");
            channel.context_valid = false;
            let was_connected = channel.connected;
            channel.connected = false;
            (channel.attempts, was_connected)
        };
        let reload = is_reload
            || (attempts <= self.inner.config.reload_grace_attempts
                && self.inner.probe.identity().is_some());

        if was_connected {
            self.inner.events.emit(&SessionEvent::ConnectionChanged { connected: false });
        }
        self.inner.events.emit(&SessionEvent::ContextInvalid { reload });

        if reload {
            tracing::warn!("context invalid but a host reload is suspected; preserving queue");
            return;
        }

        tracing::error!("execution context invalidated; tearing down session");
        {
            let mut queue = self.inner.queue.lock().expect("queue poisoned");
            queue.reject_all(&SessionError::ContextInvalidated { reload: false });
        }
        self.stop_health_monitor();
        self.abort_reconnection();
        self.inner.events.clear();
    }

    /// One health probe cycle. Driven periodically by the monitor task, and
    /// callable directly for deterministic tests.
    pub async fn run_health_check(&self) {
        if self.is_destroyed() {
            return;
        }
        // Probing only makes sense while the context holds.
        if !self.channel_flags().0 {
            return;
        }
        if !self.validate_context().await {
            return;
        }

        let connected = self.channel_flags().1;
        let started = Instant::now();
        let outcome: Result<(), SessionError> = if connected {
            self.execute_transport(ping_payload(), self.inner.config.ping_timeout)
                .await
                .map(|_| ())
        } else if self.establish_connection().await {
            Ok(())
        } else {
            Err(SessionError::Disconnected)
        };

        match outcome {
            Ok(()) => self.inner.health.record_success(elapsed_millis(started)),
            Err(err) => {
                let consecutive = self.inner.health.record_failure();
                tracing::warn!(error = %err, consecutive, "health check failed");
                if consecutive >= self.inner.config.health_failure_threshold {
                    self.inner.events.emit(&SessionEvent::HealthCheckFailed {
                        error: err.clone(),
                        consecutive_failures: consecutive,
                    });
                    self.inner.health.reset_consecutive();
                    if err.category() == ErrorCategory::ContextInvalidation {
                        self.handle_context_invalidation(false);
                    } else {
                        self.mark_disconnected();
                        self.force_reconnection();
                    }
                }
            }
        }
    }

    /// Start a fresh reconnection cycle regardless of prior attempts.
    fn force_reconnection(&self) {
        {
            let mut channel = self.inner.channel.lock().expect("channel state poisoned");
            channel.attempts = 0;
        }
        self.schedule_reconnection();
    }

    /// Point-in-time view across every observable surface.
    pub fn status(&self) -> StatusSnapshot {
        let channel = {
            let channel = self.inner.channel.lock().expect("channel state poisoned");
            ChannelSnapshot {
                context_valid: channel.context_valid,
                connected: channel.connected,
                attempts: channel.attempts,
            }
        };
        StatusSnapshot {
            channel,
            circuit: self.inner.breaker.snapshot(),
            health: self.inner.health.snapshot(),
            performance: self.inner.perf.snapshot(),
            queue_len: self.queue_len(),
        }
    }

    /// Push the current status over the transport. Best-effort telemetry:
    /// failures are logged, never surfaced, and nothing is queued for it.
    pub async fn report_status(&self) {
        let snapshot = match serde_json::to_value(self.status()) {
            Ok(snapshot) => snapshot,
            Err(err) => {
                tracing::debug!(error = %err, "status snapshot failed to serialize");
                return;
            }
        };
        let payload = json!({ "type": "status_report", "status": snapshot });
        let options = SendOptions { skip_queue: true, ..SendOptions::default() };
        if let Err(err) = self.send_with(payload, options).await {
            tracing::debug!(error = %err, "status report not delivered");
        }
    }

    /// Mark the session destroyed: stop background tasks and drop
    /// subscriptions. In-flight sends are not cancelled; their results are
    /// simply no longer observed.
    pub fn cleanup(&self) {
        if self.inner.destroyed.swap(true, Ordering::AcqRel) {
            return;
        }
        tracing::info!("session cleanup");
        self.stop_health_monitor();
        self.abort_reconnection();
        self.inner.events.clear();
    }

    /// Register an event subscriber.
    pub fn subscribe<F>(&self, callback: F) -> SubscriptionId
    where
        F: Fn(&SessionEvent) + Send + Sync + 'static,
    {
        self.inner.events.subscribe(callback)
    }

    /// Remove an event subscriber.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.inner.events.unsubscribe(id)
    }

    /// Shared handle to the session's event bus.
    pub fn event_bus(&self) -> EventBus {
        self.inner.events.clone()
    }

    /// Fraction of health probes that succeeded, in `[0, 1]`.
    pub fn health_ratio(&self) -> f64 {
        self.inner.health.ratio()
    }

    pub fn is_connected(&self) -> bool {
        self.channel_flags().1
    }

    pub fn is_context_valid(&self) -> bool {
        self.channel_flags().0
    }

    /// Reconnection attempts in the current cycle.
    pub fn attempts(&self) -> u32 {
        self.inner.channel.lock().expect("channel state poisoned").attempts
    }

    pub fn queue_len(&self) -> usize {
        self.inner.queue.lock().expect("queue poisoned").len()
    }

    pub(crate) fn is_destroyed(&self) -> bool {
        self.inner.destroyed.load(Ordering::Acquire)
    }

    pub(crate) fn config(&self) -> &SessionConfig {
        &self.inner.config
    }

    /// Install the monitor task handle; refuses a second live monitor.
    pub(crate) fn install_monitor(&self, spawn: impl FnOnce() -> JoinHandle<()>) -> bool {
        let mut slot = self.inner.monitor_task.lock().expect("monitor task slot poisoned");
        if slot.as_ref().is_some_and(|handle| !handle.is_finished()) {
            return false;
        }
        *slot = Some(spawn());
        true
    }

    pub(crate) fn stop_health_monitor(&self) {
        if let Some(handle) =
            self.inner.monitor_task.lock().expect("monitor task slot poisoned").take()
        {
            handle.abort();
        }
    }

    fn abort_reconnection(&self) {
        if let Some(handle) =
            self.inner.reconnect_task.lock().expect("reconnect task slot poisoned").take()
        {
            handle.abort();
        }
        self.inner.reconnect_pending.store(false, Ordering::Release);
    }

    fn mark_disconnected(&self) {
        let was_connected = {
            let mut channel = self.inner.channel.lock().expect("channel state poisoned");
            let was_connected = channel.connected;
            channel.connected = false;
            was_connected
        };
        if was_connected {
            self.inner.events.emit(&SessionEvent::ConnectionChanged { connected: false });
        }
    }

    fn channel_flags(&self) -> (bool, bool) {
        let channel = self.inner.channel.lock().expect("channel state poisoned");
        (channel.context_valid, channel.connected)
    }
}

fn ping_payload() -> Value {
    json!({ "type": "ping" })
}

fn elapsed_millis(started: Instant) -> u64 {
    u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX)
}

/// Race one transport call against the deadline. Exactly one side resolves
/// the race; the losing future is dropped.
async fn race_transport(
    transport: Arc<dyn Transport>,
    payload: Value,
    timeout: Duration,
) -> Result<Value, SessionError> {
    let started = Instant::now();
    tokio::select! {
        result = transport.send(payload) => result.map_err(SessionError::from),
        _ = tokio::time::sleep(timeout) => {
            Err(SessionError::Timeout { elapsed: started.elapsed(), timeout })
        }
    }
}

//! End-to-end session behavior against scripted transport and probe doubles.

use async_trait::async_trait;
use serde_json::{json, Value};
use std::collections::VecDeque;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tether::{
    ConnectionSession, ContextProbe, ErrorCategory, ErrorRecoveryRegistry, EventBus,
    HealthMonitor, InstantSleeper, Jitter, Priority, RecoveryConfig, SendOptions, SessionConfig,
    SessionEvent, Sleeper, Transport, TransportError,
};

/// Plays back a script of responses, recording every payload. Once the script
/// is exhausted it keeps answering with `fallback`.
#[derive(Debug)]
struct ScriptedTransport {
    script: Mutex<VecDeque<Result<Value, TransportError>>>,
    payloads: Mutex<Vec<Value>>,
    calls: AtomicUsize,
    fallback_ok: bool,
}

impl ScriptedTransport {
    fn always_ok() -> Arc<Self> {
        Self::new(vec![], true)
    }

    fn failing_after(steps: Vec<Result<Value, TransportError>>) -> Arc<Self> {
        Self::new(steps, false)
    }

    fn new(steps: Vec<Result<Value, TransportError>>, fallback_ok: bool) -> Arc<Self> {
        Arc::new(Self {
            script: Mutex::new(steps.into()),
            payloads: Mutex::new(Vec::new()),
            calls: AtomicUsize::new(0),
            fallback_ok,
        })
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    fn payloads(&self) -> Vec<Value> {
        self.payloads.lock().unwrap().clone()
    }
}

#[async_trait]
impl Transport for ScriptedTransport {
    async fn send(&self, payload: Value) -> Result<Value, TransportError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.payloads.lock().unwrap().push(payload);
        if let Some(step) = self.script.lock().unwrap().pop_front() {
            return step;
        }
        if self.fallback_ok {
            Ok(json!({ "ok": true }))
        } else {
            Err(TransportError::new(
                "Could not establish connection. Receiving end does not exist.",
            ))
        }
    }
}

#[derive(Debug)]
struct FakeProbe {
    present: AtomicBool,
}

impl FakeProbe {
    fn with_presence(present: bool) -> Arc<Self> {
        Arc::new(Self { present: AtomicBool::new(present) })
    }

    fn set_present(&self, present: bool) {
        self.present.store(present, Ordering::SeqCst);
    }
}

impl ContextProbe for FakeProbe {
    fn identity(&self) -> Option<String> {
        self.present.load(Ordering::SeqCst).then(|| "ctx-1".to_string())
    }

    fn can_resolve_urls(&self) -> bool {
        self.present.load(Ordering::SeqCst)
    }
}

/// Sleeper whose futures never resolve; freezes scheduled reconnections so
/// tests can observe the in-between state.
#[derive(Debug)]
struct FrozenSleeper;

impl Sleeper for FrozenSleeper {
    fn sleep(&self, _duration: Duration) -> Pin<Box<dyn Future<Output = ()> + Send>> {
        Box::pin(std::future::pending())
    }
}

fn fast_config() -> SessionConfig {
    SessionConfig {
        max_retries: 3,
        base_backoff: Duration::from_millis(5),
        max_backoff: Duration::from_millis(50),
        request_timeout: Duration::from_millis(500),
        ping_timeout: Duration::from_millis(500),
        health_failure_threshold: 3,
        context_probe_delay: Duration::from_millis(1),
        // Keep the send-path breaker out of the way unless a test wants it.
        breaker_threshold: 50,
        ..SessionConfig::default()
    }
}

fn build_session(
    transport: Arc<dyn Transport>,
    probe: Arc<dyn ContextProbe>,
    sleeper: Arc<dyn Sleeper>,
    config: SessionConfig,
) -> ConnectionSession {
    ConnectionSession::builder(transport, probe)
        .config(config)
        .jitter(Jitter::None)
        .sleeper(sleeper)
        .build()
        .expect("valid config")
}

fn collect_events(session: &ConnectionSession) -> Arc<Mutex<Vec<SessionEvent>>> {
    let events = Arc::new(Mutex::new(Vec::new()));
    let sink = events.clone();
    session.subscribe(move |event| sink.lock().unwrap().push(event.clone()));
    events
}

async fn wait_until(mut condition: impl FnMut() -> bool, what: &str) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while !condition() {
        assert!(Instant::now() < deadline, "timed out waiting for {}", what);
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

#[tokio::test]
async fn first_probe_connects_and_notifies_subscribers() {
    let transport = ScriptedTransport::always_ok();
    let probe = FakeProbe::with_presence(true);
    let session =
        build_session(transport.clone(), probe, Arc::new(InstantSleeper), fast_config());
    let events = collect_events(&session);

    assert!(session.init().await);
    assert!(session.is_connected());
    assert!(session.is_context_valid());
    assert_eq!(session.attempts(), 0);
    assert!(matches!(
        events.lock().unwrap().first(),
        Some(SessionEvent::ConnectionChanged { connected: true })
    ));
    // One probe reached the peer.
    assert_eq!(transport.calls(), 1);
    session.cleanup();
}

#[tokio::test]
async fn queued_sends_flush_in_priority_order_after_connect() {
    let transport = ScriptedTransport::always_ok();
    let probe = FakeProbe::with_presence(true);
    let session =
        build_session(transport.clone(), probe, Arc::new(InstantSleeper), fast_config());

    let mut parked = Vec::new();
    for (tag, priority) in
        [("low", Priority::Low), ("high", Priority::High), ("normal", Priority::Normal)]
    {
        let sender = session.clone();
        parked.push(tokio::spawn(async move {
            let options = SendOptions { priority, ..SendOptions::default() };
            sender.send_with(json!({ "tag": tag }), options).await
        }));
        // Serialize enqueue order so FIFO-within-band is deterministic.
        let expected = parked.len();
        wait_until(|| session.queue_len() == expected, "request to park").await;
    }

    assert!(session.establish_connection().await);
    for handle in parked {
        let response = handle.await.expect("task").expect("flushed send succeeds");
        assert_eq!(response["ok"], json!(true));
    }

    let tags: Vec<String> = transport
        .payloads()
        .into_iter()
        .filter_map(|payload| payload["tag"].as_str().map(str::to_string))
        .collect();
    assert_eq!(tags, vec!["high", "normal", "low"], "flush follows priority bands");
    session.cleanup();
}

#[tokio::test]
async fn reconnection_cycle_recovers_after_transient_outage() {
    // First probe fails, second succeeds: one backoff cycle, then connected.
    let transport = ScriptedTransport::new(
        vec![
            Err(TransportError::new("Could not establish connection")),
            Ok(json!({ "pong": true })),
        ],
        true,
    );
    let probe = FakeProbe::with_presence(true);
    let session =
        build_session(transport.clone(), probe, Arc::new(InstantSleeper), fast_config());
    let events = collect_events(&session);

    assert!(!session.establish_connection().await);
    wait_until(|| session.is_connected(), "reconnection to land").await;
    assert_eq!(session.attempts(), 0, "success resets the attempt counter");
    assert!(events
        .lock()
        .unwrap()
        .iter()
        .any(|event| matches!(event, SessionEvent::ConnectionChanged { connected: true })));
    session.cleanup();
}

#[tokio::test]
async fn open_breaker_serves_degraded_value_on_fourth_call() {
    let registry = ErrorRecoveryRegistry::new(RecoveryConfig {
        breaker_threshold: 3,
        ..RecoveryConfig::default()
    })
    .expect("valid config")
    .with_events(EventBus::new());
    registry.register_degraded("fetch-dashboard", |_err| json!({ "stale": true }));

    let invocations = Arc::new(AtomicUsize::new(0));
    for _ in 0..3 {
        let invocations = invocations.clone();
        let result = registry
            .wrap_with_circuit_breaker("fetch-dashboard", move || async move {
                invocations.fetch_add(1, Ordering::SeqCst);
                Err::<Value, _>(TransportError::new("message port closed").into())
            })
            .await;
        assert!(result.is_err());
    }

    let invocations_clone = invocations.clone();
    let result = registry
        .wrap_with_circuit_breaker("fetch-dashboard", move || async move {
            invocations_clone.fetch_add(1, Ordering::SeqCst);
            Ok(json!({ "live": true }))
        })
        .await;
    assert_eq!(result.unwrap(), json!({ "stale": true }));
    assert_eq!(invocations.load(Ordering::SeqCst), 3, "fourth call never ran");
}

#[tokio::test]
async fn three_failed_health_checks_escalate_and_schedule_reconnection() {
    // Connection probe succeeds, then every health ping fails.
    let transport = ScriptedTransport::failing_after(vec![Ok(json!({ "pong": true }))]);
    let probe = FakeProbe::with_presence(true);
    let session =
        build_session(transport.clone(), probe, Arc::new(FrozenSleeper), fast_config());
    let events = collect_events(&session);

    assert!(session.establish_connection().await);

    for _ in 0..3 {
        session.run_health_check().await;
    }

    let escalated = events.lock().unwrap().iter().any(|event| {
        matches!(event, SessionEvent::HealthCheckFailed { consecutive_failures: 3, error }
            if error.is_retryable())
    });
    assert!(escalated, "third consecutive failure must escalate");
    assert!(!session.is_connected());
    assert_eq!(session.attempts(), 1, "a reconnection cycle started");
    assert!(session.health_ratio() < 1.0);
    session.cleanup();
}

#[tokio::test]
async fn suspected_reload_preserves_queue_until_context_returns() {
    let transport = ScriptedTransport::always_ok();
    let probe = FakeProbe::with_presence(true);
    let session = build_session(
        transport.clone(),
        probe.clone(),
        Arc::new(InstantSleeper),
        fast_config(),
    );

    let sender = session.clone();
    let parked = tokio::spawn(async move { sender.send(json!({ "tag": "survivor" })).await });
    wait_until(|| session.queue_len() == 1, "request to park").await;

    // Probe still answers and no reconnect attempts burned: reload suspected.
    session.handle_context_invalidation(false);
    assert!(!session.is_context_valid());
    assert_eq!(session.queue_len(), 1);

    // The host comes back; context revalidates and the queue flushes.
    assert!(session.validate_context().await);
    assert!(session.establish_connection().await);
    let response = parked.await.expect("task").expect("preserved request delivered");
    assert_eq!(response["ok"], json!(true));
    session.cleanup();
}

#[tokio::test]
async fn hard_invalidation_tears_down_and_rejects_queue() {
    let transport = ScriptedTransport::failing_after(vec![]);
    let probe = FakeProbe::with_presence(true);
    let session = build_session(
        transport.clone(),
        probe.clone(),
        Arc::new(FrozenSleeper),
        fast_config(),
    );
    let events = collect_events(&session);

    let sender = session.clone();
    let parked = tokio::spawn(async move { sender.send(json!({ "tag": "doomed" })).await });
    wait_until(|| session.queue_len() == 1, "request to park").await;

    // Burn past the reload grace, then lose the context for real.
    session.schedule_reconnection();
    probe.set_present(false);
    session.handle_context_invalidation(false);

    let err = parked.await.expect("task").unwrap_err();
    assert!(err.is_context_invalidated());
    assert_eq!(session.queue_len(), 0);
    assert!(events
        .lock()
        .unwrap()
        .iter()
        .any(|event| matches!(event, SessionEvent::ContextInvalid { reload: false })));
    assert_eq!(session.event_bus().subscriber_count(), 0);
}

#[tokio::test]
async fn health_monitor_is_single_instance() {
    let transport = ScriptedTransport::always_ok();
    let probe = FakeProbe::with_presence(true);
    let session = build_session(transport, probe, Arc::new(InstantSleeper), fast_config());

    let monitor = HealthMonitor::new(session.clone());
    assert!(monitor.start());
    assert!(!monitor.start(), "second start must refuse");
    monitor.stop();
    assert!(monitor.start(), "restart after stop is allowed");
    session.cleanup();
}

#[tokio::test]
async fn recovery_registry_drives_session_reconnect() {
    // A connection-category failure routed through the registry triggers a
    // session-side reconnection via the registered strategy.
    let transport = ScriptedTransport::always_ok();
    let probe = FakeProbe::with_presence(true);
    let session =
        build_session(transport.clone(), probe, Arc::new(InstantSleeper), fast_config());

    let registry = ErrorRecoveryRegistry::default();
    let recovering = session.clone();
    registry.register_recovery_strategy(ErrorCategory::ConnectionFailure, move |_context| {
        let session = recovering.clone();
        Box::pin(async move {
            if session.establish_connection().await {
                Ok(())
            } else {
                Err(tether::SessionError::Disconnected)
            }
        })
    });

    let err: tether::SessionError = TransportError::new("peer disconnected").into();
    let outcome = registry.handle_error(&err, "background-sync").await;
    assert!(matches!(outcome, Ok(None)));
    assert!(session.is_connected());
    session.cleanup();
}

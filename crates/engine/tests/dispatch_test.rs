//! End-to-end behaviour of the dispatch worker against the memory store.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, Duration, TimeZone, Utc};
use chrono_tz::Tz;

use beacon_core::config::{NotifyConfig, ProbeConfig, SmtpConfig};
use beacon_core::{
    ActiveWindow, ChannelConfig, ChatWebhookConfig, EntityRef, EntityRunState, MonitorDefinition, NotificationChannel,
    RunConditions, RunRecord, RunStatus, ScheduleDefinition, WebhookChannelConfig,
};
use beacon_engine::{BreakerPolicy, DispatchOutcome, DispatchWorker, EngineError, MemoryStore, RunStore, StateChange};
use beacon_notify::{Dispatcher, Notification, Notifier, NotifierFactory, NotifyError};
use beacon_probe::{NetworkProber, ProbeResult, ProbeSpec, Prober};
use beacon_queue::JobPayload;

// ── Fakes ───────────────────────────────────────────────────────────

/// Returns queued results in order, then reachable successes.
#[derive(Default)]
struct ScriptedProber {
    results: Mutex<VecDeque<ProbeResult>>,
    calls: AtomicUsize,
}

impl ScriptedProber {
    fn push(&self, result: ProbeResult) {
        self.results.lock().unwrap().push_back(result);
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Prober for ScriptedProber {
    async fn execute(&self, _spec: &ProbeSpec) -> ProbeResult {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.results
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| ProbeResult::reachable(5))
    }
}

type Outbox = Arc<Mutex<Vec<Notification>>>;

struct RecordingNotifier {
    outbox: Outbox,
    reject: bool,
}

#[async_trait]
impl Notifier for RecordingNotifier {
    async fn send(&self, notification: &Notification) -> Result<(), NotifyError> {
        self.outbox.lock().unwrap().push(notification.clone());
        if self.reject {
            return Err(NotifyError::Config("rejected by test".into()));
        }
        Ok(())
    }

    fn channel_name(&self) -> &str {
        "recording"
    }
}

struct RecordingFactory {
    outbox: Outbox,
    reject: bool,
}

impl NotifierFactory for RecordingFactory {
    fn build(&self, _channel: &NotificationChannel) -> Result<Option<Box<dyn Notifier>>, NotifyError> {
        Ok(Some(Box::new(RecordingNotifier {
            outbox: self.outbox.clone(),
            reject: self.reject,
        })))
    }
}

// ── Harness ─────────────────────────────────────────────────────────

struct Harness {
    store: Arc<MemoryStore>,
    prober: Arc<ScriptedProber>,
    outbox: Outbox,
    worker: Arc<DispatchWorker>,
}

impl Harness {
    fn new() -> Self {
        Self::with_rejecting_channels(false)
    }

    fn with_rejecting_channels(reject: bool) -> Self {
        let store = Arc::new(MemoryStore::new());
        store.put_channel(NotificationChannel::new(
            "c1",
            "w1",
            ChannelConfig::Slack(ChatWebhookConfig { webhook_url: Some("https://hooks.example.com".into()) }),
        ));
        let prober = Arc::new(ScriptedProber::default());
        let outbox = Outbox::default();
        let dispatcher = Dispatcher::new(Arc::new(RecordingFactory { outbox: outbox.clone(), reject }));
        let worker = DispatchWorker::new(store.clone(), prober.clone(), dispatcher, ProbeConfig::default(), Tz::UTC);
        Self { store, prober, outbox, worker: Arc::new(worker) }
    }

    async fn schedule_at(&self, id: &str, now: DateTime<Utc>) -> DispatchOutcome {
        self.worker.handle_at(&JobPayload::schedule(id), now).await.unwrap()
    }

    fn sent(&self) -> Vec<Notification> {
        self.outbox.lock().unwrap().clone()
    }
}

fn t0() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 3, 2, 12, 0, 0).unwrap()
}

fn schedule(id: &str) -> ScheduleDefinition {
    let mut schedule = ScheduleDefinition::new(id, "w1", "https://api.example.com/sync");
    schedule.name = "Nightly sync".into();
    schedule
}

fn boom() -> ProbeResult {
    ProbeResult::failure("connection refused", 0)
}

// ── Thresholds and alerts ───────────────────────────────────────────

#[tokio::test]
async fn failure_alert_fires_once_at_threshold() {
    let h = Harness::new();
    h.store.put_schedule(schedule("s1"));
    for _ in 0..5 {
        h.prober.push(boom());
    }

    for i in 0..5 {
        let outcome = h.schedule_at("s1", t0() + Duration::minutes(i)).await;
        assert!(matches!(outcome, DispatchOutcome::Failed(_)));
    }

    let sent = h.sent();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].title, "Schedule failed: Nightly sync");
    assert_eq!(sent[0].message, "connection refused");
    assert_eq!(h.store.state(&EntityRef::schedule("s1")).consecutive_failures, 5);
}

#[tokio::test]
async fn recovery_alert_fires_on_first_success_only() {
    let h = Harness::new();
    let mut definition = schedule("s1");
    definition.alert_on_recovery = true;
    h.store.put_schedule(definition);
    h.prober.push(boom());
    h.prober.push(boom());

    let mut statuses = Vec::new();
    for i in 0..4 {
        let outcome = h.schedule_at("s1", t0() + Duration::minutes(i)).await;
        statuses.push(outcome.run().unwrap().status);
    }
    assert_eq!(
        statuses,
        vec![RunStatus::Failed, RunStatus::Failed, RunStatus::Success, RunStatus::Success]
    );

    let sent = h.sent();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].title, "Schedule recovered: Nightly sync");
    assert_eq!(sent[0].message, "Recovered after failures");
}

#[tokio::test]
async fn healthy_first_run_sends_no_recovery() {
    let h = Harness::new();
    let mut definition = schedule("s1");
    definition.alert_on_recovery = true;
    h.store.put_schedule(definition);

    let outcome = h.schedule_at("s1", t0()).await;
    assert!(matches!(outcome, DispatchOutcome::Succeeded(_)));
    assert_eq!(h.store.state(&EntityRef::schedule("s1")).consecutive_successes, 1);
    assert!(h.sent().is_empty());
}

#[tokio::test]
async fn monitor_alerts_use_monitor_label() {
    let h = Harness::new();
    let mut monitor = MonitorDefinition::http("m1", "w1", "https://example.com");
    monitor.name = "Homepage".into();
    monitor.failure_threshold = 1;
    h.store.put_monitor(monitor);
    h.prober.push(ProbeResult::failure("HTTP timeout", 10_000));

    let outcome = h.worker.handle_at(&JobPayload::monitor("m1"), t0()).await.unwrap();
    assert_eq!(outcome.label(), "failed");
    let sent = h.sent();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].title, "Monitor failed: Homepage");
    assert_eq!(sent[0].message, "HTTP timeout");
}

#[tokio::test]
async fn channel_failures_do_not_fail_the_job() {
    let h = Harness::with_rejecting_channels(true);
    let mut definition = schedule("s1");
    definition.failure_threshold = 1;
    h.store.put_schedule(definition);
    h.prober.push(boom());

    let outcome = h.schedule_at("s1", t0()).await;
    assert!(matches!(outcome, DispatchOutcome::Failed(_)));
    assert_eq!(h.sent().len(), 1);
    assert_eq!(h.store.runs(&EntityRef::schedule("s1")).len(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_failures_count_once_each_and_alert_once() {
    const JOBS: usize = 32;
    let h = Harness::new();
    h.store.put_schedule(schedule("s1"));
    for _ in 0..JOBS {
        h.prober.push(boom());
    }

    let tasks: Vec<_> = (0..JOBS)
        .map(|_| {
            let worker = h.worker.clone();
            tokio::spawn(async move { worker.handle_at(&JobPayload::schedule("s1"), t0()).await })
        })
        .collect();
    for task in tasks {
        assert!(matches!(task.await.unwrap().unwrap(), DispatchOutcome::Failed(_)));
    }

    let state = h.store.state(&EntityRef::schedule("s1"));
    assert_eq!(state.consecutive_failures, JOBS as u32);
    assert_eq!(h.store.runs(&EntityRef::schedule("s1")).len(), JOBS);
    assert_eq!(h.sent().len(), 1);
}

#[tokio::test]
async fn silent_channel_endpoint_does_not_hang_the_job() {
    // Accepts connections and never answers.
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let server = tokio::spawn(async move {
        let mut held = Vec::new();
        while let Ok((socket, _)) = listener.accept().await {
            held.push(socket);
        }
    });

    let store = Arc::new(MemoryStore::new());
    store.put_channel(NotificationChannel::new(
        "hook",
        "w1",
        ChannelConfig::Webhook(WebhookChannelConfig {
            url: Some(format!("http://{addr}/alerts")),
            method: None,
            headers: Default::default(),
        }),
    ));
    let mut definition = schedule("s1");
    definition.failure_threshold = 1;
    store.put_schedule(definition);

    let smtp = SmtpConfig {
        host: None,
        port: 587,
        username: None,
        password: None,
        from: "Beacon <no-reply@localhost>".into(),
    };
    let prober = Arc::new(ScriptedProber::default());
    prober.push(boom());
    let worker = DispatchWorker::new(
        store.clone(),
        prober,
        Dispatcher::from_config(&smtp, &NotifyConfig { timeout_ms: 300 }).unwrap(),
        ProbeConfig::default(),
        Tz::UTC,
    );

    let outcome = tokio::time::timeout(
        std::time::Duration::from_secs(10),
        worker.handle_at(&JobPayload::schedule("s1"), t0()),
    )
    .await
    .expect("handler must return while the channel stays silent")
    .unwrap();
    assert!(matches!(outcome, DispatchOutcome::Failed(_)));
    assert_eq!(store.state(&EntityRef::schedule("s1")).consecutive_failures, 1);
    server.abort();
}

// ── Persistence ─────────────────────────────────────────────────────

/// Memory store whose next `record_run` fails before writing anything.
struct FlakyStore {
    inner: Arc<MemoryStore>,
    fail_next: AtomicBool,
}

#[async_trait]
impl RunStore for FlakyStore {
    async fn load_schedule(&self, id: &str) -> Result<Option<ScheduleDefinition>, EngineError> {
        self.inner.load_schedule(id).await
    }

    async fn load_monitor(&self, id: &str) -> Result<Option<MonitorDefinition>, EngineError> {
        self.inner.load_monitor(id).await
    }

    async fn last_run(&self, entity: &EntityRef) -> Result<Option<RunRecord>, EngineError> {
        self.inner.last_run(entity).await
    }

    async fn insert_run(&self, run: &RunRecord) -> Result<(), EngineError> {
        self.inner.insert_run(run).await
    }

    async fn load_state(&self, entity: &EntityRef) -> Result<EntityRunState, EngineError> {
        self.inner.load_state(entity).await
    }

    async fn record_run(&self, run: &RunRecord, breaker: BreakerPolicy) -> Result<StateChange, EngineError> {
        if self.fail_next.swap(false, Ordering::SeqCst) {
            return Err(EngineError::Store("connection reset".into()));
        }
        self.inner.record_run(run, breaker).await
    }

    async fn enabled_channels(&self, workspace_id: &str) -> Result<Vec<NotificationChannel>, EngineError> {
        self.inner.enabled_channels(workspace_id).await
    }
}

#[tokio::test]
async fn failed_write_leaves_no_partial_history() {
    let inner = Arc::new(MemoryStore::new());
    inner.put_schedule(schedule("s1"));
    let store = Arc::new(FlakyStore { inner: inner.clone(), fail_next: AtomicBool::new(true) });
    let prober = Arc::new(ScriptedProber::default());
    prober.push(boom());
    prober.push(boom());
    let worker = DispatchWorker::new(
        store,
        prober,
        Dispatcher::new(Arc::new(RecordingFactory { outbox: Outbox::default(), reject: false })),
        ProbeConfig::default(),
        Tz::UTC,
    );

    let first = worker.handle_at(&JobPayload::schedule("s1"), t0()).await;
    assert!(matches!(first, Err(EngineError::Store(_))));
    assert!(inner.runs(&EntityRef::schedule("s1")).is_empty());
    assert_eq!(inner.state(&EntityRef::schedule("s1")), EntityRunState::default());

    // The redelivery writes history and counters together.
    let second = worker.handle_at(&JobPayload::schedule("s1"), t0()).await.unwrap();
    assert!(matches!(second, DispatchOutcome::Failed(_)));
    assert_eq!(inner.runs(&EntityRef::schedule("s1")).len(), 1);
    assert_eq!(inner.state(&EntityRef::schedule("s1")).consecutive_failures, 1);
}

// ── Circuit breaker ─────────────────────────────────────────────────

#[tokio::test]
async fn open_breaker_cancels_without_probing() {
    let h = Harness::new();
    let mut definition = schedule("s1");
    definition.circuit_breaker_threshold = 2;
    definition.circuit_breaker_duration_ms = 60_000;
    h.store.put_schedule(definition);
    h.prober.push(boom());
    h.prober.push(boom());

    h.schedule_at("s1", t0()).await;
    h.schedule_at("s1", t0()).await;
    let state = h.store.state(&EntityRef::schedule("s1"));
    assert_eq!(state.circuit_open_until, Some(t0() + Duration::seconds(60)));

    let canceled = h.schedule_at("s1", t0() + Duration::seconds(30)).await;
    let DispatchOutcome::Canceled(run) = canceled else {
        panic!("expected a canceled run");
    };
    assert_eq!(run.error.as_deref(), Some("Circuit open until 2026-03-02T12:01:00.000Z"));
    assert_eq!(h.prober.calls(), 2);
    assert_eq!(h.store.state(&EntityRef::schedule("s1")), state);

    let resumed = h.schedule_at("s1", t0() + Duration::seconds(61)).await;
    assert!(matches!(resumed, DispatchOutcome::Succeeded(_)));
    assert_eq!(h.prober.calls(), 3);
    assert_eq!(h.store.state(&EntityRef::schedule("s1")).circuit_open_until, None);
}

// ── Gating ──────────────────────────────────────────────────────────

#[tokio::test]
async fn condition_cancels_when_last_run_too_recent() {
    let h = Harness::new();
    let mut definition = schedule("s1");
    definition.conditions = Some(RunConditions {
        min_minutes_since_last_run: Some(10),
        ..Default::default()
    });
    h.store.put_schedule(definition);
    let previous = RunRecord::executed(
        EntityRef::schedule("s1"),
        t0() - Duration::minutes(4),
        100,
        Some(200),
        None,
        None,
    );
    h.store.insert_run(&previous).await.unwrap();

    let outcome = h.schedule_at("s1", t0()).await;
    let run = outcome.run().unwrap();
    assert_eq!(run.status, RunStatus::Canceled);
    assert_eq!(run.error.as_deref(), Some("Condition requires 10m since last run"));
    assert_eq!(h.prober.calls(), 0);
}

#[tokio::test]
async fn outside_window_is_canceled_and_counters_untouched() {
    let h = Harness::new();
    let mut definition = schedule("s1");
    definition.window = ActiveWindow::new("09:00", "10:00", Some("UTC"));
    h.store.put_schedule(definition);

    let outcome = h.schedule_at("s1", t0()).await;
    let run = outcome.run().unwrap();
    assert_eq!(run.status, RunStatus::Canceled);
    assert_eq!(run.error.as_deref(), Some("Outside active window"));
    assert_eq!(h.prober.calls(), 0);
    assert_eq!(h.store.state(&EntityRef::schedule("s1")), Default::default());
}

#[tokio::test]
async fn monitor_window_uses_its_timezone() {
    let h = Harness::new();
    let mut monitor = MonitorDefinition::http("m1", "w1", "https://example.com");
    // 12:00 UTC is 13:00 in Rome.
    monitor.window = ActiveWindow::new("13:00", "13:30", Some("Europe/Rome"));
    h.store.put_monitor(monitor);

    let outcome = h.worker.handle_at(&JobPayload::monitor("m1"), t0()).await.unwrap();
    assert!(matches!(outcome, DispatchOutcome::Succeeded(_)));
    assert_eq!(h.prober.calls(), 1);
}

#[tokio::test]
async fn missing_entity_is_skipped_without_record() {
    let h = Harness::new();
    assert_eq!(h.schedule_at("ghost", t0()).await, DispatchOutcome::Skipped);
    assert_eq!(
        h.worker.handle_at(&JobPayload::monitor("ghost"), t0()).await.unwrap(),
        DispatchOutcome::Skipped
    );
    assert!(h.store.runs(&EntityRef::schedule("ghost")).is_empty());
    assert_eq!(h.prober.calls(), 0);
}

#[tokio::test]
async fn deleted_entity_stops_running() {
    let h = Harness::new();
    h.store.put_schedule(schedule("s1"));
    assert!(matches!(h.schedule_at("s1", t0()).await, DispatchOutcome::Succeeded(_)));

    h.store.delete(&EntityRef::schedule("s1"));
    assert_eq!(h.schedule_at("s1", t0() + Duration::minutes(1)).await, DispatchOutcome::Skipped);
    assert_eq!(h.store.runs(&EntityRef::schedule("s1")).len(), 1);
}

#[tokio::test]
async fn disabled_entity_is_skipped() {
    let h = Harness::new();
    let mut definition = schedule("s1");
    definition.enabled = false;
    h.store.put_schedule(definition);

    assert_eq!(h.schedule_at("s1", t0()).await, DispatchOutcome::Skipped);
    assert!(h.store.runs(&EntityRef::schedule("s1")).is_empty());
}

// ── Real probe ──────────────────────────────────────────────────────

#[tokio::test]
async fn http_monitor_status_mismatch_fails() {
    use axum::http::StatusCode;
    use axum::routing::get;

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let router = axum::Router::new().route("/health", get(|| async { (StatusCode::SERVICE_UNAVAILABLE, "down") }));
    tokio::spawn(async move {
        axum::serve(listener, router).await.unwrap();
    });

    let store = Arc::new(MemoryStore::new());
    let mut monitor = MonitorDefinition::http("m1", "w1", &format!("http://{addr}/health"));
    monitor.expected_status = Some(200);
    store.put_monitor(monitor);
    let worker = DispatchWorker::new(
        store.clone(),
        Arc::new(NetworkProber::new().unwrap()),
        Dispatcher::new(Arc::new(RecordingFactory { outbox: Outbox::default(), reject: false })),
        ProbeConfig::default(),
        Tz::UTC,
    );

    let outcome = worker.handle(&JobPayload::monitor("m1")).await.unwrap();
    let DispatchOutcome::Failed(run) = outcome else {
        panic!("expected a failed run");
    };
    assert_eq!(run.status_code, Some(503));
    assert_eq!(run.error.as_deref(), Some("Expected 200, got 503"));
    assert!(run.latency_ms.is_some());
    assert_eq!(store.state(&EntityRef::monitor("m1")).consecutive_failures, 1);
}

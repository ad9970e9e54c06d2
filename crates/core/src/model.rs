use std::collections::BTreeMap;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::CoreError;

pub type EntityId = String;
pub type WorkspaceId = String;

/// Which of the two dispatchable entity families a job refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntityKind {
    Schedule,
    Monitor,
}

impl std::fmt::Display for EntityKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EntityKind::Schedule => write!(f, "schedule"),
            EntityKind::Monitor => write!(f, "monitor"),
        }
    }
}

impl EntityKind {
    /// Capitalized label used in alert titles ("Schedule failed: ...").
    pub fn label(&self) -> &'static str {
        match self {
            EntityKind::Schedule => "Schedule",
            EntityKind::Monitor => "Monitor",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RunStatus {
    Success,
    Failed,
    Canceled,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Success => "SUCCESS",
            RunStatus::Failed => "FAILED",
            RunStatus::Canceled => "CANCELED",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "SUCCESS" => Some(RunStatus::Success),
            "FAILED" => Some(RunStatus::Failed),
            "CANCELED" => Some(RunStatus::Canceled),
            _ => None,
        }
    }
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ── Shared definition parts ───────────────────────────────────

/// Daily time-of-day range outside which an entity must not run.
///
/// Bounds are `HH:mm` strings; missing or malformed bounds leave the
/// window unrestricted.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActiveWindow {
    #[serde(default)]
    pub from: Option<String>,
    #[serde(default)]
    pub to: Option<String>,
    #[serde(default)]
    pub timezone: Option<String>,
}

impl ActiveWindow {
    pub fn new(from: &str, to: &str, timezone: Option<&str>) -> Self {
        Self {
            from: Some(from.to_string()),
            to: Some(to.to_string()),
            timezone: timezone.map(str::to_string),
        }
    }
}

fn default_failure_threshold() -> u32 {
    3
}

fn default_true() -> bool {
    true
}

// ── Schedules ─────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Trigger {
    Cron {
        expression: String,
    },
    Interval {
        #[serde(rename = "everyMs")]
        every_ms: u64,
    },
    OneShot,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum HttpAuth {
    Bearer { token: String },
    Basic { username: String, password: String },
    Header { name: String, value: String },
}

/// A stored API request executed by a schedule.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApiRequest {
    pub method: String,
    pub url: String,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    #[serde(default)]
    pub query: BTreeMap<String, String>,
    #[serde(default)]
    pub body: Option<serde_json::Value>,
    #[serde(default)]
    pub timeout_ms: Option<u64>,
    #[serde(default = "default_true")]
    pub follow_redirects: bool,
    #[serde(default)]
    pub auth: Option<HttpAuth>,
}

impl ApiRequest {
    pub fn get(url: impl Into<String>) -> Self {
        Self {
            method: "GET".to_string(),
            url: url.into(),
            headers: BTreeMap::new(),
            query: BTreeMap::new(),
            body: None,
            timeout_ms: None,
            follow_redirects: true,
            auth: None,
        }
    }
}

/// Optional predicates gating a schedule run on its previous run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunConditions {
    #[serde(default)]
    pub requires_last_status: Option<RunStatus>,
    #[serde(default)]
    pub min_minutes_since_last_run: Option<u32>,
}

impl RunConditions {
    pub fn is_empty(&self) -> bool {
        self.requires_last_status.is_none() && self.min_minutes_since_last_run.is_none()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScheduleDefinition {
    pub id: EntityId,
    pub name: String,
    pub workspace_id: WorkspaceId,
    pub trigger: Trigger,
    pub request: ApiRequest,
    #[serde(default)]
    pub max_retries: u32,
    #[serde(default)]
    pub backoff_ms: Option<u64>,
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,
    #[serde(default)]
    pub circuit_breaker_threshold: u32,
    #[serde(default)]
    pub circuit_breaker_duration_ms: u64,
    #[serde(default)]
    pub alert_on_recovery: bool,
    #[serde(default)]
    pub window: ActiveWindow,
    #[serde(default)]
    pub conditions: Option<RunConditions>,
    #[serde(default = "default_true")]
    pub enabled: bool,
}

impl ScheduleDefinition {
    /// A minimal enabled interval schedule calling `GET url`.
    pub fn new(id: impl Into<String>, workspace_id: impl Into<String>, url: &str) -> Self {
        let id = id.into();
        Self {
            name: id.clone(),
            id,
            workspace_id: workspace_id.into(),
            trigger: Trigger::Interval { every_ms: 60_000 },
            request: ApiRequest::get(url),
            max_retries: 0,
            backoff_ms: None,
            failure_threshold: default_failure_threshold(),
            circuit_breaker_threshold: 0,
            circuit_breaker_duration_ms: 0,
            alert_on_recovery: false,
            window: ActiveWindow::default(),
            conditions: None,
            enabled: true,
        }
    }
}

// ── Monitors ──────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MonitorKind {
    Http,
    Tcp,
    Tls,
    Ping,
}

impl std::fmt::Display for MonitorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MonitorKind::Http => write!(f, "HTTP"),
            MonitorKind::Tcp => write!(f, "TCP"),
            MonitorKind::Tls => write!(f, "TLS"),
            MonitorKind::Ping => write!(f, "PING"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MonitorDefinition {
    pub id: EntityId,
    pub name: String,
    pub workspace_id: WorkspaceId,
    #[serde(rename = "type")]
    pub kind: MonitorKind,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub host: Option<String>,
    #[serde(default)]
    pub port: Option<u16>,
    #[serde(default)]
    pub timeout_ms: Option<u64>,
    #[serde(default)]
    pub expected_status: Option<u16>,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    #[serde(default)]
    pub interval_ms: Option<u64>,
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,
    #[serde(default)]
    pub alert_on_recovery: bool,
    #[serde(default)]
    pub window: ActiveWindow,
    #[serde(default = "default_true")]
    pub enabled: bool,
}

impl MonitorDefinition {
    /// A minimal enabled HTTP monitor against `url`.
    pub fn http(id: impl Into<String>, workspace_id: impl Into<String>, url: &str) -> Self {
        let id = id.into();
        Self {
            name: id.clone(),
            id,
            workspace_id: workspace_id.into(),
            kind: MonitorKind::Http,
            url: Some(url.to_string()),
            host: None,
            port: None,
            timeout_ms: None,
            expected_status: None,
            headers: BTreeMap::new(),
            interval_ms: None,
            failure_threshold: default_failure_threshold(),
            alert_on_recovery: false,
            window: ActiveWindow::default(),
            enabled: true,
        }
    }

    /// The host a socket-level probe (TCP/TLS/PING) connects to.
    pub fn require_host(&self) -> Result<&str, CoreError> {
        self.host
            .as_deref()
            .filter(|h| !h.is_empty())
            .ok_or_else(|| {
                CoreError::InvalidDefinition(format!("{} monitor {} has no host", self.kind, self.id))
            })
    }

    /// The URL an HTTP probe requests.
    pub fn require_url(&self) -> Result<&str, CoreError> {
        self.url
            .as_deref()
            .filter(|u| !u.is_empty())
            .ok_or_else(|| {
                CoreError::InvalidDefinition(format!("HTTP monitor {} has no url", self.id))
            })
    }
}

// ── Runtime records ───────────────────────────────────────────

/// Identifies one schedule or monitor.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EntityRef {
    pub kind: EntityKind,
    pub id: EntityId,
}

impl EntityRef {
    pub fn schedule(id: impl Into<String>) -> Self {
        Self { kind: EntityKind::Schedule, id: id.into() }
    }

    pub fn monitor(id: impl Into<String>) -> Self {
        Self { kind: EntityKind::Monitor, id: id.into() }
    }
}

impl std::fmt::Display for EntityRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.kind, self.id)
    }
}

/// One execution attempt of a schedule or monitor. Append-only.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunRecord {
    pub id: Uuid,
    pub entity: EntityRef,
    pub status: RunStatus,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub latency_ms: Option<u64>,
    pub status_code: Option<u16>,
    pub error: Option<String>,
    pub response: Option<serde_json::Value>,
}

impl RunRecord {
    /// A run that was preempted before the probe executed.
    pub fn canceled(entity: EntityRef, reason: impl Into<String>, now: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            entity,
            status: RunStatus::Canceled,
            started_at: now,
            finished_at: now,
            latency_ms: None,
            status_code: None,
            error: Some(reason.into()),
            response: None,
        }
    }

    /// A run that executed; status follows from the presence of an error.
    /// `started_at` is back-dated by the measured latency.
    pub fn executed(
        entity: EntityRef,
        finished_at: DateTime<Utc>,
        latency_ms: u64,
        status_code: Option<u16>,
        error: Option<String>,
        response: Option<serde_json::Value>,
    ) -> Self {
        let status = if error.is_some() {
            RunStatus::Failed
        } else {
            RunStatus::Success
        };
        Self {
            id: Uuid::new_v4(),
            entity,
            status,
            started_at: finished_at - Duration::milliseconds(latency_ms as i64),
            finished_at,
            latency_ms: Some(latency_ms),
            status_code,
            error,
            response,
        }
    }
}

/// Per-entity consecutive counters and circuit-breaker deadline.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EntityRunState {
    pub consecutive_failures: u32,
    pub consecutive_successes: u32,
    pub circuit_open_until: Option<DateTime<Utc>>,
}

impl EntityRunState {
    /// Whether the breaker is open at `now`.
    pub fn is_open_at(&self, now: DateTime<Utc>) -> bool {
        self.circuit_open_until.is_some_and(|until| until > now)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn executed_run_status_follows_error() {
        let now = Utc::now();
        let ok = RunRecord::executed(EntityRef::monitor("m1"), now, 120, Some(200), None, None);
        assert_eq!(ok.status, RunStatus::Success);
        assert_eq!(ok.started_at, now - Duration::milliseconds(120));

        let failed = RunRecord::executed(
            EntityRef::monitor("m1"),
            now,
            5,
            None,
            Some("connection refused".into()),
            None,
        );
        assert_eq!(failed.status, RunStatus::Failed);
    }

    #[test]
    fn canceled_run_carries_reason() {
        let run = RunRecord::canceled(EntityRef::schedule("s1"), "Outside active window", Utc::now());
        assert_eq!(run.status, RunStatus::Canceled);
        assert_eq!(run.error.as_deref(), Some("Outside active window"));
        assert_eq!(run.started_at, run.finished_at);
        assert!(run.latency_ms.is_none());
    }

    #[test]
    fn schedule_deserializes_with_defaults() {
        let json = r#"{
            "id": "s1",
            "name": "Nightly sync",
            "workspaceId": "w1",
            "trigger": { "type": "CRON", "expression": "0 3 * * *" },
            "request": { "method": "POST", "url": "https://api.example.com/sync" },
            "conditions": { "minMinutesSinceLastRun": 10 }
        }"#;
        let schedule: ScheduleDefinition = serde_json::from_str(json).unwrap();
        assert_eq!(schedule.failure_threshold, 3);
        assert!(schedule.enabled);
        assert!(schedule.request.follow_redirects);
        assert_eq!(
            schedule.trigger,
            Trigger::Cron { expression: "0 3 * * *".into() }
        );
        assert_eq!(
            schedule.conditions.unwrap().min_minutes_since_last_run,
            Some(10)
        );
    }

    #[test]
    fn auth_variants_deserialize() {
        let bearer: HttpAuth = serde_json::from_str(r#"{"type":"bearer","token":"t"}"#).unwrap();
        assert_eq!(bearer, HttpAuth::Bearer { token: "t".into() });
        let header: HttpAuth =
            serde_json::from_str(r#"{"type":"header","name":"X-Key","value":"v"}"#).unwrap();
        assert_eq!(header, HttpAuth::Header { name: "X-Key".into(), value: "v".into() });
    }

    #[test]
    fn monitor_requires_host_for_socket_probes() {
        let mut monitor = MonitorDefinition::http("m1", "w1", "https://example.com");
        monitor.kind = MonitorKind::Tcp;
        assert!(monitor.require_host().is_err());
        monitor.host = Some("example.com".into());
        assert_eq!(monitor.require_host().unwrap(), "example.com");
    }

    #[test]
    fn breaker_open_only_while_deadline_in_future() {
        let now = Utc::now();
        let mut state = EntityRunState::default();
        assert!(!state.is_open_at(now));
        state.circuit_open_until = Some(now + Duration::seconds(30));
        assert!(state.is_open_at(now));
        assert!(!state.is_open_at(now + Duration::seconds(31)));
    }

    #[test]
    fn run_status_string_roundtrip() {
        for status in [RunStatus::Success, RunStatus::Failed, RunStatus::Canceled] {
            assert_eq!(RunStatus::parse(status.as_str()), Some(status));
        }
        assert_eq!(RunStatus::parse("PENDING"), None);
    }
}

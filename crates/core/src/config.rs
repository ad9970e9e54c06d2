use std::env;

use serde::{Deserialize, Serialize};

/// Load .env file (silently ignores if missing).
pub fn load_dotenv() {
    dotenvy::dotenv().ok();
}

fn env_or(key: &str, default: &str) -> String {
    env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_opt(key: &str) -> Option<String> {
    env::var(key).ok().filter(|s| !s.is_empty())
}

/// Read a profiled env var: tries {PROFILE}_{KEY} first, falls back to {KEY}.
fn profiled_env_opt(profile: &str, key: &str) -> Option<String> {
    if !profile.is_empty() {
        let prefixed = format!("{}_{}", profile, key);
        if let Some(v) = env_opt(&prefixed) {
            return Some(v);
        }
    }
    env_opt(key)
}

fn profiled_env_or(profile: &str, key: &str, default: &str) -> String {
    profiled_env_opt(profile, key).unwrap_or_else(|| default.to_string())
}

fn profiled_env_u16(profile: &str, key: &str, default: u16) -> u16 {
    profiled_env_opt(profile, key)
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn profiled_env_u32(profile: &str, key: &str, default: u32) -> u32 {
    profiled_env_opt(profile, key)
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn profiled_env_u64(profile: &str, key: &str, default: u64) -> u64 {
    profiled_env_opt(profile, key)
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

// ── Top-level config ──────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Active profile name (empty = default).
    pub profile: String,
    pub worker: WorkerConfig,
    pub probe: ProbeConfig,
    pub smtp: SmtpConfig,
    pub notify: NotifyConfig,
    pub postgres: PostgresConfig,
    pub aws: AwsConfig,
    pub queue: QueueConfig,
}

impl Config {
    /// Build config from environment variables (call `load_dotenv()` first).
    /// Profile is read from `BEACON_PROFILE`. When set (e.g. `PROD`), every
    /// key is first looked up as `{PROFILE}_{KEY}`, falling back to `{KEY}`.
    pub fn from_env() -> Self {
        let profile = env_or("BEACON_PROFILE", "").to_uppercase();
        Self::for_profile(&profile)
    }

    /// Build config for a specific named profile (empty string = default).
    pub fn for_profile(profile: &str) -> Self {
        let p = profile.to_uppercase();
        let p = p.as_str();
        Self {
            profile: p.to_string(),
            worker: WorkerConfig::from_env_profiled(p),
            probe: ProbeConfig::from_env_profiled(p),
            smtp: SmtpConfig::from_env_profiled(p),
            notify: NotifyConfig::from_env_profiled(p),
            postgres: PostgresConfig::from_env_profiled(p),
            aws: AwsConfig::from_env_profiled(p),
            queue: QueueConfig::from_env_profiled(p),
        }
    }

    pub fn profile_label(&self) -> &str {
        if self.profile.is_empty() { "default" } else { &self.profile }
    }

    /// Print a redacted summary for startup logs.
    pub fn log_summary(&self) {
        tracing::info!("Config loaded (profile: {}):", self.profile_label());
        tracing::info!(
            "  worker:      concurrency={}, timezone={}, queue={}",
            self.worker.concurrency,
            self.worker.default_timezone,
            self.worker.queue_backend.as_str()
        );
        tracing::info!(
            "  probe:       http_timeout={}ms, monitor_timeout={}ms",
            self.probe.http_timeout_ms,
            self.probe.monitor_timeout_ms
        );
        tracing::info!(
            "  smtp:        host={}, port={}",
            self.smtp.host.as_deref().unwrap_or("(none)"),
            self.smtp.port
        );
        tracing::info!("  notify:      timeout={}ms", self.notify.timeout_ms);
        tracing::info!("  postgres:    host={}, db={}", self.postgres.host, self.postgres.database);
        tracing::info!(
            "  queue:       url={}",
            if self.queue.queue_url.is_empty() { "(none)" } else { &self.queue.queue_url }
        );
    }
}

// ── Worker ────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QueueBackend {
    /// In-process timers; registrations live only as long as the process.
    Local,
    Sqs,
}

impl QueueBackend {
    pub fn as_str(&self) -> &'static str {
        match self {
            QueueBackend::Local => "local",
            QueueBackend::Sqs => "sqs",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerConfig {
    /// Number of jobs handled concurrently.
    pub concurrency: usize,
    /// IANA timezone for active windows that do not name one.
    pub default_timezone: String,
    pub queue_backend: QueueBackend,
    pub poll_batch_size: u32,
    pub shutdown_timeout_secs: u64,
}

impl WorkerConfig {
    fn from_env_profiled(p: &str) -> Self {
        let queue_backend = match profiled_env_or(p, "QUEUE_BACKEND", "local").to_lowercase().as_str() {
            "sqs" => QueueBackend::Sqs,
            _ => QueueBackend::Local,
        };
        Self {
            concurrency: profiled_env_u32(p, "WORKER_CONCURRENCY", 4).max(1) as usize,
            default_timezone: profiled_env_or(p, "DEFAULT_TIMEZONE", "Europe/Rome"),
            queue_backend,
            poll_batch_size: profiled_env_u32(p, "POLL_BATCH_SIZE", 10),
            shutdown_timeout_secs: profiled_env_u64(p, "SHUTDOWN_TIMEOUT_SECS", 10),
        }
    }
}

// ── Probe ─────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProbeConfig {
    /// Timeout for schedule API requests that do not set their own.
    pub http_timeout_ms: u64,
    /// Timeout for monitor probes that do not set their own.
    pub monitor_timeout_ms: u64,
}

impl ProbeConfig {
    fn from_env_profiled(p: &str) -> Self {
        Self {
            http_timeout_ms: profiled_env_u64(p, "HTTP_TIMEOUT_MS", 15_000),
            monitor_timeout_ms: profiled_env_u64(p, "MONITOR_TIMEOUT_MS", 10_000),
        }
    }
}

impl Default for ProbeConfig {
    fn default() -> Self {
        Self {
            http_timeout_ms: 15_000,
            monitor_timeout_ms: 10_000,
        }
    }
}

// ── SMTP ──────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SmtpConfig {
    pub host: Option<String>,
    pub port: u16,
    pub username: Option<String>,
    pub password: Option<String>,
    /// Default sender used when a channel does not override it.
    pub from: String,
}

impl SmtpConfig {
    fn from_env_profiled(p: &str) -> Self {
        Self {
            host: profiled_env_opt(p, "SMTP_HOST"),
            port: profiled_env_u16(p, "SMTP_PORT", 587),
            username: profiled_env_opt(p, "SMTP_USER"),
            password: profiled_env_opt(p, "SMTP_PASS"),
            from: profiled_env_or(p, "SMTP_FROM", "Beacon <no-reply@localhost>"),
        }
    }

    pub fn is_configured(&self) -> bool {
        self.host.is_some()
    }
}

// ── Notifications ─────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NotifyConfig {
    /// Upper bound for one channel delivery, connect to response.
    pub timeout_ms: u64,
}

impl NotifyConfig {
    fn from_env_profiled(p: &str) -> Self {
        Self {
            timeout_ms: profiled_env_u64(p, "NOTIFY_TIMEOUT_MS", 10_000).max(1),
        }
    }
}

impl Default for NotifyConfig {
    fn default() -> Self {
        Self { timeout_ms: 10_000 }
    }
}

// ── PostgreSQL ────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PostgresConfig {
    pub host: String,
    pub port: u16,
    pub database: String,
    pub username: Option<String>,
    pub password: Option<String>,
    pub ssl_mode: String,
    pub max_connections: u32,
}

impl PostgresConfig {
    fn from_env_profiled(p: &str) -> Self {
        Self {
            host: profiled_env_or(p, "PG_HOST", "localhost"),
            port: profiled_env_u16(p, "PG_PORT", 5432),
            database: profiled_env_or(p, "PG_DATABASE", "beacon"),
            username: profiled_env_opt(p, "PG_USERNAME"),
            password: profiled_env_opt(p, "PG_PASSWORD"),
            ssl_mode: profiled_env_or(p, "PG_SSL_MODE", "prefer"),
            max_connections: profiled_env_u32(p, "PG_MAX_CONNECTIONS", 10),
        }
    }

    pub fn connection_string(&self) -> String {
        let user = self.username.as_deref().unwrap_or("postgres");
        let pass = self.password.as_deref().unwrap_or("");
        format!(
            "postgres://{}:{}@{}:{}/{}?sslmode={}",
            user, pass, self.host, self.port, self.database, self.ssl_mode
        )
    }

    pub fn is_configured(&self) -> bool {
        self.username.is_some()
    }
}

// ── AWS / SQS ─────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AwsConfig {
    pub region: String,
    pub access_key_id: Option<String>,
    pub secret_access_key: Option<String>,
    pub session_token: Option<String>,
    pub endpoint_url: Option<String>,
}

impl AwsConfig {
    fn from_env_profiled(p: &str) -> Self {
        Self {
            region: profiled_env_or(p, "AWS_REGION", "eu-south-1"),
            access_key_id: profiled_env_opt(p, "AWS_ACCESS_KEY_ID"),
            secret_access_key: profiled_env_opt(p, "AWS_SECRET_ACCESS_KEY"),
            session_token: profiled_env_opt(p, "AWS_SESSION_TOKEN"),
            endpoint_url: profiled_env_opt(p, "QUEUE_AWS_ENDPOINT_URL"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueConfig {
    pub queue_url: String,
    pub dlq_url: Option<String>,
    pub visibility_timeout_secs: u32,
    pub poll_interval_ms: u64,
}

impl QueueConfig {
    fn from_env_profiled(p: &str) -> Self {
        Self {
            queue_url: profiled_env_or(p, "QUEUE_URL", ""),
            dlq_url: profiled_env_opt(p, "QUEUE_DLQ_URL"),
            visibility_timeout_secs: profiled_env_u32(p, "QUEUE_VISIBILITY_TIMEOUT_SECS", 60),
            poll_interval_ms: profiled_env_u64(p, "QUEUE_POLL_INTERVAL_MS", 1_000),
        }
    }
}

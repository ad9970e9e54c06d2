//! Probe specifications built from schedule and monitor definitions.

use std::collections::BTreeMap;
use std::time::Duration;

use beacon_core::config::ProbeConfig;
use beacon_core::{CoreError, HttpAuth, MonitorDefinition, MonitorKind, ScheduleDefinition};

/// Port used by PING and TLS probes when the monitor does not set one.
pub const DEFAULT_SECURE_PORT: u16 = 443;

#[derive(Debug, Clone, PartialEq)]
pub struct HttpProbe {
    pub method: String,
    pub url: String,
    pub headers: BTreeMap<String, String>,
    pub query: BTreeMap<String, String>,
    pub body: Option<serde_json::Value>,
    pub auth: Option<HttpAuth>,
    pub follow_redirects: bool,
    pub timeout: Duration,
    pub expected_status: Option<u16>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SocketProbe {
    pub host: String,
    pub port: u16,
    pub timeout: Duration,
}

/// One network action with its timeout.
#[derive(Debug, Clone, PartialEq)]
pub enum ProbeSpec {
    Http(HttpProbe),
    Tcp(SocketProbe),
    Tls(SocketProbe),
    /// TCP reachability check standing in for ICMP echo, which the worker
    /// cannot send without raw-socket privileges.
    Ping(SocketProbe),
}

impl ProbeSpec {
    /// Short label used in timeout messages and logs ("HTTP", "TCP", ...).
    pub fn label(&self) -> &'static str {
        match self {
            ProbeSpec::Http(_) => "HTTP",
            ProbeSpec::Tcp(_) => "TCP",
            ProbeSpec::Tls(_) => "TLS",
            ProbeSpec::Ping(_) => "PING",
        }
    }

    /// The stored API request of a schedule.
    pub fn for_schedule(schedule: &ScheduleDefinition, config: &ProbeConfig) -> Self {
        let request = &schedule.request;
        ProbeSpec::Http(HttpProbe {
            method: request.method.clone(),
            url: request.url.clone(),
            headers: request.headers.clone(),
            query: request.query.clone(),
            body: request.body.clone(),
            auth: request.auth.clone(),
            follow_redirects: request.follow_redirects,
            timeout: Duration::from_millis(request.timeout_ms.unwrap_or(config.http_timeout_ms)),
            expected_status: None,
        })
    }

    /// The reachability probe of a monitor. Fails when the definition lacks
    /// the url or host its kind needs.
    pub fn for_monitor(monitor: &MonitorDefinition, config: &ProbeConfig) -> Result<Self, CoreError> {
        let timeout = Duration::from_millis(monitor.timeout_ms.unwrap_or(config.monitor_timeout_ms));
        let spec = match monitor.kind {
            MonitorKind::Http => ProbeSpec::Http(HttpProbe {
                method: "GET".to_string(),
                url: monitor.require_url()?.to_string(),
                headers: monitor.headers.clone(),
                query: BTreeMap::new(),
                body: None,
                auth: None,
                follow_redirects: true,
                timeout,
                expected_status: monitor.expected_status,
            }),
            MonitorKind::Tcp => ProbeSpec::Tcp(SocketProbe {
                host: monitor.require_host()?.to_string(),
                port: monitor.port.ok_or_else(|| {
                    CoreError::InvalidDefinition(format!("TCP monitor {} has no port", monitor.id))
                })?,
                timeout,
            }),
            MonitorKind::Tls => ProbeSpec::Tls(SocketProbe {
                host: monitor.require_host()?.to_string(),
                port: monitor.port.unwrap_or(DEFAULT_SECURE_PORT),
                timeout,
            }),
            MonitorKind::Ping => ProbeSpec::Ping(SocketProbe {
                host: monitor.require_host()?.to_string(),
                port: monitor.port.unwrap_or(DEFAULT_SECURE_PORT),
                timeout,
            }),
        };
        Ok(spec)
    }
}

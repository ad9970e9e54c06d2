use async_trait::async_trait;
use tokio_rustls::TlsConnector;

use crate::result::ProbeResult;
use crate::spec::ProbeSpec;
use crate::{http, socket, tls};

#[derive(Debug, thiserror::Error)]
pub enum ProbeError {
    #[error("HTTP client error: {0}")]
    Client(#[from] reqwest::Error),

    #[error("TLS configuration error: {0}")]
    Tls(#[from] rustls::Error),
}

/// Executes probes. Never fails: every problem ends up in
/// [`ProbeResult::error`].
#[async_trait]
pub trait Prober: Send + Sync {
    async fn execute(&self, spec: &ProbeSpec) -> ProbeResult;
}

/// Real network prober.
///
/// reqwest fixes the redirect policy per client, so one client follows
/// redirects and the other returns the 3xx as is.
#[derive(Clone)]
pub struct NetworkProber {
    following: reqwest::Client,
    non_following: reqwest::Client,
    tls: TlsConnector,
}

impl NetworkProber {
    pub fn new() -> Result<Self, ProbeError> {
        let following = reqwest::Client::builder()
            .redirect(reqwest::redirect::Policy::limited(10))
            .build()?;
        let non_following = reqwest::Client::builder()
            .redirect(reqwest::redirect::Policy::none())
            .build()?;

        Ok(Self {
            following,
            non_following,
            tls: tls::connector()?,
        })
    }
}

#[async_trait]
impl Prober for NetworkProber {
    async fn execute(&self, spec: &ProbeSpec) -> ProbeResult {
        let result = match spec {
            ProbeSpec::Http(probe) => {
                let client = if probe.follow_redirects {
                    &self.following
                } else {
                    &self.non_following
                };
                http::execute(client, probe).await
            }
            ProbeSpec::Tcp(probe) | ProbeSpec::Ping(probe) => {
                socket::connect(probe, spec.label()).await
            }
            ProbeSpec::Tls(probe) => tls::handshake(&self.tls, probe).await,
        };

        tracing::debug!(
            kind = spec.label(),
            status = ?result.status_code,
            latency_ms = result.latency_ms,
            error = ?result.error,
            "probe finished"
        );
        result
    }
}

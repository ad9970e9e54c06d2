//! TLS handshake probe reporting the peer certificate.

use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Utc};
use rustls::pki_types::ServerName;
use rustls::{ClientConfig, RootCertStore};
use tokio::net::TcpStream;
use tokio_rustls::TlsConnector;

use crate::result::{elapsed_ms, ProbeResult};
use crate::spec::SocketProbe;

/// Build a connector trusting the bundled Mozilla roots.
pub fn connector() -> Result<TlsConnector, rustls::Error> {
    let mut roots = RootCertStore::empty();
    roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());

    let config = ClientConfig::builder_with_provider(Arc::new(
        rustls::crypto::ring::default_provider(),
    ))
    .with_safe_default_protocol_versions()?
    .with_root_certificates(roots)
    .with_no_client_auth();

    Ok(TlsConnector::from(Arc::new(config)))
}

pub async fn handshake(connector: &TlsConnector, probe: &SocketProbe) -> ProbeResult {
    let start = Instant::now();

    let server_name = match ServerName::try_from(probe.host.clone()) {
        Ok(name) => name,
        Err(e) => return ProbeResult::failure(format!("Invalid host: {e}"), elapsed_ms(start)),
    };
    let addr = format!("{}:{}", probe.host, probe.port);

    let outcome = tokio::time::timeout(probe.timeout, async {
        let tcp = TcpStream::connect(&addr).await?;
        connector.connect(server_name, tcp).await
    })
    .await;

    let latency_ms = elapsed_ms(start);
    match outcome {
        Err(_) => ProbeResult::failure("TLS timeout", latency_ms),
        Ok(Err(e)) => ProbeResult::failure(e.to_string(), latency_ms),
        Ok(Ok(stream)) => {
            let (_, session) = stream.get_ref();
            let certificate = session
                .peer_certificates()
                .and_then(|certs| certs.first())
                .and_then(|cert| describe_certificate(cert.as_ref()));

            ProbeResult {
                response: certificate,
                ..ProbeResult::reachable(latency_ms)
            }
        }
    }
}

/// `{validTo, subject, issuer}` for a DER certificate, `None` if unparsable.
pub(crate) fn describe_certificate(der: &[u8]) -> Option<serde_json::Value> {
    let (_, cert) = x509_parser::parse_x509_certificate(der).ok()?;
    let valid_to = DateTime::<Utc>::from_timestamp(cert.validity().not_after.timestamp(), 0)
        .map(|dt| dt.to_rfc3339());

    Some(serde_json::json!({
        "validTo": valid_to,
        "subject": cert.subject().to_string(),
        "issuer": cert.issuer().to_string(),
    }))
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    #[test]
    fn connector_builds_with_bundled_roots() {
        assert!(connector().is_ok());
    }

    #[test]
    fn garbage_certificate_is_ignored() {
        assert!(describe_certificate(b"not a certificate").is_none());
    }

    #[tokio::test]
    async fn plain_tcp_server_fails_handshake() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            if let Ok((socket, _)) = listener.accept().await {
                drop(socket);
            }
        });

        let result = handshake(
            &connector().unwrap(),
            &SocketProbe { host: "localhost".into(), port, timeout: Duration::from_secs(2) },
        )
        .await;
        assert!(!result.is_success());
    }

    #[tokio::test]
    #[ignore] // requires network access
    async fn public_host_reports_certificate() {
        let result = handshake(
            &connector().unwrap(),
            &SocketProbe { host: "example.com".into(), port: 443, timeout: Duration::from_secs(10) },
        )
        .await;
        assert!(result.is_success(), "{:?}", result.error);
        let cert = result.response.unwrap();
        assert!(cert["validTo"].is_string());
        assert!(cert["issuer"].is_string());
    }
}

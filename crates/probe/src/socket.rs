//! Plain TCP connect probes (TCP and PING monitors).

use std::time::Instant;

use tokio::net::TcpStream;

use crate::result::{elapsed_ms, ProbeResult};
use crate::spec::SocketProbe;

/// Open and drop a TCP connection. `label` names the probe in the timeout
/// message ("TCP timeout", "PING timeout").
pub async fn connect(probe: &SocketProbe, label: &str) -> ProbeResult {
    let start = Instant::now();
    let addr = format!("{}:{}", probe.host, probe.port);

    match tokio::time::timeout(probe.timeout, TcpStream::connect(&addr)).await {
        Err(_) => ProbeResult::failure(format!("{label} timeout"), elapsed_ms(start)),
        Ok(Err(e)) => ProbeResult::failure(e.to_string(), elapsed_ms(start)),
        Ok(Ok(stream)) => {
            let latency_ms = elapsed_ms(start);
            drop(stream);
            tracing::debug!(addr = %addr, latency_ms, "{} connect ok", label);
            ProbeResult::reachable(latency_ms)
        }
    }
}

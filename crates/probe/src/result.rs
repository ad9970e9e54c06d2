//! Normalized probe outcome.

use std::time::Instant;

use serde::{Deserialize, Serialize};

/// Outcome of one probe. `error` is `None` exactly when the probe succeeded.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProbeResult {
    pub status_code: Option<u16>,
    pub latency_ms: u64,
    pub response: Option<serde_json::Value>,
    pub error: Option<String>,
}

impl ProbeResult {
    pub fn failure(error: impl Into<String>, latency_ms: u64) -> Self {
        Self {
            status_code: None,
            latency_ms,
            response: None,
            error: Some(error.into()),
        }
    }

    /// Socket-level success. Status 200 marks reachability for TCP/TLS/PING.
    pub fn reachable(latency_ms: u64) -> Self {
        Self {
            status_code: Some(200),
            latency_ms,
            response: None,
            error: None,
        }
    }

    pub fn is_success(&self) -> bool {
        self.error.is_none()
    }

    /// Overwrite the error when a status was returned and differs from
    /// `expected`. Latency, status and payload are kept.
    pub fn expect_status(mut self, expected: Option<u16>) -> Self {
        if let (Some(expected), Some(actual)) = (expected, self.status_code) {
            if expected != actual {
                self.error = Some(format!("Expected {expected}, got {actual}"));
            }
        }
        self
    }
}

pub(crate) fn elapsed_ms(start: Instant) -> u64 {
    start.elapsed().as_millis() as u64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mismatched_status_becomes_error() {
        let result = ProbeResult {
            status_code: Some(503),
            latency_ms: 42,
            response: Some(serde_json::json!("unavailable")),
            error: None,
        }
        .expect_status(Some(200));

        assert_eq!(result.error.as_deref(), Some("Expected 200, got 503"));
        assert_eq!(result.status_code, Some(503));
        assert_eq!(result.latency_ms, 42);
        assert!(result.response.is_some());
    }

    #[test]
    fn matching_status_stays_successful() {
        let result = ProbeResult::reachable(7).expect_status(Some(200));
        assert!(result.is_success());
    }

    #[test]
    fn transport_error_is_not_overwritten() {
        let result = ProbeResult::failure("connection refused", 3).expect_status(Some(200));
        assert_eq!(result.error.as_deref(), Some("connection refused"));
    }
}

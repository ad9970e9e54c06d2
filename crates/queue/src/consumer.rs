//! Queue consumer trait and types.

use std::fmt;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::QueueError;
use crate::job::JobPayload;

/// A raw job message received from a queue.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueMessage {
    /// Provider message id.
    pub id: String,
    /// JSON body, normally a [`JobPayload`].
    pub body: String,
    /// Handle for ack/nack (SQS receipt handle, local delivery id).
    pub receipt_handle: String,
    /// When the message was enqueued.
    pub timestamp: DateTime<Utc>,
    /// 1 on first delivery, incremented on each redelivery.
    pub attempt_count: u32,
}

impl QueueMessage {
    pub fn payload(&self) -> Result<JobPayload, QueueError> {
        JobPayload::parse(&self.body)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct QueueHealth {
    pub connected: bool,
    /// Messages waiting to be delivered.
    pub approximate_message_count: Option<u64>,
    /// Messages given up on after their last attempt.
    pub dead_lettered: Option<u64>,
    pub provider: String,
}

impl fmt::Display for QueueHealth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "QueueHealth {{ provider: {}, connected: {}, messages: {:?}, dead_lettered: {:?} }}",
            self.provider, self.connected, self.approximate_message_count, self.dead_lettered
        )
    }
}

/// At-least-once consumer backend.
///
/// A message that is neither acked nor nacked is eventually redelivered by
/// the provider; a nacked message is redelivered according to the
/// provider's retry policy.
#[async_trait]
pub trait QueueConsumer: Send + Sync {
    /// Poll up to `max_messages`. May wait for the provider's long-poll
    /// timeout; returns an empty vec when nothing arrived.
    async fn poll_batch(&self, max_messages: u32) -> Result<Vec<QueueMessage>, QueueError>;

    /// Handler succeeded: remove the message.
    async fn ack(&self, receipt_handle: &str) -> Result<(), QueueError>;

    /// Handler failed: hand the message back for retry.
    async fn nack(&self, receipt_handle: &str) -> Result<(), QueueError>;

    async fn health_check(&self) -> Result<QueueHealth, QueueError>;

    /// Approximate dead-letter depth, when the provider has one.
    async fn dlq_depth(&self) -> Result<Option<u64>, QueueError> {
        Ok(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn message_body_parses_as_payload() {
        let msg = QueueMessage {
            id: "msg-1".to_string(),
            body: r#"{"kind":"monitor","entityId":"m-42"}"#.to_string(),
            receipt_handle: "rh-1".to_string(),
            timestamp: Utc::now(),
            attempt_count: 1,
        };
        let payload = msg.payload().unwrap();
        assert_eq!(payload, JobPayload::monitor("m-42"));
    }

    #[test]
    fn health_display_includes_dead_letters() {
        let health = QueueHealth {
            connected: true,
            approximate_message_count: Some(3),
            dead_lettered: Some(1),
            provider: "local".to_string(),
        };
        let display = health.to_string();
        assert!(display.contains("provider: local"));
        assert!(display.contains("dead_lettered: Some(1)"));
    }
}

//! Job consumer over AWS SQS.
//!
//! The producer publishes each job as a [`JobPayload`] body, with its retry
//! budget in two message attributes: `attempts` (deliveries allowed,
//! first included) and `backoffMs` (delay before each redelivery). A nack
//! hides the message for the backoff while attempts remain. After the last
//! attempt the message is moved to the dead-letter queue. Jobs published
//! without a budget are left to the queue's own redrive policy.
//! Malformed bodies never reach the worker; they are dead-lettered on
//! receipt.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use aws_credential_types::Credentials;
use aws_sdk_sqs::config::BehaviorVersion;
use aws_sdk_sqs::types::{MessageAttributeValue, MessageSystemAttributeName, QueueAttributeName};
use aws_sdk_sqs::Client;
use chrono::{TimeZone, Utc};
use tracing::{debug, error, info, warn};

use beacon_core::config::{AwsConfig, QueueConfig};

use crate::consumer::{QueueConsumer, QueueHealth, QueueMessage};
use crate::error::QueueError;
use crate::job::JobPayload;

/// SQS caps a single receive at 10 messages.
const MAX_RECEIVE: u32 = 10;
const LONG_POLL_SECS: i32 = 20;
/// Largest visibility timeout SQS accepts (12 hours).
const MAX_VISIBILITY_SECS: u64 = 43_200;

pub const ATTEMPTS_ATTRIBUTE: &str = "attempts";
pub const BACKOFF_ATTRIBUTE: &str = "backoffMs";
const REASON_ATTRIBUTE: &str = "deadLetterReason";

/// How often a job may be delivered and how long to wait in between.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryBudget {
    pub attempts: u32,
    pub backoff: Duration,
}

impl RetryBudget {
    /// `None` when the message carries no usable `attempts` attribute.
    pub fn from_attributes(attributes: Option<&HashMap<String, MessageAttributeValue>>) -> Option<Self> {
        let attributes = attributes?;
        let number = |name: &str| -> Option<u64> {
            attributes
                .get(name)
                .and_then(|value| value.string_value())
                .and_then(|raw| raw.trim().parse().ok())
        };
        let attempts = number(ATTEMPTS_ATTRIBUTE).and_then(|n| u32::try_from(n).ok())?;
        Some(Self {
            attempts: attempts.max(1),
            backoff: Duration::from_millis(number(BACKOFF_ATTRIBUTE).unwrap_or(0)),
        })
    }

    /// What to do with a delivery that failed on `attempt` (1-based).
    pub fn on_failure(&self, attempt: u32) -> NackAction {
        if attempt >= self.attempts {
            NackAction::DeadLetter
        } else {
            NackAction::RetryAfter(visibility_secs(self.backoff))
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NackAction {
    /// Hide the message for this many seconds, then redeliver.
    RetryAfter(i32),
    DeadLetter,
}

/// Backoff as a visibility timeout: whole seconds, rounded up, capped.
fn visibility_secs(backoff: Duration) -> i32 {
    let millis = u64::try_from(backoff.as_millis()).unwrap_or(u64::MAX);
    let secs = millis.div_ceil(1000).min(MAX_VISIBILITY_SECS);
    i32::try_from(secs).unwrap_or(i32::MAX)
}

fn receive_count(attributes: Option<&HashMap<MessageSystemAttributeName, String>>) -> u32 {
    attributes
        .and_then(|attrs| attrs.get(&MessageSystemAttributeName::ApproximateReceiveCount))
        .and_then(|count| count.parse().ok())
        .unwrap_or(1)
}

/// A delivery handed to the worker and not yet acked or nacked.
#[derive(Debug, Clone)]
struct InFlight {
    message_id: String,
    body: String,
    attempt: u32,
    budget: Option<RetryBudget>,
}

pub struct SqsConsumer {
    client: Client,
    queue_url: String,
    dlq_url: Option<String>,
    visibility_timeout_secs: i32,
    in_flight: Mutex<HashMap<String, InFlight>>,
    dead_lettered: AtomicU64,
}

fn build_client(aws: &AwsConfig) -> Client {
    // Configured by hand so a generic AWS_ENDPOINT_URL cannot redirect jobs.
    let mut config = aws_sdk_sqs::Config::builder()
        .region(aws_sdk_sqs::config::Region::new(aws.region.clone()))
        .behavior_version(BehaviorVersion::latest());

    if let (Some(key_id), Some(secret)) = (&aws.access_key_id, &aws.secret_access_key) {
        let credentials = Credentials::new(key_id, secret, aws.session_token.clone(), None, "beacon-static");
        config = config.credentials_provider(credentials);
    }
    if let Some(endpoint) = aws.endpoint_url.as_deref().filter(|e| !e.is_empty()) {
        let endpoint = if endpoint.contains("://") {
            endpoint.to_string()
        } else {
            format!("https://{endpoint}")
        };
        config = config.endpoint_url(endpoint);
    }
    Client::from_conf(config.build())
}

impl SqsConsumer {
    pub async fn new(aws: &AwsConfig, queue: &QueueConfig) -> Result<Self, QueueError> {
        if queue.queue_url.is_empty() {
            return Err(QueueError::Connection("QUEUE_URL is not set".to_string()));
        }
        if queue.dlq_url.is_none() {
            warn!("QUEUE_DLQ_URL is not set, exhausted jobs will be dropped");
        }
        info!(queue_url = %queue.queue_url, region = %aws.region, "SQS job consumer ready");

        Ok(Self {
            client: build_client(aws),
            queue_url: queue.queue_url.clone(),
            dlq_url: queue.dlq_url.clone(),
            visibility_timeout_secs: i32::try_from(queue.visibility_timeout_secs).unwrap_or(i32::MAX),
            in_flight: Mutex::new(HashMap::new()),
            dead_lettered: AtomicU64::new(0),
        })
    }

    fn in_flight(&self) -> MutexGuard<'_, HashMap<String, InFlight>> {
        self.in_flight.lock().unwrap_or_else(PoisonError::into_inner)
    }

    async fn delete(&self, receipt_handle: &str) -> Result<(), QueueError> {
        self.client
            .delete_message()
            .queue_url(&self.queue_url)
            .receipt_handle(receipt_handle)
            .send()
            .await
            .map_err(|e| QueueError::Ack(format!("SQS delete failed: {e:?}")))?;
        Ok(())
    }

    async fn hide_for(&self, receipt_handle: &str, secs: i32) -> Result<(), QueueError> {
        self.client
            .change_message_visibility()
            .queue_url(&self.queue_url)
            .receipt_handle(receipt_handle)
            .visibility_timeout(secs)
            .send()
            .await
            .map_err(|e| QueueError::Provider(format!("SQS visibility change failed: {e:?}")))?;
        Ok(())
    }

    /// Copy the body to the dead-letter queue, then delete the original.
    /// Without a dead-letter queue the job is only deleted.
    async fn dead_letter(&self, receipt_handle: &str, body: &str, reason: &str) -> Result<(), QueueError> {
        if let Some(dlq_url) = &self.dlq_url {
            let reason_value = MessageAttributeValue::builder()
                .data_type("String")
                .string_value(reason)
                .build()
                .map_err(|e| QueueError::Provider(format!("invalid message attribute: {e}")))?;
            self.client
                .send_message()
                .queue_url(dlq_url)
                .message_body(body)
                .message_attributes(REASON_ATTRIBUTE, reason_value)
                .send()
                .await
                .map_err(|e| QueueError::Provider(format!("SQS dead-letter send failed: {e:?}")))?;
        } else {
            error!(reason, body, "No dead-letter queue configured, dropping job");
        }
        self.delete(receipt_handle).await?;
        self.dead_lettered.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    async fn queue_depth(&self, url: &str) -> Result<Option<u64>, QueueError> {
        let resp = self
            .client
            .get_queue_attributes()
            .queue_url(url)
            .attribute_names(QueueAttributeName::ApproximateNumberOfMessages)
            .send()
            .await
            .map_err(|e| QueueError::Connection(format!("SQS attributes request failed: {e:?}")))?;
        Ok(resp
            .attributes()
            .and_then(|attrs| attrs.get(&QueueAttributeName::ApproximateNumberOfMessages))
            .and_then(|v| v.parse().ok()))
    }
}

#[async_trait]
impl QueueConsumer for SqsConsumer {
    async fn poll_batch(&self, max_messages: u32) -> Result<Vec<QueueMessage>, QueueError> {
        let resp = self
            .client
            .receive_message()
            .queue_url(&self.queue_url)
            .max_number_of_messages(max_messages.clamp(1, MAX_RECEIVE) as i32)
            .wait_time_seconds(LONG_POLL_SECS)
            .visibility_timeout(self.visibility_timeout_secs)
            .message_system_attribute_names(MessageSystemAttributeName::All)
            .message_attribute_names("All")
            .send()
            .await
            .map_err(|e| QueueError::Connection(format!("SQS receive failed: {e:?}")))?;

        let received = resp.messages.unwrap_or_default();
        let mut jobs = Vec::with_capacity(received.len());
        for msg in received {
            let Some(receipt_handle) = msg.receipt_handle().map(str::to_string) else {
                warn!(message_id = ?msg.message_id(), "SQS message without receipt handle, skipping");
                continue;
            };
            let message_id = msg.message_id().unwrap_or("unknown").to_string();
            let body = msg.body().unwrap_or_default().to_string();

            let payload = match JobPayload::parse(&body) {
                Ok(payload) => payload,
                Err(e) => {
                    warn!(%message_id, error = %e, "Dead-lettering malformed job");
                    if let Err(e) = self.dead_letter(&receipt_handle, &body, "malformed payload").await {
                        // It stays on the queue and comes back after the visibility timeout.
                        error!(%message_id, error = %e, "Could not dead-letter malformed job");
                    }
                    continue;
                }
            };

            let attempt = receive_count(msg.attributes());
            let budget = RetryBudget::from_attributes(msg.message_attributes());
            debug!(%message_id, entity = %payload.entity(), attempt, ?budget, "Job received");

            let timestamp = msg
                .attributes()
                .and_then(|attrs| attrs.get(&MessageSystemAttributeName::SentTimestamp))
                .and_then(|ts| ts.parse::<i64>().ok())
                .and_then(|ms| Utc.timestamp_millis_opt(ms).single())
                .unwrap_or_else(Utc::now);

            self.in_flight().insert(
                receipt_handle.clone(),
                InFlight { message_id: message_id.clone(), body: body.clone(), attempt, budget },
            );
            jobs.push(QueueMessage { id: message_id, body, receipt_handle, timestamp, attempt_count: attempt });
        }
        Ok(jobs)
    }

    async fn ack(&self, receipt_handle: &str) -> Result<(), QueueError> {
        self.in_flight().remove(receipt_handle);
        self.delete(receipt_handle).await
    }

    async fn nack(&self, receipt_handle: &str) -> Result<(), QueueError> {
        let settled = self.in_flight().remove(receipt_handle);
        let Some(delivery) = settled else {
            // Not ours (or already settled): let the queue's policy decide.
            return self.hide_for(receipt_handle, 0).await;
        };

        match delivery.budget.map(|budget| budget.on_failure(delivery.attempt)) {
            Some(NackAction::DeadLetter) => {
                warn!(
                    message_id = %delivery.message_id,
                    attempt = delivery.attempt,
                    "Job attempts exhausted, dead-lettering"
                );
                self.dead_letter(receipt_handle, &delivery.body, "attempts exhausted").await
            }
            Some(NackAction::RetryAfter(secs)) => {
                debug!(message_id = %delivery.message_id, attempt = delivery.attempt, secs, "Job retry scheduled");
                self.hide_for(receipt_handle, secs).await
            }
            None => self.hide_for(receipt_handle, 0).await,
        }
    }

    async fn health_check(&self) -> Result<QueueHealth, QueueError> {
        let waiting = self.queue_depth(&self.queue_url).await?;
        let dead_lettered = match self.dlq_depth().await {
            Ok(depth) => depth,
            Err(e) => {
                warn!(error = %e, "Dead-letter queue depth unavailable");
                None
            }
        };
        Ok(QueueHealth {
            connected: true,
            approximate_message_count: waiting,
            dead_lettered,
            provider: "sqs".to_string(),
        })
    }

    /// Depth of the dead-letter queue, or the count moved by this process
    /// when there is none.
    async fn dlq_depth(&self) -> Result<Option<u64>, QueueError> {
        match &self.dlq_url {
            Some(url) => self.queue_depth(url).await,
            None => Ok(Some(self.dead_lettered.load(Ordering::Relaxed))),
        }
    }
}

//! In-process queue for single-node deployments and tests.
//!
//! Each recurring registration owns a timer task that enqueues a message
//! on every fire. Consumers poll, then ack or nack each delivery. A nacked
//! delivery comes back after the registration's backoff until its attempts
//! are used up, then it is dropped and counted as dead-lettered.
//! Registrations live only as long as the process.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::Notify;
use tokio::task::JoinHandle;

use beacon_core::EntityRef;

use crate::consumer::{QueueConsumer, QueueHealth, QueueMessage};
use crate::error::QueueError;
use crate::registry::{JobRegistry, JobTrigger, Registration};

#[derive(Debug, Clone)]
struct Delivery {
    message_id: String,
    body: String,
    enqueued_at: DateTime<Utc>,
    attempt: u32,
    attempts: u32,
    backoff: Duration,
}

impl Delivery {
    fn first(registration: &Registration, body: String) -> Self {
        Self {
            message_id: uuid::Uuid::new_v4().to_string(),
            body,
            enqueued_at: Utc::now(),
            attempt: 1,
            attempts: registration.attempts.max(1),
            backoff: registration.backoff,
        }
    }
}

#[derive(Default)]
struct State {
    timers: HashMap<EntityRef, JoinHandle<()>>,
    ready: VecDeque<Delivery>,
    in_flight: HashMap<String, Delivery>,
    dead_lettered: u64,
}

struct Shared {
    state: Mutex<State>,
    ready_signal: Notify,
}

impl Shared {
    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn push(&self, delivery: Delivery) {
        self.state().ready.push_back(delivery);
        self.ready_signal.notify_one();
    }
}

pub struct LocalQueue {
    shared: Arc<Shared>,
    poll_wait: Duration,
}

impl LocalQueue {
    /// `poll_wait` bounds how long an empty `poll_batch` blocks.
    pub fn new(poll_wait: Duration) -> Self {
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(State::default()),
                ready_signal: Notify::new(),
            }),
            poll_wait,
        }
    }

    /// Entities with an active recurring registration.
    pub fn registered(&self) -> Vec<EntityRef> {
        self.shared.state().timers.keys().cloned().collect()
    }

    fn drop_timer(&self, entity: &EntityRef) -> bool {
        match self.shared.state().timers.remove(entity) {
            Some(handle) => {
                handle.abort();
                true
            }
            None => false,
        }
    }
}

impl Drop for LocalQueue {
    fn drop(&mut self) {
        for (_, handle) in self.shared.state().timers.drain() {
            handle.abort();
        }
    }
}

async fn run_timer(shared: Arc<Shared>, registration: Registration, body: String) {
    loop {
        let wait = match &registration.trigger {
            JobTrigger::Every(interval) => *interval,
            JobTrigger::Cron { .. } => {
                let now = Utc::now();
                match registration.trigger.next_after(now) {
                    Some(next) => (next - now).to_std().unwrap_or(Duration::ZERO),
                    None => break,
                }
            }
            JobTrigger::Once => break,
        };
        tokio::time::sleep(wait).await;

        tracing::debug!(entity = %registration.entity(), "Local timer fired");
        shared.push(Delivery::first(&registration, body.clone()));
    }
}

#[async_trait]
impl JobRegistry for LocalQueue {
    async fn register(&self, registration: Registration) -> Result<(), QueueError> {
        let entity = registration.entity();
        let body = registration.payload.to_body()?;

        let replaced = self.drop_timer(&entity);

        if registration.trigger.is_recurring() {
            let handle = tokio::spawn(run_timer(self.shared.clone(), registration, body));
            self.shared.state().timers.insert(entity.clone(), handle);
        } else {
            self.shared.push(Delivery::first(&registration, body));
        }

        tracing::info!(entity = %entity, replaced, "Job registered");
        Ok(())
    }

    async fn remove(&self, entity: &EntityRef) -> Result<bool, QueueError> {
        let removed = self.drop_timer(entity);
        if removed {
            tracing::info!(entity = %entity, "Job registration removed");
        }
        Ok(removed)
    }
}

#[async_trait]
impl QueueConsumer for LocalQueue {
    async fn poll_batch(&self, max_messages: u32) -> Result<Vec<QueueMessage>, QueueError> {
        let deadline = tokio::time::Instant::now() + self.poll_wait;
        loop {
            {
                let mut state = self.shared.state();
                if !state.ready.is_empty() {
                    let take = (max_messages.max(1) as usize).min(state.ready.len());
                    let mut messages = Vec::with_capacity(take);
                    let drained: Vec<Delivery> = state.ready.drain(..take).collect();
                    for delivery in drained {
                        let receipt = uuid::Uuid::new_v4().to_string();
                        messages.push(QueueMessage {
                            id: delivery.message_id.clone(),
                            body: delivery.body.clone(),
                            receipt_handle: receipt.clone(),
                            timestamp: delivery.enqueued_at,
                            attempt_count: delivery.attempt,
                        });
                        state.in_flight.insert(receipt, delivery);
                    }
                    return Ok(messages);
                }
            }

            if tokio::time::timeout_at(deadline, self.shared.ready_signal.notified())
                .await
                .is_err()
            {
                return Ok(Vec::new());
            }
        }
    }

    async fn ack(&self, receipt_handle: &str) -> Result<(), QueueError> {
        self.shared
            .state()
            .in_flight
            .remove(receipt_handle)
            .map(|_| ())
            .ok_or_else(|| QueueError::Ack(format!("unknown receipt handle {receipt_handle}")))
    }

    async fn nack(&self, receipt_handle: &str) -> Result<(), QueueError> {
        let delivery = self
            .shared
            .state()
            .in_flight
            .remove(receipt_handle)
            .ok_or_else(|| QueueError::Ack(format!("unknown receipt handle {receipt_handle}")))?;

        if delivery.attempt >= delivery.attempts {
            self.shared.state().dead_lettered += 1;
            tracing::warn!(
                message_id = %delivery.message_id,
                attempts = delivery.attempts,
                "Job exhausted its attempts, dead-lettered"
            );
            return Ok(());
        }

        let retry = Delivery {
            attempt: delivery.attempt + 1,
            ..delivery
        };
        tracing::debug!(
            message_id = %retry.message_id,
            attempt = retry.attempt,
            backoff_ms = retry.backoff.as_millis() as u64,
            "Job will be redelivered"
        );

        let shared = self.shared.clone();
        tokio::spawn(async move {
            tokio::time::sleep(retry.backoff).await;
            shared.push(retry);
        });
        Ok(())
    }

    async fn health_check(&self) -> Result<QueueHealth, QueueError> {
        let state = self.shared.state();
        Ok(QueueHealth {
            connected: true,
            approximate_message_count: Some(state.ready.len() as u64),
            dead_lettered: Some(state.dead_lettered),
            provider: "local".to_string(),
        })
    }

    async fn dlq_depth(&self) -> Result<Option<u64>, QueueError> {
        Ok(Some(self.shared.state().dead_lettered))
    }
}

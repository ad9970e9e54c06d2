//! Worker pool: polls the queue and runs each job on its own task.
//!
//! At most `concurrency` jobs are in flight. A handler `Ok` acks the
//! message, an `Err` nacks it so the queue redelivers per its policy.
//! Shutdown stops polling and waits up to `shutdown_timeout` for the jobs
//! already running.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Notify, Semaphore};
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use beacon_core::config::WorkerConfig;
use beacon_queue::{QueueConsumer, QueueMessage};

use crate::worker::DispatchWorker;

#[derive(Debug, Clone)]
pub struct PoolConfig {
    pub concurrency: usize,
    pub batch_size: u32,
    pub shutdown_timeout: Duration,
    /// Pause after a failed poll before trying again.
    pub error_backoff: Duration,
}

impl PoolConfig {
    pub fn from_worker_config(config: &WorkerConfig) -> Self {
        Self {
            concurrency: config.concurrency.max(1),
            batch_size: config.poll_batch_size.max(1),
            shutdown_timeout: Duration::from_secs(config.shutdown_timeout_secs),
            error_backoff: Duration::from_secs(5),
        }
    }
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            concurrency: 4,
            batch_size: 10,
            shutdown_timeout: Duration::from_secs(10),
            error_backoff: Duration::from_secs(5),
        }
    }
}

pub struct WorkerPool {
    worker: Arc<DispatchWorker>,
    consumer: Arc<dyn QueueConsumer>,
    config: PoolConfig,
}

impl WorkerPool {
    pub fn new(worker: Arc<DispatchWorker>, consumer: Arc<dyn QueueConsumer>, config: PoolConfig) -> Self {
        Self { worker, consumer, config }
    }

    /// Run until `shutdown` is notified. Trigger it with `notify_one` so a
    /// notification sent between polls is not lost.
    pub async fn run(&self, shutdown: Arc<Notify>) {
        let permits = Arc::new(Semaphore::new(self.config.concurrency.max(1)));
        let mut tasks = JoinSet::new();
        info!(concurrency = self.config.concurrency, "Worker pool started");

        loop {
            while let Some(joined) = tasks.try_join_next() {
                if let Err(e) = joined {
                    error!(error = %e, "Job task panicked");
                }
            }

            // Never poll more messages than there are free handler slots.
            let free = permits.available_permits().max(1);
            let max_messages = self.config.batch_size.min(u32::try_from(free).unwrap_or(u32::MAX));

            let polled = tokio::select! {
                biased;
                _ = shutdown.notified() => break,
                polled = self.consumer.poll_batch(max_messages) => polled,
            };

            let messages = match polled {
                Ok(messages) => messages,
                Err(e) => {
                    warn!(error = %e, "Queue poll failed");
                    tokio::select! {
                        _ = shutdown.notified() => break,
                        _ = tokio::time::sleep(self.config.error_backoff) => continue,
                    }
                }
            };

            for message in messages {
                let Ok(permit) = permits.clone().acquire_owned().await else {
                    break;
                };
                let worker = self.worker.clone();
                let consumer = self.consumer.clone();
                tasks.spawn(async move {
                    process(&worker, consumer.as_ref(), message).await;
                    drop(permit);
                });
            }
        }

        info!(in_flight = tasks.len(), "Worker pool stopping");
        let drain = async {
            while let Some(joined) = tasks.join_next().await {
                if let Err(e) = joined {
                    error!(error = %e, "Job task panicked");
                }
            }
        };
        match tokio::time::timeout(self.config.shutdown_timeout, drain).await {
            Ok(()) => info!("Worker pool stopped gracefully"),
            Err(_) => {
                warn!("Worker pool shutdown timed out, aborting in-flight jobs");
                tasks.abort_all();
            }
        }
    }
}

async fn process(worker: &DispatchWorker, consumer: &dyn QueueConsumer, message: QueueMessage) {
    let job = match message.payload() {
        Ok(job) => job,
        Err(e) => {
            // Redelivery cannot fix a malformed body.
            warn!(message_id = %message.id, error = %e, "Dropping malformed job");
            if let Err(e) = consumer.ack(&message.receipt_handle).await {
                warn!(message_id = %message.id, error = %e, "Failed to ack malformed job");
            }
            return;
        }
    };

    match worker.handle(&job).await {
        Ok(outcome) => {
            debug!(
                entity_id = %job.entity_id,
                kind = %job.kind,
                attempt = message.attempt_count,
                outcome = outcome.label(),
                "Job handled"
            );
            if let Err(e) = consumer.ack(&message.receipt_handle).await {
                warn!(message_id = %message.id, error = %e, "Failed to ack job");
            }
        }
        Err(e) => {
            error!(
                entity_id = %job.entity_id,
                kind = %job.kind,
                attempt = message.attempt_count,
                error = %e,
                "Job failed, returning to queue"
            );
            if let Err(e) = consumer.nack(&message.receipt_handle).await {
                warn!(message_id = %message.id, error = %e, "Failed to nack job");
            }
        }
    }
}

/// Resolves on SIGINT or SIGTERM.
#[cfg(unix)]
pub async fn shutdown_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigterm = match signal(SignalKind::terminate()) {
        Ok(sigterm) => sigterm,
        Err(e) => {
            warn!(error = %e, "Cannot listen for SIGTERM, waiting for SIGINT only");
            if let Err(e) = tokio::signal::ctrl_c().await {
                error!(error = %e, "Cannot listen for SIGINT");
            }
            return;
        }
    };

    tokio::select! {
        result = tokio::signal::ctrl_c() => match result {
            Ok(()) => info!("Received SIGINT"),
            Err(e) => error!(error = %e, "Cannot listen for SIGINT"),
        },
        _ = sigterm.recv() => info!("Received SIGTERM"),
    }
}

#[cfg(not(unix))]
pub async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!(error = %e, "Cannot listen for Ctrl-C");
    }
}

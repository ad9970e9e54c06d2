//! Recurring and one-shot job registration.

use std::str::FromStr;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use beacon_core::{EntityRef, MonitorDefinition, ScheduleDefinition, Trigger};

use crate::error::QueueError;
use crate::job::JobPayload;

/// Monitors without an interval are probed every minute.
pub const DEFAULT_MONITOR_INTERVAL: Duration = Duration::from_secs(60);

/// Normalize a 5-field cron expression to 6-field by prepending "0 " for seconds.
///
/// The `cron` crate requires `sec min hour day-of-month month day-of-week`;
/// stored definitions use the standard 5-field form.
pub(crate) fn normalize_cron(expression: &str) -> String {
    let trimmed = expression.trim();
    if trimmed.split_whitespace().count() == 5 {
        format!("0 {trimmed}")
    } else {
        trimmed.to_string()
    }
}

/// When a registration fires. Cron expressions are evaluated in UTC.
#[derive(Debug, Clone)]
pub enum JobTrigger {
    Cron { expression: String, schedule: Box<cron::Schedule> },
    Every(Duration),
    /// Fires once, immediately.
    Once,
}

impl JobTrigger {
    pub fn cron(expression: &str) -> Result<Self, QueueError> {
        let normalized = normalize_cron(expression);
        let schedule = cron::Schedule::from_str(&normalized)
            .map_err(|e| QueueError::Trigger(format!("invalid cron '{expression}': {e}")))?;
        Ok(JobTrigger::Cron {
            expression: normalized,
            schedule: Box::new(schedule),
        })
    }

    pub fn every(interval: Duration) -> Result<Self, QueueError> {
        if interval.is_zero() {
            return Err(QueueError::Trigger("interval must be positive".to_string()));
        }
        Ok(JobTrigger::Every(interval))
    }

    /// Next fire time strictly after `after`. `None` for one-shot triggers
    /// and for cron expressions with no future occurrence.
    pub fn next_after(&self, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
        match self {
            JobTrigger::Cron { schedule, .. } => schedule.after(&after).next(),
            JobTrigger::Every(interval) => chrono::Duration::from_std(*interval)
                .ok()
                .and_then(|d| after.checked_add_signed(d)),
            JobTrigger::Once => None,
        }
    }

    pub fn is_recurring(&self) -> bool {
        !matches!(self, JobTrigger::Once)
    }
}

#[derive(Debug, Clone)]
pub struct Registration {
    pub payload: JobPayload,
    pub trigger: JobTrigger,
    /// Total deliveries allowed per fire, first one included.
    pub attempts: u32,
    /// Fixed delay before each redelivery.
    pub backoff: Duration,
}

impl Registration {
    pub fn new(payload: JobPayload, trigger: JobTrigger) -> Self {
        Self {
            payload,
            trigger,
            attempts: 1,
            backoff: Duration::ZERO,
        }
    }

    pub fn with_retries(mut self, max_retries: u32, backoff: Duration) -> Self {
        self.attempts = max_retries.saturating_add(1);
        self.backoff = backoff;
        self
    }

    pub fn for_schedule(schedule: &ScheduleDefinition) -> Result<Self, QueueError> {
        let trigger = match &schedule.trigger {
            Trigger::Cron { expression } => JobTrigger::cron(expression)?,
            Trigger::Interval { every_ms } => JobTrigger::every(Duration::from_millis(*every_ms))?,
            Trigger::OneShot => JobTrigger::Once,
        };
        let backoff = Duration::from_millis(schedule.backoff_ms.unwrap_or(0));
        Ok(Self::new(JobPayload::schedule(&schedule.id), trigger)
            .with_retries(schedule.max_retries, backoff))
    }

    /// Monitors run on their interval with a single attempt; the next tick
    /// is the retry.
    pub fn for_monitor(monitor: &MonitorDefinition) -> Result<Self, QueueError> {
        let interval = monitor
            .interval_ms
            .map(Duration::from_millis)
            .unwrap_or(DEFAULT_MONITOR_INTERVAL);
        Ok(Self::new(JobPayload::monitor(&monitor.id), JobTrigger::every(interval)?))
    }

    pub fn entity(&self) -> EntityRef {
        self.payload.entity()
    }
}

/// Registers jobs with the queue. At most one registration exists per
/// entity: registering again replaces the previous one.
#[async_trait]
pub trait JobRegistry: Send + Sync {
    async fn register(&self, registration: Registration) -> Result<(), QueueError>;

    /// Returns whether a registration existed. Messages already enqueued
    /// are not recalled.
    async fn remove(&self, entity: &EntityRef) -> Result<bool, QueueError>;
}

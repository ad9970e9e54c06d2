//! The dispatch worker: one queue job in, one outcome out.
//!
//! A job is gated by the entity's active window, then (schedules only) its
//! run conditions and circuit breaker. Runs that pass are probed, recorded,
//! folded into the entity's counters and, when a threshold is crossed,
//! announced to the workspace's enabled channels.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use chrono_tz::Tz;

use beacon_core::config::ProbeConfig;
use beacon_core::{ActiveWindow, EntityKind, EntityRef, MonitorDefinition, RunRecord, RunStatus, ScheduleDefinition};
use beacon_notify::{Dispatcher, Notification};
use beacon_probe::{ProbeResult, ProbeSpec, Prober};
use beacon_queue::JobPayload;

use crate::breaker::{self, AlertKind, AlertPolicy, BreakerPolicy};
use crate::conditions::{self, Verdict};
use crate::error::EngineError;
use crate::store::RunStore;
use crate::window;

pub const OUTSIDE_WINDOW: &str = "Outside active window";
pub const RECOVERED_MESSAGE: &str = "Recovered after failures";

#[derive(Debug, Clone, PartialEq)]
pub enum DispatchOutcome {
    /// The entity no longer exists or is disabled. Nothing was written.
    Skipped,
    Canceled(RunRecord),
    Failed(RunRecord),
    Succeeded(RunRecord),
}

impl DispatchOutcome {
    pub fn run(&self) -> Option<&RunRecord> {
        match self {
            DispatchOutcome::Skipped => None,
            DispatchOutcome::Canceled(run) | DispatchOutcome::Failed(run) | DispatchOutcome::Succeeded(run) => {
                Some(run)
            }
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            DispatchOutcome::Skipped => "skipped",
            DispatchOutcome::Canceled(_) => "canceled",
            DispatchOutcome::Failed(_) => "failed",
            DispatchOutcome::Succeeded(_) => "succeeded",
        }
    }

    fn from_run(run: RunRecord) -> Self {
        match run.status {
            RunStatus::Success => DispatchOutcome::Succeeded(run),
            RunStatus::Failed => DispatchOutcome::Failed(run),
            RunStatus::Canceled => DispatchOutcome::Canceled(run),
        }
    }
}

/// What the shared half of the pipeline needs to know about an entity.
struct Target<'a> {
    entity: EntityRef,
    name: &'a str,
    workspace_id: &'a str,
    alerts: AlertPolicy,
    breaker: BreakerPolicy,
}

pub struct DispatchWorker {
    store: Arc<dyn RunStore>,
    prober: Arc<dyn Prober>,
    dispatcher: Dispatcher,
    probe_config: ProbeConfig,
    default_tz: Tz,
}

impl DispatchWorker {
    pub fn new(
        store: Arc<dyn RunStore>,
        prober: Arc<dyn Prober>,
        dispatcher: Dispatcher,
        probe_config: ProbeConfig,
        default_tz: Tz,
    ) -> Self {
        Self {
            store,
            prober,
            dispatcher,
            probe_config,
            default_tz,
        }
    }

    /// Handle one job. `Err` means persistence failed and the job should be
    /// redelivered; every other failure is part of the outcome.
    pub async fn handle(&self, job: &JobPayload) -> Result<DispatchOutcome, EngineError> {
        self.handle_at(job, Utc::now()).await
    }

    /// [`handle`](Self::handle) with an explicit clock. The run starts at
    /// `now` and finishes `latency` later.
    pub async fn handle_at(&self, job: &JobPayload, now: DateTime<Utc>) -> Result<DispatchOutcome, EngineError> {
        match job.kind {
            EntityKind::Schedule => self.handle_schedule(&job.entity_id, now).await,
            EntityKind::Monitor => self.handle_monitor(&job.entity_id, now).await,
        }
    }

    async fn handle_schedule(&self, id: &str, now: DateTime<Utc>) -> Result<DispatchOutcome, EngineError> {
        let entity = EntityRef::schedule(id);
        let Some(schedule) = self.store.load_schedule(id).await? else {
            tracing::debug!(entity_id = id, kind = "schedule", "Schedule not found, skipping");
            return Ok(DispatchOutcome::Skipped);
        };
        if !schedule.enabled {
            tracing::debug!(entity_id = id, kind = "schedule", "Schedule disabled, skipping");
            return Ok(DispatchOutcome::Skipped);
        }

        if let Some(reason) = self.schedule_gate(&schedule, &entity, now).await? {
            return self.cancel(entity, reason, now).await;
        }

        let spec = ProbeSpec::for_schedule(&schedule, &self.probe_config);
        let result = self.prober.execute(&spec).await;

        let target = Target {
            entity,
            name: &schedule.name,
            workspace_id: &schedule.workspace_id,
            alerts: AlertPolicy::for_schedule(&schedule),
            breaker: BreakerPolicy::for_schedule(&schedule),
        };
        self.complete(target, result, now).await
    }

    /// First reason the schedule may not run now, if any.
    async fn schedule_gate(
        &self,
        schedule: &ScheduleDefinition,
        entity: &EntityRef,
        now: DateTime<Utc>,
    ) -> Result<Option<String>, EngineError> {
        if !self.in_window(&schedule.window, now) {
            return Ok(Some(OUTSIDE_WINDOW.to_string()));
        }

        if let Some(conditions) = schedule.conditions.as_ref().filter(|c| !c.is_empty()) {
            let last_run = self.store.last_run(entity).await?;
            if let Verdict::Denied(reason) = conditions::evaluate(Some(conditions), last_run.as_ref(), now) {
                return Ok(Some(reason));
            }
        }

        let state = self.store.load_state(entity).await?;
        Ok(breaker::gate(&state, now))
    }

    async fn handle_monitor(&self, id: &str, now: DateTime<Utc>) -> Result<DispatchOutcome, EngineError> {
        let entity = EntityRef::monitor(id);
        let Some(monitor) = self.store.load_monitor(id).await? else {
            tracing::debug!(entity_id = id, kind = "monitor", "Monitor not found, skipping");
            return Ok(DispatchOutcome::Skipped);
        };
        if !monitor.enabled {
            tracing::debug!(entity_id = id, kind = "monitor", "Monitor disabled, skipping");
            return Ok(DispatchOutcome::Skipped);
        }

        if !self.in_window(&monitor.window, now) {
            return self.cancel(entity, OUTSIDE_WINDOW, now).await;
        }

        let result = self.probe_monitor(&monitor).await;
        let target = Target {
            entity,
            name: &monitor.name,
            workspace_id: &monitor.workspace_id,
            alerts: AlertPolicy::for_monitor(&monitor),
            breaker: BreakerPolicy::disabled(),
        };
        self.complete(target, result, now).await
    }

    /// A monitor whose definition cannot be probed fails like an
    /// unreachable target.
    async fn probe_monitor(&self, monitor: &MonitorDefinition) -> ProbeResult {
        match ProbeSpec::for_monitor(monitor, &self.probe_config) {
            Ok(spec) => self.prober.execute(&spec).await,
            Err(e) => {
                tracing::warn!(entity_id = %monitor.id, kind = "monitor", error = %e, "Monitor cannot be probed");
                ProbeResult::failure(e.to_string(), 0)
            }
        }
    }

    fn in_window(&self, active: &ActiveWindow, now: DateTime<Utc>) -> bool {
        window::is_active(active, self.default_tz, now)
    }

    async fn cancel(
        &self,
        entity: EntityRef,
        reason: impl Into<String>,
        now: DateTime<Utc>,
    ) -> Result<DispatchOutcome, EngineError> {
        let run = RunRecord::canceled(entity, reason, now);
        tracing::info!(
            entity_id = %run.entity.id,
            kind = %run.entity.kind,
            reason = run.error.as_deref().unwrap_or_default(),
            "Run canceled"
        );
        self.store.insert_run(&run).await?;
        Ok(DispatchOutcome::Canceled(run))
    }

    async fn complete(
        &self,
        target: Target<'_>,
        result: ProbeResult,
        now: DateTime<Utc>,
    ) -> Result<DispatchOutcome, EngineError> {
        let finished_at = now + Duration::milliseconds(i64::try_from(result.latency_ms).unwrap_or(i64::MAX));
        let success = result.is_success();
        let run = RunRecord::executed(
            target.entity.clone(),
            finished_at,
            result.latency_ms,
            result.status_code,
            result.error,
            result.response,
        );

        if success {
            tracing::debug!(
                entity_id = %target.entity.id,
                kind = %target.entity.kind,
                status_code = ?run.status_code,
                latency_ms = result.latency_ms,
                "Run succeeded"
            );
        } else {
            tracing::info!(
                entity_id = %target.entity.id,
                kind = %target.entity.kind,
                status_code = ?run.status_code,
                latency_ms = result.latency_ms,
                error = run.error.as_deref().unwrap_or_default(),
                "Run failed"
            );
        }

        let change = self.store.record_run(&run, target.breaker).await?;
        let state = &change.after;

        if let Some(until) = state.circuit_open_until.filter(|_| !success) {
            tracing::warn!(
                entity_id = %target.entity.id,
                failures = state.consecutive_failures,
                open_until = %until,
                "Circuit open"
            );
        }

        if let Some(kind) = target.alerts.decide(success, &change) {
            self.alert(&target, kind, run.error.as_deref()).await;
        }

        Ok(DispatchOutcome::from_run(run))
    }

    /// Best effort: channel lookup and delivery failures are logged only.
    async fn alert(&self, target: &Target<'_>, kind: AlertKind, error: Option<&str>) {
        let label = target.entity.kind.label();
        let notification = match kind {
            AlertKind::Failure => Notification::new(
                format!("{label} failed: {}", target.name),
                error.unwrap_or("Unknown error"),
            ),
            AlertKind::Recovery => Notification::new(format!("{label} recovered: {}", target.name), RECOVERED_MESSAGE),
        };

        let channels = match self.store.enabled_channels(target.workspace_id).await {
            Ok(channels) => channels,
            Err(e) => {
                tracing::error!(
                    entity_id = %target.entity.id,
                    workspace_id = target.workspace_id,
                    error = %e,
                    "Could not load notification channels"
                );
                return;
            }
        };

        let results = self.dispatcher.dispatch(&channels, &notification).await;
        let delivered = results.iter().filter(|r| r.success).count();
        tracing::info!(
            entity_id = %target.entity.id,
            kind = %target.entity.kind,
            alert = ?kind,
            channels = results.len(),
            delivered,
            "Alert dispatched"
        );
    }
}

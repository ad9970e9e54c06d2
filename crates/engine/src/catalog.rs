//! Seeding job registrations from stored definitions.
//!
//! With the in-process queue the worker owns its timers, so at startup it
//! registers every enabled schedule and monitor it can see. A one-shot
//! schedule is registered only until it has a run on record.

use std::path::Path;

use serde::Deserialize;

use beacon_core::{EntityRef, MonitorDefinition, NotificationChannel, ScheduleDefinition, Trigger};
use beacon_queue::{JobRegistry, Registration};

use crate::error::EngineError;
use crate::store::{MemoryStore, RunStore};

/// A JSON document of definitions, used to seed the memory store.
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Catalog {
    #[serde(default)]
    pub schedules: Vec<ScheduleDefinition>,
    #[serde(default)]
    pub monitors: Vec<MonitorDefinition>,
    #[serde(default)]
    pub channels: Vec<NotificationChannel>,
}

impl Catalog {
    pub fn from_file(path: &Path) -> Result<Self, EngineError> {
        let raw = std::fs::read_to_string(path)
            .map_err(|e| EngineError::Config(format!("cannot read {}: {e}", path.display())))?;
        serde_json::from_str(&raw)
            .map_err(|e| EngineError::Config(format!("invalid catalog {}: {e}", path.display())))
    }

    pub fn seed(&self, store: &MemoryStore) {
        for schedule in &self.schedules {
            store.put_schedule(schedule.clone());
        }
        for monitor in &self.monitors {
            store.put_monitor(monitor.clone());
        }
        for channel in &self.channels {
            store.put_channel(channel.clone());
        }
    }
}

/// Register every enabled definition. A definition that cannot be
/// registered (say, a bad cron expression) is logged and skipped, and so
/// is a one-shot schedule that already ran. Returns how many were
/// registered.
pub async fn register_all(
    registry: &dyn JobRegistry,
    store: &dyn RunStore,
    schedules: &[ScheduleDefinition],
    monitors: &[MonitorDefinition],
) -> Result<usize, EngineError> {
    let mut registrations = Vec::new();
    for schedule in schedules.iter().filter(|s| s.enabled) {
        if schedule.trigger == Trigger::OneShot
            && store.last_run(&EntityRef::schedule(&schedule.id)).await?.is_some()
        {
            tracing::info!(entity_id = %schedule.id, kind = "schedule", "One-shot schedule already ran, not registering");
            continue;
        }
        match Registration::for_schedule(schedule) {
            Ok(registration) => registrations.push(registration),
            Err(e) => tracing::warn!(entity_id = %schedule.id, kind = "schedule", error = %e, "Skipping schedule"),
        }
    }
    for monitor in monitors.iter().filter(|m| m.enabled) {
        match Registration::for_monitor(monitor) {
            Ok(registration) => registrations.push(registration),
            Err(e) => tracing::warn!(entity_id = %monitor.id, kind = "monitor", error = %e, "Skipping monitor"),
        }
    }

    let count = registrations.len();
    for registration in registrations {
        registry.register(registration).await?;
    }
    tracing::info!(count, "Jobs registered");
    Ok(count)
}

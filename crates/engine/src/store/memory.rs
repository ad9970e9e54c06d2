use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;

use beacon_core::{
    EntityKind, EntityRef, EntityRunState, MonitorDefinition, NotificationChannel, RunRecord, RunStatus,
    ScheduleDefinition,
};

use super::{ensure_executed, RunStore};
use crate::breaker::{BreakerPolicy, StateChange};
use crate::error::EngineError;

#[derive(Default)]
struct Tables {
    schedules: HashMap<String, ScheduleDefinition>,
    monitors: HashMap<String, MonitorDefinition>,
    channels: Vec<NotificationChannel>,
    runs: Vec<RunRecord>,
    states: HashMap<EntityRef, EntityRunState>,
    unavailable: bool,
}

/// Process-local store. Every operation holds one lock for its whole
/// duration, which makes `record_run` atomic.
#[derive(Default)]
pub struct MemoryStore {
    tables: Mutex<Tables>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn tables(&self) -> MutexGuard<'_, Tables> {
        self.tables.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn available(&self) -> Result<MutexGuard<'_, Tables>, EngineError> {
        let tables = self.tables();
        if tables.unavailable {
            return Err(EngineError::Store("store unavailable".to_string()));
        }
        Ok(tables)
    }

    fn ensure_new(tables: &Tables, run: &RunRecord) -> Result<(), EngineError> {
        if tables.runs.iter().any(|r| r.id == run.id) {
            return Err(EngineError::Store(format!("run {} already recorded", run.id)));
        }
        Ok(())
    }

    pub fn put_schedule(&self, schedule: ScheduleDefinition) {
        self.tables().schedules.insert(schedule.id.clone(), schedule);
    }

    pub fn put_monitor(&self, monitor: MonitorDefinition) {
        self.tables().monitors.insert(monitor.id.clone(), monitor);
    }

    pub fn put_channel(&self, channel: NotificationChannel) {
        let mut tables = self.tables();
        tables.channels.retain(|c| c.id != channel.id);
        tables.channels.push(channel);
    }

    /// Remove a definition. Its history and counters are kept.
    pub fn delete(&self, entity: &EntityRef) -> bool {
        let mut tables = self.tables();
        match entity.kind {
            EntityKind::Schedule => tables.schedules.remove(&entity.id).is_some(),
            EntityKind::Monitor => tables.monitors.remove(&entity.id).is_some(),
        }
    }

    /// Runs of one entity in insertion order.
    pub fn runs(&self, entity: &EntityRef) -> Vec<RunRecord> {
        self.tables()
            .runs
            .iter()
            .filter(|run| &run.entity == entity)
            .cloned()
            .collect()
    }

    pub fn state(&self, entity: &EntityRef) -> EntityRunState {
        self.tables().states.get(entity).cloned().unwrap_or_default()
    }

    /// While set, every store operation fails.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.tables().unavailable = unavailable;
    }
}

#[async_trait]
impl RunStore for MemoryStore {
    async fn load_schedule(&self, id: &str) -> Result<Option<ScheduleDefinition>, EngineError> {
        Ok(self.available()?.schedules.get(id).cloned())
    }

    async fn load_monitor(&self, id: &str) -> Result<Option<MonitorDefinition>, EngineError> {
        Ok(self.available()?.monitors.get(id).cloned())
    }

    async fn last_run(&self, entity: &EntityRef) -> Result<Option<RunRecord>, EngineError> {
        Ok(self
            .available()?
            .runs
            .iter()
            .filter(|run| &run.entity == entity)
            .max_by_key(|run| run.finished_at)
            .cloned())
    }

    async fn insert_run(&self, run: &RunRecord) -> Result<(), EngineError> {
        let mut tables = self.available()?;
        Self::ensure_new(&tables, run)?;
        tables.runs.push(run.clone());
        Ok(())
    }

    async fn load_state(&self, entity: &EntityRef) -> Result<EntityRunState, EngineError> {
        Ok(self.available()?.states.get(entity).cloned().unwrap_or_default())
    }

    async fn record_run(&self, run: &RunRecord, breaker: BreakerPolicy) -> Result<StateChange, EngineError> {
        ensure_executed(run)?;
        let mut tables = self.available()?;
        Self::ensure_new(&tables, run)?;

        let success = run.status == RunStatus::Success;
        let state = tables.states.entry(run.entity.clone()).or_default();
        let before = state.clone();
        *state = breaker.apply(&before, success, run.finished_at);
        let change = StateChange::new(before, state.clone());
        tables.runs.push(run.clone());
        Ok(change)
    }

    async fn enabled_channels(&self, workspace_id: &str) -> Result<Vec<NotificationChannel>, EngineError> {
        Ok(self
            .available()?
            .channels
            .iter()
            .filter(|c| c.enabled && c.workspace_id == workspace_id)
            .cloned()
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use beacon_core::{ChannelConfig, ChatWebhookConfig};
    use chrono::{DateTime, Duration, Utc};

    use super::*;

    #[tokio::test]
    async fn last_run_is_latest_by_finish_time() {
        let store = MemoryStore::new();
        let entity = EntityRef::schedule("s1");
        let now = Utc::now();
        let late = RunRecord::canceled(entity.clone(), "Outside active window", now);
        let early = RunRecord::executed(entity.clone(), now - Duration::minutes(5), 10, Some(200), None, None);
        store.insert_run(&late).await.unwrap();
        store.insert_run(&early).await.unwrap();

        let last = store.last_run(&entity).await.unwrap().unwrap();
        assert_eq!(last.status, RunStatus::Canceled);
        assert!(store.last_run(&EntityRef::schedule("other")).await.unwrap().is_none());
    }

    fn failed(entity: &EntityRef, at: DateTime<Utc>) -> RunRecord {
        RunRecord::executed(entity.clone(), at, 10, None, Some("connection refused".into()), None)
    }

    #[tokio::test]
    async fn outcomes_accumulate_per_entity() {
        let store = MemoryStore::new();
        let a = EntityRef::schedule("a");
        let now = Utc::now();
        for _ in 0..3 {
            store.record_run(&failed(&a, now), BreakerPolicy::disabled()).await.unwrap();
        }
        let ok = RunRecord::executed(EntityRef::monitor("a"), now, 10, Some(200), None, None);
        let b = store.record_run(&ok, BreakerPolicy::disabled()).await.unwrap();
        assert_eq!(store.state(&a).consecutive_failures, 3);
        assert_eq!(store.runs(&a).len(), 3);
        assert_eq!(b.before, EntityRunState::default());
        assert_eq!(b.after.consecutive_successes, 1);
        assert_eq!(store.load_state(&EntityRef::schedule("none")).await.unwrap(), EntityRunState::default());
    }

    #[tokio::test]
    async fn rejected_run_leaves_counters_untouched() {
        let store = MemoryStore::new();
        let a = EntityRef::schedule("a");
        let run = failed(&a, Utc::now());
        store.record_run(&run, BreakerPolicy::disabled()).await.unwrap();

        // Same run again, as on a redelivery that reuses the record.
        assert!(matches!(
            store.record_run(&run, BreakerPolicy::disabled()).await,
            Err(EngineError::Store(_))
        ));
        assert_eq!(store.runs(&a).len(), 1);
        assert_eq!(store.state(&a).consecutive_failures, 1);

        let canceled = RunRecord::canceled(a.clone(), "Outside active window", Utc::now());
        assert!(store.record_run(&canceled, BreakerPolicy::disabled()).await.is_err());
        assert_eq!(store.runs(&a).len(), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_records_never_lose_an_increment() {
        let store = std::sync::Arc::new(MemoryStore::new());
        let entity = EntityRef::schedule("busy");
        let now = Utc::now();
        let tasks: Vec<_> = (0..64)
            .map(|_| {
                let store = store.clone();
                let run = failed(&entity, now);
                tokio::spawn(async move { store.record_run(&run, BreakerPolicy::disabled()).await })
            })
            .collect();
        for task in tasks {
            task.await.unwrap().unwrap();
        }
        assert_eq!(store.state(&entity).consecutive_failures, 64);
        assert_eq!(store.runs(&entity).len(), 64);
    }

    #[tokio::test]
    async fn only_enabled_channels_of_workspace() {
        let store = MemoryStore::new();
        let slack = || ChannelConfig::Slack(ChatWebhookConfig { webhook_url: Some("https://hooks".into()) });
        store.put_channel(NotificationChannel::new("c1", "w1", slack()));
        let mut disabled = NotificationChannel::new("c2", "w1", slack());
        disabled.enabled = false;
        store.put_channel(disabled);
        store.put_channel(NotificationChannel::new("c3", "w2", slack()));

        let channels = store.enabled_channels("w1").await.unwrap();
        assert_eq!(channels.len(), 1);
        assert_eq!(channels[0].id, "c1");
    }

    #[tokio::test]
    async fn unavailable_store_errors() {
        let store = MemoryStore::new();
        store.put_schedule(ScheduleDefinition::new("s1", "w1", "https://api.example.com"));
        store.set_unavailable(true);
        assert!(matches!(store.load_schedule("s1").await, Err(EngineError::Store(_))));
        store.set_unavailable(false);
        assert!(store.load_schedule("s1").await.unwrap().is_some());
        assert!(store.delete(&EntityRef::schedule("s1")));
        assert!(store.load_schedule("s1").await.unwrap().is_none());
    }
}

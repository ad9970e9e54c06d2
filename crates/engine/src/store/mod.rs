//! Persistence seam of the dispatch worker.
//!
//! Definitions and channels are read-only here. Run records are appended
//! and never updated. An executed run and the counter update it causes are
//! written together by [`RunStore::record_run`]: either both land or
//! neither does.

mod memory;
mod postgres;

pub use memory::MemoryStore;
pub use postgres::PgStore;

use async_trait::async_trait;

use beacon_core::{
    EntityRef, EntityRunState, MonitorDefinition, NotificationChannel, RunRecord, RunStatus,
    ScheduleDefinition,
};

use crate::breaker::{BreakerPolicy, StateChange};
use crate::error::EngineError;

fn ensure_executed(run: &RunRecord) -> Result<(), EngineError> {
    if run.status == RunStatus::Canceled {
        return Err(EngineError::Store(format!("run {} was canceled and has no outcome", run.id)));
    }
    Ok(())
}

#[async_trait]
pub trait RunStore: Send + Sync {
    async fn load_schedule(&self, id: &str) -> Result<Option<ScheduleDefinition>, EngineError>;

    async fn load_monitor(&self, id: &str) -> Result<Option<MonitorDefinition>, EngineError>;

    /// Most recent run of the entity by finish time, canceled runs included.
    async fn last_run(&self, entity: &EntityRef) -> Result<Option<RunRecord>, EngineError>;

    /// Append a run that does not touch the counters (a canceled run).
    async fn insert_run(&self, run: &RunRecord) -> Result<(), EngineError>;

    /// Current counters; all-zero when the entity has never executed.
    async fn load_state(&self, entity: &EntityRef) -> Result<EntityRunState, EngineError>;

    /// Append an executed run and fold its outcome into the entity's
    /// counters as one atomic unit, returning the counters from just before
    /// and just after. A breaker that trips opens until
    /// `run.finished_at + duration`. Canceled runs are rejected.
    async fn record_run(&self, run: &RunRecord, breaker: BreakerPolicy) -> Result<StateChange, EngineError>;

    async fn enabled_channels(&self, workspace_id: &str) -> Result<Vec<NotificationChannel>, EngineError>;
}

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgPoolOptions;
use sqlx::{PgExecutor, PgPool};
use uuid::Uuid;

use beacon_core::config::PostgresConfig;
use beacon_core::{
    EntityKind, EntityRef, EntityRunState, MonitorDefinition, NotificationChannel, RunRecord, RunStatus,
    ScheduleDefinition,
};

use super::{ensure_executed, RunStore};
use crate::breaker::{BreakerPolicy, StateChange};
use crate::error::EngineError;

#[derive(Debug, sqlx::FromRow)]
struct RunRow {
    id: Uuid,
    entity_kind: String,
    entity_id: String,
    status: String,
    started_at: DateTime<Utc>,
    finished_at: DateTime<Utc>,
    latency_ms: Option<i64>,
    status_code: Option<i32>,
    error: Option<String>,
    response: Option<serde_json::Value>,
}

impl RunRow {
    fn into_record(self) -> Result<RunRecord, EngineError> {
        let kind = parse_kind(&self.entity_kind)?;
        let status = RunStatus::parse(&self.status)
            .ok_or_else(|| EngineError::Store(format!("unknown run status '{}'", self.status)))?;
        Ok(RunRecord {
            id: self.id,
            entity: EntityRef { kind, id: self.entity_id },
            status,
            started_at: self.started_at,
            finished_at: self.finished_at,
            latency_ms: self.latency_ms.and_then(|v| u64::try_from(v).ok()),
            status_code: self.status_code.and_then(|v| u16::try_from(v).ok()),
            error: self.error,
            response: self.response,
        })
    }
}

#[derive(Debug, sqlx::FromRow)]
struct StateRow {
    consecutive_failures: i32,
    consecutive_successes: i32,
    circuit_open_until: Option<DateTime<Utc>>,
}

impl From<StateRow> for EntityRunState {
    fn from(row: StateRow) -> Self {
        Self {
            consecutive_failures: u32::try_from(row.consecutive_failures).unwrap_or(0),
            consecutive_successes: u32::try_from(row.consecutive_successes).unwrap_or(0),
            circuit_open_until: row.circuit_open_until,
        }
    }
}

fn parse_kind(kind: &str) -> Result<EntityKind, EngineError> {
    match kind {
        "schedule" => Ok(EntityKind::Schedule),
        "monitor" => Ok(EntityKind::Monitor),
        other => Err(EngineError::Store(format!("unknown entity kind '{other}'"))),
    }
}

fn kind_str(entity: &EntityRef) -> &'static str {
    match entity.kind {
        EntityKind::Schedule => "schedule",
        EntityKind::Monitor => "monitor",
    }
}

const FAILURE_UPSERT: &str = "
    INSERT INTO entity_run_state AS s
        (entity_kind, entity_id, consecutive_failures, consecutive_successes, circuit_open_until)
    VALUES ($1, $2, 1, 0, CASE WHEN $4::timestamptz IS NOT NULL AND 1 >= $3 THEN $4 END)
    ON CONFLICT (entity_kind, entity_id) DO UPDATE SET
        consecutive_failures = s.consecutive_failures + 1,
        consecutive_successes = 0,
        circuit_open_until = CASE
            WHEN $4::timestamptz IS NOT NULL AND s.consecutive_failures + 1 >= $3 THEN $4
            ELSE s.circuit_open_until
        END,
        updated_at = now()
    RETURNING consecutive_failures, consecutive_successes, circuit_open_until";

const SUCCESS_UPSERT: &str = "
    INSERT INTO entity_run_state AS s
        (entity_kind, entity_id, consecutive_failures, consecutive_successes, circuit_open_until)
    VALUES ($1, $2, 0, 1, NULL)
    ON CONFLICT (entity_kind, entity_id) DO UPDATE SET
        consecutive_failures = 0,
        consecutive_successes = s.consecutive_successes + 1,
        circuit_open_until = NULL,
        updated_at = now()
    RETURNING consecutive_failures, consecutive_successes, circuit_open_until";

async fn insert_run_with<'e>(executor: impl PgExecutor<'e>, run: &RunRecord) -> Result<(), sqlx::Error> {
    sqlx::query(
        "INSERT INTO run_records
            (id, entity_kind, entity_id, status, started_at, finished_at,
             latency_ms, status_code, error, response)
         VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)",
    )
    .bind(run.id)
    .bind(kind_str(&run.entity))
    .bind(&run.entity.id)
    .bind(run.status.as_str())
    .bind(run.started_at)
    .bind(run.finished_at)
    .bind(run.latency_ms.map(|v| i64::try_from(v).unwrap_or(i64::MAX)))
    .bind(run.status_code.map(i32::from))
    .bind(run.error.as_deref())
    .bind(run.response.as_ref())
    .execute(executor)
    .await?;
    Ok(())
}

async fn upsert_state_with<'e>(
    executor: impl PgExecutor<'e>,
    run: &RunRecord,
    breaker: BreakerPolicy,
) -> Result<StateRow, sqlx::Error> {
    if run.status == RunStatus::Success {
        return sqlx::query_as::<_, StateRow>(SUCCESS_UPSERT)
            .bind(kind_str(&run.entity))
            .bind(&run.entity.id)
            .fetch_one(executor)
            .await;
    }
    let threshold = i32::try_from(breaker.threshold).unwrap_or(i32::MAX);
    // NULL when the breaker is disabled, which keeps the deadline as is.
    let deadline = breaker.trips_at(breaker.threshold, run.finished_at);
    sqlx::query_as::<_, StateRow>(FAILURE_UPSERT)
        .bind(kind_str(&run.entity))
        .bind(&run.entity.id)
        .bind(threshold)
        .bind(deadline)
        .fetch_one(executor)
        .await
}

/// PostgreSQL store. Counter updates are single `INSERT .. ON CONFLICT DO
/// UPDATE .. RETURNING` statements, so concurrent workers never lose an
/// increment. An executed run and its counter update share a transaction.
#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Connect and apply pending migrations.
    pub async fn connect(config: &PostgresConfig) -> Result<Self, EngineError> {
        if !config.is_configured() {
            return Err(EngineError::Config("PG_USERNAME is not set".to_string()));
        }
        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .connect(&config.connection_string())
            .await?;
        tracing::info!(host = %config.host, db = %config.database, "PostgreSQL connected");

        sqlx::migrate!("../../migrations").run(&pool).await?;
        tracing::info!("Database migrations applied");
        Ok(Self::new(pool))
    }

    /// Every stored schedule, for seeding in-process registrations.
    pub async fn schedules(&self) -> Result<Vec<ScheduleDefinition>, EngineError> {
        self.load_all("SELECT definition FROM schedules ORDER BY id").await
    }

    pub async fn monitors(&self) -> Result<Vec<MonitorDefinition>, EngineError> {
        self.load_all("SELECT definition FROM monitors ORDER BY id").await
    }

    async fn load_all<T: serde::de::DeserializeOwned>(&self, sql: &str) -> Result<Vec<T>, EngineError> {
        let rows = sqlx::query_as::<_, (serde_json::Value,)>(sql)
            .fetch_all(&self.pool)
            .await?;
        rows.into_iter()
            .map(|(doc,)| serde_json::from_value(doc).map_err(EngineError::from))
            .collect()
    }

    async fn load_definition<T: serde::de::DeserializeOwned>(
        &self,
        sql: &str,
        id: &str,
    ) -> Result<Option<T>, EngineError> {
        let row = sqlx::query_as::<_, (serde_json::Value,)>(sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(|(doc,)| serde_json::from_value(doc).map_err(EngineError::from))
            .transpose()
    }
}

#[async_trait]
impl RunStore for PgStore {
    async fn load_schedule(&self, id: &str) -> Result<Option<ScheduleDefinition>, EngineError> {
        self.load_definition("SELECT definition FROM schedules WHERE id = $1", id)
            .await
    }

    async fn load_monitor(&self, id: &str) -> Result<Option<MonitorDefinition>, EngineError> {
        self.load_definition("SELECT definition FROM monitors WHERE id = $1", id)
            .await
    }

    async fn last_run(&self, entity: &EntityRef) -> Result<Option<RunRecord>, EngineError> {
        let row = sqlx::query_as::<_, RunRow>(
            "SELECT id, entity_kind, entity_id, status, started_at, finished_at,
                    latency_ms, status_code, error, response
             FROM run_records
             WHERE entity_kind = $1 AND entity_id = $2
             ORDER BY finished_at DESC
             LIMIT 1",
        )
        .bind(kind_str(entity))
        .bind(&entity.id)
        .fetch_optional(&self.pool)
        .await?;
        row.map(RunRow::into_record).transpose()
    }

    async fn insert_run(&self, run: &RunRecord) -> Result<(), EngineError> {
        insert_run_with(&self.pool, run).await?;
        Ok(())
    }

    async fn load_state(&self, entity: &EntityRef) -> Result<EntityRunState, EngineError> {
        let row = sqlx::query_as::<_, StateRow>(
            "SELECT consecutive_failures, consecutive_successes, circuit_open_until
             FROM entity_run_state
             WHERE entity_kind = $1 AND entity_id = $2",
        )
        .bind(kind_str(entity))
        .bind(&entity.id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(EntityRunState::from).unwrap_or_default())
    }

    async fn record_run(&self, run: &RunRecord, breaker: BreakerPolicy) -> Result<StateChange, EngineError> {
        ensure_executed(run)?;
        let mut tx = self.pool.begin().await?;
        // Dropping `tx` on any error rolls every write back.
        // The row lock keeps `before` exact under concurrent runs.
        let before = sqlx::query_as::<_, StateRow>(
            "SELECT consecutive_failures, consecutive_successes, circuit_open_until
             FROM entity_run_state
             WHERE entity_kind = $1 AND entity_id = $2
             FOR UPDATE",
        )
        .bind(kind_str(&run.entity))
        .bind(&run.entity.id)
        .fetch_optional(&mut *tx)
        .await?;
        let after = upsert_state_with(&mut *tx, run, breaker).await?;
        insert_run_with(&mut *tx, run).await?;
        tx.commit().await?;
        Ok(StateChange::new(
            before.map(EntityRunState::from).unwrap_or_default(),
            after.into(),
        ))
    }

    async fn enabled_channels(&self, workspace_id: &str) -> Result<Vec<NotificationChannel>, EngineError> {
        let rows = sqlx::query_as::<_, (String, serde_json::Value)>(
            "SELECT id, channel FROM notification_channels
             WHERE workspace_id = $1 AND enabled
             ORDER BY id",
        )
        .bind(workspace_id)
        .fetch_all(&self.pool)
        .await?;

        // One malformed channel must not hide the others.
        let mut channels = Vec::with_capacity(rows.len());
        for (id, doc) in rows {
            match serde_json::from_value::<NotificationChannel>(doc) {
                Ok(channel) => channels.push(channel),
                Err(e) => tracing::warn!(channel_id = %id, error = %e, "Skipping malformed channel"),
            }
        }
        Ok(channels)
    }
}

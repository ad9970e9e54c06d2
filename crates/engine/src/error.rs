use thiserror::Error;

use beacon_queue::QueueError;

#[derive(Error, Debug)]
pub enum EngineError {
    /// Persistence failed; the job is nacked so the queue retries it.
    #[error("Store error: {0}")]
    Store(String),

    #[error("Queue error: {0}")]
    Queue(#[from] QueueError),

    #[error("Configuration error: {0}")]
    Config(String),
}

impl From<sqlx::Error> for EngineError {
    fn from(e: sqlx::Error) -> Self {
        EngineError::Store(e.to_string())
    }
}

impl From<sqlx::migrate::MigrateError> for EngineError {
    fn from(e: sqlx::migrate::MigrateError) -> Self {
        EngineError::Store(format!("migration failed: {e}"))
    }
}

impl From<serde_json::Error> for EngineError {
    fn from(e: serde_json::Error) -> Self {
        EngineError::Store(format!("stored document is malformed: {e}"))
    }
}

use thiserror::Error;

#[derive(Error, Debug)]
pub enum CoreError {
    #[error("Invalid definition: {0}")]
    InvalidDefinition(String),

    #[error("Serialization error: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("Configuration error: {0}")]
    Config(String),
}

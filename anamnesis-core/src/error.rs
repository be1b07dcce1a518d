use thiserror::Error;

#[derive(Error, Debug)]
pub enum AnamnesisError {
    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Record for patient {patient_id} changed concurrently; gave up after {attempts} attempts (retry the request)")]
    Conflict { patient_id: String, attempts: u32 },

    #[error("No record found for patient {0}")]
    NotFound(String),

    #[error("Out-of-order turn for conversation {conversation_id}: expected index {expected}, got {got}")]
    OutOfOrder {
        conversation_id: String,
        expected: u64,
        got: u64,
    },

    #[error("Store unavailable: {0}")]
    StoreUnavailable(String),

    #[error("Config error: {0}")]
    Config(#[from] config::ConfigError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<sqlx::Error> for AnamnesisError {
    fn from(e: sqlx::Error) -> Self {
        AnamnesisError::StoreUnavailable(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, AnamnesisError>;

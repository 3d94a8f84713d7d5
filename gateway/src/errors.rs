use crate::engine::{ExecutionId, ExecutionState};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("Authentication error: {0}")]
    Auth(String),

    #[error("Device {device_id} is outside the granted scope for farm {farm_id}")]
    Forbidden { farm_id: String, device_id: String },

    #[error("Query {execution_id} ended in state {state}: {reason}")]
    QueryFailed {
        execution_id: ExecutionId,
        state: ExecutionState,
        reason: String,
    },

    #[error(
        "Query {} did not reach a terminal state after {attempts} status checks",
        .execution_id.as_ref().map(ExecutionId::as_str).unwrap_or("(not submitted)")
    )]
    QueryTimeout {
        execution_id: Option<ExecutionId>,
        attempts: u32,
    },

    #[error("Analytics engine error: {0}")]
    Engine(String),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Database migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    #[error("Validation error: {0}")]
    Validation(String),
}

pub type Result<T> = std::result::Result<T, Error>;

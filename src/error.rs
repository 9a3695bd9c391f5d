//! Error types for backlog-rs.

use thiserror::Error;

use crate::model::feature::{FeatureId, State};

#[derive(Debug, Error)]
pub enum Error {
    /// Malformed or missing required input (empty steps, blank skip reason, ...).
    #[error("validation failed: {0}")]
    Validation(String),

    #[error("feature not found: {0}")]
    NotFound(FeatureId),

    /// A guarded transition lost a race against a concurrent writer.
    #[error("conflicting update on feature {id} during {operation}")]
    Conflict {
        id: FeatureId,
        operation: &'static str,
    },

    #[error("invalid state transition: {from} -> {to}")]
    InvalidTransition { from: State, to: State },

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("migration failed: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("config error: {0}")]
    Config(String),

    #[error("{0}")]
    Other(String),
}

pub type Result<T> = std::result::Result<T, Error>;

use thiserror::Error;

use crate::model::Status;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("dependency cycle: {}", chain.join(" -> "))]
    DependencyCycle { chain: Vec<String> },

    #[error("item '{id}' was claimed or changed by another writer")]
    ClaimConflict { id: String },

    #[error("coverage gap: missing [{}], duplicated [{}]", missing.join(", "), duplicated.join(", "))]
    CoverageGap {
        missing: Vec<String>,
        duplicated: Vec<String>,
    },

    #[error("item '{id}' has exhausted its retry budget")]
    BudgetExhausted { id: String },

    #[error("item '{id}': invalid transition from {from} to {to}")]
    InvalidTransition { id: String, from: Status, to: Status },

    #[error("item not found: {0}")]
    NotFound(String),

    #[error("invalid batch: {0}")]
    InvalidBatch(String),

    #[error("invalid value: {0}")]
    InvalidValue(String),

    #[error(transparent)]
    Sqlite(#[from] rusqlite::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

impl EngineError {
    /// Transient errors are retried by the caller instead of surfaced.
    pub fn is_transient(&self) -> bool {
        matches!(self, EngineError::ClaimConflict { .. })
    }
}

pub type Result<T> = std::result::Result<T, EngineError>;

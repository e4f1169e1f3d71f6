//! Error types for ov-core

use thiserror::Error;

/// Main error type for the control plane
#[derive(Error, Debug)]
pub enum Error {
    /// Malformed or missing job-spec fields. Raised before anything is spawned.
    #[error("Validation error: {0}")]
    Validation(String),

    /// A store write referenced a row that does not exist.
    #[error("Constraint violation: {0}")]
    ConstraintViolation(String),

    /// The OS refused to launch the worker process.
    #[error("Failed to spawn worker for job {job_id}: {reason}")]
    ProcessSpawn { job_id: String, reason: String },

    /// Worker exited non-zero or was found dead during reconciliation.
    #[error("Worker for job {job_id} crashed (exit code {exit_code:?})")]
    ProcessCrash { job_id: String, exit_code: Option<i32> },

    #[error("{kind} not found: {id}")]
    NotFound { kind: &'static str, id: String },

    /// A lifecycle transition that the state machine forbids.
    #[error("Invalid {kind} transition: {from} -> {to}")]
    InvalidTransition {
        kind: &'static str,
        from: String,
        to: String,
    },

    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("JSON parsing error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("{0}")]
    Other(String),
}

impl Error {
    pub fn not_found(kind: &'static str, id: impl ToString) -> Self {
        Self::NotFound {
            kind,
            id: id.to_string(),
        }
    }

    pub fn invalid_transition(kind: &'static str, from: impl ToString, to: impl ToString) -> Self {
        Self::InvalidTransition {
            kind,
            from: from.to_string(),
            to: to.to_string(),
        }
    }

    /// Map SQLite constraint failures onto `ConstraintViolation`, leaving
    /// every other database error as-is.
    pub fn from_sqlite(err: rusqlite::Error, context: &str) -> Self {
        match &err {
            rusqlite::Error::SqliteFailure(e, msg)
                if e.code == rusqlite::ErrorCode::ConstraintViolation =>
            {
                let detail = msg.clone().unwrap_or_else(|| e.to_string());
                Self::ConstraintViolation(format!("{}: {}", context, detail))
            }
            _ => Self::Database(err),
        }
    }

    /// Whether the caller can fix the request and retry.
    pub fn is_client_error(&self) -> bool {
        matches!(
            self,
            Self::Validation(_)
                | Self::ConstraintViolation(_)
                | Self::NotFound { .. }
                | Self::InvalidTransition { .. }
        )
    }
}

/// Result type alias for ov-core
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_not_found_display() {
        let err = Error::not_found("job", "abc");
        assert_eq!(err.to_string(), "job not found: abc");
        assert!(err.is_client_error());
    }

    #[test]
    fn test_constraint_mapping_passes_other_errors_through() {
        let err = Error::from_sqlite(rusqlite::Error::QueryReturnedNoRows, "insert task");
        assert!(matches!(err, Error::Database(_)));
        assert!(!err.is_client_error());
    }
}

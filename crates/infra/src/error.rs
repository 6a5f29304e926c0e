//! Engine-level error: domain rejections plus infrastructure failures.

use stockroom_core::DomainError;

use crate::jobs::JobStoreError;

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error(transparent)]
    Domain(#[from] DomainError),

    #[error("storage error: {0}")]
    Storage(String),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error(transparent)]
    Job(#[from] JobStoreError),
}

impl EngineError {
    pub fn storage(msg: impl Into<String>) -> Self {
        Self::Storage(msg.into())
    }

    /// Stable machine-readable code, paired with `Display` for the message.
    pub fn kind(&self) -> &'static str {
        match self {
            EngineError::Domain(err) => err.kind(),
            EngineError::Storage(_) => "storage_error",
            EngineError::Serialization(_) => "serialization_error",
            EngineError::Job(_) => "job_store_error",
        }
    }

    pub fn as_domain(&self) -> Option<&DomainError> {
        match self {
            EngineError::Domain(err) => Some(err),
            _ => None,
        }
    }
}

impl From<serde_json::Error> for EngineError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

impl From<sqlx::Error> for EngineError {
    fn from(err: sqlx::Error) -> Self {
        map_sqlx_error("query", err)
    }
}

/// Map a driver error, keeping the operation name for the log line.
///
/// | SQLSTATE | Meaning | Result |
/// |----------|---------|--------|
/// | `23505` | unique violation | `Domain(Conflict)` |
/// | `23514` | check violation (e.g. negative stock) | `Domain(InvariantViolation)` |
/// | `40001` | serialization failure | `Domain(Conflict)` |
/// | other | | `Storage` |
pub(crate) fn map_sqlx_error(operation: &str, err: sqlx::Error) -> EngineError {
    match err {
        sqlx::Error::Database(db_err) => {
            let msg = format!("database error in {operation}: {}", db_err.message());
            match db_err.code().as_deref() {
                Some("23505") | Some("40001") => DomainError::conflict(msg).into(),
                Some("23514") => DomainError::invariant(msg).into(),
                _ => EngineError::Storage(msg),
            }
        }
        sqlx::Error::PoolClosed => {
            EngineError::Storage(format!("connection pool closed in {operation}"))
        }
        other => EngineError::Storage(format!("sqlx error in {operation}: {other}")),
    }
}

use thiserror::Error;

/// Semantic error kinds from the error-handling design (§7). These are
/// deliberately coarse — callers match on kind, not on message text — so
/// that CLI exit-code selection and retry logic never need to downcast an
/// `anyhow::Error`.
#[derive(Debug, Error, Clone)]
pub enum AicError {
    #[error("ingestion rejected: {0}")]
    IngestionRejected(String),

    #[error("guardrail denied: {0}")]
    GuardrailDenied(String),

    #[error("action failed: {0}")]
    ActionFailed(String),

    #[error("validation failed: {0}")]
    ValidationFailed(String),

    #[error("gate failed: {}", .0.join("; "))]
    GateFailed(Vec<String>),

    #[error("transient storage error: {0}")]
    TransientStorage(String),

    #[error("fatal: {0}")]
    Fatal(String),
}

pub type AicResult<T> = Result<T, AicError>;

impl AicError {
    /// Exit code per §6: 0 success, 2 invalid input, 3 gate failure,
    /// 4 runtime failure, 5 rollback performed. Rollback-performed is a
    /// disposition the caller tracks alongside the error, not encoded here.
    pub fn exit_code(&self) -> i32 {
        match self {
            AicError::IngestionRejected(_) => 2,
            AicError::GateFailed(_) => 3,
            AicError::GuardrailDenied(_)
            | AicError::ActionFailed(_)
            | AicError::ValidationFailed(_)
            | AicError::TransientStorage(_)
            | AicError::Fatal(_) => 4,
        }
    }

    /// Whether this error kind is worth retrying at the storage boundary.
    pub fn is_transient(&self) -> bool {
        matches!(self, AicError::TransientStorage(_))
    }
}

use crate::types::{TransactionId, TransactionStatus};
use thiserror::Error;

/// Coordinator errors surfaced directly to the caller
///
/// None of these are retried; remote-call failures never appear here, they
/// are reported inside the commit result.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransactionError {
    #[error("Transaction not found: {0}")]
    NotFound(TransactionId),

    #[error("Cannot {action} transaction {id}: status is {status}")]
    FailedPrecondition {
        id: TransactionId,
        status: TransactionStatus,
        action: &'static str,
    },

    #[error("Transaction {id} targets {expected}; operation targets {found}")]
    ResourceMismatch {
        id: TransactionId,
        expected: String,
        found: String,
    },

    #[error("Too many active transactions ({active}/{limit})")]
    ResourceExhausted { active: usize, limit: usize },

    #[error("Coordinator is shutting down")]
    Shutdown,
}

impl TransactionError {
    /// Stable code string for the handler layer
    pub fn code(&self) -> &'static str {
        match self {
            TransactionError::NotFound(_) => "NOT_FOUND",
            TransactionError::FailedPrecondition { .. } => "FAILED_PRECONDITION",
            TransactionError::ResourceMismatch { .. } => "INVALID_ARGUMENT",
            TransactionError::ResourceExhausted { .. } => "RESOURCE_EXHAUSTED",
            TransactionError::Shutdown => "UNAVAILABLE",
        }
    }
}

pub type TransactionResult<T> = Result<T, TransactionError>;

//! sheetops - transaction and adaptive concurrency coordinator
//!
//! Groups spreadsheet tool calls into transactions, merges compatible
//! operations into fewer remote calls, and runs them under a shared AIMD
//! concurrency limit with retry and snapshot-based rollback.

pub mod admission;
pub mod batcher;
pub mod config;
pub mod endpoints;
pub mod metrics;
pub mod retry;
pub mod simulation;
pub mod structured_logging;
pub mod transaction;
pub mod types;

// Re-export commonly used types
pub use admission::{AdmissionConfig, AdmissionController, CallOutcome};
pub use config::{Config, ConfigError};
pub use retry::{RemoteError, RetryPolicy};
pub use transaction::{
    CommitResult, Operation, RollbackReport, TransactionCoordinator, TransactionError,
};
pub use types::{BeginOptions, IsolationLevel, TransactionId, TransactionStatus};

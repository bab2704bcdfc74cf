//! Transaction Coordinator Module
//!
//! Groups spreadsheet operations into transactions that commit through the
//! batcher, the retry policy and the shared admission controller.

// Submodules
pub mod collaborators;
pub mod coordinator;
pub mod coordinator_config;
pub mod operation;
pub mod resource_lock;
pub mod transaction_errors;
pub mod transaction_types;

// Re-exports for convenience
pub use collaborators::{
    ClientRouter, RemoteApiClient, SnapshotError, SnapshotGateway, SnapshotHandle,
};
pub use coordinator::TransactionCoordinator;
pub use coordinator_config::CoordinatorConfig;
pub use operation::{MergeMode, Operation, OperationKind, OperationScope, QueuedOperation};
pub use resource_lock::ResourceLocks;
pub use transaction_errors::{TransactionError, TransactionResult};
pub use transaction_types::{
    CommitEffect, CommitResult, CoordinatorStats, ListFilter, OperationOutcome, OperationResult,
    RollbackReport, StatusBreakdown, Transaction, TransactionList, TransactionView,
};

//! Structured logging context for transaction commits

use crate::batcher::{BatchPlan, RemoteCall};
use crate::retry::CallFailure;
use crate::transaction::SnapshotError;
use crate::types::{IsolationLevel, TransactionId};

/// Structured logger carrying the transaction context for one commit
#[derive(Debug, Clone)]
pub struct CommitLogger {
    transaction_id: String,
    resource_id: String,
}

impl CommitLogger {
    pub fn new(transaction_id: TransactionId, resource_id: &str) -> Self {
        Self {
            transaction_id: transaction_id.to_string(),
            resource_id: resource_id.to_string(),
        }
    }

    pub fn transaction_id(&self) -> &str {
        &self.transaction_id
    }

    pub fn log_commit_started(&self, operations: usize, isolation: IsolationLevel) {
        tracing::info!(
            transaction_id = %self.transaction_id,
            resource_id = %self.resource_id,
            operations = operations,
            isolation = isolation.as_str(),
            "Commit started"
        );
    }

    pub fn log_plan(&self, plan: &BatchPlan) {
        tracing::debug!(
            transaction_id = %self.transaction_id,
            operations = plan.operation_count,
            calls = plan.calls.len(),
            saved = plan.calls_saved(),
            "Commit batch planned"
        );

        for hint in &plan.hints {
            tracing::info!(
                transaction_id = %self.transaction_id,
                hint = %hint.message(),
                "Missed batching opportunity"
            );
        }
    }

    pub fn log_call_dispatched(&self, call: &RemoteCall) {
        tracing::debug!(
            transaction_id = %self.transaction_id,
            call = %call.label(),
            sequence = call.sequence_numbers.head,
            merged = call.operation_count(),
            "Dispatching remote call"
        );
    }

    pub fn log_call_failed(&self, call: &RemoteCall, failure: &CallFailure) {
        tracing::warn!(
            transaction_id = %self.transaction_id,
            call = %call.label(),
            sequence = call.sequence_numbers.head,
            error = %failure.error,
            class = failure.class.as_str(),
            retry_count = failure.retry_count,
            "Remote call failed, stopping commit"
        );
    }

    pub fn log_snapshot_captured(&self, snapshot_id: &str) {
        tracing::debug!(
            transaction_id = %self.transaction_id,
            resource_id = %self.resource_id,
            snapshot_id = %snapshot_id,
            "Snapshot captured"
        );
    }

    pub fn log_snapshot_failed(&self, error: &SnapshotError) {
        tracing::warn!(
            transaction_id = %self.transaction_id,
            resource_id = %self.resource_id,
            error = %error,
            "Snapshot capture failed, commit is not reversible"
        );
    }

    pub fn log_rollback(&self, restored: bool, error: Option<&str>) {
        match error {
            None => tracing::info!(
                transaction_id = %self.transaction_id,
                resource_id = %self.resource_id,
                restored = restored,
                "Transaction rolled back"
            ),
            Some(error) => tracing::error!(
                transaction_id = %self.transaction_id,
                resource_id = %self.resource_id,
                error = %error,
                "Rollback restore failed"
            ),
        }
    }

    pub fn log_commit_finished(&self, succeeded: bool, issued: usize, saved: usize, duration_ms: u64) {
        tracing::info!(
            transaction_id = %self.transaction_id,
            resource_id = %self.resource_id,
            succeeded = succeeded,
            api_calls_issued = issued,
            api_calls_saved = saved,
            duration_ms = duration_ms,
            "Commit finished"
        );
    }
}

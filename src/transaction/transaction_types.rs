//! Transaction record and the read-only views handed to callers

use super::collaborators::SnapshotHandle;
use super::operation::{Operation, QueuedOperation};
use crate::admission::AdmissionSnapshot;
use crate::batcher::BatchingHint;
use crate::retry::{FailureClass, RemoteError};
use crate::types::{BeginOptions, IsolationLevel, TransactionId, TransactionStatus};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Final state of one queued operation after a commit
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum OperationOutcome {
    Succeeded { response: Value },
    Failed { error: RemoteError, class: FailureClass },
    /// Commit stopped before this operation ran
    NotExecuted,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OperationResult {
    pub sequence_number: u64,
    /// `handler.action`
    pub action: String,
    pub outcome: OperationOutcome,
    /// Retries spent on the call that carried this operation
    pub retry_count: u32,
    /// Operations that travelled in the same remote call, this one included
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub batched_with: Vec<u64>,
}

impl OperationResult {
    pub fn not_executed(queued: &QueuedOperation) -> Self {
        Self {
            sequence_number: queued.sequence_number,
            action: queued.operation.kind.to_string(),
            outcome: OperationOutcome::NotExecuted,
            retry_count: 0,
            batched_with: Vec::new(),
        }
    }

    pub fn succeeded(&self) -> bool {
        matches!(self.outcome, OperationOutcome::Succeeded { .. })
    }

    pub fn failed(&self) -> bool {
        matches!(self.outcome, OperationOutcome::Failed { .. })
    }

    pub fn error(&self) -> Option<&RemoteError> {
        match &self.outcome {
            OperationOutcome::Failed { error, .. } => Some(error),
            _ => None,
        }
    }
}

/// What a commit left behind on the remote resource
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CommitEffect {
    /// Every operation applied
    AllApplied,
    /// Failed before any remote call succeeded; nothing to undo
    NoneApplied,
    /// Failed, and the snapshot was restored
    RolledBack,
    /// A prefix applied and was not undone
    PartiallyApplied,
    /// A restore was attempted and failed; remote state is unknown
    RollbackFailed,
}

/// Structured outcome of `commit`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommitResult {
    pub transaction_id: TransactionId,
    pub succeeded: bool,
    pub status: TransactionStatus,
    pub effect: CommitEffect,
    /// Mirrors the queued operations, in sequence order
    pub operation_results: Vec<OperationResult>,
    /// Planned calls actually dispatched
    pub api_calls_issued: usize,
    /// Dispatched operations minus dispatched calls
    pub api_calls_saved: usize,
    /// Attempts across all calls, retries included
    pub remote_attempts: u32,
    /// A snapshot was captured, so the commit can be undone
    pub reversible: bool,
    pub rollback_attempted: bool,
    pub rolled_back: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rollback_error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub snapshot: Option<SnapshotHandle>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub hints: Vec<BatchingHint>,
    pub duration_ms: u64,
}

impl CommitResult {
    pub fn failed_operation(&self) -> Option<&OperationResult> {
        self.operation_results.iter().find(|r| r.failed())
    }

    pub fn result_for(&self, sequence_number: u64) -> Option<&OperationResult> {
        self.operation_results
            .iter()
            .find(|r| r.sequence_number == sequence_number)
    }

    pub fn succeeded_count(&self) -> usize {
        self.operation_results.iter().filter(|r| r.succeeded()).count()
    }
}

/// Outcome of `rollback`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RollbackReport {
    pub transaction_id: TransactionId,
    pub previous_status: TransactionStatus,
    pub status: TransactionStatus,
    /// Queued operations dropped without running
    pub discarded_operations: usize,
    pub restore_attempted: bool,
    pub restored: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub restore_error: Option<String>,
    /// The transaction was executing; the rollback runs when the commit ends
    pub deferred: bool,
}

/// Coordinator-owned transaction record
#[derive(Debug, Clone)]
pub struct Transaction {
    pub id: TransactionId,
    pub resource_id: String,
    pub status: TransactionStatus,
    pub isolation_level: IsolationLevel,
    pub auto_rollback: bool,
    pub operations: Vec<QueuedOperation>,
    /// Per-operation progress, filled in while executing
    pub results: Vec<OperationResult>,
    pub snapshot: Option<SnapshotHandle>,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub commit_result: Option<CommitResult>,
    /// `rollback` arrived while executing
    pub rollback_requested: bool,
    /// The snapshot has already been restored once
    pub restored: bool,
    /// The commit future was dropped before it finished
    pub abandoned: bool,
    pub warnings: Vec<String>,
    next_sequence: u64,
}

impl Transaction {
    pub fn new(resource_id: impl Into<String>, options: BeginOptions) -> Self {
        Self {
            id: TransactionId::new(),
            resource_id: resource_id.into(),
            status: TransactionStatus::Pending,
            isolation_level: options.isolation_level,
            auto_rollback: options.auto_rollback,
            operations: Vec::new(),
            results: Vec::new(),
            snapshot: None,
            started_at: Utc::now(),
            ended_at: None,
            commit_result: None,
            rollback_requested: false,
            restored: false,
            abandoned: false,
            warnings: Vec::new(),
            next_sequence: 1,
        }
    }

    /// Append an operation; returns its 1-based queue position
    pub fn push(&mut self, operation: Operation) -> u64 {
        let sequence_number = self.next_sequence;
        self.next_sequence += 1;
        self.operations.push(QueuedOperation {
            sequence_number,
            operation,
            queued_at: Utc::now(),
        });
        if self.status == TransactionStatus::Pending {
            self.status = TransactionStatus::Queued;
        }
        sequence_number
    }

    pub fn finish(&mut self, status: TransactionStatus) {
        self.status = status;
        self.ended_at = Some(Utc::now());
    }

    pub fn duration_ms(&self) -> u64 {
        let end = self.ended_at.unwrap_or_else(Utc::now);
        (end - self.started_at).num_milliseconds().max(0) as u64
    }

    /// Any remote call of the last commit took effect
    pub fn has_applied_operations(&self) -> bool {
        self.results.iter().any(OperationResult::succeeded)
    }

    /// Read-only copy honouring the isolation level
    pub fn view(&self) -> TransactionView {
        let hide_progress = self.status == TransactionStatus::Executing
            && !self.isolation_level.exposes_partial_results();

        TransactionView {
            id: self.id,
            resource_id: self.resource_id.clone(),
            status: self.status,
            isolation_level: self.isolation_level,
            auto_rollback: self.auto_rollback,
            operation_count: self.operations.len(),
            operations: self.operations.clone(),
            results: if hide_progress || self.results.is_empty() {
                None
            } else {
                Some(self.results.clone())
            },
            snapshot: self.snapshot.clone(),
            started_at: self.started_at,
            ended_at: self.ended_at,
            duration_ms: self.duration_ms(),
            rollback_pending: self.rollback_requested,
            warnings: self.warnings.clone(),
        }
    }
}

/// Snapshot of a transaction's fields returned by `status` and `list`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransactionView {
    pub id: TransactionId,
    pub resource_id: String,
    pub status: TransactionStatus,
    pub isolation_level: IsolationLevel,
    pub auto_rollback: bool,
    pub operation_count: usize,
    pub operations: Vec<QueuedOperation>,
    /// Hidden while executing unless the isolation level is read_uncommitted
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub results: Option<Vec<OperationResult>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub snapshot: Option<SnapshotHandle>,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub duration_ms: u64,
    pub rollback_pending: bool,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub warnings: Vec<String>,
}

/// `list` filter; every field narrows the result
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ListFilter {
    #[serde(default)]
    pub resource_id: Option<String>,
    #[serde(default)]
    pub status: Option<TransactionStatus>,
    #[serde(default)]
    pub limit: Option<usize>,
}

impl ListFilter {
    pub fn for_resource(resource_id: impl Into<String>) -> Self {
        Self {
            resource_id: Some(resource_id.into()),
            ..Self::default()
        }
    }

    pub fn matches(&self, tx: &Transaction) -> bool {
        self.resource_id
            .as_deref()
            .map_or(true, |resource| tx.resource_id == resource)
            && self.status.map_or(true, |status| tx.status == status)
    }
}

/// Count of transactions per status
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusBreakdown {
    pub pending: usize,
    pub queued: usize,
    pub executing: usize,
    pub committed: usize,
    pub rolled_back: usize,
    pub failed: usize,
}

impl StatusBreakdown {
    pub fn record(&mut self, status: TransactionStatus) {
        match status {
            TransactionStatus::Pending => self.pending += 1,
            TransactionStatus::Queued => self.queued += 1,
            TransactionStatus::Executing => self.executing += 1,
            TransactionStatus::Committed => self.committed += 1,
            TransactionStatus::RolledBack => self.rolled_back += 1,
            TransactionStatus::Failed => self.failed += 1,
        }
    }

    pub fn get(&self, status: TransactionStatus) -> usize {
        match status {
            TransactionStatus::Pending => self.pending,
            TransactionStatus::Queued => self.queued,
            TransactionStatus::Executing => self.executing,
            TransactionStatus::Committed => self.committed,
            TransactionStatus::RolledBack => self.rolled_back,
            TransactionStatus::Failed => self.failed,
        }
    }

    pub fn active(&self) -> usize {
        self.pending + self.queued + self.executing
    }

    pub fn total(&self) -> usize {
        TransactionStatus::ALL.iter().map(|s| self.get(*s)).sum()
    }
}

/// Result of `list`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransactionList {
    /// Newest first by `started_at`
    pub transactions: Vec<TransactionView>,
    /// Breakdown over every transaction matching the filter, before `limit`
    pub breakdown: StatusBreakdown,
    pub total: usize,
}

/// Polled observability surface
#[derive(Debug, Clone, Serialize)]
pub struct CoordinatorStats {
    pub admission: AdmissionSnapshot,
    pub transactions: StatusBreakdown,
    pub transactions_begun: u64,
    pub commits_succeeded: u64,
    pub commits_failed: u64,
    pub rollbacks: u64,
    pub operations_committed: u64,
    pub api_calls_issued: u64,
    pub api_calls_saved: u64,
    pub remote_attempts: u64,
    pub retries: u64,
}

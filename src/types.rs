//! Common types used throughout the coordinator

use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Opaque transaction identifier, generated at `begin` time
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TransactionId(Uuid);

impl TransactionId {
    /// Create a new random transaction ID
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Parse from the string form handed out to callers
    pub fn parse(s: &str) -> Option<Self> {
        Uuid::parse_str(s).ok().map(Self)
    }

    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for TransactionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for TransactionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "tx_{}", self.0.simple())
    }
}

/// Transaction lifecycle status
///
/// `pending -> queued -> executing -> {committed | failed}`, with
/// `rolled_back` reachable from every non-terminal state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransactionStatus {
    Pending,
    Queued,
    Executing,
    Committed,
    RolledBack,
    Failed,
}

impl TransactionStatus {
    pub const ALL: [TransactionStatus; 6] = [
        TransactionStatus::Pending,
        TransactionStatus::Queued,
        TransactionStatus::Executing,
        TransactionStatus::Committed,
        TransactionStatus::RolledBack,
        TransactionStatus::Failed,
    ];

    /// `committed` and `rolled_back` never change again.
    /// `failed` can still move to `rolled_back`.
    pub fn is_terminal(&self) -> bool {
        matches!(self, TransactionStatus::Committed | TransactionStatus::RolledBack)
    }

    /// Operations may only be appended while pending or queued
    pub fn accepts_operations(&self) -> bool {
        matches!(self, TransactionStatus::Pending | TransactionStatus::Queued)
    }

    /// Counts against the active-transaction ceiling
    pub fn is_active(&self) -> bool {
        matches!(
            self,
            TransactionStatus::Pending | TransactionStatus::Queued | TransactionStatus::Executing
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TransactionStatus::Pending => "pending",
            TransactionStatus::Queued => "queued",
            TransactionStatus::Executing => "executing",
            TransactionStatus::Committed => "committed",
            TransactionStatus::RolledBack => "rolled_back",
            TransactionStatus::Failed => "failed",
        }
    }
}

impl fmt::Display for TransactionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Visibility of partial commit results to other readers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IsolationLevel {
    /// Per-operation progress is visible while executing
    ReadUncommitted,
    /// Only "executing" is visible until the commit finishes
    #[default]
    ReadCommitted,
    /// Read committed, plus the target resource is marked busy for the
    /// whole commit so other `begin` calls on it wait
    Serializable,
}

impl IsolationLevel {
    pub fn exposes_partial_results(&self) -> bool {
        matches!(self, IsolationLevel::ReadUncommitted)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            IsolationLevel::ReadUncommitted => "read_uncommitted",
            IsolationLevel::ReadCommitted => "read_committed",
            IsolationLevel::Serializable => "serializable",
        }
    }
}

/// Options accepted by `begin`
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct BeginOptions {
    #[serde(default)]
    pub isolation_level: IsolationLevel,
    #[serde(default)]
    pub auto_rollback: bool,
}

impl BeginOptions {
    pub fn with_auto_rollback(mut self, auto_rollback: bool) -> Self {
        self.auto_rollback = auto_rollback;
        self
    }

    pub fn with_isolation(mut self, isolation_level: IsolationLevel) -> Self {
        self.isolation_level = isolation_level;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_classification() {
        assert!(TransactionStatus::Committed.is_terminal());
        assert!(TransactionStatus::RolledBack.is_terminal());
        assert!(!TransactionStatus::Failed.is_terminal());

        assert!(TransactionStatus::Pending.accepts_operations());
        assert!(TransactionStatus::Queued.accepts_operations());
        assert!(!TransactionStatus::Executing.accepts_operations());
        assert!(!TransactionStatus::Committed.accepts_operations());
    }

    #[test]
    fn test_transaction_id_roundtrip() {
        let id = TransactionId::new();
        let parsed = TransactionId::parse(&id.as_uuid().to_string());
        assert_eq!(parsed, Some(id));
        assert!(id.to_string().starts_with("tx_"));
    }

    #[test]
    fn test_isolation_serde_names() {
        let json = serde_json::to_string(&IsolationLevel::ReadUncommitted).unwrap();
        assert_eq!(json, "\"read_uncommitted\"");
        assert_eq!(IsolationLevel::default(), IsolationLevel::ReadCommitted);
    }
}

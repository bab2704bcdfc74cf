//! Operation envelope queued into a transaction
//!
//! The coordinator never looks inside `params`; it only routes by `kind` and
//! compares `scope` when planning batches.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

/// Routing target: which handler serves the call and which of its actions
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct OperationKind {
    pub handler: String,
    pub action: String,
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.handler, self.action)
    }
}

/// What the operation touches
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct OperationScope {
    pub resource_id: String,
    /// A1-notation range, absent for whole-resource operations
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub range: Option<String>,
}

/// How an operation may combine with its neighbours
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MergeMode {
    /// `params` is a set of independently applied fields
    FieldPatch,
    /// Full-object or destructive; never merged, and orders everything
    /// around it on the same resource
    #[default]
    Exclusive,
}

/// Generic operation envelope
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Operation {
    pub kind: OperationKind,
    pub scope: OperationScope,
    #[serde(default)]
    pub params: Value,
    #[serde(default)]
    pub merge: MergeMode,
}

impl Operation {
    pub fn new(
        handler: impl Into<String>,
        action: impl Into<String>,
        resource_id: impl Into<String>,
    ) -> Self {
        Self {
            kind: OperationKind {
                handler: handler.into(),
                action: action.into(),
            },
            scope: OperationScope {
                resource_id: resource_id.into(),
                range: None,
            },
            params: Value::Object(Default::default()),
            merge: MergeMode::Exclusive,
        }
    }

    pub fn with_range(mut self, range: impl Into<String>) -> Self {
        self.scope.range = Some(range.into());
        self
    }

    pub fn with_params(mut self, params: Value) -> Self {
        self.params = params;
        self
    }

    /// Mark the params as independently applied fields
    pub fn field_patch(mut self) -> Self {
        self.merge = MergeMode::FieldPatch;
        self
    }

    pub fn resource_id(&self) -> &str {
        &self.scope.resource_id
    }
}

/// An operation with its position in the transaction
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueuedOperation {
    /// 1-based, strictly increasing in enqueue order
    pub sequence_number: u64,
    pub operation: Operation,
    pub queued_at: DateTime<Utc>,
}

//! Per-commit batch planning
//!
//! Reduces a transaction's queued operations to an ordered list of remote
//! calls. `FieldPatch` operations with the same handler, resource and range
//! fold into one call while no conflicting operation sits between them.
//! Everything else passes through as its own call, in enqueue order.

use super::range::GridRange;
use super::BatchingConfig;
use crate::transaction::operation::{MergeMode, QueuedOperation};
use itertools::Itertools;
use nonempty::NonEmpty;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

/// One request to a remote API client
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RemoteCall {
    pub handler: String,
    /// Distinct actions folded into this call, in arrival order
    pub actions: NonEmpty<String>,
    pub resource_id: String,
    pub range: Option<String>,
    pub params: Value,
    /// Operations this call covers
    pub sequence_numbers: NonEmpty<u64>,
}

impl RemoteCall {
    pub fn action(&self) -> &str {
        &self.actions.head
    }

    pub fn operation_count(&self) -> usize {
        self.sequence_numbers.len()
    }

    pub fn is_merged(&self) -> bool {
        self.sequence_numbers.len() > 1
    }

    /// `handler.action[ range]`, for logs
    pub fn label(&self) -> String {
        match &self.range {
            Some(range) => format!("{}.{} {}", self.handler, self.action(), range),
            None => format!("{}.{}", self.handler, self.action()),
        }
    }

    fn from_operation(queued: &QueuedOperation, range: Option<String>) -> Self {
        let op = &queued.operation;
        Self {
            handler: op.kind.handler.clone(),
            actions: NonEmpty::new(op.kind.action.clone()),
            resource_id: op.scope.resource_id.clone(),
            range,
            params: op.params.clone(),
            sequence_numbers: NonEmpty::new(queued.sequence_number),
        }
    }

    fn absorb(&mut self, queued: &QueuedOperation) {
        let op = &queued.operation;
        deep_merge(&mut self.params, &op.params);
        if !self.actions.iter().any(|a| a == &op.kind.action) {
            self.actions.push(op.kind.action.clone());
        }
        self.sequence_numbers.push(queued.sequence_number);
    }
}

/// Missed batching opportunity: two calls on contiguous ranges that could
/// have been issued as one. Informational only.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchingHint {
    pub handler: String,
    pub action: String,
    pub resource_id: String,
    pub first_sequence: u64,
    pub second_sequence: u64,
    pub first_range: String,
    pub second_range: String,
    pub suggested_range: String,
}

impl BatchingHint {
    pub fn message(&self) -> String {
        format!(
            "{}.{} on adjacent ranges {} and {} (operations #{} and #{}) could be one call on {}",
            self.handler,
            self.action,
            self.first_range,
            self.second_range,
            self.first_sequence,
            self.second_sequence,
            self.suggested_range
        )
    }
}

/// Output of one planning pass
#[derive(Debug, Clone, Default, Serialize)]
pub struct BatchPlan {
    pub calls: Vec<RemoteCall>,
    pub hints: Vec<BatchingHint>,
    pub operation_count: usize,
}

impl BatchPlan {
    /// Calls avoided by merging, if every planned call runs
    pub fn calls_saved(&self) -> usize {
        self.operation_count.saturating_sub(self.calls.len())
    }
}

/// Fold `patch` into `target` field by field
///
/// Nested objects merge key by key; any other value in `patch` replaces the
/// value in `target`.
pub fn deep_merge(target: &mut Value, patch: &Value) {
    match (target, patch) {
        (Value::Object(target), Value::Object(patch)) => {
            for (key, value) in patch {
                match target.get_mut(key) {
                    Some(existing) if existing.is_object() && value.is_object() => {
                        deep_merge(existing, value);
                    }
                    Some(existing) => *existing = value.clone(),
                    None => {
                        target.insert(key.clone(), value.clone());
                    }
                }
            }
        }
        (target, patch) => *target = patch.clone(),
    }
}

/// Where an operation lands inside its resource
#[derive(Debug, Clone)]
enum Footprint {
    /// No range: the whole resource
    Whole,
    Grid(GridRange),
    /// Range text that does not parse; assume it may touch anything
    Unknown,
}

impl Footprint {
    fn of(range: Option<&str>) -> Self {
        match range {
            None => Footprint::Whole,
            Some(text) => GridRange::parse(text).map_or(Footprint::Unknown, Footprint::Grid),
        }
    }

    fn overlaps(&self, other: &Footprint) -> bool {
        match (self, other) {
            (Footprint::Grid(a), Footprint::Grid(b)) => a.overlaps(b),
            _ => true,
        }
    }

    /// Canonical range text, so `a1:b2` and `A1:B2` share a merge key
    fn canonical(&self, raw: Option<&str>) -> Option<String> {
        match self {
            Footprint::Grid(range) => Some(range.to_string()),
            _ => raw.map(|r| r.trim().to_string()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct MergeKey {
    handler: String,
    resource_id: String,
    range: Option<String>,
}

#[derive(Debug)]
struct OpenGroup {
    key: MergeKey,
    call_index: usize,
    footprint: Footprint,
}

/// Plans the remote calls for one commit
#[derive(Debug, Clone, Default)]
pub struct OperationBatcher {
    config: BatchingConfig,
}

impl OperationBatcher {
    pub fn new(config: BatchingConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &BatchingConfig {
        &self.config
    }

    /// Plan calls for `operations`, which must be in sequence order
    pub fn plan(&self, operations: &[QueuedOperation]) -> BatchPlan {
        let mut calls: Vec<RemoteCall> = Vec::with_capacity(operations.len());
        let mut open: Vec<OpenGroup> = Vec::new();

        for queued in operations {
            let op = &queued.operation;
            let raw_range = op.scope.range.as_deref();
            let footprint = Footprint::of(raw_range);
            let range = footprint.canonical(raw_range);

            if !self.config.enabled {
                calls.push(RemoteCall::from_operation(queued, range));
                continue;
            }

            match op.merge {
                MergeMode::Exclusive => {
                    open.retain(|group| group.key.resource_id != op.scope.resource_id);
                    calls.push(RemoteCall::from_operation(queued, range));
                }
                MergeMode::FieldPatch => {
                    let key = MergeKey {
                        handler: op.kind.handler.clone(),
                        resource_id: op.scope.resource_id.clone(),
                        range: range.clone(),
                    };

                    if let Some(group) = open.iter().find(|group| group.key == key) {
                        calls[group.call_index].absorb(queued);
                        continue;
                    }

                    open.retain(|group| {
                        group.key.resource_id != key.resource_id
                            || !group.footprint.overlaps(&footprint)
                    });
                    open.push(OpenGroup {
                        key,
                        call_index: calls.len(),
                        footprint,
                    });
                    calls.push(RemoteCall::from_operation(queued, range));
                }
            }
        }

        let hints = if self.config.detect_adjacent_ranges {
            adjacency_hints(&calls)
        } else {
            Vec::new()
        };

        let plan = BatchPlan {
            calls,
            hints,
            operation_count: operations.len(),
        };

        debug!(
            operations = plan.operation_count,
            calls = plan.calls.len(),
            saved = plan.calls_saved(),
            hints = plan.hints.len(),
            "Batch plan ready"
        );

        plan
    }
}

fn adjacency_hints(calls: &[RemoteCall]) -> Vec<BatchingHint> {
    calls
        .iter()
        .tuple_windows()
        .filter(|(a, b)| {
            a.handler == b.handler && a.action() == b.action() && a.resource_id == b.resource_id
        })
        .filter_map(|(a, b)| {
            let first = GridRange::parse(a.range.as_deref()?)?;
            let second = GridRange::parse(b.range.as_deref()?)?;
            if !first.is_adjacent(&second) {
                return None;
            }
            Some(BatchingHint {
                handler: a.handler.clone(),
                action: a.action().to_string(),
                resource_id: a.resource_id.clone(),
                first_sequence: *a.sequence_numbers.last(),
                second_sequence: b.sequence_numbers.head,
                first_range: first.to_string(),
                second_range: second.to_string(),
                suggested_range: first.span(&second).to_string(),
            })
        })
        .collect()
}

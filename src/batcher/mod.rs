//! Operation Batcher Module
//!
//! Collect-then-merge planning of one commit's operations into remote calls

use serde::{Deserialize, Serialize};

// Submodules
pub mod operation_batcher;
pub mod range;

// Re-exports for convenience
pub use operation_batcher::{deep_merge, BatchPlan, BatchingHint, OperationBatcher, RemoteCall};
pub use range::GridRange;

/// Batch planning switches
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchingConfig {
    /// Fold same-scope field patches into one call
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Report contiguous ranges that were issued as separate calls
    #[serde(default = "default_true")]
    pub detect_adjacent_ranges: bool,
}

fn default_true() -> bool {
    true
}

impl Default for BatchingConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            detect_adjacent_ranges: true,
        }
    }
}

//! Admission Controller Module
//!
//! Process-wide bound on concurrent remote calls, adapted with AIMD from
//! rate-limit feedback

// Submodules
pub mod admission_config;
pub mod admission_controller;
pub mod admission_stats;

// Re-exports for convenience
pub use admission_config::AdmissionConfig;
pub use admission_controller::{
    AdmissionController, AdmissionError, AdmissionPermit, AdmissionSnapshot, CallOutcome,
};
pub use admission_stats::AdmissionStats;

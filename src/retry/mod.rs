//! Retry Module
//!
//! Failure classification and exponential backoff with jitter for remote calls

// Submodules
pub mod retry_errors;
pub mod retry_policy;

// Re-exports for convenience
pub use retry_errors::{FailureClass, RemoteError};
pub use retry_policy::{execute_with_retry, CallFailure, CallSuccess, RetryPolicy};

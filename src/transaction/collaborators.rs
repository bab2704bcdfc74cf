//! Interfaces the coordinator consumes but does not own

use crate::batcher::RemoteCall;
use crate::retry::RemoteError;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;

/// Reference to a captured copy of a remote resource
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotHandle {
    pub snapshot_id: String,
    pub resource_id: String,
    pub captured_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
pub enum SnapshotError {
    #[error("Snapshot capture failed for {resource_id}: {message}")]
    CaptureFailed { resource_id: String, message: String },

    #[error("Snapshot restore failed for {snapshot_id}: {message}")]
    RestoreFailed { snapshot_id: String, message: String },

    #[error("Snapshot not found: {0}")]
    NotFound(String),

    #[error("Snapshot gateway unavailable: {0}")]
    Unavailable(String),
}

/// Captures and restores point-in-time copies of a remote resource
#[async_trait]
pub trait SnapshotGateway: Send + Sync {
    async fn capture(&self, resource_id: &str) -> Result<SnapshotHandle, SnapshotError>;

    /// Returns the id of the restored resource
    async fn restore(&self, handle: &SnapshotHandle) -> Result<String, SnapshotError>;
}

/// Executes one planned remote call; failures arrive pre-classified
#[async_trait]
pub trait RemoteApiClient: Send + Sync {
    async fn invoke(&self, call: &RemoteCall) -> Result<Value, RemoteError>;
}

/// Routes calls to the client registered for their handler
#[derive(Clone, Default)]
pub struct ClientRouter {
    clients: HashMap<String, Arc<dyn RemoteApiClient>>,
    fallback: Option<Arc<dyn RemoteApiClient>>,
}

impl std::fmt::Debug for ClientRouter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientRouter")
            .field("handlers", &self.handlers())
            .field("fallback", &self.fallback.is_some())
            .finish()
    }
}

impl ClientRouter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Serve every handler with one client
    pub fn single(client: Arc<dyn RemoteApiClient>) -> Self {
        Self {
            clients: HashMap::new(),
            fallback: Some(client),
        }
    }

    pub fn register(mut self, handler: impl Into<String>, client: Arc<dyn RemoteApiClient>) -> Self {
        self.clients.insert(handler.into(), client);
        self
    }

    pub fn with_fallback(mut self, client: Arc<dyn RemoteApiClient>) -> Self {
        self.fallback = Some(client);
        self
    }

    pub fn route(&self, handler: &str) -> Option<&Arc<dyn RemoteApiClient>> {
        self.clients.get(handler).or(self.fallback.as_ref())
    }

    pub fn handlers(&self) -> Vec<&str> {
        let mut handlers: Vec<&str> = self.clients.keys().map(String::as_str).collect();
        handlers.sort_unstable();
        handlers
    }

    pub async fn invoke(&self, call: &RemoteCall) -> Result<Value, RemoteError> {
        match self.route(&call.handler) {
            Some(client) => client.invoke(call).await,
            None => Err(RemoteError::BadRequest {
                message: format!("no client registered for handler '{}'", call.handler),
            }),
        }
    }
}

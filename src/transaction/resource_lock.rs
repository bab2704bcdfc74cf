//! Per-resource busy markers for serializable commits
//!
//! A serializable commit holds the write side for its whole duration;
//! `begin` passes through the read side, so it waits while a serializable
//! commit runs on the same resource and never blocks other beginners.

use dashmap::DashMap;
use std::sync::Arc;
use tokio::sync::{OwnedRwLockWriteGuard, RwLock};
use tracing::debug;

pub type BusyGuard = OwnedRwLockWriteGuard<()>;

#[derive(Debug, Default)]
pub struct ResourceLocks {
    locks: DashMap<String, Arc<RwLock<()>>>,
}

impl ResourceLocks {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock_for(&self, resource_id: &str) -> Arc<RwLock<()>> {
        self.locks
            .entry(resource_id.to_string())
            .or_insert_with(|| Arc::new(RwLock::new(())))
            .clone()
    }

    /// Wait until no serializable commit holds `resource_id`
    pub async fn wait_until_free(&self, resource_id: &str) {
        let lock = self.lock_for(resource_id);
        if lock.try_read().is_err() {
            debug!(resource_id = %resource_id, "Resource busy, waiting for serializable commit");
        }
        drop(lock.read().await);
    }

    /// Mark `resource_id` busy until the guard is dropped
    pub async fn mark_busy(&self, resource_id: &str) -> BusyGuard {
        self.lock_for(resource_id).write_owned().await
    }

    pub fn is_busy(&self, resource_id: &str) -> bool {
        self.locks
            .get(resource_id)
            .map(|lock| lock.try_read().is_err())
            .unwrap_or(false)
    }

    /// Drop markers nobody holds or waits on; returns how many were removed
    pub fn prune(&self) -> usize {
        let before = self.locks.len();
        self.locks.retain(|_, lock| Arc::strong_count(lock) > 1);
        before - self.locks.len()
    }

    pub fn len(&self) -> usize {
        self.locks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.locks.is_empty()
    }
}

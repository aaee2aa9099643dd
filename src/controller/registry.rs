//! Worker registry owned by one controller
//!
//! Workers and the shared-config handle live behind a single lock. Readers
//! take a cloned snapshot; writers pass a closure that runs under the
//! exclusive lock, so no partially updated state is ever observable and the
//! lock is never held across an API call.

use std::collections::{BTreeMap, BTreeSet};

use tokio::sync::RwLock;

use crate::topology::{SharedConfig, Worker};

#[derive(Debug, Clone, Default)]
pub struct RegistryState {
    workers: BTreeMap<String, Worker>,

    /// Deletions acknowledged by the API whose objects may still be listed
    pending_deletion: BTreeSet<String>,

    shared_config: Option<SharedConfig>,
}

impl RegistryState {
    /// Register or refresh a worker
    pub fn insert_worker(&mut self, worker: Worker) {
        self.pending_deletion.remove(&worker.name);
        self.workers.insert(worker.name.clone(), worker);
    }

    /// Drop a worker whose deletion was acknowledged
    pub fn remove_deleted(&mut self, name: &str) -> Option<Worker> {
        self.pending_deletion.insert(name.to_string());
        self.workers.remove(name)
    }

    /// Drop a worker that disappeared without us deleting it
    pub fn forget(&mut self, name: &str) -> Option<Worker> {
        self.workers.remove(name)
    }

    /// The deleted object is no longer listed
    pub fn clear_pending(&mut self, name: &str) {
        self.pending_deletion.remove(name);
    }

    pub fn is_pending_deletion(&self, name: &str) -> bool {
        self.pending_deletion.contains(name)
    }

    pub fn pending_deletions(&self) -> impl Iterator<Item = &String> {
        self.pending_deletion.iter()
    }

    /// Workers ordered by name
    pub fn workers(&self) -> impl Iterator<Item = &Worker> {
        self.workers.values()
    }

    pub fn len(&self) -> usize {
        self.workers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.workers.is_empty()
    }

    pub fn shared_config(&self) -> Option<&SharedConfig> {
        self.shared_config.as_ref()
    }

    pub fn set_shared_config(&mut self, config: SharedConfig) {
        self.shared_config = Some(config);
    }

    /// The stored config is gone; the next apply creates it again
    pub fn clear_shared_config(&mut self) {
        self.shared_config = None;
    }

    /// Digest of the last applied shared config
    pub fn config_digest(&self) -> Option<String> {
        self.shared_config.as_ref().map(SharedConfig::digest)
    }
}

/// Lock-guarded registry with snapshot reads and closure-based writes
#[derive(Debug, Default)]
pub struct WorkerRegistry {
    state: RwLock<RegistryState>,
}

impl WorkerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Consistent copy of the current state
    pub async fn snapshot(&self) -> RegistryState {
        self.state.read().await.clone()
    }

    /// Apply a mutation under the exclusive lock
    pub async fn mutate<R>(&self, f: impl FnOnce(&mut RegistryState) -> R) -> R {
        let mut state = self.state.write().await;
        f(&mut state)
    }

    pub async fn len(&self) -> usize {
        self.state.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.state.read().await.is_empty()
    }
}

//! In-process orchestration backend
//!
//! Stores workers and shared configs in memory. Workers become `Running` as
//! soon as they are created. Knobs let callers inject the failures a real
//! cluster produces: failed or colliding creates, unavailable listings,
//! stale listings, slow calls and deletions that linger.

use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use super::{ApiError, OrchestrationApi};
use crate::resources::LabelSelector;
use crate::topology::{SharedConfig, Worker, WorkerPhase};

type Key = (String, String);

/// Number of calls received per verb
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CallCounts {
    pub creates: usize,
    pub lists: usize,
    pub deletes: usize,
    pub config_reads: usize,
    pub config_writes: usize,
}

#[derive(Debug, Default)]
struct Faults {
    failing_creates: usize,
    collide_creates: bool,
    fail_list: bool,
    fail_config: bool,
    fail_deletes: bool,
    linger_deletes: bool,
    call_delay: Option<Duration>,
    frozen_listing: Option<Vec<Worker>>,
}

#[derive(Debug, Default)]
struct MemoryState {
    workers: BTreeMap<Key, Worker>,
    configs: BTreeMap<Key, SharedConfig>,
    last_created: Option<DateTime<Utc>>,
    faults: Faults,
    calls: CallCounts,
}

#[derive(Debug, Default)]
pub struct InMemoryApi {
    state: Mutex<MemoryState>,
}

fn key(namespace: &str, name: &str) -> Key {
    (namespace.to_string(), name.to_string())
}

impl InMemoryApi {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, MemoryState> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    async fn delay(&self) {
        let delay = self.lock().faults.call_delay;
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
    }

    // =========================================================================
    // Inspection
    // =========================================================================

    /// Workers stored in a namespace, ordered by name
    pub fn workers(&self, namespace: &str) -> Vec<Worker> {
        self.lock()
            .workers
            .iter()
            .filter(|((ns, _), _)| ns == namespace)
            .map(|(_, w)| w.clone())
            .collect()
    }

    pub fn shared_config(&self, namespace: &str, name: &str) -> Option<SharedConfig> {
        self.lock().configs.get(&key(namespace, name)).cloned()
    }

    pub fn calls(&self) -> CallCounts {
        self.lock().calls
    }

    // =========================================================================
    // Out-of-band changes
    // =========================================================================

    /// Delete a worker behind the controller's back
    pub fn remove_out_of_band(&self, namespace: &str, name: &str) -> Option<Worker> {
        self.lock().workers.remove(&key(namespace, name))
    }

    /// Delete a shared config behind the controller's back
    pub fn remove_config_out_of_band(&self, namespace: &str, name: &str) -> Option<SharedConfig> {
        self.lock().configs.remove(&key(namespace, name))
    }

    /// Overwrite a shared config behind the controller's back
    pub fn replace_config_out_of_band(&self, config: SharedConfig) {
        self.lock()
            .configs
            .insert(key(&config.namespace, &config.name), config);
    }

    /// Force the phase of a stored worker
    pub fn set_phase(&self, namespace: &str, name: &str, phase: WorkerPhase) {
        if let Some(worker) = self.lock().workers.get_mut(&key(namespace, name)) {
            worker.phase = phase;
        }
    }

    /// Store a worker directly, as if another controller instance created it
    pub fn insert_worker(&self, worker: Worker) {
        let mut state = self.lock();
        let mut worker = worker;
        if worker.created_at.is_none() {
            worker.created_at = Some(next_timestamp(&mut state.last_created));
        }
        state
            .workers
            .insert(key(&worker.namespace, &worker.name), worker);
    }

    // =========================================================================
    // Fault injection
    // =========================================================================

    /// Fail the next `count` worker creations
    pub fn fail_next_creates(&self, count: usize) {
        self.lock().faults.failing_creates = count;
    }

    /// Report every worker creation as a name collision
    pub fn set_create_collisions(&self, enabled: bool) {
        self.lock().faults.collide_creates = enabled;
    }

    pub fn set_fail_list(&self, enabled: bool) {
        self.lock().faults.fail_list = enabled;
    }

    pub fn set_fail_config(&self, enabled: bool) {
        self.lock().faults.fail_config = enabled;
    }

    pub fn set_fail_deletes(&self, enabled: bool) {
        self.lock().faults.fail_deletes = enabled;
    }

    /// Keep deleted workers listed as `Terminating` until [`finish_deletions`](Self::finish_deletions)
    pub fn set_linger_deletes(&self, enabled: bool) {
        self.lock().faults.linger_deletes = enabled;
    }

    /// Remove every worker left `Terminating`
    pub fn finish_deletions(&self) {
        self.lock()
            .workers
            .retain(|_, w| w.phase != WorkerPhase::Terminating);
    }

    /// Delay every call, simulating a slow API server
    pub fn set_call_delay(&self, delay: Option<Duration>) {
        self.lock().faults.call_delay = delay;
    }

    /// Serve listings from the current contents until unfrozen
    pub fn freeze_listing(&self, frozen: bool) {
        let mut state = self.lock();
        state.faults.frozen_listing = if frozen {
            Some(state.workers.values().cloned().collect())
        } else {
            None
        };
    }
}

/// Strictly increasing creation timestamps so oldest-first ordering is exact
fn next_timestamp(last: &mut Option<DateTime<Utc>>) -> DateTime<Utc> {
    let now = Utc::now();
    let ts = match *last {
        Some(prev) if now <= prev => prev + chrono::Duration::microseconds(1),
        _ => now,
    };
    *last = Some(ts);
    ts
}

#[async_trait]
impl OrchestrationApi for InMemoryApi {
    async fn create_worker(&self, worker: &Worker) -> Result<Worker, ApiError> {
        self.delay().await;
        let mut state = self.lock();
        state.calls.creates += 1;

        if state.faults.collide_creates {
            return Err(ApiError::AlreadyExists(worker.name.clone()));
        }
        if state.faults.failing_creates > 0 {
            state.faults.failing_creates -= 1;
            return Err(ApiError::Transport("injected create failure".to_string()));
        }

        let k = key(&worker.namespace, &worker.name);
        if state.workers.contains_key(&k) {
            return Err(ApiError::AlreadyExists(worker.name.clone()));
        }

        let mut stored = worker.clone();
        stored.created_at = Some(next_timestamp(&mut state.last_created));
        stored.phase = WorkerPhase::Running;
        state.workers.insert(k, stored.clone());
        Ok(stored)
    }

    async fn list_workers(
        &self,
        namespace: &str,
        selector: &LabelSelector,
    ) -> Result<Vec<Worker>, ApiError> {
        self.delay().await;
        let mut state = self.lock();
        state.calls.lists += 1;

        if state.faults.fail_list {
            return Err(ApiError::Transport("injected list failure".to_string()));
        }

        let source: Vec<Worker> = match &state.faults.frozen_listing {
            Some(frozen) => frozen.clone(),
            None => state.workers.values().cloned().collect(),
        };

        Ok(source
            .into_iter()
            .filter(|w| w.namespace == namespace && selector.matches(&w.labels))
            .collect())
    }

    async fn delete_worker(&self, namespace: &str, name: &str) -> Result<(), ApiError> {
        self.delay().await;
        let mut state = self.lock();
        state.calls.deletes += 1;

        if state.faults.fail_deletes {
            return Err(ApiError::Transport("injected delete failure".to_string()));
        }

        let k = key(namespace, name);
        if state.faults.linger_deletes {
            return match state.workers.get_mut(&k) {
                Some(worker) => {
                    worker.phase = WorkerPhase::Terminating;
                    Ok(())
                }
                None => Err(ApiError::NotFound(name.to_string())),
            };
        }

        match state.workers.remove(&k) {
            Some(_) => Ok(()),
            None => Err(ApiError::NotFound(name.to_string())),
        }
    }

    async fn get_shared_config(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<SharedConfig>, ApiError> {
        self.delay().await;
        let mut state = self.lock();
        state.calls.config_reads += 1;
        Ok(state.configs.get(&key(namespace, name)).cloned())
    }

    async fn create_shared_config(&self, config: &SharedConfig) -> Result<SharedConfig, ApiError> {
        self.delay().await;
        let mut state = self.lock();
        state.calls.config_writes += 1;

        if state.faults.fail_config {
            return Err(ApiError::Transport("injected config failure".to_string()));
        }

        let k = key(&config.namespace, &config.name);
        if state.configs.contains_key(&k) {
            return Err(ApiError::AlreadyExists(config.name.clone()));
        }
        state.configs.insert(k, config.clone());
        Ok(config.clone())
    }

    async fn update_shared_config(&self, config: &SharedConfig) -> Result<SharedConfig, ApiError> {
        self.delay().await;
        let mut state = self.lock();
        state.calls.config_writes += 1;

        if state.faults.fail_config {
            return Err(ApiError::Transport("injected config failure".to_string()));
        }

        match state.configs.get_mut(&key(&config.namespace, &config.name)) {
            Some(existing) => {
                *existing = config.clone();
                Ok(config.clone())
            }
            None => Err(ApiError::NotFound(config.name.clone())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::naming::cluster_selector;
    use crate::spec::NatsCluster;
    use crate::topology::build_worker;

    fn worker(name: &str) -> Worker {
        build_worker(&NatsCluster::new("demo", 1, "2.10.4"), name)
    }

    #[tokio::test]
    async fn test_create_and_list() {
        let api = InMemoryApi::new();
        let created = api.create_worker(&worker("demo-a")).await.unwrap();

        assert_eq!(created.phase, WorkerPhase::Running);
        assert!(created.created_at.is_some());

        let listed = api
            .list_workers("default", &cluster_selector("demo"))
            .await
            .unwrap();
        assert_eq!(listed, vec![created]);

        let other = api
            .list_workers("default", &cluster_selector("other"))
            .await
            .unwrap();
        assert!(other.is_empty());
    }

    #[tokio::test]
    async fn test_duplicate_create_conflicts() {
        let api = InMemoryApi::new();
        api.create_worker(&worker("demo-a")).await.unwrap();
        let result = api.create_worker(&worker("demo-a")).await;
        assert_eq!(result, Err(ApiError::AlreadyExists("demo-a".to_string())));
    }

    #[tokio::test]
    async fn test_timestamps_strictly_increase() {
        let api = InMemoryApi::new();
        let a = api.create_worker(&worker("demo-a")).await.unwrap();
        let b = api.create_worker(&worker("demo-b")).await.unwrap();
        assert!(a.created_at < b.created_at);
    }

    #[tokio::test]
    async fn test_delete_missing_is_not_found() {
        let api = InMemoryApi::new();
        let result = api.delete_worker("default", "demo-a").await;
        assert!(matches!(result, Err(ApiError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_lingering_delete() {
        let api = InMemoryApi::new();
        api.set_linger_deletes(true);
        api.create_worker(&worker("demo-a")).await.unwrap();
        api.delete_worker("default", "demo-a").await.unwrap();

        assert_eq!(api.workers("default")[0].phase, WorkerPhase::Terminating);
        api.finish_deletions();
        assert!(api.workers("default").is_empty());
    }

    #[tokio::test]
    async fn test_frozen_listing_hides_new_workers() {
        let api = InMemoryApi::new();
        api.freeze_listing(true);
        api.create_worker(&worker("demo-a")).await.unwrap();

        let selector = cluster_selector("demo");
        assert!(api.list_workers("default", &selector).await.unwrap().is_empty());

        api.freeze_listing(false);
        assert_eq!(api.list_workers("default", &selector).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_config_create_then_update() {
        let api = InMemoryApi::new();
        let config = SharedConfig::new("demo", "default", "a");

        assert!(matches!(
            api.update_shared_config(&config).await,
            Err(ApiError::NotFound(_))
        ));
        api.create_shared_config(&config).await.unwrap();
        assert!(matches!(
            api.create_shared_config(&config).await,
            Err(ApiError::AlreadyExists(_))
        ));

        let updated = SharedConfig::new("demo", "default", "b");
        api.update_shared_config(&updated).await.unwrap();
        assert_eq!(api.shared_config("default", "demo"), Some(updated.clone()));
        assert_eq!(api.calls().config_writes, 4);

        assert_eq!(
            api.get_shared_config("default", "demo").await.unwrap(),
            Some(updated)
        );
        api.remove_config_out_of_band("default", "demo");
        assert_eq!(api.get_shared_config("default", "demo").await.unwrap(), None);
        assert_eq!(api.calls().config_reads, 2);
    }

    #[tokio::test]
    async fn test_injected_failures() {
        let api = InMemoryApi::new();
        api.fail_next_creates(1);
        assert!(api.create_worker(&worker("demo-a")).await.is_err());
        assert!(api.create_worker(&worker("demo-a")).await.is_ok());

        api.set_fail_list(true);
        assert!(api
            .list_workers("default", &cluster_selector("demo"))
            .await
            .is_err());
    }
}

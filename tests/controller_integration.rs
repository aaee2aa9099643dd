//! Integration tests for the cluster controller
//!
//! Every test drives a controller against the in-process orchestration
//! backend, injecting the failures a real cluster produces.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout};
use tokio_test::assert_ok;

use nats_operator::controller::{
    ControllerConfig, ControllerError, ControllerPhase, NatsClusterController, ShutdownReason,
};
use nats_operator::logging::{LogLevel, MemoryLogger};
use nats_operator::orchestration::InMemoryApi;
use nats_operator::spec::NatsCluster;
use nats_operator::topology::{render_shared_config, Worker, WorkerPhase};

const NS: &str = "default";

fn fast_config() -> ControllerConfig {
    ControllerConfig::default()
        .with_reconcile_interval(Duration::from_millis(20))
        .with_api_timeout(Duration::from_secs(2))
}

struct Harness {
    api: Arc<InMemoryApi>,
    logs: Arc<MemoryLogger>,
    controller: Arc<NatsClusterController>,
}

fn harness(size: u32, config: ControllerConfig) -> Harness {
    harness_on(Arc::new(InMemoryApi::new()), size, config)
}

fn harness_on(api: Arc<InMemoryApi>, size: u32, config: ControllerConfig) -> Harness {
    let logs = Arc::new(MemoryLogger::new());
    let controller = NatsClusterController::new(
        NatsCluster::new("demo", size, "2.10.4"),
        api.clone(),
        config,
        logs.clone(),
    )
    .expect("valid spec");
    Harness {
        api,
        logs,
        controller: Arc::new(controller),
    }
}

fn spawn_run(
    controller: &Arc<NatsClusterController>,
) -> JoinHandle<Result<ShutdownReason, ControllerError>> {
    let controller = controller.clone();
    tokio::spawn(async move { controller.run().await })
}

async fn wait_for_phase(controller: &NatsClusterController, phase: ControllerPhase) {
    let mut rx = controller.subscribe_phase();
    timeout(Duration::from_secs(5), rx.wait_for(|p| *p == phase))
        .await
        .expect("timed out waiting for phase")
        .expect("phase channel closed");
}

async fn eventually(what: &str, check: impl Fn() -> bool) {
    let result = timeout(Duration::from_secs(5), async {
        while !check() {
            sleep(Duration::from_millis(10)).await;
        }
    })
    .await;
    assert!(result.is_ok(), "timed out waiting for {}", what);
}

fn names(workers: &[Worker]) -> Vec<String> {
    workers.iter().map(|w| w.name.clone()).collect()
}

fn routes(api: &InMemoryApi) -> Vec<String> {
    api.shared_config(NS, "demo")
        .map(|c| c.routes())
        .unwrap_or_default()
}

#[tokio::test]
async fn test_converges_to_desired_size() {
    let h = harness(3, fast_config());
    let task = spawn_run(&h.controller);
    wait_for_phase(&h.controller, ControllerPhase::Reconciling).await;

    let workers = h.api.workers(NS);
    assert_eq!(workers.len(), 3);
    for worker in &workers {
        assert_eq!(worker.version(), Some("2.10.4"));
        assert_eq!(worker.labels.get("app").map(String::as_str), Some("nats"));
        assert_eq!(
            worker.labels.get("nats_cluster").map(String::as_str),
            Some("demo")
        );
    }

    let mut expected: Vec<_> = workers.iter().map(Worker::route_url).collect();
    expected.sort();
    assert_eq!(routes(&h.api), expected);

    h.controller.stop();
    assert_eq!(task.await.unwrap().unwrap(), ShutdownReason::Stopped);
}

#[tokio::test]
async fn test_reconcile_is_idempotent() {
    let h = harness(3, fast_config());
    assert_ok!(h.controller.reconcile().await);
    let before = h.api.calls();
    let workers = names(&h.api.workers(NS));

    for _ in 0..3 {
        let outcome = assert_ok!(h.controller.reconcile().await);
        assert!(outcome.is_steady());
    }

    let after = h.api.calls();
    assert_eq!(after.creates, before.creates);
    assert_eq!(after.deletes, before.deletes);
    assert_eq!(after.config_writes, before.config_writes);
    assert_eq!(names(&h.api.workers(NS)), workers);
}

#[tokio::test]
async fn test_scale_up_adds_routes() {
    let h = harness(2, fast_config());
    assert_ok!(h.controller.reconcile().await);
    let old_routes = routes(&h.api);

    let scaled = h.controller.spec().await.with_size(5);
    h.controller.update_spec(scaled).await.unwrap();
    let outcome = assert_ok!(h.controller.reconcile().await);

    assert_eq!(outcome.created.len(), 3);
    assert_eq!(h.api.workers(NS).len(), 5);
    let new_routes = routes(&h.api);
    assert_eq!(new_routes.len(), 5);
    for route in old_routes {
        assert!(new_routes.contains(&route));
    }
}

#[tokio::test]
async fn test_scale_down_removes_oldest_and_their_routes() {
    let h = harness(5, fast_config());
    assert_ok!(h.controller.reconcile().await);
    let mut by_age = h.api.workers(NS);
    by_age.sort_by(|a, b| a.age_key().cmp(&b.age_key()));

    h.controller
        .update_spec(NatsCluster::new("demo", 2, "2.10.4"))
        .await
        .unwrap();
    let outcome = assert_ok!(h.controller.reconcile().await);

    let oldest = names(&by_age[..3]);
    assert_eq!(outcome.deleted, oldest);

    let remaining = names(&h.api.workers(NS));
    assert_eq!(remaining.len(), 2);
    let remaining_routes = routes(&h.api);
    for worker in &by_age[..3] {
        assert!(!remaining.contains(&worker.name));
        assert!(!remaining_routes.contains(&worker.route_url()));
    }
}

#[tokio::test]
async fn test_shared_config_is_deterministic() {
    let h = harness(4, fast_config());
    assert_ok!(h.controller.reconcile().await);

    let mut workers = h.api.workers(NS);
    workers.sort_by(|a, b| a.name.cmp(&b.name));
    let spec = h.controller.spec().await;
    let rendered = render_shared_config(&workers, &spec.spec.server_config);

    let stored = h.api.shared_config(NS, "demo").unwrap();
    assert_eq!(stored.rendered(), rendered);

    workers.reverse();
    workers.sort_by(|a, b| a.name.cmp(&b.name));
    assert_eq!(
        render_shared_config(&workers, &spec.spec.server_config),
        rendered
    );
}

#[tokio::test]
async fn test_partial_create_failure_recovers() {
    let h = harness(4, fast_config());
    h.api.fail_next_creates(2);

    let task = spawn_run(&h.controller);
    let api = h.api.clone();
    eventually("four workers", move || api.workers(NS).len() == 4).await;

    assert!(h.logs.at_level(LogLevel::Error).len() >= 2);
    assert_eq!(h.api.calls().creates, 6);

    h.controller.stop();
    task.await.unwrap().unwrap();
}

#[tokio::test]
async fn test_stop_lets_the_running_pass_finish() {
    let h = harness(2, fast_config());
    assert_ok!(h.controller.reconcile().await);

    let task = spawn_run(&h.controller);
    wait_for_phase(&h.controller, ControllerPhase::Reconciling).await;

    h.api.set_call_delay(Some(Duration::from_millis(40)));
    h.controller
        .update_spec(NatsCluster::new("demo", 5, "2.10.4"))
        .await
        .unwrap();
    let api = h.api.clone();
    eventually("the scale-up pass to start", move || api.calls().creates >= 3).await;

    h.controller.stop();
    h.controller.stop();
    let reason = task.await.unwrap().unwrap();

    assert_eq!(reason, ShutdownReason::Stopped);
    assert_eq!(h.api.workers(NS).len(), 5);
    assert_eq!(h.controller.registry().len().await, 5);
    assert_eq!(h.controller.phase(), ControllerPhase::Stopped);

    // nothing after the stop touches the API
    let calls = h.api.calls();
    sleep(Duration::from_millis(100)).await;
    assert_eq!(h.api.calls(), calls);
}

#[tokio::test]
async fn test_wait_stopped_resolves_once_loop_ends() {
    let h = harness(1, fast_config());
    let task = spawn_run(&h.controller);
    wait_for_phase(&h.controller, ControllerPhase::Reconciling).await;

    let waiter = {
        let controller = h.controller.clone();
        tokio::spawn(async move { controller.wait_stopped().await })
    };
    h.controller.stop();

    timeout(Duration::from_secs(5), waiter)
        .await
        .expect("wait_stopped never resolved")
        .unwrap();
    assert!(h.controller.is_stopped());
    task.await.unwrap().unwrap();
}

#[tokio::test]
async fn test_restart_adopts_existing_workers() {
    let api = Arc::new(InMemoryApi::new());

    let first = harness_on(api.clone(), 3, fast_config());
    let task = spawn_run(&first.controller);
    wait_for_phase(&first.controller, ControllerPhase::Reconciling).await;
    first.controller.stop();
    task.await.unwrap().unwrap();
    let original = names(&api.workers(NS));

    let second = harness_on(api.clone(), 3, fast_config());
    let task = spawn_run(&second.controller);
    wait_for_phase(&second.controller, ControllerPhase::Reconciling).await;
    sleep(Duration::from_millis(100)).await;
    second.controller.stop();
    task.await.unwrap().unwrap();

    assert_eq!(names(&api.workers(NS)), original);
    assert_eq!(api.calls().creates, 3);
}

#[tokio::test]
async fn test_out_of_band_deletion_is_repaired() {
    let h = harness(3, fast_config().with_visibility_grace(Duration::ZERO));
    assert_ok!(h.controller.reconcile().await);
    let victim = h.api.workers(NS)[1].name.clone();

    h.api.remove_out_of_band(NS, &victim);
    let outcome = assert_ok!(h.controller.reconcile().await);

    assert_eq!(outcome.created.len(), 1);
    let current = names(&h.api.workers(NS));
    assert_eq!(current.len(), 3);
    assert!(!current.contains(&victim));
    assert!(!routes(&h.api).iter().any(|r| r.contains(&victim)));
}

#[tokio::test]
async fn test_running_loop_restores_deleted_config() {
    let h = harness(3, fast_config());
    let task = spawn_run(&h.controller);
    wait_for_phase(&h.controller, ControllerPhase::Reconciling).await;

    h.api.remove_config_out_of_band(NS, "demo");
    let api = h.api.clone();
    eventually("the shared config to come back", move || routes(&api).len() == 3).await;

    h.controller.stop();
    assert_eq!(task.await.unwrap().unwrap(), ShutdownReason::Stopped);
    assert_eq!(h.api.workers(NS).len(), 3);
}

#[tokio::test]
async fn test_exited_workers_are_replaced() {
    let h = harness(3, fast_config());
    assert_ok!(h.controller.reconcile().await);
    let workers = h.api.workers(NS);
    h.api.set_phase(NS, &workers[0].name, WorkerPhase::Succeeded);
    h.api.set_phase(NS, &workers[2].name, WorkerPhase::Failed);

    let outcome = assert_ok!(h.controller.reconcile().await);

    assert_eq!(outcome.deleted.len(), 2);
    assert_eq!(outcome.created.len(), 2);
    let current = h.api.workers(NS);
    assert_eq!(current.len(), 3);
    assert!(current.iter().all(|w| w.phase == WorkerPhase::Running));
}

#[tokio::test]
async fn test_version_change_rolls_workers() {
    let h = harness(3, fast_config());
    assert_ok!(h.controller.reconcile().await);
    let old = names(&h.api.workers(NS));

    h.controller
        .update_spec(NatsCluster::new("demo", 3, "2.11.0"))
        .await
        .unwrap();
    let outcome = assert_ok!(h.controller.reconcile().await);

    assert_eq!(outcome.created.len(), 3);
    assert_eq!(outcome.deleted.len(), 3);
    let current = h.api.workers(NS);
    assert_eq!(current.len(), 3);
    for worker in &current {
        assert!(!old.contains(&worker.name));
        assert_eq!(worker.version(), Some("2.11.0"));
        assert_eq!(worker.image(), Some("nats:2.11.0"));
    }
    assert_eq!(routes(&h.api).len(), 3);
}

#[tokio::test]
async fn test_name_collisions_end_the_loop() {
    let h = harness(2, fast_config().with_visibility_grace(Duration::ZERO));
    let task = spawn_run(&h.controller);
    wait_for_phase(&h.controller, ControllerPhase::Reconciling).await;

    h.api.set_create_collisions(true);
    let victim = h.api.workers(NS)[0].name.clone();
    h.api.remove_out_of_band(NS, &victim);

    let result = timeout(Duration::from_secs(5), task)
        .await
        .expect("controller kept running")
        .unwrap();

    assert!(matches!(result, Err(ControllerError::NameCollision { .. })));
    assert_eq!(h.logs.at_level(LogLevel::Fatal).len(), 1);
    assert_eq!(h.controller.phase(), ControllerPhase::Stopped);
}

#[tokio::test]
async fn test_stale_listing_does_not_duplicate_workers() {
    let h = harness(3, fast_config().with_visibility_grace(Duration::from_secs(60)));
    h.api.freeze_listing(true);

    for _ in 0..3 {
        assert_ok!(h.controller.reconcile().await);
    }

    assert_eq!(h.api.workers(NS).len(), 3);
    assert_eq!(h.api.calls().creates, 3);
}

#[tokio::test]
async fn test_lingering_deletions_are_not_repeated() {
    let h = harness(3, fast_config());
    assert_ok!(h.controller.reconcile().await);
    h.api.set_linger_deletes(true);

    h.controller
        .update_spec(NatsCluster::new("demo", 1, "2.10.4"))
        .await
        .unwrap();
    let outcome = assert_ok!(h.controller.reconcile().await);
    assert_eq!(outcome.deleted.len(), 2);
    assert_eq!(routes(&h.api).len(), 1);

    let deletes = h.api.calls().deletes;
    let outcome = assert_ok!(h.controller.reconcile().await);
    assert!(outcome.is_steady());
    assert_eq!(h.api.calls().deletes, deletes);
    assert_eq!(h.controller.registry().snapshot().await.pending_deletions().count(), 2);

    h.api.finish_deletions();
    assert_ok!(h.controller.reconcile().await);
    assert_eq!(h.api.workers(NS).len(), 1);
    assert_eq!(h.controller.registry().snapshot().await.pending_deletions().count(), 0);
}

#[tokio::test]
async fn test_failed_deletions_are_retried() {
    let h = harness(3, fast_config());
    assert_ok!(h.controller.reconcile().await);
    h.api.set_fail_deletes(true);

    let scaled = h.controller.spec().await.with_size(2);
    h.controller.update_spec(scaled).await.unwrap();
    let outcome = assert_ok!(h.controller.reconcile().await);

    assert!(outcome.deleted.is_empty());
    assert_eq!(outcome.failures, 1);
    assert_eq!(h.api.workers(NS).len(), 3);
    assert_eq!(h.controller.registry().len().await, 3);
    assert!(h.controller.status().await.last_error.is_some());

    h.api.set_fail_deletes(false);
    let outcome = assert_ok!(h.controller.reconcile().await);
    assert_eq!(outcome.deleted.len(), 1);
    assert_eq!(h.api.workers(NS).len(), 2);
    assert_eq!(routes(&h.api).len(), 2);
}

#[tokio::test]
async fn test_slow_api_calls_time_out() {
    let h = harness(
        1,
        fast_config().with_api_timeout(Duration::from_millis(20)),
    );
    h.api.set_call_delay(Some(Duration::from_millis(200)));

    let result = h.controller.reconcile().await;

    assert!(matches!(result, Err(ControllerError::Observe(_))));
    assert!(h.controller.status().await.last_error.is_some());
}

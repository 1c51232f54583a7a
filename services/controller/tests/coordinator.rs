//! Run coordinator: locking, discovery and cancellation.

use std::sync::Arc;
use std::time::Duration;

use hostcycle_controller::broker::{BrokerCall, MockBroker};
use hostcycle_controller::lock::{FileLockStore, InMemoryLockStore, RunLockStore};
use hostcycle_controller::timer::Pause;
use hostcycle_controller::{
    ControllerOptions, PhaseTimings, RunCoordinator, RunError, RunOutcome, RunSettings,
};
use tokio::sync::watch;

const TAG: &str = "nightly";

fn settings() -> RunSettings {
    RunSettings {
        controller: ControllerOptions {
            timings: PhaseTimings::from_minutes(60, 5, 2, 30),
            notify_users: false,
            concurrency: 8,
        },
        active_only: false,
        message_file: "/nonexistent/notice.txt".into(),
    }
}

fn coordinator(broker: &Arc<MockBroker>, locks: &Arc<InMemoryLockStore>) -> RunCoordinator {
    RunCoordinator::new(
        broker.clone(),
        locks.clone(),
        settings(),
        Pause::uncancellable(),
    )
}

#[tokio::test(start_paused = true)]
async fn test_empty_discovery_ends_early() {
    let broker = Arc::new(MockBroker::new());
    let locks = Arc::new(InMemoryLockStore::new());

    let report = coordinator(&broker, &locks).run(TAG).await.unwrap();

    assert_eq!(report.outcome, RunOutcome::NoMachines);
    assert_eq!(report.machines_total, 0);
    assert_eq!(broker.calls(), vec![BrokerCall::ListMachines(TAG.to_string())]);
    assert_eq!(broker.control_calls(), 0);
    assert!(!locks.is_held(TAG));
    assert_eq!(report.exit_code(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_lock_held_aborts_without_side_effects() {
    let broker = Arc::new(MockBroker::new().with_machine("a", false, &[0]));
    let locks = Arc::new(InMemoryLockStore::new());
    assert!(locks.acquire(TAG).unwrap());

    let err = coordinator(&broker, &locks).run(TAG).await.unwrap_err();

    assert!(matches!(err, RunError::LockHeld(ref tag) if tag == TAG));
    assert!(broker.calls().is_empty());
    // The other run still owns the lock.
    assert!(locks.is_held(TAG));
}

#[tokio::test(start_paused = true)]
async fn test_discovery_failure_releases_lock() {
    let broker = Arc::new(MockBroker::new().fail_discovery());
    let locks = Arc::new(InMemoryLockStore::new());

    let err = coordinator(&broker, &locks).run(TAG).await.unwrap_err();

    assert!(matches!(err, RunError::Discovery { .. }));
    assert!(!locks.is_held(TAG));
    assert_eq!(broker.control_calls(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_lock_released_after_completion() {
    let broker = Arc::new(MockBroker::new().with_machine("a", false, &[0]));
    let locks = Arc::new(InMemoryLockStore::new());

    let report = coordinator(&broker, &locks).run(TAG).await.unwrap();

    assert_eq!(report.outcome, RunOutcome::Completed);
    assert!(!locks.is_held(TAG));
}

#[tokio::test(start_paused = true)]
async fn test_file_lock_blocks_second_run() {
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(FileLockStore::new(dir.path()));
    assert!(store.acquire(TAG).unwrap());

    let broker = Arc::new(MockBroker::new().with_machine("a", false, &[0]));
    let coordinator = RunCoordinator::new(
        broker.clone(),
        store.clone(),
        settings(),
        Pause::uncancellable(),
    );

    let err = coordinator.run(TAG).await.unwrap_err();
    assert_eq!(err.exit_code(), 3);

    store.release(TAG).unwrap();
    let report = coordinator.run(TAG).await.unwrap();
    assert_eq!(report.outcome, RunOutcome::Completed);
    assert!(!store.path_for(TAG).exists());
}

#[tokio::test(start_paused = true)]
async fn test_anomaly_exit_code_and_summary() {
    let broker = Arc::new(
        MockBroker::new()
            .with_machine("a", false, &[9])
            .never_registers("a"),
    );
    let locks = Arc::new(InMemoryLockStore::new());
    let mut settings = settings();
    settings.controller.timings = PhaseTimings::from_minutes(2, 1, 1, 2);
    let coordinator = RunCoordinator::new(broker.clone(), locks.clone(), settings, Pause::uncancellable());

    let report = coordinator.run(TAG).await.unwrap();

    assert_eq!(report.outcome, RunOutcome::Anomaly);
    assert_eq!(report.exit_code(), 2);
    assert!(!locks.is_held(TAG));

    let json = serde_json::to_value(&report).unwrap();
    assert_eq!(json["outcome"], "anomaly");
    assert_eq!(json["stranded"][0], "a");
    assert_eq!(json["machines"][0]["rebooted"], true);
    assert_eq!(json["machines"][0]["ready"], false);
}

#[tokio::test(start_paused = true)]
async fn test_shutdown_cancels_run_and_releases_lock() {
    let broker = Arc::new(MockBroker::new().with_machine("a", false, &[4]));
    let locks = Arc::new(InMemoryLockStore::new());
    let (tx, rx) = watch::channel(false);
    let coordinator = RunCoordinator::new(broker.clone(), locks.clone(), settings(), Pause::new(rx));

    let canceller = tokio::spawn(async move {
        tokio::time::sleep(Duration::from_secs(10 * 60)).await;
        tx.send(true).unwrap();
        tx
    });

    let report = coordinator.run(TAG).await.unwrap();
    let _tx = canceller.await.unwrap();

    assert_eq!(report.outcome, RunOutcome::Cancelled);
    assert_eq!(report.exit_code(), 4);
    assert_eq!(broker.restarts_for("a"), 0);
    assert!(!locks.is_held(TAG));
}

//! Leader-election behavior of the periodic driver.

mod common;

use std::collections::BTreeMap;
use std::sync::Arc;

use common::*;
use pvecrs_core::driver::Driver;
use pvecrs_core::ControllerConfig;

fn minimal_cluster() -> FakeCluster {
    let mut vms = BTreeMap::new();
    vms.insert("pve1".to_string(), Vec::new());
    FakeCluster {
        nodes: vec![node("pve1")],
        vms,
        storages: vec![storage("local", 0, "images")],
        options: registered_tags(),
        ..Default::default()
    }
}

#[tokio::test]
async fn tick_runs_under_the_lock() {
    let api = FakePve::new(minimal_cluster());
    let coordinator = FakeCoordinator::new(true);
    let reconciler = Arc::new(reconciler_for(api.clone()));
    let driver = Driver::new(
        reconciler,
        coordinator.clone(),
        ControllerConfig::for_testing(),
    );

    let ran = driver.run_tick_if_leader().await.unwrap();
    assert!(ran);
    assert_eq!(*coordinator.acquires.lock().unwrap(), 1);
    assert_eq!(*coordinator.releases.lock().unwrap(), 1);
    // The tick reached the cluster: the pin group was created.
    assert!(api
        .recorded_calls()
        .contains(&"POST /cluster/ha/groups crs-vm-pin-pve1 nodes=pve1:1000".to_string()));
}

#[tokio::test]
async fn tick_is_skipped_without_the_lock() {
    let api = FakePve::new(minimal_cluster());
    let coordinator = FakeCoordinator::new(false);
    let reconciler = Arc::new(reconciler_for(api.clone()));
    let driver = Driver::new(
        reconciler,
        coordinator.clone(),
        ControllerConfig::for_testing(),
    );

    let ran = driver.run_tick_if_leader().await.unwrap();
    assert!(!ran);
    assert_eq!(*coordinator.acquires.lock().unwrap(), 1);
    assert_eq!(*coordinator.releases.lock().unwrap(), 0);
    assert_eq!(api.recorded_calls(), Vec::<String>::new());
}

#[tokio::test]
async fn startup_tick_runs_even_when_the_lock_is_held_elsewhere() {
    let api = FakePve::new(minimal_cluster());
    let coordinator = FakeCoordinator::new(false);
    let reconciler = Arc::new(reconciler_for(api.clone()));
    let driver = Driver::new(
        reconciler,
        coordinator.clone(),
        ControllerConfig::for_testing(),
    );

    // `run()` only returns on a signal; let it get through the startup
    // tick and into the periodic loop, then tear it down.
    let task = tokio::spawn(async move { driver.run().await });
    tokio::time::sleep(std::time::Duration::from_millis(50)).await;
    task.abort();

    // The startup tick reconciled the cluster without holding the lock.
    assert!(api
        .recorded_calls()
        .contains(&"POST /cluster/ha/groups crs-vm-pin-pve1 nodes=pve1:1000".to_string()));
}

#[tokio::test]
async fn startup_tick_failure_is_fatal() {
    let mut cluster = minimal_cluster();
    cluster.fail_ha_groups = true;

    let api = FakePve::new(cluster);
    let coordinator = FakeCoordinator::new(true);
    let reconciler = Arc::new(reconciler_for(api.clone()));
    let driver = Driver::new(
        reconciler,
        coordinator.clone(),
        ControllerConfig::for_testing(),
    );

    // The failure propagates out of `run()` before the periodic loop
    // starts; no lock was ever taken for it.
    let err = driver.run().await.unwrap_err();
    assert!(err.to_string().contains("ha groups unavailable"));
    assert_eq!(*coordinator.acquires.lock().unwrap(), 0);
}

#[tokio::test]
async fn lock_is_released_after_a_failed_tick() {
    let mut cluster = minimal_cluster();
    cluster.fail_ha_groups = true;

    let api = FakePve::new(cluster);
    let coordinator = FakeCoordinator::new(true);
    let reconciler = Arc::new(reconciler_for(api.clone()));
    let driver = Driver::new(
        reconciler,
        coordinator.clone(),
        ControllerConfig::for_testing(),
    );

    let err = driver.run_tick_if_leader().await.unwrap_err();
    assert!(err.to_string().contains("ha groups unavailable"));
    assert_eq!(*coordinator.acquires.lock().unwrap(), 1);
    assert_eq!(*coordinator.releases.lock().unwrap(), 1);
}

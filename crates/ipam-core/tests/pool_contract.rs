//! Pool-manager contract: grow/shrink thresholds, attachment-limit pinning,
//! and abandoned grow attempts.

mod common;

use std::sync::Arc;
use std::time::Duration;

use common::*;
use ipam_core::{DataStore, PodRequest, PoolConfig, PoolEvent, PoolManager};
use tokio::sync::mpsc;

fn fast_config() -> PoolConfig {
    PoolConfig {
        monitor_interval_secs: 1,
        eni_attach_wait_secs: 0,
        max_eni_attach_checks: 2,
        ..PoolConfig::default()
    }
}

fn drain(events: &mut mpsc::Receiver<PoolEvent>) -> Vec<PoolEvent> {
    let mut out = Vec::new();
    while let Ok(event) = events.try_recv() {
        out.push(event);
    }
    out
}

/// One primary ENI with 14 secondaries, fully assigned: zero headroom.
async fn exhausted_fixture() -> (
    PoolManager,
    mpsc::Receiver<PoolEvent>,
    Arc<MockCloud>,
    Arc<MockMetadata>,
    Arc<DataStore>,
) {
    let cloud = MockCloud::new("eni-1");
    cloud.describe("eni-1", eni_addresses(0, 14));
    let metadata = MockMetadata::new(vec![eni_meta("eni-1", 0)]);
    let datastore = Arc::new(DataStore::new());
    let (mut manager, events) = PoolManager::new(
        cloud.clone(),
        metadata.clone(),
        MockNodeAgent::new(vec![]),
        MockHostNetwork::new(),
        datastore.clone(),
        fast_config(),
    )
    .unwrap();
    manager.init().await.unwrap();
    for i in 0..14 {
        datastore
            .assign(&PodRequest::new(format!("p{i}"), "default", format!("c{i}")))
            .unwrap();
    }
    (manager, events, cloud, metadata, datastore)
}

#[tokio::test]
async fn grow_when_free_pool_exhausted() {
    let (mut manager, mut events, cloud, metadata, datastore) = exhausted_fixture().await;

    cloud.script_alloc(AllocOutcome::Eni("eni-2".to_string()));
    cloud.describe("eni-2", eni_addresses(1, 14));
    metadata.add(eni_meta("eni-2", 1));

    manager.reconcile().await;

    assert_eq!(cloud.alloc_eni_calls(), 1);
    assert_eq!(datastore.eni_count(), 2);
    assert_eq!(datastore.stats().total, 28);
    assert!(drain(&mut events)
        .iter()
        .any(|event| matches!(event, PoolEvent::EniProvisioned { eni_id } if eni_id == "eni-2")));
}

#[tokio::test]
async fn idle_between_thresholds() {
    let cloud = MockCloud::new("eni-1");
    cloud.describe("eni-1", eni_addresses(0, 14));
    cloud.describe("eni-2", eni_addresses(1, 14));
    let metadata = MockMetadata::new(vec![eni_meta("eni-1", 0), eni_meta("eni-2", 1)]);
    let datastore = Arc::new(DataStore::new());
    let (mut manager, _events) = PoolManager::new(
        cloud.clone(),
        metadata,
        MockNodeAgent::new(vec![]),
        MockHostNetwork::new(),
        datastore.clone(),
        fast_config(),
    )
    .unwrap();
    manager.init().await.unwrap();
    for i in 0..4 {
        datastore
            .assign(&PodRequest::new(format!("p{i}"), "default", format!("c{i}")))
            .unwrap();
    }

    // free = 24 with per-ENI capacity 15: neither threshold fires.
    manager.reconcile().await;

    assert_eq!(cloud.alloc_eni_calls(), 0);
    assert!(cloud.freed().is_empty());
    assert_eq!(datastore.eni_count(), 2);
}

#[tokio::test]
async fn shrink_when_pool_oversized() {
    let cloud = MockCloud::new("eni-1");
    for (eni, block) in [("eni-1", 0u8), ("eni-2", 1), ("eni-3", 2)] {
        cloud.describe(eni, eni_addresses(block, 14));
    }
    let metadata = MockMetadata::new(vec![
        eni_meta("eni-1", 0),
        eni_meta("eni-2", 1),
        eni_meta("eni-3", 2),
    ]);
    // Zero safety windows so teardown eligibility is immediate.
    let datastore = Arc::new(DataStore::with_windows(Duration::ZERO, Duration::ZERO));
    let (mut manager, mut events) = PoolManager::new(
        cloud.clone(),
        metadata,
        MockNodeAgent::new(vec![]),
        MockHostNetwork::new(),
        datastore.clone(),
        fast_config(),
    )
    .unwrap();
    manager.init().await.unwrap();

    // free = 42 > 2 * 15: shrink. The primary is skipped, so the first
    // eligible ENI by id goes.
    manager.reconcile().await;

    assert_eq!(cloud.freed(), vec!["eni-2".to_string()]);
    assert_eq!(datastore.eni_count(), 2);
    assert_eq!(datastore.stats().total, 28);
    assert!(drain(&mut events)
        .iter()
        .any(|event| matches!(event, PoolEvent::EniReleased { eni_id } if eni_id == "eni-2")));
}

#[tokio::test]
async fn attachment_limit_pins_eni_count() {
    let (mut manager, mut events, cloud, _metadata, datastore) = exhausted_fixture().await;

    cloud.script_alloc(AllocOutcome::AttachmentLimit);
    manager.reconcile().await;

    assert_eq!(manager.max_enis(), Some(1));
    assert_eq!(datastore.eni_count(), 1);
    assert!(drain(&mut events).iter().any(|event| matches!(
        event,
        PoolEvent::AttachmentLimitDiscovered { max_enis: 1 }
    )));

    // With the cap discovered, further ticks do not even call the cloud.
    manager.reconcile().await;
    assert_eq!(cloud.alloc_eni_calls(), 1);
}

#[tokio::test]
async fn grow_abandoned_when_eni_never_appears() {
    let (mut manager, mut events, cloud, metadata, datastore) = exhausted_fixture().await;

    cloud.script_alloc(AllocOutcome::Eni("eni-9".to_string()));
    // Metadata never lists eni-9; the attach poll must give up.
    let calls_before = metadata.calls();
    manager.reconcile().await;

    assert_eq!(metadata.calls(), calls_before + 2);
    assert_eq!(datastore.eni_count(), 1);
    assert!(drain(&mut events)
        .iter()
        .any(|event| matches!(event, PoolEvent::GrowAborted { .. })));
}

#[tokio::test]
async fn transient_alloc_failure_retries_next_tick() {
    let (mut manager, _events, cloud, metadata, datastore) = exhausted_fixture().await;

    cloud.script_alloc(AllocOutcome::Transient("RequestLimitExceeded".to_string()));
    manager.reconcile().await;
    assert_eq!(datastore.eni_count(), 1);
    assert_eq!(manager.max_enis(), None);

    cloud.script_alloc(AllocOutcome::Eni("eni-2".to_string()));
    cloud.describe("eni-2", eni_addresses(1, 14));
    metadata.add(eni_meta("eni-2", 1));
    manager.reconcile().await;
    assert_eq!(datastore.eni_count(), 2);
}

#[tokio::test]
async fn stats_event_published_each_tick() {
    let (mut manager, mut events, cloud, metadata, _datastore) = exhausted_fixture().await;
    cloud.script_alloc(AllocOutcome::Eni("eni-2".to_string()));
    cloud.describe("eni-2", eni_addresses(1, 14));
    metadata.add(eni_meta("eni-2", 1));
    drain(&mut events);

    manager.reconcile().await;

    assert!(drain(&mut events).iter().any(|event| matches!(
        event,
        PoolEvent::PoolStats {
            total: 14,
            assigned: 14,
            current_max_addrs_per_eni: 15,
            ..
        }
    )));
}

#[tokio::test]
async fn shutdown_stops_reconciler() {
    let (manager, _events, _cloud, _metadata, _datastore) = exhausted_fixture().await;
    let (shutdown_tx, shutdown_rx) = tokio::sync::oneshot::channel();
    let handle = tokio::spawn(manager.run_with_shutdown(shutdown_rx));

    tokio::time::sleep(Duration::from_millis(50)).await;
    shutdown_tx.send(()).unwrap();
    tokio::time::timeout(Duration::from_secs(1), handle)
        .await
        .expect("reconciler should stop promptly")
        .unwrap();
}

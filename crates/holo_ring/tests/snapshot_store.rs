//! Snapshot persistence: save, reload, restore and keep going.

mod common;

use std::sync::Arc;

use holo_ring::ring::{NoopSink, RingError, RingState, SnapshotStore};
use tempfile::TempDir;

use common::{ring, test_config, uniform_batch};

#[tokio::test]
async fn restored_ring_continues_where_it_left_off() {
    let dir = TempDir::new().expect("temp dir");
    let store = SnapshotStore::new(dir.path().join("ring").join("snapshot.json"));
    assert!(store.load().unwrap().is_none());

    let ring = ring(3);
    ring.run_batch(&uniform_batch(&[0, 1, 2], 2)).await.unwrap();
    ring.inject_failure(2).await.unwrap();
    ring.run_batch(&uniform_batch(&[0, 1, 2], 1)).await.unwrap();
    let snapshot = ring.snapshot().await;
    store.save(&snapshot).unwrap();

    let loaded = store.load().unwrap().expect("snapshot saved");
    assert_eq!(loaded, snapshot);

    let restored = RingState::restore(test_config(), loaded, Arc::new(NoopSink)).unwrap();
    assert_eq!(restored.participants().await, ring.participants().await);
    restored.check_invariants().await.unwrap();

    let ack = restored.inject_recovery(2).await.unwrap();
    assert_eq!(ack.caught_up, 1);
    let report = restored.run_batch(&uniform_batch(&[0, 1, 2], 1)).await.unwrap();
    assert_eq!(report.epoch, 2);
    assert!(report.fully_applied());
    restored.check_invariants().await.unwrap();
}

#[tokio::test]
async fn tampered_snapshot_is_rejected() {
    let ring = ring(3);
    ring.run_batch(&uniform_batch(&[0, 1, 2], 2)).await.unwrap();
    let mut snapshot = ring.snapshot().await;
    snapshot.participants[1].epoch_partition_log.insert(1, 7);

    let err = RingState::restore(test_config(), snapshot, Arc::new(NoopSink))
        .err()
        .expect("tampered snapshot must be rejected");
    assert!(matches!(err, RingError::CorruptSnapshot(_)));
    assert!(err.is_fatal());
}

#[test]
fn garbage_file_fails_to_load() {
    let dir = TempDir::new().expect("temp dir");
    let path = dir.path().join("snapshot.json");
    std::fs::write(&path, b"{ not json").unwrap();
    let err = SnapshotStore::new(&path).load().unwrap_err();
    assert!(err.to_string().contains("decode ring snapshot"));
}

//! Failure/recovery controller: quorum floor, catch-up after missed epochs,
//! and concurrent failure injection.

mod common;

use std::collections::BTreeMap;
use std::sync::Arc;

use holo_ring::ring::RingError;

use common::{ring, uniform_batch};

#[tokio::test]
async fn recovered_partition_catches_up_through_missed_epochs() {
    let ring = ring(3);
    ring.run_batch(&uniform_batch(&[0, 1, 2], 1)).await.unwrap();
    ring.inject_failure(1).await.unwrap();
    for _ in 0..3 {
        ring.run_batch(&uniform_batch(&[0, 1, 2], 2)).await.unwrap();
    }

    let frozen = ring.participant(1).await.unwrap();
    assert_eq!(frozen.committed_epoch_clock, 1);
    assert_eq!(frozen.committed_partition_clock, 1);
    // Lagging participant is not part of later comparisons.
    assert_eq!(ring.check_agreement(4).await.unwrap().compared, vec![0, 2]);

    let ack = ring.inject_recovery(1).await.unwrap();
    assert!(ack.changed);
    assert_eq!(ack.caught_up, 3);
    assert_eq!(ack.committed_epoch_clock, 4);

    let recovered = ring.participant(1).await.unwrap();
    assert_eq!(
        recovered.epoch_partition_log,
        BTreeMap::from([(0, 0), (1, 1), (2, 1), (3, 1), (4, 1)])
    );
    assert_eq!(ring.check_agreement(4).await.unwrap().compared, vec![0, 1, 2]);
    ring.check_invariants().await.unwrap();

    // Back in the batch rotation on the next epoch.
    let report = ring.run_batch(&uniform_batch(&[0, 1, 2], 1)).await.unwrap();
    assert_eq!(report.epoch, 4);
    assert!(report.fully_applied());
    let tail = ring.participant(2).await.unwrap();
    // 0 committed 1 + 3*2 + 1 = 8, 1 committed 1 + 1 = 2.
    assert_eq!(tail.epoch_sum_participation_log[&5], 10);
    ring.check_invariants().await.unwrap();
}

#[tokio::test]
async fn recovery_of_functional_partition_is_a_noop() {
    let ring = ring(3);
    ring.run_batch(&uniform_batch(&[0, 1, 2], 1)).await.unwrap();
    let ack = ring.inject_recovery(2).await.unwrap();
    assert!(!ack.changed);
    assert_eq!(ack.caught_up, 0);
    assert_eq!(ack.committed_epoch_clock, 1);
}

#[tokio::test]
async fn failed_head_still_anchors_the_recurrence() {
    let ring = ring(3);
    ring.run_batch(&uniform_batch(&[0, 1, 2], 3)).await.unwrap();
    ring.inject_failure(0).await.unwrap();
    let report = ring.run_batch(&uniform_batch(&[0, 1, 2], 1)).await.unwrap();
    assert_eq!(report.skipped.get(&0), Some(&1));
    assert_eq!(report.boundaries[0].entry.partition_clock, 3);
    assert_eq!(report.boundaries[0].entry.preceding_sum, 0);

    let second = ring.participant(1).await.unwrap();
    assert_eq!(second.epoch_sum_participation_log[&2], 3);
    ring.inject_recovery(0).await.unwrap();
    ring.check_invariants().await.unwrap();
}

#[tokio::test]
async fn five_partitions_tolerate_two_failures() {
    let ring = ring(5);
    ring.inject_failure(1).await.unwrap();
    ring.inject_failure(3).await.unwrap();
    assert!(matches!(
        ring.inject_failure(4).await,
        Err(RingError::QuorumWouldBeLost { remaining: 2, total: 5, .. })
    ));
    ring.inject_recovery(1).await.unwrap();
    ring.inject_failure(4).await.unwrap();
    assert_eq!(ring.functional_count().await, 3);
    ring.check_invariants().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_failures_never_break_the_quorum_floor() {
    for _ in 0..20 {
        let ring = Arc::new(ring(5));
        let mut tasks = Vec::new();
        for partition in 0..5 {
            let ring = ring.clone();
            tasks.push(tokio::spawn(async move { ring.inject_failure(partition).await }));
        }
        let mut accepted = 0;
        for task in tasks {
            match task.await.unwrap() {
                Ok(ack) => {
                    assert!(ack.changed);
                    accepted += 1;
                }
                Err(RingError::QuorumWouldBeLost { .. }) => {}
                Err(other) => panic!("unexpected error: {other:?}"),
            }
        }
        assert_eq!(accepted, 2);
        assert_eq!(ring.functional_count().await, 3);
    }
}

#[tokio::test]
async fn commits_resume_only_after_recovery() {
    let ring = ring(3);
    ring.inject_failure(2).await.unwrap();
    assert_eq!(
        ring.submit_operation(2, b"x").await,
        Err(RingError::ParticipantUnavailable { partition: 2 })
    );
    ring.run_batch(&uniform_batch(&[0, 1], 1)).await.unwrap();
    ring.inject_recovery(2).await.unwrap();
    let ack = ring.submit_operation(2, b"x").await.unwrap();
    assert_eq!(ack.committed_partition_clock, 1);
    assert_eq!(ack.epoch, 1);
    ring.drive_epoch_boundary(0, 1).await.unwrap();
    ring.drive_epoch_boundary(1, 1).await.unwrap();
    let boundary = ring.drive_epoch_boundary(2, 1).await.unwrap();
    assert_eq!(boundary.entry.partition_clock, 1);
    assert_eq!(boundary.entry.preceding_sum, 2);
    ring.check_invariants().await.unwrap();
}

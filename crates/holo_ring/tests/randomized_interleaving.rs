//! Seeded random interleavings of commits, batches, direct boundaries,
//! failures and recoveries.
//!
//! Every state law is checked after every step, not just at quiescence.

mod common;

use std::sync::Arc;
use std::time::Duration;

use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};

use holo_ring::ring::{quorum, RingError, RingState, TransactionBatch};

use common::{ring, ring_with_wait};

const PARTITIONS: u64 = 5;
const STEPS: usize = 300;

async fn epoch_of(ring: &RingState, partition: u64) -> u64 {
    ring.participant(partition).await.unwrap().committed_epoch_clock
}

async fn max_epoch(ring: &RingState) -> u64 {
    let participants = ring.participants().await;
    participants.iter().map(|p| p.committed_epoch_clock).max().unwrap_or(0)
}

async fn run_seed(seed: u64) {
    // Lagging boundaries are expected here; keep their wait short.
    let ring = ring_with_wait(PARTITIONS, Duration::from_millis(2));
    let mut rng = SmallRng::seed_from_u64(seed);

    for step in 0..STEPS {
        let partition = rng.gen_range(0..PARTITIONS);
        match rng.gen_range(0..12) {
            0..=2 => match ring.submit_operation(partition, b"op").await {
                Ok(_) | Err(RingError::ParticipantUnavailable { .. }) => {}
                Err(err) => panic!("seed {seed} step {step}: submit failed: {err}"),
            },
            3..=4 => {
                let mut batch = TransactionBatch::new();
                for target in 0..PARTITIONS {
                    for _ in 0..rng.gen_range(0..4) {
                        batch.push(target, b"batched".to_vec());
                    }
                }
                let before = ring.participants().await;
                match ring.run_batch(&batch).await {
                    Ok(report) => assert_eq!(report.boundaries.len(), PARTITIONS as usize),
                    Err(RingError::EpochOutOfOrder { .. }) => {
                        assert_eq!(ring.participants().await, before, "seed {seed} step {step}");
                    }
                    Err(err) => panic!("seed {seed} step {step}: batch failed: {err}"),
                }
            }
            5..=7 => {
                let epoch = epoch_of(&ring, partition).await;
                match ring.drive_epoch_boundary(partition, epoch).await {
                    Ok(ack) => assert_eq!(ack.committed_epoch_clock, epoch + 1),
                    Err(RingError::PredecessorLagging { .. })
                    | Err(RingError::ParticipantUnavailable { .. })
                    | Err(RingError::EpochOutOfOrder { .. }) => {}
                    Err(err) => panic!("seed {seed} step {step}: boundary failed: {err}"),
                }
            }
            8 | 9 => match ring.inject_failure(partition).await {
                Ok(_) | Err(RingError::QuorumWouldBeLost { .. }) => {}
                Err(err) => panic!("seed {seed} step {step}: fail failed: {err}"),
            },
            10 => {
                ring.inject_recovery(partition)
                    .await
                    .unwrap_or_else(|err| panic!("seed {seed} step {step}: recover failed: {err}"));
            }
            _ => {
                let epoch = rng.gen_range(0..=max_epoch(&ring).await);
                ring.check_agreement(epoch)
                    .await
                    .unwrap_or_else(|err| panic!("seed {seed} step {step}: {err}"));
            }
        }

        assert!(ring.functional_count().await >= quorum(PARTITIONS as usize));
        if let Err(violation) = ring.check_invariants().await {
            panic!("seed {seed} step {step}: {violation}");
        }
    }

    // Once everyone recovers, the ring agrees on every epoch all reached.
    for partition in 0..PARTITIONS {
        ring.inject_recovery(partition).await.unwrap();
    }
    let participants = ring.participants().await;
    let shared = participants.iter().map(|p| p.committed_epoch_clock).min().unwrap_or(0);
    for epoch in 0..=shared {
        let agreement = ring.check_agreement(epoch).await.unwrap();
        assert_eq!(agreement.compared.len(), PARTITIONS as usize);
    }
}

#[tokio::test]
async fn random_interleavings_preserve_every_law() {
    for seed in 0..16 {
        run_seed(seed).await;
    }
}

/// Every partition drives several epochs at once, tail first, with one
/// partition down; successors wait on predecessors that are epochs behind.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_boundaries_across_epochs_converge() {
    const EPOCHS: u64 = 4;
    let ring = Arc::new(ring(PARTITIONS));
    ring.inject_failure(2).await.unwrap();

    let mut tasks = Vec::new();
    for partition in (0..PARTITIONS).rev().filter(|p| *p != 2) {
        let ring = ring.clone();
        tasks.push(tokio::spawn(async move {
            for epoch in 0..EPOCHS {
                ring.submit_operation(partition, b"op").await?;
                loop {
                    match ring.drive_epoch_boundary(partition, epoch).await {
                        Ok(_) => break,
                        Err(RingError::PredecessorLagging { .. }) => tokio::task::yield_now().await,
                        Err(err) => return Err(err),
                    }
                }
            }
            Ok::<_, RingError>(())
        }));
    }
    for task in tasks {
        task.await.unwrap().unwrap();
    }

    ring.check_invariants().await.unwrap();
    let tail = ring.participant(PARTITIONS - 1).await.unwrap();
    assert_eq!(tail.committed_epoch_clock, EPOCHS);
    // Three functional partitions ahead of the tail, one op per epoch each.
    assert_eq!(tail.epoch_sum_participation_log[&EPOCHS], 3 * EPOCHS);

    let recovered = ring.inject_recovery(2).await.unwrap();
    assert_eq!(recovered.caught_up, EPOCHS);
    let agreement = ring.check_agreement(EPOCHS).await.unwrap();
    assert_eq!(agreement.compared.len(), PARTITIONS as usize);
}

//! Ring state: batch protocol, epoch boundaries and the failure/recovery controller.
//!
//! Design notes:
//! - Each participant sits behind its own `Mutex`. Its published boundary log
//!   lives beside it, is only appended to while that mutex is held, and is
//!   read by the ring successor without taking it.
//! - `inject_failure`/`inject_recovery` serialize on the membership lock so
//!   the quorum count they read cannot be invalidated by a concurrent call.
//! - Batches serialize on the batch lock and hold every participant lock for
//!   the whole round trip, so a rejected batch leaves nothing applied.
//!   Boundaries driven directly through `drive_epoch_boundary` may run
//!   concurrently at different partitions and different epochs; each holds at
//!   most one participant lock at a time.
//!
//! Lock order is batch -> membership -> participant.

use std::sync::Arc;

use tokio::sync::{Mutex, MutexGuard};

use super::checker;
use super::epoch_log::{boundary_entry, boundary_key, PublishedLog};
use super::participant::{ParticipantSnapshot, RingParticipant};
use super::store::RingSnapshot;
use super::{
    quorum, retains_quorum, Agreement, BatchReport, Config, EpochAck, EpochClock, EpochEntry,
    FailureAck, InvariantViolation, NoopSink, ObservedView, OperationAck, OperationMeta,
    OperationSink, PartitionId, RecoveryAck, RingError, RingTopology, TransactionBatch,
};

/// One ring slot: the participant's critical section plus its published log.
struct Slot {
    partition: PartitionId,
    participant: Mutex<RingParticipant>,
    published: PublishedLog,
}

/// Ordered collection of ring participants.
pub struct RingState {
    config: Config,
    topology: RingTopology,
    slots: Vec<Slot>,
    sink: Arc<dyn OperationSink>,
    membership: Mutex<()>,
    batch: Mutex<()>,
}

/// Create a ring with one functional participant per id, in the given order.
pub fn create_ring(
    partition_ids: impl IntoIterator<Item = PartitionId>,
) -> Result<RingState, RingError> {
    RingState::new(Config::default(), partition_ids, Arc::new(NoopSink))
}

impl RingState {
    pub fn new(
        config: Config,
        partition_ids: impl IntoIterator<Item = PartitionId>,
        sink: Arc<dyn OperationSink>,
    ) -> Result<Self, RingError> {
        let topology = RingTopology::new(partition_ids)?;
        let slots = topology
            .partitions()
            .iter()
            .enumerate()
            .map(|(pos, partition)| Slot {
                partition: *partition,
                participant: Mutex::new(RingParticipant::new(
                    *partition,
                    &topology.partitions()[..=pos],
                )),
                published: PublishedLog::new(*partition),
            })
            .collect();
        tracing::debug!(partitions = topology.len(), "ring created");
        Ok(Self::from_parts(config, topology, slots, sink))
    }

    /// Rebuild a ring from a persisted snapshot.
    ///
    /// The snapshot is validated first; a snapshot that breaks any state law
    /// is rejected as `CorruptSnapshot`.
    pub fn restore(
        config: Config,
        mut snapshot: RingSnapshot,
        sink: Arc<dyn OperationSink>,
    ) -> Result<Self, RingError> {
        let topology = snapshot.validate()?;
        let mut slots = Vec::with_capacity(topology.len());
        for participant in snapshot.participants {
            let partition = participant.partition;
            let entries = snapshot.published.remove(&partition).unwrap_or_default();
            slots.push(Slot {
                partition,
                participant: Mutex::new(RingParticipant::from_snapshot(participant)),
                published: PublishedLog::from_entries(partition, entries),
            });
        }
        tracing::info!(partitions = topology.len(), "ring restored from snapshot");
        Ok(Self::from_parts(config, topology, slots, sink))
    }

    fn from_parts(
        config: Config,
        topology: RingTopology,
        slots: Vec<Slot>,
        sink: Arc<dyn OperationSink>,
    ) -> Self {
        Self {
            config,
            topology,
            slots,
            sink,
            membership: Mutex::new(()),
            batch: Mutex::new(()),
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn topology(&self) -> &RingTopology {
        &self.topology
    }

    /// Functional participants required to accept a failure.
    pub fn quorum(&self) -> usize {
        quorum(self.slots.len())
    }

    fn slot(&self, partition: PartitionId) -> Result<(usize, &Slot), RingError> {
        let pos = self.topology.position(partition)?;
        Ok((pos, &self.slots[pos]))
    }

    /// Published entry of the prefix predecessor of `pos` at `key`.
    ///
    /// `Ok(None)` for the head of the ring.
    fn predecessor_entry(
        &self,
        pos: usize,
        key: EpochClock,
    ) -> Result<Option<EpochEntry>, RingError> {
        let Some(prev) = pos.checked_sub(1) else {
            return Ok(None);
        };
        let prev_slot = &self.slots[prev];
        match prev_slot.published.get(key) {
            Some(entry) => Ok(Some(entry)),
            None => Err(RingError::PredecessorLagging {
                partition: self.slots[pos].partition,
                predecessor: prev_slot.partition,
                epoch: key.saturating_sub(1),
            }),
        }
    }

    /// Commit one operation at `partition`.
    pub async fn submit_operation(
        &self,
        partition: PartitionId,
        op: &[u8],
    ) -> Result<OperationAck, RingError> {
        let (_, slot) = self.slot(partition)?;
        let mut participant = slot.participant.lock().await;
        self.apply_locked(&mut participant, op)
    }

    fn apply_locked(
        &self,
        participant: &mut RingParticipant,
        op: &[u8],
    ) -> Result<OperationAck, RingError> {
        let clock = participant.commit_local_operation()?;
        let meta = OperationMeta {
            partition: participant.partition(),
            partition_clock: clock,
            epoch: participant.committed_epoch_clock(),
        };
        self.sink.apply(op, meta);
        Ok(OperationAck {
            partition: meta.partition,
            committed_partition_clock: clock,
            epoch: meta.epoch,
        })
    }

    /// Close `expected_epoch` at `partition`: snapshot its clocks and advance.
    ///
    /// Non-functional partitions directly ahead of `partition` get their
    /// boundary published from their frozen clocks. Otherwise this waits up
    /// to `Config::epoch_wait_timeout` for the ring predecessor to publish
    /// the same boundary.
    pub async fn drive_epoch_boundary(
        &self,
        partition: PartitionId,
        expected_epoch: EpochClock,
    ) -> Result<EpochAck, RingError> {
        let (pos, slot) = self.slot(partition)?;
        {
            let participant = slot.participant.lock().await;
            check_boundary_preconditions(&participant, expected_epoch)?;
        }

        let key = boundary_key(expected_epoch);
        let predecessor = match pos.checked_sub(1) {
            None => None,
            Some(prev) => Some(self.await_predecessor(pos, prev, key).await?),
        };

        let mut participant = slot.participant.lock().await;
        // State may have changed while we waited.
        check_boundary_preconditions(&participant, expected_epoch)?;
        self.close_epoch_locked(pos, &mut participant, predecessor)
    }

    /// Entry of `prev` at `key`, publishing on behalf of the non-functional
    /// run of partitions ending at `prev` when needed.
    async fn await_predecessor(
        &self,
        pos: usize,
        prev: usize,
        key: EpochClock,
    ) -> Result<EpochEntry, RingError> {
        let partition = self.slots[pos].partition;
        let mut first_down = prev + 1;
        while let Some(idx) = first_down.checked_sub(1) {
            let slot = &self.slots[idx];
            if slot.published.get(key).is_some() || slot.participant.lock().await.is_functional() {
                break;
            }
            first_down = idx;
        }

        if let Some(anchor) = first_down.checked_sub(1) {
            if first_down <= prev {
                self.wait_published(partition, anchor, key).await?;
            }
        }
        for idx in first_down..=prev {
            let participant = self.slots[idx].participant.lock().await;
            if self.slots[idx].published.get(key).is_some() {
                continue;
            }
            if participant.is_functional() {
                // Recovered meanwhile; it closes the boundary itself.
                break;
            }
            let predecessor = self.predecessor_entry(idx, key)?;
            self.publish_frozen_locked(idx, key, &participant, predecessor)?;
        }
        self.wait_published(partition, prev, key).await
    }

    async fn wait_published(
        &self,
        partition: PartitionId,
        idx: usize,
        key: EpochClock,
    ) -> Result<EpochEntry, RingError> {
        let slot = &self.slots[idx];
        match slot
            .published
            .wait_for(key, self.config.epoch_wait_timeout)
            .await
        {
            Some(entry) => Ok(entry),
            None => {
                let epoch = key.saturating_sub(1);
                tracing::warn!(
                    partition,
                    predecessor = slot.partition,
                    epoch,
                    timeout_ms = self.config.epoch_wait_timeout.as_millis() as u64,
                    "predecessor boundary not published in time"
                );
                Err(RingError::PredecessorLagging {
                    partition,
                    predecessor: slot.partition,
                    epoch,
                })
            }
        }
    }

    fn close_epoch_locked(
        &self,
        pos: usize,
        participant: &mut RingParticipant,
        predecessor: Option<EpochEntry>,
    ) -> Result<EpochAck, RingError> {
        let slot = &self.slots[pos];
        let epoch = participant.committed_epoch_clock();
        let key = boundary_key(epoch);
        let entry = boundary_entry(participant.committed_partition_clock(), predecessor.as_ref());
        if let Err(err) = slot.published.publish(key, entry) {
            if err.is_fatal() {
                tracing::error!(
                    error = %err,
                    partition = slot.partition,
                    epoch,
                    "boundary diverges from published entry"
                );
            }
            return Err(err);
        }
        let view = self.observed_view(pos, key)?;
        participant.begin_epoch_snapshot(epoch, entry, view)?;
        let committed_epoch_clock = participant.advance_epoch()?;
        tracing::debug!(
            partition = slot.partition,
            epoch,
            partition_clock = entry.partition_clock,
            preceding_sum = entry.preceding_sum,
            "epoch boundary closed"
        );
        Ok(EpochAck {
            partition: slot.partition,
            epoch,
            committed_epoch_clock,
            entry,
            on_behalf: false,
        })
    }

    /// Publish the boundary of a non-functional partition from its frozen clock.
    ///
    /// The participant's own logs and epoch clock stay where they are; it
    /// replays the boundary itself when it recovers.
    fn publish_frozen_locked(
        &self,
        pos: usize,
        key: EpochClock,
        participant: &RingParticipant,
        predecessor: Option<EpochEntry>,
    ) -> Result<EpochAck, RingError> {
        let slot = &self.slots[pos];
        let epoch = key.saturating_sub(1);
        let entry = boundary_entry(participant.committed_partition_clock(), predecessor.as_ref());
        slot.published.publish(key, entry)?;
        tracing::debug!(
            partition = slot.partition,
            epoch,
            partition_clock = entry.partition_clock,
            frozen_at = participant.committed_epoch_clock(),
            "published boundary for non-functional partition"
        );
        Ok(EpochAck {
            partition: slot.partition,
            epoch,
            committed_epoch_clock: participant.committed_epoch_clock(),
            entry,
            on_behalf: true,
        })
    }

    /// Published entries of the ring prefix through `pos` at `key`.
    fn observed_view(&self, pos: usize, key: EpochClock) -> Result<ObservedView, RingError> {
        let mut view = ObservedView::new();
        for slot in &self.slots[..=pos] {
            let Some(entry) = slot.published.get(key) else {
                return Err(RingError::PredecessorLagging {
                    partition: self.slots[pos].partition,
                    predecessor: slot.partition,
                    epoch: key.saturating_sub(1),
                });
            };
            view.insert(slot.partition, entry);
        }
        Ok(view)
    }

    /// Carry one transaction batch around the ring.
    ///
    /// Each partition in ring order applies its slice and closes the current
    /// epoch before the batch moves on. Slices for non-functional partitions
    /// are skipped and their boundary is published from their frozen clock.
    /// Every partition must be at the head's epoch when the batch starts;
    /// otherwise the batch is rejected before anything is applied.
    pub async fn run_batch(&self, batch: &TransactionBatch) -> Result<BatchReport, RingError> {
        for partition in batch.partitions() {
            self.topology.position(partition)?;
        }

        let _batch = self.batch.lock().await;
        let mut guards = self.lock_all().await;
        let epoch = self.slots[0].published.head();
        for (slot, participant) in self.slots.iter().zip(&guards) {
            let actual = if participant.is_functional() {
                participant.committed_epoch_clock()
            } else {
                slot.published.head()
            };
            if actual != epoch {
                tracing::warn!(
                    partition = slot.partition,
                    epoch,
                    actual,
                    "rejecting batch: partition is not at the batch epoch"
                );
                return Err(RingError::EpochOutOfOrder {
                    partition: slot.partition,
                    expected: epoch,
                    actual,
                });
            }
        }

        let mut report = BatchReport {
            epoch,
            ..BatchReport::default()
        };
        let key = boundary_key(epoch);
        for (pos, participant) in guards.iter_mut().enumerate() {
            let slot = &self.slots[pos];
            let ops = batch.ops_for(slot.partition);
            let predecessor = self.predecessor_entry(pos, key)?;

            if participant.is_functional() {
                for op in ops {
                    self.apply_locked(participant, op)?;
                }
                report.applied.insert(slot.partition, ops.len());
                let ack = self.close_epoch_locked(pos, participant, predecessor)?;
                report.boundaries.push(ack);
            } else {
                if !ops.is_empty() {
                    tracing::warn!(
                        partition = slot.partition,
                        epoch,
                        skipped = ops.len(),
                        "skipping batch slice for non-functional partition"
                    );
                }
                report.skipped.insert(slot.partition, ops.len());
                let ack = self.publish_frozen_locked(pos, key, participant, predecessor)?;
                report.boundaries.push(ack);
            }
        }

        tracing::debug!(
            epoch,
            applied = report.applied.values().sum::<usize>(),
            skipped = report.skipped.values().sum::<usize>(),
            "batch round trip complete"
        );
        Ok(report)
    }

    async fn count_functional(&self) -> usize {
        let mut functional = 0;
        for slot in &self.slots {
            if slot.participant.lock().await.is_functional() {
                functional += 1;
            }
        }
        functional
    }

    pub async fn functional_count(&self) -> usize {
        let _membership = self.membership.lock().await;
        self.count_functional().await
    }

    /// Mark `partition` non-functional unless that would cost the ring its
    /// functional majority.
    pub async fn inject_failure(&self, partition: PartitionId) -> Result<FailureAck, RingError> {
        let (_, slot) = self.slot(partition)?;
        let _membership = self.membership.lock().await;
        let total = self.slots.len();
        let functional = self.count_functional().await;

        let mut participant = slot.participant.lock().await;
        if !participant.is_functional() {
            return Ok(FailureAck {
                partition,
                changed: false,
                functional,
                total,
            });
        }
        let remaining = functional.saturating_sub(1);
        if !retains_quorum(remaining, total) {
            tracing::warn!(
                partition,
                functional,
                total,
                "rejecting failure injection: quorum would be lost"
            );
            return Err(RingError::QuorumWouldBeLost {
                partition,
                remaining,
                total,
            });
        }
        participant.mark_failed();
        tracing::info!(
            partition,
            epoch = participant.committed_epoch_clock(),
            functional = remaining,
            total,
            "participant marked non-functional"
        );
        Ok(FailureAck {
            partition,
            changed: true,
            functional: remaining,
            total,
        })
    }

    /// Mark `partition` functional and replay the boundaries published on its
    /// behalf while it was down.
    pub async fn inject_recovery(&self, partition: PartitionId) -> Result<RecoveryAck, RingError> {
        let (pos, slot) = self.slot(partition)?;
        let _membership = self.membership.lock().await;
        let mut participant = slot.participant.lock().await;
        let changed = participant.mark_recovered();
        let caught_up = self.catch_up_locked(pos, &mut participant)?;
        if changed || caught_up > 0 {
            tracing::info!(
                partition,
                caught_up,
                epoch = participant.committed_epoch_clock(),
                "participant recovered"
            );
        }
        Ok(RecoveryAck {
            partition,
            changed,
            caught_up,
            committed_epoch_clock: participant.committed_epoch_clock(),
        })
    }

    fn catch_up_locked(
        &self,
        pos: usize,
        participant: &mut RingParticipant,
    ) -> Result<u64, RingError> {
        let slot = &self.slots[pos];
        let mut caught_up = 0u64;
        while participant.committed_epoch_clock() < slot.published.head() {
            let key = boundary_key(participant.committed_epoch_clock());
            let predecessor = self.predecessor_entry(pos, key)?;
            self.close_epoch_locked(pos, participant, predecessor)?;
            caught_up += 1;
        }
        if caught_up > 0 {
            tracing::warn!(
                partition = slot.partition,
                caught_up,
                "replayed epoch boundaries missed while non-functional"
            );
        }
        Ok(caught_up)
    }

    /// Lock every participant in ring order for a consistent read.
    async fn lock_all(&self) -> Vec<MutexGuard<'_, RingParticipant>> {
        let mut guards = Vec::with_capacity(self.slots.len());
        for slot in &self.slots {
            guards.push(slot.participant.lock().await);
        }
        guards
    }

    /// Consistent snapshot of every participant, in ring order.
    pub async fn participants(&self) -> Vec<ParticipantSnapshot> {
        let _membership = self.membership.lock().await;
        self.lock_all()
            .await
            .iter()
            .map(|participant| participant.snapshot())
            .collect()
    }

    pub async fn participant(
        &self,
        partition: PartitionId,
    ) -> Result<ParticipantSnapshot, RingError> {
        let (_, slot) = self.slot(partition)?;
        Ok(slot.participant.lock().await.snapshot())
    }

    /// Check the ring agreement invariant at `epoch`.
    pub async fn check_agreement(&self, epoch: EpochClock) -> Result<Agreement, RingError> {
        let participants = self.participants().await;
        checker::check_agreement(&participants, epoch).map_err(|err| {
            tracing::error!(error = %err, epoch, "ring agreement violated");
            err
        })
    }

    /// Check every state law over a consistent snapshot of the ring.
    pub async fn check_invariants(&self) -> Result<(), InvariantViolation> {
        let participants = self.participants().await;
        checker::check_invariants(&self.topology, &participants).map_err(|err| {
            tracing::error!(error = %err, "ring invariant violated");
            err
        })
    }

    /// Serializable snapshot of participants and published logs.
    pub async fn snapshot(&self) -> RingSnapshot {
        let _batch = self.batch.lock().await;
        let _membership = self.membership.lock().await;
        let guards = self.lock_all().await;
        // Publishing happens under the participant lock, so holding every
        // guard keeps participants and published logs in step.
        RingSnapshot {
            partitions: self.topology.partitions().to_vec(),
            participants: guards.iter().map(|p| p.snapshot()).collect(),
            published: self
                .slots
                .iter()
                .map(|slot| (slot.partition, slot.published.entries()))
                .collect(),
        }
    }
}

fn check_boundary_preconditions(
    participant: &RingParticipant,
    expected_epoch: EpochClock,
) -> Result<(), RingError> {
    if !participant.is_functional() {
        return Err(RingError::ParticipantUnavailable {
            partition: participant.partition(),
        });
    }
    let actual = participant.committed_epoch_clock();
    if actual != expected_epoch {
        return Err(RingError::EpochOutOfOrder {
            partition: participant.partition(),
            expected: expected_epoch,
            actual,
        });
    }
    Ok(())
}

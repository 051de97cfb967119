//! Per-partition ring participant state machine.
//!
//! A participant owns its clocks and epoch logs; the ring keeps each one
//! behind its own critical section so commits, snapshots, failure and
//! recovery are atomic with respect to a single partition.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use super::epoch_log::boundary_key;
use super::{
    EpochClock, EpochEntry, EpochPartitionLog, EpochSumPartitionLog, ObservedView,
    PartitionClock, PartitionId, RingError,
};

/// Serializable copy of a participant's state.
///
/// Log maps are keyed by `EpochClock` with integer values.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParticipantSnapshot {
    pub functional: bool,
    pub partition: PartitionId,
    pub committed_partition_clock: PartitionClock,
    pub uncommitted_partition_clock: PartitionClock,
    pub committed_epoch_clock: EpochClock,
    pub epoch_partition_log: EpochPartitionLog,
    pub epoch_sum_participation_log: EpochSumPartitionLog,
    /// Boundary entries of the ring prefix through this partition, per epoch.
    #[serde(default)]
    pub observed: BTreeMap<EpochClock, ObservedView>,
}

impl ParticipantSnapshot {
    /// Own boundary entry at `epoch`, if recorded.
    pub fn entry(&self, epoch: EpochClock) -> Option<EpochEntry> {
        Some(EpochEntry {
            partition_clock: *self.epoch_partition_log.get(&epoch)?,
            preceding_sum: *self.epoch_sum_participation_log.get(&epoch)?,
        })
    }
}

#[derive(Clone, Debug)]
pub struct RingParticipant {
    functional: bool,
    partition: PartitionId,
    committed_partition_clock: PartitionClock,
    uncommitted_partition_clock: PartitionClock,
    committed_epoch_clock: EpochClock,
    epoch_partition_log: EpochPartitionLog,
    epoch_sum_participation_log: EpochSumPartitionLog,
    observed: BTreeMap<EpochClock, ObservedView>,
}

impl RingParticipant {
    /// Create a functional participant with zero clocks and logs seeded at epoch 0.
    ///
    /// `prefix` is the ring prefix through `partition`; every member of it is
    /// known to be at zero when the ring starts.
    pub fn new(partition: PartitionId, prefix: &[PartitionId]) -> Self {
        let seed = prefix
            .iter()
            .map(|id| (*id, EpochEntry::zero()))
            .collect::<ObservedView>();
        Self {
            functional: true,
            partition,
            committed_partition_clock: 0,
            uncommitted_partition_clock: 0,
            committed_epoch_clock: 0,
            epoch_partition_log: BTreeMap::from([(0, 0)]),
            epoch_sum_participation_log: BTreeMap::from([(0, 0)]),
            observed: BTreeMap::from([(0, seed)]),
        }
    }

    pub fn from_snapshot(snapshot: ParticipantSnapshot) -> Self {
        Self {
            functional: snapshot.functional,
            partition: snapshot.partition,
            committed_partition_clock: snapshot.committed_partition_clock,
            uncommitted_partition_clock: snapshot.uncommitted_partition_clock,
            committed_epoch_clock: snapshot.committed_epoch_clock,
            epoch_partition_log: snapshot.epoch_partition_log,
            epoch_sum_participation_log: snapshot.epoch_sum_participation_log,
            observed: snapshot.observed,
        }
    }

    pub fn snapshot(&self) -> ParticipantSnapshot {
        ParticipantSnapshot {
            functional: self.functional,
            partition: self.partition,
            committed_partition_clock: self.committed_partition_clock,
            uncommitted_partition_clock: self.uncommitted_partition_clock,
            committed_epoch_clock: self.committed_epoch_clock,
            epoch_partition_log: self.epoch_partition_log.clone(),
            epoch_sum_participation_log: self.epoch_sum_participation_log.clone(),
            observed: self.observed.clone(),
        }
    }

    pub fn partition(&self) -> PartitionId {
        self.partition
    }

    pub fn is_functional(&self) -> bool {
        self.functional
    }

    pub fn committed_partition_clock(&self) -> PartitionClock {
        self.committed_partition_clock
    }

    pub fn uncommitted_partition_clock(&self) -> PartitionClock {
        self.uncommitted_partition_clock
    }

    pub fn committed_epoch_clock(&self) -> EpochClock {
        self.committed_epoch_clock
    }

    pub fn epoch_partition_log(&self) -> &EpochPartitionLog {
        &self.epoch_partition_log
    }

    pub fn epoch_sum_participation_log(&self) -> &EpochSumPartitionLog {
        &self.epoch_sum_participation_log
    }

    pub fn observed(&self, epoch: EpochClock) -> Option<&ObservedView> {
        self.observed.get(&epoch)
    }

    fn ensure_functional(&self) -> Result<(), RingError> {
        if self.functional {
            Ok(())
        } else {
            Err(RingError::ParticipantUnavailable {
                partition: self.partition,
            })
        }
    }

    /// Commit one operation, making it externally visible immediately.
    pub fn commit_local_operation(&mut self) -> Result<PartitionClock, RingError> {
        self.ensure_functional()?;
        self.uncommitted_partition_clock = self.uncommitted_partition_clock.saturating_add(1);
        self.committed_partition_clock = self.committed_partition_clock.saturating_add(1);
        Ok(self.committed_partition_clock)
    }

    /// Record the boundary that closes `epoch`.
    ///
    /// `entry` must carry this participant's committed clock; `view` holds the
    /// boundary entries of the ring prefix through this partition. The epoch
    /// clock is only moved by the following `advance_epoch`.
    pub fn begin_epoch_snapshot(
        &mut self,
        epoch: EpochClock,
        entry: EpochEntry,
        view: ObservedView,
    ) -> Result<(), RingError> {
        self.ensure_functional()?;
        if epoch != self.committed_epoch_clock {
            return Err(RingError::EpochOutOfOrder {
                partition: self.partition,
                expected: epoch,
                actual: self.committed_epoch_clock,
            });
        }
        debug_assert_eq!(entry.partition_clock, self.committed_partition_clock);
        let key = boundary_key(epoch);
        self.epoch_partition_log.insert(key, entry.partition_clock);
        self.epoch_sum_participation_log
            .insert(key, entry.preceding_sum);
        self.observed.insert(key, view);
        Ok(())
    }

    /// Move into the next epoch once its boundary snapshot is recorded.
    pub fn advance_epoch(&mut self) -> Result<EpochClock, RingError> {
        let next = boundary_key(self.committed_epoch_clock);
        if !self.epoch_partition_log.contains_key(&next)
            || !self.epoch_sum_participation_log.contains_key(&next)
        {
            return Err(RingError::EpochOutOfOrder {
                partition: self.partition,
                expected: next,
                actual: self.committed_epoch_clock,
            });
        }
        self.committed_epoch_clock = next;
        Ok(next)
    }

    /// Mark non-functional. Returns false if already non-functional.
    pub fn mark_failed(&mut self) -> bool {
        std::mem::replace(&mut self.functional, false)
    }

    /// Mark functional again. Counters are never rewound.
    pub fn mark_recovered(&mut self) -> bool {
        !std::mem::replace(&mut self.functional, true)
    }
}

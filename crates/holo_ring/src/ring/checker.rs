//! Read-only consistency predicates over participant snapshots.
//!
//! Nothing here mutates state. A failure is always a protocol bug, never an
//! expected transient condition, so callers surface it loudly.

use super::participant::ParticipantSnapshot;
use super::{
    quorum, Agreement, EpochClock, EpochEntry, InvariantViolation, LogField, ObservedView,
    PartitionId, RingError, RingTopology,
};

/// Check the ring agreement invariant at `epoch`.
///
/// Every pair of functional participants that reached `epoch` must hold
/// identical boundary entries for the partitions both have observed.
/// Participants frozen below `epoch` are left out of the comparison.
pub fn check_agreement(
    participants: &[ParticipantSnapshot],
    epoch: EpochClock,
) -> Result<Agreement, RingError> {
    let mut views = Vec::<(PartitionId, ObservedView)>::new();
    for participant in participants {
        if !participant.functional || participant.committed_epoch_clock < epoch {
            continue;
        }
        views.push((participant.partition, effective_view(participant, epoch)?));
    }

    for (idx, (partition_a, view_a)) in views.iter().enumerate() {
        for (partition_b, view_b) in &views[idx + 1..] {
            for (observed, entry_a) in view_a {
                let Some(entry_b) = view_b.get(observed) else {
                    continue;
                };
                compare_entries(epoch, *partition_a, *partition_b, *observed, entry_a, entry_b)?;
            }
        }
    }

    Ok(Agreement {
        epoch,
        compared: views.into_iter().map(|(partition, _)| partition).collect(),
    })
}

/// Observed view at `epoch` with the participant's own log entry folded in.
fn effective_view(
    participant: &ParticipantSnapshot,
    epoch: EpochClock,
) -> Result<ObservedView, RingError> {
    let mut view = participant
        .observed
        .get(&epoch)
        .cloned()
        .unwrap_or_default();
    if let Some(own) = participant.entry(epoch) {
        if let Some(recorded) = view.get(&participant.partition) {
            compare_entries(
                epoch,
                participant.partition,
                participant.partition,
                participant.partition,
                &own,
                recorded,
            )?;
        }
        view.insert(participant.partition, own);
    }
    Ok(view)
}

fn compare_entries(
    epoch: EpochClock,
    partition_a: PartitionId,
    partition_b: PartitionId,
    observed: PartitionId,
    a: &EpochEntry,
    b: &EpochEntry,
) -> Result<(), RingError> {
    let mismatch = if a.partition_clock != b.partition_clock {
        Some((LogField::EpochPartitionLog, a.partition_clock, b.partition_clock))
    } else if a.preceding_sum != b.preceding_sum {
        Some((LogField::EpochSumParticipationLog, a.preceding_sum, b.preceding_sum))
    } else {
        None
    };
    match mismatch {
        None => Ok(()),
        Some((field, left, right)) => Err(RingError::Disagreement {
            epoch,
            partition_a,
            partition_b,
            observed,
            field,
            left,
            right,
        }),
    }
}

/// Quorum law: a strict majority of the ring stays functional.
pub fn check_quorum(participants: &[ParticipantSnapshot]) -> Result<(), InvariantViolation> {
    let total = participants.len();
    let functional = participants.iter().filter(|p| p.functional).count();
    if total > 0 && functional < quorum(total) {
        return Err(InvariantViolation::QuorumLost { functional, total });
    }
    Ok(())
}

/// Check every state law over a consistent set of participant snapshots.
///
/// `participants` must be given in ring order.
pub fn check_invariants(
    topology: &RingTopology,
    participants: &[ParticipantSnapshot],
) -> Result<(), InvariantViolation> {
    let in_order = participants.len() == topology.len()
        && participants
            .iter()
            .zip(topology.partitions())
            .all(|(p, id)| p.partition == *id);
    if !in_order {
        return Err(InvariantViolation::MembershipMismatch);
    }

    for (pos, participant) in participants.iter().enumerate() {
        check_participant(participant)?;
        if pos == 0 {
            check_head(participant)?;
        } else {
            check_recurrence(&participants[pos - 1], participant)?;
        }
    }

    check_quorum(participants)?;

    let last_shared = participants
        .iter()
        .filter(|p| p.functional)
        .map(|p| p.committed_epoch_clock)
        .max()
        .unwrap_or(0);
    for epoch in 0..=last_shared {
        check_agreement(participants, epoch)
            .map_err(|err| InvariantViolation::Agreement(Box::new(err)))?;
    }
    Ok(())
}

fn check_participant(p: &ParticipantSnapshot) -> Result<(), InvariantViolation> {
    if p.uncommitted_partition_clock < p.committed_partition_clock {
        return Err(InvariantViolation::ClockOrdering {
            partition: p.partition,
            committed: p.committed_partition_clock,
            uncommitted: p.uncommitted_partition_clock,
        });
    }
    if !is_contiguous(p.epoch_partition_log.keys(), p.committed_epoch_clock) {
        return Err(InvariantViolation::NonContiguousLog {
            partition: p.partition,
            field: LogField::EpochPartitionLog,
            committed_epoch: p.committed_epoch_clock,
        });
    }
    if !is_contiguous(p.epoch_sum_participation_log.keys(), p.committed_epoch_clock) {
        return Err(InvariantViolation::NonContiguousLog {
            partition: p.partition,
            field: LogField::EpochSumParticipationLog,
            committed_epoch: p.committed_epoch_clock,
        });
    }
    Ok(())
}

/// Keys form exactly `0..=committed_epoch`.
fn is_contiguous<'a>(
    keys: impl Iterator<Item = &'a EpochClock>,
    committed_epoch: EpochClock,
) -> bool {
    let mut expected: EpochClock = 0;
    for key in keys {
        if *key != expected {
            return false;
        }
        let Some(next) = expected.checked_add(1) else {
            return false;
        };
        expected = next;
    }
    committed_epoch.checked_add(1) == Some(expected)
}

fn check_head(p: &ParticipantSnapshot) -> Result<(), InvariantViolation> {
    if let Some((epoch, sum)) = p.epoch_sum_participation_log.iter().find(|(_, sum)| **sum != 0) {
        return Err(InvariantViolation::HeadSumNonZero {
            partition: p.partition,
            epoch: *epoch,
            sum: *sum,
        });
    }
    Ok(())
}

fn check_recurrence(
    predecessor: &ParticipantSnapshot,
    p: &ParticipantSnapshot,
) -> Result<(), InvariantViolation> {
    for (epoch, actual) in &p.epoch_sum_participation_log {
        let Some(prev) = predecessor.entry(*epoch) else {
            continue;
        };
        let expected = prev.successor_sum();
        if *actual != expected {
            return Err(InvariantViolation::Recurrence {
                partition: p.partition,
                predecessor: predecessor.partition,
                epoch: *epoch,
                expected,
                actual: *actual,
            });
        }
    }
    Ok(())
}

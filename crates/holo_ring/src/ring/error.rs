use thiserror::Error;

use super::{EpochClock, LogField, PartitionClock, PartitionId};

/// Errors surfaced by ring operations.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum RingError {
    /// Operation attempted on a non-functional partition; retry elsewhere or queue.
    #[error("partition {partition} is not functional")]
    ParticipantUnavailable { partition: PartitionId },
    /// Predecessor has not published its boundary entry yet; retry with backoff.
    #[error("partition {partition} is waiting on predecessor {predecessor} for epoch {epoch}")]
    PredecessorLagging {
        partition: PartitionId,
        predecessor: PartitionId,
        epoch: EpochClock,
    },
    /// Failure injection rejected to keep a functional majority.
    #[error(
        "failing partition {partition} would leave {remaining} of {total} participants functional"
    )]
    QuorumWouldBeLost {
        partition: PartitionId,
        remaining: usize,
        total: usize,
    },
    /// Divergent histories. Never retried.
    #[error(
        "partitions {partition_a} and {partition_b} disagree on {field} of partition {observed} at epoch {epoch}: {left} != {right}"
    )]
    Disagreement {
        epoch: EpochClock,
        partition_a: PartitionId,
        partition_b: PartitionId,
        observed: PartitionId,
        field: LogField,
        left: PartitionClock,
        right: PartitionClock,
    },
    #[error("unknown partition {partition}")]
    UnknownPartition { partition: PartitionId },
    #[error(
        "partition {partition} is at epoch {actual}, boundary requested for epoch {expected}"
    )]
    EpochOutOfOrder {
        partition: PartitionId,
        expected: EpochClock,
        actual: EpochClock,
    },
    #[error("invalid ring topology: {0}")]
    InvalidTopology(String),
    #[error("corrupt ring snapshot: {0}")]
    CorruptSnapshot(#[from] InvariantViolation),
}

impl RingError {
    /// Transient conditions the caller may retry.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            RingError::ParticipantUnavailable { .. } | RingError::PredecessorLagging { .. }
        )
    }

    /// Conditions signalling that the agreement guarantee itself is broken.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            RingError::Disagreement { .. } | RingError::CorruptSnapshot(_)
        )
    }
}

/// Broken state law found by the checker.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum InvariantViolation {
    #[error(
        "partition {partition}: uncommitted clock {uncommitted} below committed clock {committed}"
    )]
    ClockOrdering {
        partition: PartitionId,
        committed: PartitionClock,
        uncommitted: PartitionClock,
    },
    #[error(
        "partition {partition}: {field} keys are not the contiguous range 0..={committed_epoch}"
    )]
    NonContiguousLog {
        partition: PartitionId,
        field: LogField,
        committed_epoch: EpochClock,
    },
    #[error("head partition {partition} has preceding sum {sum} at epoch {epoch}")]
    HeadSumNonZero {
        partition: PartitionId,
        epoch: EpochClock,
        sum: PartitionClock,
    },
    #[error(
        "partition {partition} epoch {epoch}: preceding sum {actual}, predecessor {predecessor} implies {expected}"
    )]
    Recurrence {
        partition: PartitionId,
        predecessor: PartitionId,
        epoch: EpochClock,
        expected: PartitionClock,
        actual: PartitionClock,
    },
    #[error("only {functional} of {total} participants are functional")]
    QuorumLost { functional: usize, total: usize },
    #[error("partition {partition}: published entry for epoch {epoch} does not match its log")]
    PublishedMismatch {
        partition: PartitionId,
        epoch: EpochClock,
    },
    #[error("participant set does not match ring topology")]
    MembershipMismatch,
    #[error(transparent)]
    Agreement(Box<RingError>),
}

//! Shared types for the ring clock engine.
//!
//! These types are kept in a small, dependency-light module because they are
//! used by the participant state machine, the epoch log engine, the checker
//! and the snapshot store.

use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Non-negative counter, monotonically non-decreasing within its scope.
pub type LogicalClock = u64;
/// Identifier of a ring slot.
pub type PartitionId = u64;
/// Count of single-object operations committed within one partition.
pub type PartitionClock = LogicalClock;
/// Count of transaction batches that fully acquiesced ring-wide.
pub type EpochClock = LogicalClock;

/// Own partition clock at each epoch boundary.
pub type EpochPartitionLog = BTreeMap<EpochClock, PartitionClock>;
/// Sum of all ring-preceding partition clocks at each epoch boundary.
pub type EpochSumPartitionLog = BTreeMap<EpochClock, PartitionClock>;
/// Boundary entries of a ring prefix, keyed by partition.
pub type ObservedView = BTreeMap<PartitionId, EpochEntry>;

/// Boundary record of one partition at one epoch.
///
/// Once published an entry is immutable; successors derive their own
/// `preceding_sum` from it without touching the partition's mutable state.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EpochEntry {
    pub partition_clock: PartitionClock,
    pub preceding_sum: PartitionClock,
}

impl EpochEntry {
    pub const fn zero() -> Self {
        Self {
            partition_clock: 0,
            preceding_sum: 0,
        }
    }

    /// Prefix sum seen by the ring successor of this entry's partition.
    pub fn successor_sum(&self) -> PartitionClock {
        self.preceding_sum.saturating_add(self.partition_clock)
    }
}

/// Which of the two epoch logs a disagreement was found in.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogField {
    EpochPartitionLog,
    EpochSumParticipationLog,
}

impl fmt::Display for LogField {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LogField::EpochPartitionLog => f.write_str("epoch_partition_log"),
            LogField::EpochSumParticipationLog => f.write_str("epoch_sum_participation_log"),
        }
    }
}

/// Ring configuration and operational tuning.
#[derive(Clone, Debug)]
pub struct Config {
    /// Upper bound for waiting on a lagging predecessor's boundary entry.
    ///
    /// On expiry `drive_epoch_boundary` returns `PredecessorLagging`, which
    /// callers retry with backoff.
    pub epoch_wait_timeout: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            epoch_wait_timeout: Duration::from_secs(2),
        }
    }
}

/// Minimum number of functional participants out of `total`.
pub fn quorum(total: usize) -> usize {
    (total / 2) + 1
}

/// True when `functional` participants still form a strict majority of `total`.
pub fn retains_quorum(functional: usize, total: usize) -> bool {
    functional >= quorum(total)
}

/// Position of a committed operation in its partition's history.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct OperationMeta {
    pub partition: PartitionId,
    pub partition_clock: PartitionClock,
    pub epoch: EpochClock,
}

/// Partition storage driven by committed operations.
///
/// The ring treats operations as opaque bytes; durability and replication of
/// the applied data are the sink's concern.
pub trait OperationSink: Send + Sync + 'static {
    fn apply(&self, op: &[u8], meta: OperationMeta);
}

/// Sink that discards operations; used when only clock bookkeeping matters.
#[derive(Clone, Copy, Debug, Default)]
pub struct NoopSink;

impl OperationSink for NoopSink {
    fn apply(&self, _op: &[u8], _meta: OperationMeta) {}
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct OperationAck {
    pub partition: PartitionId,
    pub committed_partition_clock: PartitionClock,
    pub epoch: EpochClock,
}

/// Result of closing one epoch at one partition.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct EpochAck {
    pub partition: PartitionId,
    /// Epoch that was closed.
    pub epoch: EpochClock,
    /// Epoch the partition is in afterwards. Unchanged for a frozen partition.
    pub committed_epoch_clock: EpochClock,
    pub entry: EpochEntry,
    /// Entry was published for a non-functional partition by the batch.
    pub on_behalf: bool,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailureAck {
    pub partition: PartitionId,
    /// False when the partition was already non-functional.
    pub changed: bool,
    pub functional: usize,
    pub total: usize,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecoveryAck {
    pub partition: PartitionId,
    pub changed: bool,
    /// Number of missed epochs replayed during catch-up.
    pub caught_up: u64,
    pub committed_epoch_clock: EpochClock,
}

/// Successful agreement check for one epoch.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Agreement {
    pub epoch: EpochClock,
    /// Participants that took part in the comparison, in ring order.
    pub compared: Vec<PartitionId>,
}

/// Multi-object transaction batch, split into per-partition slices.
#[derive(Clone, Debug, Default)]
pub struct TransactionBatch {
    ops: BTreeMap<PartitionId, Vec<Vec<u8>>>,
}

impl TransactionBatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, partition: PartitionId, op: impl Into<Vec<u8>>) -> &mut Self {
        self.ops.entry(partition).or_default().push(op.into());
        self
    }

    pub fn ops_for(&self, partition: PartitionId) -> &[Vec<u8>] {
        self.ops.get(&partition).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn len(&self) -> usize {
        self.ops.values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn partitions(&self) -> impl Iterator<Item = PartitionId> + '_ {
        self.ops.keys().copied()
    }
}

/// Outcome of one batch round trip.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchReport {
    pub epoch: EpochClock,
    pub applied: BTreeMap<PartitionId, usize>,
    /// Operations not applied because their partition was non-functional.
    pub skipped: BTreeMap<PartitionId, usize>,
    pub boundaries: Vec<EpochAck>,
}

impl BatchReport {
    pub fn fully_applied(&self) -> bool {
        self.skipped.values().all(|count| *count == 0)
    }
}

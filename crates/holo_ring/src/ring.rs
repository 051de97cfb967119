//! Ring module wiring.
//!
//! `participant` holds the per-partition state machine, `epoch_log` the
//! prefix-sum recurrence and published boundary entries, `ring_state` the
//! batch protocol plus the failure/recovery controller, and `checker` the
//! read-only invariant predicates. `store` persists ring snapshots.

mod checker;
mod epoch_log;
mod error;
mod participant;
mod ring_state;
mod store;
mod topology;
mod types;

pub use checker::{check_agreement, check_invariants, check_quorum};
pub use epoch_log::{boundary_entry, boundary_key};
pub use error::{InvariantViolation, RingError};
pub use participant::{ParticipantSnapshot, RingParticipant};
pub use ring_state::{create_ring, RingState};
pub use store::{RingSnapshot, SnapshotStore};
pub use topology::RingTopology;
pub use types::{
    quorum, retains_quorum, Agreement, BatchReport, Config, EpochAck, EpochClock, EpochEntry,
    EpochPartitionLog, EpochSumPartitionLog, FailureAck, LogField, LogicalClock, NoopSink,
    ObservedView, OperationAck, OperationMeta, OperationSink, PartitionClock, PartitionId,
    RecoveryAck, TransactionBatch,
};

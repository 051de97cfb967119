//! Shared helpers for ring integration tests.

#![allow(dead_code)]

use std::sync::{Arc, Mutex};
use std::time::Duration;

use holo_ring::ring::{
    Config, NoopSink, OperationMeta, OperationSink, PartitionId, RingState, TransactionBatch,
};

/// Boundary wait used by tests; short so lagging cases fail fast.
pub const EPOCH_WAIT: Duration = Duration::from_millis(100);

pub fn test_config() -> Config {
    Config {
        epoch_wait_timeout: EPOCH_WAIT,
    }
}

/// Ring over partitions `0..n` with a no-op sink.
pub fn ring(n: u64) -> RingState {
    ring_with_wait(n, EPOCH_WAIT)
}

pub fn ring_with_wait(n: u64, epoch_wait_timeout: Duration) -> RingState {
    let config = Config { epoch_wait_timeout };
    RingState::new(config, 0..n, Arc::new(NoopSink)).expect("valid ring")
}

/// Sink that records every applied operation.
#[derive(Default)]
pub struct RecordingSink {
    applied: Mutex<Vec<(Vec<u8>, OperationMeta)>>,
}

impl RecordingSink {
    pub fn applied(&self) -> Vec<(Vec<u8>, OperationMeta)> {
        self.applied.lock().unwrap().clone()
    }
}

impl OperationSink for RecordingSink {
    fn apply(&self, op: &[u8], meta: OperationMeta) {
        self.applied.lock().unwrap().push((op.to_vec(), meta));
    }
}

/// Batch with `ops` operations for every partition in `partitions`.
pub fn uniform_batch(partitions: &[PartitionId], ops: usize) -> TransactionBatch {
    let mut batch = TransactionBatch::new();
    for partition in partitions {
        for idx in 0..ops {
            batch.push(*partition, format!("p{partition}-op{idx}").into_bytes());
        }
    }
    batch
}

//! Epoch log engine: the prefix-sum recurrence and published boundary entries.
//!
//! Every partition publishes one `EpochEntry` per epoch boundary into an
//! append-only log that its ring successor reads. Entries are never rewritten,
//! so a successor can derive its own prefix sum from the predecessor's entry
//! without entering the predecessor's critical section.

use std::sync::{PoisonError, RwLock};
use std::time::Duration;

use tokio::sync::watch;
use tokio::time;

use super::{EpochClock, EpochEntry, LogField, PartitionClock, PartitionId, RingError};

/// Log key written when epoch `epoch` closes.
///
/// Keys hold "clock at the start of epoch k"; key 0 is the seeded zero entry.
pub fn boundary_key(epoch: EpochClock) -> EpochClock {
    epoch.saturating_add(1)
}

/// Apply the recurrence for one partition at one boundary.
///
/// `predecessor` is the prefix predecessor's entry at the same boundary, or
/// `None` for the head of the ring.
pub fn boundary_entry(
    partition_clock: PartitionClock,
    predecessor: Option<&EpochEntry>,
) -> EpochEntry {
    EpochEntry {
        partition_clock,
        preceding_sum: predecessor.map(EpochEntry::successor_sum).unwrap_or(0),
    }
}

/// Outcome of `PublishedLog::publish`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(super) enum Publish {
    Appended,
    /// An identical entry was already published for this boundary.
    AlreadyPublished,
}

/// Append-only per-partition boundary log shared with the ring successor.
#[derive(Debug)]
pub(super) struct PublishedLog {
    partition: PartitionId,
    entries: RwLock<Vec<EpochEntry>>,
    head: watch::Sender<EpochClock>,
}

impl PublishedLog {
    pub(super) fn new(partition: PartitionId) -> Self {
        Self::from_entries(partition, vec![EpochEntry::zero()])
    }

    pub(super) fn from_entries(partition: PartitionId, mut entries: Vec<EpochEntry>) -> Self {
        if entries.is_empty() {
            entries.push(EpochEntry::zero());
        }
        let head = (entries.len() - 1) as EpochClock;
        let (tx, _) = watch::channel(head);
        Self {
            partition,
            entries: RwLock::new(entries),
            head: tx,
        }
    }

    pub(super) fn get(&self, key: EpochClock) -> Option<EpochEntry> {
        let entries = self.entries.read().unwrap_or_else(PoisonError::into_inner);
        usize::try_from(key)
            .ok()
            .and_then(|idx| entries.get(idx).copied())
    }

    /// Highest boundary key published so far.
    pub(super) fn head(&self) -> EpochClock {
        *self.head.borrow()
    }

    pub(super) fn entries(&self) -> Vec<EpochEntry> {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Publish `entry` under `key`.
    ///
    /// Appending requires `key == head + 1`. Re-publishing an existing key is
    /// accepted only when the entry is identical.
    pub(super) fn publish(&self, key: EpochClock, entry: EpochEntry) -> Result<Publish, RingError> {
        let new_head = {
            let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
            let next = entries.len() as EpochClock;
            if key < next {
                let existing = entries[key as usize];
                if existing == entry {
                    return Ok(Publish::AlreadyPublished);
                }
                let (field, left, right) = if existing.partition_clock != entry.partition_clock {
                    (
                        LogField::EpochPartitionLog,
                        existing.partition_clock,
                        entry.partition_clock,
                    )
                } else {
                    (
                        LogField::EpochSumParticipationLog,
                        existing.preceding_sum,
                        entry.preceding_sum,
                    )
                };
                return Err(RingError::Disagreement {
                    epoch: key,
                    partition_a: self.partition,
                    partition_b: self.partition,
                    observed: self.partition,
                    field,
                    left,
                    right,
                });
            }
            if key != next {
                return Err(RingError::EpochOutOfOrder {
                    partition: self.partition,
                    expected: key.saturating_sub(1),
                    actual: next.saturating_sub(1),
                });
            }
            entries.push(entry);
            key
        };
        self.head.send_replace(new_head);
        Ok(Publish::Appended)
    }

    /// Wait up to `timeout` for the entry under `key` to be published.
    pub(super) async fn wait_for(&self, key: EpochClock, timeout: Duration) -> Option<EpochEntry> {
        if let Some(entry) = self.get(key) {
            return Some(entry);
        }
        let mut rx = self.head.subscribe();
        // `wait_for` checks the current value first, so a publish between the
        // `get` above and `subscribe` is not missed.
        let _ = time::timeout(timeout, rx.wait_for(|head| *head >= key)).await;
        self.get(key)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;

    fn entry(partition_clock: PartitionClock, preceding_sum: PartitionClock) -> EpochEntry {
        EpochEntry {
            partition_clock,
            preceding_sum,
        }
    }

    #[test]
    fn recurrence_sums_predecessor_prefix() {
        let head = boundary_entry(2, None);
        assert_eq!(head, entry(2, 0));
        let second = boundary_entry(5, Some(&head));
        assert_eq!(second.preceding_sum, 2);
        let third = boundary_entry(1, Some(&second));
        assert_eq!(third.preceding_sum, 7);
        assert_eq!(boundary_key(0), 1);
    }

    #[test]
    fn publish_appends_in_order_and_rejects_gaps() {
        let log = PublishedLog::new(3);
        assert_eq!(log.head(), 0);
        let published = entry(4, 1);
        assert_eq!(log.publish(1, published), Ok(Publish::Appended));
        assert_eq!(log.head(), 1);
        assert_eq!(log.get(1), Some(published));

        let err = log.publish(3, published).expect_err("gap must be rejected");
        assert!(matches!(err, RingError::EpochOutOfOrder { partition: 3, .. }));
    }

    #[test]
    fn republish_must_match_existing_entry() {
        let log = PublishedLog::new(1);
        let published = entry(4, 1);
        log.publish(1, published).unwrap();
        assert_eq!(log.publish(1, published), Ok(Publish::AlreadyPublished));

        let changed = entry(4, 2);
        match log.publish(1, changed) {
            Err(RingError::Disagreement { field, left, right, .. }) => {
                assert_eq!(field, LogField::EpochSumParticipationLog);
                assert_eq!((left, right), (1, 2));
            }
            other => panic!("unexpected publish result: {other:?}"),
        }
    }

    #[tokio::test]
    async fn wait_for_wakes_on_publish() {
        let log = Arc::new(PublishedLog::new(0));
        let waiter = {
            let log = log.clone();
            tokio::spawn(async move { log.wait_for(1, Duration::from_secs(5)).await })
        };
        tokio::task::yield_now().await;
        let published = entry(9, 0);
        log.publish(1, published).unwrap();
        assert_eq!(waiter.await.unwrap(), Some(published));
    }

    #[tokio::test]
    async fn wait_for_times_out_without_publish() {
        let log = PublishedLog::new(0);
        assert_eq!(log.wait_for(1, Duration::from_millis(20)).await, None);
    }
}

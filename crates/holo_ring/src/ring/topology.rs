//! Ring order of partitions.
//!
//! Routing wraps around (the tail's successor is the head), while the
//! prefix-sum recurrence does not: the head has no prefix predecessor.

use std::collections::HashMap;

use super::{PartitionId, RingError};

#[derive(Clone, Debug)]
pub struct RingTopology {
    partitions: Vec<PartitionId>,
    index: HashMap<PartitionId, usize>,
}

impl RingTopology {
    /// Build a ring from partition ids in ring order.
    pub fn new(partitions: impl IntoIterator<Item = PartitionId>) -> Result<Self, RingError> {
        let partitions = partitions.into_iter().collect::<Vec<_>>();
        if partitions.is_empty() {
            return Err(RingError::InvalidTopology(
                "ring needs at least one partition".to_string(),
            ));
        }
        let mut index = HashMap::with_capacity(partitions.len());
        for (pos, partition) in partitions.iter().enumerate() {
            if index.insert(*partition, pos).is_some() {
                return Err(RingError::InvalidTopology(format!(
                    "partition {partition} listed more than once"
                )));
            }
        }
        Ok(Self { partitions, index })
    }

    pub fn len(&self) -> usize {
        self.partitions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.partitions.is_empty()
    }

    pub fn partitions(&self) -> &[PartitionId] {
        &self.partitions
    }

    pub fn head(&self) -> PartitionId {
        self.partitions[0]
    }

    pub fn contains(&self, partition: PartitionId) -> bool {
        self.index.contains_key(&partition)
    }

    pub fn position(&self, partition: PartitionId) -> Result<usize, RingError> {
        self.index
            .get(&partition)
            .copied()
            .ok_or(RingError::UnknownPartition { partition })
    }

    pub fn is_head(&self, partition: PartitionId) -> bool {
        self.index.get(&partition) == Some(&0)
    }

    /// Next partition a batch visits after `partition`.
    pub fn successor(&self, partition: PartitionId) -> Result<PartitionId, RingError> {
        let pos = self.position(partition)?;
        Ok(self.partitions[(pos + 1) % self.partitions.len()])
    }

    /// Partition a batch visited before `partition`.
    pub fn predecessor(&self, partition: PartitionId) -> Result<PartitionId, RingError> {
        let pos = self.position(partition)?;
        let len = self.partitions.len();
        Ok(self.partitions[(pos + len - 1) % len])
    }

    /// Predecessor used by the sum-log recurrence; `None` for the head.
    pub fn prefix_predecessor(
        &self,
        partition: PartitionId,
    ) -> Result<Option<PartitionId>, RingError> {
        let pos = self.position(partition)?;
        Ok(pos.checked_sub(1).map(|prev| self.partitions[prev]))
    }

    /// Ring prefix from the head through `partition`, inclusive.
    pub fn prefix_through(&self, partition: PartitionId) -> Result<&[PartitionId], RingError> {
        let pos = self.position(partition)?;
        Ok(&self.partitions[..=pos])
    }
}

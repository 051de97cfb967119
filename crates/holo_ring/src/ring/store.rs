//! Ring snapshots and their JSON file store.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::Context;
use serde::{Deserialize, Serialize};

use super::checker::check_invariants;
use super::participant::ParticipantSnapshot;
use super::{EpochEntry, InvariantViolation, PartitionId, RingError, RingTopology};

/// Full ring state: participants in ring order plus published boundary logs.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RingSnapshot {
    pub partitions: Vec<PartitionId>,
    pub participants: Vec<ParticipantSnapshot>,
    /// Published boundary entries per partition, indexed by epoch key.
    pub published: BTreeMap<PartitionId, Vec<EpochEntry>>,
}

impl RingSnapshot {
    /// Check every state law and the published logs against the participants.
    pub fn validate(&self) -> Result<RingTopology, RingError> {
        let topology = RingTopology::new(self.partitions.iter().copied())?;
        check_invariants(&topology, &self.participants)?;

        let mut prev_log: Option<&Vec<EpochEntry>> = None;
        for participant in &self.participants {
            let partition = participant.partition;
            let mismatch = |epoch| InvariantViolation::PublishedMismatch { partition, epoch };
            let log = self.published.get(&partition).ok_or(mismatch(0))?;
            if log.first() != Some(&EpochEntry::zero()) {
                return Err(mismatch(0).into());
            }

            let head = (log.len() - 1) as u64;
            let committed = participant.committed_epoch_clock;
            if head < committed || (participant.functional && head != committed) {
                return Err(mismatch(committed).into());
            }
            for epoch in 0..=committed {
                if participant.entry(epoch) != log.get(epoch as usize).copied() {
                    return Err(mismatch(epoch).into());
                }
            }
            // Entries published on behalf of a down partition carry its frozen clock.
            for (epoch, entry) in log.iter().enumerate().skip(committed as usize + 1) {
                if entry.partition_clock != participant.committed_partition_clock {
                    return Err(mismatch(epoch as u64).into());
                }
            }

            // A partition never publishes a boundary before its predecessor,
            // and every published sum follows the recurrence.
            match prev_log {
                None => {
                    if let Some(epoch) = log.iter().position(|e| e.preceding_sum != 0) {
                        return Err(mismatch(epoch as u64).into());
                    }
                }
                Some(prev) => {
                    if log.len() > prev.len() {
                        return Err(mismatch(prev.len() as u64).into());
                    }
                    for (epoch, (entry, prev_entry)) in log.iter().zip(prev.iter()).enumerate() {
                        if entry.preceding_sum != prev_entry.successor_sum() {
                            return Err(mismatch(epoch as u64).into());
                        }
                    }
                }
            }
            prev_log = Some(log);
        }
        Ok(topology)
    }
}

/// JSON file holding the latest ring snapshot.
#[derive(Clone, Debug)]
pub struct SnapshotStore {
    path: PathBuf,
}

impl SnapshotStore {
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Write `snapshot`, replacing any previous one atomically.
    pub fn save(&self, snapshot: &RingSnapshot) -> anyhow::Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).context("create ring snapshot dir")?;
        }
        let data = serde_json::to_vec_pretty(snapshot).context("serialize ring snapshot")?;
        let tmp = self.path.with_extension("json.tmp");
        fs::write(&tmp, data).context("write ring snapshot")?;
        fs::rename(&tmp, &self.path).context("install ring snapshot")?;
        Ok(())
    }

    /// Load the stored snapshot, or `None` when nothing was saved yet.
    pub fn load(&self) -> anyhow::Result<Option<RingSnapshot>> {
        let data = match fs::read(&self.path) {
            Ok(data) => data,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(err) => {
                return Err(err).with_context(|| format!("read {}", self.path.display()))
            }
        };
        let snapshot = serde_json::from_slice(&data)
            .with_context(|| format!("decode ring snapshot {}", self.path.display()))?;
        Ok(Some(snapshot))
    }
}

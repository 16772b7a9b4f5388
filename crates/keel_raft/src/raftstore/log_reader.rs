//! Raft storage adapter over the log store.
//!
//! `LogReader` gives the consensus module its view of the persisted log. The
//! base position is anchored at the latest snapshot record, including dummy
//! snapshots written by log compaction, which exist precisely so this marker
//! survives restarts after entries have been pruned.

use std::sync::{Arc, RwLock};

use raft::eraftpb::{ConfState, Entry, HardState, Snapshot, SnapshotMetadata};
use raft::{GetEntriesContext, RaftState, Storage, StorageError};

use super::meta::{ReplicaId, ShardDesc, ShardId};
use super::storage::LogStore;

struct LogReaderCore {
    shard_id: ShardId,
    replica_id: ReplicaId,
    logdb: Arc<dyn LogStore>,
    /// Position of the latest snapshot record: entries at or below
    /// `marker_index` are invisible to raft.
    marker_index: u64,
    marker_term: u64,
    last_index: u64,
    hard_state: HardState,
    conf_state: ConfState,
}

/// Cloneable handle; the consensus module and the replica share one view.
#[derive(Clone)]
pub struct LogReader {
    core: Arc<RwLock<LogReaderCore>>,
}

impl LogReader {
    /// Load the persisted raft state for `(shard, replica)` and establish the
    /// base position from the latest snapshot record, if any.
    pub fn new(
        shard: &ShardDesc,
        replica_id: ReplicaId,
        logdb: Arc<dyn LogStore>,
    ) -> anyhow::Result<Self> {
        let mut core = LogReaderCore {
            shard_id: shard.id,
            replica_id,
            logdb,
            marker_index: 0,
            marker_term: 0,
            last_index: 0,
            hard_state: HardState::default(),
            conf_state: shard.conf_state(),
        };
        if let Some(snapshot) = core.logdb.get_snapshot(shard.id)? {
            let meta = snapshot.get_metadata();
            core.marker_index = meta.get_index();
            core.marker_term = meta.get_term();
            core.last_index = meta.get_index();
            if !meta.get_conf_state().get_voters().is_empty() {
                core.conf_state = meta.get_conf_state().clone();
            }
        }
        if let Some(state) = core.logdb.read_raft_state(shard.id, replica_id)? {
            core.hard_state = state.hard_state;
            if state.last_entry_index > core.last_index {
                core.last_index = state.last_entry_index;
            }
        }
        Ok(Self {
            core: Arc::new(RwLock::new(core)),
        })
    }

    pub fn first_index_value(&self) -> u64 {
        self.core.read().unwrap().marker_index + 1
    }

    pub fn last_index_value(&self) -> u64 {
        self.core.read().unwrap().last_index
    }

    /// Record entries the event loop just persisted.
    pub fn append(&self, entries: &[Entry]) {
        if let Some(last) = entries.last() {
            let mut core = self.core.write().unwrap();
            core.last_index = last.get_index();
        }
    }

    pub fn set_hard_state(&self, hs: HardState) {
        self.core.write().unwrap().hard_state = hs;
    }

    /// Fold the advanced commit index into the cached hard state and return
    /// the updated copy for persistence.
    pub fn commit_to(&self, index: u64) -> HardState {
        let mut core = self.core.write().unwrap();
        core.hard_state.set_commit(index);
        core.hard_state.clone()
    }

    pub fn set_conf_state(&self, cs: ConfState) {
        self.core.write().unwrap().conf_state = cs;
    }

    /// Advance the base position so entries up to and including `index`
    /// become invisible to the consensus module.
    pub fn compact_to(&self, index: u64) -> raft::Result<()> {
        let term = self.term(index)?;
        let mut core = self.core.write().unwrap();
        if index <= core.marker_index {
            return Err(raft::Error::Store(StorageError::Compacted));
        }
        core.marker_index = index;
        core.marker_term = term;
        Ok(())
    }

    /// Move the base position onto an applied snapshot.
    pub fn apply_snapshot_meta(&self, meta: &SnapshotMetadata) {
        let mut core = self.core.write().unwrap();
        core.marker_index = meta.get_index();
        core.marker_term = meta.get_term();
        if core.last_index < meta.get_index() {
            core.last_index = meta.get_index();
        }
        if !meta.get_conf_state().get_voters().is_empty() {
            core.conf_state = meta.get_conf_state().clone();
        }
    }
}

impl Storage for LogReader {
    fn initial_state(&self) -> raft::Result<RaftState> {
        let core = self.core.read().unwrap();
        Ok(RaftState {
            hard_state: core.hard_state.clone(),
            conf_state: core.conf_state.clone(),
        })
    }

    fn entries(
        &self,
        low: u64,
        high: u64,
        max_size: impl Into<Option<u64>>,
        _context: GetEntriesContext,
    ) -> raft::Result<Vec<Entry>> {
        let core = self.core.read().unwrap();
        if low <= core.marker_index {
            return Err(raft::Error::Store(StorageError::Compacted));
        }
        if high > core.last_index + 1 {
            return Err(raft::Error::Store(StorageError::Unavailable));
        }
        let max_size = max_size.into().unwrap_or(u64::MAX);
        let entries = core
            .logdb
            .entries(core.shard_id, core.replica_id, low, high, max_size)
            .map_err(|err| raft::Error::Store(StorageError::Other(err.into())))?;
        if entries.first().map(|e| e.get_index()) != Some(low) {
            return Err(raft::Error::Store(StorageError::Unavailable));
        }
        Ok(entries)
    }

    fn term(&self, idx: u64) -> raft::Result<u64> {
        let core = self.core.read().unwrap();
        if idx == core.marker_index {
            return Ok(core.marker_term);
        }
        if idx < core.marker_index {
            return Err(raft::Error::Store(StorageError::Compacted));
        }
        if idx > core.last_index {
            return Err(raft::Error::Store(StorageError::Unavailable));
        }
        let term = core
            .logdb
            .term(core.shard_id, core.replica_id, idx)
            .map_err(|err| raft::Error::Store(StorageError::Other(err.into())))?;
        term.ok_or(raft::Error::Store(StorageError::Unavailable))
    }

    fn first_index(&self) -> raft::Result<u64> {
        Ok(self.core.read().unwrap().marker_index + 1)
    }

    fn last_index(&self) -> raft::Result<u64> {
        Ok(self.core.read().unwrap().last_index)
    }

    fn snapshot(&self, request_index: u64, _to: u64) -> raft::Result<Snapshot> {
        let core = self.core.read().unwrap();
        let snapshot = core
            .logdb
            .get_snapshot(core.shard_id)
            .map_err(|err| raft::Error::Store(StorageError::Other(err.into())))?;
        match snapshot {
            Some(ss) if ss.get_metadata().get_index() >= request_index => {
                let info = super::meta::SnapshotInfo::decode(ss.get_data())
                    .map_err(|err| raft::Error::Store(StorageError::Other(err.into())))?;
                if info.dummy {
                    // Compaction markers cannot seed a follower.
                    return Err(raft::Error::Store(
                        StorageError::SnapshotTemporarilyUnavailable,
                    ));
                }
                Ok(ss)
            }
            _ => Err(raft::Error::Store(
                StorageError::SnapshotTemporarilyUnavailable,
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::raftstore::meta::{ReplicaDesc, SnapshotInfo};
    use crate::raftstore::storage::{MemLogStore, SavedRaftState};

    fn entry(index: u64, term: u64) -> Entry {
        let mut e = Entry::default();
        e.set_index(index);
        e.set_term(term);
        e
    }

    fn dummy_snapshot(index: u64, term: u64) -> Snapshot {
        let mut ss = Snapshot::default();
        ss.mut_metadata().set_index(index);
        ss.mut_metadata().set_term(term);
        ss.set_data(SnapshotInfo::dummy().encode().into());
        ss
    }

    fn test_shard() -> ShardDesc {
        ShardDesc {
            id: 1,
            replicas: vec![ReplicaDesc::new(1, 1)],
            ..Default::default()
        }
    }

    #[test]
    fn empty_store_starts_at_one() {
        let logdb: Arc<dyn LogStore> = Arc::new(MemLogStore::new());
        let lr = LogReader::new(&test_shard(), 1, logdb).unwrap();
        assert_eq!(lr.first_index().unwrap(), 1);
        assert_eq!(lr.last_index().unwrap(), 0);
        let state = lr.initial_state().unwrap();
        assert_eq!(state.conf_state.get_voters(), &[1]);
    }

    #[test]
    fn dummy_snapshot_record_anchors_base_position() {
        let store = MemLogStore::new();
        let mut wc = store.new_worker_context();
        store
            .save_raft_state(
                1,
                1,
                SavedRaftState {
                    entries: (1..=10).map(|i| entry(i, 3)).collect(),
                    snapshot: Some(dummy_snapshot(6, 3)),
                    ..Default::default()
                },
                &mut wc,
            )
            .unwrap();
        store.remove_entries_to(1, 1, 6).unwrap();

        let logdb: Arc<dyn LogStore> = Arc::new(store);
        let lr = LogReader::new(&test_shard(), 1, logdb).unwrap();
        assert_eq!(lr.first_index().unwrap(), 7);
        assert_eq!(lr.last_index().unwrap(), 10);
        assert_eq!(lr.term(6).unwrap(), 3);
        assert!(matches!(
            lr.term(5),
            Err(raft::Error::Store(StorageError::Compacted))
        ));
        // A dummy record never serves as a follower snapshot.
        assert!(matches!(
            lr.snapshot(1, 2),
            Err(raft::Error::Store(
                StorageError::SnapshotTemporarilyUnavailable
            ))
        ));
    }

    #[test]
    fn compact_to_hides_pruned_entries() {
        let store = MemLogStore::new();
        let mut wc = store.new_worker_context();
        store
            .save_raft_state(
                1,
                1,
                SavedRaftState {
                    entries: (1..=5).map(|i| entry(i, 1)).collect(),
                    ..Default::default()
                },
                &mut wc,
            )
            .unwrap();
        let logdb: Arc<dyn LogStore> = Arc::new(store);
        let lr = LogReader::new(&test_shard(), 1, logdb).unwrap();
        lr.compact_to(3).unwrap();
        assert_eq!(lr.first_index().unwrap(), 4);
        assert!(matches!(
            lr.entries(3, 5, None, GetEntriesContext::empty(false)),
            Err(raft::Error::Store(StorageError::Compacted))
        ));
        let tail = lr.entries(4, 6, None, GetEntriesContext::empty(false)).unwrap();
        assert_eq!(tail.len(), 2);
        assert!(matches!(
            lr.compact_to(3),
            Err(raft::Error::Store(StorageError::Compacted))
        ));
    }
}

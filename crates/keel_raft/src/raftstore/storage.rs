//! Log and data store trait seams, plus in-memory implementations.
//!
//! The replica engine never talks to disk directly: raft state goes through
//! `LogStore` and user data plus shard metadata go through `DataStore`. Both
//! stores are shared across all shards in the host process and must provide
//! per-shard atomicity for batched writes. The in-memory stores here back the
//! test suites and embedded hosts; keel_store provides the fjall-backed
//! implementations behind the same traits.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};

use anyhow::Context;
use raft::eraftpb::{Entry, HardState, Snapshot};

use super::meta::{ReplicaId, ShardDesc, ShardId, ShardLocalState, SnapshotInfo};
use super::rpc::{CmdType, Request};

/// Reusable scratch space handed to `LogStore::save_raft_state` so hot-path
/// saves can reuse encode buffers across iterations.
#[derive(Default)]
pub struct WorkerContext {
    pub buf: Vec<u8>,
}

/// One atomic unit of raft persistence: whatever the consensus module asked
/// to be made durable in a single Ready.
#[derive(Debug, Default)]
pub struct SavedRaftState {
    pub hard_state: Option<HardState>,
    pub entries: Vec<Entry>,
    pub snapshot: Option<Snapshot>,
}

impl SavedRaftState {
    pub fn is_empty(&self) -> bool {
        self.hard_state.is_none() && self.entries.is_empty() && self.snapshot.is_none()
    }
}

/// Persisted raft state as read back on startup.
#[derive(Debug, Clone, Default)]
pub struct RaftLocalState {
    pub hard_state: HardState,
    /// Bounds of the persisted entries, `(0, 0)` when none exist.
    pub first_entry_index: u64,
    pub last_entry_index: u64,
}

/// Persists and retrieves raft entries, hard state and snapshot records,
/// keyed per `(shard, replica)`.
pub trait LogStore: Send + Sync + 'static {
    fn new_worker_context(&self) -> WorkerContext {
        WorkerContext::default()
    }

    /// Persist hard state, entries and/or a snapshot record atomically.
    fn save_raft_state(
        &self,
        shard_id: ShardId,
        replica_id: ReplicaId,
        state: SavedRaftState,
        wc: &mut WorkerContext,
    ) -> anyhow::Result<()>;

    fn read_raft_state(
        &self,
        shard_id: ShardId,
        replica_id: ReplicaId,
    ) -> anyhow::Result<Option<RaftLocalState>>;

    /// The most recent snapshot record for the shard, dummy or not.
    fn get_snapshot(&self, shard_id: ShardId) -> anyhow::Result<Option<Snapshot>>;

    /// Drop the on-disk snapshot image while retaining the snapshot record;
    /// the record anchors the log reader's base position after restart.
    fn remove_snapshot_image(
        &self,
        shard_id: ShardId,
        replica_id: ReplicaId,
        index: u64,
    ) -> anyhow::Result<()>;

    /// Remove entries up to and including `index`.
    fn remove_entries_to(
        &self,
        shard_id: ShardId,
        replica_id: ReplicaId,
        index: u64,
    ) -> anyhow::Result<()>;

    /// Contiguous entries in `[low, high)`, bounded by `max_size` bytes of
    /// entry payload (the first entry is always returned).
    fn entries(
        &self,
        shard_id: ShardId,
        replica_id: ReplicaId,
        low: u64,
        high: u64,
        max_size: u64,
    ) -> anyhow::Result<Vec<Entry>>;

    fn term(
        &self,
        shard_id: ShardId,
        replica_id: ReplicaId,
        index: u64,
    ) -> anyhow::Result<Option<u64>>;
}

/// Record handed to `DataStore::save_shard_metadata`. The store must persist
/// `(log_index, state)` atomically per record: after a crash either both are
/// visible or neither is.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ShardMetadata {
    pub shard_id: ShardId,
    pub log_index: u64,
    pub state: ShardLocalState,
}

/// Per-entry write scratch: the current shard, the decoded requests and the
/// accumulated responses and byte deltas. Lifetime is one applied entry.
#[derive(Debug, Default)]
pub struct WriteContext {
    pub shard: ShardDesc,
    pub log_index: u64,
    pub requests: Vec<Request>,
    pub responses: Vec<Vec<u8>>,
    pub written_bytes: u64,
    pub diff_bytes: i64,
}

impl WriteContext {
    pub fn reset(&mut self, shard: ShardDesc, log_index: u64) {
        self.shard = shard;
        self.log_index = log_index;
        self.requests.clear();
        self.responses.clear();
        self.written_bytes = 0;
        self.diff_bytes = 0;
    }

    pub fn append_request(&mut self, req: Request) {
        self.requests.push(req);
    }
}

/// Outcome of a split-key scan over a shard's range.
#[derive(Clone, Debug, Default)]
pub struct SplitCheckResult {
    pub size: u64,
    pub keys: u64,
    pub split_keys: Vec<Vec<u8>>,
}

/// Applies user writes and stores shard metadata atomically with the apply
/// log index.
pub trait DataStore: Send + Sync + 'static {
    /// Execute a write batch. The apply index in the context must become
    /// durable together with the writes.
    fn write(&self, ctx: &mut WriteContext) -> anyhow::Result<()>;

    fn save_shard_metadata(&self, records: Vec<ShardMetadata>) -> anyhow::Result<()>;

    /// Highest log index whose effects are durable for the shard.
    fn persistent_log_index(&self, shard_id: ShardId) -> anyhow::Result<u64>;

    fn shard_local_state(&self, shard_id: ShardId) -> anyhow::Result<Option<ShardLocalState>>;

    /// Replace the shard's state with the snapshot contents. Dummy snapshots
    /// must be rejected by implementations.
    fn apply_snapshot(&self, shard_id: ShardId, snapshot: &Snapshot) -> anyhow::Result<()>;

    /// Scan the shard's range and propose split keys so each resulting range
    /// holds roughly `target_size` bytes.
    fn split_check(&self, shard: &ShardDesc, target_size: u64) -> anyhow::Result<SplitCheckResult>;
}

#[derive(Default)]
struct MemLogShard {
    replica_id: ReplicaId,
    hard_state: HardState,
    entries: BTreeMap<u64, Entry>,
    snapshot: Option<Snapshot>,
    has_image: bool,
}

/// In-memory `LogStore`, shared across shards like its on-disk counterpart.
#[derive(Clone, Default)]
pub struct MemLogStore {
    shards: Arc<Mutex<HashMap<ShardId, MemLogShard>>>,
}

impl MemLogStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of persisted entries for a shard, for assertions in tests.
    pub fn entry_count(&self, shard_id: ShardId) -> usize {
        let shards = self.shards.lock().unwrap();
        shards.get(&shard_id).map_or(0, |s| s.entries.len())
    }
}

impl LogStore for MemLogStore {
    fn save_raft_state(
        &self,
        shard_id: ShardId,
        replica_id: ReplicaId,
        state: SavedRaftState,
        _wc: &mut WorkerContext,
    ) -> anyhow::Result<()> {
        let mut shards = self.shards.lock().unwrap();
        let shard = shards.entry(shard_id).or_default();
        shard.replica_id = replica_id;
        if let Some(hs) = state.hard_state {
            shard.hard_state = hs;
        }
        for entry in state.entries {
            let index = entry.get_index();
            // A new leader may overwrite a divergent suffix.
            shard.entries.split_off(&index);
            shard.entries.insert(index, entry);
        }
        if let Some(snapshot) = state.snapshot {
            let info = SnapshotInfo::decode(snapshot.get_data())
                .context("decode snapshot info on save")?;
            shard.has_image = !info.dummy;
            shard.snapshot = Some(snapshot);
        }
        Ok(())
    }

    fn read_raft_state(
        &self,
        shard_id: ShardId,
        _replica_id: ReplicaId,
    ) -> anyhow::Result<Option<RaftLocalState>> {
        let shards = self.shards.lock().unwrap();
        let Some(shard) = shards.get(&shard_id) else {
            return Ok(None);
        };
        let first = shard.entries.keys().next().copied().unwrap_or(0);
        let last = shard.entries.keys().next_back().copied().unwrap_or(0);
        Ok(Some(RaftLocalState {
            hard_state: shard.hard_state.clone(),
            first_entry_index: first,
            last_entry_index: last,
        }))
    }

    fn get_snapshot(&self, shard_id: ShardId) -> anyhow::Result<Option<Snapshot>> {
        let shards = self.shards.lock().unwrap();
        Ok(shards.get(&shard_id).and_then(|s| s.snapshot.clone()))
    }

    fn remove_snapshot_image(
        &self,
        shard_id: ShardId,
        _replica_id: ReplicaId,
        index: u64,
    ) -> anyhow::Result<()> {
        let mut shards = self.shards.lock().unwrap();
        if let Some(shard) = shards.get_mut(&shard_id) {
            let matches = shard
                .snapshot
                .as_ref()
                .is_some_and(|s| s.get_metadata().get_index() == index);
            if matches {
                shard.has_image = false;
            }
        }
        Ok(())
    }

    fn remove_entries_to(
        &self,
        shard_id: ShardId,
        _replica_id: ReplicaId,
        index: u64,
    ) -> anyhow::Result<()> {
        let mut shards = self.shards.lock().unwrap();
        if let Some(shard) = shards.get_mut(&shard_id) {
            shard.entries = shard.entries.split_off(&(index + 1));
        }
        Ok(())
    }

    fn entries(
        &self,
        shard_id: ShardId,
        _replica_id: ReplicaId,
        low: u64,
        high: u64,
        max_size: u64,
    ) -> anyhow::Result<Vec<Entry>> {
        let shards = self.shards.lock().unwrap();
        let Some(shard) = shards.get(&shard_id) else {
            return Ok(Vec::new());
        };
        let mut out = Vec::new();
        let mut size = 0u64;
        let mut expected = low;
        for (idx, entry) in shard.entries.range(low..high) {
            if *idx != expected {
                break;
            }
            expected += 1;
            size = size.saturating_add(entry.get_data().len() as u64);
            if !out.is_empty() && size > max_size {
                break;
            }
            out.push(entry.clone());
        }
        Ok(out)
    }

    fn term(
        &self,
        shard_id: ShardId,
        _replica_id: ReplicaId,
        index: u64,
    ) -> anyhow::Result<Option<u64>> {
        let shards = self.shards.lock().unwrap();
        Ok(shards
            .get(&shard_id)
            .and_then(|s| s.entries.get(&index))
            .map(|e| e.get_term()))
    }
}

#[derive(Default)]
struct MemDataInner {
    data: BTreeMap<Vec<u8>, Vec<u8>>,
    metadata: HashMap<ShardId, (u64, ShardLocalState)>,
    applied: HashMap<ShardId, u64>,
}

/// In-memory `DataStore`. All shards share one lexicographic key space, as
/// they do in the on-disk engine; the shard range decides ownership.
#[derive(Clone, Default)]
pub struct MemDataStore {
    inner: Arc<Mutex<MemDataInner>>,
}

impl MemDataStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &[u8]) -> Option<Vec<u8>> {
        let inner = self.inner.lock().unwrap();
        inner.data.get(key).cloned()
    }
}

impl DataStore for MemDataStore {
    fn write(&self, ctx: &mut WriteContext) -> anyhow::Result<()> {
        let mut inner = self.inner.lock().unwrap();
        for req in &ctx.requests {
            match req.cmd_type {
                CmdType::Write => {
                    let new_len = (req.key.len() + req.cmd.len()) as i64;
                    let old = inner.data.insert(req.key.clone(), req.cmd.clone());
                    let old_len = old.map_or(0, |v| (req.key.len() + v.len()) as i64);
                    ctx.written_bytes = ctx.written_bytes.saturating_add(new_len as u64);
                    ctx.diff_bytes += new_len - old_len;
                    ctx.responses.push(b"ok".to_vec());
                }
                CmdType::Read => {
                    anyhow::bail!("read request in a replicated write batch");
                }
            }
        }
        inner.applied.insert(ctx.shard.id, ctx.log_index);
        Ok(())
    }

    fn save_shard_metadata(&self, records: Vec<ShardMetadata>) -> anyhow::Result<()> {
        let mut inner = self.inner.lock().unwrap();
        for record in records {
            inner
                .applied
                .insert(record.shard_id, record.log_index);
            inner
                .metadata
                .insert(record.shard_id, (record.log_index, record.state));
        }
        Ok(())
    }

    fn persistent_log_index(&self, shard_id: ShardId) -> anyhow::Result<u64> {
        let inner = self.inner.lock().unwrap();
        Ok(inner.applied.get(&shard_id).copied().unwrap_or(0))
    }

    fn shard_local_state(&self, shard_id: ShardId) -> anyhow::Result<Option<ShardLocalState>> {
        let inner = self.inner.lock().unwrap();
        Ok(inner.metadata.get(&shard_id).map(|(_, s)| s.clone()))
    }

    fn apply_snapshot(&self, shard_id: ShardId, snapshot: &Snapshot) -> anyhow::Result<()> {
        let info = SnapshotInfo::decode(snapshot.get_data())?;
        anyhow::ensure!(!info.dummy, "dummy snapshot must never be applied");
        let state = info
            .shard
            .context("snapshot carries no shard state")?;
        let index = snapshot.get_metadata().get_index();
        let mut inner = self.inner.lock().unwrap();
        inner.applied.insert(shard_id, index);
        inner.metadata.insert(shard_id, (index, state));
        Ok(())
    }

    fn split_check(&self, shard: &ShardDesc, target_size: u64) -> anyhow::Result<SplitCheckResult> {
        let inner = self.inner.lock().unwrap();
        let mut res = SplitCheckResult::default();
        let mut acc = 0u64;
        let target = target_size.max(1);
        for (key, value) in inner.data.range(shard.start.clone()..) {
            if !shard.contains_key(key) {
                break;
            }
            let len = (key.len() + value.len()) as u64;
            res.size += len;
            res.keys += 1;
            // Never propose the first key; a split key equal to the shard
            // start would produce an empty left range.
            if acc >= target && key.as_slice() > shard.start.as_slice() {
                res.split_keys.push(key.clone());
                acc = 0;
            }
            acc += len;
        }
        Ok(res)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::raftstore::meta::ReplicaDesc;

    fn entry(index: u64, term: u64) -> Entry {
        let mut e = Entry::default();
        e.set_index(index);
        e.set_term(term);
        e
    }

    #[test]
    fn mem_log_store_truncates_divergent_suffix() {
        let store = MemLogStore::new();
        let mut wc = store.new_worker_context();
        store
            .save_raft_state(
                1,
                1,
                SavedRaftState {
                    entries: vec![entry(1, 1), entry(2, 1), entry(3, 1)],
                    ..Default::default()
                },
                &mut wc,
            )
            .unwrap();
        // A conflicting append at index 2 must drop the old index 3.
        store
            .save_raft_state(
                1,
                1,
                SavedRaftState {
                    entries: vec![entry(2, 2)],
                    ..Default::default()
                },
                &mut wc,
            )
            .unwrap();
        let state = store.read_raft_state(1, 1).unwrap().unwrap();
        assert_eq!(state.last_entry_index, 2);
        assert_eq!(store.term(1, 1, 2).unwrap(), Some(2));
    }

    #[test]
    fn mem_log_store_prunes_entries() {
        let store = MemLogStore::new();
        let mut wc = store.new_worker_context();
        let entries = (1..=10).map(|i| entry(i, 1)).collect();
        store
            .save_raft_state(
                1,
                1,
                SavedRaftState {
                    entries,
                    ..Default::default()
                },
                &mut wc,
            )
            .unwrap();
        store.remove_entries_to(1, 1, 6).unwrap();
        let state = store.read_raft_state(1, 1).unwrap().unwrap();
        assert_eq!(state.first_entry_index, 7);
        assert_eq!(state.last_entry_index, 10);
        assert!(store.entries(1, 1, 7, 11, u64::MAX).unwrap().len() == 4);
    }

    #[test]
    fn mem_data_store_tracks_apply_index_with_writes() {
        let store = MemDataStore::new();
        let shard = ShardDesc {
            id: 7,
            replicas: vec![ReplicaDesc::new(1, 1)],
            ..Default::default()
        };
        let mut ctx = WriteContext::default();
        ctx.reset(shard, 42);
        ctx.append_request(Request {
            id: 1,
            cmd_type: CmdType::Write,
            key: b"k".to_vec(),
            cmd: b"value".to_vec(),
        });
        store.write(&mut ctx).unwrap();
        assert_eq!(ctx.responses.len(), 1);
        assert_eq!(ctx.written_bytes, 6);
        assert_eq!(ctx.diff_bytes, 6);
        assert_eq!(store.persistent_log_index(7).unwrap(), 42);

        // Overwriting with a shorter value yields a negative diff.
        let shard = ctx.shard.clone();
        ctx.reset(shard, 43);
        ctx.append_request(Request {
            id: 2,
            cmd_type: CmdType::Write,
            key: b"k".to_vec(),
            cmd: b"v".to_vec(),
        });
        store.write(&mut ctx).unwrap();
        assert_eq!(ctx.diff_bytes, -4);
    }

    #[test]
    fn split_check_never_proposes_range_edges() {
        let store = MemDataStore::new();
        let shard = ShardDesc {
            id: 1,
            start: b"a".to_vec(),
            end: b"z".to_vec(),
            ..Default::default()
        };
        {
            let mut ctx = WriteContext::default();
            ctx.reset(shard.clone(), 1);
            for i in 0..16u8 {
                ctx.append_request(Request {
                    id: i as u64,
                    cmd_type: CmdType::Write,
                    key: vec![b'a' + i],
                    cmd: vec![0u8; 32],
                });
            }
            store.write(&mut ctx).unwrap();
        }
        let res = store.split_check(&shard, 128).unwrap();
        assert_eq!(res.keys, 16);
        assert!(!res.split_keys.is_empty());
        for key in &res.split_keys {
            assert!(key.as_slice() > shard.start.as_slice());
            assert!(key.as_slice() < shard.end.as_slice());
        }
    }
}

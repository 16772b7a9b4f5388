//! Fjall-backed raft log store.
//!
//! Layout: one partition for entries (key = shard | replica | index, all
//! big-endian so the index order is the key order), one for hard states and
//! one for snapshot records. Entry and snapshot payloads carry a crc32 so a
//! torn or bit-rotted record is detected before it reaches the consensus
//! module.

use std::path::Path;

use anyhow::Context;
use crc32fast::Hasher;
use fjall::{Keyspace, PartitionCreateOptions, PartitionHandle};
use protobuf::Message as PbMessage;
use raft::eraftpb::{Entry, HardState, Snapshot};

use keel_raft::raftstore::{
    LogStore, RaftLocalState, ReplicaId, SavedRaftState, ShardId, SnapshotInfo, WorkerContext,
};

const ENTRIES_PARTITION: &str = "raft_entries";
const STATES_PARTITION: &str = "raft_states";
const SNAPSHOTS_PARTITION: &str = "raft_snapshots";

// Prune in chunks to keep batch memory bounded.
const REMOVE_CHUNK: usize = 10_000;

pub struct FjallLogStore {
    keyspace: Keyspace,
    entries: PartitionHandle,
    states: PartitionHandle,
    snapshots: PartitionHandle,
}

impl FjallLogStore {
    pub fn open_dir(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let keyspace = fjall::Config::new(path.as_ref())
            .open()
            .context("open log store keyspace")?;
        tracing::info!(path = %path.as_ref().display(), "log store opened");
        Self::open(keyspace)
    }

    pub fn open(keyspace: Keyspace) -> anyhow::Result<Self> {
        let entries =
            keyspace.open_partition(ENTRIES_PARTITION, PartitionCreateOptions::default())?;
        let states =
            keyspace.open_partition(STATES_PARTITION, PartitionCreateOptions::default())?;
        let snapshots =
            keyspace.open_partition(SNAPSHOTS_PARTITION, PartitionCreateOptions::default())?;
        Ok(Self {
            keyspace,
            entries,
            states,
            snapshots,
        })
    }

    fn persist(&self) -> anyhow::Result<()> {
        self.keyspace
            .persist(fjall::PersistMode::SyncAll)
            .context("persist log store")?;
        Ok(())
    }

    fn last_entry_index(&self, shard_id: ShardId, replica_id: ReplicaId) -> anyhow::Result<u64> {
        let prefix = replica_prefix(shard_id, replica_id);
        let Some(item) = self.entries.prefix(prefix).next_back() else {
            return Ok(0);
        };
        let (key, _) = item?;
        Ok(entry_index_from_key(key.as_ref())?)
    }
}

impl LogStore for FjallLogStore {
    fn save_raft_state(
        &self,
        shard_id: ShardId,
        replica_id: ReplicaId,
        state: SavedRaftState,
        wc: &mut WorkerContext,
    ) -> anyhow::Result<()> {
        if state.is_empty() {
            return Ok(());
        }
        let mut batch = self.keyspace.batch();

        if let Some(first) = state.entries.first() {
            // A new leader may overwrite a divergent suffix: drop every
            // persisted entry at or above the first incoming index.
            let first_index = first.get_index();
            let last = self.last_entry_index(shard_id, replica_id)?;
            for index in first_index..=last {
                batch.remove(&self.entries, entry_key(shard_id, replica_id, index).to_vec());
            }
        }
        for entry in &state.entries {
            wc.buf.clear();
            entry
                .write_to_vec(&mut wc.buf)
                .context("encode raft entry")?;
            batch.insert(
                &self.entries,
                entry_key(shard_id, replica_id, entry.get_index()).to_vec(),
                frame_record(&wc.buf),
            );
        }
        if let Some(hs) = &state.hard_state {
            let encoded = hs.write_to_bytes().context("encode hard state")?;
            batch.insert(
                &self.states,
                replica_prefix(shard_id, replica_id).to_vec(),
                frame_record(&encoded),
            );
        }
        if let Some(snapshot) = &state.snapshot {
            // Dummy compaction markers have no on-disk image to track.
            let info = SnapshotInfo::decode(snapshot.get_data())
                .context("decode snapshot info on save")?;
            let encoded = snapshot.write_to_bytes().context("encode snapshot record")?;
            batch.insert(
                &self.snapshots,
                shard_key(shard_id).to_vec(),
                frame_snapshot(!info.dummy, &encoded),
            );
        }

        batch.commit().context("commit raft state batch")?;
        self.persist()
    }

    fn read_raft_state(
        &self,
        shard_id: ShardId,
        replica_id: ReplicaId,
    ) -> anyhow::Result<Option<RaftLocalState>> {
        let hard_state = match self.states.get(replica_prefix(shard_id, replica_id))? {
            Some(value) => {
                let payload = unframe_record(value.as_ref())?;
                Some(HardState::parse_from_bytes(&payload).context("decode hard state")?)
            }
            None => None,
        };

        let prefix = replica_prefix(shard_id, replica_id);
        let first = match self.entries.prefix(prefix).next() {
            Some(item) => {
                let (key, _) = item?;
                entry_index_from_key(key.as_ref())?
            }
            None => 0,
        };
        let last = self.last_entry_index(shard_id, replica_id)?;

        if hard_state.is_none() && first == 0 {
            return Ok(None);
        }
        Ok(Some(RaftLocalState {
            hard_state: hard_state.unwrap_or_default(),
            first_entry_index: first,
            last_entry_index: last,
        }))
    }

    fn get_snapshot(&self, shard_id: ShardId) -> anyhow::Result<Option<Snapshot>> {
        let Some(value) = self.snapshots.get(shard_key(shard_id))? else {
            return Ok(None);
        };
        let (_, payload) = unframe_snapshot(value.as_ref())?;
        let snapshot = Snapshot::parse_from_bytes(&payload).context("decode snapshot record")?;
        Ok(Some(snapshot))
    }

    fn remove_snapshot_image(
        &self,
        shard_id: ShardId,
        _replica_id: ReplicaId,
        index: u64,
    ) -> anyhow::Result<()> {
        let Some(value) = self.snapshots.get(shard_key(shard_id))? else {
            return Ok(());
        };
        let (has_image, payload) = unframe_snapshot(value.as_ref())?;
        if !has_image {
            return Ok(());
        }
        let snapshot = Snapshot::parse_from_bytes(&payload).context("decode snapshot record")?;
        if snapshot.get_metadata().get_index() != index {
            return Ok(());
        }
        // Keep the record, drop the image flag: the log reader still needs
        // this marker to establish its base position.
        self.snapshots
            .insert(shard_key(shard_id).to_vec(), frame_snapshot(false, &payload))?;
        self.persist()
    }

    fn remove_entries_to(
        &self,
        shard_id: ShardId,
        replica_id: ReplicaId,
        index: u64,
    ) -> anyhow::Result<()> {
        let low = entry_key(shard_id, replica_id, 0).to_vec();
        let high = entry_key(shard_id, replica_id, index + 1).to_vec();
        let mut batch = self.keyspace.batch();
        let mut queued = 0usize;
        for item in self.entries.range(low..high) {
            let (key, _) = item?;
            batch.remove(&self.entries, key.to_vec());
            queued += 1;
            if queued >= REMOVE_CHUNK {
                batch.commit().context("commit entry prune batch")?;
                batch = self.keyspace.batch();
                queued = 0;
            }
        }
        if queued > 0 {
            batch.commit().context("commit entry prune batch")?;
        }
        self.persist()
    }

    fn entries(
        &self,
        shard_id: ShardId,
        replica_id: ReplicaId,
        low: u64,
        high: u64,
        max_size: u64,
    ) -> anyhow::Result<Vec<Entry>> {
        let start = entry_key(shard_id, replica_id, low).to_vec();
        let end = entry_key(shard_id, replica_id, high).to_vec();
        let mut out = Vec::new();
        let mut size = 0u64;
        let mut expected = low;
        for item in self.entries.range(start..end) {
            let (key, value) = item?;
            let index = entry_index_from_key(key.as_ref())?;
            if index != expected {
                break;
            }
            expected += 1;
            let payload = unframe_record(value.as_ref())?;
            let entry = Entry::parse_from_bytes(&payload).context("decode raft entry")?;
            size = size.saturating_add(entry.get_data().len() as u64);
            if !out.is_empty() && size > max_size {
                break;
            }
            out.push(entry);
        }
        Ok(out)
    }

    fn term(
        &self,
        shard_id: ShardId,
        replica_id: ReplicaId,
        index: u64,
    ) -> anyhow::Result<Option<u64>> {
        let Some(value) = self.entries.get(entry_key(shard_id, replica_id, index))? else {
            return Ok(None);
        };
        let payload = unframe_record(value.as_ref())?;
        let entry = Entry::parse_from_bytes(&payload).context("decode raft entry")?;
        Ok(Some(entry.get_term()))
    }
}

fn shard_key(shard_id: ShardId) -> [u8; 8] {
    shard_id.to_be_bytes()
}

fn replica_prefix(shard_id: ShardId, replica_id: ReplicaId) -> [u8; 16] {
    let mut key = [0u8; 16];
    key[..8].copy_from_slice(&shard_id.to_be_bytes());
    key[8..].copy_from_slice(&replica_id.to_be_bytes());
    key
}

fn entry_key(shard_id: ShardId, replica_id: ReplicaId, index: u64) -> [u8; 24] {
    let mut key = [0u8; 24];
    key[..8].copy_from_slice(&shard_id.to_be_bytes());
    key[8..16].copy_from_slice(&replica_id.to_be_bytes());
    key[16..].copy_from_slice(&index.to_be_bytes());
    key
}

fn entry_index_from_key(key: &[u8]) -> anyhow::Result<u64> {
    anyhow::ensure!(key.len() == 24, "malformed entry key of {} bytes", key.len());
    let mut buf = [0u8; 8];
    buf.copy_from_slice(&key[16..]);
    Ok(u64::from_be_bytes(buf))
}

fn checksum(payload: &[u8]) -> u32 {
    let mut hasher = Hasher::new();
    hasher.update(payload);
    hasher.finalize()
}

fn frame_record(payload: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(4 + payload.len());
    out.extend_from_slice(&checksum(payload).to_be_bytes());
    out.extend_from_slice(payload);
    out
}

fn unframe_record(data: &[u8]) -> anyhow::Result<Vec<u8>> {
    anyhow::ensure!(data.len() >= 4, "log record too short");
    let mut crc_buf = [0u8; 4];
    crc_buf.copy_from_slice(&data[..4]);
    let expected = u32::from_be_bytes(crc_buf);
    let payload = &data[4..];
    anyhow::ensure!(checksum(payload) == expected, "log record checksum mismatch");
    Ok(payload.to_vec())
}

fn frame_snapshot(has_image: bool, payload: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(5 + payload.len());
    out.push(u8::from(has_image));
    out.extend_from_slice(&checksum(payload).to_be_bytes());
    out.extend_from_slice(payload);
    out
}

fn unframe_snapshot(data: &[u8]) -> anyhow::Result<(bool, Vec<u8>)> {
    anyhow::ensure!(data.len() >= 5, "snapshot record too short");
    let has_image = data[0] != 0;
    let mut crc_buf = [0u8; 4];
    crc_buf.copy_from_slice(&data[1..5]);
    let expected = u32::from_be_bytes(crc_buf);
    let payload = &data[5..];
    anyhow::ensure!(
        checksum(payload) == expected,
        "snapshot record checksum mismatch"
    );
    Ok((has_image, payload.to_vec()))
}

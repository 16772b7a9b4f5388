//! Fjall-backed data store.
//!
//! All shards share one lexicographic key space; ownership is decided by the
//! shard range, so a split is a metadata-only operation. Shard metadata and
//! the apply log index live in a separate partition and are written in the
//! same batch as the user data they describe, which gives the crash
//! guarantee the apply layer relies on: after recovery, `(log_index, state)`
//! is either fully present or fully absent.

use std::path::Path;

use anyhow::Context;
use fjall::{Keyspace, PartitionCreateOptions, PartitionHandle};
use raft::eraftpb::Snapshot;

use keel_raft::raftstore::{
    CmdType, DataStore, ShardDesc, ShardId, ShardLocalState, ShardMetadata, SnapshotInfo,
    SplitCheckResult, WriteContext,
};

const DATA_PARTITION: &str = "kv_data";
const META_PARTITION: &str = "kv_meta";

const META_APPLIED_SUFFIX: u8 = 1;
const META_STATE_SUFFIX: u8 = 2;

pub struct FjallDataStore {
    keyspace: Keyspace,
    data: PartitionHandle,
    meta: PartitionHandle,
}

impl FjallDataStore {
    pub fn open_dir(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let keyspace = fjall::Config::new(path.as_ref())
            .open()
            .context("open data store keyspace")?;
        tracing::info!(path = %path.as_ref().display(), "data store opened");
        Self::open(keyspace)
    }

    pub fn open(keyspace: Keyspace) -> anyhow::Result<Self> {
        let data = keyspace.open_partition(DATA_PARTITION, PartitionCreateOptions::default())?;
        let meta = keyspace.open_partition(META_PARTITION, PartitionCreateOptions::default())?;
        Ok(Self {
            keyspace,
            data,
            meta,
        })
    }

    pub fn get(&self, key: &[u8]) -> anyhow::Result<Option<Vec<u8>>> {
        Ok(self.data.get(key)?.map(|v| v.as_ref().to_vec()))
    }

    fn persist(&self) -> anyhow::Result<()> {
        self.keyspace
            .persist(fjall::PersistMode::SyncAll)
            .context("persist data store")?;
        Ok(())
    }
}

impl DataStore for FjallDataStore {
    fn write(&self, ctx: &mut WriteContext) -> anyhow::Result<()> {
        let mut batch = self.keyspace.batch();
        for req in &ctx.requests {
            match req.cmd_type {
                CmdType::Write => {
                    let new_len = (req.key.len() + req.cmd.len()) as i64;
                    let old_len = self
                        .data
                        .get(&req.key)?
                        .map_or(0, |v| (req.key.len() + v.len()) as i64);
                    batch.insert(&self.data, req.key.clone(), req.cmd.clone());
                    ctx.written_bytes = ctx.written_bytes.saturating_add(new_len as u64);
                    ctx.diff_bytes += new_len - old_len;
                    ctx.responses.push(b"ok".to_vec());
                }
                CmdType::Read => {
                    anyhow::bail!("read request in a replicated write batch");
                }
            }
        }
        // The apply index becomes durable together with the writes.
        batch.insert(
            &self.meta,
            meta_key(ctx.shard.id, META_APPLIED_SUFFIX).to_vec(),
            ctx.log_index.to_be_bytes().to_vec(),
        );
        batch.commit().context("commit write batch")?;
        self.persist()
    }

    fn save_shard_metadata(&self, records: Vec<ShardMetadata>) -> anyhow::Result<()> {
        let mut batch = self.keyspace.batch();
        for record in &records {
            batch.insert(
                &self.meta,
                meta_key(record.shard_id, META_APPLIED_SUFFIX).to_vec(),
                record.log_index.to_be_bytes().to_vec(),
            );
            batch.insert(
                &self.meta,
                meta_key(record.shard_id, META_STATE_SUFFIX).to_vec(),
                record.state.encode(),
            );
        }
        batch.commit().context("commit shard metadata batch")?;
        self.persist()
    }

    fn persistent_log_index(&self, shard_id: ShardId) -> anyhow::Result<u64> {
        let Some(value) = self.meta.get(meta_key(shard_id, META_APPLIED_SUFFIX))? else {
            return Ok(0);
        };
        let bytes: &[u8] = value.as_ref();
        anyhow::ensure!(bytes.len() == 8, "malformed apply index record");
        let mut buf = [0u8; 8];
        buf.copy_from_slice(bytes);
        Ok(u64::from_be_bytes(buf))
    }

    fn shard_local_state(&self, shard_id: ShardId) -> anyhow::Result<Option<ShardLocalState>> {
        let Some(value) = self.meta.get(meta_key(shard_id, META_STATE_SUFFIX))? else {
            return Ok(None);
        };
        Ok(Some(ShardLocalState::decode(value.as_ref())?))
    }

    fn apply_snapshot(&self, shard_id: ShardId, snapshot: &Snapshot) -> anyhow::Result<()> {
        let info = SnapshotInfo::decode(snapshot.get_data())?;
        anyhow::ensure!(!info.dummy, "dummy snapshot must never be applied");
        let state = info.shard.context("snapshot carries no shard state")?;
        let index = snapshot.get_metadata().get_index();

        let mut batch = self.keyspace.batch();
        batch.insert(
            &self.meta,
            meta_key(shard_id, META_APPLIED_SUFFIX).to_vec(),
            index.to_be_bytes().to_vec(),
        );
        batch.insert(
            &self.meta,
            meta_key(shard_id, META_STATE_SUFFIX).to_vec(),
            state.encode(),
        );
        batch.commit().context("commit snapshot state")?;
        self.persist()
    }

    fn split_check(&self, shard: &ShardDesc, target_size: u64) -> anyhow::Result<SplitCheckResult> {
        let mut res = SplitCheckResult::default();
        let mut acc = 0u64;
        let target = target_size.max(1);
        for item in self.data.range(shard.start.clone()..) {
            let (key, value) = item?;
            if !shard.contains_key(key.as_ref()) {
                break;
            }
            let len = (key.len() + value.len()) as u64;
            res.size += len;
            res.keys += 1;
            if acc >= target && key.as_ref() > shard.start.as_slice() {
                res.split_keys.push(key.as_ref().to_vec());
                acc = 0;
            }
            acc += len;
        }
        Ok(res)
    }
}

fn meta_key(shard_id: ShardId, suffix: u8) -> [u8; 9] {
    let mut key = [0u8; 9];
    key[..8].copy_from_slice(&shard_id.to_be_bytes());
    key[8] = suffix;
    key
}

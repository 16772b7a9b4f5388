//! Deterministic apply state machine for committed entries.
//!
//! Every replica of a shard runs the same committed entries through this code
//! and must end up with bit-identical shard metadata. All mutation goes
//! through clone-mutate-persist: the current shard is cloned, the change is
//! applied to the clone, and the clone is saved atomically with the log index
//! before it replaces the in-memory descriptor. Rejections leave the shard
//! untouched and travel back to the proposer inside the response batch.

use std::sync::{Arc, RwLock};

use anyhow::Context;
use protobuf::Message as PbMessage;
use raft::eraftpb::{ConfChange, ConfChangeV2, Entry, EntryType, Snapshot};

use super::meta::{
    ReplicaDesc, ReplicaId, ReplicaRole, ReplicaState, ShardDesc, ShardId, ShardLocalState,
    SnapshotInfo,
};
use super::rpc::{
    AdminRequest, AdminResponse, BatchSplitRequest, BatchSplitResponse, ChangeType,
    CompactLogRequest, ConfigChangeRequest, ConfigChangeResponse, ConfigChangeV2Request,
    RequestBatch, RespError, Response, ResponseBatch, ResponseHeader,
};
use super::storage::{DataStore, ShardMetadata, WriteContext};

/// Apply-side counters folded into the replica stats after each batch.
#[derive(Clone, Copy, Debug, Default)]
pub struct ApplyMetrics {
    pub written_bytes: u64,
    pub written_keys: u64,
    pub diff_bytes: i64,
    pub admin_splits: u64,
}

/// Admin side-effects handed back to the event loop to trigger follow-on
/// actions: conf-change results feed the consensus module, split results
/// announce the new shards, compact-log results schedule the pruning.
#[derive(Clone, Debug)]
pub enum AdminExecResult {
    ConfigChange {
        index: u64,
        changes: Vec<ConfigChangeRequest>,
        shard: ShardDesc,
    },
    Split {
        derived: ShardDesc,
        shards: Vec<ShardDesc>,
    },
    CompactLog {
        index: u64,
    },
}

/// Conf-change payload to report back to the consensus module once the
/// membership change has been accepted at apply time.
#[derive(Clone, Debug)]
pub enum ParsedConfChange {
    V1(ConfChange),
    V2(ConfChangeV2),
}

/// Result of applying one committed entry.
#[derive(Debug, Default)]
pub struct ApplyOutcome {
    pub index: u64,
    pub term: u64,
    pub resp: Option<ResponseBatch>,
    pub admin: Option<AdminExecResult>,
    pub conf_change: Option<ParsedConfChange>,
    pub metrics: ApplyMetrics,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum ConfChangeKind {
    Simple,
    EnterJoint,
    LeaveJoint,
}

fn conf_change_kind(change_count: usize) -> ConfChangeKind {
    match change_count {
        0 => ConfChangeKind::LeaveJoint,
        1 => ConfChangeKind::Simple,
        _ => ConfChangeKind::EnterJoint,
    }
}

/// Whether the request epoch still matches the shard. Compact-log requests
/// are epoch-free; membership changes pin the conf version, splits pin both,
/// and user writes pin the range version.
fn epoch_match(shard: &ShardDesc, batch: &RequestBatch) -> bool {
    match &batch.admin {
        Some(AdminRequest::CompactLog(_)) => true,
        Some(AdminRequest::ConfigChange(_)) | Some(AdminRequest::ConfigChangeV2(_)) => {
            batch.header.epoch.conf_ver == shard.epoch.conf_ver
        }
        Some(AdminRequest::BatchSplit(_)) => batch.header.epoch == shard.epoch,
        None => batch.header.epoch.version == shard.epoch.version,
    }
}

pub struct StateMachine {
    shard_id: ShardId,
    replica_id: ReplicaId,
    data_store: Arc<dyn DataStore>,
    shard: Arc<RwLock<ShardDesc>>,
    applied_index: u64,
    applied_term: u64,
    pending_remove: bool,
    closed: bool,
    write_ctx: WriteContext,
}

impl StateMachine {
    pub fn new(
        replica_id: ReplicaId,
        shard: Arc<RwLock<ShardDesc>>,
        data_store: Arc<dyn DataStore>,
        applied_index: u64,
    ) -> Self {
        let shard_id = shard.read().unwrap().id;
        Self {
            shard_id,
            replica_id,
            data_store,
            shard,
            applied_index,
            applied_term: 0,
            pending_remove: false,
            closed: false,
            write_ctx: WriteContext::default(),
        }
    }

    pub fn shard(&self) -> ShardDesc {
        self.shard.read().unwrap().clone()
    }

    fn update_shard(&self, shard: ShardDesc) {
        *self.shard.write().unwrap() = shard;
    }

    pub fn applied_index(&self) -> u64 {
        self.applied_index
    }

    pub fn applied_term(&self) -> u64 {
        self.applied_term
    }

    pub fn is_pending_remove(&self) -> bool {
        self.pending_remove
    }

    pub fn close(&mut self) {
        self.closed = true;
    }

    /// Apply committed entries in index order. Entries at or below the
    /// current applied index are replay artifacts and are skipped.
    pub fn apply_committed(&mut self, entries: &[Entry]) -> Vec<ApplyOutcome> {
        let mut outcomes = Vec::with_capacity(entries.len());
        for entry in entries {
            if self.closed {
                break;
            }
            outcomes.push(self.apply_entry(entry));
        }
        outcomes
    }

    fn apply_entry(&mut self, entry: &Entry) -> ApplyOutcome {
        let index = entry.get_index();
        let term = entry.get_term();
        let mut outcome = ApplyOutcome {
            index,
            term,
            ..Default::default()
        };
        if index == 0 || index <= self.applied_index {
            return outcome;
        }
        if self.pending_remove {
            // This replica observed its own removal; the shard data will be
            // destroyed, so later entries are not worth executing.
            self.applied_index = index;
            self.applied_term = term;
            return outcome;
        }
        match entry.get_entry_type() {
            EntryType::EntryNormal => self.apply_normal(entry, &mut outcome),
            EntryType::EntryConfChange => self.apply_conf_change_entry(entry, &mut outcome, false),
            EntryType::EntryConfChangeV2 => self.apply_conf_change_entry(entry, &mut outcome, true),
        }
        self.applied_index = index;
        self.applied_term = term;
        outcome
    }

    fn apply_normal(&mut self, entry: &Entry, outcome: &mut ApplyOutcome) {
        let data = entry.get_data();
        if data.is_empty() {
            // Leader election barrier.
            return;
        }
        let batch = match RequestBatch::decode(data) {
            Ok(batch) => batch,
            Err(err) => panic!(
                "shard {} corrupted log entry at index {}: {err}",
                self.shard_id,
                entry.get_index()
            ),
        };
        let shard = self.shard();
        if !epoch_match(&shard, &batch) {
            outcome.resp = Some(ResponseBatch::error(
                batch.header.id,
                RespError::StaleEpoch { current: shard },
            ));
            return;
        }
        if batch.is_admin() {
            match self.exec_admin(entry.get_index(), &batch, outcome) {
                Ok(resp) => outcome.resp = Some(resp),
                Err(err) => {
                    tracing::info!(
                        shard = self.shard_id,
                        index = entry.get_index(),
                        error = %err,
                        "admin request rejected at apply"
                    );
                    outcome.resp = Some(ResponseBatch::error(
                        batch.header.id,
                        RespError::Other(err.to_string()),
                    ));
                }
            }
        } else {
            outcome.resp = Some(self.exec_write(entry.get_index(), &batch, outcome));
        }
    }

    fn apply_conf_change_entry(&mut self, entry: &Entry, outcome: &mut ApplyOutcome, v2: bool) {
        let (batch, parsed) = if v2 {
            let cc = ConfChangeV2::parse_from_bytes(entry.get_data()).unwrap_or_else(|err| {
                panic!(
                    "shard {} corrupted conf change v2 at index {}: {err}",
                    self.shard_id,
                    entry.get_index()
                )
            });
            let batch = if cc.get_context().is_empty() {
                // The consensus module may emit a bare leave-joint entry.
                RequestBatch::admin(
                    0,
                    self.shard_id,
                    self.shard().epoch,
                    AdminRequest::ConfigChangeV2(ConfigChangeV2Request::default()),
                )
            } else {
                RequestBatch::decode(cc.get_context()).unwrap_or_else(|err| {
                    panic!(
                        "shard {} corrupted conf change context at index {}: {err}",
                        self.shard_id,
                        entry.get_index()
                    )
                })
            };
            (batch, ParsedConfChange::V2(cc))
        } else {
            let cc = ConfChange::parse_from_bytes(entry.get_data()).unwrap_or_else(|err| {
                panic!(
                    "shard {} corrupted conf change at index {}: {err}",
                    self.shard_id,
                    entry.get_index()
                )
            });
            let batch = RequestBatch::decode(cc.get_context()).unwrap_or_else(|err| {
                panic!(
                    "shard {} corrupted conf change context at index {}: {err}",
                    self.shard_id,
                    entry.get_index()
                )
            });
            (batch, ParsedConfChange::V1(cc))
        };
        let shard = self.shard();
        if !epoch_match(&shard, &batch) {
            outcome.resp = Some(ResponseBatch::error(
                batch.header.id,
                RespError::StaleEpoch { current: shard },
            ));
            return;
        }
        match self.exec_admin(entry.get_index(), &batch, outcome) {
            Ok(resp) => {
                outcome.resp = Some(resp);
                // Only an accepted change reaches the consensus module.
                outcome.conf_change = Some(parsed);
            }
            Err(err) => {
                tracing::info!(
                    shard = self.shard_id,
                    index = entry.get_index(),
                    error = %err,
                    "conf change rejected at apply"
                );
                outcome.resp = Some(ResponseBatch::error(
                    batch.header.id,
                    RespError::Other(err.to_string()),
                ));
            }
        }
    }

    fn exec_admin(
        &mut self,
        index: u64,
        batch: &RequestBatch,
        outcome: &mut ApplyOutcome,
    ) -> anyhow::Result<ResponseBatch> {
        let admin = batch.admin.as_ref().expect("admin request present");
        match admin {
            AdminRequest::ConfigChange(req) => {
                self.do_exec_config_change(index, batch.header.id, req, outcome)
            }
            AdminRequest::ConfigChangeV2(req) => {
                self.do_exec_config_change_v2(index, batch.header.id, req, outcome)
            }
            AdminRequest::BatchSplit(req) => {
                self.do_exec_split(index, batch.header.id, req, outcome)
            }
            AdminRequest::CompactLog(req) => {
                self.do_exec_compact_log(batch.header.id, req, outcome)
            }
        }
    }

    fn do_exec_config_change(
        &mut self,
        index: u64,
        req_id: u64,
        req: &ConfigChangeRequest,
        outcome: &mut ApplyOutcome,
    ) -> anyhow::Result<ResponseBatch> {
        let replica = req.replica.clone();
        let current = self.shard();
        tracing::info!(
            shard = current.id,
            index,
            change = ?req,
            "begin to apply change replica"
        );

        let mut res = current.clone();
        res.epoch.conf_ver += 1;

        match req.change_type {
            ChangeType::AddNode => {
                if let Some(p) = res.find_replica_mut(replica.container_id) {
                    if p.role != ReplicaRole::Learner || p.id != replica.id {
                        anyhow::bail!(
                            "shard {} can't add duplicated replica {:?}",
                            res.id,
                            replica
                        );
                    }
                    p.role = ReplicaRole::Voter;
                } else {
                    res.replicas.push(ReplicaDesc {
                        role: ReplicaRole::Voter,
                        ..replica.clone()
                    });
                }
            }
            ChangeType::RemoveNode => {
                if let Some(p) = res.find_replica(replica.container_id) {
                    if p.id != replica.id || p.container_id != replica.container_id {
                        anyhow::bail!(
                            "shard {} ignore remove unmatched replica {:?}",
                            res.id,
                            replica
                        );
                    }
                    if self.replica_id == replica.id {
                        // Removing ourselves: the shard data will be
                        // destroyed, later entries need not apply.
                        self.pending_remove = true;
                    }
                    res.remove_replica(replica.container_id);
                } else {
                    anyhow::bail!("shard {} remove missing replica {:?}", res.id, replica);
                }
            }
            ChangeType::AddLearnerNode => {
                if res.find_replica(replica.container_id).is_some() {
                    anyhow::bail!(
                        "shard {} can't add duplicated learner {:?}",
                        res.id,
                        replica
                    );
                }
                res.replicas.push(ReplicaDesc {
                    role: ReplicaRole::Learner,
                    ..replica.clone()
                });
            }
        }

        let state = if self.pending_remove {
            ReplicaState::Tombstone
        } else {
            ReplicaState::Normal
        };
        self.update_shard(res.clone());
        self.save_shard_metadata(index, res.clone(), state);
        tracing::info!(
            shard = res.id,
            conf_ver = res.epoch.conf_ver,
            state = ?state,
            "apply change replica complete"
        );

        outcome.admin = Some(AdminExecResult::ConfigChange {
            index,
            changes: vec![req.clone()],
            shard: res.clone(),
        });
        Ok(ResponseBatch::admin(
            req_id,
            AdminResponse::ConfigChange(ConfigChangeResponse { shard: res }),
        ))
    }

    fn do_exec_config_change_v2(
        &mut self,
        index: u64,
        req_id: u64,
        req: &ConfigChangeV2Request,
        outcome: &mut ApplyOutcome,
    ) -> anyhow::Result<ResponseBatch> {
        let current = self.shard();
        tracing::info!(
            shard = current.id,
            index,
            changes = ?req.changes,
            "begin to apply change replica v2"
        );

        let kind = conf_change_kind(req.changes.len());
        let res = if kind == ConfChangeKind::LeaveJoint {
            self.apply_leave_joint()
        } else {
            self.apply_conf_change_by_kind(kind, &req.changes)?
        };

        let state = if self.pending_remove {
            ReplicaState::Tombstone
        } else {
            ReplicaState::Normal
        };
        self.update_shard(res.clone());
        self.save_shard_metadata(index, res.clone(), state);
        tracing::info!(
            shard = res.id,
            conf_ver = res.epoch.conf_ver,
            state = ?state,
            "apply change replica v2 complete"
        );

        outcome.admin = Some(AdminExecResult::ConfigChange {
            index,
            changes: req.changes.clone(),
            shard: res.clone(),
        });
        Ok(ResponseBatch::admin(
            req_id,
            AdminResponse::ConfigChange(ConfigChangeResponse { shard: res }),
        ))
    }

    fn apply_conf_change_by_kind(
        &mut self,
        kind: ConfChangeKind,
        changes: &[ConfigChangeRequest],
    ) -> anyhow::Result<ShardDesc> {
        let current = self.shard();
        let mut res = current.clone();

        for cp in changes {
            let change_type = cp.change_type;
            let replica = cp.replica.clone();
            let container_id = replica.container_id;

            let existing = res.find_replica(container_id).cloned();
            if let Some(exist) = &existing {
                if exist.in_joint() {
                    panic!(
                        "shard {} can't apply conf change, configuration is still in joint state: {exist:?}",
                        res.id
                    );
                }
            }

            match (existing, change_type) {
                (None, ChangeType::AddNode) => {
                    let role = if kind == ConfChangeKind::Simple {
                        ReplicaRole::Voter
                    } else {
                        ReplicaRole::IncomingVoter
                    };
                    res.replicas.push(ReplicaDesc { role, ..replica });
                }
                (None, ChangeType::AddLearnerNode) => {
                    res.replicas.push(ReplicaDesc {
                        role: ReplicaRole::Learner,
                        ..replica
                    });
                }
                (None, ChangeType::RemoveNode) => {
                    anyhow::bail!("shard {} remove missing replica {:?}", res.id, replica);
                }
                (Some(exist), ChangeType::AddNode | ChangeType::AddLearnerNode) => {
                    // Same container: only learner<->voter transitions are
                    // legal, and only with a matching replica id.
                    if exist.id != replica.id
                        || (exist.role == ReplicaRole::Voter
                            && change_type == ChangeType::AddNode)
                        || (exist.role == ReplicaRole::Learner
                            && change_type == ChangeType::AddLearnerNode)
                    {
                        anyhow::bail!(
                            "shard {} can't add duplicated replica {:?}, duplicated with {:?}",
                            res.id,
                            replica,
                            exist
                        );
                    }
                    let p = res
                        .find_replica_mut(container_id)
                        .expect("replica exists on container");
                    if exist.role == ReplicaRole::Voter
                        && change_type == ChangeType::AddLearnerNode
                    {
                        p.role = if kind == ConfChangeKind::Simple {
                            ReplicaRole::Learner
                        } else {
                            ReplicaRole::DemotingVoter
                        };
                    } else if exist.role == ReplicaRole::Learner
                        && change_type == ChangeType::AddNode
                    {
                        p.role = if kind == ConfChangeKind::Simple {
                            ReplicaRole::Voter
                        } else {
                            ReplicaRole::IncomingVoter
                        };
                    }
                }
                (Some(exist), ChangeType::RemoveNode) => {
                    if kind == ConfChangeKind::EnterJoint && exist.role == ReplicaRole::Voter {
                        anyhow::bail!(
                            "shard {} can't remove voter replica {:?} directly",
                            res.id,
                            replica
                        );
                    }
                    if exist.id != replica.id || exist.container_id != replica.container_id {
                        anyhow::bail!(
                            "shard {} ignore remove unmatched replica {:?}",
                            res.id,
                            replica
                        );
                    }
                    res.remove_replica(container_id);
                    if self.replica_id == replica.id {
                        self.pending_remove = true;
                    }
                }
            }
        }

        res.epoch.conf_ver += changes.len() as u64;
        Ok(res)
    }

    fn apply_leave_joint(&mut self) -> ShardDesc {
        let current = self.shard();
        let mut shard = current.clone();

        let mut transitioned = 0u64;
        for replica in shard.replicas.iter_mut() {
            match replica.role {
                ReplicaRole::IncomingVoter => {
                    replica.role = ReplicaRole::Voter;
                    transitioned += 1;
                }
                ReplicaRole::DemotingVoter => {
                    replica.role = ReplicaRole::Learner;
                    transitioned += 1;
                }
                _ => {}
            }
        }
        if transitioned == 0 {
            panic!("shard {} can't leave a non-joint config", shard.id);
        }
        shard.epoch.conf_ver += transitioned;
        shard
    }

    fn do_exec_split(
        &mut self,
        index: u64,
        req_id: u64,
        req: &BatchSplitRequest,
        outcome: &mut ApplyOutcome,
    ) -> anyhow::Result<ResponseBatch> {
        outcome.metrics.admin_splits += 1;
        let split_reqs = &req.requests;
        anyhow::ensure!(!split_reqs.is_empty(), "missing splits request");

        let current = self.shard();
        let mut derived = current.clone();
        let new_count = split_reqs.len() as u64;

        let mut range_keys: Vec<Vec<u8>> = Vec::with_capacity(split_reqs.len() + 1);
        for split in split_reqs {
            anyhow::ensure!(!split.split_key.is_empty(), "missing split key");
            let prev = range_keys
                .last()
                .map(|k| k.as_slice())
                .unwrap_or(derived.start.as_slice());
            anyhow::ensure!(
                split.split_key.as_slice() > prev,
                "invalid split key {:?}",
                split.split_key
            );
            anyhow::ensure!(
                split.new_replica_ids.len() == derived.replicas.len(),
                "invalid new replica id count, need {}, but got {}",
                derived.replicas.len(),
                split.new_replica_ids.len()
            );
            range_keys.push(split.split_key.clone());
        }
        let last = range_keys.last().expect("at least one split key");
        anyhow::ensure!(
            current.contains_key(last),
            "split key {:?} outside shard range",
            last
        );

        derived.epoch.version += new_count;
        range_keys.push(derived.end.clone());
        derived.end = range_keys[0].clone();

        // Every peer must derive identical shards, so the replica order is
        // pinned before role slots are assigned.
        derived.replicas.sort_by_key(|r| r.id);

        let mut new_shards = Vec::with_capacity(split_reqs.len());
        for (i, split) in split_reqs.iter().enumerate() {
            let replicas = derived
                .replicas
                .iter()
                .enumerate()
                .map(|(slot, p)| ReplicaDesc::new(split.new_replica_ids[slot], p.container_id))
                .collect();
            new_shards.push(ShardDesc {
                id: split.new_shard_id,
                group: derived.group,
                start: range_keys[i].clone(),
                end: range_keys[i + 1].clone(),
                epoch: derived.epoch,
                replicas,
                unique: derived.unique.clone(),
                rule_groups: derived.rule_groups.clone(),
                disable_split: derived.disable_split,
            });
        }

        let mut records = Vec::with_capacity(new_shards.len() + 1);
        records.push(ShardMetadata {
            shard_id: derived.id,
            log_index: index,
            state: ShardLocalState {
                state: ReplicaState::Normal,
                shard: derived.clone(),
            },
        });
        for shard in &new_shards {
            records.push(ShardMetadata {
                shard_id: shard.id,
                log_index: index,
                state: ShardLocalState {
                    state: ReplicaState::Normal,
                    shard: shard.clone(),
                },
            });
        }
        self.update_shard(derived.clone());
        if let Err(err) = self.data_store.save_shard_metadata(records) {
            panic!("shard {} fail to save split metadata: {err}", derived.id);
        }
        tracing::info!(
            shard = derived.id,
            new_shards = new_shards.len(),
            version = derived.epoch.version,
            "batch split applied"
        );

        outcome.admin = Some(AdminExecResult::Split {
            derived,
            shards: new_shards.clone(),
        });
        Ok(ResponseBatch::admin(
            req_id,
            AdminResponse::BatchSplit(BatchSplitResponse { shards: new_shards }),
        ))
    }

    fn do_exec_compact_log(
        &mut self,
        req_id: u64,
        req: &CompactLogRequest,
        outcome: &mut ApplyOutcome,
    ) -> anyhow::Result<ResponseBatch> {
        outcome.admin = Some(AdminExecResult::CompactLog {
            index: req.compact_index,
        });
        Ok(ResponseBatch::admin(req_id, AdminResponse::CompactLog))
    }

    fn exec_write(
        &mut self,
        index: u64,
        batch: &RequestBatch,
        outcome: &mut ApplyOutcome,
    ) -> ResponseBatch {
        let shard = self.shard();
        self.write_ctx.reset(shard, index);
        for req in &batch.requests {
            self.write_ctx.append_request(req.clone());
        }
        if let Err(err) = self.data_store.write(&mut self.write_ctx) {
            // A committed write cannot be rejected at apply time.
            panic!(
                "shard {} fail to exec write at index {index}: {err}",
                self.shard_id
            );
        }

        let mut resp = ResponseBatch {
            header: ResponseHeader {
                id: batch.header.id,
                error: None,
            },
            responses: Vec::with_capacity(self.write_ctx.responses.len()),
            admin: None,
        };
        for (req, value) in batch.requests.iter().zip(self.write_ctx.responses.iter()) {
            outcome.metrics.written_keys += 1;
            resp.responses.push(Response {
                id: req.id,
                value: value.clone(),
            });
        }
        outcome.metrics.written_bytes += self.write_ctx.written_bytes;
        outcome.metrics.diff_bytes += self.write_ctx.diff_bytes;
        resp
    }

    /// Replace the replica's state with a received snapshot. The shard is
    /// marked `Applying` while the data moves and settles back to `Normal`.
    pub fn apply_snapshot(&mut self, snapshot: &Snapshot) -> anyhow::Result<()> {
        let info = SnapshotInfo::decode(snapshot.get_data())?;
        anyhow::ensure!(!info.dummy, "dummy snapshot must never be applied");
        let state = info.shard.context("snapshot carries no shard state")?;
        let index = snapshot.get_metadata().get_index();

        self.save_shard_metadata(index, state.shard.clone(), ReplicaState::Applying);
        self.data_store.apply_snapshot(self.shard_id, snapshot)?;
        self.save_shard_metadata(index, state.shard.clone(), ReplicaState::Normal);
        self.update_shard(state.shard);
        self.applied_index = index;
        self.applied_term = snapshot.get_metadata().get_term();
        Ok(())
    }

    fn save_shard_metadata(&self, index: u64, shard: ShardDesc, state: ReplicaState) {
        let record = ShardMetadata {
            shard_id: shard.id,
            log_index: index,
            state: ShardLocalState { state, shard },
        };
        if let Err(err) = self.data_store.save_shard_metadata(vec![record]) {
            panic!("shard {} fail to save metadata: {err}", self.shard_id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::raftstore::meta::Epoch;
    use crate::raftstore::rpc::{CmdType, Request, RequestHeader, SplitRequest};
    use crate::raftstore::storage::MemDataStore;

    fn voter(id: u64, container: u64) -> ReplicaDesc {
        ReplicaDesc::new(id, container)
    }

    fn learner(id: u64, container: u64) -> ReplicaDesc {
        ReplicaDesc::learner(id, container)
    }

    fn shard_with(conf_ver: u64, replicas: Vec<ReplicaDesc>) -> ShardDesc {
        ShardDesc {
            id: 1,
            start: b"a".to_vec(),
            end: b"z".to_vec(),
            epoch: Epoch {
                version: 1,
                conf_ver,
            },
            replicas,
            ..Default::default()
        }
    }

    fn new_sm(shard: ShardDesc, replica_id: u64) -> (StateMachine, MemDataStore) {
        let store = MemDataStore::new();
        let shard = Arc::new(RwLock::new(shard));
        let sm = StateMachine::new(replica_id, shard, Arc::new(store.clone()), 0);
        (sm, store)
    }

    fn change(change_type: ChangeType, replica: ReplicaDesc) -> ConfigChangeRequest {
        ConfigChangeRequest {
            change_type,
            replica,
        }
    }

    fn apply_v1(
        sm: &mut StateMachine,
        index: u64,
        req: ConfigChangeRequest,
    ) -> (anyhow::Result<ResponseBatch>, Option<AdminExecResult>) {
        let mut outcome = ApplyOutcome::default();
        let res = sm.do_exec_config_change(index, 1, &req, &mut outcome);
        (res, outcome.admin)
    }

    fn apply_v2(
        sm: &mut StateMachine,
        index: u64,
        changes: Vec<ConfigChangeRequest>,
    ) -> anyhow::Result<ResponseBatch> {
        let mut outcome = ApplyOutcome::default();
        sm.do_exec_config_change_v2(index, 1, &ConfigChangeV2Request { changes }, &mut outcome)
    }

    #[test]
    fn promote_learner_to_voter_simple() {
        let shard = shard_with(4, vec![voter(1, 1), learner(2, 2)]);
        let (mut sm, _) = new_sm(shard, 1);
        let (res, admin) = apply_v1(&mut sm, 10, change(ChangeType::AddNode, voter(2, 2)));
        res.unwrap();
        let shard = sm.shard();
        assert_eq!(shard.epoch.conf_ver, 5);
        assert_eq!(shard.replicas.len(), 2);
        assert!(shard
            .replicas
            .iter()
            .all(|r| r.role == ReplicaRole::Voter));
        assert!(matches!(
            admin,
            Some(AdminExecResult::ConfigChange { index: 10, .. })
        ));
    }

    #[test]
    fn duplicated_voter_is_rejected() {
        let shard = shard_with(4, vec![voter(1, 1), learner(2, 2)]);
        let (mut sm, _) = new_sm(shard.clone(), 1);
        let (res, _) = apply_v1(&mut sm, 10, change(ChangeType::AddNode, voter(99, 1)));
        let err = res.unwrap_err();
        assert!(err.to_string().contains("duplicated replica"));
        assert_eq!(sm.shard(), shard);
    }

    #[test]
    fn remove_missing_replica_is_rejected() {
        let shard = shard_with(4, vec![voter(1, 1)]);
        let (mut sm, _) = new_sm(shard.clone(), 1);
        let (res, _) = apply_v1(&mut sm, 10, change(ChangeType::RemoveNode, voter(9, 9)));
        assert!(res.unwrap_err().to_string().contains("missing"));
        assert_eq!(sm.shard(), shard);
    }

    #[test]
    fn remove_unmatched_replica_is_rejected() {
        let shard = shard_with(4, vec![voter(1, 1), voter(2, 2)]);
        let (mut sm, _) = new_sm(shard.clone(), 1);
        let (res, _) = apply_v1(&mut sm, 10, change(ChangeType::RemoveNode, voter(7, 2)));
        assert!(res.unwrap_err().to_string().contains("unmatched"));
        assert_eq!(sm.shard(), shard);
        assert!(!sm.is_pending_remove());
    }

    #[test]
    fn removing_self_sets_pending_remove_and_tombstone() {
        let shard = shard_with(4, vec![voter(1, 1), voter(2, 2)]);
        let (mut sm, store) = new_sm(shard, 2);
        let (res, _) = apply_v1(&mut sm, 11, change(ChangeType::RemoveNode, voter(2, 2)));
        res.unwrap();
        assert!(sm.is_pending_remove());
        let persisted = store.shard_local_state(1).unwrap().unwrap();
        assert_eq!(persisted.state, ReplicaState::Tombstone);
        assert_eq!(store.persistent_log_index(1).unwrap(), 11);
    }

    #[test]
    fn enter_joint_then_leave_joint() {
        // S3: three voters, demote one while adding a fourth.
        let shard = shard_with(4, vec![voter(1, 1), voter(2, 2), voter(3, 3)]);
        let (mut sm, _) = new_sm(shard, 2);
        apply_v2(
            &mut sm,
            10,
            vec![
                change(ChangeType::AddLearnerNode, learner(1, 1)),
                change(ChangeType::AddNode, voter(4, 4)),
            ],
        )
        .unwrap();
        let joint = sm.shard();
        assert_eq!(joint.epoch.conf_ver, 6);
        assert_eq!(joint.replicas[0].role, ReplicaRole::DemotingVoter);
        assert_eq!(joint.replicas[1].role, ReplicaRole::Voter);
        assert_eq!(joint.replicas[2].role, ReplicaRole::Voter);
        assert_eq!(joint.replicas[3].role, ReplicaRole::IncomingVoter);
        assert_eq!(joint.replicas[3].id, 4);

        // S4: the empty change set leaves the joint configuration.
        apply_v2(&mut sm, 11, Vec::new()).unwrap();
        let settled = sm.shard();
        assert_eq!(settled.epoch.conf_ver, 8);
        assert_eq!(settled.replicas[0].role, ReplicaRole::Learner);
        assert_eq!(settled.replicas[1].role, ReplicaRole::Voter);
        assert_eq!(settled.replicas[2].role, ReplicaRole::Voter);
        assert_eq!(settled.replicas[3].role, ReplicaRole::Voter);
    }

    #[test]
    #[should_panic(expected = "non-joint")]
    fn leave_joint_on_non_joint_config_is_fatal() {
        let shard = shard_with(4, vec![voter(1, 1), voter(2, 2)]);
        let (mut sm, _) = new_sm(shard, 1);
        let _ = apply_v2(&mut sm, 10, Vec::new());
    }

    #[test]
    #[should_panic(expected = "joint state")]
    fn new_changes_while_in_joint_state_are_fatal() {
        let mut shard = shard_with(4, vec![voter(1, 1), voter(2, 2)]);
        shard.replicas[1].role = ReplicaRole::IncomingVoter;
        let (mut sm, _) = new_sm(shard, 1);
        let _ = apply_v2(
            &mut sm,
            10,
            vec![change(ChangeType::AddNode, voter(2, 2))],
        );
    }

    #[test]
    fn joint_remove_voter_directly_is_rejected() {
        let shard = shard_with(4, vec![voter(1, 1), voter(2, 2), voter(3, 3)]);
        let (mut sm, _) = new_sm(shard.clone(), 1);
        let res = apply_v2(
            &mut sm,
            10,
            vec![
                change(ChangeType::RemoveNode, voter(2, 2)),
                change(ChangeType::AddNode, voter(4, 4)),
            ],
        );
        assert!(res
            .unwrap_err()
            .to_string()
            .contains("can't remove voter replica"));
        assert_eq!(sm.shard(), shard);
    }

    #[test]
    fn simple_demote_via_v2_path() {
        let shard = shard_with(4, vec![voter(1, 1), voter(2, 2)]);
        let (mut sm, _) = new_sm(shard, 1);
        apply_v2(
            &mut sm,
            10,
            vec![change(ChangeType::AddLearnerNode, learner(2, 2))],
        )
        .unwrap();
        let shard = sm.shard();
        assert_eq!(shard.epoch.conf_ver, 5);
        assert_eq!(shard.replicas[1].role, ReplicaRole::Learner);
    }

    #[test]
    fn conf_ver_advances_by_successful_change_count_only() {
        let shard = shard_with(4, vec![voter(1, 1), learner(2, 2)]);
        let (mut sm, _) = new_sm(shard, 1);
        // success, reject, success: two bumps total.
        apply_v1(&mut sm, 10, change(ChangeType::AddNode, voter(2, 2)))
            .0
            .unwrap();
        apply_v1(&mut sm, 11, change(ChangeType::AddNode, voter(2, 2)))
            .0
            .unwrap_err();
        apply_v1(&mut sm, 12, change(ChangeType::AddLearnerNode, learner(5, 5)))
            .0
            .unwrap();
        assert_eq!(sm.shard().epoch.conf_ver, 6);
    }

    fn split_req(key: &[u8], shard_id: u64, replica_ids: &[u64]) -> SplitRequest {
        SplitRequest {
            split_key: key.to_vec(),
            new_shard_id: shard_id,
            new_replica_ids: replica_ids.to_vec(),
        }
    }

    fn split_shard() -> ShardDesc {
        ShardDesc {
            id: 10,
            start: b"a".to_vec(),
            end: b"z".to_vec(),
            epoch: Epoch {
                version: 1,
                conf_ver: 1,
            },
            // Deliberately unsorted to exercise the deterministic ordering.
            replicas: vec![voter(3, 3), voter(1, 1), voter(2, 2)],
            ..Default::default()
        }
    }

    fn exec_split(
        sm: &mut StateMachine,
        index: u64,
        reqs: Vec<SplitRequest>,
    ) -> anyhow::Result<ResponseBatch> {
        let mut outcome = ApplyOutcome::default();
        sm.do_exec_split(index, 1, &BatchSplitRequest { requests: reqs }, &mut outcome)
    }

    #[test]
    fn batch_split_reshapes_ranges_and_assigns_replicas() {
        let (mut sm, store) = new_sm(split_shard(), 1);
        exec_split(
            &mut sm,
            20,
            vec![
                split_req(b"m", 11, &[101, 102, 103]),
                split_req(b"s", 12, &[201, 202, 203]),
            ],
        )
        .unwrap();

        let derived = sm.shard();
        assert_eq!(derived.start, b"a".to_vec());
        assert_eq!(derived.end, b"m".to_vec());
        assert_eq!(derived.epoch.version, 3);

        let left = store.shard_local_state(11).unwrap().unwrap().shard;
        assert_eq!(left.start, b"m".to_vec());
        assert_eq!(left.end, b"s".to_vec());
        assert_eq!(left.epoch.version, 3);
        let expected: Vec<(u64, u64)> = vec![(101, 1), (102, 2), (103, 3)];
        let got: Vec<(u64, u64)> = left
            .replicas
            .iter()
            .map(|r| (r.id, r.container_id))
            .collect();
        assert_eq!(got, expected);

        let right = store.shard_local_state(12).unwrap().unwrap().shard;
        assert_eq!(right.start, b"s".to_vec());
        assert_eq!(right.end, b"z".to_vec());
        let got: Vec<(u64, u64)> = right
            .replicas
            .iter()
            .map(|r| (r.id, r.container_id))
            .collect();
        assert_eq!(got, vec![(201, 1), (202, 2), (203, 3)]);

        // The derived record is persisted with the apply index.
        assert_eq!(store.persistent_log_index(10).unwrap(), 20);

        // The union of ranges equals the original and they are contiguous.
        assert_eq!(derived.end, left.start);
        assert_eq!(left.end, right.start);
        assert_eq!(right.end, b"z".to_vec());
    }

    #[test]
    fn split_is_deterministic_across_peers() {
        let reqs = vec![
            split_req(b"m", 11, &[101, 102, 103]),
            split_req(b"s", 12, &[201, 202, 203]),
        ];
        let mut results = Vec::new();
        for replica_id in [1u64, 2, 3] {
            let (mut sm, store) = new_sm(split_shard(), replica_id);
            exec_split(&mut sm, 20, reqs.clone()).unwrap();
            let left = store.shard_local_state(11).unwrap().unwrap();
            let right = store.shard_local_state(12).unwrap().unwrap();
            results.push((sm.shard(), left, right));
        }
        assert_eq!(results[0], results[1]);
        assert_eq!(results[1], results[2]);
    }

    #[test]
    fn split_rejects_boundary_and_malformed_keys() {
        let (mut sm, _) = new_sm(split_shard(), 1);
        let before = sm.shard();

        // Key equal to the shard start.
        assert!(exec_split(&mut sm, 20, vec![split_req(b"a", 11, &[1, 2, 3])]).is_err());
        // Key equal to the shard end (end-exclusive).
        assert!(exec_split(&mut sm, 21, vec![split_req(b"z", 11, &[1, 2, 3])]).is_err());
        // Empty key.
        assert!(exec_split(&mut sm, 22, vec![split_req(b"", 11, &[1, 2, 3])]).is_err());
        // Out-of-order keys.
        assert!(exec_split(
            &mut sm,
            23,
            vec![
                split_req(b"s", 11, &[1, 2, 3]),
                split_req(b"m", 12, &[4, 5, 6])
            ]
        )
        .is_err());
        // Mismatched replica id count.
        assert!(exec_split(&mut sm, 24, vec![split_req(b"m", 11, &[1])]).is_err());
        // Empty request list.
        assert!(exec_split(&mut sm, 25, Vec::new()).is_err());

        assert_eq!(sm.shard(), before);
    }

    fn write_batch(id: u64, shard: &ShardDesc, pairs: &[(&[u8], &[u8])]) -> RequestBatch {
        RequestBatch {
            header: RequestHeader {
                id,
                shard_id: shard.id,
                epoch: shard.epoch,
            },
            requests: pairs
                .iter()
                .enumerate()
                .map(|(i, (k, v))| Request {
                    id: i as u64,
                    cmd_type: CmdType::Write,
                    key: k.to_vec(),
                    cmd: v.to_vec(),
                })
                .collect(),
            admin: None,
        }
    }

    fn normal_entry(index: u64, term: u64, batch: &RequestBatch) -> Entry {
        let mut e = Entry::default();
        e.set_entry_type(EntryType::EntryNormal);
        e.set_index(index);
        e.set_term(term);
        e.set_data(batch.encode().into());
        e
    }

    #[test]
    fn writes_apply_in_order_and_respond_once() {
        let shard = shard_with(1, vec![voter(1, 1)]);
        let (mut sm, store) = new_sm(shard.clone(), 1);
        let entries = vec![
            normal_entry(1, 1, &write_batch(1, &shard, &[(b"k1", b"v1")])),
            normal_entry(2, 1, &write_batch(2, &shard, &[(b"k1", b"v2"), (b"k2", b"v")])),
        ];
        let outcomes = sm.apply_committed(&entries);
        assert_eq!(outcomes.len(), 2);
        assert_eq!(outcomes[0].resp.as_ref().unwrap().responses.len(), 1);
        assert_eq!(outcomes[1].resp.as_ref().unwrap().responses.len(), 2);
        assert_eq!(store.get(b"k1"), Some(b"v2".to_vec()));
        assert_eq!(sm.applied_index(), 2);
        assert_eq!(store.persistent_log_index(1).unwrap(), 2);

        // Replaying already-applied entries produces no effects.
        let replay = sm.apply_committed(&entries);
        assert!(replay.iter().all(|o| o.resp.is_none()));
        assert_eq!(sm.applied_index(), 2);
    }

    #[test]
    fn stale_epoch_write_is_rejected_with_current_shard() {
        let shard = shard_with(1, vec![voter(1, 1)]);
        let (mut sm, store) = new_sm(shard.clone(), 1);
        let mut batch = write_batch(7, &shard, &[(b"k", b"v")]);
        batch.header.epoch.version += 1;
        let outcomes = sm.apply_committed(&[normal_entry(1, 1, &batch)]);
        let resp = outcomes[0].resp.as_ref().unwrap();
        assert!(matches!(
            resp.header.error,
            Some(RespError::StaleEpoch { .. })
        ));
        assert_eq!(store.get(b"k"), None);
        // The entry is still consumed.
        assert_eq!(sm.applied_index(), 1);
    }

    #[test]
    fn entries_after_pending_remove_are_skipped() {
        let shard = shard_with(4, vec![voter(1, 1), voter(2, 2)]);
        let (mut sm, store) = new_sm(shard.clone(), 2);
        apply_v1(&mut sm, 5, change(ChangeType::RemoveNode, voter(2, 2)))
            .0
            .unwrap();
        sm.applied_index = 5;
        assert!(sm.is_pending_remove());

        let entries = vec![normal_entry(6, 1, &write_batch(1, &sm.shard(), &[(b"k", b"v")]))];
        let outcomes = sm.apply_committed(&entries);
        assert!(outcomes[0].resp.is_none());
        assert_eq!(store.get(b"k"), None);
        assert_eq!(sm.applied_index(), 6);
    }

    #[test]
    fn replaying_the_log_from_scratch_is_idempotent() {
        let shard = shard_with(1, vec![voter(1, 1)]);
        let entries = vec![
            normal_entry(1, 1, &write_batch(1, &shard, &[(b"a", b"1")])),
            normal_entry(2, 1, &write_batch(2, &shard, &[(b"b", b"2")])),
            normal_entry(3, 1, &write_batch(3, &shard, &[(b"a", b"3")])),
        ];

        let (mut sm1, store1) = new_sm(shard.clone(), 1);
        sm1.apply_committed(&entries);
        let state1 = store1.shard_local_state(1).unwrap();

        // A second replica replaying the same log lands on identical state.
        let (mut sm2, store2) = new_sm(shard, 1);
        sm2.apply_committed(&entries);
        assert_eq!(store2.shard_local_state(1).unwrap(), state1);
        assert_eq!(store2.get(b"a"), store1.get(b"a"));
        assert_eq!(sm1.shard(), sm2.shard());
    }

    #[test]
    fn compact_log_admin_emits_follow_up() {
        let shard = shard_with(1, vec![voter(1, 1)]);
        let (mut sm, _) = new_sm(shard.clone(), 1);
        let batch = RequestBatch::admin(
            9,
            shard.id,
            shard.epoch,
            AdminRequest::CompactLog(CompactLogRequest { compact_index: 33 }),
        );
        let outcomes = sm.apply_committed(&[normal_entry(1, 1, &batch)]);
        assert!(matches!(
            outcomes[0].admin,
            Some(AdminExecResult::CompactLog { index: 33 })
        ));
        assert!(!outcomes[0].resp.as_ref().unwrap().is_error());
    }
}

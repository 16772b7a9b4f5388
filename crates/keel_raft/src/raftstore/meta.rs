//! Shard metadata model.
//!
//! These types are the replicated, persisted description of a shard: its key
//! range, its epoch and its consensus-group members. They are kept in a
//! small, dependency-light module because they are shared by the event loop,
//! the apply state machine and the storage adapters.

use raft::eraftpb::{ConfState, Message, MessageType};
use serde::{Deserialize, Serialize};

/// Logical identifier for a shard (one replicated key range).
pub type ShardId = u64;
/// Identifier of one replica within a shard's consensus group.
pub type ReplicaId = u64;
/// Identifier of the container (host process/store) a replica lives on.
pub type ContainerId = u64;
/// Shard group, used to co-locate shards that share a storage group.
pub type GroupId = u64;

/// Shard epoch. `version` advances on splits, `conf_ver` on membership
/// changes; stale messages and requests are rejected by comparing epochs.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Epoch {
    pub version: u64,
    pub conf_ver: u64,
}

/// Role of a replica inside the consensus group. The joint-consensus roles
/// only exist while the shard is transitioning between voter sets.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReplicaRole {
    #[default]
    Voter,
    Learner,
    IncomingVoter,
    DemotingVoter,
}

/// One member of a shard's consensus group.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplicaDesc {
    pub id: ReplicaId,
    pub container_id: ContainerId,
    pub role: ReplicaRole,
}

impl ReplicaDesc {
    pub fn new(id: ReplicaId, container_id: ContainerId) -> Self {
        Self {
            id,
            container_id,
            role: ReplicaRole::Voter,
        }
    }

    pub fn learner(id: ReplicaId, container_id: ContainerId) -> Self {
        Self {
            id,
            container_id,
            role: ReplicaRole::Learner,
        }
    }

    pub fn in_joint(&self) -> bool {
        matches!(
            self.role,
            ReplicaRole::IncomingVoter | ReplicaRole::DemotingVoter
        )
    }
}

/// Shard (range) descriptor. Key ranges are lexicographic and end-exclusive.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShardDesc {
    pub id: ShardId,
    pub group: GroupId,
    pub start: Vec<u8>,
    pub end: Vec<u8>,
    pub epoch: Epoch,
    pub replicas: Vec<ReplicaDesc>,
    pub unique: String,
    pub rule_groups: Vec<String>,
    pub disable_split: bool,
}

impl ShardDesc {
    pub fn find_replica(&self, container_id: ContainerId) -> Option<&ReplicaDesc> {
        self.replicas.iter().find(|r| r.container_id == container_id)
    }

    pub fn find_replica_mut(&mut self, container_id: ContainerId) -> Option<&mut ReplicaDesc> {
        self.replicas
            .iter_mut()
            .find(|r| r.container_id == container_id)
    }

    pub fn replica_by_id(&self, id: ReplicaId) -> Option<&ReplicaDesc> {
        self.replicas.iter().find(|r| r.id == id)
    }

    /// Remove the replica hosted on `container_id`, returning it if present.
    pub fn remove_replica(&mut self, container_id: ContainerId) -> Option<ReplicaDesc> {
        let idx = self
            .replicas
            .iter()
            .position(|r| r.container_id == container_id)?;
        Some(self.replicas.remove(idx))
    }

    pub fn contains_key(&self, key: &[u8]) -> bool {
        key >= self.start.as_slice() && (self.end.is_empty() || key < self.end.as_slice())
    }

    /// Whether this shard's range overlaps `[start, end)`.
    pub fn overlaps(&self, start: &[u8], end: &[u8]) -> bool {
        let upper_ok = end.is_empty() || self.start.as_slice() < end;
        let lower_ok = self.end.is_empty() || start < self.end.as_slice();
        upper_ok && lower_ok
    }

    /// Build the raft configuration state from the replica roles. Incoming
    /// voters count as voters; demoting voters stay in the outgoing set and
    /// become learners once the joint state is left.
    pub fn conf_state(&self) -> ConfState {
        let mut cs = ConfState::default();
        for r in &self.replicas {
            match r.role {
                ReplicaRole::Voter | ReplicaRole::IncomingVoter => cs.mut_voters().push(r.id),
                ReplicaRole::Learner => cs.mut_learners().push(r.id),
                ReplicaRole::DemotingVoter => {
                    cs.mut_voters_outgoing().push(r.id);
                    cs.mut_learners_next().push(r.id);
                }
            }
        }
        cs
    }
}

/// Persisted lifecycle state of the local replica. `Tombstone` is terminal.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReplicaState {
    #[default]
    Normal,
    Applying,
    Tombstone,
}

/// The record persisted through the data store for every metadata mutation,
/// written atomically together with the log index that produced it.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShardLocalState {
    pub state: ReplicaState,
    pub shard: ShardDesc,
}

impl ShardLocalState {
    pub fn encode(&self) -> Vec<u8> {
        serde_json::to_vec(self).expect("shard local state is always serializable")
    }

    pub fn decode(data: &[u8]) -> anyhow::Result<Self> {
        Ok(serde_json::from_slice(data)?)
    }
}

/// Payload carried in every snapshot record. Dummy snapshots exist only to
/// anchor the log reader's base position after compaction and must never be
/// applied over live data; real snapshots carry the shard state inline.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotInfo {
    pub dummy: bool,
    pub shard: Option<ShardLocalState>,
}

impl SnapshotInfo {
    pub fn dummy() -> Self {
        Self {
            dummy: true,
            shard: None,
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        serde_json::to_vec(self).expect("snapshot info is always serializable")
    }

    pub fn decode(data: &[u8]) -> anyhow::Result<Self> {
        Ok(serde_json::from_slice(data)?)
    }
}

/// Framed raft message exchanged between replicas. The shard epoch and range
/// travel with the message so receivers can reject stale traffic and decide
/// whether a local replica may be created for an unknown shard.
#[derive(Clone, Debug, Default)]
pub struct RaftMessage {
    pub shard_id: ShardId,
    pub group: GroupId,
    pub from: ReplicaDesc,
    pub to: ReplicaDesc,
    pub shard_epoch: Epoch,
    pub start: Vec<u8>,
    pub end: Vec<u8>,
    pub is_tombstone: bool,
    pub commit_index: u64,
    pub message: Message,
}

/// Whether a message may cause a local replica to be created for a shard we
/// do not host yet. Only election traffic qualifies; append, heartbeat and
/// snapshot messages always target an already-created replica.
pub fn is_creation_eligible(msg: &Message) -> bool {
    matches!(
        msg.get_msg_type(),
        MessageType::MsgRequestVote | MessageType::MsgRequestPreVote
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn shard(start: &[u8], end: &[u8]) -> ShardDesc {
        ShardDesc {
            id: 1,
            start: start.to_vec(),
            end: end.to_vec(),
            replicas: vec![ReplicaDesc::new(1, 1), ReplicaDesc::learner(2, 2)],
            ..Default::default()
        }
    }

    #[test]
    fn key_containment_is_end_exclusive() {
        let s = shard(b"a", b"m");
        assert!(s.contains_key(b"a"));
        assert!(s.contains_key(b"l"));
        assert!(!s.contains_key(b"m"));
        assert!(!s.contains_key(b"z"));
    }

    #[test]
    fn range_overlap() {
        let s = shard(b"b", b"d");
        assert!(s.overlaps(b"a", b"c"));
        assert!(s.overlaps(b"c", b"z"));
        assert!(!s.overlaps(b"d", b"z"));
        assert!(!s.overlaps(b"a", b"b"));
        // Unbounded end overlaps everything at or after the start.
        let open = shard(b"b", b"");
        assert!(open.overlaps(b"y", b"z"));
    }

    #[test]
    fn creation_eligibility_excludes_append_and_heartbeat() {
        let mut msg = Message::default();
        msg.set_msg_type(MessageType::MsgRequestVote);
        assert!(is_creation_eligible(&msg));
        msg.set_msg_type(MessageType::MsgRequestPreVote);
        assert!(is_creation_eligible(&msg));
        msg.set_msg_type(MessageType::MsgAppend);
        assert!(!is_creation_eligible(&msg));
        msg.set_msg_type(MessageType::MsgHeartbeat);
        assert!(!is_creation_eligible(&msg));
        msg.set_msg_type(MessageType::MsgSnapshot);
        assert!(!is_creation_eligible(&msg));
    }

    #[test]
    fn shard_local_state_round_trip() {
        let state = ShardLocalState {
            state: ReplicaState::Normal,
            shard: shard(b"a", b"z"),
        };
        let decoded = ShardLocalState::decode(&state.encode()).unwrap();
        assert_eq!(state, decoded);
    }

    #[test]
    fn conf_state_maps_joint_roles() {
        let mut s = shard(b"a", b"z");
        s.replicas.push(ReplicaDesc {
            id: 3,
            container_id: 3,
            role: ReplicaRole::IncomingVoter,
        });
        s.replicas.push(ReplicaDesc {
            id: 4,
            container_id: 4,
            role: ReplicaRole::DemotingVoter,
        });
        let cs = s.conf_state();
        assert_eq!(cs.get_voters(), &[1, 3]);
        assert_eq!(cs.get_learners(), &[2]);
        assert_eq!(cs.get_voters_outgoing(), &[4]);
        assert_eq!(cs.get_learners_next(), &[4]);
    }
}

//! Replicated request/response contracts.
//!
//! Requests are proposed through the raft log as opaque bytes and decoded
//! again at apply time, so every peer must decode the same payload the same
//! way. The admin command set is a closed enum: membership changes, batch
//! splits and log compaction.

use serde::{Deserialize, Serialize};

use super::meta::{Epoch, ReplicaDesc, ReplicaId, ShardDesc, ShardId};

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum CmdType {
    #[default]
    Write,
    Read,
}

/// One user sub-request inside a batch.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Request {
    pub id: u64,
    pub cmd_type: CmdType,
    pub key: Vec<u8>,
    pub cmd: Vec<u8>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestHeader {
    pub id: u64,
    pub shard_id: ShardId,
    pub epoch: Epoch,
}

/// The unit of replication: either a batch of user writes or exactly one
/// admin command, never both.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestBatch {
    pub header: RequestHeader,
    pub requests: Vec<Request>,
    pub admin: Option<AdminRequest>,
}

impl RequestBatch {
    pub fn admin(id: u64, shard_id: ShardId, epoch: Epoch, admin: AdminRequest) -> Self {
        Self {
            header: RequestHeader {
                id,
                shard_id,
                epoch,
            },
            requests: Vec::new(),
            admin: Some(admin),
        }
    }

    pub fn is_admin(&self) -> bool {
        self.admin.is_some()
    }

    pub fn encode(&self) -> Vec<u8> {
        serde_json::to_vec(self).expect("request batch is always serializable")
    }

    pub fn decode(data: &[u8]) -> anyhow::Result<Self> {
        Ok(serde_json::from_slice(data)?)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChangeType {
    AddNode,
    RemoveNode,
    AddLearnerNode,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfigChangeRequest {
    pub change_type: ChangeType,
    pub replica: ReplicaDesc,
}

/// Joint-consensus change set. An empty change set means leave-joint.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfigChangeV2Request {
    pub changes: Vec<ConfigChangeRequest>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SplitRequest {
    pub split_key: Vec<u8>,
    pub new_shard_id: ShardId,
    pub new_replica_ids: Vec<ReplicaId>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchSplitRequest {
    pub requests: Vec<SplitRequest>,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompactLogRequest {
    pub compact_index: u64,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum AdminRequest {
    ConfigChange(ConfigChangeRequest),
    ConfigChangeV2(ConfigChangeV2Request),
    BatchSplit(BatchSplitRequest),
    CompactLog(CompactLogRequest),
}

/// Errors surfaced to the proposer through the response header. These are
/// routing/rejection outcomes, not process failures.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum RespError {
    /// The replica is gone or the shard does not live on this store.
    StoreNotMatch,
    /// The proposal was superseded before it could be applied.
    StaleCommand,
    /// The request epoch does not match the shard epoch; carries the current
    /// shard so the client can refresh its routing.
    StaleEpoch { current: ShardDesc },
    /// This replica is not the leader.
    NotLeader {
        shard_id: ShardId,
        leader: Option<ReplicaDesc>,
    },
    Other(String),
}

impl std::fmt::Display for RespError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RespError::StoreNotMatch => write!(f, "store not match"),
            RespError::StaleCommand => write!(f, "stale command"),
            RespError::StaleEpoch { current } => {
                write!(
                    f,
                    "stale epoch, current version {} conf_ver {}",
                    current.epoch.version, current.epoch.conf_ver
                )
            }
            RespError::NotLeader { shard_id, .. } => {
                write!(f, "shard {shard_id} not leader on this replica")
            }
            RespError::Other(msg) => write!(f, "{msg}"),
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Response {
    pub id: u64,
    pub value: Vec<u8>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResponseHeader {
    pub id: u64,
    pub error: Option<RespError>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfigChangeResponse {
    pub shard: ShardDesc,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchSplitResponse {
    pub shards: Vec<ShardDesc>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum AdminResponse {
    ConfigChange(ConfigChangeResponse),
    BatchSplit(BatchSplitResponse),
    CompactLog,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResponseBatch {
    pub header: ResponseHeader,
    pub responses: Vec<Response>,
    pub admin: Option<AdminResponse>,
}

impl ResponseBatch {
    pub fn error(id: u64, err: RespError) -> Self {
        Self {
            header: ResponseHeader {
                id,
                error: Some(err),
            },
            responses: Vec::new(),
            admin: None,
        }
    }

    pub fn admin(id: u64, admin: AdminResponse) -> Self {
        Self {
            header: ResponseHeader { id, error: None },
            responses: Vec::new(),
            admin: Some(admin),
        }
    }

    pub fn is_error(&self) -> bool {
        self.header.error.is_some()
    }
}

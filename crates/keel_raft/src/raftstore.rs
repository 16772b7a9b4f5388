//! Raftstore module wiring.
//!
//! `replica` contains the per-shard event loop and its queues, `apply` holds
//! the deterministic state machine for committed entries, `meta` and `rpc`
//! define the shard metadata model and the replicated request/response
//! contracts, and `storage` defines the log/data store trait seams together
//! with in-memory implementations used by tests and embedded hosts.

mod apply;
mod log_reader;
mod meta;
mod queue;
mod replica;
mod rpc;
mod storage;
mod store;

pub use apply::{AdminExecResult, ApplyMetrics, ApplyOutcome, ParsedConfChange, StateMachine};
pub use log_reader::LogReader;
pub use meta::{
    is_creation_eligible, ContainerId, Epoch, GroupId, RaftMessage, ReplicaDesc, ReplicaId,
    ReplicaRole, ReplicaState, ShardDesc, ShardId, ShardLocalState, SnapshotInfo,
};
pub use queue::{EventQueue, PutError};
pub use replica::{
    Action, AllocatedSplitId, DownReplica, LogCheckCallback, NoopPlacementClient,
    NoopStoreEventHandler, NoopTransport, PlacementClient, RaftConfig, RaftTransport, Replica,
    ReplicaHandle, ReplicaStats, ResourceHeartbeatReq, ShardStats, SnapshotStatusReport,
    SplitCheckData, StoreEventHandler,
};
pub use rpc::{
    AdminRequest, AdminResponse, BatchSplitRequest, BatchSplitResponse, ChangeType, CmdType,
    CompactLogRequest, ConfigChangeRequest, ConfigChangeResponse, ConfigChangeV2Request, Request,
    RequestBatch, RequestHeader, RespError, Response, ResponseBatch, ResponseHeader, SplitRequest,
};
pub use storage::{
    DataStore, LogStore, MemDataStore, MemLogStore, RaftLocalState, SavedRaftState, ShardMetadata,
    SplitCheckResult, WorkerContext, WriteContext,
};
pub use store::{RouteOutcome, Store};

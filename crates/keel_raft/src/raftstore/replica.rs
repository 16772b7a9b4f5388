//! Per-shard replica: event loop, action dispatch, compaction and lifecycle.
//!
//! Each replica owns its consensus module, its queues and its apply state
//! machine, and runs as a single cooperative task. External components talk
//! to it exclusively through `ReplicaHandle`: enqueue, then wake the worker
//! once via the idempotent notify. One `handle_event` iteration drains the
//! queues in a fixed order (initialization, messages, ticks, feedback,
//! snapshot status, requests, consensus ready, actions); that order is part
//! of the contract.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};

use anyhow::Context;
use async_trait::async_trait;
use raft::eraftpb::{
    ConfChange, ConfChangeSingle, ConfChangeTransition, ConfChangeType, ConfChangeV2, Entry,
    Message, Snapshot,
};
use raft::{ProgressState, SnapshotStatus, StateRole, Storage as _, StorageError};
use serde::{Deserialize, Serialize};
use tokio::sync::{oneshot, Notify};

use super::apply::{AdminExecResult, ApplyMetrics, ParsedConfChange, StateMachine};
use super::log_reader::LogReader;
use super::meta::{
    Epoch, GroupId, RaftMessage, ReplicaDesc, ReplicaId, ShardDesc, ShardId, SnapshotInfo,
};
use super::queue::EventQueue;
use super::rpc::{
    AdminRequest, BatchSplitRequest, ChangeType, CmdType, CompactLogRequest, RequestBatch,
    RespError, ResponseBatch, SplitRequest,
};
use super::storage::{DataStore, LogStore, SavedRaftState, WorkerContext};

const READY_BATCH_SIZE: usize = 1024;

/// Tuning knobs for the replica engine. One config is shared by every
/// replica hosted in the process.
#[derive(Clone, Debug)]
pub struct RaftConfig {
    pub tick_interval: Duration,
    pub election_ticks: usize,
    pub heartbeat_ticks: usize,
    pub max_size_per_msg: u64,
    pub max_inflight_msgs: usize,
    /// Minimum replicated-but-uncompacted entries before compaction is
    /// worth proposing.
    pub compact_threshold: u64,
    /// Applied-entry count that forces compaction even when followers lag.
    pub force_compact_count: u64,
    /// Log size hint that forces compaction even when followers lag.
    pub force_compact_bytes: u64,
    /// Accumulated write delta that triggers a split check sweep.
    pub shard_split_check_diff: u64,
    /// Target size of each range produced by a split.
    pub shard_split_size: u64,
    /// Silence after which a peer is reported down to the placement driver.
    pub max_peer_down_duration: Duration,
    pub request_queue_capacity: usize,
    pub event_queue_capacity: usize,
}

impl Default for RaftConfig {
    fn default() -> Self {
        Self {
            tick_interval: Duration::from_millis(100),
            election_ticks: 10,
            heartbeat_ticks: 2,
            max_size_per_msg: 8 * 1024 * 1024,
            max_inflight_msgs: 256,
            compact_threshold: 256,
            force_compact_count: 8192,
            force_compact_bytes: 64 * 1024 * 1024,
            shard_split_check_diff: 8 * 1024 * 1024,
            shard_split_size: 96 * 1024 * 1024,
            max_peer_down_duration: Duration::from_secs(300),
            request_queue_capacity: 1024,
            event_queue_capacity: 4096,
        }
    }
}

/// Outbound raft message sink. Transport and routing live outside the
/// engine; implementations are free to drop messages.
pub trait RaftTransport: Send + Sync + 'static {
    fn send(&self, msg: RaftMessage);
}

/// Transport that drops everything, for single-replica hosts and tests.
pub struct NoopTransport;

impl RaftTransport for NoopTransport {
    fn send(&self, _msg: RaftMessage) {}
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShardStats {
    pub written_bytes: u64,
    pub written_keys: u64,
    pub read_bytes: u64,
    pub read_keys: u64,
    pub approximate_size: u64,
    pub approximate_keys: u64,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DownReplica {
    pub replica: ReplicaDesc,
    pub down_seconds: u64,
}

/// Heartbeat payload submitted to the placement driver by the leader.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ResourceHeartbeatReq {
    pub term: u64,
    pub leader: ReplicaDesc,
    pub container_id: u64,
    pub down_replicas: Vec<DownReplica>,
    pub pending_replicas: Vec<ReplicaDesc>,
    pub stats: ShardStats,
    pub group_key: String,
}

/// Shard id plus replica ids allocated by the placement driver for one new
/// shard produced by a split.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AllocatedSplitId {
    pub new_shard_id: ShardId,
    pub new_replica_ids: Vec<ReplicaId>,
}

/// Client of the external placement driver.
#[async_trait]
pub trait PlacementClient: Send + Sync + 'static {
    async fn resource_heartbeat(
        &self,
        shard: ShardDesc,
        req: ResourceHeartbeatReq,
    ) -> anyhow::Result<()>;

    async fn ask_batch_split(
        &self,
        shard: ShardDesc,
        count: u32,
    ) -> anyhow::Result<Vec<AllocatedSplitId>>;
}

/// Placement client for hosts that run without a placement driver.
pub struct NoopPlacementClient;

#[async_trait]
impl PlacementClient for NoopPlacementClient {
    async fn resource_heartbeat(
        &self,
        _shard: ShardDesc,
        _req: ResourceHeartbeatReq,
    ) -> anyhow::Result<()> {
        Ok(())
    }

    async fn ask_batch_split(
        &self,
        _shard: ShardDesc,
        _count: u32,
    ) -> anyhow::Result<Vec<AllocatedSplitId>> {
        anyhow::bail!("no placement driver configured")
    }
}

/// Store-level notifications emitted by the replica: new shards derived from
/// a split, and the local replica observing its own removal.
pub trait StoreEventHandler: Send + Sync + 'static {
    fn on_split(&self, _derived: ShardDesc, _new_shards: Vec<ShardDesc>) {}
    fn on_replica_removed(&self, _shard_id: ShardId, _replica: ReplicaDesc) {}
}

pub struct NoopStoreEventHandler;

impl StoreEventHandler for NoopStoreEventHandler {}

/// Delivery report for an outbound snapshot, fed back into consensus.
#[derive(Clone, Copy, Debug)]
pub struct SnapshotStatusReport {
    pub to: ReplicaId,
    pub rejected: bool,
}

/// Split candidate produced by a split check, pinned to the epoch the check
/// ran against so a concurrent split or conf change invalidates it.
#[derive(Clone, Debug)]
pub struct SplitCheckData {
    pub keys: u64,
    pub size: u64,
    pub split_keys: Vec<Vec<u8>>,
    pub split_ids: Vec<AllocatedSplitId>,
    pub epoch: Epoch,
}

pub type LogCheckCallback = Box<dyn FnOnce(anyhow::Result<u64>) + Send + 'static>;

/// Administrative work dispatched on the replica worker.
pub enum Action {
    Campaign,
    CheckSplit,
    RequestSplit(SplitCheckData),
    Heartbeat,
    UpdateReadMetrics { read_bytes: u64, read_keys: u64 },
    CheckLogCommitted { target: u64, epoch: Epoch, cb: LogCheckCallback },
    CheckLogApplied { target: u64, epoch: Epoch, cb: LogCheckCallback },
    CheckCompactLog,
    LogCompaction { index: u64 },
    SnapshotCompaction { snapshot: Snapshot, persistent_log_index: u64 },
}

impl std::fmt::Debug for Action {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Action::Campaign => "campaign",
            Action::CheckSplit => "check-split",
            Action::RequestSplit(_) => "request-split",
            Action::Heartbeat => "heartbeat",
            Action::UpdateReadMetrics { .. } => "update-read-metrics",
            Action::CheckLogCommitted { .. } => "check-log-committed",
            Action::CheckLogApplied { .. } => "check-log-applied",
            Action::CheckCompactLog => "check-compact-log",
            Action::LogCompaction { .. } => "log-compaction",
            Action::SnapshotCompaction { .. } => "snapshot-compaction",
        };
        f.write_str(name)
    }
}

/// Accumulated per-replica counters, reported with heartbeats.
#[derive(Clone, Copy, Debug, Default)]
pub struct ReplicaStats {
    pub written_bytes: u64,
    pub written_keys: u64,
    pub read_bytes: u64,
    pub read_keys: u64,
    pub approximate_size: u64,
    pub approximate_keys: u64,
    pub size_diff_hint: u64,
    pub raft_log_size_hint: u64,
}

impl ReplicaStats {
    pub fn heartbeat_state(&self) -> ShardStats {
        ShardStats {
            written_bytes: self.written_bytes,
            written_keys: self.written_keys,
            read_bytes: self.read_bytes,
            read_keys: self.read_keys,
            approximate_size: self.approximate_size,
            approximate_keys: self.approximate_keys,
        }
    }

    fn flush(&self, shard_id: ShardId) {
        tracing::debug!(
            shard = shard_id,
            written_bytes = self.written_bytes,
            written_keys = self.written_keys,
            approximate_size = self.approximate_size,
            "replica stats"
        );
    }
}

struct ReqCtx {
    batch: RequestBatch,
    tx: Option<oneshot::Sender<ResponseBatch>>,
}

impl ReqCtx {
    fn respond_err(self, err: RespError) {
        let id = self.batch.header.id;
        if let Some(tx) = self.tx {
            let _ = tx.send(ResponseBatch::error(id, err));
        }
    }
}

struct Proposal {
    index: u64,
    term: u64,
    batch_id: u64,
    tx: Option<oneshot::Sender<ResponseBatch>>,
}

impl Proposal {
    fn respond(self, resp: ResponseBatch) {
        if let Some(tx) = self.tx {
            let _ = tx.send(resp);
        }
    }

    fn respond_err(self, err: RespError) {
        let id = self.batch_id;
        self.respond(ResponseBatch::error(id, err));
    }
}

struct ReplicaQueues {
    requests: EventQueue<ReqCtx>,
    messages: EventQueue<RaftMessage>,
    ticks: EventQueue<()>,
    feedbacks: EventQueue<ReplicaId>,
    snapshot_status: EventQueue<SnapshotStatusReport>,
    actions: EventQueue<Action>,
}

/// Cloneable enqueue surface shared with the host store and transports.
#[derive(Clone)]
pub struct ReplicaHandle {
    shard_id: ShardId,
    replica_id: ReplicaId,
    queues: Arc<ReplicaQueues>,
    notify: Arc<Notify>,
    closed: Arc<AtomicBool>,
    unloaded: Arc<AtomicBool>,
    shard: Arc<RwLock<ShardDesc>>,
    leader_id: Arc<AtomicU64>,
    size_diff_hint: Arc<AtomicU64>,
    tick_total: Arc<AtomicU64>,
}

impl ReplicaHandle {
    pub fn shard_id(&self) -> ShardId {
        self.shard_id
    }

    pub fn replica_id(&self) -> ReplicaId {
        self.replica_id
    }

    pub fn shard(&self) -> ShardDesc {
        self.shard.read().unwrap().clone()
    }

    pub fn is_leader(&self) -> bool {
        self.leader_id.load(Ordering::Acquire) == self.replica_id
    }

    pub fn leader_id(&self) -> ReplicaId {
        self.leader_id.load(Ordering::Acquire)
    }

    pub fn size_diff_hint(&self) -> u64 {
        self.size_diff_hint.load(Ordering::Acquire)
    }

    pub fn is_unloaded(&self) -> bool {
        self.unloaded.load(Ordering::Acquire)
    }

    /// Submit a proposal. Back-pressure is surfaced to the caller: a full
    /// queue is an error, unlike the log-and-drop queues below.
    pub fn add_request(
        &self,
        batch: RequestBatch,
    ) -> anyhow::Result<oneshot::Receiver<ResponseBatch>> {
        let (tx, rx) = oneshot::channel();
        self.queues
            .requests
            .put(ReqCtx {
                batch,
                tx: Some(tx),
            })
            .map_err(|_| anyhow::anyhow!("shard {} request queue is busy", self.shard_id))?;
        self.notify.notify_one();
        Ok(rx)
    }

    pub fn add_message(&self, msg: RaftMessage) {
        if self.queues.messages.put(msg).is_err() {
            tracing::info!(shard = self.shard_id, "raft step stopped");
            return;
        }
        self.notify.notify_one();
    }

    pub fn add_feedback(&self, replica_id: ReplicaId) {
        if self.queues.feedbacks.put(replica_id).is_err() {
            tracing::info!(shard = self.shard_id, "raft feedback stopped");
        }
        self.notify.notify_one();
    }

    pub fn add_snapshot_status(&self, status: SnapshotStatusReport) {
        if self.queues.snapshot_status.put(status).is_err() {
            tracing::info!(shard = self.shard_id, "snapshot status stopped");
        }
        self.notify.notify_one();
    }

    pub fn add_action(&self, act: Action) {
        if self.queues.actions.put(act).is_err() {
            return;
        }
        self.notify.notify_one();
    }

    pub fn add_tick(&self) -> bool {
        if self.queues.ticks.put(()).is_err() {
            return false;
        }
        self.tick_total.fetch_add(1, Ordering::Relaxed);
        self.notify.notify_one();
        true
    }

    /// Signal the replica to drain and tear down. Idempotent.
    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.notify.notify_one();
    }
}

/// Decide the log index to compact to, or `None` to skip this round.
///
/// `min_match == 0` indicates an election or reconfiguration in progress.
/// One entry below the chosen index is always kept as a reference point.
fn select_compact_index(
    min_match: u64,
    applied_index: u64,
    first_index: u64,
    log_size_hint: u64,
    cfg: &RaftConfig,
) -> Option<u64> {
    if min_match == 0 {
        return None;
    }
    let mut compact_index = min_match;
    if min_match < first_index || min_match - first_index <= cfg.compact_threshold {
        compact_index = 0;
    }
    if compact_index == 0
        && applied_index > first_index
        && applied_index - first_index >= cfg.force_compact_count
    {
        compact_index = applied_index;
    } else if compact_index == 0 && log_size_hint >= cfg.force_compact_bytes {
        compact_index = applied_index;
    }
    if compact_index == 0 {
        return None;
    }
    compact_index -= 1;
    if compact_index < first_index {
        return None;
    }
    Some(compact_index)
}

/// Worker-owned replica state. Constructed with `new`, consumed by `start`.
pub struct Replica {
    cfg: RaftConfig,
    shard_id: ShardId,
    group: GroupId,
    replica: ReplicaDesc,
    queues: Arc<ReplicaQueues>,
    notify: Arc<Notify>,
    closed: Arc<AtomicBool>,
    unloaded: Arc<AtomicBool>,
    shard: Arc<RwLock<ShardDesc>>,
    leader_id: Arc<AtomicU64>,
    size_diff_hint: Arc<AtomicU64>,
    tick_total: Arc<AtomicU64>,
    tick_handled: u64,

    node: raft::RawNode<LogReader>,
    lr: LogReader,
    logdb: Arc<dyn LogStore>,
    data_store: Arc<dyn DataStore>,
    sm: StateMachine,
    transport: Arc<dyn RaftTransport>,
    placement: Arc<dyn PlacementClient>,
    events: Arc<dyn StoreEventHandler>,
    wc: WorkerContext,

    pending_proposals: VecDeque<Proposal>,
    pending_reads: VecDeque<ReqCtx>,
    committed_indexes: HashMap<ReplicaId, u64>,
    replica_heartbeats: HashMap<ReplicaId, Instant>,
    stats: ReplicaStats,

    initialized: bool,
    was_leader: bool,
    removal_reported: bool,
    pushed_index: u64,
    next_req_id: u64,
}

impl Replica {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        cfg: RaftConfig,
        shard: ShardDesc,
        replica_id: ReplicaId,
        logdb: Arc<dyn LogStore>,
        data_store: Arc<dyn DataStore>,
        transport: Arc<dyn RaftTransport>,
        placement: Arc<dyn PlacementClient>,
        events: Arc<dyn StoreEventHandler>,
    ) -> anyhow::Result<Replica> {
        // Prefer the persisted descriptor over the bootstrap one: after a
        // restart the data store carries the result of every applied change.
        let shard = match data_store.shard_local_state(shard.id)? {
            Some(state) if state.shard.epoch.conf_ver >= shard.epoch.conf_ver => state.shard,
            _ => shard,
        };
        let replica = shard
            .replica_by_id(replica_id)
            .cloned()
            .with_context(|| {
                format!("replica {replica_id} is not a member of shard {}", shard.id)
            })?;

        let lr = LogReader::new(&shard, replica_id, logdb.clone())?;
        let persistent_index = data_store.persistent_log_index(shard.id)?;
        let applied = persistent_index.max(lr.first_index_value().saturating_sub(1));

        let raft_cfg = raft::Config {
            id: replica_id,
            election_tick: cfg.election_ticks,
            heartbeat_tick: cfg.heartbeat_ticks,
            applied,
            max_size_per_msg: cfg.max_size_per_msg,
            max_inflight_msgs: cfg.max_inflight_msgs,
            pre_vote: true,
            ..Default::default()
        };
        raft_cfg.validate().context("invalid raft config")?;
        let logger = slog::Logger::root(slog::Discard, slog::o!());
        let node = raft::RawNode::new(&raft_cfg, lr.clone(), &logger)
            .context("create consensus module")?;

        let shard_id = shard.id;
        let group = shard.group;
        let shard = Arc::new(RwLock::new(shard));
        let sm = StateMachine::new(replica_id, shard.clone(), data_store.clone(), applied);
        let queues = Arc::new(ReplicaQueues {
            requests: EventQueue::new("requests", cfg.request_queue_capacity),
            messages: EventQueue::new("messages", cfg.event_queue_capacity),
            ticks: EventQueue::new("ticks", cfg.event_queue_capacity),
            feedbacks: EventQueue::new("feedbacks", cfg.event_queue_capacity),
            snapshot_status: EventQueue::new("snapshot-status", cfg.event_queue_capacity),
            actions: EventQueue::new("actions", cfg.event_queue_capacity),
        });
        let wc = logdb.new_worker_context();

        Ok(Replica {
            cfg,
            shard_id,
            group,
            replica,
            queues,
            notify: Arc::new(Notify::new()),
            closed: Arc::new(AtomicBool::new(false)),
            unloaded: Arc::new(AtomicBool::new(false)),
            shard,
            leader_id: Arc::new(AtomicU64::new(0)),
            size_diff_hint: Arc::new(AtomicU64::new(0)),
            tick_total: Arc::new(AtomicU64::new(0)),
            tick_handled: 0,
            node,
            lr,
            logdb,
            data_store,
            sm,
            transport,
            placement,
            events,
            wc,
            pending_proposals: VecDeque::new(),
            pending_reads: VecDeque::new(),
            committed_indexes: HashMap::new(),
            replica_heartbeats: HashMap::new(),
            stats: ReplicaStats::default(),
            initialized: false,
            was_leader: false,
            removal_reported: false,
            pushed_index: 0,
            next_req_id: 0,
        })
    }

    pub fn handle(&self) -> ReplicaHandle {
        ReplicaHandle {
            shard_id: self.shard_id,
            replica_id: self.replica.id,
            queues: self.queues.clone(),
            notify: self.notify.clone(),
            closed: self.closed.clone(),
            unloaded: self.unloaded.clone(),
            shard: self.shard.clone(),
            leader_id: self.leader_id.clone(),
            size_diff_hint: self.size_diff_hint.clone(),
            tick_total: self.tick_total.clone(),
        }
    }

    /// Spawn the event-loop worker and the tick generator, handing back the
    /// enqueue surface.
    pub fn start(self) -> ReplicaHandle {
        let handle = self.handle();
        let tick_handle = handle.clone();
        let tick_interval = self.cfg.tick_interval;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(tick_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                if !tick_handle.add_tick() {
                    tracing::info!(shard = tick_handle.shard_id(), "raft tick stopped");
                    return;
                }
            }
        });
        tokio::spawn(self.run());
        handle
    }

    async fn run(mut self) {
        loop {
            let has_event = match self.handle_event().await {
                Ok(has_event) => has_event,
                Err(err) => {
                    tracing::error!(
                        shard = self.shard_id,
                        error = ?err,
                        "replica event loop failed"
                    );
                    panic!("shard {} replica event loop failed: {err}", self.shard_id);
                }
            };
            if self.closed.load(Ordering::Acquire) && self.unloaded.load(Ordering::Acquire) {
                return;
            }
            if !has_event {
                self.notify.notified().await;
            }
        }
    }

    /// One cooperative iteration. Step order is fixed and load-bearing.
    async fn handle_event(&mut self) -> anyhow::Result<bool> {
        if self.closed.load(Ordering::Acquire) {
            if !self.unloaded.load(Ordering::Acquire) {
                self.shutdown();
                self.unloaded.store(true, Ordering::Release);
            }
            tracing::debug!(shard = self.shard_id, "skip handling events on stopped replica");
            return Ok(false);
        }

        if self.handle_initialized_state()? {
            return Ok(true);
        }
        let mut has_event = false;
        if self.handle_messages() {
            has_event = true;
        }
        if self.handle_ticks() {
            has_event = true;
        }
        if self.handle_feedbacks() {
            has_event = true;
        }
        if self.handle_snapshot_status() {
            has_event = true;
        }
        if self.handle_requests() {
            has_event = true;
        }
        if self.node.has_ready() {
            has_event = true;
            self.handle_raft_ready()?;
        }
        if self.handle_actions().await {
            has_event = true;
        }
        Ok(has_event)
    }

    /// Apply or discard the initial snapshot, once. A snapshot that is
    /// already covered by the data store keeps its log-store record so the
    /// log reader can establish its base position, but loses the disk image.
    fn handle_initialized_state(&mut self) -> anyhow::Result<bool> {
        if self.initialized {
            return Ok(false);
        }
        self.initialized = true;
        tracing::debug!(shard = self.shard_id, "checking initial snapshot");
        let Some(snapshot) = self.logdb.get_snapshot(self.shard_id)? else {
            tracing::info!(shard = self.shard_id, "no initial snapshot");
            return Ok(false);
        };
        let index = snapshot.get_metadata().get_index();
        if index == 0 {
            panic!("shard {} unexpected empty snapshot", self.shard_id);
        }
        let persistent_index = self.data_store.persistent_log_index(self.shard_id)?;
        tracing::info!(
            shard = self.shard_id,
            persistent_log_index = persistent_index,
            snapshot_index = index,
            "initial snapshot available"
        );
        let info = SnapshotInfo::decode(snapshot.get_data())
            .context("decode initial snapshot payload")?;
        if !info.dummy && index > persistent_index {
            tracing::info!(shard = self.shard_id, index, "applying initial snapshot");
            self.sm.apply_snapshot(&snapshot)?;
            self.lr.apply_snapshot_meta(snapshot.get_metadata());
            self.pushed_index = index;
        } else {
            tracing::info!(shard = self.shard_id, index, "skipped applying initial snapshot");
            self.logdb
                .remove_snapshot_image(self.shard_id, self.replica.id, index)?;
        }
        Ok(true)
    }

    fn is_leader(&self) -> bool {
        self.node.raft.state == StateRole::Leader
    }

    fn handle_messages(&mut self) -> bool {
        if self.queues.messages.is_empty() {
            return false;
        }
        let mut items = Vec::new();
        self.queues.messages.get(READY_BATCH_SIZE, &mut items);
        let is_leader = self.is_leader();
        for raft_msg in items {
            self.committed_indexes
                .insert(raft_msg.from.id, raft_msg.commit_index);
            let msg = raft_msg.message;
            if is_leader && msg.get_from() != 0 {
                self.replica_heartbeats.insert(msg.get_from(), Instant::now());
            }
            if let Err(err) = self.node.step(msg) {
                tracing::error!(shard = self.shard_id, error = %err, "fail to step raft");
            }
        }
        if !self.queues.messages.is_empty() {
            self.notify.notify_one();
        }
        true
    }

    fn handle_ticks(&mut self) -> bool {
        if self.queues.ticks.is_empty() {
            return false;
        }
        let mut items = Vec::new();
        let n = self.queues.ticks.get(READY_BATCH_SIZE, &mut items);
        for _ in 0..n {
            self.node.tick();
            self.tick_handled += 1;
        }
        true
    }

    fn handle_feedbacks(&mut self) -> bool {
        if self.queues.feedbacks.is_empty() {
            return false;
        }
        let mut items = Vec::new();
        self.queues.feedbacks.get(READY_BATCH_SIZE, &mut items);
        for replica_id in items {
            self.node.report_unreachable(replica_id);
        }
        if !self.queues.feedbacks.is_empty() {
            self.notify.notify_one();
        }
        true
    }

    fn handle_snapshot_status(&mut self) -> bool {
        if self.queues.snapshot_status.is_empty() {
            return false;
        }
        let mut items = Vec::new();
        self.queues.snapshot_status.get(READY_BATCH_SIZE, &mut items);
        for report in items {
            let status = if report.rejected {
                SnapshotStatus::Failure
            } else {
                SnapshotStatus::Finish
            };
            self.node.report_snapshot(report.to, status);
        }
        if !self.queues.snapshot_status.is_empty() {
            self.notify.notify_one();
        }
        true
    }

    fn handle_requests(&mut self) -> bool {
        if self.queues.requests.is_empty() {
            return false;
        }
        let mut items = Vec::new();
        self.queues.requests.get(READY_BATCH_SIZE, &mut items);
        for ctx in items {
            self.propose(ctx);
        }
        if !self.queues.requests.is_empty() {
            self.notify.notify_one();
        }
        true
    }

    fn propose(&mut self, ctx: ReqCtx) {
        let ReqCtx { batch, tx } = ctx;
        let batch_id = batch.header.id;

        if !batch.is_admin() && batch.requests.iter().any(|r| r.cmd_type == CmdType::Read) {
            // There is no replica-local read path; routing layers serve
            // reads, and a read must never reach the replicated log.
            if let Some(tx) = tx {
                let _ = tx.send(ResponseBatch::error(batch_id, RespError::StoreNotMatch));
            }
            return;
        }

        if !self.is_leader() {
            let leader = {
                let shard = self.shard.read().unwrap();
                shard
                    .replica_by_id(self.leader_id.load(Ordering::Acquire))
                    .cloned()
            };
            if let Some(tx) = tx {
                let _ = tx.send(ResponseBatch::error(
                    batch_id,
                    RespError::NotLeader {
                        shard_id: self.shard_id,
                        leader,
                    },
                ));
            }
            return;
        }

        let result = match &batch.admin {
            Some(AdminRequest::ConfigChange(req)) => {
                let mut cc = ConfChange::default();
                cc.set_change_type(to_raft_change_type(req.change_type));
                cc.set_node_id(req.replica.id);
                cc.set_context(batch.encode().into());
                self.node.propose_conf_change(Vec::new(), cc)
            }
            Some(AdminRequest::ConfigChangeV2(req)) => {
                let mut cc = ConfChangeV2::default();
                let singles: Vec<ConfChangeSingle> = req
                    .changes
                    .iter()
                    .map(|change| {
                        let mut single = ConfChangeSingle::default();
                        single.set_change_type(to_raft_change_type(change.change_type));
                        single.set_node_id(change.replica.id);
                        single
                    })
                    .collect();
                cc.set_changes(singles.into());
                if req.changes.len() > 1 {
                    cc.set_transition(ConfChangeTransition::Explicit);
                }
                cc.set_context(batch.encode().into());
                self.node.propose_conf_change(Vec::new(), cc)
            }
            _ => self.node.propose(Vec::new(), batch.encode()),
        };

        match result {
            Ok(()) => {
                let index = self.node.raft.raft_log.last_index();
                let term = self.node.raft.term;
                self.pending_proposals.push_back(Proposal {
                    index,
                    term,
                    batch_id,
                    tx,
                });
            }
            Err(err) => {
                tracing::error!(shard = self.shard_id, error = %err, "fail to propose");
                if let Some(tx) = tx {
                    let _ = tx.send(ResponseBatch::error(
                        batch_id,
                        RespError::Other(err.to_string()),
                    ));
                }
            }
        }
    }

    fn handle_raft_ready(&mut self) -> anyhow::Result<()> {
        let mut ready = self.node.ready();

        if let Some(ss) = ready.ss() {
            self.leader_id.store(ss.leader_id, Ordering::Release);
            let is_leader = ss.raft_state == StateRole::Leader;
            if self.was_leader && !is_leader {
                self.on_leadership_lost();
            }
            self.was_leader = is_leader;
        }

        if !ready.messages().is_empty() {
            let msgs = ready.take_messages();
            self.send_messages(msgs);
        }

        let snapshot = ready.snapshot().clone();
        let has_snapshot = snapshot.get_metadata().get_index() > 0;
        let mut committed = ready.take_committed_entries();
        let entries = ready.take_entries();

        let mut saved = SavedRaftState {
            hard_state: ready.hs().cloned(),
            entries,
            snapshot: has_snapshot.then(|| snapshot.clone()),
        };
        if !saved.is_empty() {
            for entry in &saved.entries {
                self.stats.raft_log_size_hint += entry.get_data().len() as u64;
            }
            self.lr.append(&saved.entries);
            if let Some(hs) = saved.hard_state.clone() {
                self.lr.set_hard_state(hs);
            }
            if has_snapshot {
                // The record must carry the dummy-or-not marker; refuse to
                // persist anything undecodable.
                SnapshotInfo::decode(snapshot.get_data())
                    .context("received snapshot with invalid payload")?;
            }
            self.logdb
                .save_raft_state(self.shard_id, self.replica.id, std::mem::take(&mut saved), &mut self.wc)
                .context("fail to save raft state")?;
        }

        if has_snapshot {
            let index = snapshot.get_metadata().get_index();
            if index <= self.pushed_index {
                tracing::info!(
                    shard = self.shard_id,
                    index,
                    pushed = self.pushed_index,
                    "skip applying stale snapshot"
                );
            } else {
                self.sm
                    .apply_snapshot(&snapshot)
                    .context("fail to apply received snapshot")?;
                self.lr.apply_snapshot_meta(snapshot.get_metadata());
                self.pushed_index = index;
            }
        }

        if !ready.persisted_messages().is_empty() {
            let msgs = ready.take_persisted_messages();
            self.send_messages(msgs);
        }

        let mut light = self.node.advance(ready);
        if let Some(commit) = light.commit_index() {
            let hs = self.lr.commit_to(commit);
            self.logdb
                .save_raft_state(
                    self.shard_id,
                    self.replica.id,
                    SavedRaftState {
                        hard_state: Some(hs),
                        ..Default::default()
                    },
                    &mut self.wc,
                )
                .context("fail to persist commit index")?;
        }
        committed.extend(light.take_committed_entries());
        let msgs = light.take_messages();
        self.send_messages(msgs);

        if !committed.is_empty() {
            self.handle_committed_entries(committed);
        }
        self.node.advance_apply();
        Ok(())
    }

    fn handle_committed_entries(&mut self, entries: Vec<Entry>) {
        let outcomes = self.sm.apply_committed(&entries);
        for outcome in outcomes {
            if let Some(cc) = &outcome.conf_change {
                let applied = match cc {
                    ParsedConfChange::V1(cc) => self.node.apply_conf_change(cc),
                    ParsedConfChange::V2(cc) => self.node.apply_conf_change(cc),
                };
                match applied {
                    Ok(cs) => self.lr.set_conf_state(cs),
                    Err(err) => {
                        tracing::error!(
                            shard = self.shard_id,
                            error = %err,
                            "fail to apply conf change to consensus"
                        );
                    }
                }
            }
            self.merge_apply_metrics(outcome.metrics);
            let mut resp = outcome.resp;
            self.respond_proposals(outcome.index, outcome.term, &mut resp);
            if let Some(admin) = outcome.admin {
                self.handle_admin_result(admin);
            }
        }
        if self.sm.is_pending_remove() && !self.removal_reported {
            self.removal_reported = true;
            self.events
                .on_replica_removed(self.shard_id, self.replica.clone());
        }
    }

    /// Responses are emitted in commit order; proposals passed over by a
    /// higher index or term were superseded and answer `StaleCommand`.
    fn respond_proposals(&mut self, index: u64, term: u64, resp: &mut Option<ResponseBatch>) {
        while let Some(front) = self.pending_proposals.front() {
            if front.index < index {
                let proposal = self.pending_proposals.pop_front().unwrap();
                proposal.respond_err(RespError::StaleCommand);
                continue;
            }
            if front.index == index {
                let proposal = self.pending_proposals.pop_front().unwrap();
                match (proposal.term == term, resp.take()) {
                    (true, Some(resp)) => proposal.respond(resp),
                    _ => proposal.respond_err(RespError::StaleCommand),
                }
            }
            break;
        }
    }

    fn merge_apply_metrics(&mut self, metrics: ApplyMetrics) {
        self.stats.written_bytes += metrics.written_bytes;
        self.stats.written_keys += metrics.written_keys;
        if metrics.diff_bytes < 0 {
            let v = metrics.diff_bytes.unsigned_abs();
            self.stats.size_diff_hint = self.stats.size_diff_hint.saturating_sub(v);
        } else {
            self.stats.size_diff_hint += metrics.diff_bytes as u64;
        }
        self.size_diff_hint
            .store(self.stats.size_diff_hint, Ordering::Release);
    }

    fn handle_admin_result(&mut self, result: AdminExecResult) {
        match result {
            AdminExecResult::ConfigChange { shard, .. } => {
                tracing::debug!(
                    shard = shard.id,
                    conf_ver = shard.epoch.conf_ver,
                    "membership change applied"
                );
                self.enqueue_action(Action::Heartbeat);
            }
            AdminExecResult::Split { derived, shards } => {
                self.stats.size_diff_hint = 0;
                self.stats.approximate_size = 0;
                self.stats.approximate_keys = 0;
                self.size_diff_hint.store(0, Ordering::Release);
                self.events.on_split(derived, shards);
                self.enqueue_action(Action::Heartbeat);
            }
            AdminExecResult::CompactLog { index } => {
                self.enqueue_action(Action::LogCompaction { index });
            }
        }
    }

    fn enqueue_action(&self, act: Action) {
        if self.queues.actions.put(act).is_err() {
            tracing::info!(shard = self.shard_id, "action queue stopped");
            return;
        }
        self.notify.notify_one();
    }

    fn on_leadership_lost(&mut self) {
        self.replica_heartbeats.clear();
        for proposal in std::mem::take(&mut self.pending_proposals) {
            proposal.respond_err(RespError::StaleCommand);
        }
        for read in std::mem::take(&mut self.pending_reads) {
            read.respond_err(RespError::StoreNotMatch);
        }
    }

    fn send_messages(&self, msgs: Vec<Message>) {
        if msgs.is_empty() {
            return;
        }
        let shard = self.shard.read().unwrap().clone();
        let commit_index = self.node.raft.raft_log.committed;
        for msg in msgs {
            let to_id = msg.get_to();
            let to = shard
                .replica_by_id(to_id)
                .cloned()
                .unwrap_or(ReplicaDesc {
                    id: to_id,
                    ..Default::default()
                });
            self.transport.send(RaftMessage {
                shard_id: self.shard_id,
                group: self.group,
                from: self.replica.clone(),
                to,
                shard_epoch: shard.epoch,
                start: shard.start.clone(),
                end: shard.end.clone(),
                is_tombstone: false,
                commit_index,
                message: msg,
            });
        }
    }

    async fn handle_actions(&mut self) -> bool {
        if self.queues.actions.is_empty() {
            return false;
        }
        let mut items = Vec::new();
        self.queues.actions.get(READY_BATCH_SIZE, &mut items);
        let mut requeued = 0usize;
        for act in items {
            match act {
                Action::Campaign => {
                    if let Err(err) = self.node.campaign() {
                        panic!("shard {} failed to campaign: {err}", self.shard_id);
                    }
                }
                Action::CheckSplit => self.try_check_split().await,
                Action::RequestSplit(data) => self.do_split(data),
                Action::Heartbeat => self.placement_heartbeat().await,
                Action::UpdateReadMetrics {
                    read_bytes,
                    read_keys,
                } => {
                    self.stats.read_bytes += read_bytes;
                    self.stats.read_keys += read_keys;
                }
                Action::CheckLogCommitted { target, epoch, cb } => {
                    requeued += self.check_log_progress(
                        target,
                        epoch,
                        cb,
                        self.node.raft.raft_log.committed,
                        true,
                    );
                }
                Action::CheckLogApplied { target, epoch, cb } => {
                    requeued += self.check_log_progress(
                        target,
                        epoch,
                        cb,
                        self.sm.applied_index(),
                        false,
                    );
                }
                Action::CheckCompactLog => self.check_compact_log(),
                Action::LogCompaction { index } => self.do_log_compaction(index),
                Action::SnapshotCompaction {
                    snapshot,
                    persistent_log_index,
                } => self.do_snapshot_compaction(&snapshot, persistent_log_index),
            }
        }
        // Re-queued progress checks wait for the next wake-up instead of
        // spinning the loop.
        if self.queues.actions.len() > requeued {
            self.notify.notify_one();
        }
        true
    }

    fn check_log_progress(
        &mut self,
        target: u64,
        epoch: Epoch,
        cb: LogCheckCallback,
        current: u64,
        committed: bool,
    ) -> usize {
        if !self.is_leader() {
            cb(Err(anyhow::anyhow!("shard {} not leader", self.shard_id)));
            return 0;
        }
        let shard_epoch = self.shard.read().unwrap().epoch;
        if shard_epoch != epoch {
            cb(Err(anyhow::anyhow!(
                "shard {} epoch changed, version {} conf_ver {}",
                self.shard_id,
                shard_epoch.version,
                shard_epoch.conf_ver
            )));
            return 0;
        }
        if current >= target {
            cb(Ok(current));
            return 0;
        }
        let act = if committed {
            Action::CheckLogCommitted { target, epoch, cb }
        } else {
            Action::CheckLogApplied { target, epoch, cb }
        };
        if self.queues.actions.put(act).is_err() {
            return 0;
        }
        1
    }

    async fn try_check_split(&mut self) {
        if !self.is_leader() {
            return;
        }
        let shard = self.shard.read().unwrap().clone();
        if shard.disable_split {
            return;
        }
        let result = match self.data_store.split_check(&shard, self.cfg.shard_split_size) {
            Ok(result) => result,
            Err(err) => {
                tracing::error!(shard = self.shard_id, error = ?err, "split check failed");
                return;
            }
        };
        self.stats.approximate_size = result.size;
        self.stats.approximate_keys = result.keys;
        self.stats.size_diff_hint = 0;
        self.size_diff_hint.store(0, Ordering::Release);
        if result.split_keys.is_empty() {
            return;
        }
        let ids = match self
            .placement
            .ask_batch_split(shard.clone(), result.split_keys.len() as u32)
            .await
        {
            Ok(ids) => ids,
            Err(err) => {
                tracing::error!(shard = self.shard_id, error = ?err, "ask batch split failed");
                return;
            }
        };
        if ids.len() != result.split_keys.len() {
            tracing::error!(
                shard = self.shard_id,
                want = result.split_keys.len(),
                got = ids.len(),
                "split id allocation mismatch"
            );
            return;
        }
        self.enqueue_action(Action::RequestSplit(SplitCheckData {
            keys: result.keys,
            size: result.size,
            split_keys: result.split_keys,
            split_ids: ids,
            epoch: shard.epoch,
        }));
    }

    fn do_split(&mut self, data: SplitCheckData) {
        if !self.is_leader() {
            return;
        }
        let shard = self.shard.read().unwrap().clone();
        if data.epoch.version != shard.epoch.version {
            tracing::info!(
                shard = self.shard_id,
                "shard epoch changed, skip splitting"
            );
            return;
        }
        let requests = data
            .split_keys
            .into_iter()
            .zip(data.split_ids)
            .map(|(split_key, id)| SplitRequest {
                split_key,
                new_shard_id: id.new_shard_id,
                new_replica_ids: id.new_replica_ids,
            })
            .collect();
        self.add_admin_request(AdminRequest::BatchSplit(BatchSplitRequest { requests }));
    }

    fn add_admin_request(&mut self, admin: AdminRequest) {
        let (shard_id, epoch) = {
            let shard = self.shard.read().unwrap();
            (shard.id, shard.epoch)
        };
        self.next_req_id += 1;
        let batch = RequestBatch::admin(self.next_req_id, shard_id, epoch, admin);
        if self
            .queues
            .requests
            .put(ReqCtx { batch, tx: None })
            .is_err()
        {
            tracing::info!(shard = self.shard_id, "request queue stopped");
            return;
        }
        self.notify.notify_one();
    }

    async fn placement_heartbeat(&mut self) {
        if !self.is_leader() {
            return;
        }
        let shard = self.shard.read().unwrap().clone();

        let mut down_replicas = Vec::new();
        for replica in &shard.replicas {
            if replica.id == self.replica.id {
                continue;
            }
            if let Some(last) = self.replica_heartbeats.get(&replica.id) {
                let elapsed = last.elapsed();
                if elapsed >= self.cfg.max_peer_down_duration {
                    down_replicas.push(DownReplica {
                        replica: replica.clone(),
                        down_seconds: elapsed.as_secs(),
                    });
                }
            }
        }

        let mut pending_replicas = Vec::new();
        for (id, progress) in self.node.raft.prs().iter() {
            if progress.state == ProgressState::Snapshot {
                if let Some(replica) = shard.replica_by_id(*id) {
                    pending_replicas.push(replica.clone());
                }
            }
        }

        let req = ResourceHeartbeatReq {
            term: self.node.raft.term,
            leader: self.replica.clone(),
            container_id: self.replica.container_id,
            down_replicas,
            pending_replicas,
            stats: self.stats.heartbeat_state(),
            group_key: shard.group.to_string(),
        };
        if let Err(err) = self.placement.resource_heartbeat(shard, req).await {
            tracing::error!(
                shard = self.shard_id,
                error = ?err,
                "fail to send heartbeat to placement driver"
            );
        }
    }

    fn check_compact_log(&mut self) {
        if !self.is_leader() {
            return;
        }
        let mut min_match = 0u64;
        for (_, progress) in self.node.raft.prs().iter() {
            if min_match == 0 || progress.matched < min_match {
                min_match = progress.matched;
            }
        }
        let last_index = self.node.raft.raft_log.last_index();
        // When an election happened or a new replica was added, the match
        // index can be 0; that round is skipped by the selection below.
        if min_match > 0 && last_index < min_match {
            panic!(
                "shard {} invalid replicated index, replicated {min_match} last {last_index}",
                self.shard_id
            );
        }
        let applied_index = self.sm.applied_index();
        let first_index = self.lr.first_index_value();
        let Some(compact_index) = select_compact_index(
            min_match,
            applied_index,
            first_index,
            self.stats.raft_log_size_hint,
            &self.cfg,
        ) else {
            tracing::debug!(
                shard = self.shard_id,
                min_match,
                applied_index,
                first_index,
                "requesting log compaction skipped"
            );
            return;
        };
        tracing::info!(shard = self.shard_id, index = compact_index, "requesting log compaction");
        self.add_admin_request(AdminRequest::CompactLog(CompactLogRequest { compact_index }));
    }

    /// Execute a committed compact-log admin: write the dummy snapshot that
    /// anchors the log reader after restart, then prune the entries.
    fn do_log_compaction(&mut self, index: u64) {
        if index == 0 {
            return;
        }
        tracing::info!(shard = self.shard_id, index, "log compaction action handled");
        let term = match self.lr.term(index) {
            Ok(term) => term,
            Err(raft::Error::Store(StorageError::Compacted))
            | Err(raft::Error::Store(StorageError::Unavailable)) => {
                // The marker position cannot be established; skip this one.
                tracing::info!(shard = self.shard_id, index, "skipped a compaction action");
                return;
            }
            Err(err) => panic!(
                "shard {} failed to get term for index {index}: {err}",
                self.shard_id
            ),
        };

        let mut snapshot = Snapshot::default();
        snapshot.mut_metadata().set_index(index);
        snapshot.mut_metadata().set_term(term);
        snapshot.set_data(SnapshotInfo::dummy().encode().into());
        let saved = SavedRaftState {
            snapshot: Some(snapshot),
            ..Default::default()
        };
        if let Err(err) =
            self.logdb
                .save_raft_state(self.shard_id, self.replica.id, saved, &mut self.wc)
        {
            panic!("shard {} fail to save dummy snapshot: {err}", self.shard_id);
        }
        tracing::info!(shard = self.shard_id, index, "dummy snapshot saved");

        if let Err(err) = self.lr.compact_to(index) {
            if !matches!(err, raft::Error::Store(StorageError::Compacted)) {
                panic!("shard {} fail to compact log reader: {err}", self.shard_id);
            }
        }
        if let Err(err) = self
            .logdb
            .remove_entries_to(self.shard_id, self.replica.id, index)
        {
            panic!("shard {} fail to remove entries: {err}", self.shard_id);
        }
        self.stats.raft_log_size_hint = 0;
        tracing::info!(shard = self.shard_id, index, "compaction completed");
    }

    /// Drop snapshot images whose contents the data store has already
    /// durably passed.
    fn do_snapshot_compaction(&mut self, snapshot: &Snapshot, persistent_log_index: u64) {
        let index = snapshot.get_metadata().get_index();
        if index > persistent_log_index {
            return;
        }
        if let Err(err) = self
            .logdb
            .remove_snapshot_image(self.shard_id, self.replica.id, index)
        {
            panic!(
                "shard {} fail to remove snapshot image at {index}: {err}",
                self.shard_id
            );
        }
    }

    /// Teardown drain: every buffered or pending request is answered with
    /// `StoreNotMatch` and the apply state machine is closed.
    fn shutdown(&mut self) {
        self.stats.flush(self.shard_id);
        tracing::debug!(
            shard = self.shard_id,
            ticks_handled = self.tick_handled,
            peer_commit_indexes = ?self.committed_indexes,
            "replica teardown state"
        );
        self.queues.actions.dispose();
        self.queues.ticks.dispose();
        self.queues.messages.dispose();
        self.queues.feedbacks.dispose();
        self.queues.snapshot_status.dispose();

        for proposal in std::mem::take(&mut self.pending_proposals) {
            proposal.respond_err(RespError::StoreNotMatch);
        }
        for read in std::mem::take(&mut self.pending_reads) {
            read.respond_err(RespError::StoreNotMatch);
        }
        for ctx in self.queues.requests.dispose() {
            ctx.respond_err(RespError::StoreNotMatch);
        }
        self.sm.close();
        tracing::info!(shard = self.shard_id, "replica shutdown completed");
    }
}

fn to_raft_change_type(change_type: ChangeType) -> ConfChangeType {
    match change_type {
        ChangeType::AddNode => ConfChangeType::AddNode,
        ChangeType::RemoveNode => ConfChangeType::RemoveNode,
        ChangeType::AddLearnerNode => ConfChangeType::AddLearnerNode,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cfg(compact_threshold: u64, force_compact_count: u64) -> RaftConfig {
        RaftConfig {
            compact_threshold,
            force_compact_count,
            force_compact_bytes: u64::MAX,
            ..Default::default()
        }
    }

    #[test]
    fn compact_index_skips_small_replication_window() {
        // min_match barely ahead of first: not worth compacting.
        let c = cfg(10, 1000);
        assert_eq!(select_compact_index(105, 150, 100, 0, &c), None);
    }

    #[test]
    fn compact_index_forces_on_applied_count() {
        // Same window, but 50 applied-but-uncompacted entries force it; one
        // entry stays behind as the reference point.
        let c = cfg(10, 40);
        assert_eq!(select_compact_index(105, 150, 100, 0, &c), Some(149));
    }

    #[test]
    fn compact_index_forces_on_log_size() {
        let c = RaftConfig {
            compact_threshold: 10,
            force_compact_count: u64::MAX,
            force_compact_bytes: 1024,
            ..Default::default()
        };
        assert_eq!(select_compact_index(105, 150, 100, 4096, &c), Some(149));
        assert_eq!(select_compact_index(105, 150, 100, 512, &c), None);
    }

    #[test]
    fn compact_index_skips_during_elections() {
        let c = cfg(0, 1);
        assert_eq!(select_compact_index(0, 150, 100, u64::MAX, &c), None);
    }

    #[test]
    fn compact_index_follows_replication_when_window_is_large() {
        let c = cfg(10, 1000);
        // 200 - 100 > 10: compact to min_match - 1.
        assert_eq!(select_compact_index(200, 250, 100, 0, &c), Some(199));
    }

    #[test]
    fn compact_index_never_goes_below_first() {
        let c = cfg(0, 1000);
        // min_match == first + 1 would compact to first, which is legal;
        // min_match == first compacts to first - 1 and is refused.
        assert_eq!(select_compact_index(100, 150, 100, 0, &c), None);
        assert_eq!(select_compact_index(101, 150, 100, 0, &c), Some(100));
    }
}

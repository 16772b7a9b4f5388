//! Host-level replica arena and message intake.
//!
//! The store multiplexes many replicas in one process, keyed by shard id.
//! Incoming raft messages are routed to the owning replica's queue; messages
//! for unknown shards may request replica creation, but only when the message
//! type is create-eligible and the advertised range does not overlap a shard
//! we already host.

use std::collections::HashMap;
use std::sync::RwLock;

use super::meta::{is_creation_eligible, RaftMessage, ShardId};
use super::replica::{Action, RaftConfig, ReplicaHandle};

/// What happened to an incoming message.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RouteOutcome {
    /// Delivered to an existing replica's queue.
    Delivered,
    /// Dropped: stale target, overlap, or a non-create-eligible type for an
    /// unknown shard.
    Dropped,
    /// The caller should create a local replica for this shard, then route
    /// the message again.
    CreateReplica,
}

/// Arena of replica handles hosted by this process.
pub struct Store {
    cfg: RaftConfig,
    replicas: RwLock<HashMap<ShardId, ReplicaHandle>>,
}

impl Store {
    pub fn new(cfg: RaftConfig) -> Self {
        Self {
            cfg,
            replicas: RwLock::new(HashMap::new()),
        }
    }

    pub fn cfg(&self) -> &RaftConfig {
        &self.cfg
    }

    pub fn add_replica(&self, handle: ReplicaHandle) {
        let mut replicas = self.replicas.write().unwrap();
        replicas.insert(handle.shard_id(), handle);
    }

    pub fn remove_replica(&self, shard_id: ShardId) -> Option<ReplicaHandle> {
        let mut replicas = self.replicas.write().unwrap();
        replicas.remove(&shard_id)
    }

    pub fn get_replica(&self, shard_id: ShardId) -> Option<ReplicaHandle> {
        let replicas = self.replicas.read().unwrap();
        replicas.get(&shard_id).cloned()
    }

    pub fn replica_count(&self) -> usize {
        self.replicas.read().unwrap().len()
    }

    /// Route an incoming raft message.
    pub fn on_message(&self, msg: RaftMessage) -> RouteOutcome {
        if let Some(handle) = self.get_replica(msg.shard_id) {
            if msg.is_tombstone {
                // The peer destroyed this shard; our replica is obsolete.
                handle.close();
                return RouteOutcome::Dropped;
            }
            if msg.to.id < handle.replica_id() {
                tracing::debug!(
                    shard = msg.shard_id,
                    to = msg.to.id,
                    current = handle.replica_id(),
                    "dropped stale raft message"
                );
                return RouteOutcome::Dropped;
            }
            if msg.to.id > handle.replica_id() {
                // A newer replica id for this shard exists elsewhere; the
                // local one is stale and must go before it can be recreated.
                tracing::info!(
                    shard = msg.shard_id,
                    to = msg.to.id,
                    current = handle.replica_id(),
                    "local replica is stale, closing"
                );
                handle.close();
                return RouteOutcome::Dropped;
            }
            handle.add_message(msg);
            return RouteOutcome::Delivered;
        }
        self.check_create_replica(&msg)
    }

    fn check_create_replica(&self, msg: &RaftMessage) -> RouteOutcome {
        if msg.is_tombstone || msg.to.id == 0 {
            return RouteOutcome::Dropped;
        }
        if !is_creation_eligible(&msg.message) {
            return RouteOutcome::Dropped;
        }
        let replicas = self.replicas.read().unwrap();
        for handle in replicas.values() {
            let shard = handle.shard();
            if shard.overlaps(&msg.start, &msg.end) {
                tracing::info!(
                    shard = msg.shard_id,
                    existing = shard.id,
                    "refusing replica creation, range overlaps a hosted shard"
                );
                return RouteOutcome::Dropped;
            }
        }
        RouteOutcome::CreateReplica
    }

    /// Sweep leader replicas and queue a split check for every one whose
    /// accumulated write delta crossed the configured trigger.
    pub fn handle_split_check(&self) {
        let replicas = self.replicas.read().unwrap();
        for handle in replicas.values() {
            if !handle.is_leader() {
                continue;
            }
            if handle.size_diff_hint() < self.cfg.shard_split_check_diff {
                continue;
            }
            handle.add_action(Action::CheckSplit);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::raftstore::meta::{RaftMessage, ReplicaDesc, ShardDesc};
    use crate::raftstore::replica::{
        NoopPlacementClient, NoopStoreEventHandler, NoopTransport, Replica,
    };
    use crate::raftstore::storage::{MemDataStore, MemLogStore};
    use raft::eraftpb::{Message, MessageType};
    use std::sync::Arc;

    fn new_handle(shard_id: u64, replica_id: u64, start: &[u8], end: &[u8]) -> ReplicaHandle {
        let shard = ShardDesc {
            id: shard_id,
            start: start.to_vec(),
            end: end.to_vec(),
            replicas: vec![ReplicaDesc::new(replica_id, replica_id)],
            ..Default::default()
        };
        let replica = Replica::new(
            RaftConfig::default(),
            shard,
            replica_id,
            Arc::new(MemLogStore::new()),
            Arc::new(MemDataStore::new()),
            Arc::new(NoopTransport),
            Arc::new(NoopPlacementClient),
            Arc::new(NoopStoreEventHandler),
        )
        .unwrap();
        replica.handle()
    }

    fn vote_msg(shard_id: u64, to: u64, start: &[u8], end: &[u8]) -> RaftMessage {
        let mut message = Message::default();
        message.set_msg_type(MessageType::MsgRequestVote);
        RaftMessage {
            shard_id,
            to: ReplicaDesc::new(to, to),
            start: start.to_vec(),
            end: end.to_vec(),
            message,
            ..Default::default()
        }
    }

    #[test]
    fn routes_to_existing_replica() {
        let store = Store::new(RaftConfig::default());
        store.add_replica(new_handle(1, 1, b"a", b"b"));
        assert_eq!(
            store.on_message(vote_msg(1, 1, b"a", b"b")),
            RouteOutcome::Delivered
        );
    }

    #[test]
    fn drops_stale_message_and_closes_stale_replica() {
        let store = Store::new(RaftConfig::default());
        store.add_replica(new_handle(1, 2, b"a", b"b"));
        // Message for an older replica id: stale message.
        assert_eq!(
            store.on_message(vote_msg(1, 1, b"a", b"b")),
            RouteOutcome::Dropped
        );
        // Message for a newer replica id: the local replica is stale.
        let store = Store::new(RaftConfig::default());
        store.add_replica(new_handle(1, 1, b"a", b"b"));
        assert_eq!(
            store.on_message(vote_msg(1, 2, b"a", b"b")),
            RouteOutcome::Dropped
        );
    }

    #[test]
    fn only_create_eligible_messages_create_replicas() {
        let store = Store::new(RaftConfig::default());
        let mut msg = vote_msg(5, 1, b"x", b"y");
        msg.message.set_msg_type(MessageType::MsgAppend);
        assert_eq!(store.on_message(msg), RouteOutcome::Dropped);

        assert_eq!(
            store.on_message(vote_msg(5, 1, b"x", b"y")),
            RouteOutcome::CreateReplica
        );
    }

    #[test]
    fn overlapping_range_refuses_creation() {
        let store = Store::new(RaftConfig::default());
        store.add_replica(new_handle(2, 1, b"a", b"c"));
        // Overlaps the hosted [a, c) shard.
        assert_eq!(
            store.on_message(vote_msg(1, 2, b"b", b"c")),
            RouteOutcome::Dropped
        );
        // Disjoint range may create.
        assert_eq!(
            store.on_message(vote_msg(1, 2, b"c", b"d")),
            RouteOutcome::CreateReplica
        );
    }

    #[test]
    fn split_check_sweeps_only_triggered_leaders() {
        let cfg = RaftConfig {
            shard_split_check_diff: 1024,
            ..Default::default()
        };
        let store = Store::new(cfg);
        let handle = new_handle(1, 1, b"a", b"b");
        store.add_replica(handle.clone());
        // Not leader: nothing queued.
        store.handle_split_check();
        assert!(handle.size_diff_hint() < 1024);
    }
}

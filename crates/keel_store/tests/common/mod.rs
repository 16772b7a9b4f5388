#![allow(dead_code)]
//! Shared helpers for replica engine integration tests.

use std::sync::Arc;
use std::time::Duration;

use keel_raft::raftstore::{
    Action, CmdType, DataStore, LogStore, NoopPlacementClient, NoopStoreEventHandler,
    NoopTransport, RaftConfig, Replica, ReplicaDesc, ReplicaHandle, Request, RequestBatch,
    RequestHeader, ResponseBatch, ShardDesc,
};

pub const WAIT_TIMEOUT: Duration = Duration::from_secs(10);

/// Engine config tuned so tests converge quickly.
pub fn fast_config() -> RaftConfig {
    RaftConfig {
        tick_interval: Duration::from_millis(10),
        election_ticks: 5,
        heartbeat_ticks: 1,
        ..Default::default()
    }
}

/// One-voter shard covering `[a, z)`, hosted by replica 1 on container 1.
pub fn test_shard() -> ShardDesc {
    ShardDesc {
        id: 1,
        start: b"a".to_vec(),
        end: b"z".to_vec(),
        replicas: vec![ReplicaDesc::new(1, 1)],
        ..Default::default()
    }
}

pub fn start_replica(
    cfg: RaftConfig,
    shard: ShardDesc,
    logdb: Arc<dyn LogStore>,
    data_store: Arc<dyn DataStore>,
) -> ReplicaHandle {
    Replica::new(
        cfg,
        shard,
        1,
        logdb,
        data_store,
        Arc::new(NoopTransport),
        Arc::new(NoopPlacementClient),
        Arc::new(NoopStoreEventHandler),
    )
    .expect("create replica")
    .start()
}

pub async fn wait_until(what: &str, mut cond: impl FnMut() -> bool) {
    let deadline = tokio::time::Instant::now() + WAIT_TIMEOUT;
    while !cond() {
        if tokio::time::Instant::now() >= deadline {
            panic!("timed out waiting for {what}");
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

pub async fn become_leader(handle: &ReplicaHandle) {
    handle.add_action(Action::Campaign);
    wait_until("leadership", || handle.is_leader()).await;
}

pub fn write_batch(handle: &ReplicaHandle, id: u64, pairs: &[(&[u8], &[u8])]) -> RequestBatch {
    let shard = handle.shard();
    RequestBatch {
        header: RequestHeader {
            id,
            shard_id: shard.id,
            epoch: shard.epoch,
        },
        requests: pairs
            .iter()
            .enumerate()
            .map(|(i, (key, value))| Request {
                id: i as u64,
                cmd_type: CmdType::Write,
                key: key.to_vec(),
                cmd: value.to_vec(),
            })
            .collect(),
        admin: None,
    }
}

/// Propose a write batch and wait for its response.
pub async fn propose_write(
    handle: &ReplicaHandle,
    id: u64,
    pairs: &[(&[u8], &[u8])],
) -> ResponseBatch {
    let rx = handle
        .add_request(write_batch(handle, id, pairs))
        .expect("request queue accepts");
    tokio::time::timeout(WAIT_TIMEOUT, rx)
        .await
        .expect("response in time")
        .expect("responder not dropped")
}

//! KeelStore replica engine crate.
//!
//! This crate provides the per-shard replica engine used by keel_store. The
//! API surface is intentionally small: higher layers supply a `LogStore`, a
//! `DataStore`, a `RaftTransport` and a `PlacementClient`, then drive
//! proposals and raft messages through `ReplicaHandle`.

pub mod raftstore;

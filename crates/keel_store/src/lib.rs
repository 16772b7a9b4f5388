//! Durable storage adapters for the keel replica engine.
//!
//! Both stores are fjall-backed and shared by every shard in the host
//! process: `FjallLogStore` persists raft hard state, entries and snapshot
//! records keyed per `(shard, replica)`, and `FjallDataStore` applies user
//! write batches and stores shard metadata atomically with the apply index.

mod kv;
mod logdb;

pub use kv::FjallDataStore;
pub use logdb::FjallLogStore;

//! Public interface to the Shardset library: a sharded, replicated
//! key-value store in which each replica group sequences client
//! operations, configuration changes, and shard hand-offs onto one
//! per-group consensus log.

#[macro_use]
mod utils;

pub mod client;
pub mod master;
pub mod paxos;
pub mod server;

pub use client::ShardsetClient;
pub use master::{key2shard, Config, Gid, LocalMaster, ReplicaId, ShardMaster, NSHARDS};
pub use paxos::{Fate, MemPaxos, PaxosLog};
pub use server::{
    ApiReply, ApiRequest, ErrCode, Op, PutKind, Rep, ReplicaConfig, ShardsetReplica,
    ShardsetServerNode, XState,
};
pub use utils::ShardsetError;

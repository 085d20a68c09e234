//! Shardset's replica-group server functionality modules.

mod external;
mod replica;
mod statemach;

pub use external::{ApiReply, ApiRequest, ReplicaConfig, ShardsetServerNode};
pub use replica::ShardsetReplica;
pub use statemach::{ErrCode, Op, PutKind, Rep, XState};

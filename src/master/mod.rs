//! Shard master interface: the external service that publishes the
//! monotonically numbered sequence of shard-to-group configurations.
//!
//! The master itself (its resharding policy, its own replication) is an
//! external collaborator; this module defines the `Config` value type,
//! the `query` seam consumed by replicas and clients, and an in-memory
//! implementation used by tests and the local-cluster binary.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Mutex;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::utils::ShardsetError;

/// Replica group ID type. Group 0 is the "no group" sentinel: shards
/// assigned to it are owned by nobody yet.
pub type Gid = u64;

/// Replica ID within a group.
pub type ReplicaId = u8;

/// Number of shards the key space is partitioned into, fixed system-wide.
pub const NSHARDS: usize = 10;

/// Maps a key to its shard index with a fixed FNV-1a hash, stable across
/// processes and runs.
pub fn key2shard(key: &str) -> usize {
    let mut hash: u64 = 0xcbf2_9ce4_8422_2325;
    for b in key.as_bytes() {
        hash ^= *b as u64;
        hash = hash.wrapping_mul(0x0000_0100_0000_01b3);
    }
    (hash % NSHARDS as u64) as usize
}

/// One numbered shard-to-group assignment published by the shard master.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Config {
    /// Monotonically increasing configuration number, starting at 0.
    pub num: u64,

    /// Owning group of each shard index.
    pub shards: [Gid; NSHARDS],

    /// Addresses of each group's replicas.
    pub groups: HashMap<Gid, Vec<SocketAddr>>,
}

impl Default for Config {
    fn default() -> Self {
        // config 0 assigns every shard to the sentinel group
        Config {
            num: 0,
            shards: [0; NSHARDS],
            groups: HashMap::new(),
        }
    }
}

/// Interface to the shard master consumed by replicas and clients. Real
/// deployments put a networked client behind this trait; the calls are
/// async for that reason.
#[async_trait]
pub trait ShardMaster: Send + Sync {
    /// Fetches configuration `num`, or the latest if `None`. Queries past
    /// the newest configuration return the newest.
    async fn query(&self, num: Option<u64>) -> Result<Config, ShardsetError>;
}

/// In-memory shard master holding the full configuration sequence.
pub struct LocalMaster {
    /// All configurations ever published, indexed by config number.
    configs: Mutex<Vec<Config>>,
}

impl LocalMaster {
    /// Creates a new master seeded with configuration 0.
    pub fn new() -> Self {
        LocalMaster {
            configs: Mutex::new(vec![Config::default()]),
        }
    }

    /// Publishes the next configuration with the given shard assignment and
    /// group membership. Returns the new configuration number.
    pub fn advance(
        &self,
        shards: [Gid; NSHARDS],
        groups: HashMap<Gid, Vec<SocketAddr>>,
    ) -> u64 {
        let mut configs = self.configs.lock().unwrap();
        let num = configs.len() as u64;
        configs.push(Config {
            num,
            shards,
            groups,
        });
        num
    }

    /// Number of the newest published configuration.
    pub fn latest_num(&self) -> u64 {
        let configs = self.configs.lock().unwrap();
        configs.len() as u64 - 1
    }
}

impl Default for LocalMaster {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ShardMaster for LocalMaster {
    async fn query(&self, num: Option<u64>) -> Result<Config, ShardsetError> {
        let configs = self.configs.lock().unwrap();
        let idx = match num {
            Some(n) if (n as usize) < configs.len() => n as usize,
            _ => configs.len() - 1,
        };
        Ok(configs[idx].clone())
    }
}

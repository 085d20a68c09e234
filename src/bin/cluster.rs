//! Shardset local-cluster executable: runs a shard master and every
//! replica group inside one process, serving real TCP clients. Shards
//! are spread round-robin over the groups in the initial configuration.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use clap::Parser;

use env_logger::Env;

use tokio::runtime::Builder;

use shardset::{
    pf_error, pf_info, Gid, LocalMaster, MemPaxos, ReplicaId, ShardMaster, ShardsetError,
    ShardsetServerNode, NSHARDS,
};

/// Command line arguments definition.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct CliArgs {
    /// Number of replica groups.
    #[arg(short, long, default_value_t = 2)]
    groups: u64,

    /// Number of replicas per group.
    #[arg(short = 'n', long, default_value_t = 3)]
    group_size: u8,

    /// First listening port; replica `i` of group `g` (1-based) listens on
    /// `base_port + (g - 1) * group_size + i`.
    #[arg(short, long, default_value_t = 52700)]
    base_port: u16,

    /// Number of tokio worker threads.
    #[arg(long, default_value_t = 4)]
    threads: usize,

    /// Replica configuration TOML string.
    #[arg(short, long)]
    config: Option<String>,
}

impl CliArgs {
    /// Sanitize command line arguments.
    fn sanitize(&self) -> Result<(), ShardsetError> {
        let ports_needed = self.groups * self.group_size as u64;
        if self.groups == 0 {
            Err(ShardsetError::msg("invalid number of groups 0"))
        } else if self.group_size == 0 {
            Err(ShardsetError::msg("invalid group size 0"))
        } else if self.base_port <= 1024 {
            Err(ShardsetError(format!(
                "invalid base_port {}",
                self.base_port
            )))
        } else if self.base_port as u64 + ports_needed > 65535 {
            Err(ShardsetError(format!(
                "port range {}+{} exceeds 65535",
                self.base_port, ports_needed
            )))
        } else if self.threads < 2 {
            Err(ShardsetError(format!(
                "invalid number of threads {}",
                self.threads
            )))
        } else {
            Ok(())
        }
    }

    /// Listening addresses of every group, keyed by group ID.
    fn group_addrs(&self) -> Result<HashMap<Gid, Vec<SocketAddr>>, ShardsetError> {
        let mut addrs = HashMap::new();
        for g in 0..self.groups {
            let gid = g + 1;
            let mut servers = Vec::new();
            for i in 0..self.group_size as u64 {
                let port = self.base_port as u64 + g * self.group_size as u64 + i;
                servers.push(format!("127.0.0.1:{}", port).parse()?);
            }
            addrs.insert(gid, servers);
        }
        Ok(addrs)
    }
}

// Cluster executable main entrance.
fn cluster_main() -> Result<(), ShardsetError> {
    // read in and parse command line arguments
    let args = CliArgs::parse();
    args.sanitize()?;
    let group_addrs = args.group_addrs()?;

    // create tokio multi-threaded runtime
    let runtime = Builder::new_multi_thread()
        .enable_all()
        .worker_threads(args.threads)
        .thread_name("tokio-worker-cluster")
        .build()?;

    runtime.block_on(async move {
        let master = Arc::new(LocalMaster::new());

        // initial configuration: shards spread round-robin over the groups
        // (previous owner is the sentinel, so no transfers are needed)
        let mut shards = [0 as Gid; NSHARDS];
        for (s, shard) in shards.iter_mut().enumerate() {
            *shard = (s as u64 % args.groups) + 1;
        }
        master.advance(shards, group_addrs.clone());

        // start every replica of every group
        let mut nodes = Vec::new();
        for (&gid, servers) in &group_addrs {
            for (me, log) in MemPaxos::group(servers.len()).into_iter().enumerate() {
                let sm: Arc<dyn ShardMaster> = master.clone();
                nodes.push(
                    ShardsetServerNode::new_and_setup(
                        gid,
                        me as ReplicaId,
                        servers[me],
                        sm,
                        Box::new(log),
                        args.config.as_deref(),
                    )
                    .await?,
                );
            }
        }
        pf_info!("cluster"; "{} groups x {} replicas up, ctrl-c to stop",
                 args.groups, args.group_size);

        tokio::signal::ctrl_c().await?;
        for node in &nodes {
            node.kill();
        }

        Ok::<(), ShardsetError>(())
    })
}

fn main() {
    env_logger::Builder::from_env(Env::default().default_filter_or("info"))
        .format_timestamp(None)
        .format_module_path(true)
        .format_target(false)
        .init();

    if let Err(e) = cluster_main() {
        pf_error!("cluster"; "cluster_main exitted: {}", e);
    }
}

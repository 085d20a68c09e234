//! Server node shell: the TCP listener serving client and peer-group
//! RPCs, one servant task per accepted connection, and the periodic
//! reconfiguration ticker.

use std::net::SocketAddr;
use std::sync::Arc;

use bytes::BytesMut;
use serde::{Deserialize, Serialize};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{self, Duration};

use crate::master::{Gid, ReplicaId, ShardMaster};
use crate::paxos::PaxosLog;
use crate::server::replica::ShardsetReplica;
use crate::server::statemach::{ErrCode, PutKind, XState};
use crate::utils::{recv_msg, send_msg, tcp_bind_with_retry, ShardsetError};

/// Configuration parameters struct.
#[derive(Debug, Clone, Deserialize)]
pub struct ReplicaConfig {
    /// Reconfiguration poll interval in millisecs.
    pub tick_interval_ms: u64,

    /// Initial backoff of an in-flight log proposal in millisecs.
    pub backoff_init_ms: u64,

    /// Backoff cap of an in-flight log proposal in millisecs.
    pub backoff_cap_ms: u64,

    /// Per-peer timeout on outgoing shard-transfer calls in millisecs.
    pub transfer_timeout_ms: u64,

    /// Retries on binding the listening socket before giving up.
    pub bind_retries: u8,
}

impl Default for ReplicaConfig {
    fn default() -> Self {
        ReplicaConfig {
            tick_interval_ms: 250,
            backoff_init_ms: 10,
            backoff_cap_ms: 1000,
            transfer_timeout_ms: 500,
            bind_retries: 2,
        }
    }
}

/// Request received over the wire, from a client or from a peer group
/// pulling a shard.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum ApiRequest {
    Get {
        cid: String,
        seq: u64,
        key: String,
    },
    PutAppend {
        cid: String,
        seq: u64,
        kind: PutKind,
        key: String,
        value: String,
    },
    Transfer {
        config_num: u64,
        shard: usize,
    },
}

/// Reply sent back over the wire.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum ApiReply {
    Get { err: ErrCode, value: String },
    PutAppend { err: ErrCode },
    Transfer {
        err: ErrCode,
        xstate: Option<XState>,
    },
}

/// One running replica server: a replica core plus its listener and
/// ticker tasks.
pub struct ShardsetServerNode {
    /// The replica core shared with servant tasks.
    replica: Arc<ShardsetReplica>,

    /// Termination signal to every long-running task.
    tx_term: watch::Sender<bool>,

    /// Join handle of the connection acceptor task.
    _acceptor_handle: JoinHandle<()>,

    /// Join handle of the ticker task.
    _ticker_handle: JoinHandle<()>,
}

// ShardsetServerNode public API implementation
impl ShardsetServerNode {
    /// Creates a replica, binds its listening socket (fatal after the
    /// configured retries), and spawns the acceptor and ticker tasks.
    pub async fn new_and_setup(
        gid: Gid,
        me: ReplicaId,
        api_addr: SocketAddr,
        master: Arc<dyn ShardMaster>,
        log: Box<dyn PaxosLog>,
        config_str: Option<&str>,
    ) -> Result<Self, ShardsetError> {
        let whoami = format!("{}:{}", gid, me);

        let config = parsed_config!(config_str => ReplicaConfig;
                                    tick_interval_ms, backoff_init_ms,
                                    backoff_cap_ms, transfer_timeout_ms,
                                    bind_retries)?;
        if config.tick_interval_ms == 0 {
            return logged_err!(whoami; "invalid config.tick_interval_ms '{}'",
                               config.tick_interval_ms);
        }
        if config.backoff_init_ms == 0 || config.backoff_cap_ms < config.backoff_init_ms {
            return logged_err!(whoami; "invalid proposal backoff range {}..{}",
                               config.backoff_init_ms, config.backoff_cap_ms);
        }
        if config.transfer_timeout_ms == 0 {
            return logged_err!(whoami; "invalid config.transfer_timeout_ms '{}'",
                               config.transfer_timeout_ms);
        }

        let replica = Arc::new(ShardsetReplica::new(gid, me, master, log, &config));

        let listener = tcp_bind_with_retry(api_addr, config.bind_retries).await?;
        let (tx_term, rx_term) = watch::channel(false);

        let acceptor_handle = tokio::spawn(Self::acceptor_thread(
            replica.clone(),
            listener,
            rx_term.clone(),
        ));
        let ticker_handle = tokio::spawn(Self::ticker_thread(
            replica.clone(),
            Duration::from_millis(config.tick_interval_ms),
            rx_term,
        ));

        pf_info!(whoami; "server node listening on {}", api_addr);
        Ok(ShardsetServerNode {
            replica,
            tx_term,
            _acceptor_handle: acceptor_handle,
            _ticker_handle: ticker_handle,
        })
    }

    /// The replica core, for direct inspection.
    pub fn replica(&self) -> &Arc<ShardsetReplica> {
        &self.replica
    }

    /// Tells every task to terminate and shuts the consensus handle down.
    pub fn kill(&self) {
        let _ = self.tx_term.send(true);
        self.replica.kill();
    }
}

// ShardsetServerNode acceptor task implementation
impl ShardsetServerNode {
    /// Connection acceptor task function.
    async fn acceptor_thread(
        replica: Arc<ShardsetReplica>,
        listener: TcpListener,
        mut rx_term: watch::Receiver<bool>,
    ) {
        pf_debug!(replica.whoami(); "acceptor task spawned");

        loop {
            tokio::select! {
                accepted = listener.accept() => {
                    match accepted {
                        Ok((conn, _peer)) => {
                            tokio::spawn(Self::servant_thread(
                                replica.clone(),
                                conn,
                                rx_term.clone(),
                            ));
                        }
                        Err(e) => {
                            pf_warn!(replica.whoami(); "error accepting connection: {}", e);
                        }
                    }
                },

                _ = rx_term.changed() => break,
            }
        }

        pf_debug!(replica.whoami(); "acceptor task exitted");
    }

    /// Serves one connection, request by request, until the peer closes it.
    async fn servant_thread(
        replica: Arc<ShardsetReplica>,
        mut conn: TcpStream,
        mut rx_term: watch::Receiver<bool>,
    ) {
        let mut read_buf = BytesMut::with_capacity(8 + 1024);

        loop {
            tokio::select! {
                req = recv_msg::<ApiRequest, _>(&mut read_buf, &mut conn) => {
                    let req = match req {
                        Ok(req) => req,
                        Err(_) => break, // peer closed the connection
                    };
                    match Self::handle_req(&replica, req).await {
                        Ok(reply) => {
                            if let Err(e) = send_msg(&reply, &mut conn).await {
                                pf_warn!(replica.whoami(); "error sending reply: {}", e);
                                break;
                            }
                        }
                        Err(e) => {
                            // decode failures and undecided-slot holes are
                            // software bugs, not conditions to paper over
                            pf_error!(replica.whoami(); "error serving request: {}", e);
                            break;
                        }
                    }
                },

                _ = rx_term.changed() => break,
            }
        }
    }

    /// Dispatches one decoded request to the replica core.
    async fn handle_req(
        replica: &ShardsetReplica,
        req: ApiRequest,
    ) -> Result<ApiReply, ShardsetError> {
        match req {
            ApiRequest::Get { cid, seq, key } => {
                let rep = replica.get(&cid, seq, &key).await?;
                Ok(ApiReply::Get {
                    err: rep.err,
                    value: rep.value,
                })
            }
            ApiRequest::PutAppend {
                cid,
                seq,
                kind,
                key,
                value,
            } => {
                let rep = replica.put_append(&cid, seq, kind, &key, &value).await?;
                Ok(ApiReply::PutAppend { err: rep.err })
            }
            ApiRequest::Transfer { config_num, shard } => {
                let (err, xstate) = replica.transfer_state(config_num, shard).await;
                Ok(ApiReply::Transfer { err, xstate })
            }
        }
    }
}

// ShardsetServerNode ticker task implementation
impl ShardsetServerNode {
    /// Periodic reconfiguration ticker task function.
    async fn ticker_thread(
        replica: Arc<ShardsetReplica>,
        tick_interval: Duration,
        mut rx_term: watch::Receiver<bool>,
    ) {
        let mut interval = time::interval(tick_interval);

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    if let Err(e) = replica.tick().await {
                        pf_error!(replica.whoami(); "error in tick: {}", e);
                    }
                },

                _ = rx_term.changed() => break,
            }
        }

        pf_debug!(replica.whoami(); "ticker task exitted");
    }
}

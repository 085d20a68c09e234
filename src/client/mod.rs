//! Client-side library: routes each request to the replica group that
//! owns the target key's shard, and retries (with the same request
//! identifier) on wrong-group replies and transport failures until some
//! group answers.

use std::net::SocketAddr;
use std::sync::Arc;

use bytes::BytesMut;
use rand::Rng;
use serde::Deserialize;
use tokio::time::{self, Duration};

use crate::master::{key2shard, Config, ShardMaster};
use crate::server::{ApiReply, ApiRequest, ErrCode, PutKind};
use crate::utils::{recv_msg, send_msg, tcp_connect_with_timeout, ShardsetError};

/// Configuration parameters struct.
#[derive(Debug, Clone, Deserialize)]
pub struct ClientConfig {
    /// Per-call timeout on connect and reply in millisecs.
    pub request_timeout_ms: u64,

    /// Sleep between whole-config retry rounds in millisecs.
    pub retry_interval_ms: u64,
}

impl Default for ClientConfig {
    fn default() -> Self {
        ClientConfig {
            request_timeout_ms: 500,
            retry_interval_ms: 100,
        }
    }
}

/// Shardset client endpoint. Not shareable across tasks: each client
/// issues one request at a time under one monotonically increasing
/// sequence number.
pub struct ShardsetClient {
    /// My client ID.
    cid: String,

    /// Sequence number of the next request.
    next_seq: u64,

    /// Shard master handle.
    master: Arc<dyn ShardMaster>,

    /// Cached shard configuration, refreshed on retry rounds.
    config: Config,

    /// Per-call timeout.
    request_timeout: Duration,

    /// Sleep between retry rounds.
    retry_interval: Duration,
}

impl ShardsetClient {
    /// Creates a client with a random id and the latest configuration.
    pub async fn new_and_setup(
        master: Arc<dyn ShardMaster>,
        config_str: Option<&str>,
    ) -> Result<Self, ShardsetError> {
        let config = parsed_config!(config_str => ClientConfig;
                                    request_timeout_ms, retry_interval_ms)?;
        let cid = format!("client-{:016x}", rand::thread_rng().gen::<u64>());
        let shard_config = master.query(None).await?;

        Ok(ShardsetClient {
            cid,
            next_seq: 1,
            master,
            config: shard_config,
            request_timeout: Duration::from_millis(config.request_timeout_ms),
            retry_interval: Duration::from_millis(config.retry_interval_ms),
        })
    }

    /// My client ID.
    pub fn id(&self) -> &str {
        &self.cid
    }

    /// Reads a key. `None` means the owning group has never stored it.
    pub async fn get(&mut self, key: &str) -> Result<Option<String>, ShardsetError> {
        let seq = self.next_seq;
        self.next_seq += 1;
        let req = ApiRequest::Get {
            cid: self.cid.clone(),
            seq,
            key: key.into(),
        };
        match self.request(key, &req).await? {
            ApiReply::Get {
                err: ErrCode::Ok,
                value,
            } => Ok(Some(value)),
            ApiReply::Get {
                err: ErrCode::NoKey,
                ..
            } => Ok(None),
            reply => logged_err!(self.cid; "unexpected reply {:?}", reply),
        }
    }

    /// Overwrites a key's value.
    pub async fn put(&mut self, key: &str, value: &str) -> Result<(), ShardsetError> {
        self.put_append(PutKind::Put, key, value).await
    }

    /// Concatenates onto a key's value (missing key reads as empty).
    pub async fn append(&mut self, key: &str, value: &str) -> Result<(), ShardsetError> {
        self.put_append(PutKind::Append, key, value).await
    }

    async fn put_append(
        &mut self,
        kind: PutKind,
        key: &str,
        value: &str,
    ) -> Result<(), ShardsetError> {
        let seq = self.next_seq;
        self.next_seq += 1;
        let req = ApiRequest::PutAppend {
            cid: self.cid.clone(),
            seq,
            kind,
            key: key.into(),
            value: value.into(),
        };
        match self.request(key, &req).await? {
            ApiReply::PutAppend { err: ErrCode::Ok } => Ok(()),
            reply => logged_err!(self.cid; "unexpected reply {:?}", reply),
        }
    }

    /// Tries every replica of the owning group; on a wrong-group reply, a
    /// transport failure, or an unowned shard, refreshes the configuration
    /// and retries the same request identifier until some group answers.
    async fn request(&mut self, key: &str, req: &ApiRequest) -> Result<ApiReply, ShardsetError> {
        loop {
            let gid = self.config.shards[key2shard(key)];
            if gid != 0 {
                if let Some(servers) = self.config.groups.get(&gid).cloned() {
                    for server in servers {
                        match self.call(server, req).await {
                            Ok(reply) => {
                                let wrong_group = matches!(
                                    reply,
                                    ApiReply::Get {
                                        err: ErrCode::WrongGroup,
                                        ..
                                    } | ApiReply::PutAppend {
                                        err: ErrCode::WrongGroup,
                                    }
                                );
                                if !wrong_group {
                                    return Ok(reply);
                                }
                            }
                            Err(e) => {
                                pf_debug!(self.cid; "call to {} failed: {}", server, e);
                            }
                        }
                    }
                }
            }

            time::sleep(self.retry_interval).await;
            self.config = self.master.query(None).await?;
        }
    }

    /// One request/reply exchange with one server, bounded by the per-call
    /// timeout.
    async fn call(
        &self,
        server: SocketAddr,
        req: &ApiRequest,
    ) -> Result<ApiReply, ShardsetError> {
        let mut conn = tcp_connect_with_timeout(server, self.request_timeout).await?;
        send_msg(req, &mut conn).await?;
        let mut read_buf = BytesMut::with_capacity(8 + 1024);
        let reply = time::timeout(self.request_timeout, recv_msg(&mut read_buf, &mut conn))
            .await??;
        Ok(reply)
    }
}

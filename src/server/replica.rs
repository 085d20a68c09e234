//! The replica core: sequences client operations, configuration changes,
//! and shard hand-offs onto the group's single totally ordered consensus
//! log, and applies decided slots to the state machine in order.
//!
//! All mutable state lives in one aggregate behind one mutex. RPC
//! handlers and the tick loop acquire it on entry; local serialization
//! comes from the mutex, cross-replica serialization from the log.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use bytes::BytesMut;
use tokio::sync::Mutex;
use tokio::time::{self, Duration};

use crate::master::{key2shard, Config, Gid, ReplicaId, ShardMaster, NSHARDS};
use crate::paxos::{Fate, PaxosLog};
use crate::server::external::{ApiReply, ApiRequest, ReplicaConfig};
use crate::server::statemach::{ErrCode, Op, PutKind, Rep, XState};
use crate::utils::{recv_msg, send_msg, tcp_connect_with_timeout, ShardsetError};

/// Mutable replica state guarded by the one mutex.
struct ReplicaCore {
    /// Latest applied shard configuration.
    config: Config,

    /// Key-value store plus per-client dedup tables.
    xstate: XState,

    /// Next log slot this replica will attempt to propose into.
    seq: u64,

    /// Next log slot this replica needs to apply; every slot below it has
    /// been applied.
    last_seq: u64,
}

/// One member of a replica group.
pub struct ShardsetReplica {
    /// My replica group ID.
    gid: Gid,

    /// My replica ID within the group.
    me: ReplicaId,

    /// Log line prefix, `gid:me`.
    whoami: String,

    /// Initial proposal backoff.
    backoff_init: Duration,

    /// Proposal backoff cap.
    backoff_cap: Duration,

    /// Per-peer timeout on shard-transfer calls.
    transfer_timeout: Duration,

    /// Shard master handle.
    master: Arc<dyn ShardMaster>,

    /// My handle onto the group's consensus log.
    log: Box<dyn PaxosLog>,

    /// Mirror of the applied `config.num`, written at `Reconf` apply time.
    /// Lets the shard-transfer readiness gate run without the mutex: a
    /// stale low value only causes a harmless retry, and monotonicity
    /// rules out a stale "ready".
    applied_config_num: AtomicU64,

    /// Everything mutable, under the one mutex.
    core: Mutex<ReplicaCore>,
}

impl ShardsetReplica {
    /// Creates a replica starting from configuration 0 and an empty state.
    pub fn new(
        gid: Gid,
        me: ReplicaId,
        master: Arc<dyn ShardMaster>,
        log: Box<dyn PaxosLog>,
        config: &ReplicaConfig,
    ) -> Self {
        ShardsetReplica {
            gid,
            me,
            whoami: format!("{}:{}", gid, me),
            backoff_init: Duration::from_millis(config.backoff_init_ms),
            backoff_cap: Duration::from_millis(config.backoff_cap_ms),
            transfer_timeout: Duration::from_millis(config.transfer_timeout_ms),
            master,
            log,
            applied_config_num: AtomicU64::new(0),
            core: Mutex::new(ReplicaCore {
                config: Config::default(),
                xstate: XState::default(),
                seq: 0,
                last_seq: 0,
            }),
        }
    }

    /// My replica ID within the group.
    pub fn id(&self) -> ReplicaId {
        self.me
    }

    /// Log line prefix, `gid:me`.
    pub(crate) fn whoami(&self) -> &str {
        &self.whoami
    }

    /// Shuts down my consensus log handle.
    pub fn kill(&self) {
        self.log.kill();
    }
}

// ShardsetReplica log driver
impl ShardsetReplica {
    /// Proposes `xop` starting at the next free slot and returns once some
    /// slot holds a decided value semantically equal to it. The caller's
    /// own proposal need not have won: a retried client op may have been
    /// logged first by a peer, and equality is all at-most-once needs.
    async fn log_operation(
        &self,
        core: &mut ReplicaCore,
        xop: &Op,
    ) -> Result<(), ShardsetError> {
        let mut slot = core.seq;
        let mut wait = self.backoff_init;
        loop {
            match self.log.status(slot)? {
                Fate::Decided(op) => {
                    if xop.is_same(&op) {
                        break;
                    }
                    slot += 1;
                    wait = self.backoff_init;
                }
                Fate::Pending => {
                    pf_trace!(self.whoami; "starting instance at slot {}", slot);
                    self.log.start(slot, xop)?;
                    // sleep with the mutex held: no other local operation
                    // may advance the log or the state while this proposal
                    // is in flight
                    time::sleep(wait).await;
                    if wait < self.backoff_cap {
                        wait = std::cmp::min(wait * 2, self.backoff_cap);
                    }
                }
                Fate::Forgotten => {
                    return logged_err!(self.whoami; "slot {} already forgotten", slot);
                }
            }
        }
        core.seq = slot + 1;
        Ok(())
    }

    /// Applies every decided slot in `[last_seq, seq)` to the state machine
    /// in order, acknowledging each via `done` for truncation. Returns the
    /// reply of the last applied client op, which after a `log_operation`
    /// is exactly the caller's own reply.
    async fn catch_up(&self, core: &mut ReplicaCore) -> Result<Option<Rep>, ShardsetError> {
        let mut rep = None;
        while core.last_seq < core.seq {
            let slot = core.last_seq;
            let op = match self.log.status(slot)? {
                Fate::Decided(op) => op,
                _ => {
                    return logged_err!(self.whoami; "slot {} not decided during catch-up", slot);
                }
            };
            match op {
                Op::Reconf { num, xstate } => {
                    core.config = self.master.query(Some(num)).await?;
                    core.xstate.update(&xstate);
                    self.applied_config_num
                        .store(core.config.num, Ordering::Release);
                    pf_debug!(self.whoami; "applied reconf to config {}", core.config.num);
                }
                Op::Get { cid, seq, key } => {
                    let r = self.do_get(core, &key);
                    Self::record_operation(core, &cid, seq, &r);
                    rep = Some(r);
                }
                Op::Put {
                    cid,
                    seq,
                    key,
                    value,
                } => {
                    let r = self.do_put_append(core, PutKind::Put, &key, &value);
                    Self::record_operation(core, &cid, seq, &r);
                    rep = Some(r);
                }
                Op::Append {
                    cid,
                    seq,
                    key,
                    value,
                } => {
                    let r = self.do_put_append(core, PutKind::Append, &key, &value);
                    Self::record_operation(core, &cid, seq, &r);
                    rep = Some(r);
                }
            }
            self.log.done(slot);
            core.last_seq = slot + 1;
        }
        Ok(rep)
    }
}

// ShardsetReplica state machine operations
impl ShardsetReplica {
    /// Ownership is checked at apply time, not at RPC entry: an op may be
    /// logged before a reconfiguration and applied after it.
    fn do_get(&self, core: &ReplicaCore, key: &str) -> Rep {
        if core.config.shards[key2shard(key)] != self.gid {
            pf_debug!(self.whoami; "get '{}': wrong group at config {}", key, core.config.num);
            return Rep::of(ErrCode::WrongGroup);
        }
        match core.xstate.kv_store.get(key) {
            Some(value) => Rep {
                err: ErrCode::Ok,
                value: value.clone(),
            },
            None => Rep::of(ErrCode::NoKey),
        }
    }

    fn do_put_append(
        &self,
        core: &mut ReplicaCore,
        kind: PutKind,
        key: &str,
        value: &str,
    ) -> Rep {
        if core.config.shards[key2shard(key)] != self.gid {
            pf_debug!(self.whoami; "write '{}': wrong group at config {}", key, core.config.num);
            return Rep::of(ErrCode::WrongGroup);
        }
        match kind {
            PutKind::Put => {
                core.xstate.kv_store.insert(key.into(), value.into());
            }
            PutKind::Append => {
                core.xstate
                    .kv_store
                    .entry(key.into())
                    .or_default()
                    .push_str(value);
            }
        }
        Rep::of(ErrCode::Ok)
    }

    /// Wrong-group replies are not recorded: the client will retry against
    /// another group and that retry must not be suppressed here.
    fn record_operation(core: &mut ReplicaCore, cid: &str, seq: u64, rep: &Rep) {
        if rep.err != ErrCode::WrongGroup {
            core.xstate.mrrs.insert(cid.into(), seq);
            core.xstate.replies.insert(cid.into(), rep.clone());
        }
    }

    /// Checks `(cid, seq)` against the dedup table. A stale sequence gets a
    /// benign empty reply (the client has long moved on); the most recent
    /// sequence gets the cached reply; anything newer proceeds to the log.
    fn filter_duplicate(core: &ReplicaCore, cid: &str, seq: u64) -> Option<Rep> {
        let last = core.xstate.mrrs.get(cid).copied().unwrap_or(0);
        if seq < last {
            Some(Rep::of(ErrCode::Ok))
        } else if seq == last {
            core.xstate.replies.get(cid).cloned()
        } else {
            None
        }
    }
}

// ShardsetReplica client request handlers
impl ShardsetReplica {
    /// Serves one client `Get`.
    pub async fn get(&self, cid: &str, seq: u64, key: &str) -> Result<Rep, ShardsetError> {
        let mut core = self.core.lock().await;
        pf_trace!(self.whoami; "rpc get: client {} seq {} key '{}'", cid, seq, key);

        // catch up first so the dedup tables reflect every decided slot
        self.catch_up(&mut core).await?;

        if let Some(rep) = Self::filter_duplicate(&core, cid, seq) {
            pf_debug!(self.whoami; "duplicate get from {} seq {}", cid, seq);
            return Ok(rep);
        }

        let xop = Op::Get {
            cid: cid.into(),
            seq,
            key: key.into(),
        };
        self.log_operation(&mut core, &xop).await?;

        match self.catch_up(&mut core).await? {
            Some(rep) => Ok(rep),
            None => logged_err!(self.whoami; "no reply applied for get seq {}", seq),
        }
    }

    /// Serves one client `Put` or `Append`.
    pub async fn put_append(
        &self,
        cid: &str,
        seq: u64,
        kind: PutKind,
        key: &str,
        value: &str,
    ) -> Result<Rep, ShardsetError> {
        let mut core = self.core.lock().await;
        pf_trace!(self.whoami; "rpc put_append: client {} seq {} {:?} key '{}'",
                  cid, seq, kind, key);

        self.catch_up(&mut core).await?;

        if let Some(rep) = Self::filter_duplicate(&core, cid, seq) {
            pf_debug!(self.whoami; "duplicate write from {} seq {}", cid, seq);
            return Ok(rep);
        }

        let xop = match kind {
            PutKind::Put => Op::Put {
                cid: cid.into(),
                seq,
                key: key.into(),
                value: value.into(),
            },
            PutKind::Append => Op::Append {
                cid: cid.into(),
                seq,
                key: key.into(),
                value: value.into(),
            },
        };
        self.log_operation(&mut core, &xop).await?;

        match self.catch_up(&mut core).await? {
            Some(rep) => Ok(rep),
            None => logged_err!(self.whoami; "no reply applied for write seq {}", seq),
        }
    }
}

// ShardsetReplica shard transfer
impl ShardsetReplica {
    /// Serves a peer group's request for one shard's keys plus the full
    /// dedup table. Refuses while this replica's applied configuration is
    /// behind the requester's, since state handed out early could still
    /// change.
    pub async fn transfer_state(&self, config_num: u64, shard: usize) -> (ErrCode, Option<XState>) {
        if self.applied_config_num.load(Ordering::Acquire) < config_num {
            return (ErrCode::NotReady, None);
        }

        let core = self.core.lock().await;
        pf_debug!(self.whoami; "serving transfer of shard {} for config {}", shard, config_num);

        let mut xstate = XState::default();
        for (key, value) in &core.xstate.kv_store {
            if key2shard(key) == shard {
                xstate.kv_store.insert(key.clone(), value.clone());
            }
        }
        // the full dedup table goes along: a client may migrate across
        // shards, and dropping it would let an old op apply twice
        xstate.mrrs = core.xstate.mrrs.clone();
        xstate.replies = core.xstate.replies.clone();

        (ErrCode::Ok, Some(xstate))
    }

    /// Pulls one shard from any replica of its previous owner. `None`
    /// means every peer failed or refused, and the reconfiguration should
    /// be retried at the next tick.
    async fn request_shard(
        &self,
        core: &ReplicaCore,
        gid: Gid,
        shard: usize,
    ) -> Option<XState> {
        let servers = match core.config.groups.get(&gid) {
            Some(servers) => servers.clone(),
            None => return None,
        };
        let args = ApiRequest::Transfer {
            config_num: core.config.num,
            shard,
        };
        for server in servers {
            match self.call_transfer(server, &args).await {
                Ok(ApiReply::Transfer {
                    err: ErrCode::Ok,
                    xstate: Some(xstate),
                }) => return Some(xstate),
                Ok(_) => continue, // not ready; try the next peer
                Err(e) => {
                    pf_debug!(self.whoami; "transfer call to {} failed: {}", server, e);
                    continue;
                }
            }
        }
        pf_debug!(self.whoami; "request of shard {} from group {} failed", shard, gid);
        None
    }

    /// One shard-transfer call to one peer, bounded by a timeout so that a
    /// peer stuck behind its own mutex cannot wedge this group forever.
    async fn call_transfer(
        &self,
        server: SocketAddr,
        args: &ApiRequest,
    ) -> Result<ApiReply, ShardsetError> {
        let mut conn = tcp_connect_with_timeout(server, self.transfer_timeout).await?;
        send_msg(args, &mut conn).await?;
        let mut read_buf = BytesMut::with_capacity(8 + 4096);
        let reply = time::timeout(self.transfer_timeout, recv_msg(&mut read_buf, &mut conn))
            .await??;
        Ok(reply)
    }
}

// ShardsetReplica reconfiguration driver
impl ShardsetReplica {
    /// Polls the shard master and walks this group from its applied
    /// configuration to the latest, one configuration at a time. Stops at
    /// the first incomplete step; the next tick retries.
    pub async fn tick(&self) -> Result<(), ShardsetError> {
        let mut core = self.core.lock().await;

        // catch up first, in case peers already logged reconfigurations
        self.catch_up(&mut core).await?;

        let latest = self.master.query(None).await?;
        for num in core.config.num + 1..=latest.num {
            let target = self.master.query(Some(num)).await?;
            if !self.reconfigure(&mut core, &target).await? {
                break;
            }
        }
        Ok(())
    }

    /// Drives the group from configuration `target.num - 1` to `target`:
    /// collects every newly owned shard from its previous owner, then logs
    /// one `Reconf` op carrying the merged state, so that all group
    /// members incorporate identical transferred state at the same log
    /// position. Returns `Ok(false)` if some shard could not be collected
    /// yet (nothing is logged; retried later).
    async fn reconfigure(
        &self,
        core: &mut ReplicaCore,
        target: &Config,
    ) -> Result<bool, ShardsetError> {
        // ensure the applied config is exactly target.num - 1
        self.catch_up(core).await?;

        let mut xstate = XState::default();
        for shard in 0..NSHARDS {
            let prev = core.config.shards[shard];
            if target.shards[shard] == self.gid && prev != 0 && prev != self.gid {
                match self.request_shard(core, prev, shard).await {
                    Some(incoming) => xstate.update(&incoming),
                    None => {
                        pf_debug!(self.whoami; "reconfigure to {} incomplete at shard {}",
                                  target.num, shard);
                        return Ok(false);
                    }
                }
            }
        }

        let xop = Op::Reconf {
            num: target.num,
            xstate,
        };
        self.log_operation(core, &xop).await?;
        Ok(true)
    }
}

#[cfg(test)]
mod replica_tests {
    use super::*;
    use crate::master::LocalMaster;
    use crate::paxos::MemPaxos;
    use std::collections::HashMap;

    fn test_replica_config() -> ReplicaConfig {
        ReplicaConfig {
            tick_interval_ms: 10,
            backoff_init_ms: 1,
            backoff_cap_ms: 20,
            transfer_timeout_ms: 100,
            bind_retries: 0,
        }
    }

    fn make_group(gid: Gid, population: usize, master: &Arc<LocalMaster>) -> Vec<ShardsetReplica> {
        let sm: Arc<dyn ShardMaster> = master.clone();
        MemPaxos::group(population)
            .into_iter()
            .enumerate()
            .map(|(me, log)| {
                ShardsetReplica::new(
                    gid,
                    me as ReplicaId,
                    sm.clone(),
                    Box::new(log),
                    &test_replica_config(),
                )
            })
            .collect()
    }

    /// Publishes a config assigning all shards to `gid` (no previous owner
    /// other than the sentinel or `gid` itself, so no transfers needed).
    fn own_all_shards(master: &LocalMaster, gid: Gid) {
        let mut groups = HashMap::new();
        groups.insert(gid, Vec::new());
        master.advance([gid; NSHARDS], groups);
    }

    #[tokio::test]
    async fn single_group_progress() -> Result<(), ShardsetError> {
        let master = Arc::new(LocalMaster::new());
        own_all_shards(&master, 1);
        let replicas = make_group(1, 3, &master);
        for r in &replicas {
            r.tick().await?;
        }

        let rep = replicas[0].put_append("c1", 1, PutKind::Put, "a", "1").await?;
        assert_eq!(rep.err, ErrCode::Ok);
        let rep = replicas[1]
            .put_append("c1", 2, PutKind::Append, "a", "2")
            .await?;
        assert_eq!(rep.err, ErrCode::Ok);

        // kill one replica; the others still make progress
        replicas[0].kill();
        let rep = replicas[2].get("c1", 3, "a").await?;
        assert_eq!(rep.err, ErrCode::Ok);
        assert_eq!(rep.value, "12");

        let rep = replicas[1].get("c1", 4, "nope").await?;
        assert_eq!(rep.err, ErrCode::NoKey);
        Ok(())
    }

    #[tokio::test]
    async fn duplicate_request_applies_once() -> Result<(), ShardsetError> {
        let master = Arc::new(LocalMaster::new());
        own_all_shards(&master, 1);
        let replicas = make_group(1, 3, &master);
        replicas[0].tick().await?;

        let rep = replicas[0]
            .put_append("c1", 1, PutKind::Append, "k", "v")
            .await?;
        assert_eq!(rep.err, ErrCode::Ok);

        // network replays the same (cid, seq) to a different replica
        let rep = replicas[1]
            .put_append("c1", 1, PutKind::Append, "k", "v")
            .await?;
        assert_eq!(rep.err, ErrCode::Ok);

        let rep = replicas[2].get("c1", 2, "k").await?;
        assert_eq!(rep.value, "v");
        Ok(())
    }

    #[tokio::test]
    async fn stale_seq_gets_benign_reply() -> Result<(), ShardsetError> {
        let master = Arc::new(LocalMaster::new());
        own_all_shards(&master, 1);
        let replicas = make_group(1, 1, &master);
        replicas[0].tick().await?;

        replicas[0].put_append("c1", 1, PutKind::Put, "k", "v1").await?;
        replicas[0].put_append("c1", 2, PutKind::Put, "k", "v2").await?;

        // seq 1 is now stale; the reply is benign and nothing is mutated
        let rep = replicas[0].put_append("c1", 1, PutKind::Put, "k", "v1").await?;
        assert_eq!(rep.err, ErrCode::Ok);
        assert_eq!(rep.value, "");

        let rep = replicas[0].get("c1", 3, "k").await?;
        assert_eq!(rep.value, "v2");
        Ok(())
    }

    #[tokio::test]
    async fn cached_reply_returned_verbatim() -> Result<(), ShardsetError> {
        let master = Arc::new(LocalMaster::new());
        own_all_shards(&master, 1);
        let replicas = make_group(1, 2, &master);
        replicas[0].tick().await?;

        replicas[0].put_append("c1", 1, PutKind::Put, "k", "v").await?;
        let first = replicas[0].get("c1", 2, "k").await?;
        let replay = replicas[1].get("c1", 2, "k").await?;
        assert_eq!(first, replay);
        Ok(())
    }

    #[tokio::test]
    async fn wrong_group_not_recorded() -> Result<(), ShardsetError> {
        let master = Arc::new(LocalMaster::new());
        let unowned = key2shard("x");

        // config 1: group 1 owns everything except the shard of "x"
        let mut shards = [1 as Gid; NSHARDS];
        shards[unowned] = 0;
        let mut groups = HashMap::new();
        groups.insert(1, Vec::new());
        master.advance(shards, groups.clone());

        let replicas = make_group(1, 1, &master);
        replicas[0].tick().await?;

        let rep = replicas[0]
            .put_append("c1", 1, PutKind::Put, "x", "hello")
            .await?;
        assert_eq!(rep.err, ErrCode::WrongGroup);

        // config 2 hands the shard over (previous owner is the sentinel,
        // so no transfer); the retry with the same (cid, seq) must not be
        // suppressed by the dedup table
        master.advance([1; NSHARDS], groups);
        replicas[0].tick().await?;

        let rep = replicas[0]
            .put_append("c1", 1, PutKind::Put, "x", "hello")
            .await?;
        assert_eq!(rep.err, ErrCode::Ok);
        let rep = replicas[0].get("c1", 2, "x").await?;
        assert_eq!(rep.value, "hello");
        Ok(())
    }

    #[tokio::test]
    async fn transfer_refused_until_caught_up() -> Result<(), ShardsetError> {
        let master = Arc::new(LocalMaster::new());
        let replicas = make_group(1, 1, &master);

        // replica still at applied config 0
        let (err, xstate) = replicas[0].transfer_state(3, 2).await;
        assert_eq!(err, ErrCode::NotReady);
        assert!(xstate.is_none());

        own_all_shards(&master, 1); // 1
        own_all_shards(&master, 1); // 2
        own_all_shards(&master, 1); // 3
        replicas[0].tick().await?;
        // the final reconf is logged by the first tick and applied by the
        // second one's catch-up
        replicas[0].tick().await?;

        let (err, xstate) = replicas[0].transfer_state(3, 2).await;
        assert_eq!(err, ErrCode::Ok);
        assert!(xstate.is_some());
        Ok(())
    }

    #[tokio::test]
    async fn transfer_snapshot_idempotent() -> Result<(), ShardsetError> {
        let master = Arc::new(LocalMaster::new());
        own_all_shards(&master, 1);
        let replicas = make_group(1, 1, &master);
        replicas[0].tick().await?;

        replicas[0].put_append("c1", 1, PutKind::Put, "a", "1").await?;
        replicas[0].put_append("c1", 2, PutKind::Put, "b", "2").await?;

        let shard = key2shard("a");
        let (err1, xs1) = replicas[0].transfer_state(1, shard).await;
        let (err2, xs2) = replicas[0].transfer_state(1, shard).await;
        assert_eq!(err1, ErrCode::Ok);
        assert_eq!(err2, ErrCode::Ok);
        assert_eq!(xs1, xs2);

        // only keys of the requested shard are included
        let xs = xs1.unwrap();
        assert!(xs.kv_store.contains_key("a"));
        for key in xs.kv_store.keys() {
            assert_eq!(key2shard(key), shard);
        }
        // while the dedup table is complete
        assert_eq!(xs.mrrs.get("c1"), Some(&2));
        Ok(())
    }

    #[tokio::test]
    async fn lagging_replica_converges_by_replay() -> Result<(), ShardsetError> {
        let master = Arc::new(LocalMaster::new());
        own_all_shards(&master, 1);
        let replicas = make_group(1, 3, &master);
        replicas[0].tick().await?;

        // replica 2 sees none of this traffic
        for i in 1..=5u64 {
            replicas[i as usize % 2]
                .put_append("c1", i, PutKind::Append, "log", "x")
                .await?;
        }
        own_all_shards(&master, 1); // config 2
        replicas[0].tick().await?;
        own_all_shards(&master, 1); // config 3
        replicas[1].tick().await?;

        // on heal, one tick replays every decided slot, reconfs included
        replicas[2].tick().await?;

        let rep = replicas[2].get("c2", 1, "log").await?;
        assert_eq!(rep.err, ErrCode::Ok);
        assert_eq!(rep.value, "xxxxx");

        // a request through replica 0 drags it over the log tail too
        let rep = replicas[0].get("c3", 1, "log").await?;
        assert_eq!(rep.value, "xxxxx");

        let (c0, c2) = (
            replicas[0].core.lock().await.config.num,
            replicas[2].core.lock().await.config.num,
        );
        assert_eq!(c0, 3);
        assert_eq!(c2, 3);
        let (x0, x2) = (
            replicas[0].core.lock().await.xstate.clone(),
            replicas[2].core.lock().await.xstate.clone(),
        );
        assert_eq!(x0.kv_store, x2.kv_store);
        Ok(())
    }
}

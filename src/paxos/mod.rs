//! Consensus log interface: the multi-instance log-ordering service each
//! replica group runs underneath its state machine.
//!
//! The consensus protocol itself is an external collaborator consumed
//! through the `PaxosLog` trait. `MemPaxos` is an in-process stand-in
//! that decides each slot for the first proposer; it stores values in
//! their encoded form so that the decide/decode/semantic-equality path
//! the log driver depends on is exercised for real. Tests and the
//! local-cluster binary run on it; deployments substitute a networked
//! implementation behind the same trait.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use crate::server::Op;
use crate::utils::ShardsetError;

/// Fate of one log slot as observed by a replica.
#[derive(Debug, Clone)]
pub enum Fate {
    /// Slot has a decided value.
    Decided(Op),

    /// No value decided at this slot yet.
    Pending,

    /// Slot lies below the group's collective `done` watermark and its
    /// value has been truncated away.
    Forgotten,
}

/// Interface to the per-group consensus log. All calls are cheap, local,
/// and safe to make while holding the replica mutex.
pub trait PaxosLog: Send + Sync {
    /// Proposes `op` as the value of `slot`. Proposals for already-decided
    /// or forgotten slots are ignored.
    fn start(&self, slot: u64, op: &Op) -> Result<(), ShardsetError>;

    /// Polls the fate of `slot`.
    fn status(&self, slot: u64) -> Result<Fate, ShardsetError>;

    /// Declares that this replica will never again need `slot` or anything
    /// below it, enabling log truncation once every group member agrees.
    fn done(&self, slot: u64);

    /// Shuts this replica's handle down.
    fn kill(&self);
}

struct MemPaxosInner {
    /// Decided slot values, kept in encoded form.
    decided: HashMap<u64, Vec<u8>>,

    /// Per-replica `done` watermark (`None` until first call).
    done: Vec<Option<u64>>,

    /// Slots below this index have been truncated.
    floor: u64,
}

/// One replica's handle onto a shared in-memory consensus log.
pub struct MemPaxos {
    inner: Arc<Mutex<MemPaxosInner>>,
    me: usize,
    dead: AtomicBool,
}

impl MemPaxos {
    /// Creates the shared log of one replica group, returning one handle
    /// per member.
    pub fn group(num_replicas: usize) -> Vec<MemPaxos> {
        assert!(num_replicas > 0);
        let inner = Arc::new(Mutex::new(MemPaxosInner {
            decided: HashMap::new(),
            done: vec![None; num_replicas],
            floor: 0,
        }));
        (0..num_replicas)
            .map(|me| MemPaxos {
                inner: inner.clone(),
                me,
                dead: AtomicBool::new(false),
            })
            .collect()
    }

    fn check_alive(&self) -> Result<(), ShardsetError> {
        if self.dead.load(Ordering::Acquire) {
            Err(ShardsetError::msg("paxos handle killed"))
        } else {
            Ok(())
        }
    }
}

impl PaxosLog for MemPaxos {
    fn start(&self, slot: u64, op: &Op) -> Result<(), ShardsetError> {
        self.check_alive()?;
        let mut inner = self.inner.lock().unwrap();
        if slot < inner.floor || inner.decided.contains_key(&slot) {
            return Ok(());
        }
        // first proposal for a slot wins immediately
        let encoded = rmp_serde::encode::to_vec(op)?;
        inner.decided.insert(slot, encoded);
        Ok(())
    }

    fn status(&self, slot: u64) -> Result<Fate, ShardsetError> {
        self.check_alive()?;
        let inner = self.inner.lock().unwrap();
        if slot < inner.floor {
            return Ok(Fate::Forgotten);
        }
        match inner.decided.get(&slot) {
            Some(encoded) => {
                let op: Op = rmp_serde::decode::from_slice(encoded)?;
                Ok(Fate::Decided(op))
            }
            None => Ok(Fate::Pending),
        }
    }

    fn done(&self, slot: u64) {
        let mut inner = self.inner.lock().unwrap();
        if inner.done[self.me].map_or(true, |watermark| watermark < slot) {
            inner.done[self.me] = Some(slot);
        }
        // truncate once every member has acknowledged a prefix; `None`
        // sorts below `Some`, so `min()` stays `None` until then
        if let Some(min) = inner.done.iter().copied().min().flatten() {
            inner.floor = min + 1;
            let floor = inner.floor;
            inner.decided.retain(|&slot, _| slot >= floor);
        }
    }

    fn kill(&self) {
        self.dead.store(true, Ordering::Release);
    }
}

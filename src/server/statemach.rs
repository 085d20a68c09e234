//! Value types sequenced through the consensus log, and the transferable
//! state machine state they act on.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// Flavor of a client write.
#[derive(Debug, PartialEq, Eq, Clone, Copy, Serialize, Deserialize)]
pub enum PutKind {
    /// Overwrite the key's value.
    Put,

    /// Concatenate onto the key's value (missing key reads as empty).
    Append,
}

/// One operation logged through consensus: a client request or a
/// reconfiguration marker carrying the state transferred in from the
/// shards' previous owners.
///
/// `Op` deliberately does not derive `PartialEq`: log matching uses the
/// semantic equality of [`Op::is_same`], under which a `Reconf`'s state
/// payload is never compared.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Op {
    /// Read the value of a key.
    Get { cid: String, seq: u64, key: String },

    /// Overwrite the value of a key.
    Put {
        cid: String,
        seq: u64,
        key: String,
        value: String,
    },

    /// Concatenate onto the value of a key.
    Append {
        cid: String,
        seq: u64,
        key: String,
        value: String,
    },

    /// Advance to configuration `num`, merging in the transferred state.
    Reconf { num: u64, xstate: XState },
}

impl Op {
    /// Semantic log-matching equality: two client ops are the same when
    /// their kind and `(cid, seq)` identifier agree; two `Reconf`s are the
    /// same when their config numbers agree. Two replicas may race to
    /// propose the same reconfiguration with identically valid but not
    /// byte-equal state snapshots, so the payload must stay out of the
    /// comparison.
    pub fn is_same(&self, other: &Op) -> bool {
        match (self, other) {
            (Op::Reconf { num: a, .. }, Op::Reconf { num: b, .. }) => a == b,
            (
                Op::Get {
                    cid: c1, seq: s1, ..
                },
                Op::Get {
                    cid: c2, seq: s2, ..
                },
            )
            | (
                Op::Put {
                    cid: c1, seq: s1, ..
                },
                Op::Put {
                    cid: c2, seq: s2, ..
                },
            )
            | (
                Op::Append {
                    cid: c1, seq: s1, ..
                },
                Op::Append {
                    cid: c2, seq: s2, ..
                },
            ) => c1 == c2 && s1 == s2,
            _ => false,
        }
    }
}

/// Reply status code, a closed set shared by all RPCs.
#[derive(Debug, PartialEq, Eq, Clone, Copy, Serialize, Deserialize)]
pub enum ErrCode {
    /// Operation applied (or, for a read, answered).
    Ok,

    /// `Get` on a key the owning group has never stored. A real reply:
    /// it is recorded in the dedup table like any success.
    NoKey,

    /// This group does not own the key's shard at apply time. Never
    /// recorded, so the client's retry against another group is not
    /// suppressed.
    WrongGroup,

    /// Shard-transfer sender has not yet reached the requested
    /// configuration.
    NotReady,
}

/// Reply produced by applying one client op; compatible with both the
/// `Get` and `PutAppend` reply shapes.
#[derive(Debug, PartialEq, Eq, Clone, Serialize, Deserialize)]
pub struct Rep {
    pub err: ErrCode,
    pub value: String,
}

impl Rep {
    pub(crate) fn of(err: ErrCode) -> Self {
        Rep {
            err,
            value: String::new(),
        }
    }
}

/// The transferable part of the state machine: the key-value store plus
/// the per-client duplicate-suppression tables. This is what migrates
/// between groups on reconfiguration.
#[derive(Debug, Default, PartialEq, Eq, Clone, Serialize, Deserialize)]
pub struct XState {
    /// The key-value store.
    pub kv_store: HashMap<String, String>,

    /// Most recent request sequence applied, per client.
    pub mrrs: HashMap<String, u64>,

    /// Reply produced at that most recent application, per client.
    pub replies: HashMap<String, Rep>,
}

impl XState {
    /// Merges `other` into `self`: incoming keys win on collision (shards
    /// are disjoint across senders in practice), and for each client the
    /// entry with the higher applied sequence is kept.
    pub fn update(&mut self, other: &XState) {
        for (key, value) in &other.kv_store {
            self.kv_store.insert(key.clone(), value.clone());
        }

        for (cid, &seq) in &other.mrrs {
            let known = self.mrrs.get(cid).copied().unwrap_or(0);
            if known < seq {
                self.mrrs.insert(cid.clone(), seq);
                if let Some(rep) = other.replies.get(cid) {
                    self.replies.insert(cid.clone(), rep.clone());
                }
            }
        }
    }
}

#[cfg(test)]
mod statemach_tests {
    use super::*;

    #[test]
    fn is_same_client_ops() {
        let put = Op::Put {
            cid: "c1".into(),
            seq: 3,
            key: "a".into(),
            value: "1".into(),
        };
        let put_retry = Op::Put {
            cid: "c1".into(),
            seq: 3,
            key: "a".into(),
            value: "1".into(),
        };
        let put_next = Op::Put {
            cid: "c1".into(),
            seq: 4,
            key: "a".into(),
            value: "2".into(),
        };
        let append = Op::Append {
            cid: "c1".into(),
            seq: 3,
            key: "a".into(),
            value: "1".into(),
        };

        assert!(put.is_same(&put_retry));
        assert!(!put.is_same(&put_next));
        // kind must match even under an equal (cid, seq)
        assert!(!put.is_same(&append));
    }

    #[test]
    fn is_same_reconf_ignores_payload() {
        let mut xstate = XState::default();
        xstate.kv_store.insert("a".into(), "1".into());
        let with_state = Op::Reconf { num: 2, xstate };
        let without_state = Op::Reconf {
            num: 2,
            xstate: XState::default(),
        };
        let next = Op::Reconf {
            num: 3,
            xstate: XState::default(),
        };

        assert!(with_state.is_same(&without_state));
        assert!(!with_state.is_same(&next));
    }

    #[test]
    fn is_same_reconf_vs_client() {
        let reconf = Op::Reconf {
            num: 2,
            xstate: XState::default(),
        };
        let get = Op::Get {
            cid: "c1".into(),
            seq: 2,
            key: "a".into(),
        };
        assert!(!reconf.is_same(&get));
        assert!(!get.is_same(&reconf));
    }

    #[test]
    fn update_merges_store() {
        let mut base = XState::default();
        base.kv_store.insert("a".into(), "old".into());
        base.kv_store.insert("b".into(), "keep".into());

        let mut incoming = XState::default();
        incoming.kv_store.insert("a".into(), "new".into());
        incoming.kv_store.insert("c".into(), "add".into());

        base.update(&incoming);
        assert_eq!(base.kv_store["a"], "new");
        assert_eq!(base.kv_store["b"], "keep");
        assert_eq!(base.kv_store["c"], "add");
    }

    #[test]
    fn update_keeps_higher_client_seq() {
        let mut base = XState::default();
        base.mrrs.insert("c1".into(), 5);
        base.replies.insert(
            "c1".into(),
            Rep {
                err: ErrCode::Ok,
                value: "five".into(),
            },
        );

        let mut stale = XState::default();
        stale.mrrs.insert("c1".into(), 3);
        stale.replies.insert(
            "c1".into(),
            Rep {
                err: ErrCode::Ok,
                value: "three".into(),
            },
        );
        base.update(&stale);
        assert_eq!(base.mrrs["c1"], 5);
        assert_eq!(base.replies["c1"].value, "five");

        let mut fresher = XState::default();
        fresher.mrrs.insert("c1".into(), 8);
        fresher.replies.insert(
            "c1".into(),
            Rep {
                err: ErrCode::NoKey,
                value: String::new(),
            },
        );
        base.update(&fresher);
        assert_eq!(base.mrrs["c1"], 8);
        assert_eq!(base.replies["c1"].err, ErrCode::NoKey);
    }
}

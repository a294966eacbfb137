//! CRDT provider interface and the built-in last-writer-wins provider.
//!
//! The engine treats the CRDT as a black box: it can initialize a document,
//! load one from a snapshot, apply opaque binary changes, produce exactly
//! one change from a synchronous mutation closure, and ask a change for its
//! hash and dependency hashes. Any CRDT with that shape plugs in here.
//!
//! The built-in provider is a last-writer-wins map: each change carries a
//! Lamport counter and its dependency heads, and conflicting writes to the
//! same key resolve by `(counter, change hash)` — a total order every peer
//! agrees on, so converged entry sets imply converged state.

use std::collections::{BTreeMap, BTreeSet};

use mindoo_crypto::hash::sha256_hex;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::DbError;
use crate::payload::DocumentData;

// ---------------------------------------------------------------------------
// Provider interface
// ---------------------------------------------------------------------------

/// An encoded change plus the identifiers the entry id is derived from.
#[derive(Clone, Debug)]
pub struct CrdtChange {
    pub bytes: Vec<u8>,
    pub hash: String,
    pub dep_hashes: Vec<String>,
}

/// Hash and dependency hashes of an encoded change.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CrdtChangeInfo {
    pub hash: String,
    pub dep_hashes: Vec<String>,
}

/// One live document.
pub trait CrdtDoc: Send {
    /// Current projected value.
    fn data(&self) -> DocumentData;

    /// Hashes of the changes nothing else depends on yet.
    fn get_heads(&self) -> Vec<String>;

    /// Apply a remote change. Idempotent.
    fn apply(&mut self, change: &[u8]) -> Result<(), DbError>;

    /// Run `mutator` against the current value inside a synchronous
    /// transaction and emit exactly one change, or `None` when the mutation
    /// didn't alter anything.
    fn transact(
        &mut self,
        mutator: &mut dyn FnMut(&mut DocumentData),
    ) -> Result<Option<CrdtChange>, DbError>;

    /// Snapshot encoding of the full document state.
    fn save(&self) -> Vec<u8>;
}

/// Factory and codec for one CRDT implementation.
pub trait CrdtProvider: Send + Sync {
    fn init(&self) -> Box<dyn CrdtDoc>;
    fn load(&self, snapshot: &[u8]) -> Result<Box<dyn CrdtDoc>, DbError>;
    fn decode_change(&self, change: &[u8]) -> Result<CrdtChangeInfo, DbError>;
}

// ---------------------------------------------------------------------------
// Built-in LWW provider
// ---------------------------------------------------------------------------

const LWW_VERSION: u8 = 1;

#[derive(Clone, Debug, Serialize, Deserialize)]
struct LwwOp {
    key: String,
    /// `None` removes the key.
    value: Option<Value>,
}

/// Wire form of one change. Serialization is canonical: struct field order
/// is fixed and maps are sorted, so the hash is stable across peers.
#[derive(Clone, Debug, Serialize, Deserialize)]
struct LwwChangeBody {
    v: u8,
    actor: String,
    counter: u64,
    deps: Vec<String>,
    ops: Vec<LwwOp>,
}

impl LwwChangeBody {
    fn encode(&self) -> Vec<u8> {
        serde_json::to_vec(self).expect("change body serializes")
    }

    fn decode(bytes: &[u8]) -> Result<Self, DbError> {
        let body: Self = serde_json::from_slice(bytes)
            .map_err(|e| DbError::InvalidInput(format!("undecodable change: {}", e)))?;
        if body.v != LWW_VERSION {
            return Err(DbError::InvalidInput(format!(
                "unsupported change version {}",
                body.v
            )));
        }
        Ok(body)
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
struct Register {
    /// `None` is a remove tombstone; it still takes part in LWW resolution.
    value: Option<Value>,
    counter: u64,
    hash: String,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
struct LwwState {
    v: u8,
    registers: BTreeMap<String, Register>,
    heads: BTreeSet<String>,
    applied: BTreeSet<String>,
    max_counter: u64,
}

pub struct LwwDoc {
    state: LwwState,
    actor: String,
}

impl LwwDoc {
    fn new() -> Self {
        Self {
            state: LwwState {
                v: LWW_VERSION,
                ..Default::default()
            },
            actor: mindoo_store::idcodec::new_uuid7().to_string(),
        }
    }

    fn apply_body(&mut self, body: &LwwChangeBody, hash: &str) {
        if !self.state.applied.insert(hash.to_string()) {
            return;
        }
        for op in &body.ops {
            let incoming = Register {
                value: op.value.clone(),
                counter: body.counter,
                hash: hash.to_string(),
            };
            match self.state.registers.get(&op.key) {
                Some(existing)
                    if (existing.counter, existing.hash.as_str())
                        >= (incoming.counter, incoming.hash.as_str()) => {}
                _ => {
                    self.state.registers.insert(op.key.clone(), incoming);
                }
            }
        }
        for dep in &body.deps {
            self.state.heads.remove(dep);
        }
        self.state.heads.insert(hash.to_string());
        self.state.max_counter = self.state.max_counter.max(body.counter);
    }
}

impl CrdtDoc for LwwDoc {
    fn data(&self) -> DocumentData {
        self.state
            .registers
            .iter()
            .filter_map(|(k, reg)| reg.value.clone().map(|v| (k.clone(), v)))
            .collect()
    }

    fn get_heads(&self) -> Vec<String> {
        self.state.heads.iter().cloned().collect()
    }

    fn apply(&mut self, change: &[u8]) -> Result<(), DbError> {
        let body = LwwChangeBody::decode(change)?;
        let hash = sha256_hex(change);
        self.apply_body(&body, &hash);
        Ok(())
    }

    fn transact(
        &mut self,
        mutator: &mut dyn FnMut(&mut DocumentData),
    ) -> Result<Option<CrdtChange>, DbError> {
        let before = self.data();
        let mut working = before.clone();
        mutator(&mut working);

        let mut ops = Vec::new();
        for (key, value) in working.iter() {
            if before.get(key) != Some(value) {
                ops.push(LwwOp {
                    key: key.clone(),
                    value: Some(value.clone()),
                });
            }
        }
        for key in before.keys() {
            if working.get(key).is_none() {
                ops.push(LwwOp {
                    key: key.clone(),
                    value: None,
                });
            }
        }
        if ops.is_empty() {
            return Ok(None);
        }

        let body = LwwChangeBody {
            v: LWW_VERSION,
            actor: self.actor.clone(),
            counter: self.state.max_counter + 1,
            deps: self.state.heads.iter().cloned().collect(),
            ops,
        };
        let bytes = body.encode();
        let hash = sha256_hex(&bytes);
        let dep_hashes = body.deps.clone();
        self.apply_body(&body, &hash);
        Ok(Some(CrdtChange {
            bytes,
            hash,
            dep_hashes,
        }))
    }

    fn save(&self) -> Vec<u8> {
        serde_json::to_vec(&self.state).expect("state serializes")
    }
}

/// The built-in provider.
#[derive(Default)]
pub struct LwwProvider;

impl LwwProvider {
    pub fn new() -> Self {
        Self
    }
}

impl CrdtProvider for LwwProvider {
    fn init(&self) -> Box<dyn CrdtDoc> {
        Box::new(LwwDoc::new())
    }

    fn load(&self, snapshot: &[u8]) -> Result<Box<dyn CrdtDoc>, DbError> {
        let state: LwwState = serde_json::from_slice(snapshot)
            .map_err(|e| DbError::InvalidInput(format!("undecodable snapshot: {}", e)))?;
        if state.v != LWW_VERSION {
            return Err(DbError::InvalidInput(format!(
                "unsupported snapshot version {}",
                state.v
            )));
        }
        Ok(Box::new(LwwDoc {
            state,
            actor: mindoo_store::idcodec::new_uuid7().to_string(),
        }))
    }

    fn decode_change(&self, change: &[u8]) -> Result<CrdtChangeInfo, DbError> {
        let body = LwwChangeBody::decode(change)?;
        Ok(CrdtChangeInfo {
            hash: sha256_hex(change),
            dep_hashes: body.deps,
        })
    }
}

//! World state interface for ledger contracts
//!
//! Contracts are deterministic programs over a key/value world state. Keys
//! are Fabric-style composite keys: a namespace plus an ordered list of
//! parts, joined by a `\u{0}` separator so that range scans over a prefix
//! cannot collide with longer part lists.
//!
//! The ledger runtime applies a contract invocation atomically: either every
//! `put` from the invocation commits, or none does. Sequence counters read
//! and advanced inside one invocation are therefore assigned atomically with
//! the entries they number.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::Serialize;
use thiserror::Error;

/// Namespace for consent primary records
pub const CONSENT_NS: &str = "consent";
/// Namespace for consent history entries, keyed (id, sequence)
pub const CONSENT_HISTORY_NS: &str = "consent_history";
/// Namespace for consent history sequence counters
pub const CONSENT_SEQ_NS: &str = "consent_seq";
/// Namespace for transaction primary records
pub const TX_NS: &str = "tx";
/// Namespace for transaction audit-trail entries, keyed (id, sequence)
pub const TX_HISTORY_NS: &str = "tx_history";
/// Namespace for transaction audit-trail sequence counters
pub const TX_SEQ_NS: &str = "tx_seq";
/// Namespace for the entity-to-transaction index, keyed (entity id, tx id)
pub const TX_ENTITY_INDEX_NS: &str = "tx_by_entity";

const KEY_SEPARATOR: char = '\u{0}';

/// Errors raised inside contract execution
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ContractError {
    #[error("entry already exists: {0}")]
    Duplicate(String),

    #[error("entry not found: {0}")]
    NotFound(String),

    #[error("validation failed: {0}")]
    Validation(String),

    #[error("invalid status transition: {from} -> {to}")]
    InvalidTransition { from: String, to: String },

    #[error("access denied: outside validity window for {0}")]
    TemporalAccess(String),

    #[error("bad request: {0}")]
    BadRequest(String),

    #[error("state error: {0}")]
    State(String),
}

impl ContractError {
    /// Stable rejection code carried across the ledger boundary
    pub fn code(&self) -> &'static str {
        match self {
            ContractError::Duplicate(_) => "DUPLICATE",
            ContractError::NotFound(_) => "NOT_FOUND",
            ContractError::Validation(_) => "VALIDATION",
            ContractError::InvalidTransition { .. } => "INVALID_TRANSITION",
            ContractError::TemporalAccess(_) => "TEMPORAL_ACCESS",
            ContractError::BadRequest(_) => "BAD_REQUEST",
            ContractError::State(_) => "STATE",
        }
    }
}

/// Key/value world state as seen by a contract invocation
pub trait WorldState {
    fn get(&self, key: &str) -> Option<Vec<u8>>;
    fn put(&mut self, key: String, value: Vec<u8>);
    fn delete(&mut self, key: &str);
    /// All entries whose key starts with `prefix`, in key order
    fn range(&self, prefix: &str) -> Vec<(String, Vec<u8>)>;
}

/// Build a composite key from a namespace and ordered parts.
///
/// The trailing separator means the key for `(ns, [a])` is also the exact
/// range prefix for every key under `(ns, [a, ...])`, and `"e1"` can never
/// match into `"e10"`.
pub fn composite_key(namespace: &str, parts: &[&str]) -> String {
    let mut key = String::with_capacity(namespace.len() + 8);
    key.push(KEY_SEPARATOR);
    key.push_str(namespace);
    for part in parts {
        key.push(KEY_SEPARATOR);
        key.push_str(part);
    }
    key.push(KEY_SEPARATOR);
    key
}

/// Zero-pad a sequence number so lexicographic key order equals numeric order
pub fn sequence_part(sequence: u64) -> String {
    format!("{sequence:012}")
}

/// Read a JSON value from state
pub fn get_json<T: DeserializeOwned>(
    state: &dyn WorldState,
    key: &str,
) -> Result<Option<T>, ContractError> {
    match state.get(key) {
        Some(bytes) => serde_json::from_slice(&bytes)
            .map(Some)
            .map_err(|e| ContractError::State(format!("corrupt state at {key}: {e}"))),
        None => Ok(None),
    }
}

/// Write a JSON value to state
pub fn put_json<T: Serialize>(
    state: &mut dyn WorldState,
    key: String,
    value: &T,
) -> Result<(), ContractError> {
    let bytes = serde_json::to_vec(value)
        .map_err(|e| ContractError::State(format!("serialize for {key}: {e}")))?;
    state.put(key, bytes);
    Ok(())
}

/// Read and advance a per-entity sequence counter.
///
/// The returned sequence starts at 1. The counter write lands in the same
/// invocation as the entry it numbers, so the assignment is atomic relative
/// to that write.
pub fn next_sequence(
    state: &mut dyn WorldState,
    counter_ns: &str,
    entity_id: &str,
) -> Result<u64, ContractError> {
    let key = composite_key(counter_ns, &[entity_id]);
    let current: u64 = get_json(state, &key)?.unwrap_or(0);
    let next = current + 1;
    put_json(state, key, &next)?;
    Ok(next)
}

/// Context supplied by the ledger runtime for one contract invocation
#[derive(Debug, Clone)]
pub struct ContractContext {
    /// Ledger transaction id assigned to this invocation
    pub tx_id: String,
    /// Invocation timestamp from the transaction proposal
    pub timestamp: DateTime<Utc>,
    /// Identity label of the submitting client
    pub actor: String,
    events: Vec<ContractEvent>,
}

impl ContractContext {
    pub fn new(tx_id: impl Into<String>, timestamp: DateTime<Utc>, actor: impl Into<String>) -> Self {
        Self {
            tx_id: tx_id.into(),
            timestamp,
            actor: actor.into(),
            events: Vec::new(),
        }
    }

    /// Emit a domain event; delivered by the runtime after commit
    pub fn emit(&mut self, name: impl Into<String>, payload: serde_json::Value) {
        self.events.push(ContractEvent {
            name: name.into(),
            payload,
        });
    }

    pub fn events(&self) -> &[ContractEvent] {
        &self.events
    }
}

/// Domain event emitted by a contract
#[derive(Debug, Clone)]
pub struct ContractEvent {
    pub name: String,
    pub payload: serde_json::Value,
}

/// In-memory world state used by the in-process ledger runtime
#[derive(Debug, Clone, Default)]
pub struct MemoryState {
    entries: BTreeMap<String, Vec<u8>>,
}

impl MemoryState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl WorldState for MemoryState {
    fn get(&self, key: &str) -> Option<Vec<u8>> {
        self.entries.get(key).cloned()
    }

    fn put(&mut self, key: String, value: Vec<u8>) {
        self.entries.insert(key, value);
    }

    fn delete(&mut self, key: &str) {
        self.entries.remove(key);
    }

    fn range(&self, prefix: &str) -> Vec<(String, Vec<u8>)> {
        self.entries
            .range(prefix.to_string()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn composite_keys_do_not_collide_across_parts() {
        let a = composite_key("ns", &["ab", "c"]);
        let b = composite_key("ns", &["a", "bc"]);
        assert_ne!(a, b);
    }

    #[test]
    fn prefix_scans_stay_within_entity() {
        let mut state = MemoryState::new();
        state.put(composite_key("hist", &["e1", &sequence_part(1)]), b"a".to_vec());
        state.put(composite_key("hist", &["e1", &sequence_part(2)]), b"b".to_vec());
        state.put(composite_key("hist", &["e10", &sequence_part(1)]), b"c".to_vec());

        let entries = state.range(&composite_key("hist", &["e1"]));
        assert_eq!(entries.len(), 2);
    }

    #[test]
    fn sequence_keys_sort_numerically() {
        let mut state = MemoryState::new();
        for seq in [2u64, 100, 1, 10] {
            state.put(
                composite_key("hist", &["e1", &sequence_part(seq)]),
                seq.to_string().into_bytes(),
            );
        }

        let entries = state.range(&composite_key("hist", &["e1"]));
        let order: Vec<String> = entries
            .iter()
            .map(|(_, v)| String::from_utf8(v.clone()).unwrap())
            .collect();
        assert_eq!(order, vec!["1", "2", "10", "100"]);
    }

    #[test]
    fn next_sequence_is_dense_from_one() {
        let mut state = MemoryState::new();
        assert_eq!(next_sequence(&mut state, CONSENT_SEQ_NS, "e1").unwrap(), 1);
        assert_eq!(next_sequence(&mut state, CONSENT_SEQ_NS, "e1").unwrap(), 2);
        assert_eq!(next_sequence(&mut state, CONSENT_SEQ_NS, "e2").unwrap(), 1);
    }
}

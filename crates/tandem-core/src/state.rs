//! Protocol state container.
//!
//! A [`State`] is the snapshot of everything a test script knows about the
//! connection under test: sequence numbers, addresses, keys, the last
//! received packet. Templates read it to build packets and update it when
//! replies arrive.
//!
//! # Invariants
//!
//! - `a.update(&b)` leaves every key of `b` with `b`'s value and every key
//!   only in `a` untouched
//! - `update` is idempotent: applying the same `b` twice equals applying it
//!   once
//! - A clone shares nothing with the original; mutating one never shows up
//!   in the other
//! - `State::from_wire(&s.to_wire()?)` equals `s`

use std::collections::{BTreeMap, btree_map};

use tandem_proto::{ProtocolError, Value, decode_state, encode_state};

use crate::{behavior::Packet, error::BehaviorError};

/// Key under which [`State::log_packet`] stores the last received packet.
pub const LAST_PACKET_KEY: &str = "prev_pkt";

/// Key consulted when a state announcement has no explicit destination.
pub const DESTINATION_KEY: &str = "dst";

/// Key whose value, when set, is logged before each generated packet.
pub const STAGE_KEY: &str = "stage";

/// Mutable key/value snapshot of protocol state.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct State {
    entries: BTreeMap<String, Value>,
}

impl State {
    /// Empty state.
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style insert.
    #[must_use]
    pub fn with(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.set(key, value);
        self
    }

    /// Returns the value for `key`.
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.entries.get(key)
    }

    /// Sets `key`, returning the previous value.
    pub fn set(&mut self, key: impl Into<String>, value: impl Into<Value>) -> Option<Value> {
        let key = key.into();
        let value = value.into();
        tracing::trace!(key = %key, value = ?value, "state updated");
        self.entries.insert(key, value)
    }

    /// Removes `key`, returning its value.
    pub fn remove(&mut self, key: &str) -> Option<Value> {
        self.entries.remove(key)
    }

    /// Returns true if `key` is set.
    pub fn has_key(&self, key: &str) -> bool {
        self.entries.contains_key(key)
    }

    /// Number of keys.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns true if no key is set.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Iterates keys in sorted order.
    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().map(String::as_str)
    }

    /// Iterates entries in key order.
    pub fn iter(&self) -> btree_map::Iter<'_, String, Value> {
        self.entries.iter()
    }

    /// Right-biased merge: every key of `other` overwrites the same key here.
    ///
    /// Returns `self` so merges can be chained.
    pub fn update(&mut self, other: &State) -> &mut Self {
        for (key, value) in &other.entries {
            self.entries.insert(key.clone(), value.clone());
        }
        self
    }

    /// Unsigned integer under `key`.
    pub fn get_u64(&self, key: &str) -> Option<u64> {
        self.get(key).and_then(Value::as_u64)
    }

    /// String under `key`.
    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.get(key).and_then(Value::as_str)
    }

    /// Boolean under `key`.
    pub fn get_bool(&self, key: &str) -> Option<bool> {
        self.get(key).and_then(Value::as_bool)
    }

    /// Unsigned integer a template cannot do without.
    ///
    /// # Errors
    ///
    /// [`BehaviorError::MissingKey`] if unset, [`BehaviorError::InvalidValue`]
    /// if set to something other than a non-negative integer.
    pub fn require_u64(&self, key: &str) -> Result<u64, BehaviorError> {
        let value = self.get(key).ok_or_else(|| BehaviorError::MissingKey(key.to_string()))?;
        value.as_u64().ok_or_else(|| BehaviorError::InvalidValue {
            key: key.to_string(),
            reason: format!("expected unsigned integer, got {value:?}"),
        })
    }

    /// String a template cannot do without.
    ///
    /// # Errors
    ///
    /// Same as [`State::require_u64`].
    pub fn require_str(&self, key: &str) -> Result<&str, BehaviorError> {
        let value = self.get(key).ok_or_else(|| BehaviorError::MissingKey(key.to_string()))?;
        value.as_str().ok_or_else(|| BehaviorError::InvalidValue {
            key: key.to_string(),
            reason: format!("expected string, got {value:?}"),
        })
    }

    /// Records `packet` as the most recently received packet.
    pub fn log_packet<P: Packet>(&mut self, packet: &P) {
        self.entries.insert(LAST_PACKET_KEY.to_string(), Value::Packet(packet.to_bytes()));
    }

    /// Decodes the packet stored by [`State::log_packet`].
    ///
    /// # Errors
    ///
    /// [`ProtocolError::MalformedPacket`] if the stored value is not a packet
    /// or does not decode as `P`.
    pub fn last_packet<P: Packet>(&self) -> Result<Option<P>, ProtocolError> {
        match self.get(LAST_PACKET_KEY) {
            None => Ok(None),
            Some(Value::Packet(raw)) => P::from_bytes(raw).map(Some),
            Some(other) => Err(ProtocolError::MalformedPacket(format!(
                "{LAST_PACKET_KEY} holds {other:?}, not a packet"
            ))),
        }
    }

    /// Serializes for the sync side channel.
    ///
    /// # Errors
    ///
    /// [`ProtocolError::DatagramTooLarge`] if the state does not fit one
    /// datagram.
    pub fn to_wire(&self) -> Result<Vec<u8>, ProtocolError> {
        encode_state(&self.entries)
    }

    /// Rebuilds a state serialized with [`State::to_wire`].
    ///
    /// # Errors
    ///
    /// [`ProtocolError::MalformedPayload`] if `bytes` is not a well-formed
    /// state, never a partial one.
    pub fn from_wire(bytes: &[u8]) -> Result<Self, ProtocolError> {
        decode_state(bytes).map(Self::from)
    }

    /// Consumes the state, returning the raw entries.
    pub fn into_entries(self) -> BTreeMap<String, Value> {
        self.entries
    }
}

impl From<BTreeMap<String, Value>> for State {
    fn from(entries: BTreeMap<String, Value>) -> Self {
        Self { entries }
    }
}

impl<K: Into<String>, V: Into<Value>> FromIterator<(K, V)> for State {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self { entries: iter.into_iter().map(|(k, v)| (k.into(), v.into())).collect() }
    }
}

impl<'a> IntoIterator for &'a State {
    type Item = (&'a String, &'a Value);
    type IntoIter = btree_map::Iter<'a, String, Value>;

    fn into_iter(self) -> Self::IntoIter {
        self.entries.iter()
    }
}

//! Synchronization datagrams exchanged between two tester instances.
//!
//! One datagram carries exactly one [`Datagram`], which wraps one
//! [`SyncMessage`]. There is no framing beyond that: the channel is unordered
//! and unreliable, and reliability is emulated one layer up by retransmitting
//! until a matching [`SyncMessage::Ack`] comes back.
//!
//! # Encoding
//!
//! Messages are CBOR-encoded with serde's external enum tagging. Decoding is
//! strict:
//!
//! - Oversize input is rejected before the CBOR parser runs
//! - Trailing bytes after a complete message are rejected
//! - Anything that is not one of the known variants is rejected
//!
//! A decoding failure is always [`ProtocolError::MalformedPayload`], so the
//! receiving side can tell it apart from a timeout or an I/O failure.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize, de::DeserializeOwned};

use crate::{
    Value,
    errors::{ProtocolError, Result},
};

/// Largest payload that fits into one UDP datagram over IPv4.
pub const MAX_DATAGRAM_SIZE: usize = 65_507;

/// A message on the synchronization side channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum SyncMessage {
    /// Bare checkpoint token, carries no data
    Unit,
    /// Full state snapshot
    State(BTreeMap<String, Value>),
    /// Free-form test result, e.g. `("isDropped", true)`
    Verdict {
        /// Name of the check
        name: String,
        /// Outcome of the check
        passed: bool,
    },
    /// Acknowledgment of a previously received message
    Ack,
}

impl SyncMessage {
    /// Returns true for the acknowledgment token.
    #[must_use]
    pub fn is_ack(&self) -> bool {
        matches!(self, Self::Ack)
    }

    /// Encode the message on its own, without a datagram envelope.
    ///
    /// # Errors
    ///
    /// - [`ProtocolError::CborEncode`] if serialization fails
    /// - [`ProtocolError::DatagramTooLarge`] if the result exceeds
    ///   [`MAX_DATAGRAM_SIZE`]
    pub fn encode(&self) -> Result<Vec<u8>> {
        encode_bounded(self)
    }

    /// Decode a message that was encoded with [`SyncMessage::encode`].
    ///
    /// # Errors
    ///
    /// - [`ProtocolError::EmptyDatagram`] for zero-length input
    /// - [`ProtocolError::DatagramTooLarge`] if `bytes` exceeds the limit
    /// - [`ProtocolError::MalformedPayload`] if the bytes are not exactly one
    ///   well-formed message
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        decode_strict(bytes)
    }
}

/// One datagram on the side channel.
///
/// The sequence number ties an [`SyncMessage::Ack`] to the message it
/// acknowledges. Announcements are retransmitted until acknowledged, so the
/// receiver sees the same `seq` several times and must only deliver it once.
/// A fresh announcement always carries a different `seq` than the previous
/// one from the same sender.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Datagram {
    /// Sender-chosen sequence number
    pub seq: u64,
    /// Carried message
    pub message: SyncMessage,
}

impl Datagram {
    /// Wrap a message.
    #[must_use]
    pub fn new(seq: u64, message: SyncMessage) -> Self {
        Self { seq, message }
    }

    /// Acknowledgment for the datagram numbered `seq`.
    #[must_use]
    pub fn ack(seq: u64) -> Self {
        Self { seq, message: SyncMessage::Ack }
    }

    /// Returns true if this acknowledges the datagram numbered `seq`.
    #[must_use]
    pub fn acknowledges(&self, seq: u64) -> bool {
        self.message.is_ack() && self.seq == seq
    }

    /// Encode into a datagram buffer.
    ///
    /// # Errors
    ///
    /// See [`SyncMessage::encode`].
    pub fn encode(&self) -> Result<Vec<u8>> {
        encode_bounded(self)
    }

    /// Decode one datagram.
    ///
    /// # Errors
    ///
    /// See [`SyncMessage::decode`].
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        decode_strict(bytes)
    }
}

fn encode_bounded<T: Serialize>(value: &T) -> Result<Vec<u8>> {
    let mut buf = Vec::new();
    ciborium::ser::into_writer(value, &mut buf)
        .map_err(|e| ProtocolError::CborEncode(e.to_string()))?;

    if buf.len() > MAX_DATAGRAM_SIZE {
        return Err(ProtocolError::DatagramTooLarge { size: buf.len(), max: MAX_DATAGRAM_SIZE });
    }

    Ok(buf)
}

fn decode_strict<T: DeserializeOwned>(bytes: &[u8]) -> Result<T> {
    if bytes.is_empty() {
        return Err(ProtocolError::EmptyDatagram);
    }

    // Size check comes first so the parser never sees oversize input
    if bytes.len() > MAX_DATAGRAM_SIZE {
        return Err(ProtocolError::DatagramTooLarge { size: bytes.len(), max: MAX_DATAGRAM_SIZE });
    }

    let mut reader = bytes;
    let value: T = ciborium::de::from_reader(&mut reader)
        .map_err(|e| ProtocolError::MalformedPayload(e.to_string()))?;

    if !reader.is_empty() {
        return Err(ProtocolError::MalformedPayload(format!(
            "{} trailing bytes after message",
            reader.len()
        )));
    }

    Ok(value)
}

/// Encode a state mapping as a [`SyncMessage::State`] datagram.
///
/// # Errors
///
/// See [`SyncMessage::encode`].
pub fn encode_state(entries: &BTreeMap<String, Value>) -> Result<Vec<u8>> {
    SyncMessage::State(entries.clone()).encode()
}

/// Decode a datagram that must carry a state mapping.
///
/// # Errors
///
/// Returns [`ProtocolError::MalformedPayload`] if the datagram is well-formed
/// but carries something other than a state, plus every error of
/// [`SyncMessage::decode`].
pub fn decode_state(bytes: &[u8]) -> Result<BTreeMap<String, Value>> {
    match SyncMessage::decode(bytes)? {
        SyncMessage::State(entries) => Ok(entries),
        other => Err(ProtocolError::MalformedPayload(format!("expected state, got {other:?}"))),
    }
}

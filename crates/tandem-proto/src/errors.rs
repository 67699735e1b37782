//! Error types for the synchronization wire format.
//!
//! All errors are structured, testable, and provide actionable information.

use thiserror::Error;

/// Wire-level errors raised while encoding or decoding sync datagrams.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    /// Datagram is empty
    #[error("empty datagram")]
    EmptyDatagram,

    /// Encoded message does not fit into a single datagram
    #[error("datagram too large: {size} bytes exceeds maximum {max}")]
    DatagramTooLarge {
        /// Actual encoded size
        size: usize,
        /// Maximum allowed size
        max: usize,
    },

    /// Failed to encode a message as CBOR
    #[error("failed to encode CBOR: {0}")]
    CborEncode(String),

    /// Bytes do not parse as a well-formed message
    #[error("malformed sync payload: {0}")]
    MalformedPayload(String),

    /// Raw packet bytes stored in state could not be decoded by the protocol
    #[error("malformed packet: {0}")]
    MalformedPacket(String),
}

/// Convenient Result type alias for wire operations
pub type Result<T> = std::result::Result<T, ProtocolError>;

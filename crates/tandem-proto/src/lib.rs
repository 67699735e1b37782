//! # Tandem: Synchronization Wire Format
//!
//! Two tester instances (typically one per side of the connection under test)
//! coordinate over a UDP side channel. This crate defines what travels on that
//! channel:
//!
//! - [`Value`]: the closed set of value kinds a protocol state may hold
//! - [`SyncMessage`]: a state snapshot, a bare checkpoint token, a test
//!   verdict, or an acknowledgment
//! - [`Datagram`]: one message plus the sequence number that pairs it with
//!   its acknowledgment
//!
//! ## Encoding
//!
//! Datagrams are CBOR. The codec is strict: malformed, truncated or oversize
//! input is rejected with [`ProtocolError::MalformedPayload`] or
//! [`ProtocolError::DatagramTooLarge`], never turned into a partial state.
#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod errors;
pub mod message;
pub mod value;

pub use errors::{ProtocolError, Result};
pub use message::{Datagram, MAX_DATAGRAM_SIZE, SyncMessage, decode_state, encode_state};
pub use value::Value;

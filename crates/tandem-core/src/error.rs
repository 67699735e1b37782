//! Error types for the tandem engine.
//!
//! Three layers, each with its own type:
//!
//! - [`BehaviorError`]: raised by protocol templates while generating or
//!   interpreting packets
//! - [`SyncError`]: raised by the cross-host side channel
//! - [`EngineError`]: what every engine operation returns
//!
//! The engine never terminates the process. Failures that used to abort a
//! test run are returned as [`EngineError::Unexpected`] after being logged,
//! and the caller decides whether to stop.

use std::{fmt, io, time::Duration};

use tandem_proto::ProtocolError;
use thiserror::Error;

/// Phase of a step in which an unexpected failure happened.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    /// Template produced the packet to send
    Generate,
    /// Packet left through the transport
    Transmit,
    /// Waiting for a matching packet
    Capture,
    /// Template checked a reply against the prior state
    Validate,
    /// Template folded a reply into the state
    Receive,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Generate => "generate",
            Self::Transmit => "transmit",
            Self::Capture => "capture",
            Self::Validate => "validate",
            Self::Receive => "receive",
        };
        f.write_str(name)
    }
}

/// Errors raised by packet templates.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BehaviorError {
    /// Template needs a state key that is not set
    #[error("missing state key: {0}")]
    MissingKey(String),

    /// State key is set but holds the wrong kind of value
    #[error("invalid value for state key {key}: {reason}")]
    InvalidValue {
        /// Offending key
        key: String,
        /// What was wrong with it
        reason: String,
    },

    /// Raw packet could not be decoded
    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    /// Anything else the template wants to report
    #[error("{0}")]
    Other(String),
}

/// Errors raised by the synchronization side channel.
#[derive(Error, Debug)]
pub enum SyncError {
    /// Socket failure
    #[error("sync channel I/O failed: {0}")]
    Io(#[from] io::Error),

    /// Datagram arrived but does not decode
    #[error(transparent)]
    Malformed(#[from] ProtocolError),

    /// Announcement was never acknowledged
    #[error("no acknowledgment after {attempts} transmissions")]
    RetriesExhausted {
        /// Number of transmissions made
        attempts: u32,
    },

    /// Shutdown was requested while waiting
    #[error("cancelled")]
    Cancelled,

    /// No destination given and the state has no `dst` key
    #[error("no destination address given and state has no usable \"dst\" key")]
    MissingDestination,
}

/// Errors returned by engine operations.
#[derive(Error, Debug)]
pub enum EngineError {
    /// No matching packet arrived within the bound
    #[error("timed out after {elapsed:?}")]
    Timeout {
        /// The bound that elapsed
        elapsed: Duration,
    },

    /// Sync datagram arrived but does not decode
    #[error("malformed sync payload: {0}")]
    MalformedSyncPayload(ProtocolError),

    /// Operation called in a way that can never succeed
    #[error("invalid usage: {0}")]
    InvalidUsage(String),

    /// Generation, transmission, validation or reception failed
    #[error("unexpected failure during {stage}: {message}")]
    Unexpected {
        /// Where it failed
        stage: Stage,
        /// What went wrong
        message: String,
    },

    /// Side channel failed
    #[error("transport error: {0}")]
    Transport(String),

    /// Shutdown was requested while waiting
    #[error("cancelled")]
    Cancelled,
}

impl EngineError {
    /// Returns true if the operation may succeed when retried.
    ///
    /// Only timeouts qualify: the peer may simply be slow.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }

    /// Returns true if the scenario should stop rather than carry on.
    pub fn should_halt(&self) -> bool {
        matches!(self, Self::Unexpected { .. } | Self::Transport(_) | Self::Cancelled)
    }
}

impl From<SyncError> for EngineError {
    fn from(err: SyncError) -> Self {
        match err {
            SyncError::Malformed(e) => Self::MalformedSyncPayload(e),
            SyncError::Cancelled => Self::Cancelled,
            SyncError::MissingDestination => Self::InvalidUsage(err.to_string()),
            SyncError::Io(_) | SyncError::RetriesExhausted { .. } => {
                Self::Transport(err.to_string())
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_timeouts_are_recoverable() {
        assert!(EngineError::Timeout { elapsed: Duration::from_secs(1) }.is_recoverable());
        assert!(!EngineError::Cancelled.is_recoverable());
        assert!(!EngineError::InvalidUsage("x".into()).is_recoverable());
    }

    #[test]
    fn malformed_sync_stays_distinct() {
        let err: EngineError =
            SyncError::Malformed(ProtocolError::MalformedPayload("bad".into())).into();
        assert!(matches!(err, EngineError::MalformedSyncPayload(_)));
        assert!(!err.should_halt());
    }

    #[test]
    fn exhausted_retries_halt() {
        let err: EngineError = SyncError::RetriesExhausted { attempts: 3 }.into();
        assert!(err.should_halt());
        assert!(err.to_string().contains("3 transmissions"));
    }

    #[test]
    fn unexpected_names_its_stage() {
        let err = EngineError::Unexpected { stage: Stage::Validate, message: "boom".into() };
        assert_eq!(err.to_string(), "unexpected failure during validate: boom");
    }
}

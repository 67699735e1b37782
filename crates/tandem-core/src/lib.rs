//! Tandem protocol test engine
//!
//! This crate runs scripted, stateful conformance tests of a network
//! protocol. A test script is a sequence of steps; each step hands a packet
//! template the current state, sends what it generates, captures the reply,
//! checks it against the state it was sent from, and folds it back in.
//! Two testers at the two ends of a connection coordinate over a UDP side
//! channel.
//!
//! The engine knows nothing about any particular protocol:
//!
//! ```text
//!           ┌──────────────────────────────┐
//!           │ test script                  │
//!           └──────────────────────────────┘
//!                         ↓
//!   ┌───────────────────────────────────────────────┐
//!   │ Engine                                        │
//!   │ send_one / send_sequence / wait_for_packet    │──→ Synchronizer ──→ peer
//!   └───────────────────────────────────────────────┘      (UDP)
//!       ↓ generate/receive/validate       ↓ inject/capture
//! ┌──────────────────┐          ┌──────────────────┐
//! │ Protocol +       │          │ PacketTransport  │
//! │ PacketBehavior   │          │ (raw wire)       │
//! └──────────────────┘          └──────────────────┘
//! ```
//!
//! # Modules
//!
//! - [`state`]: key/value protocol state with right-biased merge
//! - [`behavior`]: packet, template and protocol traits
//! - [`transport`]: raw packet wire and sync side channel traits
//! - [`wait`]: filtered, bounded, cancellable packet capture
//! - [`engine`]: step sequencing and reply processing
//! - [`sync`]: reliable messaging over the side channel
//! - [`firewall`]: hiding injected traffic from the local kernel
//! - [`env`]: time and randomness
//! - [`config`], [`logging`], [`error`], [`shutdown`]

#![forbid(unsafe_code)]
#![deny(missing_docs)]

pub mod behavior;
pub mod config;
pub mod engine;
pub mod env;
pub mod error;
pub mod firewall;
pub mod logging;
pub mod shutdown;
pub mod state;
pub mod sync;
pub mod transport;
pub mod wait;

pub use behavior::{
    Accept, Generated, Packet, PacketBehavior, PacketFilter, Protocol, StepOptions, SyncSignal,
    Template, Wait, WaitSpec,
};
pub use config::{RetryPolicy, TesterConfig};
pub use engine::{Context, Engine, Exchange, StepOutcome};
pub use env::{Environment, SystemEnv};
pub use error::{BehaviorError, EngineError, Stage, SyncError};
pub use shutdown::Shutdown;
pub use state::State;
pub use sync::Synchronizer;
pub use transport::{DatagramChannel, PacketTransport};
pub use wait::{WaitPhase, Waiter};

//! Deterministic simulation harness for the tandem engine.
//!
//! This crate provides everything needed to run two testers against each
//! other without real hosts:
//!
//! - [`seqack`]: a small sequence/acknowledgment reference protocol
//! - [`sim_net`]: an in-memory network implementing both engine transports
//! - [`turmoil_socket`]: a sync side channel over Turmoil UDP, for loss and
//!   partition tests
//! - [`sim_env`]: virtual time and seeded randomness
//! - [`scenario`]: two-tester scenarios verified by oracles

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod scenario;
pub mod seqack;
pub mod sim_env;
pub mod sim_net;
pub mod turmoil_socket;

pub use seqack::{SeqAck, Segment, SegmentKind};
pub use sim_env::SimEnv;
pub use sim_net::{SimLink, SimNetwork, SimSocket};
pub use turmoil_socket::TurmoilSocket;

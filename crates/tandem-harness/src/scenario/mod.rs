//! Scenario testing framework for deterministic simulation tests.
//!
//! This module provides a declarative API for writing two-tester scenarios
//! that follow the Oracle Pattern. Scenarios wire both testers to a
//! simulated network, run their scripts on virtual time, and hand the
//! resulting world to the oracle.

mod builder;
pub mod oracle;
mod peer;
mod world;

pub use builder::{CLIENT_ADDR, RunnableScenario, SERVER_ADDR, Scenario, ScriptFuture};
pub use oracle::OracleFn;
pub use peer::{Peer, SimEngine};
pub use world::{PeerReport, World};

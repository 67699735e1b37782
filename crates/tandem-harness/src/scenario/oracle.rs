//! Oracle functions for scenario verification.
//!
//! Oracle functions run at the end of scenarios to verify global consistency.
//! They receive a snapshot of the entire world state and assert invariants.

use crate::scenario::World;

/// Oracle function type.
///
/// Receives immutable reference to world state and returns:
/// - `Ok(())` if all invariants hold
/// - `Err(message)` if verification fails
pub type OracleFn = Box<dyn FnOnce(&World) -> Result<(), String>>;

/// Create an oracle that verifies neither script ended with an error.
pub fn no_errors() -> OracleFn {
    Box::new(|world| {
        for peer in [world.client(), world.server()] {
            if let Some(e) = &peer.error {
                return Err(format!("{} ended with error: {e}", peer.addr));
            }
        }
        Ok(())
    })
}

/// Create an oracle that verifies every received packet passed validation.
pub fn all_replies_valid() -> OracleFn {
    Box::new(|world| {
        for peer in [world.client(), world.server()] {
            if !peer.all_replies_valid() {
                return Err(format!("{} received an invalid packet", peer.addr));
            }
        }
        Ok(())
    })
}

/// Combine multiple oracles into one.
pub fn all_of(oracles: Vec<OracleFn>) -> OracleFn {
    Box::new(move |world| {
        for oracle in oracles {
            oracle(world)?;
        }
        Ok(())
    })
}

//! Kernel-bypass toggle.
//!
//! While a script injects raw packets, the local kernel must not answer the
//! peer on its own (a kernel seeing segments for a socket it does not know
//! replies with resets). Dropping inbound TCP at the firewall takes the
//! kernel out of the loop; removing the rule hands control back.

use std::io;

use async_trait::async_trait;
use thiserror::Error;

use crate::config::TesterConfig;

/// Errors toggling kernel handling.
#[derive(Error, Debug)]
pub enum FirewallError {
    /// Binary could not be started
    #[error("failed to run {binary}: {source}")]
    Spawn {
        /// Binary that was run
        binary: String,
        /// Underlying error
        source: io::Error,
    },

    /// Binary ran and reported failure
    #[error("{binary} exited with {status}")]
    Failed {
        /// Binary that was run
        binary: String,
        /// Exit status
        status: std::process::ExitStatus,
    },
}

/// Whether the local kernel processes inbound traffic under test.
#[async_trait]
pub trait KernelHandling: Send + Sync {
    /// Lets the kernel handle inbound traffic (`true`) or hides it from the
    /// kernel (`false`). Setting the current mode again does nothing.
    async fn set_kernel_handling(&mut self, enabled: bool) -> Result<(), FirewallError>;

    /// Current mode.
    fn kernel_handling(&self) -> bool;
}

/// Firewall arguments switching to the given mode.
///
/// Disabling kernel handling appends a rule dropping inbound TCP, enabling
/// it deletes that rule.
pub fn rule_args(enabled: bool) -> [&'static str; 6] {
    let action = if enabled { "-D" } else { "-A" };
    [action, "INPUT", "-p", "tcp", "-j", "DROP"]
}

/// [`KernelHandling`] through a firewall control binary.
///
/// Starts in kernel-handled mode, i.e. assumes no drop rule is installed.
#[derive(Debug, Clone)]
pub struct FirewallToggle {
    binary: String,
    enabled: bool,
}

impl FirewallToggle {
    /// Toggle running `binary`.
    pub fn new(binary: impl Into<String>) -> Self {
        Self { binary: binary.into(), enabled: true }
    }

    /// Toggle running the configured firewall control binary.
    pub fn from_config(config: &TesterConfig) -> Self {
        Self::new(config.firewall_control_binary.clone())
    }
}

#[async_trait]
impl KernelHandling for FirewallToggle {
    async fn set_kernel_handling(&mut self, enabled: bool) -> Result<(), FirewallError> {
        if enabled == self.enabled {
            tracing::debug!(enabled, "kernel handling already in requested mode");
            return Ok(());
        }

        let args = rule_args(enabled);
        tracing::info!(binary = %self.binary, args = ?args, "toggling kernel handling");

        let status = tokio::process::Command::new(&self.binary)
            .args(args)
            .status()
            .await
            .map_err(|source| FirewallError::Spawn { binary: self.binary.clone(), source })?;

        if !status.success() {
            return Err(FirewallError::Failed { binary: self.binary.clone(), status });
        }

        self.enabled = enabled;
        Ok(())
    }

    fn kernel_handling(&self) -> bool {
        self.enabled
    }
}

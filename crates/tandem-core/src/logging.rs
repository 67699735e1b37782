//! Tracing subscriber setup.

use tracing_subscriber::EnvFilter;

use crate::config::TesterConfig;

/// Installs a fmt subscriber filtered at the config's debug level.
///
/// `RUST_LOG`, when set, overrides the level. Returns false if a global
/// subscriber was already installed, in which case nothing changes.
pub fn init(config: &TesterConfig) -> bool {
    let filter = EnvFilter::builder()
        .with_default_directive(config.log_level().into())
        .from_env_lossy();

    tracing_subscriber::fmt().with_env_filter(filter).with_target(false).try_init().is_ok()
}

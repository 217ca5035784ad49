//! Tracing setup for binaries and tests embedding the monitor core

use tracing_subscriber::EnvFilter;

/// Install a fmt subscriber filtered by `RUST_LOG`, or `default_filter` if unset
///
/// Safe to call more than once; later calls are no-ops. Returns `false`
/// when a global subscriber was already installed.
pub fn init_tracing(default_filter: &str) -> bool {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));

    let installed = tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(true)
        .try_init()
        .is_ok();

    if installed {
        tracing::info!("Monitor cache logging initialized");
    }
    installed
}

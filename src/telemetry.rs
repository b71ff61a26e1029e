//! Log output setup for binaries and harnesses
//!
//! The library itself only emits `tracing` events. Installing a subscriber is
//! the job of whoever owns `main`.

use tracing_subscriber::EnvFilter;

/// Default filter when `RUST_LOG` is unset or invalid
pub const DEFAULT_FILTER: &str = "info";

/// Install a formatted subscriber filtered by `RUST_LOG`
///
/// Calling it again after a subscriber is installed does nothing.
pub fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));
    let installed = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .try_init()
        .is_ok();
    if installed {
        tracing::debug!("tracing subscriber installed");
    }
}

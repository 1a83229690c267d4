//! Tracing bootstrap shared by the engine binaries and tests.

use tracing_subscriber::EnvFilter;

/// Installs the global tracing subscriber.
///
/// Filtering defaults to `info` and can be overridden with `RUST_LOG`.
/// Calling this twice is harmless; the second install attempt is ignored.
pub fn init() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .try_init();
}

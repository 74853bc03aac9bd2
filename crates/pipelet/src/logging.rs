//! Tracing setup for embedders and tests.

use tracing_subscriber::EnvFilter;

/// Initialize the global subscriber. `RUST_LOG` wins when set.
///
/// Safe to call more than once; later calls are no-ops.
pub fn init(debug: bool) {
    let default = if debug { "pipelet=debug" } else { "pipelet=info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));

    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();
}

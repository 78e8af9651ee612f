//! Tracing setup for the bench binary

use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Install the global subscriber.
///
/// Reads `RUST_LOG`, falling back to `default_level`. Output goes to stderr
/// in compact format so stdout stays free for the run summary.
///
/// ```bash
/// RUST_LOG=rampctl_core=debug rampctl-bench demos/bench.toml
/// ```
pub fn init(default_level: &str) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr).compact())
        .init();
}

// Logging setup for binaries and tests
use tracing::info;
use tracing_subscriber::EnvFilter;

use crate::config::BrokerConfig;

/// Install the global `tracing` subscriber.
///
/// RUST_LOG wins when set; otherwise `config.log_filter` is used. Returns
/// `false` if a subscriber was already installed (tests call this repeatedly).
///
/// # Example
///
/// ```no_run
/// use tabula_core::config::BrokerConfig;
/// use tabula_core::telemetry::init_tracing;
///
/// let cfg = BrokerConfig::load();
/// init_tracing(&cfg);
/// ```
pub fn init_tracing(config: &BrokerConfig) -> bool {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.log_filter.as_str()));

    let installed = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .try_init()
        .is_ok();
    if installed {
        info!(target: "telemetry", filter = %config.log_filter, "Tracing initialized");
    }
    installed
}

/// Test-friendly variant writing through the libtest capture.
pub fn init_test_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("debug")),
        )
        .with_test_writer()
        .try_init();
}

//! Subscriber installation.

use tracing_subscriber::EnvFilter;

/// Output format of the fmt subscriber.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    /// One JSON object per event, for log shipping.
    #[default]
    Json,
    /// Single-line human-readable output.
    Compact,
}

fn filter(default: &str) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default))
}

/// Install the global subscriber. Returns `false` if one was already set.
pub fn init(format: LogFormat) -> bool {
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter("info"))
        .with_timer(tracing_subscriber::fmt::time::SystemTime)
        .with_target(false);

    match format {
        LogFormat::Json => builder.json().with_current_span(true).try_init().is_ok(),
        LogFormat::Compact => builder.compact().try_init().is_ok(),
    }
}

/// Compact output routed through the test writer so `cargo test` captures it.
pub fn init_test() -> bool {
    tracing_subscriber::fmt()
        .with_env_filter(filter("stockledger=debug,warn"))
        .with_test_writer()
        .compact()
        .try_init()
        .is_ok()
}

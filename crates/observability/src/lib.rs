//! Process-wide tracing setup for the stock ledger.

/// Tracing subscriber configuration.
pub mod tracing;

pub use crate::tracing::LogFormat;

/// Initialize JSON logging, filtered by `RUST_LOG` (default `info`).
///
/// Safe to call multiple times; subsequent calls are no-ops.
pub fn init() {
    tracing::init(LogFormat::Json);
}

/// Initialize human-readable logging captured by the test harness.
pub fn init_for_tests() {
    tracing::init_test();
}

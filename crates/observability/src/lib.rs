//! Process-wide tracing setup shared by every tally binary and test harness.

/// Initialize tracing/logging for the process.
///
/// Safe to call multiple times; only the first call installs a subscriber.
pub fn init() {
    tracing::init();
}

pub use tracing::{LOG_FORMAT_ENV, LogFormat, try_init};

/// Tracing configuration (filters, output format).
pub mod tracing;

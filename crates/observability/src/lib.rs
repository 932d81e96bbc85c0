//! Process-wide tracing setup shared by binaries, workers and benchmarks.

pub mod tracing;

pub use self::tracing::{LogConfig, LogFormat};

/// Install the default subscriber: JSON lines, `RUST_LOG` filter, `info` fallback.
///
/// Safe to call more than once; only the first call installs anything.
pub fn init() {
    self::tracing::init(&LogConfig::from_env());
}

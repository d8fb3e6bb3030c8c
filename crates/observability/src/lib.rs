//! Process-wide tracing setup shared by binaries and tests.

pub mod tracing;

pub use tracing::{LogFormat, ObservabilityConfig};

/// Installs the default subscriber: JSON lines, `RUST_LOG` filter, `info` fallback.
///
/// Safe to call multiple times; later calls are no-ops.
pub fn init() {
    tracing::init_with(&ObservabilityConfig::default());
}

/// Installs a subscriber built from `config`.
pub fn init_with(config: &ObservabilityConfig) {
    tracing::init_with(config);
}

//! Process-wide logging setup for the engine and its binary.

/// Tracing subscriber configuration.
pub mod tracing;

pub use crate::tracing::{LogFormat, LogSettings};

/// Install the subscriber configured from the environment (`RUST_LOG`,
/// `MODGATE_LOG_FORMAT`). Calling it again is a no-op.
pub fn init() -> bool {
    tracing::init(&LogSettings::from_env())
}

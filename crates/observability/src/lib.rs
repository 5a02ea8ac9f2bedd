//! Tracing/logging setup shared by the engine's binaries.

/// Tracing configuration (filters, output format).
pub mod tracing;

pub use crate::tracing::{LogFormat, LogSettings};

/// Initialize process-wide logging with JSON output and an `info` default.
///
/// This is safe to call multiple times; subsequent calls become no-ops.
pub fn init() {
    tracing::init(LogSettings::default());
}

//! Tracing and logging setup shared by every binary embedding the reservation core.

/// Initialize process-wide tracing, picking the output format from `LOG_FORMAT`.
///
/// This is safe to call multiple times; subsequent calls become no-ops.
pub fn init() {
    tracing::init();
}

/// Tracing configuration (filters, formats).
pub mod tracing;

pub use self::tracing::{LogFormat, ParseLogFormatError, init_with};

//! Tracing/logging setup shared by the service binaries.

/// Initialize process-wide tracing at the given default level.
///
/// `RUST_LOG` takes precedence when set. Safe to call multiple times;
/// subsequent calls become no-ops.
pub fn init(default_level: &str) {
    tracing::init(default_level);
}

/// Subscriber construction (filters, formatting).
pub mod tracing;

//! Tracing/logging initialization.

use tracing_subscriber::EnvFilter;

/// Build the filter: `RUST_LOG` if present, else `default_level`, else `info`.
pub fn filter(default_level: &str) -> EnvFilter {
    EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(default_level))
        .unwrap_or_else(|_| EnvFilter::new("info"))
}

/// Initialize tracing/logging for the process.
///
/// Safe to call multiple times (subsequent calls are no-ops).
pub fn init(default_level: &str) {
    // JSON logs + timestamps.
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter(default_level))
        .json()
        .with_timer(tracing_subscriber::fmt::time::SystemTime)
        .with_target(false)
        .try_init();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn repeated_init_is_harmless() {
        init("debug");
        init("warn");
        ::tracing::info!("still logging");
    }

    #[test]
    fn garbage_level_falls_back() {
        // Must not panic on an unparseable directive.
        let _ = filter("not a [valid] directive ===");
    }
}

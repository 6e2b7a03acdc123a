//! `tracing` subscriber installation.
//!
//! Ledger services log through the `tracing` macros; this module decides where
//! those records go. Output is one JSON object per line on stdout, filtered by
//! `RUST_LOG` (defaults to `info`).

use tracing_subscriber::EnvFilter;

const DEFAULT_FILTER: &str = "info";

/// Build the filter from `RUST_LOG`, falling back to [`DEFAULT_FILTER`].
pub fn env_filter() -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER))
}

/// Install the JSON subscriber. A second call finds a global subscriber
/// already set and does nothing.
pub fn init() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(env_filter())
        .json()
        .with_timer(tracing_subscriber::fmt::time::SystemTime)
        .with_current_span(true)
        .with_target(false)
        .try_init();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn repeated_init_is_harmless() {
        init();
        init();
        ::tracing::info!(component = "observability", "initialised twice");
    }

    #[test]
    fn default_filter_parses() {
        let filter = env_filter();
        assert!(!filter.to_string().is_empty());
    }
}

//! Subscriber setup for binaries built on this crate
//!
//! The library only emits `tracing` events. Call [`init`] once at startup to print them, or
//! install your own subscriber.

use tracing::Level;
use tracing_subscriber::EnvFilter;

/// Guard that must outlive the run when the `profiling` feature writes a Chrome trace
pub struct LogGuard {
    #[cfg(feature = "profiling")]
    _chrome: tracing_chrome::FlushGuard,
}

/// Installs a formatting subscriber. `RUST_LOG` overrides `default_level`.
///
/// With the `profiling` feature a Chrome trace (`trace-*.json`) is written next to it.
pub fn init(default_level: Level) -> LogGuard {
    use tracing_subscriber::prelude::*;

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_level.to_string()));

    let registry = tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_target(false));

    #[cfg(feature = "profiling")]
    let guard = {
        let (chrome_layer, guard) = tracing_chrome::ChromeLayerBuilder::new().build();
        registry.with(chrome_layer).init();
        LogGuard { _chrome: guard }
    };

    #[cfg(not(feature = "profiling"))]
    let guard = {
        registry.init();
        LogGuard {}
    };

    guard
}

/// Parses a level name, case insensitive
pub fn parse_level(s: &str) -> Option<Level> {
    s.parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn level_names() {
        assert_eq!(parse_level("debug"), Some(Level::DEBUG));
        assert_eq!(parse_level("WARN"), Some(Level::WARN));
        assert_eq!(parse_level("loud"), None);
    }
}

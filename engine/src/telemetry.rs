//! Telemetry
//!
//! Sets up `tracing-subscriber` for the `keel` binary. Library code only emits
//! `tracing` events; installing a subscriber is left to the binary (and to
//! tests that want to see the output).

use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Filter used before a configuration is loaded
pub const DEFAULT_LOG_LEVEL: &str = "info";

/// Filter directive for a level: the level for everything, and for this crate
pub fn filter_directive(log_level: &str) -> String {
    format!("{},keel_engine={}", log_level, log_level)
}

/// Initialize the tracing subscriber with the given log level.
///
/// Priority: `RUST_LOG` env var > `log_level` parameter.
///
/// Debug builds print pretty terminal output; release builds print JSON with
/// the current span attached. A subscriber that is already installed is left
/// in place.
pub fn init_telemetry_with_level(log_level: &str) {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(filter_directive(log_level)));

    #[cfg(debug_assertions)]
    {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(fmt::layer().pretty().with_target(false))
            .try_init()
            .ok();
    }

    #[cfg(not(debug_assertions))]
    {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(fmt::layer().json().with_current_span(true))
            .try_init()
            .ok();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_filter_directive_scopes_crate() {
        assert_eq!(filter_directive("debug"), "debug,keel_engine=debug");
    }

    #[test]
    fn test_init_twice_is_harmless() {
        init_telemetry_with_level("warn");
        init_telemetry_with_level("debug");
    }
}

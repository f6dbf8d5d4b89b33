//! Logging setup and configuration
//!
//! The level given on the command line or in the config applies to the
//! workspace's own crates. Everything else (libusb bindings, tokio) stays at
//! `warn` unless `RUST_LOG` says otherwise.

use tracing_subscriber::{EnvFilter, fmt, prelude::*};

/// Crates that follow the configured level
const OWN_CRATES: &[&str] = &["monitor", "usb_monitor", "usb_types", "common"];

/// Level names accepted by [`setup_logging`]
pub const LOG_LEVELS: &[&str] = &["trace", "debug", "info", "warn", "error"];

/// Filter directives for `level`
///
/// Fails on anything outside [`LOG_LEVELS`].
pub fn filter_directives(level: &str) -> crate::Result<String> {
    let level = level.to_ascii_lowercase();
    if !LOG_LEVELS.contains(&level.as_str()) {
        return Err(crate::Error::Config(format!("Invalid log level: {}", level)));
    }

    let mut directives = vec!["warn".to_string()];
    directives.extend(OWN_CRATES.iter().map(|name| format!("{}={}", name, level)));
    Ok(directives.join(","))
}

/// Setup tracing subscriber for the application
///
/// `RUST_LOG` takes precedence over `level` when set. Thread names are
/// printed so events from the monitor worker and the hot-plug thread can be
/// told apart.
pub fn setup_logging(level: &str) -> crate::Result<()> {
    let filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => EnvFilter::try_new(filter_directives(level)?)
            .map_err(|e| crate::Error::Config(format!("Invalid log filter: {}", e)))?,
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_thread_names(true))
        .try_init()
        .map_err(|e| crate::Error::Config(format!("Logging already initialized: {}", e)))?;

    Ok(())
}

/// Route logs through the test harness's captured output
///
/// Safe to call from every test; only the first call installs a subscriber.
pub fn setup_test_logging() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("debug")))
        .with_test_writer()
        .with_thread_names(true)
        .try_init();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_directives_cover_own_crates() {
        let directives = filter_directives("debug").unwrap();
        assert!(directives.starts_with("warn,"));
        assert!(directives.contains("monitor=debug"));
        assert!(directives.contains("usb_types=debug"));
        assert!(EnvFilter::try_new(&directives).is_ok());
    }

    #[test]
    fn test_level_is_case_insensitive() {
        assert!(filter_directives("INFO").unwrap().contains("common=info"));
    }

    #[test]
    fn test_unknown_level_rejected() {
        assert!(matches!(filter_directives("loud"), Err(crate::Error::Config(_))));
    }
}

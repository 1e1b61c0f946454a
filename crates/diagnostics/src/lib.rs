//! Logging facade shared by the nestql crates
//!
//! Wraps `emit` so every crate logs the same way, with structured properties.
//!
//! Usage:
//! - Set NESTQL_LOG=off (default) - no logs
//! - Set NESTQL_LOG=info - request pipeline stages (resolution, cache hits, builds)
//! - Set NESTQL_LOG=debug - per-step detail (stat results, staging paths, SQL)

use std::sync::Once;

// Re-export emit so macros can use it
pub use emit;

/// Environment variable consulted by [`init`]
pub const LOG_ENV: &str = "NESTQL_LOG";

static INIT: Once = Once::new();

/// Minimum level accepted by the terminal emitter
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verbosity {
    Off,
    Error,
    Warn,
    Info,
    Debug,
}

impl Verbosity {
    /// Parse a level name, returning `None` for unknown names
    #[must_use]
    pub fn parse(name: &str) -> Option<Self> {
        match name.trim().to_ascii_lowercase().as_str() {
            "off" | "" => Some(Self::Off),
            "error" => Some(Self::Error),
            "warn" | "warning" => Some(Self::Warn),
            "info" => Some(Self::Info),
            "debug" => Some(Self::Debug),
            _ => None,
        }
    }

    fn level(self) -> Option<emit::Level> {
        match self {
            Self::Off => None,
            Self::Error => Some(emit::Level::Error),
            Self::Warn => Some(emit::Level::Warn),
            Self::Info => Some(emit::Level::Info),
            Self::Debug => Some(emit::Level::Debug),
        }
    }
}

/// Initialize diagnostics from the NESTQL_LOG environment variable
///
/// Safe to call multiple times; only the first call (from either this
/// function or [`init_with`]) takes effect.
pub fn init() {
    let requested = std::env::var(LOG_ENV).unwrap_or_else(|_| "off".to_string());
    match Verbosity::parse(&requested) {
        Some(verbosity) => init_with(verbosity),
        None => {
            init_with(Verbosity::Info);
            emit::warn!(
                "Unknown {env} value '{requested}', using 'info'",
                env: LOG_ENV,
                requested: requested.as_str()
            );
        }
    }
}

/// Initialize diagnostics at an explicit verbosity (e.g. from a `--verbose` flag)
pub fn init_with(verbosity: Verbosity) {
    INIT.call_once(|| {
        let Some(level) = verbosity.level() else {
            return;
        };

        let rt = emit::setup()
            .emit_to(emit_term::stderr())
            .emit_when(emit::level::min_filter(level))
            .init();

        // The runtime lives for the rest of the process.
        std::mem::forget(rt);
    });
}

/// Log pipeline progress users want to see in normal operation
///
/// Examples: "Cache hit for key", "Built artifact in 120ms"
#[macro_export]
macro_rules! info {
    ($($arg:tt)*) => {
        $crate::emit::info!($($arg)*)
    };
}

/// Log detailed diagnostics (stat results, staging paths, composed SQL)
#[macro_export]
macro_rules! debug {
    ($($arg:tt)*) => {
        $crate::emit::debug!($($arg)*)
    };
}

/// Log recoverable problems (cleanup failures, fallbacks)
#[macro_export]
macro_rules! warn {
    ($($arg:tt)*) => {
        $crate::emit::warn!($($arg)*)
    };
}

/// Log failures that abort a request
#[macro_export]
macro_rules! error {
    ($($arg:tt)*) => {
        $crate::emit::error!($($arg)*)
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_is_safe_to_call_multiple_times() {
        init_with(Verbosity::Off);
        init();
        init_with(Verbosity::Debug);
    }

    #[test]
    fn test_verbosity_parse() {
        assert_eq!(Verbosity::parse("DEBUG"), Some(Verbosity::Debug));
        assert_eq!(Verbosity::parse("warning"), Some(Verbosity::Warn));
        assert_eq!(Verbosity::parse(""), Some(Verbosity::Off));
        assert_eq!(Verbosity::parse("chatty"), None);
    }

    #[test]
    fn test_macros_compile() {
        info!("Test message");
        debug!("Debug message with {value}", value: 42);
        warn!("Warning message");
        error!("Error message for {key}", key: "abc");
    }
}

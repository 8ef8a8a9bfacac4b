//! Process-wide, level-gated logging.
//!
//! Installs a `tracing-subscriber` fmt subscriber filtered at the configured
//! level. `SELKIE_LOG` accepts a full env-filter directive set and overrides
//! the configured level when present.

use serde::{Deserialize, Serialize};
use std::sync::Once;
use tracing_subscriber::EnvFilter;

static INIT: Once = Once::new();

/// Log verbosity levels, most to least verbose.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    /// Everything, including per-chunk and per-token diagnostics.
    Debug,
    /// Lifecycle events: loads, downloads, pipeline turns.
    #[default]
    Info,
    /// Recoverable problems: retries, evictions, memory pressure.
    Warning,
    /// Failures surfaced to the caller.
    Error,
}

impl LogLevel {
    /// Equivalent env-filter directive.
    pub fn as_filter(self) -> &'static str {
        match self {
            Self::Debug => "debug",
            Self::Info => "info",
            Self::Warning => "warn",
            Self::Error => "error",
        }
    }
}

/// Install the global subscriber at `level`.
///
/// The first call wins; later calls (including from a second `initialize`
/// after `shutdown`) are no-ops. Honours `SELKIE_LOG` when set.
pub fn init(level: LogLevel) {
    INIT.call_once(|| {
        let filter = EnvFilter::try_from_env("SELKIE_LOG")
            .unwrap_or_else(|_| EnvFilter::new(level.as_filter()));
        // try_init: a subscriber installed by the host application takes
        // precedence and is not an error.
        let _ = tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(false)
            .try_init();
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn levels_are_ordered_by_verbosity() {
        assert!(LogLevel::Debug < LogLevel::Info);
        assert!(LogLevel::Info < LogLevel::Warning);
        assert!(LogLevel::Warning < LogLevel::Error);
    }

    #[test]
    fn filter_directives() {
        assert_eq!(LogLevel::Debug.as_filter(), "debug");
        assert_eq!(LogLevel::Warning.as_filter(), "warn");
    }

    #[test]
    fn init_is_idempotent() {
        init(LogLevel::Info);
        init(LogLevel::Debug);
        init(LogLevel::Error);
    }

    #[test]
    fn serde_round_trip() {
        let json = serde_json::to_string(&LogLevel::Warning).expect("serialize");
        assert_eq!(json, "\"warning\"");
        let back: LogLevel = serde_json::from_str(&json).expect("deserialize");
        assert_eq!(back, LogLevel::Warning);
    }
}

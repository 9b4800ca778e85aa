/// Diagnostic logging on stderr
///
/// Step narration goes to stdout through `console`; `tracing` events carry
/// command lines, probe results and prune decisions for troubleshooting.

use std::str::FromStr;

use tracing::Level;
use tracing_subscriber::fmt;

use crate::cli::LogLevel;

pub const LOG_ENV_VAR: &str = "GITLAB_MANAGER_LOG";

impl From<LogLevel> for Level {
    fn from(level: LogLevel) -> Self {
        match level {
            LogLevel::Error => Level::ERROR,
            LogLevel::Warn => Level::WARN,
            LogLevel::Info => Level::INFO,
            LogLevel::Debug => Level::DEBUG,
            LogLevel::Trace => Level::TRACE,
        }
    }
}

/// `--log-level` first, then the environment value, then warnings only
pub fn resolve_level(cli_level: Option<LogLevel>, env_value: Option<&str>) -> Level {
    cli_level
        .map(Level::from)
        .or_else(|| env_value.and_then(|v| Level::from_str(v.trim()).ok()))
        .unwrap_or(Level::WARN)
}

/// Install the global subscriber. Call once, from `main`.
pub fn init_logging(cli_level: Option<LogLevel>) {
    let env_value = std::env::var(LOG_ENV_VAR).ok();

    fmt()
        .with_max_level(resolve_level(cli_level, env_value.as_deref()))
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_flag_beats_environment() {
        assert_eq!(resolve_level(Some(LogLevel::Trace), Some("error")), Level::TRACE);
    }

    #[test]
    fn test_environment_value_is_case_insensitive() {
        assert_eq!(resolve_level(None, Some(" DEBUG ")), Level::DEBUG);
    }

    #[test]
    fn test_unknown_or_missing_value_falls_back_to_warn() {
        assert_eq!(resolve_level(None, Some("loud")), Level::WARN);
        assert_eq!(resolve_level(None, None), Level::WARN);
    }
}

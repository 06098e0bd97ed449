//! Diagnostic logging via `tracing`.
//!
//! The level comes from `--log-level`, then the `GREENHOUSE_LOG` environment
//! variable, then defaults to `info`. Diagnostics go to stderr; stdout carries
//! only the plain progress lines.

use anyhow::{anyhow, Result};
use tracing::Level;
use tracing_subscriber::fmt;

pub const LOG_ENV: &str = "GREENHOUSE_LOG";

/// Log level as exposed on the CLI.
#[derive(Debug, Copy, Clone, PartialEq, Eq, clap::ValueEnum)]
pub enum LogLevel {
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

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

/// Installs the global subscriber. Call once at startup.
pub fn init_logging(cli_level: Option<LogLevel>) -> Result<()> {
    let env_level = std::env::var(LOG_ENV).ok();
    let level = resolve_level(cli_level, env_level.as_deref());

    fmt()
        .with_max_level(level)
        .with_target(false)
        .with_writer(std::io::stderr)
        .try_init()
        .map_err(|err| anyhow!("failed to install log subscriber: {}", err))
}

fn resolve_level(cli_level: Option<LogLevel>, env_level: Option<&str>) -> Level {
    cli_level
        .map(Level::from)
        .or_else(|| env_level.and_then(parse_level_str))
        .unwrap_or(Level::INFO)
}

fn parse_level_str(s: &str) -> Option<Level> {
    match s.trim().to_lowercase().as_str() {
        "error" => Some(Level::ERROR),
        "warn" | "warning" => Some(Level::WARN),
        "info" => Some(Level::INFO),
        "debug" => Some(Level::DEBUG),
        "trace" => Some(Level::TRACE),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cli_flag_wins_over_env() {
        assert_eq!(resolve_level(Some(LogLevel::Trace), Some("error")), Level::TRACE);
    }

    #[test]
    fn env_is_used_when_flag_missing() {
        assert_eq!(resolve_level(None, Some(" Warning ")), Level::WARN);
        assert_eq!(resolve_level(None, Some("debug")), Level::DEBUG);
    }

    #[test]
    fn falls_back_to_info() {
        assert_eq!(resolve_level(None, None), Level::INFO);
        assert_eq!(resolve_level(None, Some("loud")), Level::INFO);
    }
}

//! Configuration management for greenhouse.
//!
//! This module defines the structure of the optional `greenhouse.toml` file
//! and provides functionality to load and parse it. Every field is optional;
//! command-line flags take precedence over values found here.

use std::path::Path;

use anyhow::{Context, Result};
use serde::Deserialize;

use crate::process::ReadinessCheck;

/// Top-level configuration structure corresponding to `greenhouse.toml`.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Directory holding one executable directory per run case.
    pub build_dir: Option<String>,
    /// Source directory handed to the configure step.
    pub project_root: Option<String>,
    /// Directory receiving the per-process `.out`/`.err` files.
    pub log_dir: Option<String>,
    /// Address the clients connect to.
    pub host: Option<String>,
    /// Server port.
    pub port: Option<u16>,
    /// Length of the run window in seconds.
    pub run_secs: Option<u64>,
    /// Settle delay between dependent groups in milliseconds.
    pub settle_ms: Option<u64>,
    /// Upper bound for a readiness check in milliseconds.
    pub ready_timeout_ms: Option<u64>,
    /// Whether readiness checks run at all (default: true).
    pub readiness: Option<bool>,
    /// How the server is checked for readiness (default: udp_bound).
    pub server_ready: Option<ServerReady>,
    /// Time to wait after sending SIGINT before escalating (ms).
    pub shutdown_sigint_ms: Option<u64>,
    /// Time to wait after sending SIGTERM before force-killing (ms).
    pub shutdown_sigterm_ms: Option<u64>,
    /// Build step overrides.
    pub build: Option<BuildConfig>,
}

/// Overrides for the two build commands.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BuildConfig {
    /// Command generating the build files.
    pub configure: Option<String>,
    /// Command building every target.
    pub compile: Option<String>,
    /// Skip building entirely.
    pub skip: Option<bool>,
}

/// Readiness probe used for the server.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ServerReady {
    /// The server's UDP port is bound.
    UdpBound,
    /// The server accepts TCP connections on its port.
    Tcp,
    /// A line of `server.out` matches the regex.
    Log(String),
    /// Wait for a specific duration (milliseconds).
    Delay(u64),
}

impl ServerReady {
    pub fn to_check(&self, port: u16) -> ReadinessCheck {
        match self {
            ServerReady::UdpBound => ReadinessCheck::UdpBound(port),
            ServerReady::Tcp => ReadinessCheck::Tcp(port),
            ServerReady::Log(pattern) => ReadinessCheck::Log(pattern.clone()),
            ServerReady::Delay(ms) => ReadinessCheck::Delay(*ms),
        }
    }
}

/// Loads and parses the configuration from a file path.
pub fn load_config(path: &Path) -> Result<Config> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read config file {}", path.display()))?;
    let config: Config = toml::from_str(&raw)
        .with_context(|| format!("failed to parse config file {}", path.display()))?;
    Ok(config)
}

//! Errors raised while building, launching and supervising a run.

use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum LaunchError {
    #[error("build step `{step}` could not be started: {source}")]
    BuildSpawn {
        step: String,
        #[source]
        source: std::io::Error,
    },

    #[error("build step `{step}` failed with {}", exit_label(.code))]
    BuildFailed { step: String, code: Option<i32> },

    #[error("executable for {name} not found at {}", .path.display())]
    MissingExecutable { name: String, path: PathBuf },

    #[error("failed to open output file {}: {source}", .path.display())]
    OutputFile {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to spawn {name} ({}): {source}", .path.display())]
    Spawn {
        name: String,
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("{name} did not become ready within {}ms", .timeout.as_millis())]
    NotReady { name: String, timeout: Duration },

    #[error("{name} exited with {} before becoming ready", exit_label(.code))]
    ExitedEarly { name: String, code: Option<i32> },

    #[error("invalid readiness pattern for {name}: {source}")]
    ReadinessPattern {
        name: String,
        #[source]
        source: regex::Error,
    },

    #[error("run interrupted while launching {group}")]
    Interrupted { group: String },
}

fn exit_label(code: &Option<i32>) -> String {
    match code {
        Some(code) => format!("exit code {}", code),
        None => "a signal".to_string(),
    }
}

pub type Result<T> = std::result::Result<T, LaunchError>;

//! Data structures describing a single process launch.
//!
//! This module defines the roles taking part in a simulation (`Role`), how a
//! process is checked for readiness (`ReadinessCheck`) and the full launch
//! description (`LaunchSpec`) handed to the launcher.

use std::path::PathBuf;

use crate::case::RunCase;
use crate::output::OutputFiles;

/// The fixed roles an executable can play.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Role {
    /// The coordinating process every other role connects to.
    Server,
    /// An agent process; several instances run concurrently.
    Gardener,
    /// The driver process, started last.
    Flowerbed,
    /// Optional observer, started right after the server.
    Monitor,
}

impl Role {
    /// Executable file name inside the per-case build directory.
    pub fn binary_name(self) -> &'static str {
        match self {
            Role::Server => "server",
            Role::Gardener => "gardener",
            Role::Flowerbed => "flowerbed",
            Role::Monitor => "monitor",
        }
    }
}

/// How to decide that a freshly spawned process is ready for its dependents.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReadinessCheck {
    /// Wait for a fixed duration (milliseconds).
    Delay(u64),
    /// Wait until the UDP port on 127.0.0.1 is bound by someone else.
    UdpBound(u16),
    /// Wait for a TCP port to accept connections.
    Tcp(u16),
    /// Wait for a line of the process's stdout file matching a regex.
    Log(String),
}

/// Everything needed to spawn one process.
#[derive(Debug, Clone)]
pub struct LaunchSpec {
    /// Unique name within a run (`server`, `gardener1`, ...).
    pub name: String,
    pub role: Role,
    /// Path to the executable.
    pub program: PathBuf,
    /// Arguments for the executable.
    pub args: Vec<String>,
    /// Files receiving stdout and stderr.
    pub output: OutputFiles,
    /// Configuration for checking if the process is ready.
    pub ready_check: Option<ReadinessCheck>,
}

/// Where executables are found and where logs go.
#[derive(Debug, Clone)]
pub struct Layout {
    pub build_dir: PathBuf,
    pub log_dir: PathBuf,
}

impl Layout {
    /// `<build_dir>/<case>/<binary>`.
    pub fn executable(&self, case: RunCase, role: Role) -> PathBuf {
        self.build_dir.join(case.as_str()).join(role.binary_name())
    }
}

impl LaunchSpec {
    /// The server only takes its listening port.
    pub fn server(case: RunCase, layout: &Layout, port: u16) -> Self {
        Self::new("server".to_string(), Role::Server, case, layout, vec![port.to_string()])
    }

    /// Gardener instance `n`, connecting to `host:port`.
    pub fn gardener(case: RunCase, layout: &Layout, host: &str, port: u16, n: usize) -> Self {
        Self::client(format!("gardener{}", n), Role::Gardener, case, layout, host, port)
    }

    pub fn flowerbed(case: RunCase, layout: &Layout, host: &str, port: u16) -> Self {
        Self::client("flowerbed".to_string(), Role::Flowerbed, case, layout, host, port)
    }

    pub fn monitor(case: RunCase, layout: &Layout, host: &str, port: u16) -> Self {
        Self::client("monitor".to_string(), Role::Monitor, case, layout, host, port)
    }

    pub fn with_ready_check(mut self, check: Option<ReadinessCheck>) -> Self {
        self.ready_check = check;
        self
    }

    /// Command line as it would be typed in a shell.
    pub fn command_line(&self) -> String {
        let mut parts = vec![self.program.display().to_string()];
        parts.extend(self.args.iter().cloned());
        shell_words::join(parts)
    }

    fn client(
        name: String,
        role: Role,
        case: RunCase,
        layout: &Layout,
        host: &str,
        port: u16,
    ) -> Self {
        Self::new(name, role, case, layout, vec![host.to_string(), port.to_string()])
    }

    fn new(name: String, role: Role, case: RunCase, layout: &Layout, args: Vec<String>) -> Self {
        let output = OutputFiles::for_process(&layout.log_dir, &name);
        Self {
            program: layout.executable(case, role),
            name,
            role,
            args,
            output,
            ready_check: None,
        }
    }
}

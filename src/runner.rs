//! Process execution and management.
//!
//! This module contains the `Launcher` and `ProcessHandle` seams used by the
//! supervisor, and their OS-backed implementations. A launched process writes
//! its standard streams straight into its output files; the handle is used to
//! probe readiness and, at teardown, to stop the process with a staged
//! signal/kill sequence.

use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use regex::Regex;
use tokio::net::TcpStream;
use tokio::process::{Child, Command};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::errors::{LaunchError, Result};
use crate::process::{LaunchSpec, ReadinessCheck};

const POLL_INTERVAL: Duration = Duration::from_millis(100);
const KILL_WAIT: Duration = Duration::from_millis(500);
/// How long a process must stay alive after its readiness check passes.
const READY_GRACE: Duration = Duration::from_millis(250);

/// Spawns processes described by a `LaunchSpec`.
pub trait Launcher: Send {
    type Handle: ProcessHandle;

    /// Spawns the process and returns immediately, without waiting for it to
    /// become ready.
    fn launch(&mut self, spec: &LaunchSpec) -> Result<Self::Handle>;
}

/// Exclusive control over one spawned process.
#[async_trait]
pub trait ProcessHandle: Send {
    fn name(&self) -> &str;

    fn pid(&self) -> Option<u32>;

    /// Resolves once `check` passes, failing after `timeout` or as soon as the
    /// process exits.
    async fn wait_ready(&mut self, check: &ReadinessCheck, timeout: Duration) -> Result<()>;

    /// Stops the process. Never fails; the outcome is reported instead.
    async fn terminate(&mut self, shutdown: ShutdownConfig) -> TerminateOutcome;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessSignal {
    SigInt,
    SigTerm,
}

impl ProcessSignal {
    pub fn label(self) -> &'static str {
        match self {
            ProcessSignal::SigInt => "SIGINT",
            ProcessSignal::SigTerm => "SIGTERM",
        }
    }
}

/// How long each graceful stage may take before escalating. A zero duration
/// skips the stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShutdownConfig {
    sigint_ms: u64,
    sigterm_ms: u64,
}

impl Default for ShutdownConfig {
    fn default() -> Self {
        Self::new(0, 2000)
    }
}

impl ShutdownConfig {
    pub fn new(sigint_ms: u64, sigterm_ms: u64) -> Self {
        Self {
            sigint_ms,
            sigterm_ms,
        }
    }

    pub fn sigint_ms(&self) -> u64 {
        self.sigint_ms
    }

    pub fn sigterm_ms(&self) -> u64 {
        self.sigterm_ms
    }

    fn stages(&self) -> impl Iterator<Item = (ProcessSignal, Duration)> {
        [
            (ProcessSignal::SigInt, self.sigint_ms),
            (ProcessSignal::SigTerm, self.sigterm_ms),
        ]
        .into_iter()
        .filter(|(_, ms)| *ms > 0)
        .map(|(signal, ms)| (signal, Duration::from_millis(ms)))
    }
}

/// What happened when a process was asked to stop.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TerminateOutcome {
    /// The process had already exited on its own.
    AlreadyExited { code: Option<i32> },
    /// The process exited after a graceful signal.
    Stopped { signal: ProcessSignal },
    /// The process had to be killed.
    Killed,
    /// Stopping failed; the process may still be running.
    Failed { error: String },
}

/// Launches real OS processes.
#[derive(Debug, Default)]
pub struct OsLauncher;

impl Launcher for OsLauncher {
    type Handle = ChildHandle;

    fn launch(&mut self, spec: &LaunchSpec) -> Result<ChildHandle> {
        let (stdout, stderr) = spec.output.open()?;

        let mut command = Command::new(&spec.program);
        command
            .args(&spec.args)
            .stdin(Stdio::null())
            .stdout(Stdio::from(stdout))
            .stderr(Stdio::from(stderr));
        command.kill_on_drop(true);

        #[cfg(windows)]
        {
            use std::os::windows::process::CommandExt;
            const CREATE_NEW_PROCESS_GROUP: u32 = 0x00000200;
            command.creation_flags(CREATE_NEW_PROCESS_GROUP);
        }

        #[cfg(unix)]
        unsafe {
            command.pre_exec(|| {
                let _ = libc::setpgid(0, 0);
                Ok(())
            });
        }

        let child = command.spawn().map_err(|source| LaunchError::Spawn {
            name: spec.name.clone(),
            path: spec.program.clone(),
            source,
        })?;
        info!(
            process = %spec.name,
            role = spec.role.binary_name(),
            pid = child.id().unwrap_or(0),
            cmd = %spec.command_line(),
            "process started"
        );

        Ok(ChildHandle {
            spec: spec.clone(),
            child,
        })
    }
}

/// Handle to a process spawned by `OsLauncher`.
#[derive(Debug)]
pub struct ChildHandle {
    spec: LaunchSpec,
    child: Child,
}

impl ChildHandle {
    fn exit_code(&mut self) -> Option<Option<i32>> {
        match self.child.try_wait() {
            Ok(Some(status)) => Some(status.code()),
            Ok(None) => None,
            Err(err) => {
                warn!(process = %self.spec.name, error = %err, "failed to poll process status");
                None
            }
        }
    }

    fn ensure_running(&mut self) -> Result<()> {
        match self.exit_code() {
            Some(code) => Err(LaunchError::ExitedEarly {
                name: self.spec.name.clone(),
                code,
            }),
            None => Ok(()),
        }
    }
}

#[async_trait]
impl ProcessHandle for ChildHandle {
    fn name(&self) -> &str {
        &self.spec.name
    }

    fn pid(&self) -> Option<u32> {
        self.child.id()
    }

    async fn wait_ready(&mut self, check: &ReadinessCheck, timeout: Duration) -> Result<()> {
        let probe = match check {
            ReadinessCheck::Delay(ms) => {
                tokio::time::sleep(Duration::from_millis(*ms)).await;
                return self.ensure_running();
            }
            ReadinessCheck::UdpBound(port) => Probe::UdpBound(*port),
            ReadinessCheck::Tcp(port) => Probe::Tcp(*port),
            ReadinessCheck::Log(pattern) => {
                let regex = Regex::new(pattern).map_err(|source| LaunchError::ReadinessPattern {
                    name: self.spec.name.clone(),
                    source,
                })?;
                Probe::Log(regex)
            }
        };

        let deadline = Instant::now() + timeout;
        loop {
            self.ensure_running()?;
            if probe_once(&self.spec, &probe).await {
                // A port held by another process passes too; a server that
                // lost the bind exits right after.
                tokio::time::sleep(READY_GRACE).await;
                self.ensure_running()?;
                debug!(process = %self.spec.name, ?check, "readiness check passed");
                return Ok(());
            }
            if Instant::now() >= deadline {
                return Err(LaunchError::NotReady {
                    name: self.spec.name.clone(),
                    timeout,
                });
            }
            tokio::time::sleep(POLL_INTERVAL).await;
        }
    }

    async fn terminate(&mut self, shutdown: ShutdownConfig) -> TerminateOutcome {
        if let Some(code) = self.exit_code() {
            return TerminateOutcome::AlreadyExited { code };
        }

        for (signal, timeout) in shutdown.stages() {
            if let Some(pid) = self.child.id() {
                debug!(process = %self.spec.name, pid, signal = signal.label(), "sending signal");
                send_os_signal(pid, signal);
            }
            match wait_for_exit(&mut self.child, timeout).await {
                Ok(Some(_)) => return TerminateOutcome::Stopped { signal },
                Ok(None) => {}
                Err(err) => {
                    return TerminateOutcome::Failed {
                        error: err.to_string(),
                    }
                }
            }
        }

        #[cfg(unix)]
        if let Some(pid) = self.child.id() {
            kill_process_group(pid);
        }
        if let Err(err) = self.child.start_kill() {
            return TerminateOutcome::Failed {
                error: err.to_string(),
            };
        }
        match wait_for_exit(&mut self.child, KILL_WAIT).await {
            Ok(Some(_)) => TerminateOutcome::Killed,
            Ok(None) => TerminateOutcome::Failed {
                error: format!("still running {}ms after kill", KILL_WAIT.as_millis()),
            },
            Err(err) => TerminateOutcome::Failed {
                error: err.to_string(),
            },
        }
    }
}

enum Probe {
    UdpBound(u16),
    Tcp(u16),
    Log(Regex),
}

async fn probe_once(spec: &LaunchSpec, probe: &Probe) -> bool {
    match probe {
        Probe::UdpBound(port) => udp_port_bound(*port).await,
        Probe::Tcp(port) => TcpStream::connect(("127.0.0.1", *port)).await.is_ok(),
        Probe::Log(regex) => log_matches(spec, regex).await,
    }
}

/// Looks the port up in the kernel socket tables. Binding the port to test it
/// would race the server's own bind.
#[cfg(target_os = "linux")]
async fn udp_port_bound(port: u16) -> bool {
    for table in ["/proc/net/udp", "/proc/net/udp6"] {
        if let Ok(contents) = tokio::fs::read_to_string(table).await {
            if table_has_local_port(&contents, port) {
                return true;
            }
        }
    }
    false
}

// No socket table to read; readiness reduces to the grace period.
#[cfg(not(target_os = "linux"))]
async fn udp_port_bound(_port: u16) -> bool {
    true
}

/// Matches the local port column of a `/proc/net/udp{,6}` table.
#[cfg(target_os = "linux")]
fn table_has_local_port(table: &str, port: u16) -> bool {
    table.lines().skip(1).any(|line| {
        line.split_whitespace()
            .nth(1)
            .and_then(|local| local.rsplit_once(':'))
            .and_then(|(_, hex)| u16::from_str_radix(hex, 16).ok())
            == Some(port)
    })
}

async fn log_matches(spec: &LaunchSpec, regex: &Regex) -> bool {
    match tokio::fs::read(&spec.output.stdout).await {
        Ok(bytes) => String::from_utf8_lossy(&bytes)
            .lines()
            .any(|line| regex.is_match(line)),
        Err(_) => false,
    }
}

#[cfg(unix)]
fn send_os_signal(pid: u32, signal: ProcessSignal) {
    unsafe {
        let sig = match signal {
            ProcessSignal::SigInt => libc::SIGINT,
            ProcessSignal::SigTerm => libc::SIGTERM,
        };
        let pid = pid as i32;
        let _ = libc::kill(-pid, sig);
        let _ = libc::kill(pid, sig);
    }
}

#[cfg(unix)]
fn kill_process_group(pid: u32) {
    unsafe {
        let _ = libc::kill(-(pid as i32), libc::SIGKILL);
    }
}

#[cfg(not(unix))]
fn send_os_signal(pid: u32, signal: ProcessSignal) {
    send_ctrl_break(pid, signal);
}

#[cfg(all(not(unix), windows))]
fn send_ctrl_break(pid: u32, signal: ProcessSignal) {
    use windows_sys::Win32::System::Console::GenerateConsoleCtrlEvent;
    use windows_sys::Win32::System::Console::CTRL_BREAK_EVENT;
    // No SIGTERM/SIGINT on Windows; CTRL_BREAK is the closest console signal.
    let _ = signal;
    unsafe {
        let _ = GenerateConsoleCtrlEvent(CTRL_BREAK_EVENT, pid);
    }
}

#[cfg(all(not(unix), not(windows)))]
fn send_ctrl_break(_pid: u32, _signal: ProcessSignal) {}

async fn wait_for_exit(
    child: &mut Child,
    timeout: Duration,
) -> std::io::Result<Option<std::process::ExitStatus>> {
    if timeout.is_zero() {
        return Ok(None);
    }
    match tokio::time::timeout(timeout, child.wait()).await {
        Ok(Ok(status)) => Ok(Some(status)),
        Ok(Err(err)) => Err(err),
        Err(_) => Ok(None),
    }
}

#[cfg(all(test, unix))]
mod tests {
    use std::path::{Path, PathBuf};

    use super::*;
    use crate::output::OutputFiles;
    use crate::process::Role;

    fn shell_spec(dir: &Path, name: &str, script: &str) -> LaunchSpec {
        LaunchSpec {
            name: name.to_string(),
            role: Role::Server,
            program: PathBuf::from("sh"),
            args: vec!["-c".to_string(), script.to_string()],
            output: OutputFiles::for_process(dir, name),
            ready_check: None,
        }
    }

    #[test]
    fn shutdown_stages_skip_zero_durations() {
        let stages: Vec<_> = ShutdownConfig::default().stages().collect();
        assert_eq!(stages, vec![(ProcessSignal::SigTerm, Duration::from_secs(2))]);

        let stages: Vec<_> = ShutdownConfig::new(100, 0).stages().collect();
        assert_eq!(stages, vec![(ProcessSignal::SigInt, Duration::from_millis(100))]);

        assert_eq!(ShutdownConfig::new(0, 0).stages().count(), 0);
    }

    #[tokio::test]
    async fn streams_are_redirected_to_output_files() {
        let dir = tempfile::tempdir().unwrap();
        let spec = shell_spec(dir.path(), "server", "echo hello; echo oops >&2; sleep 30");
        let mut handle = OsLauncher.launch(&spec).unwrap();
        assert_eq!(handle.name(), "server");
        assert!(handle.pid().is_some());

        handle
            .wait_ready(&ReadinessCheck::Log("^hello$".to_string()), Duration::from_secs(5))
            .await
            .unwrap();
        let outcome = handle.terminate(ShutdownConfig::default()).await;

        assert_eq!(outcome, TerminateOutcome::Stopped { signal: ProcessSignal::SigTerm });
        let stdout = std::fs::read_to_string(dir.path().join("server.out")).unwrap();
        assert_eq!(stdout, "hello\n");
        let stderr = std::fs::read_to_string(dir.path().join("server.err")).unwrap();
        assert_eq!(stderr, "oops\n");
    }

    #[tokio::test]
    async fn missing_executable_is_a_spawn_error() {
        let dir = tempfile::tempdir().unwrap();
        let mut spec = shell_spec(dir.path(), "gardener1", "");
        spec.program = dir.path().join("build/4-5/gardener");

        match OsLauncher.launch(&spec).unwrap_err() {
            LaunchError::Spawn { name, path, .. } => {
                assert_eq!(name, "gardener1");
                assert_eq!(path, spec.program);
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn exit_during_readiness_fails_fast() {
        let dir = tempfile::tempdir().unwrap();
        let spec = shell_spec(dir.path(), "server", "exit 4");
        let mut handle = OsLauncher.launch(&spec).unwrap();

        let err = handle
            .wait_ready(&ReadinessCheck::Log("never".to_string()), Duration::from_secs(10))
            .await
            .unwrap_err();

        assert!(matches!(err, LaunchError::ExitedEarly { code: Some(4), .. }));
        assert_eq!(
            handle.terminate(ShutdownConfig::default()).await,
            TerminateOutcome::AlreadyExited { code: Some(4) }
        );
    }

    #[tokio::test]
    async fn readiness_times_out() {
        let dir = tempfile::tempdir().unwrap();
        let spec = shell_spec(dir.path(), "server", "sleep 30");
        let mut handle = OsLauncher.launch(&spec).unwrap();

        let err = handle
            .wait_ready(&ReadinessCheck::Log("never".to_string()), Duration::from_millis(300))
            .await
            .unwrap_err();

        assert!(matches!(err, LaunchError::NotReady { .. }));
        handle.terminate(ShutdownConfig::default()).await;
    }

    #[tokio::test]
    async fn invalid_log_pattern_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let spec = shell_spec(dir.path(), "server", "sleep 30");
        let mut handle = OsLauncher.launch(&spec).unwrap();

        let err = handle
            .wait_ready(&ReadinessCheck::Log("(".to_string()), Duration::from_secs(1))
            .await
            .unwrap_err();

        assert!(matches!(err, LaunchError::ReadinessPattern { .. }));
        handle.terminate(ShutdownConfig::default()).await;
    }

    #[tokio::test]
    async fn bound_udp_port_counts_as_ready() {
        let dir = tempfile::tempdir().unwrap();
        let socket = std::net::UdpSocket::bind("127.0.0.1:0").unwrap();
        let port = socket.local_addr().unwrap().port();
        let spec = shell_spec(dir.path(), "server", "sleep 30");
        let mut handle = OsLauncher.launch(&spec).unwrap();

        handle
            .wait_ready(&ReadinessCheck::UdpBound(port), Duration::from_secs(2))
            .await
            .unwrap();
        handle.terminate(ShutdownConfig::default()).await;
    }

    #[tokio::test]
    async fn server_exiting_on_a_taken_port_is_not_ready() {
        let dir = tempfile::tempdir().unwrap();
        let stale = std::net::UdpSocket::bind("127.0.0.1:0").unwrap();
        let port = stale.local_addr().unwrap().port();
        let spec = shell_spec(dir.path(), "server", "sleep 0.05; exit 1");
        let mut handle = OsLauncher.launch(&spec).unwrap();

        let err = handle
            .wait_ready(&ReadinessCheck::UdpBound(port), Duration::from_secs(2))
            .await
            .unwrap_err();

        assert!(matches!(err, LaunchError::ExitedEarly { code: Some(1), .. }));
    }

    #[cfg(target_os = "linux")]
    #[tokio::test]
    async fn udp_check_leaves_the_port_free() {
        let free = std::net::UdpSocket::bind("127.0.0.1:0").unwrap();
        let port = free.local_addr().unwrap().port();
        assert!(udp_port_bound(port).await);
        drop(free);

        for _ in 0..50 {
            let _ = udp_port_bound(port).await;
            let socket = std::net::UdpSocket::bind(("0.0.0.0", port)).unwrap();
            drop(socket);
        }
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn socket_table_is_matched_on_local_port() {
        let table = "\
  sl  local_address rem_address   st tx_queue rx_queue tr tm->when retrnsmt   uid  timeout inode ref pointer drops
  125: 00000000:3039 00000000:0000 07 00000000:00000000 00:00000000 00000000  1000        0 41231 2 0000000000000000 0
  231: 0100007F:0035 00000000:0000 07 00000000:00000000 00:00000000 00000000   101        0 18842 2 0000000000000000 0
";
        assert!(table_has_local_port(table, 12345));
        assert!(table_has_local_port(table, 53));
        assert!(!table_has_local_port(table, 0x3039 + 1));
        assert!(!table_has_local_port("  sl  local_address\n", 12345));

        let table6 = "\
  sl  local_address                         remote_address                        st tx_queue rx_queue tr tm->when retrnsmt   uid  timeout inode ref pointer drops
   44: 00000000000000000000000000000000:2328 00000000000000000000000000000000:0000 07 00000000:00000000 00:00000000 00000000     0        0 5512 2 0000000000000000 0
";
        assert!(table_has_local_port(table6, 9000));
    }

    #[tokio::test]
    async fn delay_check_waits_then_reports_exit() {
        let dir = tempfile::tempdir().unwrap();
        let spec = shell_spec(dir.path(), "server", "sleep 30");
        let mut handle = OsLauncher.launch(&spec).unwrap();
        let started = Instant::now();
        handle
            .wait_ready(&ReadinessCheck::Delay(200), Duration::from_secs(5))
            .await
            .unwrap();
        assert!(started.elapsed() >= Duration::from_millis(200));
        handle.terminate(ShutdownConfig::default()).await;

        let spec = shell_spec(dir.path(), "gardener1", "exit 2");
        let mut handle = OsLauncher.launch(&spec).unwrap();
        let err = handle
            .wait_ready(&ReadinessCheck::Delay(300), Duration::from_secs(5))
            .await
            .unwrap_err();
        assert!(matches!(err, LaunchError::ExitedEarly { code: Some(2), .. }));
    }

    #[tokio::test]
    async fn tcp_listener_counts_as_ready() {
        let dir = tempfile::tempdir().unwrap();
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let spec = shell_spec(dir.path(), "server", "sleep 30");
        let mut handle = OsLauncher.launch(&spec).unwrap();

        handle
            .wait_ready(&ReadinessCheck::Tcp(port), Duration::from_secs(2))
            .await
            .unwrap();
        handle.terminate(ShutdownConfig::default()).await;
    }

    #[tokio::test]
    async fn sigint_stage_runs_first() {
        let dir = tempfile::tempdir().unwrap();
        let spec = shell_spec(
            dir.path(),
            "monitor",
            "trap 'exit 0' INT; echo armed; while true; do sleep 1; done",
        );
        let mut handle = OsLauncher.launch(&spec).unwrap();
        handle
            .wait_ready(&ReadinessCheck::Log("armed".to_string()), Duration::from_secs(5))
            .await
            .unwrap();

        let outcome = handle.terminate(ShutdownConfig::new(2000, 2000)).await;

        assert_eq!(outcome, TerminateOutcome::Stopped { signal: ProcessSignal::SigInt });
    }

    #[tokio::test]
    async fn ignored_sigterm_escalates_to_kill() {
        let dir = tempfile::tempdir().unwrap();
        let spec = shell_spec(
            dir.path(),
            "flowerbed",
            "trap '' TERM; echo armed; while true; do sleep 1; done",
        );
        let mut handle = OsLauncher.launch(&spec).unwrap();
        handle
            .wait_ready(&ReadinessCheck::Log("armed".to_string()), Duration::from_secs(5))
            .await
            .unwrap();

        let outcome = handle.terminate(ShutdownConfig::new(0, 200)).await;

        assert_eq!(outcome, TerminateOutcome::Killed);
    }
}

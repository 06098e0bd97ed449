//! greenhouse: build and launch the garden simulation.
//!
//! This is the entry point of the application. It parses command-line
//! arguments, merges them with the optional configuration file, and hands the
//! resolved launch plan to the supervisor.

mod builder;
mod case;
mod config;
mod errors;
mod logging;
mod output;
mod plan;
mod process;
mod runner;
mod supervisor;

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Result;
use clap::builder::styling::{AnsiColor, Effects, Style};
use clap::builder::Styles;
use clap::Parser;
use tracing::{info, warn};

use crate::builder::{BuildStage, BuildStep, CommandBuilder, Prebuilt};
use crate::case::RunCase;
use crate::config::{Config, ServerReady};
use crate::logging::LogLevel;
use crate::plan::{plan_for, PlanSettings, RunPlan};
use crate::process::Layout;
use crate::runner::{OsLauncher, ShutdownConfig, TerminateOutcome};
use crate::supervisor::{RunReport, Supervisor, SupervisorOptions};

const DEFAULT_CONFIG: &str = "greenhouse.toml";
const DEFAULT_PORT: u16 = 12345;
const DEFAULT_HOST: &str = "127.0.0.1";
const DEFAULT_RUN_SECS: u64 = 40;
const DEFAULT_SETTLE_MS: u64 = 1000;
const DEFAULT_READY_TIMEOUT_MS: u64 = 10_000;

/// Command-line interface definition.
#[derive(Debug, Parser)]
#[command(
    name = "greenhouse",
    version,
    about = "Build the simulation, launch every role in order, stop them after the run window",
    styles = help_styles()
)]
struct Cli {
    /// Run case: selects the executable directory and the launch topology.
    #[arg(value_enum)]
    run_case: RunCase,
    /// Port the server listens on [default: 12345].
    #[arg(long, short = 'p')]
    port: Option<u16>,
    /// Path to greenhouse.toml configuration file.
    #[arg(long)]
    config: Option<PathBuf>,
    /// Ignore any greenhouse.toml in the current directory.
    #[arg(long)]
    no_config: bool,
    /// Host the clients connect to [default: 127.0.0.1].
    #[arg(long)]
    host: Option<String>,
    /// Build output directory [default: build].
    #[arg(long)]
    build_dir: Option<PathBuf>,
    /// Project source directory [default: .].
    #[arg(long)]
    project_root: Option<PathBuf>,
    /// Directory for the .out/.err files [default: .].
    #[arg(long)]
    log_dir: Option<PathBuf>,
    /// Seconds to let the simulation run [default: 40].
    #[arg(long)]
    run_secs: Option<u64>,
    /// Delay between dependent groups (ms) [default: 1000].
    #[arg(long)]
    settle_ms: Option<u64>,
    /// Give up on a readiness check after this long (ms) [default: 10000].
    #[arg(long)]
    ready_timeout_ms: Option<u64>,
    /// Rely on the settle delays only.
    #[arg(long)]
    no_readiness: bool,
    /// Use the executables already in the build directory.
    #[arg(long)]
    skip_build: bool,
    /// Time to wait after sending SIGINT before escalating (ms).
    #[arg(long)]
    shutdown_sigint_ms: Option<u64>,
    /// Time to wait after sending SIGTERM before force-killing (ms).
    #[arg(long)]
    shutdown_sigterm_ms: Option<u64>,
    /// Print the launch plan without building or starting anything.
    #[arg(long)]
    dry_run: bool,
    /// Logging level; falls back to GREENHOUSE_LOG, then info.
    #[arg(long, value_enum, value_name = "LEVEL")]
    log_level: Option<LogLevel>,
}

#[tokio::main]
async fn main() {
    if let Err(err) = run_main().await {
        eprintln!("greenhouse error: {err:#}");
        std::process::exit(1);
    }
}

async fn run_main() -> Result<()> {
    let cli = Cli::parse();
    logging::init_logging(cli.log_level)?;

    let config = load_config(&cli)?;
    let settings = RunSettings::from_cli(&cli, config)?;
    let plan = plan_for(settings.case, &settings.plan_settings());

    if cli.dry_run {
        print_dry_run(&plan, &settings);
        return Ok(());
    }

    info!(case = %settings.case, port = settings.port, "starting run");
    let supervisor = Supervisor::new(
        settings.build_stage(),
        OsLauncher,
        settings.supervisor_options(),
    );
    match supervisor.run(plan, shutdown_signal()).await {
        Ok(report) => {
            log_report(&report);
            Ok(())
        }
        Err(failure) => {
            log_report(&failure.report);
            Err(failure.error.into())
        }
    }
}

fn load_config(cli: &Cli) -> Result<Config> {
    if cli.no_config {
        return Ok(Config::default());
    }
    let path = cli.config.clone().or_else(default_config_path);
    match path {
        Some(path) => config::load_config(&path),
        None => Ok(Config::default()),
    }
}

fn default_config_path() -> Option<PathBuf> {
    let path = Path::new(DEFAULT_CONFIG);
    if path.exists() {
        Some(path.to_path_buf())
    } else {
        None
    }
}

/// Everything a run needs, after CLI flags, config file and defaults are merged.
#[derive(Debug, Clone)]
struct RunSettings {
    case: RunCase,
    port: u16,
    host: String,
    build_dir: PathBuf,
    log_dir: PathBuf,
    run_for: Duration,
    settle: Duration,
    ready_timeout: Duration,
    server_ready: Option<ServerReady>,
    shutdown: ShutdownConfig,
    skip_build: bool,
    build_steps: Vec<BuildStep>,
}

impl RunSettings {
    fn from_cli(cli: &Cli, config: Config) -> Result<Self> {
        let build_dir = cli
            .build_dir
            .clone()
            .or_else(|| config.build_dir.map(PathBuf::from))
            .unwrap_or_else(|| PathBuf::from("build"));
        let project_root = cli
            .project_root
            .clone()
            .or_else(|| config.project_root.map(PathBuf::from))
            .unwrap_or_else(|| PathBuf::from("."));

        let build = config.build.unwrap_or_default();
        let mut build_steps = CommandBuilder::cmake(&project_root, &build_dir)
            .steps()
            .to_vec();
        if let Some(configure) = &build.configure {
            build_steps[0] = BuildStep::parse(configure)?;
        }
        if let Some(compile) = &build.compile {
            build_steps[1] = BuildStep::parse(compile)?;
        }

        let readiness = !cli.no_readiness && config.readiness.unwrap_or(true);
        let server_ready = readiness.then(|| config.server_ready.unwrap_or(ServerReady::UdpBound));
        let defaults = ShutdownConfig::default();

        Ok(Self {
            case: cli.run_case,
            port: cli.port.or(config.port).unwrap_or(DEFAULT_PORT),
            host: cli
                .host
                .clone()
                .or(config.host)
                .unwrap_or_else(|| DEFAULT_HOST.to_string()),
            build_dir,
            log_dir: cli
                .log_dir
                .clone()
                .or_else(|| config.log_dir.map(PathBuf::from))
                .unwrap_or_else(|| PathBuf::from(".")),
            run_for: Duration::from_secs(
                cli.run_secs.or(config.run_secs).unwrap_or(DEFAULT_RUN_SECS),
            ),
            settle: Duration::from_millis(
                cli.settle_ms.or(config.settle_ms).unwrap_or(DEFAULT_SETTLE_MS),
            ),
            ready_timeout: Duration::from_millis(
                cli.ready_timeout_ms
                    .or(config.ready_timeout_ms)
                    .unwrap_or(DEFAULT_READY_TIMEOUT_MS),
            ),
            server_ready,
            shutdown: ShutdownConfig::new(
                cli.shutdown_sigint_ms
                    .or(config.shutdown_sigint_ms)
                    .unwrap_or(defaults.sigint_ms()),
                cli.shutdown_sigterm_ms
                    .or(config.shutdown_sigterm_ms)
                    .unwrap_or(defaults.sigterm_ms()),
            ),
            skip_build: cli.skip_build || build.skip.unwrap_or(false),
            build_steps,
        })
    }

    fn plan_settings(&self) -> PlanSettings {
        PlanSettings {
            layout: Layout {
                build_dir: self.build_dir.clone(),
                log_dir: self.log_dir.clone(),
            },
            host: self.host.clone(),
            port: self.port,
            settle: self.settle,
            server_ready: self
                .server_ready
                .as_ref()
                .map(|ready| ready.to_check(self.port)),
        }
    }

    fn build_stage(&self) -> BuildStage {
        if self.skip_build {
            BuildStage::Prebuilt(Prebuilt)
        } else {
            BuildStage::Commands(CommandBuilder::new(self.build_steps.clone()))
        }
    }

    fn supervisor_options(&self) -> SupervisorOptions {
        SupervisorOptions {
            run_for: self.run_for,
            ready_timeout: self.ready_timeout,
            shutdown: self.shutdown,
        }
    }
}

/// Resolves on Ctrl-C, or SIGTERM on unix.
async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = match signal(SignalKind::terminate()) {
            Ok(signal) => signal,
            Err(err) => {
                warn!(error = %err, "failed to listen for SIGTERM");
                wait_for_ctrl_c(tokio::signal::ctrl_c()).await;
                return;
            }
        };
        tokio::select! {
            _ = wait_for_ctrl_c(tokio::signal::ctrl_c()) => {}
            _ = sigterm.recv() => info!("received SIGTERM"),
        }
    }
    #[cfg(not(unix))]
    {
        wait_for_ctrl_c(tokio::signal::ctrl_c()).await;
    }
}

/// Resolves when `listener` reports Ctrl-C. A listener that could not be
/// registered never resolves.
async fn wait_for_ctrl_c<F>(listener: F)
where
    F: std::future::Future<Output = std::io::Result<()>>,
{
    match listener.await {
        Ok(()) => info!("received SIGINT"),
        Err(err) => {
            warn!(error = %err, "failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    }
}

fn print_dry_run(plan: &RunPlan, settings: &RunSettings) {
    println!("greenhouse dry-run: case {}", plan.case);
    if settings.skip_build {
        println!("  build: skipped");
    } else {
        for step in &settings.build_steps {
            println!("  build: {}", step.command_line());
        }
    }
    println!("  run window: {}s", settings.run_for.as_secs());
    println!();

    for group in &plan.groups {
        println!("{} (settle {}ms):", group.label, group.settle.as_millis());
        for spec in &group.specs {
            println!("  - {}", spec.name);
            println!("      cmd: {}", spec.command_line());
            println!("      stdout: {}", spec.output.stdout.display());
            println!("      stderr: {}", spec.output.stderr.display());
            if let Some(check) = &spec.ready_check {
                println!("      ready: {:?}", check);
            }
        }
    }
}

fn log_report(report: &RunReport) {
    for record in &report.launched {
        info!(
            process = %record.name,
            pid = record.pid.unwrap_or(0),
            at_ms = record.at.as_millis() as u64,
            "launched"
        );
    }
    for record in &report.terminated {
        match &record.outcome {
            TerminateOutcome::AlreadyExited { code } => {
                warn!(process = %record.name, ?code, "had already exited")
            }
            TerminateOutcome::Stopped { signal } => {
                info!(process = %record.name, signal = signal.label(), "stopped")
            }
            TerminateOutcome::Killed => warn!(process = %record.name, "killed"),
            TerminateOutcome::Failed { error } => {
                warn!(process = %record.name, error = %error, "could not be stopped")
            }
        }
    }
    info!(
        case = %report.case,
        processes = report.terminated.len(),
        interrupted = report.interrupted,
        state = ?report.state,
        "run finished"
    );
}

fn help_styles() -> Styles {
    Styles::styled()
        .header(
            Style::new()
                .fg_color(Some(AnsiColor::Green.into()))
                .effects(Effects::BOLD),
        )
        .usage(
            Style::new()
                .fg_color(Some(AnsiColor::Green.into()))
                .effects(Effects::BOLD),
        )
        .literal(Style::new().fg_color(Some(AnsiColor::Cyan.into())))
        .placeholder(Style::new().fg_color(Some(AnsiColor::Yellow.into())))
}

//! The build step run before any process is launched.
//!
//! Building is two external commands: one generating build files for the
//! project root, one building the `all` target. Both must succeed, and every
//! executable the plan needs must exist afterwards.

use std::path::Path;
use std::process::Stdio;

use anyhow::{anyhow, Context};
use async_trait::async_trait;
use tokio::process::Command;
use tracing::{debug, info};

use crate::errors::{LaunchError, Result};
use crate::plan::RunPlan;

/// Produces the executables of every run case.
#[async_trait]
pub trait Builder: Send {
    /// Builds, then checks that every executable `plan` needs exists.
    async fn build(&mut self, plan: &RunPlan) -> Result<()>;
}

/// One external build command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuildStep {
    pub program: String,
    pub args: Vec<String>,
}

impl BuildStep {
    /// Parses a shell-style command string.
    pub fn parse(command: &str) -> anyhow::Result<Self> {
        let mut parts = shell_words::split(command)
            .with_context(|| format!("failed to parse build command `{}`", command))?;
        if parts.is_empty() {
            return Err(anyhow!("empty build command"));
        }
        let program = parts.remove(0);
        Ok(Self {
            program,
            args: parts,
        })
    }

    /// The command as it would be typed in a shell.
    pub fn command_line(&self) -> String {
        let mut parts = vec![self.program.clone()];
        parts.extend(self.args.iter().cloned());
        shell_words::join(parts)
    }
}

/// Runs its steps in order, stopping at the first failure.
#[derive(Debug, Clone)]
pub struct CommandBuilder {
    steps: Vec<BuildStep>,
}

impl CommandBuilder {
    pub fn new(steps: Vec<BuildStep>) -> Self {
        Self { steps }
    }

    /// `cmake -S <root> -B <build_dir>` then `cmake --build <build_dir> --target all`.
    pub fn cmake(project_root: &Path, build_dir: &Path) -> Self {
        let root = project_root.display().to_string();
        let build = build_dir.display().to_string();
        Self::new(vec![
            BuildStep {
                program: "cmake".to_string(),
                args: vec!["-S".to_string(), root, "-B".to_string(), build.clone()],
            },
            BuildStep {
                program: "cmake".to_string(),
                args: vec![
                    "--build".to_string(),
                    build,
                    "--target".to_string(),
                    "all".to_string(),
                ],
            },
        ])
    }

    pub fn steps(&self) -> &[BuildStep] {
        &self.steps
    }
}

#[async_trait]
impl Builder for CommandBuilder {
    async fn build(&mut self, plan: &RunPlan) -> Result<()> {
        for step in &self.steps {
            let command_line = step.command_line();
            info!(step = %command_line, "running build step");
            let status = Command::new(&step.program)
                .args(&step.args)
                .stdin(Stdio::null())
                .status()
                .await
                .map_err(|source| LaunchError::BuildSpawn {
                    step: command_line.clone(),
                    source,
                })?;
            if !status.success() {
                return Err(LaunchError::BuildFailed {
                    step: command_line,
                    code: status.code(),
                });
            }
            debug!(step = %command_line, "build step finished");
        }
        verify_executables(plan)
    }
}

/// Only checks the executables; used when building is skipped.
#[derive(Debug, Default)]
pub struct Prebuilt;

#[async_trait]
impl Builder for Prebuilt {
    async fn build(&mut self, plan: &RunPlan) -> Result<()> {
        verify_executables(plan)
    }
}

/// Either the external build or the pre-built check.
#[derive(Debug)]
pub enum BuildStage {
    Commands(CommandBuilder),
    Prebuilt(Prebuilt),
}

#[async_trait]
impl Builder for BuildStage {
    async fn build(&mut self, plan: &RunPlan) -> Result<()> {
        match self {
            BuildStage::Commands(builder) => builder.build(plan).await,
            BuildStage::Prebuilt(builder) => builder.build(plan).await,
        }
    }
}

/// Checks that the build produced every executable `plan` will spawn.
pub fn verify_executables(plan: &RunPlan) -> Result<()> {
    for spec in plan.specs() {
        if !spec.program.is_file() {
            return Err(LaunchError::MissingExecutable {
                name: spec.name.clone(),
                path: spec.program.clone(),
            });
        }
    }
    Ok(())
}

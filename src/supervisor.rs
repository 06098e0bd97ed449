//! Drives one run from build to teardown.
//!
//! The supervisor is the only owner of process handles. It moves through
//! `Idle → Building → Launching(i) → Running → Terminating → Done` and always
//! reaches `Terminating`, whichever step failed, so every process spawned so
//! far is stopped exactly once.

use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use thiserror::Error;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::builder::Builder;
use crate::case::RunCase;
use crate::errors::{LaunchError, Result};
use crate::plan::RunPlan;
use crate::runner::{Launcher, ProcessHandle, ShutdownConfig, TerminateOutcome};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunState {
    Idle,
    Building,
    Launching { group: usize },
    Running,
    Terminating,
    Done,
}

#[derive(Debug, Clone)]
pub struct SupervisorOptions {
    /// How long the simulation runs once everything is launched.
    pub run_for: Duration,
    /// Upper bound for each readiness check.
    pub ready_timeout: Duration,
    pub shutdown: ShutdownConfig,
}

/// A process as it was launched.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchRecord {
    pub name: String,
    pub pid: Option<u32>,
    /// Offset from the start of the run.
    pub at: Duration,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TerminationRecord {
    pub name: String,
    pub outcome: TerminateOutcome,
}

/// Everything observable about a finished run.
#[derive(Debug, Clone)]
pub struct RunReport {
    pub case: RunCase,
    pub launched: Vec<LaunchRecord>,
    pub terminated: Vec<TerminationRecord>,
    /// The run window was cut short by an interrupt.
    pub interrupted: bool,
    pub state: RunState,
}

/// A run that failed; teardown has already happened.
#[derive(Debug, Error)]
#[error("{error}")]
pub struct RunFailure {
    #[source]
    pub error: LaunchError,
    pub report: RunReport,
}

pub struct Supervisor<B, L: Launcher> {
    builder: B,
    launcher: L,
    options: SupervisorOptions,
    state: RunState,
    handles: Vec<L::Handle>,
    launched: Vec<LaunchRecord>,
    terminated: Vec<TerminationRecord>,
    interrupted: bool,
    started: Instant,
}

impl<B: Builder, L: Launcher> Supervisor<B, L> {
    pub fn new(builder: B, launcher: L, options: SupervisorOptions) -> Self {
        Self {
            builder,
            launcher,
            options,
            state: RunState::Idle,
            handles: Vec::new(),
            launched: Vec::new(),
            terminated: Vec::new(),
            interrupted: false,
            started: Instant::now(),
        }
    }

    /// Builds, launches `plan`, lets it run, then stops every process.
    ///
    /// `interrupt` resolving ends the run early: during launching it is an
    /// error, during the run window it only shortens the window.
    pub async fn run<F>(
        mut self,
        plan: RunPlan,
        interrupt: F,
    ) -> std::result::Result<RunReport, RunFailure>
    where
        F: Future<Output = ()>,
    {
        tokio::pin!(interrupt);
        self.started = Instant::now();

        let result = self.drive(&plan, interrupt).await;
        if let Err(err) = &result {
            warn!(error = %err, "run failed; stopping launched processes");
        }
        self.teardown().await;
        self.set_state(RunState::Done);

        let report = RunReport {
            case: plan.case,
            launched: self.launched,
            terminated: self.terminated,
            interrupted: self.interrupted,
            state: self.state,
        };
        match result {
            Ok(()) => Ok(report),
            Err(error) => Err(RunFailure { error, report }),
        }
    }

    async fn drive<F>(&mut self, plan: &RunPlan, mut interrupt: Pin<&mut F>) -> Result<()>
    where
        F: Future<Output = ()>,
    {
        self.set_state(RunState::Building);
        self.builder.build(plan).await?;

        let launched = tokio::select! {
            result = self.launch_groups(plan) => Some(result),
            _ = interrupt.as_mut() => None,
        };
        match launched {
            Some(result) => result?,
            None => {
                self.interrupted = true;
                let group = match self.state {
                    RunState::Launching { group } => plan.groups[group].label,
                    _ => "processes",
                };
                return Err(LaunchError::Interrupted {
                    group: group.to_string(),
                });
            }
        }

        self.set_state(RunState::Running);
        info!(
            processes = plan.process_count(),
            seconds = self.options.run_for.as_secs_f64(),
            "all processes launched; running"
        );
        tokio::select! {
            _ = tokio::time::sleep(self.options.run_for) => {
                info!("run window elapsed");
            }
            _ = interrupt.as_mut() => {
                warn!("interrupted; stopping early");
                self.interrupted = true;
            }
        }
        Ok(())
    }

    async fn launch_groups(&mut self, plan: &RunPlan) -> Result<()> {
        for (index, group) in plan.groups.iter().enumerate() {
            self.set_state(RunState::Launching { group: index });
            println!("Launching {}", group.label);

            let first = self.handles.len();
            for spec in &group.specs {
                let handle = self.launcher.launch(spec)?;
                self.launched.push(LaunchRecord {
                    name: handle.name().to_string(),
                    pid: handle.pid(),
                    at: self.started.elapsed(),
                });
                self.handles.push(handle);
            }
            let spawned = Instant::now();

            let ready_timeout = self.options.ready_timeout;
            for (handle, spec) in self.handles[first..].iter_mut().zip(&group.specs) {
                if let Some(check) = &spec.ready_check {
                    debug!(process = %spec.name, ?check, "waiting for readiness");
                    handle.wait_ready(check, ready_timeout).await?;
                }
            }

            let remaining = group.settle.saturating_sub(spawned.elapsed());
            if !remaining.is_zero() {
                debug!(group = group.label, ms = remaining.as_millis() as u64, "settling");
                tokio::time::sleep(remaining).await;
            }
        }
        Ok(())
    }

    async fn teardown(&mut self) {
        self.set_state(RunState::Terminating);
        let shutdown = self.options.shutdown;
        for mut handle in self.handles.drain(..) {
            let outcome = handle.terminate(shutdown).await;
            match &outcome {
                TerminateOutcome::Failed { error } => {
                    warn!(process = handle.name(), error = %error, "failed to stop process")
                }
                outcome => debug!(process = handle.name(), ?outcome, "process stopped"),
            }
            self.terminated.push(TerminationRecord {
                name: handle.name().to_string(),
                outcome,
            });
        }
    }

    fn set_state(&mut self, state: RunState) {
        debug!(from = ?self.state, to = ?state, "run state");
        self.state = state;
    }
}

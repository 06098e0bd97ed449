//! Launch topologies for every run case.
//!
//! A plan is an ordered list of launch groups. Groups start strictly in
//! sequence: the next group is only spawned once the previous group's settle
//! delay has passed and every readiness check in it has succeeded.
//!
//! Two shapes exist:
//! - `4-5`: server, gardeners, flowerbed.
//! - `6-7`, `8`, `9-10`: server, monitor, gardeners, flowerbed. The monitor is
//!   idle until the server instructs it, so it starts without a settle delay.

use std::time::Duration;

use crate::case::RunCase;
use crate::process::{LaunchSpec, Layout, ReadinessCheck};

/// Number of gardener instances started in every case.
pub const GARDENERS: usize = 2;

/// Inputs that shape a plan beyond the run case itself.
#[derive(Debug, Clone)]
pub struct PlanSettings {
    pub layout: Layout,
    pub host: String,
    pub port: u16,
    /// Minimum wait after a group that dependents need to be listening.
    pub settle: Duration,
    /// Readiness check attached to the server, if any.
    pub server_ready: Option<ReadinessCheck>,
}

/// Processes started together, followed by a settle delay.
#[derive(Debug, Clone)]
pub struct LaunchGroup {
    /// Shown in the progress message before the group is launched.
    pub label: &'static str,
    pub specs: Vec<LaunchSpec>,
    pub settle: Duration,
}

#[derive(Debug, Clone)]
pub struct RunPlan {
    pub case: RunCase,
    pub groups: Vec<LaunchGroup>,
}

impl RunPlan {
    pub fn specs(&self) -> impl Iterator<Item = &LaunchSpec> {
        self.groups.iter().flat_map(|group| group.specs.iter())
    }

    pub fn process_count(&self) -> usize {
        self.groups.iter().map(|group| group.specs.len()).sum()
    }
}

/// Resolves the topology of `case`.
pub fn plan_for(case: RunCase, settings: &PlanSettings) -> RunPlan {
    let groups = match case {
        RunCase::FourFive => vec![
            server_group(case, settings, settings.settle),
            gardener_group(case, settings),
            flowerbed_group(case, settings),
        ],
        RunCase::SixSeven | RunCase::Eight | RunCase::NineTen => vec![
            server_group(case, settings, Duration::ZERO),
            monitor_group(case, settings),
            gardener_group(case, settings),
            flowerbed_group(case, settings),
        ],
    };
    RunPlan { case, groups }
}

fn server_group(case: RunCase, settings: &PlanSettings, settle: Duration) -> LaunchGroup {
    let server = LaunchSpec::server(case, &settings.layout, settings.port)
        .with_ready_check(settings.server_ready.clone());
    LaunchGroup {
        label: "server",
        specs: vec![server],
        settle,
    }
}

fn monitor_group(case: RunCase, settings: &PlanSettings) -> LaunchGroup {
    LaunchGroup {
        label: "monitor",
        specs: vec![LaunchSpec::monitor(
            case,
            &settings.layout,
            &settings.host,
            settings.port,
        )],
        settle: Duration::ZERO,
    }
}

fn gardener_group(case: RunCase, settings: &PlanSettings) -> LaunchGroup {
    let specs = (1..=GARDENERS)
        .map(|n| LaunchSpec::gardener(case, &settings.layout, &settings.host, settings.port, n))
        .collect();
    LaunchGroup {
        label: "gardeners",
        specs,
        settle: settings.settle,
    }
}

fn flowerbed_group(case: RunCase, settings: &PlanSettings) -> LaunchGroup {
    LaunchGroup {
        label: "flowerbed",
        specs: vec![LaunchSpec::flowerbed(
            case,
            &settings.layout,
            &settings.host,
            settings.port,
        )],
        settle: Duration::ZERO,
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use std::path::PathBuf;

    use clap::ValueEnum;

    use super::*;
    use crate::process::Role;

    pub(crate) fn settings(port: u16) -> PlanSettings {
        PlanSettings {
            layout: Layout {
                build_dir: PathBuf::from("build"),
                log_dir: PathBuf::from("logs"),
            },
            host: "127.0.0.1".to_string(),
            port,
            settle: Duration::from_secs(1),
            server_ready: None,
        }
    }

    fn names(plan: &RunPlan) -> Vec<&str> {
        plan.specs().map(|spec| spec.name.as_str()).collect()
    }

    #[test]
    fn first_case_has_no_monitor() {
        let plan = plan_for(RunCase::FourFive, &settings(12345));
        assert_eq!(names(&plan), vec!["server", "gardener1", "gardener2", "flowerbed"]);
        let settles: Vec<_> = plan.groups.iter().map(|g| g.settle).collect();
        assert_eq!(
            settles,
            vec![Duration::from_secs(1), Duration::from_secs(1), Duration::ZERO]
        );
    }

    #[test]
    fn monitor_cases_start_monitor_right_after_server() {
        for case in [RunCase::SixSeven, RunCase::Eight, RunCase::NineTen] {
            let plan = plan_for(case, &settings(12345));
            assert_eq!(
                names(&plan),
                vec!["server", "monitor", "gardener1", "gardener2", "flowerbed"]
            );
            assert_eq!(plan.groups[0].settle, Duration::ZERO);
            assert_eq!(plan.groups[1].settle, Duration::ZERO);
            assert_eq!(plan.groups[2].settle, Duration::from_secs(1));
            assert_eq!(plan.groups[2].specs.len(), GARDENERS);
        }
    }

    #[test]
    fn every_case_resolves_to_its_own_directory() {
        for case in RunCase::value_variants().iter().copied() {
            let plan = plan_for(case, &settings(12345));
            assert_eq!(plan.case, case);
            let dir = PathBuf::from("build").join(case.as_str());
            assert!(plan.specs().all(|spec| spec.program.starts_with(&dir)));
        }
    }

    #[test]
    fn port_is_forwarded_to_every_role() {
        let plan = plan_for(RunCase::Eight, &settings(9000));
        for spec in plan.specs() {
            match spec.role {
                Role::Server => assert_eq!(spec.args, vec!["9000"]),
                _ => assert_eq!(spec.args, vec!["127.0.0.1", "9000"]),
            }
        }
    }

    #[test]
    fn output_files_are_unique_per_process() {
        let plan = plan_for(RunCase::NineTen, &settings(12345));
        let mut files: Vec<_> = plan
            .specs()
            .flat_map(|spec| [spec.output.stdout.clone(), spec.output.stderr.clone()])
            .collect();
        let total = files.len();
        files.sort();
        files.dedup();
        assert_eq!(files.len(), total);
        assert_eq!(total, plan.process_count() * 2);
    }

    #[test]
    fn only_server_carries_readiness_check() {
        let mut settings = settings(12345);
        settings.server_ready = Some(ReadinessCheck::UdpBound(12345));
        let plan = plan_for(RunCase::SixSeven, &settings);
        for spec in plan.specs() {
            if spec.role == Role::Server {
                assert_eq!(spec.ready_check, Some(ReadinessCheck::UdpBound(12345)));
            } else {
                assert!(spec.ready_check.is_none());
            }
        }
    }
}

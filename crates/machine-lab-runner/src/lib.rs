pub mod config;
pub mod driver;
pub mod error;
pub mod executor;
pub mod fsutil;
pub mod launcher;
pub mod plan;
pub mod report;
pub mod sampler;
pub mod scheduler;

use anyhow::Result;
use tracing::info;

pub use config::{ExecutorConfig, LauncherConfig, LauncherKind, SamplerConfig, SuiteConfig};
pub use driver::{DockerMachineCli, MachineDriver};
pub use error::{OrchestrationError, StepFailure};
pub use executor::{Executor, RunIdentity, RunOutcome, RunStatus};
pub use launcher::{guard_worker, run_worker, DockerLauncher, LaunchRequest, ProcessLauncher, RunLauncher};
pub use plan::LifecyclePlan;
pub use report::SuiteReport;
pub use sampler::{CreateArgSampler, CreateArgSource, StaticCreateArgs};
pub use scheduler::{CompletedRun, Scheduler};

/// Launch every run in batches, wait for them, and write the aggregate report.
pub fn run_suite(
    config: &SuiteConfig,
    launcher: &dyn RunLauncher,
    create_args: &mut dyn CreateArgSource,
) -> Result<SuiteReport> {
    config.validate()?;
    fsutil::ensure_dir(&config.results_dir)?;
    info!(
        runs = config.requested_runs(),
        max_parallel = config.max_parallel,
        existing_machines = config.existing_machines.len(),
        results_dir = %config.results_dir.display(),
        "running test suite"
    );
    let completed = Scheduler::new(launcher, config).run(create_args)?;
    let report = report::aggregate(
        &completed,
        config.requested_runs(),
        config.frequency_limited_account,
        config.log_tail_lines,
    );
    report::write_reports(&config.results_dir, &report)?;
    info!(
        success = report.success_count,
        errors = report.error_count,
        timeouts = report.timeout_count,
        "test suite finished"
    );
    Ok(report)
}

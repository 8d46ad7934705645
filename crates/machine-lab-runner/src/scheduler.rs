//! Bounded-parallelism batches of single-machine runs, observed by polling.

use anyhow::Result;
use std::path::PathBuf;
use std::thread;
use std::time::Instant;
use tracing::{debug, info, warn};

use crate::config::SuiteConfig;
use crate::executor::RunStatus;
use crate::launcher::{prepare_run_dir, read_status, LaunchRequest, RunLauncher};
use crate::sampler::CreateArgSource;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlannedRun {
    pub run_name: String,
    pub run_dir: PathBuf,
    pub machine_name: Option<String>,
}

impl PlannedRun {
    fn finish(self, status: RunStatus) -> CompletedRun {
        CompletedRun {
            run_name: self.run_name,
            run_dir: self.run_dir,
            machine_name: self.machine_name,
            status,
        }
    }
}

/// A run whose status is terminal, either reported by its worker or forced by
/// the global timeout.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompletedRun {
    pub run_name: String,
    pub run_dir: PathBuf,
    pub machine_name: Option<String>,
    pub status: RunStatus,
}

pub struct Scheduler<'a> {
    launcher: &'a dyn RunLauncher,
    config: &'a SuiteConfig,
}

impl<'a> Scheduler<'a> {
    pub fn new(launcher: &'a dyn RunLauncher, config: &'a SuiteConfig) -> Self {
        Self { launcher, config }
    }

    fn planned(&self, index: usize, machine_name: Option<String>) -> PlannedRun {
        let run_name = format!("test{}", index);
        PlannedRun {
            run_dir: self.config.results_dir.join(&run_name),
            run_name,
            machine_name,
        }
    }

    /// ceil(N/P) batches of new machines, or a single batch holding every
    /// existing machine regardless of the parallelism limit.
    pub fn plan_batches(&self) -> Vec<Vec<PlannedRun>> {
        if !self.config.existing_machines.is_empty() {
            let batch = self
                .config
                .existing_machines
                .iter()
                .enumerate()
                .map(|(i, name)| self.planned(i + 1, Some(name.clone())))
                .collect();
            return vec![batch];
        }
        let parallel = self.config.max_parallel.max(1);
        let runs: Vec<PlannedRun> = (1..=self.config.runs).map(|i| self.planned(i, None)).collect();
        runs.chunks(parallel).map(|c| c.to_vec()).collect()
    }

    pub fn run(&self, create_args: &mut dyn CreateArgSource) -> Result<Vec<CompletedRun>> {
        let deadline = Instant::now() + self.config.global_timeout();
        let batches = self.plan_batches();
        let batch_count = batches.len();
        let mut completed = Vec::with_capacity(self.config.requested_runs());

        for (index, batch) in batches.into_iter().enumerate() {
            if Instant::now() >= deadline {
                warn!(
                    batch = index + 1,
                    runs = batch.len(),
                    "global timeout already reached, batch not launched"
                );
                completed.extend(batch.into_iter().map(|r| r.finish(RunStatus::Timeout)));
                continue;
            }
            info!(batch = index + 1, batch_count, runs = batch.len(), "launching batch");
            for run in &batch {
                prepare_run_dir(&run.run_dir)?;
                let args = match run.machine_name {
                    Some(_) => Vec::new(),
                    None => create_args.next_args()?,
                };
                self.launcher.launch(&LaunchRequest {
                    run_name: run.run_name.clone(),
                    run_dir: run.run_dir.clone(),
                    machine_name: run.machine_name.clone(),
                    create_args: args,
                })?;
                info!(run = %run.run_name, machine = ?run.machine_name, "run launched");
            }
            completed.extend(self.wait_for_batch(batch, deadline)?);
        }
        Ok(completed)
    }

    fn wait_for_batch(&self, batch: Vec<PlannedRun>, deadline: Instant) -> Result<Vec<CompletedRun>> {
        info!(runs = batch.len(), "waiting for batch to complete");
        let mut statuses: Vec<Option<RunStatus>> = vec![None; batch.len()];
        loop {
            for (run, slot) in batch.iter().zip(statuses.iter_mut()) {
                if slot.is_some() {
                    continue;
                }
                if let Some(status) = read_status(&run.run_dir, &run.run_name)? {
                    info!(run = %run.run_name, status = status.as_str(), "run finished");
                    *slot = Some(status);
                }
            }
            let done = statuses.iter().filter(|s| s.is_some()).count();
            if done == batch.len() {
                break;
            }
            let now = Instant::now();
            if now >= deadline {
                warn!(
                    pending = batch.len() - done,
                    "global timeout reached, marking pending runs TIMEOUT"
                );
                break;
            }
            debug!(done, total = batch.len(), "batch still running");
            thread::sleep(self.config.poll_interval().min(deadline - now));
        }
        Ok(batch
            .into_iter()
            .zip(statuses)
            .map(|(run, status)| run.finish(status.unwrap_or(RunStatus::Timeout)))
            .collect())
    }
}

//! Worker launch and the per-run side-channel (status marker + log).

use anyhow::Result;
use serde_json::json;
use std::fs;
use std::path::{Path, PathBuf};
use std::panic::{self, AssertUnwindSafe};
use std::process::{Child, Command, Stdio};
use std::sync::Mutex;
use tracing::{debug, error, info};

use crate::config::{ExecutorConfig, LauncherConfig};
use crate::driver::MachineDriver;
use crate::error::OrchestrationError;
use crate::executor::{Executor, RunIdentity, RunOutcome, RunStatus};
use crate::fsutil::{append_text, atomic_write_bytes, atomic_write_json_pretty, ensure_dir};
use crate::plan::LifecyclePlan;
use crate::sampler::CreateArg;

pub const STATUS_FILE: &str = "status";
pub const LOG_FILE: &str = "logs";
pub const OUTCOME_FILE: &str = "outcome.json";
/// Run directory as mounted inside a worker container.
pub const CONTAINER_RUN_DIR: &str = "/machine-lab";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchRequest {
    pub run_name: String,
    /// Run directory as seen by the scheduler.
    pub run_dir: PathBuf,
    /// Pre-existing machine to reuse; create is skipped.
    pub machine_name: Option<String>,
    pub create_args: Vec<CreateArg>,
}

/// Starts one isolated single-machine run. Progress is observed only through
/// the run directory's status marker and log.
pub trait RunLauncher {
    fn launch(&self, request: &LaunchRequest) -> Result<()>;
}

/// Reset the run directory so a stale marker from an earlier suite is never read.
pub fn prepare_run_dir(run_dir: &Path) -> Result<()> {
    ensure_dir(run_dir)?;
    atomic_write_bytes(&run_dir.join(STATUS_FILE), b"")
}

/// `None` while the worker is still running.
pub fn read_status(run_dir: &Path, run_name: &str) -> Result<Option<RunStatus>> {
    let path = run_dir.join(STATUS_FILE);
    if !path.exists() {
        return Ok(None);
    }
    let raw = fs::read_to_string(&path)?;
    match raw.trim() {
        "" => Ok(None),
        "OK" => Ok(Some(RunStatus::Ok)),
        "ERROR" => Ok(Some(RunStatus::Error)),
        other => Err(OrchestrationError::ProtocolViolation {
            run_name: run_name.to_string(),
            path,
            value: other.to_string(),
        }
        .into()),
    }
}

pub fn write_status(run_dir: &Path, status: RunStatus) -> Result<()> {
    match status {
        RunStatus::Ok | RunStatus::Error => {
            atomic_write_bytes(&run_dir.join(STATUS_FILE), format!("{}\n", status.as_str()).as_bytes())
        }
        other => Err(anyhow::anyhow!(
            "workers may only report OK or ERROR, got {}",
            other.as_str()
        )),
    }
}

/// Worker side: execute the plan, then publish the outcome and status marker.
pub fn run_worker<D: MachineDriver>(
    run_dir: &Path,
    driver: &D,
    config: &ExecutorConfig,
    identity: RunIdentity,
    plan: &LifecyclePlan,
) -> Result<RunOutcome> {
    ensure_dir(run_dir)?;
    let outcome = Executor::new(driver, config, identity).run(plan);
    let payload = json!({
        "schema_version": "run_outcome_v1",
        "machine_name": outcome.machine_name,
        "status": outcome.status,
        "errors": outcome.errors.iter().map(|e| e.to_string()).collect::<Vec<_>>(),
        "steps": &outcome.steps,
    });
    atomic_write_json_pretty(&run_dir.join(OUTCOME_FILE), &payload)?;
    write_status(run_dir, outcome.status)?;
    Ok(outcome)
}

/// Run a worker body so that the run always ends with a status marker. An
/// error or panic from `body` is appended to the run log and published as
/// ERROR.
pub fn guard_worker<F>(run_dir: &Path, body: F) -> RunStatus
where
    F: FnOnce() -> Result<RunStatus>,
{
    let failure = match panic::catch_unwind(AssertUnwindSafe(body)) {
        Ok(Ok(status)) => return status,
        Ok(Err(e)) => format!("{:#}", e),
        Err(payload) => {
            let message = payload
                .downcast_ref::<&str>()
                .map(|s| s.to_string())
                .or_else(|| payload.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "unknown panic".to_string());
            format!("worker panicked: {}", message)
        }
    };
    error!(run_dir = %run_dir.display(), "single run aborted: {}", failure);
    let _ = ensure_dir(run_dir);
    if let Err(e) = append_text(&run_dir.join(LOG_FILE), &format!("single run aborted: {}\n", failure)) {
        error!(run_dir = %run_dir.display(), "failed to append to run log: {}", e);
    }
    if let Err(e) = write_status(run_dir, RunStatus::Error) {
        error!(run_dir = %run_dir.display(), "failed to write status marker: {}", e);
    }
    RunStatus::Error
}

fn worker_args(run_dir: &str, request: &LaunchRequest, executor: &ExecutorConfig) -> Vec<String> {
    let mut args = vec![
        "single-run".to_string(),
        "--run-dir".to_string(),
        run_dir.to_string(),
    ];
    args.extend(executor.to_worker_args());
    if let Some(machine) = &request.machine_name {
        args.push("--machine-name".to_string());
        args.push(machine.clone());
    }
    for (flag, value) in &request.create_args {
        args.push("--create-arg".to_string());
        args.push(format!("{}={}", flag, value));
    }
    args
}

/// One detached container per run, with the run directory bind-mounted.
pub struct DockerLauncher {
    config: LauncherConfig,
    executor: ExecutorConfig,
}

impl DockerLauncher {
    pub fn new(config: LauncherConfig, executor: ExecutorConfig) -> Self {
        Self { config, executor }
    }

    fn host_run_dir(&self, request: &LaunchRequest) -> PathBuf {
        match &self.config.host_path {
            Some(host) => host.join(&request.run_name),
            None => request.run_dir.clone(),
        }
    }

    pub fn command(&self, request: &LaunchRequest) -> Command {
        let mut cmd = Command::new(&self.executor.docker_bin);
        cmd.args(["run", "--rm", "-d"]);
        cmd.arg("--name")
            .arg(format!("{}-{}", self.config.suite_title, request.run_name));
        cmd.arg("-v").arg(format!(
            "{}/:{}/",
            self.host_run_dir(request).display(),
            CONTAINER_RUN_DIR
        ));
        for var in &self.config.passthrough_env {
            cmd.arg("-e").arg(var);
        }
        cmd.arg(&self.config.image);
        cmd.args(worker_args(CONTAINER_RUN_DIR, request, &self.executor));
        cmd
    }
}

impl RunLauncher for DockerLauncher {
    fn launch(&self, request: &LaunchRequest) -> Result<()> {
        let output = self
            .command(request)
            .stdin(Stdio::null())
            .output()
            .map_err(|e| OrchestrationError::Launch {
                run_name: request.run_name.clone(),
                message: e.to_string(),
            })?;
        if !output.status.success() {
            return Err(OrchestrationError::Launch {
                run_name: request.run_name.clone(),
                message: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            }
            .into());
        }
        let container_id = String::from_utf8_lossy(&output.stdout).trim().to_string();
        info!(run = %request.run_name, container_id = %container_id, "worker container started");
        Ok(())
    }
}

/// One detached local child process per run, re-invoking this binary.
pub struct ProcessLauncher {
    exe: PathBuf,
    executor: ExecutorConfig,
    children: Mutex<Vec<Child>>,
}

impl ProcessLauncher {
    pub fn new(exe: PathBuf, executor: ExecutorConfig) -> Self {
        Self {
            exe,
            executor,
            children: Mutex::new(Vec::new()),
        }
    }

    fn reap(&self) {
        if let Ok(mut children) = self.children.lock() {
            children.retain_mut(|c| matches!(c.try_wait(), Ok(None)));
        }
    }
}

impl RunLauncher for ProcessLauncher {
    fn launch(&self, request: &LaunchRequest) -> Result<()> {
        self.reap();
        let run_dir = request.run_dir.to_string_lossy().to_string();
        let child = Command::new(&self.exe)
            .args(worker_args(&run_dir, request, &self.executor))
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()
            .map_err(|e| OrchestrationError::Launch {
                run_name: request.run_name.clone(),
                message: e.to_string(),
            })?;
        debug!(run = %request.run_name, pid = child.id(), "worker process started");
        if let Ok(mut children) = self.children.lock() {
            children.push(child);
        }
        Ok(())
    }
}

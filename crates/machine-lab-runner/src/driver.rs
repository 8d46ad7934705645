//! Invocation of the external `docker-machine` / `docker` CLIs.

use std::fs::File;
use std::io::Read;
use std::process::{Command, Stdio};
use std::thread;
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

use crate::config::ExecutorConfig;
use crate::error::InvokeError;
use crate::plan::LifecycleCommand;
use crate::sampler::CreateArg;

const CHILD_POLL_INTERVAL: Duration = Duration::from_millis(100);

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct CommandOutput {
    pub code: i32,
    /// Captured stdout; empty unless capture was requested.
    pub output: String,
}

/// Environment that points a docker client at one machine.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Endpoint {
    pub env: Vec<(String, String)>,
}

impl Endpoint {
    pub fn docker_host(&self) -> Option<&str> {
        self.env
            .iter()
            .find(|(k, _)| k == "DOCKER_HOST")
            .map(|(_, v)| v.as_str())
    }
}

/// The operations a single run needs from the provisioning tooling.
pub trait MachineDriver {
    /// Printable command line, used in failure reports.
    fn describe(&self, command: LifecycleCommand, machine: &str) -> String;

    fn invoke(
        &self,
        command: LifecycleCommand,
        machine: &str,
        capture_output: bool,
        timeout: Duration,
    ) -> Result<CommandOutput, InvokeError>;

    fn resolve_endpoint(&self, machine: &str, timeout: Duration) -> Result<Endpoint, InvokeError>;

    fn run_probe(&self, endpoint: &Endpoint, timeout: Duration) -> Result<CommandOutput, InvokeError>;
}

pub struct DockerMachineCli {
    docker_machine_bin: String,
    docker_bin: String,
    driver: String,
    debug: bool,
    create_args: Vec<CreateArg>,
    log_sink: Option<File>,
}

impl DockerMachineCli {
    pub fn new(config: &ExecutorConfig, create_args: Vec<CreateArg>) -> Self {
        Self {
            docker_machine_bin: config.docker_machine_bin.clone(),
            docker_bin: config.docker_bin.clone(),
            driver: config.driver.clone(),
            debug: config.debug,
            create_args,
            log_sink: None,
        }
    }

    /// Child process output goes to this file instead of the inherited stdio.
    pub fn with_log_sink(mut self, sink: File) -> Self {
        self.log_sink = Some(sink);
        self
    }

    fn sink(&self) -> Stdio {
        self.log_sink
            .as_ref()
            .and_then(|f| f.try_clone().ok())
            .map(Stdio::from)
            .unwrap_or_else(Stdio::inherit)
    }

    fn machine_args(&self, command: LifecycleCommand, machine: &str, capture_output: bool) -> Vec<String> {
        let mut args = Vec::new();
        if self.debug && !capture_output {
            args.push("--debug".to_string());
        }
        let m = machine.to_string();
        match command {
            LifecycleCommand::Create => {
                args.extend(["create".to_string(), "-d".to_string(), self.driver.clone()]);
                for (flag, value) in &self.create_args {
                    args.push(flag.clone());
                    args.push(value.clone());
                }
                args.push(m);
            }
            LifecycleCommand::Restart => args.extend(["restart".to_string(), m]),
            LifecycleCommand::Stop => args.extend(["stop".to_string(), m]),
            LifecycleCommand::Start => args.extend(["start".to_string(), m]),
            LifecycleCommand::Kill => args.extend(["kill".to_string(), m]),
            LifecycleCommand::SshHostname => {
                args.extend(["ssh".to_string(), m, "hostname".to_string()])
            }
            LifecycleCommand::Remove => args.extend(["rm".to_string(), "-y".to_string(), m]),
            LifecycleCommand::ForceRemove => {
                args.extend(["rm".to_string(), "-f".to_string(), "-y".to_string(), m])
            }
            LifecycleCommand::HealthProbe => {
                args.extend(["env".to_string(), "--shell".to_string(), "bash".to_string(), m])
            }
        }
        args
    }
}

impl MachineDriver for DockerMachineCli {
    fn describe(&self, command: LifecycleCommand, machine: &str) -> String {
        match command {
            LifecycleCommand::HealthProbe => format!(
                "eval \"$({} env --shell bash {})\" && {} run --rm hello-world",
                self.docker_machine_bin, machine, self.docker_bin
            ),
            _ => {
                let mut parts = vec![self.docker_machine_bin.clone()];
                parts.extend(self.machine_args(command, machine, command == LifecycleCommand::SshHostname));
                parts.join(" ")
            }
        }
    }

    fn invoke(
        &self,
        command: LifecycleCommand,
        machine: &str,
        capture_output: bool,
        timeout: Duration,
    ) -> Result<CommandOutput, InvokeError> {
        let mut cmd = Command::new(&self.docker_machine_bin);
        cmd.args(self.machine_args(command, machine, capture_output));
        cmd.stdin(Stdio::null());
        if !capture_output {
            cmd.stdout(self.sink());
        }
        cmd.stderr(self.sink());
        info!(command = %command, machine, "running {}", self.describe(command, machine));
        run_with_timeout(cmd, timeout, capture_output)
    }

    fn resolve_endpoint(&self, machine: &str, timeout: Duration) -> Result<Endpoint, InvokeError> {
        let mut cmd = Command::new(&self.docker_machine_bin);
        cmd.args(["env", "--shell", "bash", machine]);
        cmd.stdin(Stdio::null());
        cmd.stderr(self.sink());
        let out = run_with_timeout(cmd, timeout, true)?;
        if out.code != 0 {
            return Err(InvokeError::Fault(format!(
                "{} env exited with {}",
                self.docker_machine_bin, out.code
            )));
        }
        let endpoint = Endpoint {
            env: parse_env_exports(&out.output),
        };
        if endpoint.docker_host().is_none() {
            return Err(InvokeError::Fault("machine env did not export DOCKER_HOST".into()));
        }
        debug!(machine, docker_host = endpoint.docker_host(), "resolved endpoint");
        Ok(endpoint)
    }

    fn run_probe(&self, endpoint: &Endpoint, timeout: Duration) -> Result<CommandOutput, InvokeError> {
        let mut cmd = Command::new(&self.docker_bin);
        cmd.args(["run", "--rm", "hello-world"]);
        cmd.envs(endpoint.env.iter().map(|(k, v)| (k.as_str(), v.as_str())));
        cmd.stdin(Stdio::null());
        cmd.stdout(self.sink());
        cmd.stderr(self.sink());
        run_with_timeout(cmd, timeout, false)
    }
}

/// Spawn `cmd` and wait for it, killing it once `timeout` has elapsed.
pub fn run_with_timeout(
    mut cmd: Command,
    timeout: Duration,
    capture_output: bool,
) -> Result<CommandOutput, InvokeError> {
    if capture_output {
        cmd.stdout(Stdio::piped());
    }
    let mut child = cmd
        .spawn()
        .map_err(|e| InvokeError::Fault(format!("failed to start command: {}", e)))?;
    // Drain on a thread so a chatty child cannot block on a full pipe.
    let reader = child.stdout.take().map(|mut stdout| {
        thread::spawn(move || {
            let mut buf = String::new();
            let _ = stdout.read_to_string(&mut buf);
            buf
        })
    });
    let deadline = Instant::now() + timeout;
    let status = loop {
        match child.try_wait() {
            Ok(Some(status)) => break status,
            Ok(None) if Instant::now() >= deadline => {
                warn!(pid = child.id(), timeout_secs = timeout.as_secs(), "command timed out, killing");
                let _ = child.kill();
                let _ = child.wait();
                return Err(InvokeError::Timeout(timeout));
            }
            Ok(None) => thread::sleep(CHILD_POLL_INTERVAL),
            Err(e) => {
                let _ = child.kill();
                return Err(InvokeError::Fault(format!("failed to wait for command: {}", e)));
            }
        }
    };
    let output = reader.and_then(|h| h.join().ok()).unwrap_or_default();
    Ok(CommandOutput {
        code: status.code().unwrap_or(-1),
        output,
    })
}

/// Parse the `export KEY="VALUE"` lines printed by `docker-machine env --shell bash`.
pub fn parse_env_exports(text: &str) -> Vec<(String, String)> {
    text.lines()
        .map(str::trim)
        .filter(|l| !l.is_empty() && !l.starts_with('#'))
        .filter_map(|l| l.strip_prefix("export "))
        .filter_map(|l| l.split_once('='))
        .map(|(k, v)| (k.trim().to_string(), v.trim().trim_matches('"').to_string()))
        .collect()
}

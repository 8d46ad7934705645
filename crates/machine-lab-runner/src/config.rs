use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::OrchestrationError;
use crate::plan::TimeoutClass;

/// Settings for one single-machine run; forwarded verbatim to each worker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutorConfig {
    pub create_timeout_secs: u64,
    pub power_timeout_secs: u64,
    pub default_timeout_secs: u64,
    pub probe_max_attempts: u32,
    pub retry_backoff_base_ms: u64,
    pub error_budget: usize,
    pub machine_prefix: String,
    pub driver: String,
    pub debug: bool,
    pub docker_machine_bin: String,
    pub docker_bin: String,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            create_timeout_secs: 1800,
            power_timeout_secs: 600,
            default_timeout_secs: 300,
            probe_max_attempts: 10,
            retry_backoff_base_ms: 5000,
            error_budget: 1,
            machine_prefix: "test-machine".to_string(),
            driver: "kamatera".to_string(),
            debug: false,
            docker_machine_bin: "docker-machine".to_string(),
            docker_bin: "docker".to_string(),
        }
    }
}

impl ExecutorConfig {
    pub fn timeout_for(&self, class: TimeoutClass) -> Duration {
        let secs = match class {
            TimeoutClass::Create => self.create_timeout_secs,
            TimeoutClass::Power => self.power_timeout_secs,
            TimeoutClass::Default => self.default_timeout_secs,
        };
        Duration::from_secs(secs)
    }

    pub fn backoff_base(&self) -> Duration {
        Duration::from_millis(self.retry_backoff_base_ms)
    }

    pub fn validate(&self) -> Result<()> {
        if self.probe_max_attempts == 0 {
            return Err(OrchestrationError::Config("probe_max_attempts must be >= 1".into()).into());
        }
        if self.error_budget == 0 {
            return Err(OrchestrationError::Config("error_budget must be >= 1".into()).into());
        }
        if self.machine_prefix.trim().is_empty() {
            return Err(OrchestrationError::Config("machine_prefix cannot be empty".into()).into());
        }
        Ok(())
    }

    /// Flags understood by `machine-lab single-run`.
    pub fn to_worker_args(&self) -> Vec<String> {
        let mut args = vec![
            "--create-timeout-secs".to_string(),
            self.create_timeout_secs.to_string(),
            "--power-timeout-secs".to_string(),
            self.power_timeout_secs.to_string(),
            "--default-timeout-secs".to_string(),
            self.default_timeout_secs.to_string(),
            "--probe-max-attempts".to_string(),
            self.probe_max_attempts.to_string(),
            "--retry-backoff-base-ms".to_string(),
            self.retry_backoff_base_ms.to_string(),
            "--error-budget".to_string(),
            self.error_budget.to_string(),
            "--machine-prefix".to_string(),
            self.machine_prefix.clone(),
            "--driver".to_string(),
            self.driver.clone(),
            "--docker-machine-bin".to_string(),
            self.docker_machine_bin.clone(),
            "--docker-bin".to_string(),
            self.docker_bin.clone(),
        ];
        if self.debug {
            args.push("--debug".to_string());
        }
        args
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LauncherKind {
    Docker,
    Process,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LauncherConfig {
    pub kind: LauncherKind,
    pub image: String,
    pub suite_title: String,
    /// Results directory as seen by the container runtime's host, when the
    /// suite itself runs inside a container.
    pub host_path: Option<PathBuf>,
    pub passthrough_env: Vec<String>,
}

impl Default for LauncherConfig {
    fn default() -> Self {
        Self {
            kind: LauncherKind::Docker,
            image: "machine-lab".to_string(),
            suite_title: "machine-lab".to_string(),
            host_path: None,
            passthrough_env: vec![
                "KAMATERA_API_CLIENT_ID".to_string(),
                "KAMATERA_API_SECRET".to_string(),
            ],
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SamplerConfig {
    pub catalog_path: PathBuf,
    pub catalog_url: Option<String>,
    pub client_id_env: String,
    pub secret_env: String,
    pub excluded_datacenters: Vec<String>,
    pub cpu_ceiling: u32,
    pub ram_ceiling_mb: u64,
    pub seed: Option<u64>,
}

impl Default for SamplerConfig {
    fn default() -> Self {
        Self {
            catalog_path: PathBuf::from("server_options.json"),
            catalog_url: Some("https://console.kamatera.com/service/server".to_string()),
            client_id_env: "KAMATERA_API_CLIENT_ID".to_string(),
            secret_env: "KAMATERA_API_SECRET".to_string(),
            excluded_datacenters: vec!["DEV".to_string()],
            cpu_ceiling: 12,
            ram_ceiling_mb: 8192,
            seed: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SuiteConfig {
    pub runs: usize,
    pub max_parallel: usize,
    pub global_timeout_secs: u64,
    pub poll_interval_ms: u64,
    pub existing_machines: Vec<String>,
    pub frequency_limited_account: bool,
    pub log_tail_lines: usize,
    pub results_dir: PathBuf,
    pub launcher: LauncherConfig,
    pub executor: ExecutorConfig,
    pub sampler: SamplerConfig,
}

impl Default for SuiteConfig {
    fn default() -> Self {
        Self {
            runs: 2,
            max_parallel: 5,
            global_timeout_secs: 7200,
            poll_interval_ms: 5000,
            existing_machines: Vec::new(),
            frequency_limited_account: false,
            log_tail_lines: 10,
            results_dir: PathBuf::from("test_results"),
            launcher: LauncherConfig::default(),
            executor: ExecutorConfig::default(),
            sampler: SamplerConfig::default(),
        }
    }
}

impl SuiteConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let raw = fs::read_to_string(path)?;
        let config: SuiteConfig = serde_yaml::from_str(&raw)?;
        Ok(config)
    }

    pub fn global_timeout(&self) -> Duration {
        Duration::from_secs(self.global_timeout_secs)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    /// Number of runs the final report must account for.
    pub fn requested_runs(&self) -> usize {
        if self.existing_machines.is_empty() {
            self.runs
        } else {
            self.existing_machines.len()
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.existing_machines.is_empty() && self.runs == 0 {
            return Err(OrchestrationError::Config("runs must be >= 1".into()).into());
        }
        if self.max_parallel == 0 {
            return Err(OrchestrationError::Config("max_parallel must be >= 1".into()).into());
        }
        if self.poll_interval_ms == 0 {
            return Err(OrchestrationError::Config("poll_interval_ms must be >= 1".into()).into());
        }
        let mut seen = std::collections::BTreeSet::new();
        for name in &self.existing_machines {
            if !seen.insert(name.as_str()) {
                return Err(OrchestrationError::Config(format!(
                    "existing machine listed twice: {}",
                    name
                ))
                .into());
            }
        }
        self.executor.validate()
    }
}

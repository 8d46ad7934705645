use anyhow::{anyhow, Result};
use clap::{Parser, Subcommand, ValueEnum};
use machine_lab_runner::config::{ExecutorConfig, LauncherKind, SuiteConfig};
use machine_lab_runner::launcher::LOG_FILE;
use machine_lab_runner::plan::LifecyclePlan;
use machine_lab_runner::report::{render_summary, SuiteReport};
use machine_lab_runner::{
    guard_worker, run_suite, run_worker, CreateArgSampler, CreateArgSource, DockerLauncher,
    DockerMachineCli, ProcessLauncher, RunIdentity, RunLauncher, RunStatus, StaticCreateArgs,
};
use serde_json::{json, Value};
use std::fs::{self, File, OpenOptions};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(
    name = "machine-lab",
    version = "0.3.0",
    about = "docker-machine lifecycle test orchestrator"
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum LauncherArg {
    #[value(name = "docker")]
    Docker,
    #[value(name = "process")]
    Process,
}

impl From<LauncherArg> for LauncherKind {
    fn from(value: LauncherArg) -> Self {
        match value {
            LauncherArg::Docker => LauncherKind::Docker,
            LauncherArg::Process => LauncherKind::Process,
        }
    }
}

#[derive(clap::Args, Debug, Clone)]
struct ExecutorArgs {
    #[arg(long)]
    create_timeout_secs: Option<u64>,
    #[arg(long)]
    power_timeout_secs: Option<u64>,
    #[arg(long)]
    default_timeout_secs: Option<u64>,
    #[arg(long)]
    probe_max_attempts: Option<u32>,
    #[arg(long)]
    retry_backoff_base_ms: Option<u64>,
    #[arg(long)]
    error_budget: Option<usize>,
    #[arg(long, env = "MACHINE_LAB_MACHINE_PREFIX")]
    machine_prefix: Option<String>,
    #[arg(long, env = "MACHINE_LAB_DRIVER")]
    driver: Option<String>,
    #[arg(long)]
    docker_machine_bin: Option<String>,
    #[arg(long)]
    docker_bin: Option<String>,
    #[arg(long)]
    debug: bool,
}

impl ExecutorArgs {
    fn apply(self, config: &mut ExecutorConfig) {
        if let Some(v) = self.create_timeout_secs {
            config.create_timeout_secs = v;
        }
        if let Some(v) = self.power_timeout_secs {
            config.power_timeout_secs = v;
        }
        if let Some(v) = self.default_timeout_secs {
            config.default_timeout_secs = v;
        }
        if let Some(v) = self.probe_max_attempts {
            config.probe_max_attempts = v;
        }
        if let Some(v) = self.retry_backoff_base_ms {
            config.retry_backoff_base_ms = v;
        }
        if let Some(v) = self.error_budget {
            config.error_budget = v;
        }
        if let Some(v) = self.machine_prefix {
            config.machine_prefix = v;
        }
        if let Some(v) = self.driver {
            config.driver = v;
        }
        if let Some(v) = self.docker_machine_bin {
            config.docker_machine_bin = v;
        }
        if let Some(v) = self.docker_bin {
            config.docker_bin = v;
        }
        if self.debug {
            config.debug = true;
        }
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Run the lifecycle plan against one machine (worker entrypoint).
    SingleRun {
        #[arg(long)]
        run_dir: PathBuf,
        #[arg(long)]
        machine_name: Option<String>,
        #[arg(long = "create-arg")]
        create_args: Vec<String>,
        #[command(flatten)]
        executor: ExecutorArgs,
    },
    /// Run the full suite of single-machine runs and report.
    Suite {
        #[arg(long)]
        config: Option<PathBuf>,
        #[arg(long, env = "NUM_SINGLE_MACHINE_TESTS_TO_RUN")]
        runs: Option<usize>,
        #[arg(long, env = "MAX_PARALLEL_SINGLE_MACHINE_TESTS")]
        max_parallel: Option<usize>,
        #[arg(long, env = "SUITE_GLOBAL_TIMEOUT_SECONDS")]
        global_timeout_secs: Option<u64>,
        #[arg(long)]
        poll_interval_ms: Option<u64>,
        #[arg(long, env = "ONLY_TEST_EXISTING_MACHINES", value_delimiter = ',')]
        existing_machines: Vec<String>,
        #[arg(long, env = "FREQUENCY_LIMITED_ACCOUNT")]
        frequency_limited_account: bool,
        #[arg(long, env = "SUITE_RUN_TITLE")]
        suite_title: Option<String>,
        #[arg(long, env = "MACHINE_LAB_HOST_PATH")]
        host_path: Option<PathBuf>,
        #[arg(long, env = "MACHINE_LAB_IMAGE")]
        image: Option<String>,
        #[arg(long, value_enum)]
        launcher: Option<LauncherArg>,
        #[arg(long)]
        results_dir: Option<PathBuf>,
        #[command(flatten)]
        executor: ExecutorArgs,
        #[arg(long)]
        json: bool,
    },
    /// Print create-argument sets drawn from the server options catalog.
    SampleArgs {
        count: usize,
        #[arg(long)]
        config: Option<PathBuf>,
        #[arg(long)]
        json: bool,
    },
    /// Print the standard lifecycle plan.
    Plan {
        #[arg(long)]
        json: bool,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let json_mode = command_json_mode(&cli.command);
    if !matches!(cli.command, Commands::SingleRun { .. }) {
        init_tracing(None);
    }
    let result = run_command(cli.command);
    match result {
        Ok(Some(payload)) => {
            emit_json(&payload);
            Ok(())
        }
        Ok(None) => Ok(()),
        Err(err) => {
            if json_mode {
                emit_json(&json_error(&err));
                std::process::exit(1);
            }
            Err(err)
        }
    }
}

fn init_tracing(log_file: Option<File>) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    match log_file {
        Some(file) => builder.with_ansi(false).with_writer(Mutex::new(file)).init(),
        None => builder.with_writer(std::io::stderr).init(),
    }
}

fn run_command(command: Commands) -> Result<Option<Value>> {
    match command {
        Commands::SingleRun {
            run_dir,
            machine_name,
            create_args,
            executor,
        } => {
            fs::create_dir_all(&run_dir)?;
            let status = guard_worker(&run_dir, || {
                let log = open_log(&run_dir)?;
                init_tracing(Some(log.try_clone()?));

                let mut config = ExecutorConfig::default();
                executor.apply(&mut config);
                config.validate()?;
                let create_args = parse_create_args(&create_args)?;

                let identity = match machine_name {
                    Some(name) => RunIdentity::existing(&name),
                    None => RunIdentity::synthesize(&config.machine_prefix, &mut fastrand::Rng::new()),
                };
                info!(
                    run_dir = %run_dir.display(),
                    machine = %identity.machine_name,
                    existing = identity.existing,
                    "single machine run starting"
                );
                let driver = DockerMachineCli::new(&config, create_args).with_log_sink(log);
                let outcome =
                    run_worker(&run_dir, &driver, &config, identity, &LifecyclePlan::standard())?;
                Ok(outcome.status)
            });
            if status != RunStatus::Ok {
                std::process::exit(1);
            }
        }
        Commands::Suite {
            config,
            runs,
            max_parallel,
            global_timeout_secs,
            poll_interval_ms,
            existing_machines,
            frequency_limited_account,
            suite_title,
            host_path,
            image,
            launcher,
            results_dir,
            executor,
            json,
        } => {
            let mut suite = load_suite_config(config.as_deref())?;
            if let Some(v) = runs {
                suite.runs = v;
            }
            if let Some(v) = max_parallel {
                suite.max_parallel = v;
            }
            if let Some(v) = global_timeout_secs {
                suite.global_timeout_secs = v;
            }
            if let Some(v) = poll_interval_ms {
                suite.poll_interval_ms = v;
            }
            let existing_machines: Vec<String> = existing_machines
                .into_iter()
                .map(|m| m.trim().to_string())
                .filter(|m| !m.is_empty())
                .collect();
            if !existing_machines.is_empty() {
                suite.existing_machines = existing_machines;
            }
            if frequency_limited_account {
                suite.frequency_limited_account = true;
            }
            if let Some(v) = suite_title {
                suite.launcher.suite_title = v;
            }
            if let Some(v) = host_path {
                suite.launcher.host_path = Some(v);
            }
            if let Some(v) = image {
                suite.launcher.image = v;
            }
            if let Some(v) = launcher {
                suite.launcher.kind = v.into();
            }
            if let Some(v) = results_dir {
                suite.results_dir = v;
            }
            executor.apply(&mut suite.executor);
            suite.validate()?;

            let launcher: Box<dyn RunLauncher> = match suite.launcher.kind {
                LauncherKind::Docker => Box::new(DockerLauncher::new(
                    suite.launcher.clone(),
                    suite.executor.clone(),
                )),
                LauncherKind::Process => Box::new(ProcessLauncher::new(
                    std::env::current_exe()?,
                    suite.executor.clone(),
                )),
            };
            let mut create_args: Box<dyn CreateArgSource> = if suite.existing_machines.is_empty() {
                Box::new(CreateArgSampler::load(&suite.sampler, &suite.executor.driver)?)
            } else {
                Box::new(StaticCreateArgs::default())
            };

            let report = run_suite(&suite, launcher.as_ref(), create_args.as_mut())?;
            if json {
                emit_json(&json!({
                    "ok": report.passed(),
                    "command": "suite",
                    "results_dir": suite.results_dir.display().to_string(),
                    "report": report_to_json(&report),
                }));
            } else {
                print!("{}", render_summary(&report));
            }
            std::process::exit(report.exit_code());
        }
        Commands::SampleArgs {
            count,
            config,
            json,
        } => {
            let suite = load_suite_config(config.as_deref())?;
            let mut sampler = CreateArgSampler::load(&suite.sampler, &suite.executor.driver)?;
            let mut draws = Vec::with_capacity(count);
            for _ in 0..count {
                draws.push(sampler.next_args()?);
            }
            if json {
                let draws: Vec<Value> = draws
                    .iter()
                    .map(|args| {
                        Value::Object(
                            args.iter()
                                .map(|(flag, value)| (flag.clone(), Value::String(value.clone())))
                                .collect(),
                        )
                    })
                    .collect();
                return Ok(Some(json!({
                    "ok": true,
                    "command": "sample-args",
                    "draws": draws
                })));
            }
            for args in &draws {
                let line: Vec<String> = args
                    .iter()
                    .map(|(flag, value)| format!("{} {}", flag, value))
                    .collect();
                println!("{}", line.join(" "));
            }
        }
        Commands::Plan { json } => {
            let plan = LifecyclePlan::standard();
            if json {
                return Ok(Some(json!({
                    "ok": true,
                    "command": "plan",
                    "steps": &plan.steps
                })));
            }
            for (index, step) in plan.steps.iter().enumerate() {
                let output = step
                    .expected_output("<machine>")
                    .map(|o| format!(" output={:?}", o))
                    .unwrap_or_default();
                println!(
                    "({}) {} exit_code={}{}",
                    index,
                    step.command,
                    step.exit_code.expected_label(),
                    output
                );
            }
        }
    }
    Ok(None)
}

fn load_suite_config(path: Option<&Path>) -> Result<SuiteConfig> {
    match path {
        Some(path) => SuiteConfig::load(path),
        None => Ok(SuiteConfig::default()),
    }
}

fn open_log(run_dir: &Path) -> Result<File> {
    Ok(OpenOptions::new()
        .create(true)
        .append(true)
        .open(run_dir.join(LOG_FILE))?)
}

fn parse_create_args(raw: &[String]) -> Result<Vec<(String, String)>> {
    raw.iter()
        .map(|item| {
            item.split_once('=')
                .map(|(flag, value)| (flag.trim().to_string(), value.trim().to_string()))
                .filter(|(flag, _)| !flag.is_empty())
                .ok_or_else(|| anyhow!("invalid --create-arg '{}', expected FLAG=VALUE", item))
        })
        .collect()
}

fn report_to_json(report: &SuiteReport) -> Value {
    json!({
        "requested": report.requested,
        "success_count": report.success_count,
        "error_count": report.error_count,
        "timeout_count": report.timeout_count,
        "rate_limited_count": report.rate_limited_count,
        "exit_code": report.exit_code(),
        "records": report.records.iter().map(|r| json!({
            "test_name": r.name,
            "machine_name": r.machine_name,
            "status": r.status.as_str(),
            "error": r.error_class.as_str(),
            "counted_as_success": r.counted_as_success,
            "log_error": r.log_error,
        })).collect::<Vec<_>>()
    })
}

fn emit_json(value: &Value) {
    match serde_json::to_string(value) {
        Ok(s) => println!("{}", s),
        Err(_) => println!(
            "{{\"ok\":false,\"error\":{{\"code\":\"serialization_error\",\"message\":\"failed to serialize JSON payload\",\"details\":{{}}}}}}"
        ),
    }
}

fn json_error(err: &anyhow::Error) -> Value {
    json!({
        "ok": false,
        "error": {
            "code": "command_failed",
            "message": format!("{:#}", err)
        }
    })
}

fn command_json_mode(command: &Commands) -> bool {
    match command {
        Commands::Suite { json, .. }
        | Commands::SampleArgs { json, .. }
        | Commands::Plan { json, .. } => *json,
        Commands::SingleRun { .. } => false,
    }
}

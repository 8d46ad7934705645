//! Executes the lifecycle plan against one machine.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::thread;
use std::time::Duration;
use tracing::{debug, error, info, warn};

use crate::config::ExecutorConfig;
use crate::driver::{CommandOutput, MachineDriver};
use crate::error::{FailureKind, InvokeError, StepFailure};
use crate::plan::{ExitCodeAssertion, LifecycleCommand, LifecyclePlan, LifecycleStep, RetryPolicy};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum RunStatus {
    Running,
    Ok,
    Error,
    Timeout,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Running => "RUNNING",
            RunStatus::Ok => "OK",
            RunStatus::Error => "ERROR",
            RunStatus::Timeout => "TIMEOUT",
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, RunStatus::Running)
    }
}

/// The machine a run operates on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunIdentity {
    pub machine_name: String,
    /// The machine already exists; the create step is skipped.
    pub existing: bool,
}

impl RunIdentity {
    pub fn existing(machine_name: &str) -> Self {
        Self {
            machine_name: machine_name.to_string(),
            existing: true,
        }
    }

    pub fn synthesize(prefix: &str, rng: &mut fastrand::Rng) -> Self {
        let suffix: Vec<u8> = (0..8).map(|_| rng.u8(..)).collect();
        Self {
            machine_name: format!(
                "{}-{}-{}",
                prefix,
                Utc::now().format("%Y%m%d"),
                hex::encode(suffix)
            ),
            existing: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StepReport {
    pub index: usize,
    pub command: LifecycleCommand,
    pub attempts: u32,
    pub skipped: bool,
    pub passed: bool,
}

#[derive(Debug, Clone)]
pub struct RunOutcome {
    pub machine_name: String,
    pub status: RunStatus,
    pub errors: Vec<StepFailure>,
    pub steps: Vec<StepReport>,
}

impl RunOutcome {
    pub fn retries_consumed(&self, index: usize) -> u32 {
        self.steps
            .iter()
            .find(|s| s.index == index)
            .map(|s| s.attempts.saturating_sub(1))
            .unwrap_or(0)
    }
}

pub struct Executor<'a, D: MachineDriver> {
    driver: &'a D,
    config: &'a ExecutorConfig,
    identity: RunIdentity,
}

impl<'a, D: MachineDriver> Executor<'a, D> {
    pub fn new(driver: &'a D, config: &'a ExecutorConfig, identity: RunIdentity) -> Self {
        Self {
            driver,
            config,
            identity,
        }
    }

    pub fn identity(&self) -> &RunIdentity {
        &self.identity
    }

    pub fn run(&self, plan: &LifecyclePlan) -> RunOutcome {
        let machine = self.identity.machine_name.as_str();
        info!(machine, steps = plan.steps.len(), existing = self.identity.existing, "starting lifecycle run");
        let mut errors: Vec<StepFailure> = Vec::new();
        let mut steps = Vec::with_capacity(plan.steps.len());
        let mut budget_exhausted = false;

        for (index, step) in plan.steps.iter().enumerate() {
            let skip = if step.command == LifecycleCommand::Create && self.identity.existing {
                info!(machine, step = index, "existing machine, skipping create");
                true
            } else if budget_exhausted && !step.cleanup {
                debug!(machine, step = index, command = %step.command, "error budget exhausted, skipping");
                true
            } else {
                false
            };
            if skip {
                steps.push(StepReport {
                    index,
                    command: step.command,
                    attempts: 0,
                    skipped: true,
                    passed: false,
                });
                continue;
            }

            let (attempts, failures) = self.run_step(index, step);
            for failure in &failures {
                error!(machine, step = index, command = %step.command, "{}", failure);
            }
            steps.push(StepReport {
                index,
                command: step.command,
                attempts,
                skipped: false,
                passed: failures.is_empty(),
            });
            errors.extend(failures);

            if errors.is_empty() {
                info!(machine, step = index, "no errors so far");
            } else {
                info!(machine, step = index, error_count = errors.len(), "encountered {} errors", errors.len());
            }
            if !budget_exhausted && errors.len() >= self.config.error_budget {
                budget_exhausted = true;
                warn!(
                    machine,
                    error_budget = self.config.error_budget,
                    "error budget reached, only cleanup steps will run"
                );
            }
        }

        let status = if errors.is_empty() {
            RunStatus::Ok
        } else {
            RunStatus::Error
        };
        info!(machine, status = status.as_str(), error_count = errors.len(), "lifecycle run finished");
        RunOutcome {
            machine_name: self.identity.machine_name.clone(),
            status,
            errors,
            steps,
        }
    }

    fn run_step(&self, index: usize, step: &LifecycleStep) -> (u32, Vec<StepFailure>) {
        let max_attempts = match step.retry {
            RetryPolicy::SingleAttempt => 1,
            RetryPolicy::AwaitsExternalState => self.config.probe_max_attempts.max(1),
        };
        let mut attempt = 1;
        loop {
            let failures = self.attempt_step(index, step);
            if failures.is_empty() || attempt >= max_attempts {
                return (attempt, failures);
            }
            let delay = backoff_delay(self.config.backoff_base(), attempt);
            info!(
                machine = %self.identity.machine_name,
                step = index,
                attempt,
                max_attempts,
                delay_ms = delay.as_millis() as u64,
                "step failed, retrying"
            );
            thread::sleep(delay);
            attempt += 1;
        }
    }

    fn attempt_step(&self, index: usize, step: &LifecycleStep) -> Vec<StepFailure> {
        let machine = self.identity.machine_name.as_str();
        let timeout = self.config.timeout_for(step.timeout_class);
        let command_line = self.driver.describe(step.command, machine);
        let fail = |kind: FailureKind| StepFailure {
            step_index: index,
            command: command_line.clone(),
            kind,
        };

        let result = if step.command == LifecycleCommand::HealthProbe {
            match self.driver.resolve_endpoint(machine, timeout) {
                Ok(endpoint) => self.driver.run_probe(&endpoint, timeout),
                Err(e) => {
                    return match step.exit_code {
                        ExitCodeAssertion::MustBeZero => {
                            vec![fail(FailureKind::EndpointUnresolved {
                                message: e.to_string(),
                            })]
                        }
                        _ => {
                            debug!(machine, step = index, reason = %e, "endpoint unresolved, as expected");
                            Vec::new()
                        }
                    };
                }
            }
        } else {
            self.driver
                .invoke(step.command, machine, step.output.is_some(), timeout)
        };

        evaluate_step(step, machine, result)
            .into_iter()
            .map(fail)
            .collect()
    }
}

/// Sleep before the attempt that follows failed attempt number `attempt`.
pub fn backoff_delay(base: Duration, attempt: u32) -> Duration {
    base * attempt
}

/// Check one attempt's result against the step's assertions.
pub fn evaluate_step(
    step: &LifecycleStep,
    machine: &str,
    result: Result<CommandOutput, InvokeError>,
) -> Vec<FailureKind> {
    let unchecked = step.exit_code == ExitCodeAssertion::Unchecked && step.output.is_none();
    let out = match result {
        Ok(out) => out,
        Err(_) if unchecked => return Vec::new(),
        Err(InvokeError::Timeout(after)) => return vec![FailureKind::Timeout { after }],
        Err(InvokeError::Fault(message)) => return vec![FailureKind::Fault { message }],
    };
    let mut failures = Vec::new();
    if !step.exit_code.holds(out.code) {
        failures.push(FailureKind::ExitCode {
            expected: step.exit_code.expected_label().to_string(),
            actual: out.code,
        });
    }
    if let Some(expected) = step.expected_output(machine) {
        let actual = out.output.trim();
        if actual != expected.trim() {
            failures.push(FailureKind::Output {
                expected,
                actual: actual.to_string(),
            });
        }
    }
    failures
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::Endpoint;
    use crate::plan::MACHINE_NAME_PLACEHOLDER;
    use std::cell::RefCell;
    use std::collections::{BTreeMap, VecDeque};
    use std::time::Instant;

    /// Scripted driver: per-command queues of results, default exit 0.
    #[derive(Default)]
    struct FakeDriver {
        scripted: RefCell<BTreeMap<&'static str, VecDeque<Result<CommandOutput, InvokeError>>>>,
        unresolvable: RefCell<VecDeque<bool>>,
        calls: RefCell<Vec<LifecycleCommand>>,
    }

    impl FakeDriver {
        fn script(&self, command: LifecycleCommand, results: Vec<Result<CommandOutput, InvokeError>>) {
            self.scripted
                .borrow_mut()
                .insert(command.as_str(), results.into_iter().collect());
        }

        fn next(&self, command: LifecycleCommand) -> Result<CommandOutput, InvokeError> {
            self.calls.borrow_mut().push(command);
            self.scripted
                .borrow_mut()
                .get_mut(command.as_str())
                .and_then(|q| q.pop_front())
                .unwrap_or_else(|| Ok(exit(0)))
        }

        fn count(&self, command: LifecycleCommand) -> usize {
            self.calls.borrow().iter().filter(|c| **c == command).count()
        }
    }

    impl MachineDriver for FakeDriver {
        fn describe(&self, command: LifecycleCommand, machine: &str) -> String {
            format!("fake {} {}", command, machine)
        }

        fn invoke(
            &self,
            command: LifecycleCommand,
            _machine: &str,
            _capture_output: bool,
            _timeout: Duration,
        ) -> Result<CommandOutput, InvokeError> {
            self.next(command)
        }

        fn resolve_endpoint(&self, _machine: &str, _timeout: Duration) -> Result<Endpoint, InvokeError> {
            if self.unresolvable.borrow_mut().pop_front().unwrap_or(false) {
                return Err(InvokeError::Fault("machine is not running".into()));
            }
            Ok(Endpoint {
                env: vec![("DOCKER_HOST".into(), "tcp://10.0.0.1:2376".into())],
            })
        }

        fn run_probe(&self, _endpoint: &Endpoint, _timeout: Duration) -> Result<CommandOutput, InvokeError> {
            self.next(LifecycleCommand::HealthProbe)
        }
    }

    fn exit(code: i32) -> CommandOutput {
        CommandOutput {
            code,
            output: String::new(),
        }
    }

    fn config() -> ExecutorConfig {
        ExecutorConfig {
            retry_backoff_base_ms: 0,
            probe_max_attempts: 4,
            ..ExecutorConfig::default()
        }
    }

    fn new_machine() -> RunIdentity {
        RunIdentity {
            machine_name: "test-machine-1".into(),
            existing: false,
        }
    }

    fn probe_plan() -> LifecyclePlan {
        LifecyclePlan::new(vec![LifecycleStep::new(
            LifecycleCommand::HealthProbe,
            ExitCodeAssertion::MustBeZero,
        )])
    }

    #[test]
    fn probe_passing_on_last_allowed_attempt_records_no_error() {
        let driver = FakeDriver::default();
        driver.script(
            LifecycleCommand::HealthProbe,
            vec![Ok(exit(1)), Ok(exit(1)), Ok(exit(1)), Ok(exit(0))],
        );
        let config = config();
        let outcome = Executor::new(&driver, &config, new_machine()).run(&probe_plan());
        assert_eq!(outcome.status, RunStatus::Ok);
        assert!(outcome.errors.is_empty());
        assert_eq!(outcome.steps[0].attempts, 4);
        assert_eq!(outcome.retries_consumed(0), 3);
    }

    #[test]
    fn backoff_grows_linearly_with_attempts() {
        let base = Duration::from_millis(5000);
        let delays: Vec<Duration> = (1..=4).map(|n| backoff_delay(base, n)).collect();
        assert_eq!(
            delays,
            vec![
                Duration::from_secs(5),
                Duration::from_secs(10),
                Duration::from_secs(15),
                Duration::from_secs(20)
            ]
        );
    }

    #[test]
    fn retries_sleep_the_summed_backoff() {
        let driver = FakeDriver::default();
        driver.script(
            LifecycleCommand::HealthProbe,
            vec![Ok(exit(1)), Ok(exit(1)), Ok(exit(1)), Ok(exit(0))],
        );
        let config = ExecutorConfig {
            retry_backoff_base_ms: 20,
            ..config()
        };
        let started = Instant::now();
        let outcome = Executor::new(&driver, &config, new_machine()).run(&probe_plan());
        assert!(outcome.errors.is_empty());
        // 20 + 40 + 60 ms
        assert!(started.elapsed() >= Duration::from_millis(120), "{:?}", started.elapsed());
    }

    #[test]
    fn probe_exhausting_retries_surfaces_exactly_one_failure() {
        let driver = FakeDriver::default();
        driver.script(
            LifecycleCommand::HealthProbe,
            vec![
                Ok(exit(1)),
                Err(InvokeError::Timeout(Duration::from_secs(1))),
                Ok(exit(1)),
                Err(InvokeError::Timeout(Duration::from_secs(1))),
                Ok(exit(0)),
            ],
        );
        let config = config();
        let outcome = Executor::new(&driver, &config, new_machine()).run(&probe_plan());
        assert_eq!(outcome.status, RunStatus::Error);
        assert_eq!(outcome.errors.len(), 1);
        assert!(outcome.errors[0].is_timeout());
        assert_eq!(driver.count(LifecycleCommand::HealthProbe), 4);
    }

    #[test]
    fn steps_without_retry_get_one_attempt() {
        let driver = FakeDriver::default();
        driver.script(LifecycleCommand::Stop, vec![Ok(exit(1)), Ok(exit(0))]);
        let config = config();
        let plan = LifecyclePlan::new(vec![LifecycleStep::new(
            LifecycleCommand::Stop,
            ExitCodeAssertion::MustBeZero,
        )]);
        let outcome = Executor::new(&driver, &config, new_machine()).run(&plan);
        assert_eq!(outcome.errors.len(), 1);
        assert_eq!(driver.count(LifecycleCommand::Stop), 1);
    }

    #[test]
    fn unresolvable_endpoint_satisfies_nonzero_probe() {
        let driver = FakeDriver::default();
        driver.unresolvable.borrow_mut().push_back(true);
        let config = config();
        let plan = LifecyclePlan::new(vec![LifecycleStep::new(
            LifecycleCommand::HealthProbe,
            ExitCodeAssertion::MustBeNonzero,
        )]);
        let outcome = Executor::new(&driver, &config, new_machine()).run(&plan);
        assert_eq!(outcome.status, RunStatus::Ok);
        assert_eq!(driver.count(LifecycleCommand::HealthProbe), 0);
    }

    #[test]
    fn nonzero_probe_code_satisfies_nonzero_probe() {
        let driver = FakeDriver::default();
        driver.script(LifecycleCommand::HealthProbe, vec![Ok(exit(125))]);
        let config = config();
        let plan = LifecyclePlan::new(vec![LifecycleStep::new(
            LifecycleCommand::HealthProbe,
            ExitCodeAssertion::MustBeNonzero,
        )]);
        let outcome = Executor::new(&driver, &config, new_machine()).run(&plan);
        assert!(outcome.errors.is_empty());
    }

    #[test]
    fn unresolvable_endpoint_fails_zero_probe_until_retries_run_out() {
        let driver = FakeDriver::default();
        driver
            .unresolvable
            .borrow_mut()
            .extend([true, true, true, true]);
        let config = config();
        let outcome = Executor::new(&driver, &config, new_machine()).run(&probe_plan());
        assert_eq!(outcome.errors.len(), 1);
        assert!(matches!(
            outcome.errors[0].kind,
            FailureKind::EndpointUnresolved { .. }
        ));
    }

    #[test]
    fn hostname_mismatch_is_one_failure() {
        let driver = FakeDriver::default();
        driver.script(
            LifecycleCommand::SshHostname,
            vec![Ok(CommandOutput {
                code: 0,
                output: "some-other-host\n".into(),
            })],
        );
        let config = config();
        let plan = LifecyclePlan::new(vec![LifecycleStep::new(
            LifecycleCommand::SshHostname,
            ExitCodeAssertion::MustBeZero,
        )
        .with_output(MACHINE_NAME_PLACEHOLDER)]);
        let outcome = Executor::new(&driver, &config, new_machine()).run(&plan);
        assert_eq!(outcome.errors.len(), 1);
        assert_eq!(
            outcome.errors[0].kind,
            FailureKind::Output {
                expected: "test-machine-1".into(),
                actual: "some-other-host".into()
            }
        );
    }

    #[test]
    fn hostname_match_ignores_surrounding_whitespace() {
        let driver = FakeDriver::default();
        driver.script(
            LifecycleCommand::SshHostname,
            vec![Ok(CommandOutput {
                code: 0,
                output: "  test-machine-1\n".into(),
            })],
        );
        let config = config();
        let plan = LifecyclePlan::new(vec![LifecycleStep::new(
            LifecycleCommand::SshHostname,
            ExitCodeAssertion::MustBeZero,
        )
        .with_output(MACHINE_NAME_PLACEHOLDER)]);
        let outcome = Executor::new(&driver, &config, new_machine()).run(&plan);
        assert!(outcome.errors.is_empty());
    }

    #[test]
    fn existing_machine_never_issues_create() {
        let driver = FakeDriver::default();
        driver.script(LifecycleCommand::Create, vec![Ok(exit(1))]);
        let config = config();
        let outcome = Executor::new(&driver, &config, RunIdentity::existing("reused-1"))
            .run(&LifecyclePlan::standard());
        assert_eq!(driver.count(LifecycleCommand::Create), 0);
        assert!(outcome.steps[0].skipped);
        assert!(outcome
            .errors
            .iter()
            .all(|e| e.step_index != 0));
    }

    #[test]
    fn budget_exhaustion_skips_to_cleanup() {
        let driver = FakeDriver::default();
        driver.script(LifecycleCommand::Create, vec![Ok(exit(1))]);
        let config = config();
        let outcome =
            Executor::new(&driver, &config, new_machine()).run(&LifecyclePlan::standard());
        assert_eq!(outcome.status, RunStatus::Error);
        assert_eq!(outcome.errors.len(), 1);
        assert_eq!(driver.count(LifecycleCommand::Restart), 0);
        assert_eq!(driver.count(LifecycleCommand::Remove), 1);
        assert_eq!(driver.count(LifecycleCommand::ForceRemove), 1);
    }

    #[test]
    fn larger_budget_keeps_running_every_step() {
        let driver = FakeDriver::default();
        driver.script(LifecycleCommand::Restart, vec![Ok(exit(1)), Ok(exit(1))]);
        // Powered-off probes (after stop, kill and remove) find no endpoint.
        driver
            .unresolvable
            .borrow_mut()
            .extend([false, false, true, false, true, false, true]);
        let config = ExecutorConfig {
            error_budget: 5,
            ..config()
        };
        let outcome =
            Executor::new(&driver, &config, new_machine()).run(&LifecyclePlan::standard());
        assert_eq!(outcome.errors.len(), 2);
        assert!(outcome.steps.iter().all(|s| !s.skipped));
        assert_eq!(driver.count(LifecycleCommand::SshHostname), 1);
    }

    #[test]
    fn unchecked_step_ignores_timeouts_and_codes() {
        let step = LifecycleStep::new(LifecycleCommand::ForceRemove, ExitCodeAssertion::Unchecked);
        assert!(evaluate_step(&step, "m", Ok(exit(1))).is_empty());
        assert!(evaluate_step(&step, "m", Err(InvokeError::Timeout(Duration::from_secs(1)))).is_empty());
    }

    #[test]
    fn fault_fails_even_nonzero_rule() {
        let step = LifecycleStep::new(LifecycleCommand::Stop, ExitCodeAssertion::MustBeNonzero);
        let failures = evaluate_step(&step, "m", Err(InvokeError::Fault("spawn failed".into())));
        assert_eq!(
            failures,
            vec![FailureKind::Fault {
                message: "spawn failed".into()
            }]
        );
    }

    #[test]
    fn synthesized_names_are_prefixed_and_unique() {
        let mut rng = fastrand::Rng::with_seed(9);
        let a = RunIdentity::synthesize("test-machine", &mut rng);
        let b = RunIdentity::synthesize("test-machine", &mut rng);
        assert!(a.machine_name.starts_with("test-machine-"));
        assert_eq!(a.machine_name.rsplit('-').next().unwrap().len(), 16);
        assert_ne!(a.machine_name, b.machine_name);
        assert!(!a.existing);
    }
}

//! The lifecycle plan exercised against every provisioned machine.

use serde::Serialize;
use std::fmt;

pub const MACHINE_NAME_PLACEHOLDER: &str = "{machine_name}";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LifecycleCommand {
    Create,
    Restart,
    Stop,
    Start,
    Kill,
    SshHostname,
    Remove,
    ForceRemove,
    /// Run a minimal container workload against the machine.
    HealthProbe,
}

impl LifecycleCommand {
    pub fn as_str(&self) -> &'static str {
        match self {
            LifecycleCommand::Create => "create",
            LifecycleCommand::Restart => "restart",
            LifecycleCommand::Stop => "stop",
            LifecycleCommand::Start => "start",
            LifecycleCommand::Kill => "kill",
            LifecycleCommand::SshHostname => "ssh-hostname",
            LifecycleCommand::Remove => "remove",
            LifecycleCommand::ForceRemove => "force-remove",
            LifecycleCommand::HealthProbe => "health-probe",
        }
    }
}

impl fmt::Display for LifecycleCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ExitCodeAssertion {
    MustBeZero,
    MustBeNonzero,
    Unchecked,
}

impl ExitCodeAssertion {
    pub fn holds(&self, code: i32) -> bool {
        match self {
            ExitCodeAssertion::MustBeZero => code == 0,
            ExitCodeAssertion::MustBeNonzero => code != 0,
            ExitCodeAssertion::Unchecked => true,
        }
    }

    pub fn expected_label(&self) -> &'static str {
        match self {
            ExitCodeAssertion::MustBeZero => "0",
            ExitCodeAssertion::MustBeNonzero => "nonzero",
            ExitCodeAssertion::Unchecked => "any",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TimeoutClass {
    Create,
    Power,
    Default,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RetryPolicy {
    SingleAttempt,
    /// The step depends on remote state settling; use the configured probe budget.
    AwaitsExternalState,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LifecycleStep {
    pub command: LifecycleCommand,
    pub exit_code: ExitCodeAssertion,
    pub output: Option<String>,
    pub timeout_class: TimeoutClass,
    pub retry: RetryPolicy,
    /// Still attempted after the run has exhausted its error budget.
    pub cleanup: bool,
}

impl LifecycleStep {
    pub fn new(command: LifecycleCommand, exit_code: ExitCodeAssertion) -> Self {
        let timeout_class = match command {
            LifecycleCommand::Create => TimeoutClass::Create,
            LifecycleCommand::Restart
            | LifecycleCommand::Stop
            | LifecycleCommand::Start
            | LifecycleCommand::Kill => TimeoutClass::Power,
            _ => TimeoutClass::Default,
        };
        let retry = match command {
            LifecycleCommand::HealthProbe => RetryPolicy::AwaitsExternalState,
            _ => RetryPolicy::SingleAttempt,
        };
        let cleanup = matches!(
            command,
            LifecycleCommand::Remove | LifecycleCommand::ForceRemove
        );
        Self {
            command,
            exit_code,
            output: None,
            timeout_class,
            retry,
            cleanup,
        }
    }

    pub fn with_output(mut self, template: &str) -> Self {
        self.output = Some(template.to_string());
        self
    }

    pub fn expected_output(&self, machine_name: &str) -> Option<String> {
        self.output
            .as_ref()
            .map(|t| t.replace(MACHINE_NAME_PLACEHOLDER, machine_name))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LifecyclePlan {
    pub steps: Vec<LifecycleStep>,
}

impl LifecyclePlan {
    pub fn new(steps: Vec<LifecycleStep>) -> Self {
        Self { steps }
    }

    /// create, restart, stop, start, kill, restart-after-kill, ssh and remove,
    /// each power transition followed by a probe of the expected reachability.
    pub fn standard() -> Self {
        use ExitCodeAssertion::{MustBeNonzero, MustBeZero, Unchecked};
        use LifecycleCommand::*;
        let step = LifecycleStep::new;
        Self::new(vec![
            step(Create, MustBeZero),
            step(HealthProbe, MustBeZero),
            step(Restart, MustBeZero),
            step(HealthProbe, MustBeZero),
            step(Stop, MustBeZero),
            step(HealthProbe, MustBeNonzero),
            step(Start, MustBeZero),
            step(HealthProbe, MustBeZero),
            step(Kill, MustBeZero),
            step(HealthProbe, MustBeNonzero),
            step(Restart, MustBeZero),
            step(HealthProbe, MustBeZero),
            step(SshHostname, MustBeZero).with_output(MACHINE_NAME_PLACEHOLDER),
            step(Remove, MustBeZero),
            step(HealthProbe, MustBeNonzero),
            step(ForceRemove, Unchecked),
        ])
    }
}

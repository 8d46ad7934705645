use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

/// Synthetic exit code recorded when a step outlives its timeout.
pub const TIMEOUT_EXIT_CODE: i32 = 255;
/// Synthetic exit code recorded when the command could not be invoked at all.
pub const FAULT_EXIT_CODE: i32 = 244;

/// Why a single driver invocation did not produce an exit code.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum InvokeError {
    #[error("timed out after {}s", .0.as_secs())]
    Timeout(Duration),
    #[error("{0}")]
    Fault(String),
}

impl InvokeError {
    pub fn synthetic_code(&self) -> i32 {
        match self {
            InvokeError::Timeout(_) => TIMEOUT_EXIT_CODE,
            InvokeError::Fault(_) => FAULT_EXIT_CODE,
        }
    }
}

/// What went wrong in one lifecycle step.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FailureKind {
    #[error("assertion = \"returncode\", expected = \"{expected}\", actual = \"{actual}\"")]
    ExitCode { expected: String, actual: i32 },
    #[error("assertion = \"output\", expected = \"{expected}\", actual = \"{actual}\"")]
    Output { expected: String, actual: String },
    #[error("timeout after {}s (returncode {})", .after.as_secs(), TIMEOUT_EXIT_CODE)]
    Timeout { after: Duration },
    #[error("unexpected fault (returncode {}): {message}", FAULT_EXIT_CODE)]
    Fault { message: String },
    #[error("could not resolve machine endpoint: {message}")]
    EndpointUnresolved { message: String },
}

/// A surfaced step failure, recorded against the run.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("({step_index}) failed: cmd = \"{command}\", {kind}")]
pub struct StepFailure {
    pub step_index: usize,
    pub command: String,
    pub kind: FailureKind,
}

impl StepFailure {
    pub fn is_timeout(&self) -> bool {
        matches!(self.kind, FailureKind::Timeout { .. })
    }
}

/// Failures that stop the whole orchestration.
#[derive(Debug, Error)]
pub enum OrchestrationError {
    #[error("invalid status marker for {run_name} at {}: {value:?}", .path.display())]
    ProtocolViolation {
        run_name: String,
        path: PathBuf,
        value: String,
    },
    #[error("failed to launch {run_name}: {message}")]
    Launch { run_name: String, message: String },
    #[error("invalid configuration: {0}")]
    Config(String),
}

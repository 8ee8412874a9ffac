//! Outcome classification
//!
//! [`classify`] is a pure function of the runner's observed terminal state:
//! how it ended, whether the deadline fired, and the report it left behind.
//! It never inspects the process table and never guesses.

use nix::sys::signal::Signal;
use serde::Serialize;
use thiserror::Error;

use crate::codec::Value;
use crate::config::ResourceLimits;
use crate::errors::SandboxError;
use crate::execution::process::{ProcessResult, Termination};
use crate::runner::exit;

/// Every way an execution can fail
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Encoding,
    Definition,
    UserCodeFault,
    TimeoutExceeded,
    ResourceLimitExceeded,
    ProcessFault,
    Configuration,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::Encoding => "encoding",
            ErrorKind::Definition => "definition",
            ErrorKind::UserCodeFault => "user_code_fault",
            ErrorKind::TimeoutExceeded => "timeout_exceeded",
            ErrorKind::ResourceLimitExceeded => "resource_limit_exceeded",
            ErrorKind::ProcessFault => "process_fault",
            ErrorKind::Configuration => "configuration",
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What the runner left behind
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ExecutionOutput {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i32,
    /// Structured return value, when it was encodable and within the cap
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    /// A stream or the structured result exceeded the output cap
    pub truncated: bool,
    pub wall_time_ms: u64,
}

/// A failed execution: kind, a one-line message, and whatever output was captured
#[derive(Debug, Clone, PartialEq, Error)]
#[error("{kind}: {message}")]
pub struct ExecutionError {
    pub kind: ErrorKind,
    pub message: String,
    pub output: Option<ExecutionOutput>,
}

impl ExecutionError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            output: None,
        }
    }

    fn with_output(mut self, output: ExecutionOutput) -> Self {
        self.output = Some(output);
        self
    }
}

impl From<SandboxError> for ExecutionError {
    fn from(err: SandboxError) -> Self {
        let kind = match &err {
            SandboxError::Encoding(_) => ErrorKind::Encoding,
            SandboxError::InvalidConfig(_) => ErrorKind::Configuration,
            _ => ErrorKind::ProcessFault,
        };
        ExecutionError::new(kind, err.to_string())
    }
}

/// Exactly one of success or a classified failure
pub type ExecutionOutcome = std::result::Result<ExecutionOutput, ExecutionError>;

/// Classify the terminal state of one runner process
pub fn classify(result: ProcessResult, limits: &ResourceLimits) -> ExecutionOutcome {
    let failure_summary = result
        .report
        .as_ref()
        .and_then(|report| report.failure.as_ref())
        .map(|failure| failure.summary());
    let failure_message = result
        .report
        .as_ref()
        .and_then(|report| report.failure.as_ref())
        .map(|failure| failure.message.clone());
    let result_omitted = result
        .report
        .as_ref()
        .map(|report| report.result_omitted)
        .unwrap_or(false);

    let exit_code = match result.termination {
        Termination::Exited(code) => code,
        Termination::Signaled(signal) => 128 + signal,
    };

    let output = ExecutionOutput {
        stdout: result.stdout.text(),
        stderr: result.stderr.text(),
        exit_code,
        result: None,
        truncated: result.stdout.truncated || result.stderr.truncated || result_omitted,
        wall_time_ms: result.wall_time.as_millis() as u64,
    };

    let error = match result.termination {
        Termination::Exited(exit::OK) => match result.report {
            Some(report) => {
                return Ok(ExecutionOutput {
                    result: report.result,
                    ..output
                });
            }
            None => ExecutionError::new(
                ErrorKind::ProcessFault,
                "runner exited without reporting a result",
            ),
        },
        Termination::Exited(exit::DEFINITION) => ExecutionError::new(
            ErrorKind::Definition,
            failure_message.unwrap_or_else(|| "entry point is missing or ambiguous".to_string()),
        ),
        Termination::Exited(exit::ENCODING) => ExecutionError::new(
            ErrorKind::Encoding,
            failure_message.unwrap_or_else(|| "request could not be decoded".to_string()),
        ),
        Termination::Exited(exit::MEMORY_EXHAUSTED) => memory_exceeded(limits),
        Termination::Exited(exit::SETUP) => ExecutionError::new(
            ErrorKind::ProcessFault,
            format!(
                "runner setup failed: {}",
                failure_message.unwrap_or_else(|| "no detail".to_string())
            ),
        ),
        Termination::Exited(code) => ExecutionError::new(
            ErrorKind::UserCodeFault,
            failure_summary
                .or_else(|| last_line(&output.stderr))
                .unwrap_or_else(|| format!("code exited with status {}", code)),
        ),
        Termination::Signaled(signal) => classify_signal(signal, result.timed_out, limits),
    };

    Err(error.with_output(output))
}

fn classify_signal(signal: i32, timed_out: bool, limits: &ResourceLimits) -> ExecutionError {
    match Signal::try_from(signal) {
        Ok(Signal::SIGKILL) if timed_out => ExecutionError::new(
            ErrorKind::TimeoutExceeded,
            format!(
                "execution exceeded the {} second wall-clock limit",
                limits.wall_clock_seconds
            ),
        ),
        Ok(Signal::SIGXCPU) => cpu_exceeded(limits),
        Ok(Signal::SIGXFSZ) => ExecutionError::new(
            ErrorKind::ResourceLimitExceeded,
            "file size limit exceeded",
        ),
        // RLIMIT_CPU hard ceiling or the kernel OOM killer
        Ok(Signal::SIGKILL) => ExecutionError::new(
            ErrorKind::ResourceLimitExceeded,
            format!(
                "killed by the operating system (limits: {} s CPU, {} MB memory)",
                limits.cpu_seconds, limits.memory_megabytes
            ),
        ),
        Ok(other) => ExecutionError::new(
            ErrorKind::ProcessFault,
            format!("runner terminated by {}", other.as_str()),
        ),
        Err(_) => ExecutionError::new(
            ErrorKind::ProcessFault,
            format!("runner terminated by signal {}", signal),
        ),
    }
}

fn cpu_exceeded(limits: &ResourceLimits) -> ExecutionError {
    ExecutionError::new(
        ErrorKind::ResourceLimitExceeded,
        format!("CPU time limit of {} s exceeded", limits.cpu_seconds),
    )
}

fn memory_exceeded(limits: &ResourceLimits) -> ExecutionError {
    ExecutionError::new(
        ErrorKind::ResourceLimitExceeded,
        format!("memory limit of {} MB exceeded", limits.memory_megabytes),
    )
}

fn last_line(text: &str) -> Option<String> {
    text.lines()
        .rev()
        .map(str::trim)
        .find(|line| !line.is_empty())
        .map(str::to_string)
}

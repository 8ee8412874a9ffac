//! Isolated runner: the child-process side of one execution
//!
//! One runner process serves exactly one request and then exits:
//!
//! 1. apply the resource ceilings passed through the environment
//! 2. decode `{code, arguments}` from stdin
//! 3. load the code in a fresh namespace and locate `run`
//! 4. call `run(*arguments)` and print what it returns
//! 5. write a [`RunnerReport`] on the result descriptor and exit with a
//!    status from [`exit`]
//!
//! Nothing here logs: stderr belongs to the submitted code, plus at most one
//! `ExceptionClass: message` line on failure.

pub mod convert;
pub mod exhaustion;
pub mod loader;

use std::fs::File;
use std::io::{Read, Write};
use std::os::unix::io::{FromRawFd, RawFd};

use nix::fcntl::{fcntl, FcntlArg};
use pyo3::Python;

use crate::codec::{self, RunnerFailure, RunnerReport, RunnerRequest};
use crate::errors::{Result, SandboxError};
use crate::resources::ResourceLimiter;
use loader::Failure;

/// Name of the callable the submitted code must define
pub const ENTRYPOINT: &str = "run";

/// Descriptor the runner writes its report on
pub const RESULT_FD: RawFd = 3;
pub const RESULT_FD_ENV: &str = "SANDBOX_RESULT_FD";
/// Largest encoded return value carried in the report
pub const RESULT_LIMIT_ENV: &str = "SANDBOX_RESULT_LIMIT";

/// Runner exit statuses
pub mod exit {
    pub const OK: i32 = 0;
    /// Exception while loading or calling the code
    pub const USER_FAULT: i32 = 1;
    /// `run` missing or ambiguous
    pub const DEFINITION: i32 = 2;
    /// Request could not be decoded
    pub const ENCODING: i32 = 3;
    /// `MemoryError` under the address-space ceiling
    pub const MEMORY_EXHAUSTED: i32 = 4;
    /// Limits could not be applied or the runner was misconfigured
    pub const SETUP: i32 = 5;
}

/// Runner entry point; returns the process exit status
pub fn run_from_env() -> i32 {
    let mut sink = ReportSink::from_env();
    let mut report = RunnerReport::default();

    let status = serve(&mut report);

    sink.write(&report);
    status
}

fn serve(report: &mut RunnerReport) -> i32 {
    let limiter = match ResourceLimiter::from_env() {
        Ok(limiter) => limiter,
        Err(e) => return setup_failure(report, e),
    };

    report.limits = match limiter.apply() {
        Ok(limits) => limits,
        Err(e) => return setup_failure(report, e),
    };

    let request = match read_request() {
        Ok(request) => request,
        Err(SandboxError::Encoding(message)) => {
            return fail(report, exit::ENCODING, "EncodingError", message);
        }
        Err(e) => return setup_failure(report, e),
    };

    let result_limit = std::env::var(RESULT_LIMIT_ENV)
        .ok()
        .and_then(|raw| raw.parse::<usize>().ok())
        .unwrap_or(usize::MAX);

    let outcome = Python::with_gil(|py| {
        loader::invoke(py, &request.code, &request.arguments, result_limit)
    });

    match outcome {
        Ok(completed) => {
            report.result = completed.result;
            report.result_omitted = completed.result_omitted;
            exit::OK
        }
        Err(Failure::Definition(message)) => {
            fail(report, exit::DEFINITION, "DefinitionError", message)
        }
        Err(Failure::Raised {
            failure,
            memory_exhausted,
        }) => {
            eprintln!("{}", failure.summary());
            report.failure = Some(failure);
            if memory_exhausted {
                exit::MEMORY_EXHAUSTED
            } else {
                exit::USER_FAULT
            }
        }
    }
}

fn read_request() -> Result<RunnerRequest> {
    let mut payload = Vec::new();
    std::io::stdin().read_to_end(&mut payload)?;
    codec::decode_message(&payload)
}

fn fail(report: &mut RunnerReport, status: i32, exception: &str, message: String) -> i32 {
    let failure = RunnerFailure {
        exception: exception.to_string(),
        message,
    };
    eprintln!("{}", failure.summary());
    report.failure = Some(failure);
    status
}

fn setup_failure(report: &mut RunnerReport, err: SandboxError) -> i32 {
    fail(report, exit::SETUP, "SandboxSetupError", err.to_string())
}

/// Write side of the result descriptor, if the supervisor provided one
struct ReportSink(Option<File>);

impl ReportSink {
    fn from_env() -> Self {
        let file = std::env::var(RESULT_FD_ENV)
            .ok()
            .and_then(|raw| raw.parse::<RawFd>().ok())
            .filter(|fd| *fd > 2 && fcntl(*fd, FcntlArg::F_GETFD).is_ok())
            // SAFETY: the descriptor is open and was handed to this process
            // for its exclusive use by the supervisor.
            .map(|fd| unsafe { File::from_raw_fd(fd) });

        Self(file)
    }

    fn write(&mut self, report: &RunnerReport) {
        let Some(file) = self.0.as_mut() else {
            return;
        };

        if let Ok(bytes) = codec::encode_message(report) {
            let _ = file.write_all(&bytes);
            let _ = file.flush();
        }
    }
}

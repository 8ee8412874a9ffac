//! Main sandbox controller

use std::path::{Path, PathBuf};

use log::{debug, info, warn};

use crate::codec::{RunnerRequest, Value};
use crate::config::{ResourceLimits, ServiceConfig, DEFAULT_MAX_OUTPUT_BYTES};
use crate::dependencies;
use crate::errors::{Result, SandboxError};
use crate::execution::{
    classify, ErrorKind, ExecutionError, ExecutionOutcome, ProcessConfig, ProcessExecutor,
};

/// File name of the runner binary
pub const RUNNER_BINARY: &str = "sandbox-runner";

/// Sandbox configuration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SandboxConfig {
    pub limits: ResourceLimits,
    /// Cap applied separately to stdout, stderr and the structured result
    pub max_output_bytes: usize,
    /// Runner binary; resolved next to the current executable when unset
    pub runner_path: Option<PathBuf>,
    /// Install missing imported modules before each execution
    pub auto_install_modules: bool,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            limits: ResourceLimits::default(),
            max_output_bytes: DEFAULT_MAX_OUTPUT_BYTES,
            runner_path: None,
            auto_install_modules: false,
        }
    }
}

impl SandboxConfig {
    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        self.limits.validate()?;

        if self.max_output_bytes == 0 {
            return Err(SandboxError::InvalidConfig(
                "max_output_bytes must be a positive integer".to_string(),
            ));
        }

        Ok(())
    }
}

/// Builder pattern for sandbox creation
#[derive(Debug, Default)]
pub struct SandboxBuilder {
    config: SandboxConfig,
}

impl SandboxBuilder {
    /// Create new builder with default limits
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder seeded from the service configuration
    pub fn from_service_config(config: &ServiceConfig) -> Self {
        Self {
            config: SandboxConfig {
                limits: config.limits,
                max_output_bytes: config.max_output_bytes,
                runner_path: config.runner_path.clone(),
                auto_install_modules: config.auto_install_modules,
            },
        }
    }

    /// Set all resource limits
    pub fn limits(mut self, limits: ResourceLimits) -> Self {
        self.config.limits = limits;
        self
    }

    /// Set CPU time limit in seconds
    pub fn cpu_seconds(mut self, seconds: u64) -> Self {
        self.config.limits.cpu_seconds = seconds;
        self
    }

    /// Set memory limit in megabytes
    pub fn memory_megabytes(mut self, megabytes: u64) -> Self {
        self.config.limits.memory_megabytes = megabytes;
        self
    }

    /// Set wall-clock deadline in seconds
    pub fn wall_clock_seconds(mut self, seconds: u64) -> Self {
        self.config.limits.wall_clock_seconds = seconds;
        self
    }

    /// Set per-stream capture cap
    pub fn max_output_bytes(mut self, bytes: usize) -> Self {
        self.config.max_output_bytes = bytes;
        self
    }

    /// Set runner binary path
    pub fn runner_path(mut self, path: impl AsRef<Path>) -> Self {
        self.config.runner_path = Some(path.as_ref().to_path_buf());
        self
    }

    /// Enable missing-module installation
    pub fn auto_install_modules(mut self, enabled: bool) -> Self {
        self.config.auto_install_modules = enabled;
        self
    }

    /// Build sandbox
    pub fn build(self) -> Result<Sandbox> {
        self.config.validate()?;

        let runner_path = match &self.config.runner_path {
            Some(path) => path.clone(),
            None => default_runner_path()?,
        };
        if !runner_path.is_file() {
            return Err(SandboxError::InvalidConfig(format!(
                "runner binary not found at {}",
                runner_path.display()
            )));
        }

        info!("Using runner {}", runner_path.display());
        Ok(Sandbox {
            process: ProcessConfig {
                runner_path,
                limits: self.config.limits,
                max_output_bytes: self.config.max_output_bytes,
            },
            config: self.config,
        })
    }
}

/// Executes submitted code, one runner process per call.
///
/// `Sandbox` holds only immutable configuration and is shared freely across
/// threads; concurrent executions never touch each other.
#[derive(Debug, Clone)]
pub struct Sandbox {
    config: SandboxConfig,
    process: ProcessConfig,
}

impl Sandbox {
    pub fn limits(&self) -> &ResourceLimits {
        &self.config.limits
    }

    pub fn runner_path(&self) -> &Path {
        &self.process.runner_path
    }

    /// Run `code` with `arguments` and classify how it ended.
    ///
    /// Blocks until the runner reaches a terminal state or the wall-clock
    /// deadline fires.
    pub fn execute(&self, code: &str, arguments: &[Value]) -> ExecutionOutcome {
        let request = RunnerRequest::encode(code, arguments).map_err(ExecutionError::from)?;

        if self.config.auto_install_modules {
            dependencies::ensure_installed(code).map_err(|e| {
                warn!("Dependency installation failed: {}", e);
                ExecutionError::new(ErrorKind::ProcessFault, e.to_string())
            })?;
        }

        let result = ProcessExecutor::execute(&self.process, &request).map_err(|e| {
            warn!("Runner execution failed: {}", e);
            ExecutionError::from(e)
        })?;

        if let Some(report) = &result.report {
            if report.limits.is_degraded() {
                debug!("runner {} ran with degraded limits: {:?}", result.pid, report.limits);
            }
        }

        let outcome = classify(result, &self.config.limits);
        match &outcome {
            Ok(output) => debug!("execution succeeded in {} ms", output.wall_time_ms),
            Err(e) => info!("execution failed: {}", e),
        }
        outcome
    }
}

/// `sandbox-runner` next to the current executable.
///
/// Test binaries live one directory below the build output, so the parent
/// directory is tried as well.
pub fn default_runner_path() -> Result<PathBuf> {
    let exe = std::env::current_exe()?;
    let dir = exe
        .parent()
        .ok_or_else(|| SandboxError::InvalidConfig("executable has no parent directory".into()))?;

    let sibling = dir.join(RUNNER_BINARY);
    if sibling.is_file() {
        return Ok(sibling);
    }

    Ok(dir
        .parent()
        .map(|parent| parent.join(RUNNER_BINARY))
        .filter(|candidate| candidate.is_file())
        .unwrap_or(sibling))
}

//! Service configuration loaded once from the environment at startup

use std::path::PathBuf;
use std::time::Duration;

use crate::errors::{Result, SandboxError};

pub const CPU_LIMIT_VAR: &str = "CPU_LIMIT_SECONDS";
pub const MEMORY_LIMIT_VAR: &str = "MEMORY_LIMIT_MB";
pub const TIMEOUT_VAR: &str = "EXEC_TIMEOUT_SECONDS";
pub const MAX_OUTPUT_VAR: &str = "MAX_OUTPUT_BYTES";
pub const BIND_VAR: &str = "SANDBOX_BIND";
pub const AUTH_USER_VAR: &str = "BASIC_AUTH_USER";
pub const AUTH_PASS_VAR: &str = "BASIC_AUTH_PASS";
pub const AUTO_INSTALL_VAR: &str = "AUTO_INSTALL_MODULES";
pub const RUNNER_PATH_VAR: &str = "SANDBOX_RUNNER_PATH";
pub const MAX_CONCURRENT_VAR: &str = "MAX_CONCURRENT_EXECUTIONS";

pub const DEFAULT_CPU_SECONDS: u64 = 2;
pub const DEFAULT_MEMORY_MEGABYTES: u64 = 64;
pub const DEFAULT_WALL_CLOCK_SECONDS: u64 = 3;
pub const DEFAULT_MAX_OUTPUT_BYTES: usize = 1024 * 1024;
pub const DEFAULT_BIND: &str = "127.0.0.1:8000";
pub const DEFAULT_MAX_CONCURRENT: usize = 16;

/// Ceilings applied to every execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResourceLimits {
    /// CPU time charged to the runner (RLIMIT_CPU)
    pub cpu_seconds: u64,
    /// Address space of the runner (RLIMIT_AS)
    pub memory_megabytes: u64,
    /// Elapsed real time before the supervisor kills the process group
    pub wall_clock_seconds: u64,
}

impl Default for ResourceLimits {
    fn default() -> Self {
        Self {
            cpu_seconds: DEFAULT_CPU_SECONDS,
            memory_megabytes: DEFAULT_MEMORY_MEGABYTES,
            wall_clock_seconds: DEFAULT_WALL_CLOCK_SECONDS,
        }
    }
}

impl ResourceLimits {
    /// Build validated limits
    pub fn new(cpu_seconds: u64, memory_megabytes: u64, wall_clock_seconds: u64) -> Result<Self> {
        let limits = Self {
            cpu_seconds,
            memory_megabytes,
            wall_clock_seconds,
        };
        limits.validate()?;
        Ok(limits)
    }

    /// Every ceiling must be a positive integer
    pub fn validate(&self) -> Result<()> {
        for (name, value) in [
            ("cpu_seconds", self.cpu_seconds),
            ("memory_megabytes", self.memory_megabytes),
            ("wall_clock_seconds", self.wall_clock_seconds),
        ] {
            if value == 0 {
                return Err(SandboxError::InvalidConfig(format!(
                    "{} must be a positive integer",
                    name
                )));
            }
        }

        self.memory_bytes()?;
        Ok(())
    }

    pub fn wall_clock(&self) -> Duration {
        Duration::from_secs(self.wall_clock_seconds)
    }

    pub fn memory_bytes(&self) -> Result<u64> {
        self.memory_megabytes
            .checked_mul(1024 * 1024)
            .ok_or_else(|| {
                SandboxError::InvalidConfig(format!(
                    "Memory limit overflow: {} MB",
                    self.memory_megabytes
                ))
            })
    }
}

/// Credentials for the optional Basic auth middleware
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BasicAuth {
    pub user: String,
    pub password: String,
}

/// Process-wide configuration for the HTTP service and the CLI
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceConfig {
    pub limits: ResourceLimits,
    /// Cap applied separately to captured stdout and stderr
    pub max_output_bytes: usize,
    pub bind: String,
    pub auth: Option<BasicAuth>,
    /// Install modules imported by submitted code when the interpreter lacks them
    pub auto_install_modules: bool,
    /// Explicit runner binary; defaults to the sibling of the current executable
    pub runner_path: Option<PathBuf>,
    pub max_concurrent_executions: usize,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            limits: ResourceLimits::default(),
            max_output_bytes: DEFAULT_MAX_OUTPUT_BYTES,
            bind: DEFAULT_BIND.to_string(),
            auth: None,
            auto_install_modules: false,
            runner_path: None,
            max_concurrent_executions: DEFAULT_MAX_CONCURRENT,
        }
    }
}

impl ServiceConfig {
    /// Read the configuration from the process environment
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Read the configuration through an arbitrary key lookup
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let limits = ResourceLimits::new(
            positive(&lookup, CPU_LIMIT_VAR, DEFAULT_CPU_SECONDS)?,
            positive(&lookup, MEMORY_LIMIT_VAR, DEFAULT_MEMORY_MEGABYTES)?,
            positive(&lookup, TIMEOUT_VAR, DEFAULT_WALL_CLOCK_SECONDS)?,
        )?;

        let max_output_bytes =
            positive(&lookup, MAX_OUTPUT_VAR, DEFAULT_MAX_OUTPUT_BYTES as u64)? as usize;
        let max_concurrent_executions =
            positive(&lookup, MAX_CONCURRENT_VAR, DEFAULT_MAX_CONCURRENT as u64)? as usize;

        let auth = match (non_empty(&lookup, AUTH_USER_VAR), non_empty(&lookup, AUTH_PASS_VAR)) {
            (Some(user), Some(password)) => Some(BasicAuth { user, password }),
            (None, None) => None,
            _ => {
                return Err(SandboxError::InvalidConfig(format!(
                    "{} and {} must be set together",
                    AUTH_USER_VAR, AUTH_PASS_VAR
                )));
            }
        };

        Ok(Self {
            limits,
            max_output_bytes,
            bind: non_empty(&lookup, BIND_VAR).unwrap_or_else(|| DEFAULT_BIND.to_string()),
            auth,
            auto_install_modules: flag(&lookup, AUTO_INSTALL_VAR)?,
            runner_path: non_empty(&lookup, RUNNER_PATH_VAR).map(PathBuf::from),
            max_concurrent_executions,
        })
    }
}

fn non_empty<F>(lookup: &F, key: &str) -> Option<String>
where
    F: Fn(&str) -> Option<String>,
{
    lookup(key)
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn positive<F>(lookup: &F, key: &str, default: u64) -> Result<u64>
where
    F: Fn(&str) -> Option<String>,
{
    let Some(raw) = non_empty(lookup, key) else {
        return Ok(default);
    };

    match raw.parse::<u64>() {
        Ok(0) => Err(SandboxError::InvalidConfig(format!(
            "{} must be a positive integer, got 0",
            key
        ))),
        Ok(value) => Ok(value),
        Err(_) => Err(SandboxError::InvalidConfig(format!(
            "{} must be a positive integer, got {:?}",
            key, raw
        ))),
    }
}

fn flag<F>(lookup: &F, key: &str) -> Result<bool>
where
    F: Fn(&str) -> Option<String>,
{
    let Some(raw) = non_empty(lookup, key) else {
        return Ok(false);
    };

    match raw.to_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(SandboxError::InvalidConfig(format!(
            "{} must be a boolean, got {:?}",
            key, raw
        ))),
    }
}

//! setrlimit-based resource limits (no privileges needed)
//!
//! Ceilings can only be lowered from inside the process they apply to, so
//! the runner calls [`ResourceLimiter::apply`] on itself before any untrusted
//! code is loaded.

use nix::sys::resource::{getrlimit, setrlimit, Resource};
use serde::{Deserialize, Serialize};

use crate::config::ResourceLimits;
use crate::errors::{Result, SandboxError};

/// Environment variable carrying the CPU ceiling into the runner
pub const CPU_SECONDS_ENV: &str = "SANDBOX_CPU_SECONDS";
/// Environment variable carrying the memory ceiling into the runner
pub const MEMORY_MB_ENV: &str = "SANDBOX_MEMORY_MB";

/// Whether the operating system enforces a given ceiling
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Enforcement {
    #[default]
    Enforced,
    Unsupported,
}

/// What the limiter managed to put in place
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct LimitReport {
    pub cpu: Enforcement,
    pub memory: Enforcement,
}

impl LimitReport {
    /// True when at least one ceiling is only backed by the wall-clock deadline
    pub fn is_degraded(&self) -> bool {
        self.cpu == Enforcement::Unsupported || self.memory == Enforcement::Unsupported
    }

    /// Enforcement available on the current platform
    pub fn platform() -> Self {
        Self {
            cpu: Enforcement::Enforced,
            memory: if cfg!(target_os = "linux") {
                Enforcement::Enforced
            } else {
                Enforcement::Unsupported
            },
        }
    }
}

/// CPU and memory ceilings for one runner process
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResourceLimiter {
    /// Maximum CPU time in seconds (RLIMIT_CPU)
    pub max_cpu_seconds: u64,
    /// Maximum address space in megabytes (RLIMIT_AS)
    pub max_memory_megabytes: u64,
}

impl ResourceLimiter {
    pub fn new(limits: &ResourceLimits) -> Self {
        Self {
            max_cpu_seconds: limits.cpu_seconds,
            max_memory_megabytes: limits.memory_megabytes,
        }
    }

    /// Variables the supervisor sets on the runner's environment
    pub fn env_vars(&self) -> [(&'static str, String); 2] {
        [
            (CPU_SECONDS_ENV, self.max_cpu_seconds.to_string()),
            (MEMORY_MB_ENV, self.max_memory_megabytes.to_string()),
        ]
    }

    /// Rebuild the limiter inside the runner
    pub fn from_env() -> Result<Self> {
        Self::from_vars(|key| std::env::var(key).ok())
    }

    pub fn from_vars<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let read = |key: &str| -> Result<u64> {
            let raw = lookup(key)
                .ok_or_else(|| SandboxError::InvalidConfig(format!("{} is not set", key)))?;
            match raw.trim().parse::<u64>() {
                Ok(value) if value > 0 => Ok(value),
                _ => Err(SandboxError::InvalidConfig(format!(
                    "{} must be a positive integer, got {:?}",
                    key, raw
                ))),
            }
        };

        Ok(Self {
            max_cpu_seconds: read(CPU_SECONDS_ENV)?,
            max_memory_megabytes: read(MEMORY_MB_ENV)?,
        })
    }

    /// Apply resource limits to the current process.
    /// This must run in the runner before the interpreter is initialised.
    pub fn apply(&self) -> Result<LimitReport> {
        lower_limit(Resource::RLIMIT_CORE, 0, 0)?;

        // SIGXCPU at the soft limit, SIGKILL if the process survives a further second
        let cpu = self.max_cpu_seconds;
        lower_limit(Resource::RLIMIT_CPU, cpu, cpu.saturating_add(1))?;

        Ok(LimitReport {
            cpu: Enforcement::Enforced,
            memory: self.apply_memory()?,
        })
    }

    #[cfg(target_os = "linux")]
    fn apply_memory(&self) -> Result<Enforcement> {
        let bytes = self
            .max_memory_megabytes
            .checked_mul(1024 * 1024)
            .ok_or_else(|| {
                SandboxError::InvalidConfig(format!(
                    "Memory limit overflow: {} MB",
                    self.max_memory_megabytes
                ))
            })?;
        lower_limit(Resource::RLIMIT_AS, bytes, bytes)?;
        Ok(Enforcement::Enforced)
    }

    // RLIMIT_AS is not honoured by the macOS kernel
    #[cfg(not(target_os = "linux"))]
    fn apply_memory(&self) -> Result<Enforcement> {
        Ok(Enforcement::Unsupported)
    }
}

/// Lower a limit, never asking for more than the inherited hard ceiling
fn lower_limit(resource: Resource, soft: u64, hard: u64) -> Result<()> {
    let (_, current_hard) = getrlimit(resource)
        .map_err(|e| SandboxError::Syscall(format!("getrlimit({:?}) failed: {}", resource, e)))?;

    let hard = hard.min(current_hard);
    let soft = soft.min(hard);

    setrlimit(resource, soft, hard)
        .map_err(|e| SandboxError::Syscall(format!("setrlimit({:?}) failed: {}", resource, e)))
}

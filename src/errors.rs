//! Error types for sandbox operations

use std::io;
use thiserror::Error;

/// Result type for sandbox operations
pub type Result<T> = std::result::Result<T, SandboxError>;

/// Errors raised by the sandbox machinery itself.
///
/// Failures of the submitted code are not represented here; they are
/// classified into [`crate::execution::ExecutionError`] from the runner's
/// terminal state.
#[derive(Error, Debug)]
pub enum SandboxError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Syscall error: {0}")]
    Syscall(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Encoding error: {0}")]
    Encoding(String),

    #[error("Failed to start runner: {0}")]
    Spawn(String),

    #[error("Dependency installation failed: {0}")]
    Dependency(String),

    #[error("Python error: {0}")]
    Python(String),
}

impl From<serde_json::Error> for SandboxError {
    fn from(err: serde_json::Error) -> Self {
        SandboxError::Encoding(err.to_string())
    }
}

impl From<pyo3::PyErr> for SandboxError {
    fn from(err: pyo3::PyErr) -> Self {
        SandboxError::Python(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = SandboxError::InvalidConfig("CPU_LIMIT_SECONDS must be positive".to_string());
        assert_eq!(
            err.to_string(),
            "Invalid configuration: CPU_LIMIT_SECONDS must be positive"
        );
    }

    #[test]
    fn test_error_from_io() {
        let io_err = io::Error::new(io::ErrorKind::NotFound, "file not found");
        let sandbox_err = SandboxError::from(io_err);
        assert!(sandbox_err.to_string().contains("IO error"));
    }

    #[test]
    fn test_error_from_json() {
        let json_err = serde_json::from_str::<serde_json::Value>("{").unwrap_err();
        let sandbox_err = SandboxError::from(json_err);
        assert!(matches!(sandbox_err, SandboxError::Encoding(_)));
    }
}

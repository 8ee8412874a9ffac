//! Execution layer: runner supervision and outcome classification
//!
//! # Features
//!
//! - **Process supervision**: process-group spawn, wall-clock deadline, group kill
//! - **Descendant sweep**: `/proc` scan for processes that left the group
//! - **Stream capture**: capped stdout/stderr with truncation flags
//! - **Classification**: terminal state to [`ExecutionOutcome`]
//!
//! # Examples
//!
//! ```ignore
//! use code_sandbox::config::ResourceLimits;
//! use code_sandbox::execution::{classify, ProcessConfig, ProcessExecutor};
//!
//! let config = ProcessConfig {
//!     runner_path: "/usr/local/bin/sandbox-runner".into(),
//!     limits: ResourceLimits::default(),
//!     max_output_bytes: 1 << 20,
//! };
//! let result = ProcessExecutor::execute(&config, &request)?;
//! let outcome = classify(result, &config.limits);
//! ```

pub mod outcome;
pub mod process;
pub mod stream;
pub mod sweep;

pub use outcome::{classify, ErrorKind, ExecutionError, ExecutionOutcome, ExecutionOutput};
pub use process::{ProcessConfig, ProcessExecutor, ProcessResult, Termination};
pub use stream::Captured;

//! code-sandbox: run untrusted Python snippets in resource-limited processes
//!
//! Each execution spawns one `sandbox-runner` process in its own process
//! group. The runner lowers its own CPU, address-space and core-dump
//! ceilings, loads the submitted code into a fresh interpreter namespace and
//! calls its `run` function. The supervisor races the runner's exit against
//! a wall-clock deadline, captures its output, and classifies how it ended.
//!
//! # Modules
//!
//! - **config**: Limits and service configuration from the environment
//! - **resources**: setrlimit ceilings applied inside the runner
//! - **codec**: JSON values and runner wire messages
//! - **runner**: The child-process side of an execution
//! - **execution**: Supervision, capture and outcome classification
//! - **controller**: Main sandbox facade
//! - **api**: HTTP adapter
//!
//! # Example
//!
//! ```ignore
//! use code_sandbox::SandboxBuilder;
//! use serde_json::json;
//!
//! let sandbox = SandboxBuilder::new()
//!     .cpu_seconds(2)
//!     .memory_megabytes(64)
//!     .wall_clock_seconds(3)
//!     .build()?;
//!
//! let output = sandbox.execute(
//!     "def run(user): return user['first_name'] + ' ' + user['last_name']",
//!     &[json!({"first_name": "Ivan", "last_name": "Petrov"})],
//! )?;
//! assert_eq!(output.stdout, "Ivan Petrov");
//! ```

// Core modules
pub mod codec;
pub mod config;
pub mod errors;
pub mod logging;

// Layered modules
pub mod dependencies;
pub mod execution;
pub mod resources;
pub mod runner;

// Main controller
pub mod api;
pub mod controller;

// Public API
pub use codec::Value;
pub use config::{ResourceLimits, ServiceConfig};
pub use controller::{Sandbox, SandboxBuilder, SandboxConfig};
pub use errors::{Result, SandboxError};
pub use execution::{ErrorKind, ExecutionError, ExecutionOutcome, ExecutionOutput};
pub use resources::{LimitReport, ResourceLimiter};

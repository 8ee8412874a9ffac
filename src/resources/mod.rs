//! Resource limits layer: setrlimit ceilings for the isolated runner
//!
//! The limiter runs inside the freshly spawned runner, before the
//! interpreter starts, and lowers the process's own ceilings.
//!
//! # Features
//!
//! - **CPU time**: RLIMIT_CPU, SIGXCPU at the soft limit and SIGKILL one second later
//! - **Memory**: RLIMIT_AS on Linux, reported as unsupported elsewhere
//! - **Core dumps**: RLIMIT_CORE pinned to zero
//!
//! # Examples
//!
//! ```ignore
//! use code_sandbox::config::ResourceLimits;
//! use code_sandbox::resources::ResourceLimiter;
//!
//! let limiter = ResourceLimiter::new(&ResourceLimits::default());
//! let report = limiter.apply()?;
//! if report.is_degraded() {
//!     // rely on the wall-clock deadline only
//! }
//! ```

pub mod rlimit;
pub use rlimit::{Enforcement, LimitReport, ResourceLimiter};

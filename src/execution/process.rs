//! Runner process supervision
//!
//! The runner is started in its own process group with a scrubbed
//! environment. Its stdout and stderr are drained by capped reader threads,
//! its report arrives on a dedicated pipe mapped to [`RESULT_FD`], and a
//! waiter thread races its exit against the wall-clock deadline. The whole
//! group receives SIGKILL on every exit path, and a sweep catches whatever
//! left the group, so nothing it forked outlives the request.

use std::fs::File;
use std::io::Write;
use std::os::fd::AsRawFd;
use std::os::unix::process::{CommandExt, ExitStatusExt};
use std::path::PathBuf;
use std::process::{Command, ExitStatus, Stdio};
use std::sync::mpsc::{channel, RecvTimeoutError};
use std::thread;
use std::time::{Duration, Instant};

use log::{debug, warn};
use nix::errno::Errno;
use nix::fcntl::OFlag;
use nix::sys::signal::{killpg, Signal};
use nix::sys::wait::{waitid, Id, WaitPidFlag};
use nix::unistd::{pipe2, Pid};

use crate::codec::{self, RunnerReport};
use crate::config::ResourceLimits;
use crate::errors::{Result, SandboxError};
use crate::execution::stream::{spawn_capture, Captured};
use crate::execution::sweep::{self, EXECUTION_ID_ENV};
use crate::resources::ResourceLimiter;
use crate::runner::{RESULT_FD, RESULT_FD_ENV, RESULT_LIMIT_ENV};

/// Variables copied from the supervisor's environment into the runner's
pub const ENV_ALLOWLIST: &[&str] = &["PATH", "LANG", "LC_ALL", "PYTHONHOME", "PYTHONPATH"];

/// How long reader threads get to hit EOF once the process group is gone
const DRAIN_GRACE: Duration = Duration::from_millis(500);

/// Room for the report envelope around a result of `max_output_bytes`
const REPORT_OVERHEAD: usize = 4096;

/// Process execution configuration
#[derive(Debug, Clone)]
pub struct ProcessConfig {
    /// Runner binary to execute
    pub runner_path: PathBuf,
    pub limits: ResourceLimits,
    /// Cap applied separately to stdout, stderr and the structured result
    pub max_output_bytes: usize,
}

/// How the runner ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Termination {
    Exited(i32),
    Signaled(i32),
}

impl From<ExitStatus> for Termination {
    fn from(status: ExitStatus) -> Self {
        match (status.code(), status.signal()) {
            (Some(code), _) => Termination::Exited(code),
            (None, Some(signal)) => Termination::Signaled(signal),
            (None, None) => Termination::Exited(-1),
        }
    }
}

/// Result of process execution
#[derive(Debug, Clone)]
pub struct ProcessResult {
    /// Process ID (also the process group ID)
    pub pid: Pid,
    pub termination: Termination,
    /// The wall-clock deadline fired and the group was killed
    pub timed_out: bool,
    pub stdout: Captured,
    pub stderr: Captured,
    /// Report from the result descriptor, when one arrived intact
    pub report: Option<RunnerReport>,
    pub wall_time: Duration,
}

/// Process executor
pub struct ProcessExecutor;

impl ProcessExecutor {
    /// Run the runner once, feeding `input` on stdin
    pub fn execute(config: &ProcessConfig, input: &[u8]) -> Result<ProcessResult> {
        let limiter = ResourceLimiter::new(&config.limits);
        let execution_id = sweep::execution_id();

        // Created before the stdio pipes so that, when fd 3 is free, it is
        // taken by this pipe and never by std's internal exec pipe.
        let (result_read, result_write) = pipe2(OFlag::O_CLOEXEC)
            .map_err(|e| SandboxError::Syscall(format!("pipe2 failed: {}", e)))?;

        let mut cmd = Command::new(&config.runner_path);
        cmd.env_clear();
        for key in ENV_ALLOWLIST {
            if let Some(value) = std::env::var_os(key) {
                cmd.env(key, value);
            }
        }
        for (key, value) in limiter.env_vars() {
            cmd.env(key, value);
        }
        cmd.env(EXECUTION_ID_ENV, &execution_id)
            .env(RESULT_FD_ENV, RESULT_FD.to_string())
            .env(RESULT_LIMIT_ENV, config.max_output_bytes.to_string())
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .process_group(0);

        let write_fd = result_write.as_raw_fd();
        // SAFETY: only async-signal-safe libc calls run between fork and exec.
        unsafe {
            cmd.pre_exec(move || expose_result_fd(write_fd));
        }

        let start = Instant::now();
        let mut child = cmd.spawn().map_err(|e| {
            SandboxError::Spawn(format!(
                "failed to start {}: {}",
                config.runner_path.display(),
                e
            ))
        })?;
        drop(result_write);

        let pid = Pid::from_raw(child.id() as i32);
        let group = ProcessGroupGuard::new(pid, execution_id);
        debug!("runner started with pid {}", pid);

        let stdin = child.stdin.take();
        let stdout = child.stdout.take();
        let stderr = child.stderr.take();

        // The waiter only observes the exit. Reaping is left for after the
        // group kill, so the leader's pid keeps the group id reserved.
        let (exit_tx, exit_rx) = channel();
        thread::Builder::new()
            .name("sandbox-waiter".to_string())
            .spawn(move || {
                let observed = wait_without_reaping(pid);
                let _ = exit_tx.send((observed, Instant::now()));
            })?;

        if let Some(mut stdin) = stdin {
            let input = input.to_vec();
            thread::Builder::new()
                .name("sandbox-stdin".to_string())
                .spawn(move || {
                    // A runner that dies early closes the pipe; nothing to report.
                    let _ = stdin.write_all(&input);
                })?;
        }

        let stdout = stdout
            .map(|out| spawn_capture(out, config.max_output_bytes))
            .transpose()?;
        let stderr = stderr
            .map(|err| spawn_capture(err, config.max_output_bytes))
            .transpose()?;
        let report = spawn_capture(
            File::from(result_read),
            config.max_output_bytes.saturating_add(REPORT_OVERHEAD),
        )?;

        let deadline = config.limits.wall_clock();
        let (observed, exited_at, timed_out) = match exit_rx.recv_timeout(deadline) {
            Ok((observed, exited_at)) => (observed, exited_at, false),
            Err(RecvTimeoutError::Timeout) => {
                warn!("runner {} exceeded {:?}, killing its process group", pid, deadline);
                group.terminate();
                let (observed, exited_at) = exit_rx
                    .recv()
                    .map_err(|_| SandboxError::Syscall("runner waiter vanished".to_string()))?;
                (observed, exited_at, true)
            }
            Err(RecvTimeoutError::Disconnected) => {
                return Err(SandboxError::Syscall("runner waiter vanished".to_string()));
            }
        };
        observed?;

        // Descendants left behind, whether or not the deadline fired
        group.terminate();
        let status = child.wait()?;
        group.release();

        let termination = Termination::from(status);
        let drain_deadline = Instant::now() + DRAIN_GRACE;
        let stdout = stdout.map(|c| c.finish(drain_deadline)).unwrap_or_default();
        let stderr = stderr.map(|c| c.finish(drain_deadline)).unwrap_or_default();
        let report = report.finish(drain_deadline);

        let report = if report.truncated || report.bytes.is_empty() {
            None
        } else {
            codec::decode_message::<RunnerReport>(&report.bytes)
                .map_err(|e| debug!("discarding malformed runner report: {}", e))
                .ok()
        };

        debug!("runner {} finished: {:?}", pid, termination);

        Ok(ProcessResult {
            pid,
            termination,
            timed_out,
            stdout,
            stderr,
            report,
            wall_time: exited_at.saturating_duration_since(start),
        })
    }
}

/// Make the report pipe's write end visible to the runner as [`RESULT_FD`]
fn expose_result_fd(fd: i32) -> std::io::Result<()> {
    // SAFETY: plain descriptor syscalls on descriptors owned by this process.
    let rc = unsafe {
        if fd == RESULT_FD {
            let flags = libc::fcntl(fd, libc::F_GETFD);
            if flags < 0 {
                -1
            } else {
                libc::fcntl(fd, libc::F_SETFD, flags & !libc::FD_CLOEXEC)
            }
        } else {
            libc::dup2(fd, RESULT_FD)
        }
    };

    if rc < 0 {
        Err(std::io::Error::last_os_error())
    } else {
        Ok(())
    }
}

/// Block until the runner exits, leaving it a zombie for `Child::wait`
fn wait_without_reaping(pid: Pid) -> Result<()> {
    loop {
        match waitid(Id::Pid(pid), WaitPidFlag::WEXITED | WaitPidFlag::WNOWAIT) {
            Ok(_) => return Ok(()),
            Err(Errno::EINTR) => continue,
            Err(e) => return Err(SandboxError::Syscall(format!("waitid({}) failed: {}", pid, e))),
        }
    }
}

/// Kills the runner's process group and marked descendants.
///
/// Armed until [`release`](Self::release), which happens once the runner has
/// been reaped; any early return before that kills everything on drop.
struct ProcessGroupGuard {
    pgid: Pid,
    execution_id: String,
    armed: bool,
}

impl ProcessGroupGuard {
    fn new(pgid: Pid, execution_id: String) -> Self {
        Self {
            pgid,
            execution_id,
            armed: true,
        }
    }

    fn terminate(&self) {
        match killpg(self.pgid, Signal::SIGKILL) {
            Ok(()) | Err(Errno::ESRCH) => {}
            Err(e) => warn!("killpg({}) failed: {}", self.pgid, e),
        }
        sweep::kill_marked(&self.execution_id, self.pgid);
    }

    fn release(mut self) {
        self.armed = false;
    }
}

impl Drop for ProcessGroupGuard {
    fn drop(&mut self) {
        if self.armed {
            self.terminate();
        }
    }
}

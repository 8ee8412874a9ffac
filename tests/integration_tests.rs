//! End-to-end tests through the real `sandbox-runner` binary
//!
//! These tests spawn the embedded interpreter and need a Python 3 runtime
//! the runner can initialise. They do NOT require root.

use code_sandbox::codec::RunnerRequest;
use code_sandbox::execution::{ProcessConfig, ProcessExecutor, Termination};
use code_sandbox::{ErrorKind, ResourceLimits, Sandbox, SandboxBuilder};
use serde_json::json;
use std::time::{Duration, Instant};

const RUNNER: &str = env!("CARGO_BIN_EXE_sandbox-runner");

fn sandbox(cpu: u64, memory: u64, wall: u64) -> Sandbox {
    SandboxBuilder::new()
        .cpu_seconds(cpu)
        .memory_megabytes(memory)
        .wall_clock_seconds(wall)
        .runner_path(RUNNER)
        .build()
        .unwrap()
}

fn roomy() -> Sandbox {
    sandbox(5, 512, 10)
}

/// Alive means present in the process table and not a zombie
fn is_alive(pid: i32) -> bool {
    match std::fs::read_to_string(format!("/proc/{}/stat", pid)) {
        Ok(stat) => !stat
            .rsplit(')')
            .next()
            .map(|rest| rest.trim_start().starts_with('Z'))
            .unwrap_or(false),
        Err(_) => false,
    }
}

#[test]
fn test_returns_concatenated_name() {
    let output = roomy()
        .execute(
            "def run(user): return user['first_name'] + ' ' + user['last_name']",
            &[json!({"first_name": "Ivan", "last_name": "Petrov"})],
        )
        .unwrap();

    assert_eq!(output.stdout, "Ivan Petrov");
    assert_eq!(output.stderr, "");
    assert_eq!(output.exit_code, 0);
    assert_eq!(output.result, Some(json!("Ivan Petrov")));
    assert!(!output.truncated);
}

#[test]
fn test_printed_output_precedes_result() {
    let code = "def run(x):\n    print('working on', x['n'])\n    return [x['n'], x['n'] * 2]\n";
    let output = roomy().execute(code, &[json!({"n": 21})]).unwrap();

    assert_eq!(output.stdout, "working on 21\n[21, 42]");
    assert_eq!(output.result, Some(json!([21, 42])));
}

#[test]
fn test_unencodable_result_is_printed_only() {
    let output = roomy()
        .execute("def run(x): return {3, 1, 2}", &[json!({})])
        .unwrap();

    assert_eq!(output.stdout, "{1, 2, 3}");
    assert!(output.result.is_none());
}

#[test]
fn test_division_by_zero_is_a_user_fault() {
    let err = roomy()
        .execute("def run(x): return 1/0", &[json!({})])
        .unwrap_err();

    assert_eq!(err.kind, ErrorKind::UserCodeFault);
    assert_eq!(err.message, "ZeroDivisionError: division by zero");

    let output = err.output.unwrap();
    assert_ne!(output.exit_code, 0);
    assert!(output.stderr.contains("division by zero"));
    assert!(!output.stderr.contains("Traceback"));
}

#[test]
fn test_syntax_error_is_a_user_fault() {
    let err = roomy()
        .execute("def run(x) return x", &[json!({})])
        .unwrap_err();

    assert_eq!(err.kind, ErrorKind::UserCodeFault);
    assert!(err.message.starts_with("SyntaxError"));
}

#[test]
fn test_missing_entrypoint_is_a_definition_error() {
    let err = roomy()
        .execute("def main(x): return x", &[json!({})])
        .unwrap_err();

    assert_eq!(err.kind, ErrorKind::Definition);
    assert!(err.message.contains("run"));
}

#[test]
fn test_duplicate_entrypoint_is_a_definition_error() {
    let code = "def run(x): return 1\nrun = lambda x: 2\n";
    let err = roomy().execute(code, &[json!({})]).unwrap_err();
    assert_eq!(err.kind, ErrorKind::Definition);
}

#[test]
fn test_host_environment_is_hidden() {
    let code = "import os\ndef run(x): return 'HOME' in os.environ or 'CARGO' in os.environ\n";
    let output = roomy().execute(code, &[json!({})]).unwrap();
    assert_eq!(output.stdout, "False");
}

#[test]
fn test_infinite_loop_times_out() {
    let started = Instant::now();
    let err = sandbox(10, 512, 1)
        .execute("def run(x):\n    while True: pass", &[json!({})])
        .unwrap_err();

    assert_eq!(err.kind, ErrorKind::TimeoutExceeded);
    assert!(
        started.elapsed() < Duration::from_secs(3),
        "took {:?}",
        started.elapsed()
    );
}

#[test]
fn test_cpu_limit_kills_before_deadline() {
    let err = sandbox(1, 512, 10)
        .execute("def run(x):\n    while True: pass", &[json!({})])
        .unwrap_err();

    assert_eq!(err.kind, ErrorKind::ResourceLimitExceeded);
}

#[cfg(target_os = "linux")]
#[test]
fn test_large_allocation_never_succeeds() {
    let code = "def run(x):\n    data = bytearray(1024 * 1024 * 1024)\n    return len(data)\n";
    let err = sandbox(5, 128, 10).execute(code, &[json!({})]).unwrap_err();

    assert!(
        matches!(
            err.kind,
            ErrorKind::ResourceLimitExceeded | ErrorKind::UserCodeFault
        ),
        "unexpected {:?}",
        err
    );
}

#[test]
fn test_timeout_leaves_no_descendants() {
    let code = "import os, time\n\
def run(x):\n    \
    pid = os.fork()\n    \
    if pid == 0:\n        \
        time.sleep(60)\n        \
        os._exit(0)\n    \
    print(pid, flush=True)\n    \
    while True: pass\n";

    let config = ProcessConfig {
        runner_path: RUNNER.into(),
        limits: ResourceLimits::new(10, 512, 1).unwrap(),
        max_output_bytes: 4096,
    };
    let request = RunnerRequest::encode(code, &[json!({})]).unwrap();
    let result = ProcessExecutor::execute(&config, &request).unwrap();

    assert!(result.timed_out);
    assert_eq!(result.termination, Termination::Signaled(libc::SIGKILL));

    let grandchild: i32 = result.stdout.text().parse().unwrap();
    std::thread::sleep(Duration::from_millis(200));
    assert!(!is_alive(result.pid.as_raw()), "runner should be gone");
    assert!(!is_alive(grandchild), "forked child should be gone");
}

#[cfg(target_os = "linux")]
#[test]
fn test_huge_return_value_is_not_a_crash() {
    let outcome = sandbox(10, 256, 20).execute(
        "def run(x): return list(range(3_000_000))",
        &[json!({})],
    );

    match outcome {
        Ok(output) => {
            assert!(output.result.is_none());
            assert!(output.truncated);
        }
        Err(err) => assert!(
            matches!(
                err.kind,
                ErrorKind::ResourceLimitExceeded | ErrorKind::UserCodeFault
            ),
            "unexpected {:?}",
            err
        ),
    }
}

#[test]
fn test_timeout_kills_detached_descendants() {
    let code = "import os, time\n\
def run(x):\n    \
    pid = os.fork()\n    \
    if pid == 0:\n        \
        os.setsid()\n        \
        time.sleep(30)\n        \
        os._exit(0)\n    \
    print(pid, flush=True)\n    \
    while True: pass\n";

    let config = ProcessConfig {
        runner_path: RUNNER.into(),
        limits: ResourceLimits::new(10, 512, 1).unwrap(),
        max_output_bytes: 4096,
    };
    let request = RunnerRequest::encode(code, &[json!({})]).unwrap();
    let started = Instant::now();
    let result = ProcessExecutor::execute(&config, &request).unwrap();

    assert!(result.timed_out);
    assert!(
        started.elapsed() < Duration::from_millis(2500),
        "took {:?}",
        started.elapsed()
    );

    let detached: i32 = result.stdout.text().parse().unwrap();
    std::thread::sleep(Duration::from_millis(200));
    assert!(!is_alive(detached), "session leader child should be gone");
}

#[test]
fn test_concurrent_executions_are_independent() {
    let sandbox = roomy();
    let handles: Vec<_> = (0..4)
        .map(|n| {
            let sandbox = sandbox.clone();
            std::thread::spawn(move || {
                sandbox
                    .execute("def run(n): return n * n", &[json!(n)])
                    .unwrap()
            })
        })
        .collect();

    for (n, handle) in handles.into_iter().enumerate() {
        let output = handle.join().unwrap();
        assert_eq!(output.result, Some(json!(n * n)));
    }
}

//! code-sandbox CLI - Run a script through the sandbox from the command line

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use code_sandbox::config::{
    CPU_LIMIT_VAR, DEFAULT_CPU_SECONDS, DEFAULT_MAX_OUTPUT_BYTES, DEFAULT_MEMORY_MEGABYTES,
    DEFAULT_WALL_CLOCK_SECONDS, MAX_OUTPUT_VAR, MEMORY_LIMIT_VAR, RUNNER_PATH_VAR, TIMEOUT_VAR,
};
use code_sandbox::controller::default_runner_path;
use code_sandbox::execution::ErrorKind;
use code_sandbox::logging;
use code_sandbox::resources::{Enforcement, LimitReport};
use code_sandbox::{SandboxBuilder, Value};
use console::style;
use log::{debug, info};

#[derive(Parser)]
#[command(name = "code-sandbox")]
#[command(version, about = "Run untrusted Python snippets under CPU, memory and wall-clock limits", long_about = None)]
#[command(after_help = "EXAMPLES:
    # Call run(*args) from a script
    code-sandbox run greet.py --args '[{\"first_name\": \"Ivan\", \"last_name\": \"Petrov\"}]'
    code-sandbox run loop.py --timeout 1

    # Check what the platform enforces
    code-sandbox check
")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Show verbose output
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a script's `run` function in the sandbox
    Run {
        /// Python file defining `run`
        file: PathBuf,

        /// JSON array of positional arguments
        #[arg(short, long, value_name = "JSON", default_value = "[]")]
        args: String,

        /// CPU time limit in seconds
        #[arg(short, long, value_name = "SECONDS", env = CPU_LIMIT_VAR, default_value_t = DEFAULT_CPU_SECONDS)]
        cpu: u64,

        /// Memory limit in megabytes
        #[arg(short, long, value_name = "MB", env = MEMORY_LIMIT_VAR, default_value_t = DEFAULT_MEMORY_MEGABYTES)]
        memory: u64,

        /// Wall-clock timeout in seconds
        #[arg(short, long, value_name = "SECONDS", env = TIMEOUT_VAR, default_value_t = DEFAULT_WALL_CLOCK_SECONDS)]
        timeout: u64,

        /// Per-stream output cap in bytes
        #[arg(long, value_name = "BYTES", env = MAX_OUTPUT_VAR, default_value_t = DEFAULT_MAX_OUTPUT_BYTES)]
        max_output: usize,

        /// Runner binary (defaults to sandbox-runner next to this executable)
        #[arg(long, value_name = "PATH", env = RUNNER_PATH_VAR)]
        runner: Option<PathBuf>,
    },

    /// Check runner availability and limit enforcement
    Check,
}

struct RunConfig {
    file: PathBuf,
    args: String,
    cpu: u64,
    memory: u64,
    timeout: u64,
    max_output: usize,
    runner: Option<PathBuf>,
}

fn main() {
    let cli = Cli::parse();

    logging::init_logger(cli.verbose);

    match cli.command {
        Commands::Run {
            file,
            args,
            cpu,
            memory,
            timeout,
            max_output,
            runner,
        } => {
            let config = RunConfig {
                file,
                args,
                cpu,
                memory,
                timeout,
                max_output,
                runner,
            };
            match run_script(config) {
                Ok(code) => std::process::exit(code),
                Err(e) => {
                    eprintln!("{} {}", style("error:").red().bold(), e);
                    std::process::exit(1);
                }
            }
        }
        Commands::Check => check_requirements(),
    }
}

/// Execute the script and mirror its streams; returns the exit status to use
fn run_script(config: RunConfig) -> Result<i32, Box<dyn std::error::Error>> {
    let code = std::fs::read_to_string(&config.file)?;
    let arguments: Vec<Value> = serde_json::from_str(&config.args)
        .map_err(|e| format!("--args must be a JSON array: {}", e))?;

    let mut builder = SandboxBuilder::new()
        .cpu_seconds(config.cpu)
        .memory_megabytes(config.memory)
        .wall_clock_seconds(config.timeout)
        .max_output_bytes(config.max_output);
    if let Some(runner) = &config.runner {
        builder = builder.runner_path(runner);
    }
    let sandbox = builder.build()?;

    info!("Running {} with {:?}", config.file.display(), sandbox.limits());

    match sandbox.execute(&code, &arguments) {
        Ok(output) => {
            print_streams(&output.stdout, &output.stderr);
            if output.truncated {
                eprintln!("{} output was truncated", style("warning:").yellow().bold());
            }
            debug!("finished in {} ms", output.wall_time_ms);
            Ok(0)
        }
        Err(err) => {
            if let Some(output) = &err.output {
                print_streams(&output.stdout, &output.stderr);
            }
            eprintln!(
                "{} {} ({})",
                style("error:").red().bold(),
                err.message,
                style(err.kind).cyan()
            );
            Ok(match (err.kind, &err.output) {
                (ErrorKind::UserCodeFault, Some(output)) if output.exit_code != 0 => {
                    output.exit_code
                }
                _ => 1,
            })
        }
    }
}

fn print_streams(stdout: &str, stderr: &str) {
    if !stdout.is_empty() {
        println!("{}", stdout);
    }
    if !stderr.is_empty() {
        eprintln!("{}", stderr);
    }
}

fn check_requirements() {
    info!("Checking sandbox requirements");
    println!("Checking sandbox requirements...\n");

    let report = LimitReport::platform();
    print_check(
        report.cpu == Enforcement::Enforced,
        "CPU time limit (RLIMIT_CPU) enforced",
    );
    print_check(
        report.memory == Enforcement::Enforced,
        "Memory limit (RLIMIT_AS) enforced",
    );
    if report.is_degraded() {
        println!("    Only the wall-clock deadline bounds memory on this platform");
    }

    let runner = std::env::var_os(RUNNER_PATH_VAR)
        .map(PathBuf::from)
        .map(Ok)
        .unwrap_or_else(default_runner_path);
    match runner {
        Ok(path) if path.is_file() => print_check(true, &format!("Runner found at {}", path.display())),
        Ok(path) => print_check(false, &format!("Runner NOT found at {}", path.display())),
        Err(e) => print_check(false, &format!("Runner path could not be resolved: {}", e)),
    }

    let python = pyo3::Python::with_gil(|py| py.version().to_string());
    println!("\nSystem info:");
    println!("  Python: {}", python.lines().next().unwrap_or_default());
}

fn print_check(ok: bool, message: &str) {
    if ok {
        println!("[{}] {}", style("✓").green(), message);
    } else {
        println!("[{}] {}", style("✗").red(), message);
    }
}

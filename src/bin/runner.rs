//! Isolated runner: executes one request from stdin and exits

use code_sandbox::runner::exhaustion::ExitOnExhaustion;

#[global_allocator]
static ALLOCATOR: ExitOnExhaustion = ExitOnExhaustion;

fn main() {
    std::process::exit(code_sandbox::runner::run_from_env());
}

use console::style;
use env_logger::{Builder, Env};
use log::{Level, LevelFilter};
use std::io::Write;

/// Initialize the CLI logger based on the verbose flag
pub fn init_logger(verbose: bool) {
    let env = Env::default().filter_or("RUST_LOG", if verbose { "debug" } else { "warn" });

    Builder::from_env(env)
        .format(|buf, record| writeln!(buf, "{} {}", level_label(record.level()), record.args()))
        .filter_level(if verbose {
            LevelFilter::Debug
        } else {
            LevelFilter::Warn
        })
        .init();
}

/// Initialize the server logger; `RUST_LOG` defaults to `info`
pub fn init_service_logger() {
    env_logger::init_from_env(Env::new().default_filter_or("info"));
}

fn level_label(level: Level) -> String {
    match level {
        Level::Error => format!("{}", style("ERROR").red().bold()),
        Level::Warn => format!("{}", style("WARN ").yellow().bold()),
        Level::Info => format!("{}", style("INFO ").green()),
        Level::Debug => format!("{}", style("DEBUG").cyan()),
        Level::Trace => format!("{}", style("TRACE").dim()),
    }
}

//! HTTP server for sandboxed code execution
//!
//! ## Endpoints
//!
//! POST /run - Execute code
//! GET /health - Health and limit enforcement

use actix_web::middleware::{from_fn, Logger};
use actix_web::{web, App, HttpServer};
use code_sandbox::api::{self, AppState};
use code_sandbox::config::ServiceConfig;
use code_sandbox::logging;
use code_sandbox::resources::LimitReport;
use code_sandbox::SandboxBuilder;
use log::{error, info, warn};

#[actix_web::main]
async fn main() -> std::io::Result<()> {
    logging::init_service_logger();

    let config = match ServiceConfig::from_env() {
        Ok(config) => config,
        Err(e) => {
            error!("Configuration error: {}", e);
            std::process::exit(2);
        }
    };

    let sandbox = match SandboxBuilder::from_service_config(&config).build() {
        Ok(sandbox) => sandbox,
        Err(e) => {
            error!("Configuration error: {}", e);
            std::process::exit(2);
        }
    };

    let platform = LimitReport::platform();
    if platform.is_degraded() {
        warn!(
            "Limits only partially enforced on this platform ({:?}); the wall-clock deadline is the backstop",
            platform
        );
    }
    if config.auth.is_none() {
        warn!("Basic auth disabled: BASIC_AUTH_USER/BASIC_AUTH_PASS not set");
    }

    info!(
        "Limits: {} s CPU, {} MB memory, {} s wall clock",
        config.limits.cpu_seconds, config.limits.memory_megabytes, config.limits.wall_clock_seconds
    );
    info!("Sandbox server starting on http://{}", config.bind);

    let state = web::Data::new(AppState {
        sandbox,
        auth: config.auth.clone(),
    });

    HttpServer::new(move || {
        App::new()
            .app_data(state.clone())
            .wrap(from_fn(api::require_basic_auth))
            .wrap(Logger::default())
            .configure(api::configure)
    })
    .worker_max_blocking_threads(config.max_concurrent_executions)
    .bind(&config.bind)?
    .run()
    .await
}

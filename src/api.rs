//! HTTP adapter
//!
//! ## Endpoints
//!
//! POST /run - Execute `{"code": ..., "args": [...]}`
//! GET /health - Service name, version and limit enforcement

use actix_web::body::{EitherBody, MessageBody};
use actix_web::dev::{ServiceRequest, ServiceResponse};
use actix_web::error::InternalError;
use actix_web::http::{header, StatusCode};
use actix_web::middleware::Next;
use actix_web::{web, Error, HttpResponse, Responder};
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use log::{error, info, warn};
use serde::{Deserialize, Serialize};

use crate::codec::Value;
use crate::config::BasicAuth;
use crate::controller::Sandbox;
use crate::execution::{ErrorKind, ExecutionError, ExecutionOutput};
use crate::resources::LimitReport;

/// Shared across workers
pub struct AppState {
    pub sandbox: Sandbox,
    pub auth: Option<BasicAuth>,
}

// ============ API Types ============

#[derive(Debug, Serialize, Deserialize)]
pub struct RunRequest {
    /// Source defining `run`
    pub code: String,
    /// Positional arguments for `run`
    pub args: Vec<Value>,
}

#[derive(Debug, Serialize)]
pub struct ErrorBody {
    pub detail: String,
    pub kind: ErrorKind,
    #[serde(flatten)]
    pub output: Option<ExecutionOutput>,
}

#[derive(Debug, Serialize)]
struct DetailBody {
    detail: String,
}

/// Register routes and the request-body error handler
pub fn configure(cfg: &mut web::ServiceConfig) {
    let json = web::JsonConfig::default().error_handler(|err, _req| {
        let response = HttpResponse::UnprocessableEntity().json(DetailBody {
            detail: err.to_string(),
        });
        InternalError::from_response(err, response).into()
    });

    cfg.app_data(json)
        .route("/run", web::post().to(run_code))
        .route("/health", web::get().to(health_check));
}

/// Status code the caller sees for each failure kind
pub fn status_for(kind: ErrorKind) -> StatusCode {
    match kind {
        ErrorKind::Encoding | ErrorKind::Definition | ErrorKind::UserCodeFault => {
            StatusCode::BAD_REQUEST
        }
        ErrorKind::TimeoutExceeded => StatusCode::REQUEST_TIMEOUT,
        ErrorKind::ResourceLimitExceeded => StatusCode::UNPROCESSABLE_ENTITY,
        ErrorKind::ProcessFault | ErrorKind::Configuration => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

fn error_response(err: ExecutionError) -> HttpResponse {
    HttpResponse::build(status_for(err.kind)).json(ErrorBody {
        detail: err.message,
        kind: err.kind,
        output: err.output,
    })
}

// ============ Handlers ============

async fn run_code(state: web::Data<AppState>, payload: web::Json<RunRequest>) -> HttpResponse {
    info!("Received code execution request");
    let RunRequest { code, args } = payload.into_inner();

    let worker_state = state.clone();
    let outcome = web::block(move || worker_state.sandbox.execute(&code, &args)).await;

    match outcome {
        Ok(Ok(output)) => {
            info!("Execution finished with code {}", output.exit_code);
            HttpResponse::Ok().json(output)
        }
        Ok(Err(err)) => {
            warn!("Execution error: {}", err);
            error_response(err)
        }
        Err(e) => {
            error!("Unhandled exception during /run: {}", e);
            error_response(ExecutionError::new(ErrorKind::ProcessFault, e.to_string()))
        }
    }
}

async fn health_check(state: web::Data<AppState>) -> impl Responder {
    let limits = state.sandbox.limits();
    HttpResponse::Ok().json(serde_json::json!({
        "status": "healthy",
        "service": env!("CARGO_PKG_NAME"),
        "version": env!("CARGO_PKG_VERSION"),
        "limits": {
            "cpu_seconds": limits.cpu_seconds,
            "memory_megabytes": limits.memory_megabytes,
            "wall_clock_seconds": limits.wall_clock_seconds,
        },
        "enforcement": LimitReport::platform(),
    }))
}

// ============ Authentication ============

/// Why a request failed Basic authentication
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum AuthFailure {
    Missing,
    Invalid,
}

impl AuthFailure {
    fn detail(&self) -> &'static str {
        match self {
            AuthFailure::Missing => "Unauthorized",
            AuthFailure::Invalid => "Invalid basic auth",
        }
    }
}

fn check_credentials(header: Option<&str>, expected: &BasicAuth) -> Result<(), AuthFailure> {
    let encoded = header
        .and_then(|value| value.strip_prefix("Basic "))
        .ok_or(AuthFailure::Missing)?;

    let decoded = STANDARD
        .decode(encoded.trim())
        .map_err(|_| AuthFailure::Invalid)?;
    let decoded = String::from_utf8(decoded).map_err(|_| AuthFailure::Invalid)?;
    let (user, password) = decoded.split_once(':').ok_or(AuthFailure::Invalid)?;

    if user == expected.user && password == expected.password {
        Ok(())
    } else {
        Err(AuthFailure::Invalid)
    }
}

/// Reject requests without valid Basic credentials when auth is configured
pub async fn require_basic_auth<B>(
    req: ServiceRequest,
    next: Next<B>,
) -> Result<ServiceResponse<EitherBody<B>>, Error>
where
    B: MessageBody + 'static,
{
    let expected = req
        .app_data::<web::Data<AppState>>()
        .and_then(|state| state.auth.clone());

    let Some(expected) = expected else {
        return next.call(req).await.map(ServiceResponse::map_into_left_body);
    };

    let header = req
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok());

    match check_credentials(header, &expected) {
        Ok(()) => next.call(req).await.map(ServiceResponse::map_into_left_body),
        Err(failure) => {
            warn!("Unauthorized access attempt on {}", req.path());
            let response = HttpResponse::Unauthorized()
                .json(DetailBody {
                    detail: failure.detail().to_string(),
                })
                .map_into_right_body();
            Ok(req.into_response(response))
        }
    }
}

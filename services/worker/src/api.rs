//! HTTP surface for job submission and result retrieval.

use crate::config::ApiConfig;
use crate::service::{JobResult, MeasurementService, ServiceError, SubmitRequest};
use anyhow::{Context, Result};
use axum::{
    async_trait,
    extract::{FromRequestParts, Path, State},
    http::{request::Parts, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use measure_queue::{JobId, JobStatus};
use measure_storage::{ImageAsset, PredictionResult, Principal};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{error, info, instrument};
use uuid::Uuid;

pub const PRINCIPAL_ID_HEADER: &str = "x-principal-id";
pub const PRINCIPAL_NAME_HEADER: &str = "x-principal-name";

/// Application state shared across handlers
#[derive(Clone)]
pub struct AppState {
    pub service: Arc<MeasurementService>,
}

/// Error response
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
    pub code: String,
}

type ApiError = (StatusCode, Json<ErrorResponse>);

fn api_error(status: StatusCode, code: &str, error: impl Into<String>) -> ApiError {
    (
        status,
        Json(ErrorResponse {
            error: error.into(),
            code: code.to_string(),
        }),
    )
}

fn service_error(err: ServiceError) -> ApiError {
    match err {
        ServiceError::InvalidRequest(message) => {
            api_error(StatusCode::BAD_REQUEST, "invalid_request", message)
        }
        other => {
            error!(error = %other, "Request failed");
            api_error(StatusCode::INTERNAL_SERVER_ERROR, "internal_error", other.to_string())
        }
    }
}

#[async_trait]
impl FromRequestParts<AppState> for AuthenticatedPrincipal {
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, _state: &AppState) -> Result<Self, Self::Rejection> {
        let header = |name: &str| {
            parts
                .headers
                .get(name)
                .and_then(|v| v.to_str().ok())
                .map(str::trim)
                .filter(|v| !v.is_empty())
        };
        let unauthorized = |msg: &str| api_error(StatusCode::UNAUTHORIZED, "unauthorized", msg);

        let id = header(PRINCIPAL_ID_HEADER)
            .ok_or_else(|| unauthorized("missing principal id"))?
            .parse::<Uuid>()
            .map_err(|_| unauthorized("principal id is not a UUID"))?;
        let username = header(PRINCIPAL_NAME_HEADER)
            .ok_or_else(|| unauthorized("missing principal name"))?
            .to_string();

        Ok(AuthenticatedPrincipal(Principal { id, username }))
    }
}

/// Principal validated from request headers
pub struct AuthenticatedPrincipal(pub Principal);

#[derive(Debug, Deserialize)]
pub struct SubmitBody {
    /// Base64-encoded image bytes
    pub image: String,
    pub content_type: Option<String>,
    pub conf: Option<f64>,
    pub iou: Option<f64>,
    pub target_radius: Option<f64>,
    pub unit: Option<String>,
}

impl SubmitBody {
    fn into_request(self) -> Result<SubmitRequest, ApiError> {
        let image = STANDARD
            .decode(self.image.trim())
            .map_err(|e| api_error(StatusCode::BAD_REQUEST, "invalid_request", format!("image is not base64: {e}")))?;
        let content_type = self.content_type.unwrap_or_else(|| {
            image::guess_format(&image)
                .map(|f| f.to_mime_type().to_string())
                .unwrap_or_else(|_| "application/octet-stream".to_string())
        });
        Ok(SubmitRequest {
            conf: self.conf,
            iou: self.iou,
            target_radius: self.target_radius,
            unit: self.unit,
            ..SubmitRequest::new(image, content_type)
        })
    }
}

#[derive(Debug, Serialize)]
pub struct JobStatusResponse {
    pub job_id: String,
    pub status: JobStatus,
}

fn result_response(job_id: &JobId, result: JobResult) -> Response {
    match result {
        JobResult::Ready(payload) => (StatusCode::OK, Json(payload)).into_response(),
        JobResult::NotReady(status) => (
            StatusCode::ACCEPTED,
            Json(JobStatusResponse {
                job_id: job_id.to_string(),
                status,
            }),
        )
            .into_response(),
        JobResult::Failed(failure) => api_error(
            StatusCode::UNPROCESSABLE_ENTITY,
            failure.kind.as_str(),
            failure.message,
        )
        .into_response(),
        JobResult::Unknown => api_error(
            StatusCode::NOT_FOUND,
            "unknown_job",
            format!("no result for job {job_id}"),
        )
        .into_response(),
    }
}

/// Create the API router
pub fn create_router(state: AppState, config: &ApiConfig) -> Router {
    let cors = if config.cors_enabled {
        if config.cors_origins.is_empty() {
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any)
        } else {
            let origins: Vec<_> = config
                .cors_origins
                .iter()
                .filter_map(|o| o.parse().ok())
                .collect();
            CorsLayer::new()
                .allow_origin(origins)
                .allow_methods(Any)
                .allow_headers(Any)
        }
    } else {
        CorsLayer::new()
    };

    Router::new()
        .route("/health", get(health_check))
        .route("/api/v1/jobs", post(submit_job))
        .route("/api/v1/jobs/eager", post(submit_job_eager))
        .route("/api/v1/jobs/:job_id", get(job_status))
        .route("/api/v1/jobs/:job_id/result", get(job_result))
        .route("/api/v1/predictions", get(list_predictions))
        .route("/api/v1/images", get(list_images))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}

/// Health check endpoint
async fn health_check() -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "healthy",
        "service": "measure-worker"
    }))
}

#[instrument(skip_all, fields(owner = %principal.id))]
async fn submit_job(
    State(state): State<AppState>,
    AuthenticatedPrincipal(principal): AuthenticatedPrincipal,
    Json(body): Json<SubmitBody>,
) -> Result<(StatusCode, Json<serde_json::Value>), ApiError> {
    let job_id = state
        .service
        .submit(&principal, body.into_request()?)
        .await
        .map_err(service_error)?;
    Ok((
        StatusCode::ACCEPTED,
        Json(serde_json::json!({ "job_id": job_id })),
    ))
}

#[instrument(skip_all, fields(owner = %principal.id))]
async fn submit_job_eager(
    State(state): State<AppState>,
    AuthenticatedPrincipal(principal): AuthenticatedPrincipal,
    Json(body): Json<SubmitBody>,
) -> Result<Response, ApiError> {
    let (job_id, result) = state
        .service
        .submit_and_wait(&principal, body.into_request()?)
        .await
        .map_err(service_error)?;
    Ok(result_response(&job_id, result))
}

async fn job_status(
    State(state): State<AppState>,
    _principal: AuthenticatedPrincipal,
    Path(job_id): Path<String>,
) -> Result<Json<JobStatusResponse>, ApiError> {
    let job_id = JobId::from(job_id);
    let status = state.service.poll(&job_id).await.map_err(service_error)?;
    Ok(Json(JobStatusResponse {
        job_id: job_id.to_string(),
        status,
    }))
}

async fn job_result(
    State(state): State<AppState>,
    _principal: AuthenticatedPrincipal,
    Path(job_id): Path<String>,
) -> Result<Response, ApiError> {
    let job_id = JobId::from(job_id);
    let result = state.service.fetch(&job_id).await.map_err(service_error)?;
    Ok(result_response(&job_id, result))
}

async fn list_predictions(
    State(state): State<AppState>,
    AuthenticatedPrincipal(principal): AuthenticatedPrincipal,
) -> Result<Json<Vec<PredictionResult>>, ApiError> {
    state
        .service
        .history(&principal)
        .await
        .map(Json)
        .map_err(service_error)
}

async fn list_images(
    State(state): State<AppState>,
    AuthenticatedPrincipal(principal): AuthenticatedPrincipal,
) -> Result<Json<Vec<ImageAsset>>, ApiError> {
    state
        .service
        .images(&principal)
        .await
        .map(Json)
        .map_err(service_error)
}

/// Start the API server
pub async fn start_api_server(state: AppState, config: &ApiConfig) -> Result<()> {
    let router = create_router(state, config);
    let addr = format!("{}:{}", config.host, config.port);

    info!(address = %addr, "Starting measurement API server");

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .context("Failed to bind to address")?;

    axum::serve(listener, router)
        .await
        .context("API server error")?;

    Ok(())
}

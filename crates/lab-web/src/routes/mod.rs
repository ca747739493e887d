//! API routes for lab-web

use crate::AppState;
use crate::sse::event_stream;
use axum::{
    Json, Router,
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response, sse::Sse},
    routing::{delete, get, post},
};
use lab_core::{
    DiagnoseError, HealthSnapshot, LifecycleError, ServiceAction, SessionInfo, StackContext,
    StackStatusView, StartedTurn,
};
use lab_proto::{BackendError, LogLine, ServiceStatus};
use serde::{Deserialize, Serialize};

/// Health check response
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
}

/// Error response
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
}

/// Acknowledgement of an accepted operation
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusResponse {
    pub status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
}

impl StatusResponse {
    fn new(status: &str) -> Json<Self> {
        Json(Self {
            status: status.to_string(),
            session_id: None,
        })
    }
}

type ApiError = (StatusCode, Json<ErrorResponse>);

fn api_error(status: StatusCode, error: impl ToString) -> ApiError {
    (
        status,
        Json(ErrorResponse {
            error: error.to_string(),
        }),
    )
}

fn backend_status(e: &BackendError) -> StatusCode {
    match e {
        BackendError::ServiceNotFound(_) => StatusCode::NOT_FOUND,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

fn lifecycle_error(e: LifecycleError) -> ApiError {
    let status = match &e {
        LifecycleError::Conflict(_) => StatusCode::CONFLICT,
        LifecycleError::InvalidAction(_) => StatusCode::BAD_REQUEST,
        LifecycleError::Backend(e) => backend_status(e),
    };
    api_error(status, e)
}

fn diagnose_error(e: DiagnoseError) -> ApiError {
    let status = match &e {
        DiagnoseError::InvalidInput(_) | DiagnoseError::UnknownProvider(_) => {
            StatusCode::BAD_REQUEST
        }
        DiagnoseError::SessionNotFound(_) | DiagnoseError::ServiceNotFound(_) => {
            StatusCode::NOT_FOUND
        }
        DiagnoseError::Unavailable(_) | DiagnoseError::StartTimeout(_) => {
            StatusCode::SERVICE_UNAVAILABLE
        }
        DiagnoseError::Provider(_) => StatusCode::INTERNAL_SERVER_ERROR,
    };
    api_error(status, e)
}

fn find_stack(state: &AppState, name: &str) -> Result<StackContext, ApiError> {
    state
        .stacks
        .get(name)
        .cloned()
        .ok_or_else(|| api_error(StatusCode::NOT_FOUND, format!("Stack not found: {}", name)))
}

/// Server liveness
async fn health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

/// Names of the managed stacks
async fn list_stacks(State(state): State<AppState>) -> Json<Vec<String>> {
    Json(state.stacks.names())
}

// ==================== Lifecycle Endpoints ====================

async fn stack_status(
    State(state): State<AppState>,
    Path(stack): Path<String>,
) -> Result<Json<StackStatusView>, ApiError> {
    let stack = find_stack(&state, &stack)?;
    Ok(Json(stack.controller().status().await))
}

async fn stack_up(
    State(state): State<AppState>,
    Path(stack): Path<String>,
) -> Result<Json<StatusResponse>, ApiError> {
    let stack = find_stack(&state, &stack)?;
    stack.controller().up().await.map_err(lifecycle_error)?;
    Ok(StatusResponse::new("starting"))
}

async fn stack_down(
    State(state): State<AppState>,
    Path(stack): Path<String>,
) -> Result<Json<StatusResponse>, ApiError> {
    let stack = find_stack(&state, &stack)?;
    stack.controller().down().map_err(lifecycle_error)?;
    Ok(StatusResponse::new("stopping"))
}

async fn stack_restart(
    State(state): State<AppState>,
    Path(stack): Path<String>,
) -> Result<Json<StatusResponse>, ApiError> {
    let stack = find_stack(&state, &stack)?;
    stack.controller().restart().map_err(lifecycle_error)?;
    Ok(StatusResponse::new("stopping"))
}

async fn stack_cancel(
    State(state): State<AppState>,
    Path(stack): Path<String>,
) -> Result<Json<StatusResponse>, ApiError> {
    let stack = find_stack(&state, &stack)?;
    stack.controller().cancel().map_err(lifecycle_error)?;
    Ok(StatusResponse::new("stopping"))
}

// ==================== Service Endpoints ====================

async fn list_services(
    State(state): State<AppState>,
    Path(stack): Path<String>,
) -> Result<Json<Vec<ServiceStatus>>, ApiError> {
    let stack = find_stack(&state, &stack)?;
    stack
        .services()
        .await
        .map(Json)
        .map_err(|e| api_error(StatusCode::INTERNAL_SERVER_ERROR, e))
}

async fn service_action(
    State(state): State<AppState>,
    Path((stack, service, action)): Path<(String, String, String)>,
) -> Result<Json<StatusResponse>, ApiError> {
    let stack = find_stack(&state, &stack)?;
    let action: ServiceAction = action.parse().map_err(lifecycle_error)?;
    stack
        .controller()
        .service_action(&service, action)
        .await
        .map_err(lifecycle_error)?;
    Ok(StatusResponse::new("ok"))
}

async fn service_health(
    State(state): State<AppState>,
    Path(stack): Path<String>,
) -> Result<Json<HealthSnapshot>, ApiError> {
    let stack = find_stack(&state, &stack)?;
    Ok(Json(stack.health().snapshot()))
}

/// Query parameters for log history
#[derive(Debug, Deserialize)]
pub struct LogsQuery {
    pub service: Option<String>,
    pub limit: Option<usize>,
}

async fn log_history(
    State(state): State<AppState>,
    Path(stack): Path<String>,
    Query(query): Query<LogsQuery>,
) -> Result<Json<Vec<LogLine>>, ApiError> {
    let stack = find_stack(&state, &stack)?;
    Ok(Json(stack.log_history(query.service.as_deref(), query.limit)))
}

// ==================== Diagnosis Endpoints ====================

/// Request body for starting a diagnosis
#[derive(Debug, Deserialize)]
pub struct StartDiagnosisRequest {
    #[serde(default)]
    pub service: String,
    pub provider: Option<String>,
}

/// Request body for a follow-up prompt
#[derive(Debug, Deserialize)]
pub struct MessageRequest {
    #[serde(default, alias = "prompt")]
    pub message: String,
}

async fn start_diagnosis(
    State(state): State<AppState>,
    Path(stack): Path<String>,
    Json(req): Json<StartDiagnosisRequest>,
) -> Result<(StatusCode, Json<StartedTurn>), ApiError> {
    let stack = find_stack(&state, &stack)?;
    let started = stack
        .start_diagnosis(&req.service, req.provider.as_deref())
        .await
        .map_err(diagnose_error)?;
    Ok((StatusCode::ACCEPTED, Json(started)))
}

async fn list_diagnoses(
    State(state): State<AppState>,
    Path(stack): Path<String>,
) -> Result<Json<Vec<SessionInfo>>, ApiError> {
    let stack = find_stack(&state, &stack)?;
    Ok(Json(stack.diagnose().list()))
}

async fn diagnosis_message(
    State(state): State<AppState>,
    Path((stack, session_id)): Path<(String, String)>,
    Json(req): Json<MessageRequest>,
) -> Result<(StatusCode, Json<StartedTurn>), ApiError> {
    let stack = find_stack(&state, &stack)?;
    let started = stack
        .diagnose()
        .message(&session_id, &req.message)
        .map_err(diagnose_error)?;
    Ok((StatusCode::ACCEPTED, Json(started)))
}

async fn interrupt_diagnosis(
    State(state): State<AppState>,
    Path((stack, session_id)): Path<(String, String)>,
) -> Result<(StatusCode, Json<StatusResponse>), ApiError> {
    let stack = find_stack(&state, &stack)?;
    stack
        .diagnose()
        .interrupt(&session_id)
        .map_err(diagnose_error)?;
    Ok((StatusCode::ACCEPTED, StatusResponse::new("interrupted")))
}

async fn close_diagnosis(
    State(state): State<AppState>,
    Path((stack, session_id)): Path<(String, String)>,
) -> Result<Json<StatusResponse>, ApiError> {
    let stack = find_stack(&state, &stack)?;
    stack
        .diagnose()
        .close(&session_id)
        .await
        .map_err(diagnose_error)?;
    Ok(Json(StatusResponse {
        status: "closed".to_string(),
        session_id: Some(session_id),
    }))
}

// ==================== Push Events ====================

async fn stack_events(
    State(state): State<AppState>,
    Path(stack): Path<String>,
) -> Result<Response, ApiError> {
    let stack = find_stack(&state, &stack)?;
    Ok(Sse::new(event_stream(stack.hub())).into_response())
}

pub fn api_routes(state: AppState) -> Router {
    Router::new()
        .route("/api/health", get(health))
        .route("/api/stacks", get(list_stacks))
        // Lifecycle
        .route("/api/stacks/{stack}/status", get(stack_status))
        .route("/api/stacks/{stack}/up", post(stack_up))
        .route("/api/stacks/{stack}/down", post(stack_down))
        .route("/api/stacks/{stack}/restart", post(stack_restart))
        .route("/api/stacks/{stack}/cancel", post(stack_cancel))
        // Services
        .route("/api/stacks/{stack}/services", get(list_services))
        .route(
            "/api/stacks/{stack}/services/{service}/{action}",
            post(service_action),
        )
        .route("/api/stacks/{stack}/health", get(service_health))
        .route("/api/stacks/{stack}/logs", get(log_history))
        // Diagnosis
        .route(
            "/api/stacks/{stack}/diagnose",
            get(list_diagnoses).post(start_diagnosis),
        )
        .route(
            "/api/stacks/{stack}/diagnose/{id}/message",
            post(diagnosis_message),
        )
        .route(
            "/api/stacks/{stack}/diagnose/{id}/interrupt",
            post(interrupt_diagnosis),
        )
        .route("/api/stacks/{stack}/diagnose/{id}", delete(close_diagnosis))
        // Push events
        .route("/api/stacks/{stack}/events", get(stack_events))
        .with_state(state)
}

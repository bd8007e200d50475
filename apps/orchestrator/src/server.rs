use axum::{
    Json, Router,
    body::Bytes,
    extract::{Path, State},
    http::{HeaderMap, StatusCode, header},
    response::IntoResponse,
    routing::{get, post},
};
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::{Value, json};

use crate::{
    config::Config,
    orchestrator::{
        run_token::{constant_time_eq, hash_run_token},
        service::{OrchestratorError, OrchestratorService},
        types::{CreditWalletRequest, RunCredentials, RunFinishedRequest, RunHeartbeatRequest},
    },
};

#[derive(Clone)]
pub struct AppState {
    config: Config,
    service: OrchestratorService,
    started_at: DateTime<Utc>,
}

impl AppState {
    #[must_use]
    pub fn new(config: Config, service: OrchestratorService) -> Self {
        Self {
            config,
            service,
            started_at: Utc::now(),
        }
    }

    #[must_use]
    pub fn service(&self) -> &OrchestratorService {
        &self.service
    }

    #[must_use]
    pub fn config(&self) -> &Config {
        &self.config
    }
}

#[derive(Debug, Serialize)]
struct HealthResponse {
    status: &'static str,
    service: String,
    uptime_seconds: i64,
}

#[derive(Debug, Serialize)]
struct ReadinessResponse {
    status: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    active_runs: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    reason: Option<String>,
}

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/healthz", get(health))
        .route("/readyz", get(readiness))
        .route("/runStarted", post(run_started))
        .route("/runHeartbeat", post(run_heartbeat))
        .route("/runFinished", post(run_finished))
        .route(
            "/internal/v1/projects/:project_id/start",
            post(start_project_run),
        )
        .route(
            "/internal/v1/projects/:project_id/credits",
            post(credit_project_wallet),
        )
        .with_state(state)
}

async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    let uptime_seconds = (Utc::now() - state.started_at).num_seconds();
    Json(HealthResponse {
        status: "ok",
        service: state.config.service_name,
        uptime_seconds,
    })
}

async fn readiness(State(state): State<AppState>) -> impl IntoResponse {
    match state.service.readiness().await {
        Ok(active_runs) => (
            StatusCode::OK,
            Json(ReadinessResponse {
                status: "ready",
                active_runs: Some(active_runs),
                reason: None,
            }),
        ),
        Err(error) => {
            tracing::warn!(code = error.code(), reason = %error.message(), "readiness check failed");
            (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(ReadinessResponse {
                    status: "not_ready",
                    active_runs: None,
                    reason: Some(error.code().to_string()),
                }),
            )
        }
    }
}

async fn run_started(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<Value>, ApiError> {
    let body = parse_json_body(&body)?;
    let now = Utc::now();
    let auth = state
        .service
        .authorize_run(&run_credentials(&headers, &body), now)
        .await?;
    let run = state.service.run_started(&auth, now).await?;
    Ok(Json(json!({
        "ok": true,
        "runId": run.run_id,
        "status": run.status.as_str(),
    })))
}

async fn run_heartbeat(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<Value>, ApiError> {
    let body = parse_json_body(&body)?;
    let now = Utc::now();
    let auth = state
        .service
        .authorize_run(&run_credentials(&headers, &body), now)
        .await?;
    // Non-string fields are treated as absent.
    let request = RunHeartbeatRequest {
        phase: body_string(&body, "phase"),
        message: body_string(&body, "message"),
    };
    state.service.run_heartbeat(&auth, request, now).await?;
    Ok(Json(json!({ "ok": true })))
}

async fn run_finished(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<Value>, ApiError> {
    let body = parse_json_body(&body)?;
    let now = Utc::now();
    let auth = state
        .service
        .authorize_run(&run_credentials(&headers, &body), now)
        .await?;
    let request = serde_json::from_value::<RunFinishedRequest>(body)
        .map_err(|error| ApiError::invalid_payload(error.to_string()))?;
    let response = state
        .service
        .run_finished(&auth, request, now)
        .await
        .map_err(|error| match error {
            OrchestratorError::InvalidRequest(message) => ApiError::invalid_payload(message),
            other => ApiError::Orchestrator(other),
        })?;
    Ok(Json(json!({
        "ok": true,
        "applied": response.applied,
        "chargedCents": response.charged_cents,
        "continuation": response.continuation,
    })))
}

async fn start_project_run(
    State(state): State<AppState>,
    Path(project_id): Path<String>,
    headers: HeaderMap,
) -> Result<Json<Value>, ApiError> {
    require_admin(&state, &headers)?;
    let result = state.service.maybe_start_run(&project_id).await?;
    let mut payload = serde_json::to_value(&result)
        .map_err(|error| ApiError::Orchestrator(OrchestratorError::Internal(error.to_string())))?;
    payload["defaults"] = json!({
        "githubOrgName": state.config.github.org_name,
        "agentRuntime": state.service.policy().agent_runtime,
    });
    Ok(Json(payload))
}

async fn credit_project_wallet(
    State(state): State<AppState>,
    Path(project_id): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<Value>, ApiError> {
    require_admin(&state, &headers)?;
    let body = parse_json_body(&body)?;
    let request = serde_json::from_value::<CreditWalletRequest>(body)
        .map_err(|error| ApiError::invalid_payload(error.to_string()))?;
    let result = state.service.credit_wallet(&project_id, request).await?;
    let payload = serde_json::to_value(&result)
        .map_err(|error| ApiError::Orchestrator(OrchestratorError::Internal(error.to_string())))?;
    Ok(Json(payload))
}

/// Empty bodies read as `{}`; anything else must be a JSON object.
fn parse_json_body(body: &Bytes) -> Result<Value, ApiError> {
    if body.iter().all(u8::is_ascii_whitespace) {
        return Ok(json!({}));
    }
    match serde_json::from_slice::<Value>(body) {
        Ok(value @ Value::Object(_)) => Ok(value),
        Ok(_) => Err(ApiError::invalid_payload(
            "request body must be a JSON object".to_string(),
        )),
        Err(error) => Err(ApiError::invalid_payload(error.to_string())),
    }
}

fn body_string(body: &Value, key: &str) -> Option<String> {
    body.get(key).and_then(Value::as_str).map(str::to_string)
}

fn bearer_token_from_headers(headers: &HeaderMap) -> Option<String> {
    let raw = headers.get(header::AUTHORIZATION)?.to_str().ok()?.trim();
    let (scheme, token) = raw.split_once(char::is_whitespace)?;
    if !scheme.eq_ignore_ascii_case("bearer") {
        return None;
    }
    let token = token.trim();
    (!token.is_empty()).then(|| token.to_string())
}

/// The bearer header wins over a `runToken` body field.
fn run_credentials(headers: &HeaderMap, body: &Value) -> RunCredentials {
    RunCredentials {
        project_id: body_string(body, "projectId").unwrap_or_default(),
        run_id: body_string(body, "runId").unwrap_or_default(),
        run_token: bearer_token_from_headers(headers)
            .or_else(|| body_string(body, "runToken"))
            .unwrap_or_default(),
    }
}

fn require_admin(state: &AppState, headers: &HeaderMap) -> Result<(), ApiError> {
    let Some(expected) = state.config.admin_token.as_deref() else {
        return Err(ApiError::Orchestrator(OrchestratorError::Unauthorized(
            "admin token is not configured".to_string(),
        )));
    };
    let presented = bearer_token_from_headers(headers).unwrap_or_default();
    // Hashing first keeps the comparison independent of the presented length.
    if constant_time_eq(
        hash_run_token(expected).as_bytes(),
        hash_run_token(&presented).as_bytes(),
    ) {
        Ok(())
    } else {
        Err(ApiError::Orchestrator(OrchestratorError::Unauthorized(
            "invalid admin token".to_string(),
        )))
    }
}

#[derive(Debug)]
enum ApiError {
    Orchestrator(OrchestratorError),
    InvalidPayload { details: Vec<String> },
}

impl ApiError {
    fn invalid_payload(detail: String) -> Self {
        Self::InvalidPayload {
            details: vec![detail],
        }
    }
}

impl From<OrchestratorError> for ApiError {
    fn from(error: OrchestratorError) -> Self {
        Self::Orchestrator(error)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> axum::response::Response {
        match self {
            Self::InvalidPayload { details } => (
                StatusCode::BAD_REQUEST,
                Json(json!({
                    "error": "invalid_request",
                    "message": "Invalid request payload",
                    "details": details,
                })),
            )
                .into_response(),
            Self::Orchestrator(error) => {
                let status = match &error {
                    OrchestratorError::InvalidRequest(_) => StatusCode::BAD_REQUEST,
                    OrchestratorError::Unauthorized(_) => StatusCode::UNAUTHORIZED,
                    OrchestratorError::NotFound(_) => StatusCode::NOT_FOUND,
                    OrchestratorError::Conflict(_) => StatusCode::CONFLICT,
                    OrchestratorError::DependencyUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
                    OrchestratorError::SchemaNotProvisioned(_) | OrchestratorError::Internal(_) => {
                        StatusCode::INTERNAL_SERVER_ERROR
                    }
                };
                if status.is_server_error() {
                    tracing::error!(code = error.code(), reason = %error.message(), "request failed");
                }
                (
                    status,
                    Json(json!({
                        "error": error.code(),
                        "message": error.message(),
                    })),
                )
                    .into_response()
            }
        }
    }
}

//! JSON API over the runner and the tool federation registry.

use std::sync::Arc;

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{delete, get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use uuid::Uuid;

use steward_agent::{
    AgentError, InvokeOutput, NormalizedMessage, ProbeReport, Runner, ToolFederationRegistry,
};
use steward_core::errors::{ApplicationError, InterfaceError, ToolError};
use steward_db::ThreadSummary;

#[derive(Clone)]
pub struct ApiState {
    runner: Arc<Runner>,
    registry: Arc<ToolFederationRegistry>,
    shutdown: CancellationToken,
}

impl ApiState {
    pub fn new(
        runner: Arc<Runner>,
        registry: Arc<ToolFederationRegistry>,
        shutdown: CancellationToken,
    ) -> Self {
        Self { runner, registry, shutdown }
    }
}

pub fn router(state: ApiState) -> Router {
    Router::new()
        .route("/api/threads", get(list_threads))
        .route("/api/threads/{thread_id}", delete(delete_thread))
        .route("/api/threads/{thread_id}/messages", post(post_message))
        .route("/api/threads/{thread_id}/history", get(thread_history))
        .route("/api/tools", get(list_tools))
        .route("/api/tools/{name}/call", post(call_tool))
        .with_state(state)
}

#[derive(Debug, Deserialize)]
pub struct PostMessageRequest {
    #[serde(alias = "input", alias = "text")]
    pub content: String,
}

#[derive(Debug, Serialize)]
pub struct HistoryResponse {
    pub thread_id: String,
    pub messages: Vec<NormalizedMessage>,
}

#[derive(Debug, Serialize)]
pub struct ErrorBody {
    pub error: String,
    pub correlation_id: String,
}

/// Error response; the body never carries internal detail.
#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    body: ErrorBody,
}

impl ApiError {
    fn bad_request(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            body: ErrorBody { error: message.into(), correlation_id: new_correlation_id() },
        }
    }
}

impl From<InterfaceError> for ApiError {
    fn from(value: InterfaceError) -> Self {
        let status = match value {
            InterfaceError::BadRequest { .. } => StatusCode::BAD_REQUEST,
            InterfaceError::ServiceUnavailable { .. } => StatusCode::SERVICE_UNAVAILABLE,
            InterfaceError::Internal { .. } => StatusCode::INTERNAL_SERVER_ERROR,
        };
        Self {
            status,
            body: ErrorBody {
                error: value.user_message().to_string(),
                correlation_id: value.correlation_id().to_string(),
            },
        }
    }
}

impl From<AgentError> for ApiError {
    fn from(value: AgentError) -> Self {
        let correlation_id = new_correlation_id();
        error!(
            event_name = "api.turn_failed",
            correlation_id = %correlation_id,
            error = %value,
            "request failed in the agent runtime"
        );
        ApplicationError::from(value).into_interface(correlation_id).into()
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(self.body)).into_response()
    }
}

fn new_correlation_id() -> String {
    Uuid::new_v4().to_string()
}

pub async fn post_message(
    Path(thread_id): Path<String>,
    State(state): State<ApiState>,
    Json(request): Json<PostMessageRequest>,
) -> Result<Json<InvokeOutput>, ApiError> {
    if request.content.trim().is_empty() {
        return Err(ApiError::bad_request("message content must not be empty"));
    }
    info!(event_name = "api.message_received", thread_id = %thread_id, "invoking agent");

    let output = state
        .runner
        .invoke_with_cancel(&request.content, &thread_id, state.shutdown.child_token())
        .await?;
    Ok(Json(output))
}

pub async fn thread_history(
    Path(thread_id): Path<String>,
    State(state): State<ApiState>,
) -> Result<Json<HistoryResponse>, ApiError> {
    let messages = state.runner.history(&thread_id).await?;
    Ok(Json(HistoryResponse { thread_id, messages }))
}

pub async fn list_threads(
    State(state): State<ApiState>,
) -> Result<Json<Vec<ThreadSummary>>, ApiError> {
    Ok(Json(state.runner.threads().await?))
}

pub async fn delete_thread(
    Path(thread_id): Path<String>,
    State(state): State<ApiState>,
) -> Result<StatusCode, ApiError> {
    state.runner.delete_thread(&thread_id).await?;
    Ok(StatusCode::NO_CONTENT)
}

pub async fn list_tools(State(state): State<ApiState>) -> Json<ProbeReport> {
    Json(state.registry.probe().await)
}

/// Calls one federated tool directly. Tool failures are reported with the failure text since
/// they come from the tool, not from this service.
pub async fn call_tool(
    Path(name): Path<String>,
    State(state): State<ApiState>,
    body: Option<Json<Value>>,
) -> Response {
    let args = body.map(|Json(args)| args).unwrap_or_else(|| json!({}));
    match state.registry.call_tool(&name, args).await {
        Ok(result) => (StatusCode::OK, Json(json!({ "tool": name, "result": result }))).into_response(),
        Err(error) => {
            warn!(event_name = "api.tool_call_failed", tool = %name, error = %error, "direct tool call failed");
            let status = match error {
                ToolError::NotFound(_) => StatusCode::NOT_FOUND,
                ToolError::Timeout { .. } => StatusCode::GATEWAY_TIMEOUT,
                ToolError::Execution { .. } | ToolError::Connection { .. } => StatusCode::BAD_GATEWAY,
            };
            (status, Json(json!({ "tool": name, "error": error.to_string() }))).into_response()
        }
    }
}

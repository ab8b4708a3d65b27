use std::sync::Arc;

use axum::extract::{Query, State};
use axum::http::{HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use mcp_studio_error::{ErrorType, ProblemDetails, StudioError};
use mcp_studio_output::OutputEvent;
use serde::{Deserialize, Serialize};
use tower_http::cors::{AllowOrigin, Any, CorsLayer};
use tower_http::trace::TraceLayer;
use utoipa::{IntoParams, OpenApi, ToSchema};

use crate::artifacts::{AgentRecord, SaveAgent};
use crate::process::InputOutcome;
use crate::runtime::{StopOutcome, StudioRuntime};
use crate::stream::{sse_error, sse_response};

const QUEUED_WARNING: &str = "Input buffer full, message may be delayed";

#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct HealthResponse {
    pub status: String,
}

#[derive(Debug, Default, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct AgentRequest {
    #[serde(default)]
    pub agent_id: Option<String>,
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct RunResponse {
    pub success: bool,
    pub message: String,
    pub agent_id: String,
}

#[derive(Debug, Default, Serialize, Deserialize, IntoParams)]
#[serde(rename_all = "camelCase")]
#[into_params(parameter_in = Query)]
pub struct StreamQuery {
    /// Agent to attach to.
    #[serde(default)]
    pub agent_id: Option<String>,
    /// Cache buster sent by browsers; ignored.
    #[serde(default)]
    pub t: Option<String>,
}

#[derive(Debug, Default, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct InputRequest {
    #[serde(default)]
    pub agent_id: Option<String>,
    #[serde(default)]
    pub input: Option<String>,
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct InputResponse {
    pub success: bool,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub warning: Option<String>,
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct StopResponse {
    pub success: bool,
    pub message: String,
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct AgentListResponse {
    pub agents: Vec<AgentRecord>,
}

#[derive(Debug, Default, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct SaveAgentRequest {
    #[serde(default)]
    pub code: Option<String>,
    #[serde(default)]
    pub agent_name: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct SaveAgentResponse {
    pub success: bool,
    pub message: String,
    pub agent: AgentRecord,
}

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error(transparent)]
    Studio(#[from] StudioError),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let problem: ProblemDetails = match &self {
            ApiError::Studio(err) => err.to_problem_details(),
        };
        let status =
            StatusCode::from_u16(problem.status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        (status, Json(problem)).into_response()
    }
}

#[derive(OpenApi)]
#[openapi(
    paths(
        get_health,
        list_agents,
        save_agent,
        run_agent,
        stream_agent,
        send_input,
        stop_agent
    ),
    components(
        schemas(
            HealthResponse,
            AgentRequest,
            RunResponse,
            InputRequest,
            InputResponse,
            StopResponse,
            AgentRecord,
            AgentListResponse,
            SaveAgentRequest,
            SaveAgentResponse,
            OutputEvent,
            ProblemDetails,
            ErrorType
        )
    ),
    tags(
        (name = "meta", description = "Service metadata"),
        (name = "agents", description = "Agent artifacts"),
        (name = "processes", description = "Running agent processes")
    )
)]
pub struct ApiDoc;

pub fn build_router(runtime: Arc<StudioRuntime>) -> Router {
    build_router_with_cors(runtime, &[])
}

/// `origins` empty allows any origin.
pub fn build_router_with_cors(runtime: Arc<StudioRuntime>, origins: &[String]) -> Router {
    let api = Router::new()
        .route("/health", get(get_health))
        .route("/openapi.json", get(get_openapi))
        .route("/agent/list", get(list_agents))
        .route("/agent/save", post(save_agent))
        .route("/agent/run", post(run_agent))
        .route("/agent/stream", get(stream_agent))
        .route("/agent/input", post(send_input))
        .route("/agent/stop", post(stop_agent))
        .with_state(runtime);

    Router::new()
        .nest("/api", api)
        .layer(cors_layer(origins))
        .layer(TraceLayer::new_for_http())
}

fn cors_layer(origins: &[String]) -> CorsLayer {
    let parsed: Vec<_> = origins
        .iter()
        .filter_map(|origin| match origin.parse::<HeaderValue>() {
            Ok(value) => Some(value),
            Err(_) => {
                tracing::warn!(origin = %origin, "ignoring invalid CORS origin");
                None
            }
        })
        .collect();
    let allow_origin = if parsed.is_empty() {
        AllowOrigin::any()
    } else {
        AllowOrigin::list(parsed)
    };
    CorsLayer::new()
        .allow_origin(allow_origin)
        .allow_methods(Any)
        .allow_headers(Any)
}

#[utoipa::path(
    get,
    path = "/api/health",
    responses((status = 200, body = HealthResponse)),
    tag = "meta"
)]
async fn get_health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
    })
}

async fn get_openapi() -> Json<utoipa::openapi::OpenApi> {
    Json(ApiDoc::openapi())
}

#[utoipa::path(
    get,
    path = "/api/agent/list",
    responses(
        (status = 200, body = AgentListResponse),
        (status = 500, body = ProblemDetails)
    ),
    tag = "agents"
)]
async fn list_agents(
    State(runtime): State<Arc<StudioRuntime>>,
) -> Result<Json<AgentListResponse>, ApiError> {
    let agents = runtime.list_agents().await?;
    Ok(Json(AgentListResponse { agents }))
}

#[utoipa::path(
    post,
    path = "/api/agent/save",
    request_body = SaveAgentRequest,
    responses(
        (status = 200, body = SaveAgentResponse),
        (status = 400, body = ProblemDetails),
        (status = 500, body = ProblemDetails)
    ),
    tag = "agents"
)]
async fn save_agent(
    State(runtime): State<Arc<StudioRuntime>>,
    Json(request): Json<SaveAgentRequest>,
) -> Result<Json<SaveAgentResponse>, ApiError> {
    let (Some(code), Some(agent_name)) = (request.code, request.agent_name) else {
        return Err(StudioError::invalid_request("Missing required fields").into());
    };
    let agent = runtime
        .save_agent(SaveAgent {
            code,
            agent_name,
            description: request.description,
        })
        .await?;
    Ok(Json(SaveAgentResponse {
        success: true,
        message: "Agent saved successfully".to_string(),
        agent,
    }))
}

#[utoipa::path(
    post,
    path = "/api/agent/run",
    request_body = AgentRequest,
    responses(
        (status = 200, body = RunResponse),
        (status = 400, body = ProblemDetails),
        (status = 404, body = ProblemDetails)
    ),
    tag = "processes"
)]
async fn run_agent(
    State(runtime): State<Arc<StudioRuntime>>,
    Json(request): Json<AgentRequest>,
) -> Result<Json<RunResponse>, ApiError> {
    let agent_id = required(request.agent_id, "Missing agent ID")?;
    runtime.run(&agent_id).await?;
    Ok(Json(RunResponse {
        success: true,
        message: "Agent process started".to_string(),
        agent_id,
    }))
}

#[utoipa::path(
    get,
    path = "/api/agent/stream",
    params(StreamQuery),
    responses(
        (status = 200, description = "SSE stream of OutputEvent frames with `: heartbeat` comments", content_type = "text/event-stream"),
        (status = 400, description = "Single `error` event, agent id missing", content_type = "text/event-stream"),
        (status = 404, description = "Single `error` event, agent not running or exited", content_type = "text/event-stream"),
        (status = 500, description = "Single `error` event, agent stdin unavailable", content_type = "text/event-stream")
    ),
    tag = "processes"
)]
async fn stream_agent(
    State(runtime): State<Arc<StudioRuntime>>,
    Query(query): Query<StreamQuery>,
) -> Response {
    let agent_id = match required(query.agent_id, "Missing agent ID") {
        Ok(agent_id) => agent_id,
        Err(err) => return sse_error(&err),
    };
    match runtime.stream(&agent_id).await {
        Ok(frames) => sse_response(frames),
        Err(err) => {
            tracing::warn!(agent_id = %agent_id, error = %err, "stream attach failed");
            sse_error(&err)
        }
    }
}

#[utoipa::path(
    post,
    path = "/api/agent/input",
    request_body = InputRequest,
    responses(
        (status = 200, body = InputResponse),
        (status = 400, body = ProblemDetails),
        (status = 404, body = ProblemDetails),
        (status = 500, body = ProblemDetails)
    ),
    tag = "processes"
)]
async fn send_input(
    State(runtime): State<Arc<StudioRuntime>>,
    Json(request): Json<InputRequest>,
) -> Result<Json<InputResponse>, ApiError> {
    // An empty input is a bare newline, e.g. Enter at a prompt.
    let (Some(agent_id), Some(input)) = (
        request.agent_id.filter(|id| !id.is_empty()),
        request.input,
    ) else {
        return Err(StudioError::invalid_request("Missing required fields").into());
    };

    let response = match runtime.send_input(&agent_id, &input).await? {
        InputOutcome::Delivered => InputResponse {
            success: true,
            message: "Input sent to agent".to_string(),
            warning: None,
        },
        InputOutcome::Queued => InputResponse {
            success: true,
            message: "Input queued for agent".to_string(),
            warning: Some(QUEUED_WARNING.to_string()),
        },
    };
    Ok(Json(response))
}

#[utoipa::path(
    post,
    path = "/api/agent/stop",
    request_body = AgentRequest,
    responses(
        (status = 200, body = StopResponse),
        (status = 400, body = ProblemDetails)
    ),
    tag = "processes"
)]
async fn stop_agent(
    State(runtime): State<Arc<StudioRuntime>>,
    Json(request): Json<AgentRequest>,
) -> Result<Json<StopResponse>, ApiError> {
    let agent_id = required(request.agent_id, "Missing agent ID")?;
    let message = match runtime.stop(&agent_id).await? {
        StopOutcome::Stopped => "Agent process stopped",
        StopOutcome::NotRunning => "Process not found or already stopped",
    };
    Ok(Json(StopResponse {
        success: true,
        message: message.to_string(),
    }))
}

fn required(value: Option<String>, message: &str) -> Result<String, StudioError> {
    value
        .filter(|value| !value.is_empty())
        .ok_or_else(|| StudioError::invalid_request(message))
}

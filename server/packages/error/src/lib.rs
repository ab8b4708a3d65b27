use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;
use utoipa::ToSchema;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum ErrorType {
    InvalidRequest,
    AgentNotFound,
    ArtifactNotFound,
    AgentProcessExited,
    ProcessInvalid,
    StdinUnavailable,
    SpawnFailed,
    Storage,
}

impl ErrorType {
    pub fn as_urn(&self) -> &'static str {
        match self {
            Self::InvalidRequest => "urn:mcp-studio:error:invalid_request",
            Self::AgentNotFound => "urn:mcp-studio:error:agent_not_found",
            Self::ArtifactNotFound => "urn:mcp-studio:error:artifact_not_found",
            Self::AgentProcessExited => "urn:mcp-studio:error:agent_process_exited",
            Self::ProcessInvalid => "urn:mcp-studio:error:process_invalid",
            Self::StdinUnavailable => "urn:mcp-studio:error:stdin_unavailable",
            Self::SpawnFailed => "urn:mcp-studio:error:spawn_failed",
            Self::Storage => "urn:mcp-studio:error:storage",
        }
    }

    pub fn title(&self) -> &'static str {
        match self {
            Self::InvalidRequest => "Invalid Request",
            Self::AgentNotFound => "Agent Not Found",
            Self::ArtifactNotFound => "Artifact Not Found",
            Self::AgentProcessExited => "Agent Process Exited",
            Self::ProcessInvalid => "Process Invalid",
            Self::StdinUnavailable => "Stdin Unavailable",
            Self::SpawnFailed => "Spawn Failed",
            Self::Storage => "Storage Error",
        }
    }

    pub fn status_code(&self) -> u16 {
        match self {
            Self::InvalidRequest => 400,
            Self::AgentNotFound => 404,
            Self::ArtifactNotFound => 404,
            // The terminal treats an exited process the same as a missing one.
            Self::AgentProcessExited => 404,
            Self::ProcessInvalid => 404,
            Self::StdinUnavailable => 500,
            Self::SpawnFailed => 500,
            Self::Storage => 500,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct ProblemDetails {
    #[serde(rename = "type")]
    pub type_: String,
    pub title: String,
    pub status: u16,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
    #[serde(flatten, default, skip_serializing_if = "Map::is_empty")]
    pub extensions: Map<String, Value>,
}

impl ProblemDetails {
    pub fn new(error_type: ErrorType, detail: Option<String>) -> Self {
        Self {
            type_: error_type.as_urn().to_string(),
            title: error_type.title().to_string(),
            status: error_type.status_code(),
            detail,
            extensions: Map::new(),
        }
    }
}

#[derive(Debug, Error)]
pub enum StudioError {
    #[error("invalid request: {message}")]
    InvalidRequest { message: String },
    #[error("agent process not found: {agent_id}")]
    AgentNotFound { agent_id: String },
    #[error("agent artifact not found: {path}")]
    ArtifactNotFound { agent_id: String, path: String },
    #[error("agent process has exited: {agent_id}")]
    AgentProcessExited {
        agent_id: String,
        exit_code: Option<i32>,
    },
    #[error("agent process is invalid: {agent_id}")]
    ProcessInvalid { agent_id: String },
    #[error("agent process stdin is not available: {message}")]
    StdinUnavailable { agent_id: String, message: String },
    #[error("failed to start agent process {agent_id}: {message}")]
    SpawnFailed { agent_id: String, message: String },
    #[error("storage error: {message}")]
    Storage { message: String },
}

impl StudioError {
    pub fn invalid_request(message: impl Into<String>) -> Self {
        Self::InvalidRequest {
            message: message.into(),
        }
    }

    pub fn error_type(&self) -> ErrorType {
        match self {
            Self::InvalidRequest { .. } => ErrorType::InvalidRequest,
            Self::AgentNotFound { .. } => ErrorType::AgentNotFound,
            Self::ArtifactNotFound { .. } => ErrorType::ArtifactNotFound,
            Self::AgentProcessExited { .. } => ErrorType::AgentProcessExited,
            Self::ProcessInvalid { .. } => ErrorType::ProcessInvalid,
            Self::StdinUnavailable { .. } => ErrorType::StdinUnavailable,
            Self::SpawnFailed { .. } => ErrorType::SpawnFailed,
            Self::Storage { .. } => ErrorType::Storage,
        }
    }

    pub fn status_code(&self) -> u16 {
        self.error_type().status_code()
    }

    /// Agent the error refers to, when there is one.
    pub fn agent_id(&self) -> Option<&str> {
        match self {
            Self::AgentNotFound { agent_id }
            | Self::ArtifactNotFound { agent_id, .. }
            | Self::AgentProcessExited { agent_id, .. }
            | Self::ProcessInvalid { agent_id }
            | Self::StdinUnavailable { agent_id, .. }
            | Self::SpawnFailed { agent_id, .. } => Some(agent_id),
            Self::InvalidRequest { .. } | Self::Storage { .. } => None,
        }
    }

    pub fn to_problem_details(&self) -> ProblemDetails {
        let mut problem = ProblemDetails::new(self.error_type(), Some(self.to_string()));

        let mut extensions = Map::new();
        if let Some(agent_id) = self.agent_id() {
            extensions.insert("agentId".to_string(), Value::String(agent_id.to_string()));
        }
        if let Self::AgentProcessExited {
            exit_code: Some(code),
            ..
        } = self
        {
            extensions.insert(
                "exitCode".to_string(),
                Value::Number(serde_json::Number::from(*code as i64)),
            );
        }
        problem.extensions = extensions;
        problem
    }
}

impl From<StudioError> for ProblemDetails {
    fn from(value: StudioError) -> Self {
        value.to_problem_details()
    }
}

impl From<&StudioError> for ProblemDetails {
    fn from(value: &StudioError) -> Self {
        value.to_problem_details()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exited_and_missing_agents_map_to_not_found() {
        let missing = StudioError::AgentNotFound {
            agent_id: "demo".to_string(),
        };
        let exited = StudioError::AgentProcessExited {
            agent_id: "demo".to_string(),
            exit_code: Some(1),
        };
        assert_eq!(missing.status_code(), 404);
        assert_eq!(exited.status_code(), 404);
    }

    #[test]
    fn stdin_failures_are_server_errors() {
        let err = StudioError::StdinUnavailable {
            agent_id: "demo".to_string(),
            message: "closed".to_string(),
        };
        assert_eq!(err.status_code(), 500);
        assert_eq!(err.agent_id(), Some("demo"));
    }

    #[test]
    fn problem_details_carry_agent_and_exit_code() {
        let err = StudioError::AgentProcessExited {
            agent_id: "demo".to_string(),
            exit_code: Some(3),
        };
        let body = serde_json::to_value(err.to_problem_details()).expect("serialize problem");
        assert_eq!(body["type"], "urn:mcp-studio:error:agent_process_exited");
        assert_eq!(body["status"], 404);
        assert_eq!(body["agentId"], "demo");
        assert_eq!(body["exitCode"], 3);
        assert_eq!(body["detail"], "agent process has exited: demo");
    }

    #[test]
    fn invalid_request_has_no_agent_extension() {
        let body = serde_json::to_value(StudioError::invalid_request("Missing agent ID").to_problem_details())
            .expect("serialize problem");
        assert_eq!(body["status"], 400);
        assert!(body.get("agentId").is_none());
    }
}

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use mcp_studio_error::StudioError;
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

use crate::config::RuntimeConfig;

const METADATA_FILE: &str = "metadata.json";
const DEFAULT_DESCRIPTION: &str = "A custom MCP agent";

/// How to start an agent artifact.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchSpec {
    pub program: PathBuf,
    pub args: Vec<String>,
    pub env: HashMap<String, String>,
    pub cwd: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct AgentRecord {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub created: String,
    #[serde(default)]
    pub modified: String,
    #[serde(default)]
    pub file_path: String,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct Metadata {
    #[serde(default)]
    agents: Vec<AgentRecord>,
}

#[derive(Debug, Clone)]
pub struct SaveAgent {
    pub code: String,
    pub agent_name: String,
    pub description: Option<String>,
}

/// Agent scripts on disk plus the `metadata.json` index next to them.
#[derive(Debug, Clone)]
pub struct ArtifactStore {
    agents_dir: PathBuf,
    project_root: PathBuf,
    interpreter: String,
    extension: String,
}

impl ArtifactStore {
    pub fn new(config: &RuntimeConfig) -> Self {
        Self {
            agents_dir: config.agents_dir.clone(),
            project_root: config.project_root.clone(),
            interpreter: config.interpreter.clone(),
            extension: config.artifact_extension.clone(),
        }
    }

    pub fn artifact_path(&self, agent_id: &str) -> PathBuf {
        self.agents_dir
            .join(format!("{agent_id}.{}", self.extension))
    }

    pub async fn launch_spec(&self, agent_id: &str) -> Result<LaunchSpec, StudioError> {
        validate_agent_id(agent_id)?;
        let path = self.artifact_path(agent_id);
        let is_file = tokio::fs::metadata(&path)
            .await
            .map(|metadata| metadata.is_file())
            .unwrap_or(false);
        if !is_file {
            return Err(StudioError::ArtifactNotFound {
                agent_id: agent_id.to_string(),
                path: path.display().to_string(),
            });
        }

        let mut env = HashMap::new();
        env.insert("PYTHONUNBUFFERED".to_string(), "1".to_string());
        Ok(LaunchSpec {
            program: PathBuf::from(&self.interpreter),
            args: vec![path.to_string_lossy().into_owned()],
            env,
            cwd: self.project_root.clone(),
        })
    }

    pub async fn list(&self) -> Result<Vec<AgentRecord>, StudioError> {
        self.ensure_dir().await?;
        let path = self.metadata_path();
        if !path.exists() {
            write_metadata(&path, &Metadata::default()).await?;
            return Ok(Vec::new());
        }
        Ok(read_metadata(&path).await.agents)
    }

    pub async fn save(&self, request: SaveAgent) -> Result<AgentRecord, StudioError> {
        if request.code.is_empty() || request.agent_name.trim().is_empty() {
            return Err(StudioError::invalid_request("Missing required fields"));
        }
        let id = sanitize_agent_name(&request.agent_name);
        if id.is_empty() {
            return Err(StudioError::invalid_request(
                "Agent name must contain letters or digits",
            ));
        }

        self.ensure_dir().await?;
        let artifact = self.artifact_path(&id);
        tokio::fs::write(&artifact, request.code.as_bytes())
            .await
            .map_err(|err| storage_error(&artifact, err))?;

        let now = chrono::Utc::now().to_rfc3339();
        let mut record = AgentRecord {
            id: id.clone(),
            name: request.agent_name,
            description: request
                .description
                .filter(|description| !description.trim().is_empty())
                .unwrap_or_else(|| DEFAULT_DESCRIPTION.to_string()),
            created: now.clone(),
            modified: now,
            file_path: self.relative_file_path(&id),
        };

        let path = self.metadata_path();
        let mut metadata = read_metadata(&path).await;
        match metadata.agents.iter_mut().find(|agent| agent.id == id) {
            Some(existing) => {
                if !existing.created.is_empty() {
                    record.created = existing.created.clone();
                }
                *existing = record.clone();
            }
            None => metadata.agents.push(record.clone()),
        }
        write_metadata(&path, &metadata).await?;

        tracing::info!(agent_id = %id, path = %artifact.display(), "agent artifact saved");
        Ok(record)
    }

    /// Artifact path as recorded in the index: `<agents dir name>/<id>.<ext>`.
    fn relative_file_path(&self, agent_id: &str) -> String {
        let file_name = format!("{agent_id}.{}", self.extension);
        match self.agents_dir.file_name() {
            Some(dir) => format!("{}/{file_name}", dir.to_string_lossy()),
            None => file_name,
        }
    }

    fn metadata_path(&self) -> PathBuf {
        self.agents_dir.join(METADATA_FILE)
    }

    async fn ensure_dir(&self) -> Result<(), StudioError> {
        tokio::fs::create_dir_all(&self.agents_dir)
            .await
            .map_err(|err| storage_error(&self.agents_dir, err))
    }
}

/// Lowercases, turns whitespace runs into `_` and drops anything outside `[a-z0-9_]`.
pub fn sanitize_agent_name(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    let mut in_space = false;
    for c in name.to_lowercase().chars() {
        if c.is_whitespace() {
            if !in_space {
                out.push('_');
            }
            in_space = true;
            continue;
        }
        in_space = false;
        if c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_' {
            out.push(c);
        }
    }
    out
}

pub fn validate_agent_id(agent_id: &str) -> Result<(), StudioError> {
    let valid = !agent_id.is_empty()
        && agent_id
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_');
    if valid {
        Ok(())
    } else {
        Err(StudioError::invalid_request(format!(
            "Invalid agent ID: {agent_id}"
        )))
    }
}

async fn read_metadata(path: &Path) -> Metadata {
    match tokio::fs::read_to_string(path).await {
        Ok(content) => serde_json::from_str(&content).unwrap_or_else(|err| {
            tracing::warn!(path = %path.display(), error = %err, "invalid agent metadata, ignoring");
            Metadata::default()
        }),
        Err(_) => Metadata::default(),
    }
}

async fn write_metadata(path: &Path, metadata: &Metadata) -> Result<(), StudioError> {
    let body = serde_json::to_string_pretty(metadata).map_err(|err| StudioError::Storage {
        message: err.to_string(),
    })?;
    tokio::fs::write(path, body)
        .await
        .map_err(|err| storage_error(path, err))
}

fn storage_error(path: &Path, err: std::io::Error) -> StudioError {
    StudioError::Storage {
        message: format!("{}: {err}", path.display()),
    }
}

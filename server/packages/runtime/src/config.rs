use std::path::PathBuf;
use std::time::Duration;

pub const DEFAULT_HOST: &str = "127.0.0.1";
pub const DEFAULT_PORT: u16 = 3001;
pub const DEFAULT_INTERPRETER: &str = "python";
pub const DEFAULT_ARTIFACT_EXTENSION: &str = "py";

/// Knobs for the agent supervisor. Defaults match the browser studio.
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    pub project_root: PathBuf,
    pub agents_dir: PathBuf,
    pub interpreter: String,
    pub artifact_extension: String,
    /// Idle time after which the reaper sends a termination signal.
    pub idle_timeout: Duration,
    pub reap_interval: Duration,
    pub heartbeat_interval: Duration,
    /// Delay between a terminal event and closing the viewer stream.
    pub exit_grace: Duration,
    /// How long an input write may block before it is reported as queued.
    pub input_queue_timeout: Duration,
    /// Upper bound on waiting for output pumps to drain after exit.
    pub drain_timeout: Duration,
    /// Output chunks buffered while no viewer is attached.
    pub backlog_limit: usize,
}

impl RuntimeConfig {
    pub fn for_project(project_root: impl Into<PathBuf>) -> Self {
        let project_root = project_root.into();
        Self {
            agents_dir: project_root.join("agents").join("generated"),
            project_root,
            ..Self::default()
        }
    }
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        let project_root = std::env::current_dir().unwrap_or_else(|_| PathBuf::from("."));
        Self {
            agents_dir: project_root.join("agents").join("generated"),
            project_root,
            interpreter: DEFAULT_INTERPRETER.to_string(),
            artifact_extension: DEFAULT_ARTIFACT_EXTENSION.to_string(),
            idle_timeout: Duration::from_secs(5 * 60),
            reap_interval: Duration::from_secs(60),
            heartbeat_interval: Duration::from_secs(15),
            exit_grace: Duration::from_millis(500),
            input_queue_timeout: Duration::from_millis(250),
            drain_timeout: Duration::from_secs(2),
            backlog_limit: 1024,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    /// Empty means any origin.
    pub cors_allow_origins: Vec<String>,
    pub runtime: RuntimeConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: DEFAULT_HOST.to_string(),
            port: DEFAULT_PORT,
            cors_allow_origins: Vec::new(),
            runtime: RuntimeConfig::default(),
        }
    }
}

use std::io::Write;
use std::path::PathBuf;
use std::time::Duration;

use clap::{Args, Parser, Subcommand};
use futures::StreamExt;
use mcp_studio_output::{classify, Classification, OutputEvent, OutputKind};
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio_stream::wrappers::LinesStream;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::client::{ClientError, SseFrame, StudioClient};
use crate::config::{
    RuntimeConfig, ServerConfig, DEFAULT_ARTIFACT_EXTENSION, DEFAULT_HOST, DEFAULT_INTERPRETER,
    DEFAULT_PORT,
};

#[derive(Parser, Debug)]
#[command(name = "mcp-studio", bin_name = "mcp-studio")]
#[command(about = "Run, watch and talk to MCP Studio agents", version)]
#[command(arg_required_else_help = true)]
pub struct StudioCli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run the agent supervisor HTTP server.
    Server(ServerArgs),
    /// Start an agent (unless --no-run) and attach this terminal to it.
    Attach(AttachArgs),
    /// Send one line to a running agent.
    Input(InputArgs),
    /// Stop a running agent.
    Stop(AgentArgs),
    /// List saved agents.
    Agents(ClientArgs),
}

#[derive(Args, Debug)]
pub struct ServerArgs {
    #[arg(long, short = 'H', env = "MCP_STUDIO_HOST", default_value = DEFAULT_HOST)]
    host: String,

    #[arg(long, short = 'p', env = "MCP_STUDIO_PORT", default_value_t = DEFAULT_PORT)]
    port: u16,

    /// Working directory for agent processes. Defaults to the current directory.
    #[arg(long, env = "MCP_STUDIO_PROJECT_ROOT")]
    project_root: Option<PathBuf>,

    /// Where agent scripts live. Defaults to <project-root>/agents/generated.
    #[arg(long, env = "MCP_STUDIO_AGENTS_DIR")]
    agents_dir: Option<PathBuf>,

    #[arg(long, env = "MCP_STUDIO_INTERPRETER", default_value = DEFAULT_INTERPRETER)]
    interpreter: String,

    #[arg(long, env = "MCP_STUDIO_ARTIFACT_EXTENSION", default_value = DEFAULT_ARTIFACT_EXTENSION)]
    artifact_extension: String,

    #[arg(long, default_value_t = 300)]
    idle_timeout_secs: u64,

    #[arg(long, default_value_t = 60)]
    reap_interval_secs: u64,

    #[arg(long, default_value_t = 15)]
    heartbeat_secs: u64,

    #[arg(long, default_value_t = 500)]
    exit_grace_ms: u64,

    /// How long an input write may block before it is reported as queued.
    #[arg(long, default_value_t = 250)]
    input_queue_ms: u64,

    #[arg(long = "cors-allow-origin", short = 'O')]
    cors_allow_origin: Vec<String>,
}

impl ServerArgs {
    pub fn to_config(&self) -> Result<ServerConfig, CliError> {
        let project_root = match &self.project_root {
            Some(root) => root.clone(),
            None => std::env::current_dir()?,
        };
        let mut runtime = RuntimeConfig::for_project(project_root);
        if let Some(agents_dir) = &self.agents_dir {
            runtime.agents_dir = agents_dir.clone();
        }
        runtime.interpreter = self.interpreter.clone();
        runtime.artifact_extension = self.artifact_extension.clone();
        runtime.idle_timeout = Duration::from_secs(self.idle_timeout_secs);
        runtime.reap_interval = Duration::from_secs(self.reap_interval_secs.max(1));
        runtime.heartbeat_interval = Duration::from_secs(self.heartbeat_secs.max(1));
        runtime.exit_grace = Duration::from_millis(self.exit_grace_ms);
        runtime.input_queue_timeout = Duration::from_millis(self.input_queue_ms);

        Ok(ServerConfig {
            host: self.host.clone(),
            port: self.port,
            cors_allow_origins: self.cors_allow_origin.clone(),
            runtime,
        })
    }
}

#[derive(Args, Debug)]
pub struct ClientArgs {
    /// Server base URL.
    #[arg(long, short = 'e', env = "MCP_STUDIO_ENDPOINT")]
    endpoint: Option<String>,
}

impl ClientArgs {
    fn client(&self) -> Result<StudioClient, CliError> {
        let endpoint = self
            .endpoint
            .clone()
            .unwrap_or_else(|| format!("http://{DEFAULT_HOST}:{DEFAULT_PORT}"));
        Ok(StudioClient::new(endpoint)?)
    }
}

#[derive(Args, Debug)]
pub struct AgentArgs {
    agent_id: String,

    #[command(flatten)]
    client: ClientArgs,
}

#[derive(Args, Debug)]
pub struct AttachArgs {
    agent_id: String,

    /// Attach to an agent that is already running instead of starting it.
    #[arg(long)]
    no_run: bool,

    #[command(flatten)]
    client: ClientArgs,
}

#[derive(Args, Debug)]
pub struct InputArgs {
    agent_id: String,

    text: String,

    #[command(flatten)]
    client: ClientArgs,
}

#[derive(Debug, Error)]
pub enum CliError {
    #[error("client error: {0}")]
    Client(#[from] ClientError),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("server error: {0}")]
    Server(String),
}

pub fn init_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::registry()
        .with(filter)
        .with(
            tracing_logfmt::builder()
                .layer()
                .with_writer(std::io::stderr),
        )
        .init();
}

pub async fn run_command(command: Command) -> Result<(), CliError> {
    match command {
        Command::Server(args) => {
            let config = args.to_config()?;
            crate::run_server(config)
                .await
                .map_err(|err| CliError::Server(err.to_string()))
        }
        Command::Attach(args) => run_attach(args).await,
        Command::Input(args) => {
            let client = args.client.client()?;
            let response = client.input(&args.agent_id, &args.text).await?;
            write_json(&response)
        }
        Command::Stop(args) => {
            let client = args.client.client()?;
            let response = client.stop(&args.agent_id).await?;
            write_json(&response)
        }
        Command::Agents(args) => {
            let agents = args.client()?.agents().await?;
            write_json(&agents)
        }
    }
}

async fn run_attach(args: AttachArgs) -> Result<(), CliError> {
    let client = args.client.client()?;
    let agent_id = args.agent_id;

    if !args.no_run {
        let response = client.run(&agent_id).await?;
        tracing::info!(agent_id = %response.agent_id, "{}", response.message);
    }

    let mut frames = Box::pin(client.stream(&agent_id).await?);
    let mut lines = LinesStream::new(BufReader::new(tokio::io::stdin()).lines());

    loop {
        tokio::select! {
            frame = frames.next() => {
                let Some(frame) = frame else { break };
                match frame? {
                    SseFrame::Comment(comment) => tracing::debug!(comment = %comment, "stream comment"),
                    SseFrame::Data(data) => match serde_json::from_str::<OutputEvent>(&data) {
                        Ok(event) => print_rendered(render_event(&event)),
                        Err(err) => tracing::warn!(error = %err, "ignoring malformed stream event"),
                    },
                }
            }
            line = lines.next() => {
                match line.transpose()? {
                    Some(line) => match client.input(&agent_id, &line).await {
                        Ok(response) => {
                            if let Some(warning) = response.warning {
                                eprintln!("{warning}");
                            }
                        }
                        Err(err) => eprintln!("Error: {err}"),
                    },
                    // Ctrl-D
                    None => break,
                }
            }
            _ = tokio::signal::ctrl_c() => break,
        }
    }

    match client.stop(&agent_id).await {
        Ok(response) => tracing::info!(agent_id = %agent_id, "{}", response.message),
        Err(err) => tracing::warn!(agent_id = %agent_id, error = %err, "failed to stop agent"),
    }
    Ok(())
}

/// Text for one event and whether it belongs on stderr.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rendered {
    pub text: String,
    pub to_stderr: bool,
}

pub fn render_event(event: &OutputEvent) -> Option<Rendered> {
    match classify(event) {
        Classification::Suppressed => None,
        Classification::AgentResponse(response) => {
            let mut text = response.text.trim_end().to_string();
            if let Some(debug) = response.debug {
                text.push_str("\n\n--- Debug Information ---\n");
                text.push_str(&debug.content);
            }
            text.push('\n');
            Some(Rendered {
                text,
                to_stderr: false,
            })
        }
        Classification::Plain(plain) => {
            let body = plain.json.unwrap_or(plain.text);
            let rendered = match plain.kind {
                // raw chunks keep their own line breaks, prompts included
                OutputKind::Stdout => Rendered {
                    text: body,
                    to_stderr: false,
                },
                OutputKind::System => Rendered {
                    text: format!("[system] {body}\n"),
                    to_stderr: false,
                },
                OutputKind::Exit => Rendered {
                    text: format!("[exit] {body}\n"),
                    to_stderr: false,
                },
                OutputKind::Stderr => Rendered {
                    text: body,
                    to_stderr: true,
                },
                kind @ (OutputKind::ModuleError | OutputKind::ImportError | OutputKind::FileError) => {
                    Rendered {
                        text: format!("[{}] {body}", kind.as_str()),
                        to_stderr: true,
                    }
                }
                OutputKind::Error => Rendered {
                    text: format!("{body}\n"),
                    to_stderr: true,
                },
            };
            Some(rendered)
        }
    }
}

fn print_rendered(rendered: Option<Rendered>) {
    let Some(rendered) = rendered else { return };
    if rendered.to_stderr {
        let mut stderr = std::io::stderr();
        let _ = stderr.write_all(rendered.text.as_bytes());
        let _ = stderr.flush();
    } else {
        let mut stdout = std::io::stdout();
        let _ = stdout.write_all(rendered.text.as_bytes());
        let _ = stdout.flush();
    }
}

fn write_json<T: serde::Serialize>(value: &T) -> Result<(), CliError> {
    let mut out = std::io::stdout();
    serde_json::to_writer_pretty(&mut out, value)?;
    writeln!(out)?;
    Ok(())
}

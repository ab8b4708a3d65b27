use std::net::SocketAddr;
use std::sync::Arc;

use app::build_router_with_cors;
use runtime::StudioRuntime;

pub mod app;
pub mod artifacts;
pub mod cli;
pub mod client;
pub mod config;
pub mod process;
pub mod reaper;
pub mod registry;
pub mod runtime;
pub mod stream;

pub use config::{RuntimeConfig, ServerConfig};

pub async fn run_server(
    config: ServerConfig,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let runtime = StudioRuntime::new(config.runtime.clone());
    runtime.start_reaper();
    run_server_with_runtime(config, runtime).await
}

pub async fn run_server_with_runtime(
    config: ServerConfig,
    runtime: Arc<StudioRuntime>,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let app = build_router_with_cors(runtime.clone(), &config.cors_allow_origins);
    let addr: SocketAddr = format!("{}:{}", config.host, config.port).parse()?;
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!(
        addr = %addr,
        agents_dir = %config.runtime.agents_dir.display(),
        "mcp-studio listening"
    );

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(runtime))
        .await?;
    Ok(())
}

async fn shutdown_signal(runtime: Arc<StudioRuntime>) {
    let _ = tokio::signal::ctrl_c().await;
    tracing::info!("shutting down, terminating agent processes");
    runtime.shutdown().await;
}

use clap::Parser;
use mcp_studio_runtime::cli::{init_logging, run_command, StudioCli};

#[tokio::main]
async fn main() {
    let cli = StudioCli::parse();
    init_logging();
    if let Err(err) = run_command(cli.command).await {
        tracing::error!(error = %err, "mcp-studio failed");
        std::process::exit(1);
    }
}

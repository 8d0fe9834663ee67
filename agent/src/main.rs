//! Hive agent - encrypted command-and-control client for sensor workloads

use std::process::ExitCode;

use clap::Parser;
use hive_agent::cli::Cli;
use hive_agent::domain::AgentExit;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[tokio::main(flavor = "current_thread")]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    match cli.run().await {
        Ok(AgentExit::Deleted) => {
            info!("agent deleted, exiting");
            ExitCode::SUCCESS
        }
        Ok(AgentExit::Shutdown) => {
            info!("agent stopped");
            ExitCode::SUCCESS
        }
        Err(e) => {
            eprintln!("Error: {e:#}");
            ExitCode::FAILURE
        }
    }
}

use anyhow::Result;
use clap::Parser;
use dsflow_core::events::EventLog;
use std::path::PathBuf;
use std::sync::Arc;

mod api;
mod config;
mod model_client;

use config::{AppState, ServerConfig};
use model_client::OpenAiCompatibleClient;

#[derive(Parser, Debug)]
#[command(name = "dsflow")]
#[command(about = "Workflow engine for building fine-tuning datasets from documents", long_about = None)]
struct Args {
    /// Path to configuration file
    #[arg(short, long, default_value = "dsflow.toml")]
    config: PathBuf,

    /// Data directory for storage
    #[arg(short, long, default_value = "./data")]
    data_dir: PathBuf,

    /// Port to listen on
    #[arg(short, long, default_value = "8080")]
    port: u16,

    /// Host to bind to
    #[arg(long, default_value = "127.0.0.1")]
    host: String,

    /// API key for the model endpoint
    #[arg(long, env = "DSFLOW_MODEL_API_KEY", hide_env_values = true)]
    model_api_key: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "dsflow=info,tower_http=debug".into()),
        )
        .with_target(false)
        .with_thread_ids(true)
        .with_file(true)
        .with_line_number(true)
        .init();

    let args = Args::parse();

    tracing::info!("Starting dsflow");
    tracing::info!("Data directory: {}", args.data_dir.display());

    // Load configuration
    let mut config = ServerConfig::load(&args.config, args.data_dir)?;
    if args.model_api_key.is_some() {
        config.model.api_key = args.model_api_key;
    }

    let model = Arc::new(OpenAiCompatibleClient::new(&config.model)?);
    let state = AppState::new(&config, model)?;
    let queue = state.queue.clone();
    let event_log = state.event_log.clone();

    // Start API server
    let addr = format!("{}:{}", args.host, args.port);
    tracing::info!("Starting API server on {}", addr);

    api::serve(&addr, state, shutdown_signal()).await?;

    tracing::info!("Draining workflow queue");
    queue.shutdown().await;

    if let Err(e) = event_log.flush().await {
        tracing::error!("Failed to flush event log: {:#}", e);
    }

    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("Failed to listen for shutdown signal: {}", e);
        std::future::pending::<()>().await;
    }
    tracing::info!("Shutdown signal received");
}

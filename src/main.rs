//! KSI daemon - host entry point.
//!
//! The host owns the process lifecycle: it loads configuration, installs
//! tracing, wires the completion service onto an event router, and runs the
//! service until ctrl-c. Transport and concrete provider backends are host
//! integrations; embedders bind callables via
//! [`ksi::completion::CompletionService::bind_provider`] before startup.

use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use serde_json::json;
use tracing_subscriber::EnvFilter;

use ksi::completion::CompletionService;
use ksi::config::Config;
use ksi::events::EventRouter;

#[derive(Parser)]
#[command(
    name = "ksi",
    about = "Daemon core that brokers LLM completion requests with per-conversation ordering"
)]
struct Cli {
    /// Path to a TOML settings file.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Override the response log directory.
    #[arg(long)]
    responses_dir: Option<PathBuf>,

    /// Tracing filter, e.g. `info,ksi=debug`.
    #[arg(long, env = "KSI_LOG")]
    log: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let _ = dotenvy::dotenv();

    let filter = match &cli.log {
        Some(directives) => EnvFilter::new(directives),
        None => EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
    };
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let mut config = Config::load(cli.config.as_deref())?;
    if let Some(dir) = cli.responses_dir {
        config.store.responses_dir = dir;
    }

    let router = Arc::new(EventRouter::new());
    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
    let service = CompletionService::new(config, Arc::clone(&router), shutdown_rx);
    service.register_handlers().await;

    let startup = router.emit("system:startup", json!({})).await;
    tracing::info!(response = ?startup, "daemon started");

    let ready = router.emit("system:ready", json!({})).await;
    tracing::debug!(response = ?ready, "services surrendered their tasks");
    let service_task = tokio::spawn(Arc::clone(&service).run());

    tokio::signal::ctrl_c().await?;
    tracing::info!("ctrl-c received, shutting down");

    router.emit("system:shutdown", json!({})).await;
    let _ = shutdown_tx.send(true);
    let _ = service_task.await;

    Ok(())
}

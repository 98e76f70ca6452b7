//! MoE-Chat relay server binary.

use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tokio::net::TcpListener;
use tracing::info;
use tracing_subscriber::EnvFilter;

use moechat_llm::directory::InMemoryModelDirectory;
use moechat_server::persistence::InMemoryMessageStore;
use moechat_server::{RelayConfig, RelayServer};

/// Streaming chat-completion relay for MoE inference backends.
#[derive(Debug, Parser)]
#[command(name = "moechat-server", version)]
struct Cli {
    /// Host to bind (overrides MOECHAT_HOST).
    #[arg(long)]
    host: Option<String>,

    /// Port to bind (overrides MOECHAT_PORT).
    #[arg(long)]
    port: Option<u16>,

    /// Log filter when RUST_LOG is unset.
    #[arg(long, default_value = "info")]
    log: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(cli.log.clone()));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let mut config = RelayConfig::from_env();
    if let Some(host) = cli.host {
        config.host = host;
    }
    if let Some(port) = cli.port {
        config.port = port;
    }

    let directory = Arc::new(InMemoryModelDirectory::with_models(config.seed_models()));
    info!(models = directory.len(), "model directory seeded");

    let bind_addr = format!("{}:{}", config.host, config.port);
    let server = RelayServer::new(
        config,
        directory.clone(),
        Arc::new(InMemoryMessageStore::new()),
    )?;
    server.spawn_heartbeat(directory);

    let shutdown = server.shutdown().clone();
    let _signal = tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("shutdown signal received");
            shutdown.shutdown(None).await;
        }
    });

    let listener = TcpListener::bind(&bind_addr)
        .await
        .with_context(|| format!("failed to bind {bind_addr}"))?;
    server.serve(listener).await.context("server error")?;

    info!("relay server stopped");
    Ok(())
}

//! peercall-relay
//!
//! Stellt einen In-Memory-Dokumentenspeicher per WebSocket bereit.

use anyhow::{Context, Result};
use clap::Parser;
use peercall::store::{MemoryStore, StoreServer};
use peercall::AppConfig;
use std::sync::Arc;

#[derive(Parser, Debug)]
#[command(name = "peercall-relay", version, about = "Document store relay for peercall")]
struct Cli {
    /// Listen-Adresse, z.B. 0.0.0.0:8787
    #[arg(long)]
    listen: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut config = AppConfig::load().context("Failed to load configuration")?;
    if let Some(listen) = cli.listen {
        config.listen_addr = listen;
    }
    peercall::init_tracing(&config.log_filter);

    let server = StoreServer::bind(&config.listen_addr, Arc::new(MemoryStore::new()))
        .await
        .with_context(|| format!("Failed to bind {}", config.listen_addr))?;

    tokio::select! {
        result = server.run() => result.context("Relay stopped")?,
        _ = tokio::signal::ctrl_c() => tracing::info!("Shutting down relay"),
    }

    Ok(())
}

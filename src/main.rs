//! peercall CLI
//!
//! `peercall create` legt einen Call an und gibt dessen ID aus,
//! `peercall join <ID>` tritt ihm bei. Ctrl-C legt auf.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use peercall::engine::WebRtcFactory;
use peercall::media::SyntheticDevices;
use peercall::store::RemoteStore;
use peercall::{AppConfig, CallEvent, CallSession};
use std::sync::Arc;

#[derive(Parser, Debug)]
#[command(name = "peercall", version, about = "Two-party P2P video calls")]
struct Cli {
    /// WebSocket-URL des Store-Relays
    #[arg(long, global = true)]
    store: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Neuen Call anlegen
    Create,
    /// Bestehendem Call beitreten
    Join {
        /// Call-ID des Anrufers
        call_id: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut config = AppConfig::load().context("Failed to load configuration")?;
    if let Some(store) = cli.store {
        config.store_url = store;
    }
    peercall::init_tracing(&config.log_filter);

    tracing::info!("Connecting to store relay at {}", config.store_url);
    let store = RemoteStore::connect(&config.store_url, config.request_timeout())
        .await
        .with_context(|| format!("Failed to connect to {}", config.store_url))?;

    let session = CallSession::new(
        Arc::new(store),
        Arc::new(WebRtcFactory::from_config(&config)),
        Arc::new(SyntheticDevices::new()),
    )
    .await?;

    let mut events = session.subscribe();
    tokio::spawn(async move {
        while let Ok(event) = events.recv().await {
            match event {
                CallEvent::StateChanged(state) => tracing::info!("State: {}", state.label()),
                CallEvent::RemoteTrack { kind, id } => {
                    tracing::info!("Remote {} track: {}", kind, id)
                }
                CallEvent::AnswerApplied => tracing::info!("Answer applied"),
                CallEvent::LocalCandidate { collection } => {
                    tracing::debug!("Candidate published to {}", collection)
                }
                CallEvent::Error(e) => tracing::error!("{}", e),
            }
        }
    });

    session.start_media().await?;

    match cli.command {
        Command::Create => {
            let call_id = session.create_call().await?;
            println!("{}", call_id);
        }
        Command::Join { call_id } => {
            session.join_call(&call_id).await?;
        }
    }

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for Ctrl-C")?;

    session.hang_up().await?;
    Ok(())
}

//! peercall - P2P Video Calls
//!
//! Zwei-Parteien Video-Calls mit:
//! - WebRTC Peer Connections für Audio und Video
//! - Einem Dokumentenspeicher als Signaling-Kanal (Offer, Answer, ICE)
//! - Einem WebSocket-Relay, das den Speicher im Netz bereitstellt

pub mod call;
pub mod config;
pub mod engine;
pub mod media;
pub mod store;

pub use call::{CallError, CallEvent, CallSession, CallState, ControlPanel};
pub use config::AppConfig;

use tracing_subscriber::EnvFilter;

// ============================================================================
// LOGGING
// ============================================================================

/// Initialisiert das Logging
///
/// `RUST_LOG` hat Vorrang vor `default_filter`. Ein bereits installierter
/// Subscriber bleibt bestehen.
pub fn init_tracing(default_filter: &str) {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(default_filter))
        .unwrap_or_else(|e| {
            eprintln!("Invalid log filter '{}': {}", default_filter, e);
            EnvFilter::new(config::DEFAULT_LOG_FILTER)
        });

    if tracing_subscriber::fmt().with_env_filter(filter).try_init().is_err() {
        tracing::debug!("Tracing already initialized");
    }
}

//! Schnittstelle zur Echtzeit-Verbindung
//!
//! Die Reihenfolge der Aufrufe (Offer erzeugen, Beschreibungen setzen,
//! Kandidaten anwenden) bestimmt der Aufrufer; Aushandlung und Transport
//! erledigt die Engine.

use super::types::{ConnectionState, IceCandidate, SessionDescription, SignalingState};
use crate::media::MediaTrack;
use async_trait::async_trait;
use std::sync::Arc;
use thiserror::Error;

// ============================================================================
// ERROR TYPES
// ============================================================================

#[derive(Error, Debug, Clone)]
pub enum ConnectionError {
    #[error("WebRTC error: {0}")]
    WebRTC(String),

    #[error("Invalid SDP: {0}")]
    InvalidSdp(String),

    #[error("Invalid ICE candidate: {0}")]
    InvalidCandidate(String),

    #[error("Operation not allowed in signaling state {0:?}")]
    InvalidState(SignalingState),

    #[error("Connection is closed")]
    Closed,
}

// ============================================================================
// HANDLER TYPES
// ============================================================================

/// Wird für jede eingehende Remote-Spur aufgerufen
pub type TrackHandler = Box<dyn Fn(MediaTrack) + Send + Sync>;

/// Wird für jeden lokal gefundenen ICE Candidate aufgerufen
pub type CandidateHandler = Box<dyn Fn(IceCandidate) + Send + Sync>;

/// Wird bei jeder Änderung des Netzwerkstatus aufgerufen
pub type StateHandler = Box<dyn Fn(ConnectionState) + Send + Sync>;

// ============================================================================
// TRAITS
// ============================================================================

/// Eine Peer Connection
///
/// Handler-Registrierungen ersetzen vorher registrierte Handler derselben Art.
#[async_trait]
pub trait PeerConnection: Send + Sync {
    async fn add_track(&self, track: &MediaTrack) -> Result<(), ConnectionError>;

    fn on_track(&self, handler: TrackHandler);

    fn on_ice_candidate(&self, handler: CandidateHandler);

    fn on_connection_state_change(&self, handler: StateHandler);

    async fn create_offer(&self) -> Result<SessionDescription, ConnectionError>;

    async fn create_answer(&self) -> Result<SessionDescription, ConnectionError>;

    async fn set_local_description(&self, desc: SessionDescription)
        -> Result<(), ConnectionError>;

    async fn set_remote_description(
        &self,
        desc: SessionDescription,
    ) -> Result<(), ConnectionError>;

    /// Die zuletzt erfolgreich ausgehandelte Remote-Beschreibung
    async fn current_remote_description(&self) -> Option<SessionDescription>;

    /// Wendet einen Remote-Kandidaten an. Doppelte Kandidaten sind erlaubt
    /// und verändern den Zustand nicht.
    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), ConnectionError>;

    fn signaling_state(&self) -> SignalingState;

    fn connection_state(&self) -> ConnectionState;

    async fn close(&self) -> Result<(), ConnectionError>;
}

/// Erstellt neue, unbenutzte Peer Connections
#[async_trait]
pub trait ConnectionFactory: Send + Sync {
    async fn create(&self) -> Result<Arc<dyn PeerConnection>, ConnectionError>;
}

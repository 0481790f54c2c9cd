//! Loopback Peer Connection
//!
//! Engine ohne Netzwerk: zwei Loopback-Verbindungen, die ihre
//! Beschreibungen und Kandidaten über beliebiges Signaling austauschen,
//! erreichen `Connected`, sobald beide Beschreibungen gesetzt sind und ein
//! Kandidat mit den ICE-Credentials der Gegenseite angewendet wurde.
//!
//! SDP-Format (Auszug):
//! ```text
//! v=0
//! o=- <session> 2 IN IP4 127.0.0.1
//! a=ice-ufrag:<ufrag>
//! a=track:video <track-id>
//! ```

use super::connection::{
    CandidateHandler, ConnectionError, ConnectionFactory, PeerConnection, StateHandler,
    TrackHandler,
};
use super::types::{ConnectionState, IceCandidate, SdpType, SessionDescription, SignalingState};
use crate::media::{MediaTrack, TrackKind};
use async_trait::async_trait;
use parking_lot::Mutex;
use rand::Rng;
use std::collections::HashMap;
use std::sync::Arc;

/// Anzahl synthetischer Host-Kandidaten pro lokaler Beschreibung
const HOST_CANDIDATES: u16 = 2;

// ============================================================================
// FACTORY
// ============================================================================

#[derive(Debug, Clone, Default)]
pub struct LoopbackFactory;

impl LoopbackFactory {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl ConnectionFactory for LoopbackFactory {
    async fn create(&self) -> Result<Arc<dyn PeerConnection>, ConnectionError> {
        Ok(Arc::new(LoopbackConnection::new()))
    }
}

// ============================================================================
// CONNECTION
// ============================================================================

#[derive(Default)]
struct Handlers {
    track: Option<Arc<TrackHandler>>,
    candidate: Option<Arc<CandidateHandler>>,
    state: Option<Arc<StateHandler>>,
}

struct Inner {
    signaling: SignalingState,
    connection: ConnectionState,
    local_tracks: Vec<MediaTrack>,
    local: Option<SessionDescription>,
    /// Ausstehende Remote-Beschreibung (have-remote-offer)
    pending_remote: Option<SessionDescription>,
    /// Ausgehandelte Remote-Beschreibung (stable)
    current_remote: Option<SessionDescription>,
    /// Angewendete Kandidaten mit ihrem Username Fragment
    applied: HashMap<String, String>,
    queued: Vec<IceCandidate>,
}

pub struct LoopbackConnection {
    session_id: u64,
    ufrag: String,
    inner: Mutex<Inner>,
    handlers: Mutex<Handlers>,
}

impl LoopbackConnection {
    pub fn new() -> Self {
        let mut rng = rand::thread_rng();
        let ufrag: String = (0..8)
            .map(|_| rng.sample(rand::distributions::Alphanumeric) as char)
            .collect();

        Self {
            session_id: rng.gen(),
            ufrag,
            inner: Mutex::new(Inner {
                signaling: SignalingState::Stable,
                connection: ConnectionState::New,
                local_tracks: Vec::new(),
                local: None,
                pending_remote: None,
                current_remote: None,
                applied: HashMap::new(),
                queued: Vec::new(),
            }),
            handlers: Mutex::new(Handlers::default()),
        }
    }

    /// Anzahl tatsächlich angewendeter (nicht doppelter) Remote-Kandidaten
    pub fn applied_candidates(&self) -> usize {
        self.inner.lock().applied.len()
    }

    fn build_sdp(&self, tracks: &[MediaTrack]) -> String {
        let mut sdp = format!(
            "v=0\r\no=- {} 2 IN IP4 127.0.0.1\r\ns=-\r\nt=0 0\r\na=ice-ufrag:{}\r\n",
            self.session_id, self.ufrag
        );
        for track in tracks {
            sdp.push_str(&format!("a=track:{} {}\r\n", track.kind(), track.id()));
        }
        sdp
    }

    fn host_candidates(&self) -> Vec<IceCandidate> {
        (0..HOST_CANDIDATES)
            .map(|i| {
                let mut candidate = IceCandidate::new(format!(
                    "candidate:{} 1 udp {} 127.0.0.1 {} typ host ufrag {}",
                    i + 1,
                    2130706431u32 - u32::from(i),
                    50000 + i,
                    self.ufrag
                ));
                candidate.username_fragment = Some(self.ufrag.clone());
                candidate
            })
            .collect()
    }

    fn set_connection_state(&self, state: ConnectionState) {
        {
            let mut inner = self.inner.lock();
            if inner.connection == state {
                return;
            }
            inner.connection = state;
        }

        let handler = self.handlers.lock().state.clone();
        if let Some(handler) = handler {
            handler(state);
        }
    }

    /// Wendet einen Kandidaten an, vorausgesetzt die Remote-Beschreibung ist gesetzt
    fn apply_candidate(&self, candidate: &IceCandidate) -> Result<(), ConnectionError> {
        let remote_ufrag = {
            let inner = self.inner.lock();
            let remote = inner
                .current_remote
                .as_ref()
                .or(inner.pending_remote.as_ref());
            remote.and_then(|d| d.attribute("ice-ufrag").map(str::to_string))
        };

        let ufrag = candidate
            .ufrag()
            .ok_or_else(|| ConnectionError::InvalidCandidate(candidate.candidate.clone()))?;

        let matches = remote_ufrag.as_deref() == Some(ufrag);
        let is_new = self
            .inner
            .lock()
            .applied
            .insert(candidate.candidate.clone(), ufrag.to_string())
            .is_none();

        if is_new && matches {
            self.update_connectivity();
        }
        Ok(())
    }

    /// Checking sobald beide Seiten beschrieben sind, Connected sobald ein
    /// passender Kandidat angewendet wurde
    fn update_connectivity(&self) {
        let next = {
            let inner = self.inner.lock();
            if inner.signaling == SignalingState::Closed {
                return;
            }
            let described = inner.local.is_some()
                && (inner.current_remote.is_some() || inner.pending_remote.is_some());
            if !described {
                return;
            }

            let remote_ufrag = inner
                .current_remote
                .as_ref()
                .or(inner.pending_remote.as_ref())
                .and_then(|d| d.attribute("ice-ufrag"));
            let reachable = remote_ufrag
                .map(|expected| inner.applied.values().any(|ufrag| ufrag == expected))
                .unwrap_or(false);

            if reachable {
                ConnectionState::Connected
            } else {
                ConnectionState::Checking
            }
        };

        let current = self.inner.lock().connection;
        if current != ConnectionState::Connected {
            self.set_connection_state(next);
        }
    }

    fn ensure_open(&self) -> Result<(), ConnectionError> {
        if self.inner.lock().signaling == SignalingState::Closed {
            return Err(ConnectionError::Closed);
        }
        Ok(())
    }
}

impl Default for LoopbackConnection {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl PeerConnection for LoopbackConnection {
    async fn add_track(&self, track: &MediaTrack) -> Result<(), ConnectionError> {
        self.ensure_open()?;
        let mut inner = self.inner.lock();
        if !inner.local_tracks.iter().any(|t| t == track) {
            inner.local_tracks.push(track.clone());
        }
        Ok(())
    }

    fn on_track(&self, handler: TrackHandler) {
        self.handlers.lock().track = Some(Arc::new(handler));
    }

    fn on_ice_candidate(&self, handler: CandidateHandler) {
        self.handlers.lock().candidate = Some(Arc::new(handler));
    }

    fn on_connection_state_change(&self, handler: StateHandler) {
        self.handlers.lock().state = Some(Arc::new(handler));
    }

    async fn create_offer(&self) -> Result<SessionDescription, ConnectionError> {
        self.ensure_open()?;
        let tracks = self.inner.lock().local_tracks.clone();
        Ok(SessionDescription::offer(self.build_sdp(&tracks)))
    }

    async fn create_answer(&self) -> Result<SessionDescription, ConnectionError> {
        let (state, tracks) = {
            let inner = self.inner.lock();
            (inner.signaling, inner.local_tracks.clone())
        };
        if state != SignalingState::HaveRemoteOffer {
            return Err(ConnectionError::InvalidState(state));
        }
        Ok(SessionDescription::answer(self.build_sdp(&tracks)))
    }

    async fn set_local_description(
        &self,
        desc: SessionDescription,
    ) -> Result<(), ConnectionError> {
        {
            let mut inner = self.inner.lock();
            match (inner.signaling, desc.sdp_type) {
                (SignalingState::Stable, SdpType::Offer) => {
                    inner.signaling = SignalingState::HaveLocalOffer;
                }
                (SignalingState::HaveRemoteOffer, SdpType::Answer) => {
                    inner.signaling = SignalingState::Stable;
                    inner.current_remote = inner.pending_remote.take();
                }
                (state, _) => return Err(ConnectionError::InvalidState(state)),
            }
            inner.local = Some(desc);
        }

        // ICE Gathering startet mit der lokalen Beschreibung
        let handler = self.handlers.lock().candidate.clone();
        if let Some(handler) = handler {
            for candidate in self.host_candidates() {
                handler(candidate);
            }
        }

        self.update_connectivity();
        Ok(())
    }

    async fn set_remote_description(
        &self,
        desc: SessionDescription,
    ) -> Result<(), ConnectionError> {
        if desc.attribute("ice-ufrag").is_none() {
            return Err(ConnectionError::InvalidSdp(
                "missing a=ice-ufrag attribute".to_string(),
            ));
        }

        let queued = {
            let mut inner = self.inner.lock();
            match (inner.signaling, desc.sdp_type) {
                (SignalingState::Stable, SdpType::Offer) => {
                    inner.signaling = SignalingState::HaveRemoteOffer;
                    inner.pending_remote = Some(desc.clone());
                }
                (SignalingState::HaveLocalOffer, SdpType::Answer) => {
                    inner.signaling = SignalingState::Stable;
                    inner.current_remote = Some(desc.clone());
                }
                (state, _) => return Err(ConnectionError::InvalidState(state)),
            }
            std::mem::take(&mut inner.queued)
        };

        let handler = self.handlers.lock().track.clone();
        if let Some(handler) = handler {
            for line in desc.sdp.lines() {
                let Some(rest) = line.trim().strip_prefix("a=track:") else {
                    continue;
                };
                let mut parts = rest.split_whitespace();
                if let (Some(kind), Some(id)) = (parts.next(), parts.next()) {
                    if let Some(kind) = TrackKind::parse(kind) {
                        handler(MediaTrack::remote(kind, id));
                    }
                }
            }
        }

        for candidate in queued {
            if let Err(e) = self.apply_candidate(&candidate) {
                tracing::warn!("Failed to apply queued candidate: {}", e);
            }
        }

        self.update_connectivity();
        Ok(())
    }

    async fn current_remote_description(&self) -> Option<SessionDescription> {
        self.inner.lock().current_remote.clone()
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), ConnectionError> {
        self.ensure_open()?;

        let has_remote = {
            let mut inner = self.inner.lock();
            let has_remote = inner.current_remote.is_some() || inner.pending_remote.is_some();
            if !has_remote && !inner.queued.contains(&candidate) {
                inner.queued.push(candidate.clone());
            }
            has_remote
        };

        if has_remote {
            self.apply_candidate(&candidate)?;
        }
        Ok(())
    }

    fn signaling_state(&self) -> SignalingState {
        self.inner.lock().signaling
    }

    fn connection_state(&self) -> ConnectionState {
        self.inner.lock().connection
    }

    async fn close(&self) -> Result<(), ConnectionError> {
        {
            let mut inner = self.inner.lock();
            if inner.signaling == SignalingState::Closed {
                return Ok(());
            }
            inner.signaling = SignalingState::Closed;
            inner.queued.clear();
        }
        self.set_connection_state(ConnectionState::Closed);
        Ok(())
    }
}

// ============================================================================
// TESTS
// ============================================================================

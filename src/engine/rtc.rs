//! WebRTC Peer Connection
//!
//! `webrtc`-basierte Implementierung von `PeerConnection`. Kandidaten, die
//! vor der Remote Description eintreffen, werden zwischengespeichert und
//! nach `set_remote_description` angewendet.

use super::connection::{
    CandidateHandler, ConnectionError, ConnectionFactory, PeerConnection, StateHandler,
    TrackHandler,
};
use super::types::{ConnectionState, IceCandidate, SdpType, SessionDescription, SignalingState};
use crate::config::AppConfig;
use crate::media::{MediaTrack, TrackKind};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::Arc;
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::{MediaEngine, MIME_TYPE_OPUS, MIME_TYPE_VP8};
use webrtc::api::APIBuilder;
use webrtc::ice_transport::ice_candidate::RTCIceCandidateInit;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::sdp_type::RTCSdpType;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::signaling_state::RTCSignalingState;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_codec::{RTCRtpCodecCapability, RTPCodecType};
use webrtc::track::track_local::track_local_static_rtp::TrackLocalStaticRTP;
use webrtc::track::track_local::TrackLocal;

/// Stream-ID unter der lokale Spuren gesendet werden
const STREAM_ID: &str = "peercall";

// ============================================================================
// ICE SERVER CONFIGURATION
// ============================================================================

/// Standard STUN Server Konfiguration
pub fn default_ice_servers() -> Vec<RTCIceServer> {
    vec![RTCIceServer {
        urls: vec![
            "stun:stun1.l.google.com:19302".to_string(),
            "stun:stun2.l.google.com:19302".to_string(),
        ],
        ..Default::default()
    }]
}

// ============================================================================
// FACTORY
// ============================================================================

/// Erstellt WebRTC Peer Connections mit fester ICE-Konfiguration
#[derive(Debug, Clone)]
pub struct WebRtcFactory {
    ice_servers: Vec<RTCIceServer>,
    ice_candidate_pool_size: u8,
}

impl WebRtcFactory {
    pub fn new() -> Self {
        Self {
            ice_servers: default_ice_servers(),
            ice_candidate_pool_size: 10,
        }
    }

    /// Übernimmt ICE Server und Pool-Größe aus der Konfiguration
    pub fn from_config(config: &AppConfig) -> Self {
        let ice_servers = config
            .ice_servers
            .iter()
            .map(|server| RTCIceServer {
                urls: server.urls.clone(),
                username: server.username.clone().unwrap_or_default(),
                credential: server.credential.clone().unwrap_or_default(),
                ..Default::default()
            })
            .collect();

        Self {
            ice_servers,
            ice_candidate_pool_size: config.ice_candidate_pool_size,
        }
    }
}

impl Default for WebRtcFactory {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ConnectionFactory for WebRtcFactory {
    async fn create(&self) -> Result<Arc<dyn PeerConnection>, ConnectionError> {
        // Media Engine mit Standard-Codecs (Opus, VP8, ...)
        let mut media_engine = MediaEngine::default();
        media_engine
            .register_default_codecs()
            .map_err(|e| ConnectionError::WebRTC(e.to_string()))?;

        // Interceptors für RTCP, NACK etc.
        let mut registry = Registry::new();
        registry = register_default_interceptors(registry, &mut media_engine)
            .map_err(|e| ConnectionError::WebRTC(e.to_string()))?;

        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build();

        let config = RTCConfiguration {
            ice_servers: self.ice_servers.clone(),
            ice_candidate_pool_size: self.ice_candidate_pool_size,
            ..Default::default()
        };

        let pc = api
            .new_peer_connection(config)
            .await
            .map_err(|e| ConnectionError::WebRTC(e.to_string()))?;

        tracing::debug!("Created WebRTC peer connection");

        Ok(Arc::new(WebRtcConnection {
            pc: Arc::new(pc),
            pending_candidates: Mutex::new(Vec::new()),
        }))
    }
}

// ============================================================================
// CONNECTION
// ============================================================================

pub struct WebRtcConnection {
    pc: Arc<RTCPeerConnection>,
    /// Kandidaten, die vor der Remote Description eingetroffen sind
    pending_candidates: Mutex<Vec<RTCIceCandidateInit>>,
}

impl WebRtcConnection {
    /// Wendet alle zwischengespeicherten Kandidaten an
    async fn apply_pending_candidates(&self) {
        let candidates = self.pending_candidates.lock().drain(..).collect::<Vec<_>>();

        for candidate in candidates {
            tracing::debug!("Applying pending candidate: {}", candidate.candidate);
            if let Err(e) = self.pc.add_ice_candidate(candidate).await {
                tracing::warn!("Failed to apply pending candidate: {}", e);
            }
        }
    }
}

#[async_trait]
impl PeerConnection for WebRtcConnection {
    async fn add_track(&self, track: &MediaTrack) -> Result<(), ConnectionError> {
        let capability = match track.kind() {
            TrackKind::Audio => RTCRtpCodecCapability {
                mime_type: MIME_TYPE_OPUS.to_string(),
                clock_rate: 48000,
                channels: 2,
                ..Default::default()
            },
            TrackKind::Video => RTCRtpCodecCapability {
                mime_type: MIME_TYPE_VP8.to_string(),
                clock_rate: 90000,
                ..Default::default()
            },
        };

        let local_track = Arc::new(TrackLocalStaticRTP::new(
            capability,
            track.id().to_string(),
            STREAM_ID.to_string(),
        ));

        self.pc
            .add_track(Arc::clone(&local_track) as Arc<dyn TrackLocal + Send + Sync>)
            .await
            .map_err(|e| ConnectionError::WebRTC(e.to_string()))?;

        Ok(())
    }

    fn on_track(&self, handler: TrackHandler) {
        self.pc.on_track(Box::new(move |track, _, _| {
            let kind = match track.kind() {
                RTPCodecType::Audio => Some(TrackKind::Audio),
                RTPCodecType::Video => Some(TrackKind::Video),
                _ => None,
            };

            match kind {
                Some(kind) => handler(MediaTrack::remote(kind, track.id())),
                None => tracing::warn!("Ignoring remote track of unknown kind"),
            }

            Box::pin(async {})
        }));
    }

    fn on_ice_candidate(&self, handler: CandidateHandler) {
        self.pc.on_ice_candidate(Box::new(move |candidate| {
            if let Some(c) = candidate {
                match c.to_json() {
                    Ok(init) => handler(IceCandidate {
                        candidate: init.candidate,
                        sdp_mid: init.sdp_mid,
                        sdp_mline_index: init.sdp_mline_index,
                        username_fragment: init.username_fragment,
                    }),
                    Err(e) => tracing::warn!("Failed to serialize local candidate: {}", e),
                }
            }
            Box::pin(async {})
        }));
    }

    fn on_connection_state_change(&self, handler: StateHandler) {
        self.pc
            .on_peer_connection_state_change(Box::new(move |s: RTCPeerConnectionState| {
                tracing::info!("Peer connection state: {:?}", s);
                handler(map_connection_state(s));
                Box::pin(async {})
            }));
    }

    async fn create_offer(&self) -> Result<SessionDescription, ConnectionError> {
        let offer = self
            .pc
            .create_offer(None)
            .await
            .map_err(|e| ConnectionError::WebRTC(e.to_string()))?;
        from_rtc(offer)
    }

    async fn create_answer(&self) -> Result<SessionDescription, ConnectionError> {
        let answer = self
            .pc
            .create_answer(None)
            .await
            .map_err(|e| ConnectionError::WebRTC(e.to_string()))?;
        from_rtc(answer)
    }

    async fn set_local_description(
        &self,
        desc: SessionDescription,
    ) -> Result<(), ConnectionError> {
        self.pc
            .set_local_description(to_rtc(desc)?)
            .await
            .map_err(|e| ConnectionError::WebRTC(e.to_string()))
    }

    async fn set_remote_description(
        &self,
        desc: SessionDescription,
    ) -> Result<(), ConnectionError> {
        self.pc
            .set_remote_description(to_rtc(desc)?)
            .await
            .map_err(|e| ConnectionError::WebRTC(e.to_string()))?;

        self.apply_pending_candidates().await;
        Ok(())
    }

    async fn current_remote_description(&self) -> Option<SessionDescription> {
        let desc = self.pc.current_remote_description().await?;
        from_rtc(desc).ok()
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), ConnectionError> {
        let init = RTCIceCandidateInit {
            candidate: candidate.candidate,
            sdp_mid: candidate.sdp_mid,
            sdp_mline_index: candidate.sdp_mline_index,
            username_fragment: candidate.username_fragment,
        };

        if self.pc.remote_description().await.is_none() {
            tracing::debug!("Remote description not set yet, queuing candidate");
            self.pending_candidates.lock().push(init);
            return Ok(());
        }

        self.pc
            .add_ice_candidate(init)
            .await
            .map_err(|e| ConnectionError::InvalidCandidate(e.to_string()))
    }

    fn signaling_state(&self) -> SignalingState {
        match self.pc.signaling_state() {
            RTCSignalingState::HaveLocalOffer | RTCSignalingState::HaveLocalPranswer => {
                SignalingState::HaveLocalOffer
            }
            RTCSignalingState::HaveRemoteOffer | RTCSignalingState::HaveRemotePranswer => {
                SignalingState::HaveRemoteOffer
            }
            RTCSignalingState::Closed => SignalingState::Closed,
            _ => SignalingState::Stable,
        }
    }

    fn connection_state(&self) -> ConnectionState {
        map_connection_state(self.pc.connection_state())
    }

    async fn close(&self) -> Result<(), ConnectionError> {
        self.pending_candidates.lock().clear();
        self.pc
            .close()
            .await
            .map_err(|e| ConnectionError::WebRTC(e.to_string()))
    }
}

// ============================================================================
// CONVERSIONS
// ============================================================================

fn map_connection_state(state: RTCPeerConnectionState) -> ConnectionState {
    match state {
        RTCPeerConnectionState::Connecting => ConnectionState::Checking,
        RTCPeerConnectionState::Connected => ConnectionState::Connected,
        RTCPeerConnectionState::Disconnected => ConnectionState::Disconnected,
        RTCPeerConnectionState::Failed => ConnectionState::Failed,
        RTCPeerConnectionState::Closed => ConnectionState::Closed,
        _ => ConnectionState::New,
    }
}

fn to_rtc(desc: SessionDescription) -> Result<RTCSessionDescription, ConnectionError> {
    let result = match desc.sdp_type {
        SdpType::Offer => RTCSessionDescription::offer(desc.sdp),
        SdpType::Answer => RTCSessionDescription::answer(desc.sdp),
    };
    result.map_err(|e| ConnectionError::InvalidSdp(e.to_string()))
}

fn from_rtc(desc: RTCSessionDescription) -> Result<SessionDescription, ConnectionError> {
    match desc.sdp_type {
        RTCSdpType::Offer => Ok(SessionDescription::offer(desc.sdp)),
        RTCSdpType::Answer => Ok(SessionDescription::answer(desc.sdp)),
        other => Err(ConnectionError::InvalidSdp(format!(
            "unsupported description type {}",
            other
        ))),
    }
}

// ============================================================================
// TESTS
// ============================================================================

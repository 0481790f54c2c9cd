//! Engine Module - Peer Connections
//!
//! Dieses Modul verwaltet:
//! - Die `PeerConnection`-Schnittstelle (Offer/Answer, ICE, Tracks)
//! - WebRTC Peer Connections (`webrtc` crate)
//! - Loopback-Verbindungen ohne Netzwerk

mod connection;
mod loopback;
mod types;
mod rtc;

pub use rtc::{default_ice_servers, WebRtcConnection, WebRtcFactory};
pub use connection::{
    CandidateHandler, ConnectionError, ConnectionFactory, PeerConnection, StateHandler,
    TrackHandler,
};
pub use loopback::{LoopbackConnection, LoopbackFactory};
pub use types::{ConnectionState, IceCandidate, SdpType, SessionDescription, SignalingState};

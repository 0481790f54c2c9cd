//! Wertetypen der Verbindungsaushandlung
//!
//! Die JSON-Form entspricht dem, was Browser über `toJSON()` liefern:
//! `{sdp, type}` für Beschreibungen und `{candidate, sdpMid, sdpMLineIndex,
//! usernameFragment}` für Kandidaten.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Typ einer Session Description
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SdpType {
    Offer,
    Answer,
}

impl fmt::Display for SdpType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SdpType::Offer => f.write_str("offer"),
            SdpType::Answer => f.write_str("answer"),
        }
    }
}

/// SDP Offer oder Answer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
    pub sdp: String,
    #[serde(rename = "type")]
    pub sdp_type: SdpType,
}

impl SessionDescription {
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self {
            sdp: sdp.into(),
            sdp_type: SdpType::Offer,
        }
    }

    pub fn answer(sdp: impl Into<String>) -> Self {
        Self {
            sdp: sdp.into(),
            sdp_type: SdpType::Answer,
        }
    }

    /// Liest den Wert eines `a=<name>:`-Attributs
    pub fn attribute(&self, name: &str) -> Option<&str> {
        let prefix = format!("a={}:", name);
        self.sdp
            .lines()
            .find_map(|line| line.trim().strip_prefix(prefix.as_str()))
    }
}

/// ICE Candidate in der üblichen JSON-Form
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct IceCandidate {
    pub candidate: String,
    #[serde(rename = "sdpMid", default)]
    pub sdp_mid: Option<String>,
    #[serde(rename = "sdpMLineIndex", default)]
    pub sdp_mline_index: Option<u16>,
    #[serde(rename = "usernameFragment", default)]
    pub username_fragment: Option<String>,
}

impl IceCandidate {
    pub fn new(candidate: impl Into<String>) -> Self {
        Self {
            candidate: candidate.into(),
            sdp_mid: Some("0".to_string()),
            sdp_mline_index: Some(0),
            username_fragment: None,
        }
    }

    /// Username Fragment, entweder explizit oder aus der `ufrag`-Extension
    pub fn ufrag(&self) -> Option<&str> {
        if let Some(ufrag) = self.username_fragment.as_deref() {
            return Some(ufrag);
        }
        let mut parts = self.candidate.split_whitespace();
        while let Some(part) = parts.next() {
            if part == "ufrag" {
                return parts.next();
            }
        }
        None
    }
}

/// Aushandlungsstatus (signalingState)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalingState {
    Stable,
    HaveLocalOffer,
    HaveRemoteOffer,
    Closed,
}

/// Netzwerkstatus der Verbindung
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    New,
    Checking,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

//! Media Tracks und Streams
//!
//! Ein `MediaStream` ist ein geteiltes Handle: Klone sehen dieselben Tracks,
//! genau wie ein Stream, der gleichzeitig an einer Video-Fläche hängt und
//! von der Peer Connection befüllt wird.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

// ============================================================================
// TRACK
// ============================================================================

/// Art einer Medienspur
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TrackKind {
    Audio,
    Video,
}

impl TrackKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TrackKind::Audio => "audio",
            TrackKind::Video => "video",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "audio" => Some(TrackKind::Audio),
            "video" => Some(TrackKind::Video),
            _ => None,
        }
    }
}

impl fmt::Display for TrackKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Herkunft einer Spur
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrackOrigin {
    /// Vom eigenen Gerät aufgenommen
    Local,
    /// Vom Peer empfangen
    Remote,
}

/// Eine einzelne Audio- oder Videospur
///
/// Klone teilen sich den Stopped-Status.
#[derive(Clone)]
pub struct MediaTrack {
    id: String,
    kind: TrackKind,
    label: String,
    origin: TrackOrigin,
    stopped: Arc<AtomicBool>,
}

impl MediaTrack {
    /// Erstellt eine lokale Spur mit zufälliger ID
    pub fn local(kind: TrackKind, label: impl Into<String>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            kind,
            label: label.into(),
            origin: TrackOrigin::Local,
            stopped: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Erstellt eine vom Peer empfangene Spur
    pub fn remote(kind: TrackKind, id: impl Into<String>) -> Self {
        let id = id.into();
        Self {
            label: format!("remote {}", kind),
            id,
            kind,
            origin: TrackOrigin::Remote,
            stopped: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn kind(&self) -> TrackKind {
        self.kind
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn origin(&self) -> TrackOrigin {
        self.origin
    }

    /// Beendet die Spur (idempotent)
    pub fn stop(&self) {
        if !self.stopped.swap(true, Ordering::SeqCst) {
            tracing::debug!("Stopped {} track {}", self.kind, self.id);
        }
    }

    pub fn is_live(&self) -> bool {
        !self.stopped.load(Ordering::SeqCst)
    }
}

impl fmt::Debug for MediaTrack {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MediaTrack")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .field("origin", &self.origin)
            .field("live", &self.is_live())
            .finish()
    }
}

impl PartialEq for MediaTrack {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id && self.origin == other.origin
    }
}

// ============================================================================
// STREAM
// ============================================================================

/// Sammlung von Spuren, geteilt zwischen Klonen
#[derive(Clone)]
pub struct MediaStream {
    id: String,
    tracks: Arc<Mutex<Vec<MediaTrack>>>,
}

impl MediaStream {
    /// Erstellt einen leeren Stream
    pub fn new() -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            tracks: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn with_tracks(tracks: Vec<MediaTrack>) -> Self {
        let stream = Self::new();
        *stream.tracks.lock() = tracks;
        stream
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Fügt eine Spur hinzu; bereits enthaltene Spuren werden ignoriert
    pub fn add_track(&self, track: MediaTrack) {
        let mut tracks = self.tracks.lock();
        if !tracks.iter().any(|t| *t == track) {
            tracks.push(track);
        }
    }

    pub fn tracks(&self) -> Vec<MediaTrack> {
        self.tracks.lock().clone()
    }

    pub fn len(&self) -> usize {
        self.tracks.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.tracks.lock().is_empty()
    }

    /// Stoppt alle Spuren des Streams
    pub fn stop_all(&self) {
        for track in self.tracks.lock().iter() {
            track.stop();
        }
    }

    /// Prüft ob zwei Handles denselben Stream meinen
    pub fn same_stream(&self, other: &MediaStream) -> bool {
        Arc::ptr_eq(&self.tracks, &other.tracks)
    }
}

impl Default for MediaStream {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for MediaStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MediaStream")
            .field("id", &self.id)
            .field("tracks", &*self.tracks.lock())
            .finish()
    }
}

// ============================================================================
// TESTS
// ============================================================================

//! Aufnahmegeräte
//!
//! `MediaDevices` abstrahiert getUserMedia. `SyntheticDevices` liefert
//! generierte Spuren und kann den Zugriff verweigern (für Tests und
//! Headless-Peers ohne Kamera).

use super::stream::{MediaStream, MediaTrack, TrackKind};
use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, Ordering};
use thiserror::Error;

// ============================================================================
// ERROR TYPES
// ============================================================================

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MediaError {
    #[error("Permission to access {0} denied")]
    PermissionDenied(String),

    #[error("No {0} device found")]
    NoDevice(TrackKind),

    #[error("No media kind requested")]
    EmptyConstraints,
}

// ============================================================================
// CONSTRAINTS
// ============================================================================

/// Welche Spuren angefordert werden
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MediaConstraints {
    pub video: bool,
    pub audio: bool,
}

impl MediaConstraints {
    /// Kamera und Mikrofon
    pub fn camera_and_microphone() -> Self {
        Self {
            video: true,
            audio: true,
        }
    }

    fn kinds(&self) -> Vec<TrackKind> {
        let mut kinds = Vec::new();
        if self.video {
            kinds.push(TrackKind::Video);
        }
        if self.audio {
            kinds.push(TrackKind::Audio);
        }
        kinds
    }
}

impl Default for MediaConstraints {
    fn default() -> Self {
        Self::camera_and_microphone()
    }
}

// ============================================================================
// DEVICES
// ============================================================================

#[async_trait]
pub trait MediaDevices: Send + Sync {
    /// Fordert Zugriff auf die angefragten Geräte an
    async fn get_user_media(
        &self,
        constraints: MediaConstraints,
    ) -> Result<MediaStream, MediaError>;
}

/// Generierte Geräte ohne echte Hardware
#[derive(Debug)]
pub struct SyntheticDevices {
    granted: AtomicBool,
    has_camera: bool,
    has_microphone: bool,
}

impl SyntheticDevices {
    /// Kamera und Mikrofon vorhanden, Zugriff erlaubt
    pub fn new() -> Self {
        Self {
            granted: AtomicBool::new(true),
            has_camera: true,
            has_microphone: true,
        }
    }

    /// Nur Mikrofon (z.B. Server ohne Kamera)
    pub fn audio_only() -> Self {
        Self {
            has_camera: false,
            ..Self::new()
        }
    }

    /// Benutzer verweigert den Zugriff
    pub fn denied() -> Self {
        let devices = Self::new();
        devices.set_granted(false);
        devices
    }

    pub fn set_granted(&self, granted: bool) {
        self.granted.store(granted, Ordering::SeqCst);
    }
}

impl Default for SyntheticDevices {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl MediaDevices for SyntheticDevices {
    async fn get_user_media(
        &self,
        constraints: MediaConstraints,
    ) -> Result<MediaStream, MediaError> {
        let kinds = constraints.kinds();
        if kinds.is_empty() {
            return Err(MediaError::EmptyConstraints);
        }

        if !self.granted.load(Ordering::SeqCst) {
            let what = kinds
                .iter()
                .map(|k| match k {
                    TrackKind::Video => "camera",
                    TrackKind::Audio => "microphone",
                })
                .collect::<Vec<_>>()
                .join(" and ");
            return Err(MediaError::PermissionDenied(what));
        }

        let mut tracks = Vec::with_capacity(kinds.len());
        for kind in kinds {
            let available = match kind {
                TrackKind::Video => self.has_camera,
                TrackKind::Audio => self.has_microphone,
            };
            if !available {
                return Err(MediaError::NoDevice(kind));
            }
            let label = match kind {
                TrackKind::Video => "Synthetic Camera",
                TrackKind::Audio => "Synthetic Microphone",
            };
            tracks.push(MediaTrack::local(kind, label));
        }

        tracing::info!("Granted {} synthetic media track(s)", tracks.len());
        Ok(MediaStream::with_tracks(tracks))
    }
}

// ============================================================================
// TESTS
// ============================================================================

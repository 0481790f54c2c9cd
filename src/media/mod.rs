//! Media Module - Lokale und entfernte Medienspuren
//!
//! Dieses Modul verwaltet:
//! - Media Tracks (Kamera/Mikrofon, lokal und remote)
//! - Media Streams als geteilte Track-Sammlungen
//! - Zugriff auf Aufnahmegeräte (getUserMedia)

mod devices;
mod stream;

pub use devices::{MediaConstraints, MediaDevices, MediaError, SyntheticDevices};
pub use stream::{MediaStream, MediaTrack, TrackKind, TrackOrigin};

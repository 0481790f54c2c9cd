//! Message Types für das Relay-Protokoll
//!
//! JSON über WebSocket, eine Nachricht pro Text-Frame. Requests tragen eine
//! vom Client vergebene `requestId`, Watches eine vom Client vergebene
//! `subscription`-ID, damit Snapshots schon vor der Bestätigung zugeordnet
//! werden können.

use super::document::{Document, DocumentChange, DocumentSnapshot};
use serde::{Deserialize, Serialize};

// ============================================================================
// CLIENT → SERVER MESSAGES
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    /// Dokument anlegen oder ersetzen
    Set {
        #[serde(rename = "requestId")]
        request_id: u64,
        path: String,
        data: Document,
    },

    /// Partielles Update
    Update {
        #[serde(rename = "requestId")]
        request_id: u64,
        path: String,
        data: Document,
    },

    /// Dokument lesen
    Get {
        #[serde(rename = "requestId")]
        request_id: u64,
        path: String,
    },

    /// Dokument mit neuer ID anhängen
    Add {
        #[serde(rename = "requestId")]
        request_id: u64,
        collection: String,
        data: Document,
    },

    /// Dokument löschen
    Delete {
        #[serde(rename = "requestId")]
        request_id: u64,
        path: String,
    },

    /// Einzelnes Dokument beobachten
    WatchDocument {
        #[serde(rename = "requestId")]
        request_id: u64,
        subscription: u64,
        path: String,
    },

    /// Collection beobachten
    WatchCollection {
        #[serde(rename = "requestId")]
        request_id: u64,
        subscription: u64,
        collection: String,
    },

    /// Beobachtung beenden (keine Antwort)
    Unwatch { subscription: u64 },
}

// ============================================================================
// SERVER → CLIENT MESSAGES
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    /// Request erfolgreich ausgeführt
    Ack {
        #[serde(rename = "requestId")]
        request_id: u64,
    },

    /// Antwort auf `Get`
    Document {
        #[serde(rename = "requestId")]
        request_id: u64,
        snapshot: DocumentSnapshot,
    },

    /// Antwort auf `Add`
    Added {
        #[serde(rename = "requestId")]
        request_id: u64,
        id: String,
    },

    /// Fehler (ohne `requestId` wenn die Nachricht nicht lesbar war)
    Error {
        #[serde(rename = "requestId", default, skip_serializing_if = "Option::is_none")]
        request_id: Option<u64>,
        code: i32,
        message: String,
    },

    /// Update für einen Dokument-Watch
    Snapshot {
        subscription: u64,
        snapshot: DocumentSnapshot,
    },

    /// Update für einen Collection-Watch
    Changes {
        subscription: u64,
        changes: Vec<DocumentChange>,
    },
}

impl ServerMessage {
    /// ID des Requests, auf den sich die Nachricht bezieht
    pub fn request_id(&self) -> Option<u64> {
        match self {
            ServerMessage::Ack { request_id }
            | ServerMessage::Document { request_id, .. }
            | ServerMessage::Added { request_id, .. } => Some(*request_id),
            ServerMessage::Error { request_id, .. } => *request_id,
            ServerMessage::Snapshot { .. } | ServerMessage::Changes { .. } => None,
        }
    }
}

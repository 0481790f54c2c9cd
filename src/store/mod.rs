//! Store Module - Dokumentenspeicher als Signaling-Relay
//!
//! Dieses Modul verwaltet:
//! - Dokument- und Collection-Referenzen
//! - Den In-Memory-Store
//! - Den WebSocket-Relay-Server und den passenden Client
//!
//! Watches liefern zuerst den aktuellen Stand (Dokument bzw. alle Dokumente
//! der Collection als `Added`) und danach jede Änderung.

mod client;
mod document;
mod memory;
pub mod protocol;
mod server;
mod subscription;

pub use client::RemoteStore;
pub use document::{
    auto_id, from_document, to_document, ChangeKind, CollectionRef, Document, DocumentChange,
    DocumentRef, DocumentSnapshot, AUTO_ID_LENGTH,
};
pub use memory::MemoryStore;
pub use server::StoreServer;
pub use subscription::Subscription;

use async_trait::async_trait;
use thiserror::Error;

// ============================================================================
// ERROR TYPES
// ============================================================================

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    #[error("Invalid path: {0}")]
    InvalidPath(String),

    #[error("Document not found: {0}")]
    NotFound(String),

    #[error("Invalid document: {0}")]
    InvalidDocument(String),

    #[error("Not connected to document store")]
    NotConnected,

    #[error("Connection to document store failed: {0}")]
    ConnectionFailed(String),

    #[error("Request timed out")]
    Timeout,

    #[error("Store error: {code} - {message}")]
    Server { code: i32, message: String },
}

impl StoreError {
    /// Fehlercode für das Wire-Protokoll
    pub fn code(&self) -> i32 {
        match self {
            StoreError::InvalidPath(_) => 400,
            StoreError::NotFound(_) => 404,
            StoreError::InvalidDocument(_) => 422,
            StoreError::Timeout => 504,
            StoreError::Server { code, .. } => *code,
            _ => 500,
        }
    }

    /// Gegenstück zu `code()` auf Client-Seite
    pub fn from_code(code: i32, message: String) -> Self {
        match code {
            400 => StoreError::InvalidPath(message),
            404 => StoreError::NotFound(message),
            422 => StoreError::InvalidDocument(message),
            _ => StoreError::Server { code, message },
        }
    }

    /// Nachricht ohne Präfix, für die Übertragung
    pub fn detail(&self) -> String {
        match self {
            StoreError::InvalidPath(m)
            | StoreError::NotFound(m)
            | StoreError::InvalidDocument(m)
            | StoreError::ConnectionFailed(m) => m.clone(),
            StoreError::Server { message, .. } => message.clone(),
            other => other.to_string(),
        }
    }
}

// ============================================================================
// STORE TRAIT
// ============================================================================

#[async_trait]
pub trait DocumentStore: Send + Sync {
    /// Schreibt ein Dokument (legt an oder ersetzt)
    async fn set(&self, doc: &DocumentRef, data: Document) -> Result<(), StoreError>;

    /// Partielles Update der obersten Felder; `NotFound` wenn nicht vorhanden
    async fn update(&self, doc: &DocumentRef, data: Document) -> Result<(), StoreError>;

    /// Liest ein Dokument einmalig
    async fn get(&self, doc: &DocumentRef) -> Result<DocumentSnapshot, StoreError>;

    /// Hängt ein Dokument mit neuer ID an eine Collection an
    async fn add(&self, collection: &CollectionRef, data: Document)
        -> Result<DocumentRef, StoreError>;

    /// Löscht ein Dokument. Sub-Collections bleiben bestehen.
    async fn delete(&self, doc: &DocumentRef) -> Result<(), StoreError>;

    async fn watch_document(
        &self,
        doc: &DocumentRef,
    ) -> Result<Subscription<DocumentSnapshot>, StoreError>;

    async fn watch_collection(
        &self,
        collection: &CollectionRef,
    ) -> Result<Subscription<Vec<DocumentChange>>, StoreError>;
}

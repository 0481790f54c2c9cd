//! Dokument- und Collection-Referenzen, Snapshots und Änderungen
//!
//! Pfade bestehen aus abwechselnden Collection- und Dokument-Segmenten:
//! `calls` (Collection), `calls/abc` (Dokument),
//! `calls/abc/offerCandidates` (Sub-Collection).

use super::StoreError;
use chrono::{DateTime, Utc};
use rand::Rng;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Länge automatisch vergebener Dokument-IDs
pub const AUTO_ID_LENGTH: usize = 20;

/// Inhalt eines Dokuments
pub type Document = serde_json::Map<String, serde_json::Value>;

/// Erzeugt eine zufällige, alphanumerische Dokument-ID
pub fn auto_id() -> String {
    let mut rng = rand::thread_rng();
    (0..AUTO_ID_LENGTH)
        .map(|_| rng.sample(rand::distributions::Alphanumeric) as char)
        .collect()
}

fn validate_segment(segment: &str, path: &str) -> Result<(), StoreError> {
    if segment.is_empty() || segment.contains('/') || segment.trim() != segment {
        return Err(StoreError::InvalidPath(path.to_string()));
    }
    Ok(())
}

// ============================================================================
// REFERENCES
// ============================================================================

/// Referenz auf eine (ggf. verschachtelte) Collection
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CollectionRef {
    path: String,
}

impl CollectionRef {
    /// Collection auf oberster Ebene
    pub fn root(name: &str) -> Result<Self, StoreError> {
        validate_segment(name, name)?;
        Ok(Self {
            path: name.to_string(),
        })
    }

    /// Parst einen Collection-Pfad (ungerade Anzahl Segmente)
    pub fn parse(path: &str) -> Result<Self, StoreError> {
        let segments: Vec<&str> = path.split('/').collect();
        if segments.len() % 2 == 0 {
            return Err(StoreError::InvalidPath(path.to_string()));
        }
        for segment in &segments {
            validate_segment(segment, path)?;
        }
        Ok(Self {
            path: path.to_string(),
        })
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    /// Letztes Pfadsegment
    pub fn name(&self) -> &str {
        self.path.rsplit('/').next().unwrap_or(&self.path)
    }

    /// Dokument mit bekannter ID
    pub fn doc(&self, id: &str) -> Result<DocumentRef, StoreError> {
        validate_segment(id, id)?;
        Ok(DocumentRef {
            collection: self.clone(),
            id: id.to_string(),
        })
    }

    /// Neues Dokument mit automatisch vergebener ID
    pub fn new_doc(&self) -> DocumentRef {
        DocumentRef {
            collection: self.clone(),
            id: auto_id(),
        }
    }
}

impl fmt::Display for CollectionRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.path)
    }
}

/// Referenz auf ein Dokument
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DocumentRef {
    collection: CollectionRef,
    id: String,
}

impl DocumentRef {
    /// Parst einen Dokument-Pfad (gerade Anzahl Segmente)
    pub fn parse(path: &str) -> Result<Self, StoreError> {
        let (collection, id) = path
            .rsplit_once('/')
            .ok_or_else(|| StoreError::InvalidPath(path.to_string()))?;
        let collection =
            CollectionRef::parse(collection).map_err(|_| StoreError::InvalidPath(path.to_string()))?;
        collection.doc(id)
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn parent(&self) -> &CollectionRef {
        &self.collection
    }

    pub fn path(&self) -> String {
        format!("{}/{}", self.collection.path, self.id)
    }

    /// Sub-Collection unterhalb dieses Dokuments
    pub fn collection(&self, name: &str) -> Result<CollectionRef, StoreError> {
        validate_segment(name, name)?;
        Ok(CollectionRef {
            path: format!("{}/{}", self.path(), name),
        })
    }
}

impl fmt::Display for DocumentRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.collection.path, self.id)
    }
}

// ============================================================================
// SNAPSHOTS
// ============================================================================

/// Zustand eines Dokuments zu einem Zeitpunkt
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DocumentSnapshot {
    pub id: String,
    /// `None` wenn das Dokument nicht existiert
    pub data: Option<Document>,
    #[serde(rename = "createTime", default)]
    pub create_time: Option<DateTime<Utc>>,
    #[serde(rename = "updateTime", default)]
    pub update_time: Option<DateTime<Utc>>,
}

impl DocumentSnapshot {
    pub fn missing(id: &str) -> Self {
        Self {
            id: id.to_string(),
            data: None,
            create_time: None,
            update_time: None,
        }
    }

    pub fn exists(&self) -> bool {
        self.data.is_some()
    }

    /// Deserialisiert den Inhalt in einen Typ
    pub fn data_as<T: DeserializeOwned>(&self) -> Result<Option<T>, StoreError> {
        self.data
            .as_ref()
            .map(|data| from_document(data.clone()))
            .transpose()
    }
}

/// Art einer Collection-Änderung
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeKind {
    Added,
    Modified,
    Removed,
}

/// Eine Änderung innerhalb einer Collection
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DocumentChange {
    #[serde(rename = "type")]
    pub kind: ChangeKind,
    pub id: String,
    pub data: Document,
}

// ============================================================================
// CONVERSIONS
// ============================================================================

/// Serialisiert einen Wert als Dokument (muss ein JSON-Objekt sein)
pub fn to_document<T: Serialize>(value: &T) -> Result<Document, StoreError> {
    match serde_json::to_value(value) {
        Ok(serde_json::Value::Object(map)) => Ok(map),
        Ok(other) => Err(StoreError::InvalidDocument(format!(
            "expected an object, got {}",
            other
        ))),
        Err(e) => Err(StoreError::InvalidDocument(e.to_string())),
    }
}

pub fn from_document<T: DeserializeOwned>(data: Document) -> Result<T, StoreError> {
    serde_json::from_value(serde_json::Value::Object(data))
        .map_err(|e| StoreError::InvalidDocument(e.to_string()))
}

// ============================================================================
// TESTS
// ============================================================================

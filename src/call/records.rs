//! Call- und Kandidaten-Dokumente
//!
//! ```text
//! calls/{callId}                     { offer: {sdp, type}, answer?: {sdp, type} }
//! calls/{callId}/offerCandidates/*   { candidate, sdpMid, sdpMLineIndex, usernameFragment }
//! calls/{callId}/answerCandidates/*  (wie oben)
//! ```

use crate::engine::{IceCandidate, SessionDescription};
use crate::store::{self, CollectionRef, Document, DocumentRef, StoreError};
use serde::{Deserialize, Serialize};

/// Collection aller Calls
pub const CALLS: &str = "calls";

/// Kandidaten des Anrufers
pub const OFFER_CANDIDATES: &str = "offerCandidates";

/// Kandidaten des Angerufenen
pub const ANSWER_CANDIDATES: &str = "answerCandidates";

/// Inhalt eines Call-Dokuments
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CallRecord {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub offer: Option<SessionDescription>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub answer: Option<SessionDescription>,
}

impl CallRecord {
    pub fn with_offer(offer: SessionDescription) -> Self {
        Self {
            offer: Some(offer),
            answer: None,
        }
    }

    /// Nur das Answer-Feld, für das partielle Update
    pub fn answer_update(answer: SessionDescription) -> Self {
        Self {
            offer: None,
            answer: Some(answer),
        }
    }

    pub fn to_document(&self) -> Result<Document, StoreError> {
        store::to_document(self)
    }
}

pub fn candidate_to_document(candidate: &IceCandidate) -> Result<Document, StoreError> {
    store::to_document(candidate)
}

pub fn candidate_from_document(data: Document) -> Result<IceCandidate, StoreError> {
    store::from_document(data)
}

/// Die drei Referenzen eines Calls
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallPaths {
    pub call: DocumentRef,
    pub offer_candidates: CollectionRef,
    pub answer_candidates: CollectionRef,
}

impl CallPaths {
    /// Neuer Call mit automatisch vergebener ID
    pub fn allocate() -> Result<Self, StoreError> {
        let call = CollectionRef::root(CALLS)?.new_doc();
        Self::for_call(call)
    }

    /// Bestehender Call
    pub fn existing(call_id: &str) -> Result<Self, StoreError> {
        let call = CollectionRef::root(CALLS)?.doc(call_id)?;
        Self::for_call(call)
    }

    fn for_call(call: DocumentRef) -> Result<Self, StoreError> {
        Ok(Self {
            offer_candidates: call.collection(OFFER_CANDIDATES)?,
            answer_candidates: call.collection(ANSWER_CANDIDATES)?,
            call,
        })
    }

    pub fn call_id(&self) -> &str {
        self.call.id()
    }
}

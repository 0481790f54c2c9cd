//! Call Module - Anruf-Ablauf
//!
//! Dieses Modul verwaltet:
//! - Die `CallSession` (Medien starten, Call anlegen/beitreten, auflegen)
//! - Das Layout der Call-Dokumente im Store
//! - Den Zustand der Bedienoberfläche

mod controls;
mod records;
mod session;

pub use controls::ControlPanel;
pub use records::{
    candidate_from_document, candidate_to_document, CallPaths, CallRecord, ANSWER_CANDIDATES,
    CALLS, OFFER_CANDIDATES,
};
pub use session::{CallError, CallEvent, CallSession, CallState};

//! Call Session
//!
//! Koordiniert Peer Connection und Dokumentenspeicher für einen Anruf:
//! Medien starten, Call anlegen (Offer), Call beitreten (Answer), auflegen.
//!
//! Die Session besitzt genau eine Peer Connection. Beim Auflegen wird sie
//! durch eine neue ersetzt; alle Live-Subscriptions des Calls werden dabei
//! beendet und Events der alten Verbindung ignoriert.

use super::controls::ControlPanel;
use super::records::{candidate_from_document, candidate_to_document, CallPaths, CallRecord};
use crate::engine::{
    CandidateHandler, ConnectionError, ConnectionFactory, ConnectionState, IceCandidate,
    PeerConnection, SessionDescription, SignalingState,
};
use crate::media::{MediaConstraints, MediaDevices, MediaError, MediaStream, TrackKind};
use crate::store::{
    ChangeKind, CollectionRef, DocumentChange, DocumentSnapshot, DocumentStore, StoreError,
    Subscription,
};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;

// ============================================================================
// ERROR TYPES
// ============================================================================

#[derive(Error, Debug)]
pub enum CallError {
    #[error("Media access failed: {0}")]
    MediaAccess(#[from] MediaError),

    #[error("Media not started")]
    MediaNotReady,

    #[error("Media already started")]
    MediaAlreadyStarted,

    #[error("Already in a call")]
    AlreadyInCall,

    #[error("Call not found: {0}")]
    CallNotFound(String),

    #[error("Call already answered: {0}")]
    AlreadyAnswered(String),

    #[error("Failed to write signaling data: {0}")]
    SignalingWrite(StoreError),

    #[error("Failed to read call record: {0}")]
    SignalingRead(StoreError),

    #[error("Failed to subscribe to call updates: {0}")]
    Subscription(StoreError),

    #[error("Invalid call record: {0}")]
    InvalidRecord(StoreError),

    #[error("Connection error: {0}")]
    Connection(#[from] ConnectionError),
}

// ============================================================================
// CALL STATE
// ============================================================================

/// Aktueller Status der Session
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CallState {
    /// Noch keine Medien
    Idle,
    /// Kamera/Mikrofon laufen
    MediaReady,
    /// Offer wird erstellt oder wartet auf Answer
    Offering { call_id: String },
    /// Answer wird erstellt oder wartet auf Verbindung
    Answering { call_id: String },
    /// Verbindung steht
    Connected { call_id: String },
    /// Verbindung fehlgeschlagen oder abgebrochen
    Failed { call_id: String },
    /// Aufgelegt
    Closed,
}

impl CallState {
    pub fn label(&self) -> &'static str {
        match self {
            CallState::Idle => "idle",
            CallState::MediaReady => "media_ready",
            CallState::Offering { .. } => "offering",
            CallState::Answering { .. } => "answering",
            CallState::Connected { .. } => "connected",
            CallState::Failed { .. } => "failed",
            CallState::Closed => "closed",
        }
    }

    pub fn call_id(&self) -> Option<&str> {
        match self {
            CallState::Offering { call_id }
            | CallState::Answering { call_id }
            | CallState::Connected { call_id }
            | CallState::Failed { call_id } => Some(call_id),
            _ => None,
        }
    }
}

/// Events die von der CallSession ausgelöst werden
#[derive(Debug, Clone)]
pub enum CallEvent {
    StateChanged(CallState),
    /// Lokaler Kandidat wurde in die Collection geschrieben
    LocalCandidate { collection: String },
    RemoteTrack { kind: TrackKind, id: String },
    AnswerApplied,
    Error(String),
}

// ============================================================================
// CALL SESSION
// ============================================================================

pub struct CallSession {
    store: Arc<dyn DocumentStore>,
    factory: Arc<dyn ConnectionFactory>,
    devices: Arc<dyn MediaDevices>,
    connection: Mutex<Arc<dyn PeerConnection>>,
    /// Wird beim Ersetzen der Verbindung erhöht
    generation: Arc<AtomicU64>,
    local_stream: Mutex<Option<MediaStream>>,
    remote_stream: Mutex<Option<MediaStream>>,
    controls: Mutex<ControlPanel>,
    state: Arc<Mutex<CallState>>,
    /// Live-Subscriptions des aktuellen Calls
    listeners: Mutex<Vec<JoinHandle<()>>>,
    /// Freigabe für das Veröffentlichen lokaler Kandidaten
    publish_gate: Mutex<Option<watch::Sender<bool>>>,
    event_tx: broadcast::Sender<CallEvent>,
}

impl CallSession {
    /// Erstellt eine Session mit einer frischen Peer Connection
    pub async fn new(
        store: Arc<dyn DocumentStore>,
        factory: Arc<dyn ConnectionFactory>,
        devices: Arc<dyn MediaDevices>,
    ) -> Result<Self, CallError> {
        let (event_tx, _) = broadcast::channel(100);
        let connection = factory.create().await?;

        let session = Self {
            store,
            factory,
            devices,
            connection: Mutex::new(Arc::clone(&connection)),
            generation: Arc::new(AtomicU64::new(0)),
            local_stream: Mutex::new(None),
            remote_stream: Mutex::new(None),
            controls: Mutex::new(ControlPanel::initial()),
            state: Arc::new(Mutex::new(CallState::Idle)),
            listeners: Mutex::new(Vec::new()),
            publish_gate: Mutex::new(None),
            event_tx,
        };
        session.install_state_handler(&connection);

        Ok(session)
    }

    /// Gibt einen Event-Receiver zurück
    pub fn subscribe(&self) -> broadcast::Receiver<CallEvent> {
        self.event_tx.subscribe()
    }

    /// Gibt den aktuellen Call-Status zurück
    pub fn state(&self) -> CallState {
        self.state.lock().clone()
    }

    /// Momentaufnahme der Bedienoberfläche
    pub fn controls(&self) -> ControlPanel {
        self.controls.lock().clone()
    }

    /// Die aktuelle Peer Connection
    pub fn connection(&self) -> Arc<dyn PeerConnection> {
        Arc::clone(&self.connection.lock())
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.connection().connection_state()
    }

    pub fn local_stream(&self) -> Option<MediaStream> {
        self.local_stream.lock().clone()
    }

    pub fn remote_stream(&self) -> Option<MediaStream> {
        self.remote_stream.lock().clone()
    }

    // ========================================================================
    // OPERATIONS
    // ========================================================================

    /// Startet Kamera und Mikrofon und hängt die Spuren an die Verbindung
    pub async fn start_media(&self) -> Result<(), CallError> {
        match self.state() {
            CallState::Idle | CallState::Closed => {}
            CallState::MediaReady => return Err(CallError::MediaAlreadyStarted),
            _ => return Err(CallError::AlreadyInCall),
        }

        let local = self
            .devices
            .get_user_media(MediaConstraints::camera_and_microphone())
            .await?;
        let remote = MediaStream::new();

        // Nach fehlgeschlagenem Ersetzen beim Auflegen
        if self.connection().signaling_state() == SignalingState::Closed {
            if let Err(e) = self.replace_connection().await {
                local.stop_all();
                return Err(e);
            }
        }

        // Lokale Spuren an die Peer Connection
        let pc = self.connection();
        for track in local.tracks() {
            if let Err(e) = pc.add_track(&track).await {
                local.stop_all();
                return Err(e.into());
            }
        }

        // Remote-Spuren sammeln
        let sink = remote.clone();
        let event_tx = self.event_tx.clone();
        pc.on_track(Box::new(move |track| {
            tracing::info!("Received remote {} track {}", track.kind(), track.id());
            let _ = event_tx.send(CallEvent::RemoteTrack {
                kind: track.kind(),
                id: track.id().to_string(),
            });
            sink.add_track(track);
        }));

        *self.local_stream.lock() = Some(local.clone());
        *self.remote_stream.lock() = Some(remote.clone());
        self.controls.lock().media_ready(local, remote);
        self.set_state(CallState::MediaReady);

        Ok(())
    }

    /// Legt einen neuen Call an und gibt dessen ID zurück
    pub async fn create_call(&self) -> Result<String, CallError> {
        self.ensure_media_ready()?;

        let paths = CallPaths::allocate().map_err(CallError::InvalidRecord)?;
        let call_id = paths.call_id().to_string();
        self.controls.lock().call_input = call_id.clone();
        tracing::info!("Creating call {}", call_id);

        self.set_state(CallState::Offering {
            call_id: call_id.clone(),
        });

        match self.offer(&paths).await {
            Ok(()) => {
                self.controls.lock().in_call();
                Ok(call_id)
            }
            Err(e) => {
                self.abandon_call_setup();
                Err(e)
            }
        }
    }

    /// Tritt einem bestehenden Call bei
    pub async fn join_call(&self, call_id: &str) -> Result<(), CallError> {
        self.ensure_media_ready()?;

        let call_id = call_id.trim();
        self.controls.lock().call_input = call_id.to_string();
        if call_id.is_empty() {
            return Err(CallError::CallNotFound(String::new()));
        }
        let paths = CallPaths::existing(call_id)
            .map_err(|_| CallError::CallNotFound(call_id.to_string()))?;

        // Offer vom Anrufer holen
        let snapshot = self
            .store
            .get(&paths.call)
            .await
            .map_err(CallError::SignalingRead)?;
        let record = snapshot
            .data_as::<CallRecord>()
            .map_err(CallError::InvalidRecord)?
            .ok_or_else(|| CallError::CallNotFound(call_id.to_string()))?;
        if record.answer.is_some() {
            return Err(CallError::AlreadyAnswered(call_id.to_string()));
        }
        let offer = record
            .offer
            .ok_or_else(|| CallError::CallNotFound(call_id.to_string()))?;

        tracing::info!("Joining call {}", call_id);
        tracing::debug!("Caller offer description: {:?}", offer);

        self.set_state(CallState::Answering {
            call_id: call_id.to_string(),
        });

        match self.answer(&paths, offer).await {
            Ok(()) => {
                self.controls.lock().in_call();
                Ok(())
            }
            Err(e) => {
                self.abandon_call_setup();
                Err(e)
            }
        }
    }

    /// Beendet den Call
    ///
    /// Das Löschen des Call-Dokuments ist best effort: Fehler werden
    /// protokolliert, aber nicht zurückgegeben. Schlägt das Erzeugen der
    /// neuen Peer Connection fehl, ist der Call trotzdem vollständig
    /// abgebaut und der Fehler wird danach zurückgegeben.
    pub async fn hang_up(&self) -> Result<(), CallError> {
        tracing::info!("Hanging up");

        // Subscriptions beenden
        for handle in self.listeners.lock().drain(..) {
            handle.abort();
        }
        self.publish_gate.lock().take();

        // Events der alten Verbindung ab hier ignorieren
        self.generation.fetch_add(1, Ordering::SeqCst);
        let old = self.connection();
        if let Err(e) = old.close().await {
            tracing::warn!("Failed to close peer connection: {}", e);
        }

        // Alle Spuren stoppen
        if let Some(local) = self.local_stream.lock().take() {
            local.stop_all();
        }
        if let Some(remote) = self.remote_stream.lock().take() {
            remote.stop_all();
        }

        let call_id = {
            let mut controls = self.controls.lock();
            controls.reset();
            std::mem::take(&mut controls.call_input)
        };

        let call_id = call_id.trim();
        if !call_id.is_empty() {
            self.delete_call(call_id).await;
        }

        self.set_state(CallState::Closed);

        // Peer Connection ersetzen
        self.replace_connection().await
    }

    // ========================================================================
    // CALL SETUP
    // ========================================================================

    /// Offer erzeugen, Call-Dokument schreiben, auf die Gegenseite hören
    async fn offer(&self, paths: &CallPaths) -> Result<(), CallError> {
        let pc = self.connection();

        // Kandidaten erst nach dem Call-Dokument veröffentlichen
        let (gate, opened) = watch::channel(false);
        *self.publish_gate.lock() = Some(gate);
        pc.on_ice_candidate(self.candidate_publisher(paths.offer_candidates.clone(), opened));

        // SDP Offer erstellen
        let offer = pc.create_offer().await?;
        pc.set_local_description(offer.clone()).await?;
        tracing::debug!("Offer description: {:?}", offer);

        let record = CallRecord::with_offer(offer)
            .to_document()
            .map_err(CallError::InvalidRecord)?;
        self.store
            .set(&paths.call, record)
            .await
            .map_err(CallError::SignalingWrite)?;

        if let Some(gate) = self.publish_gate.lock().as_ref() {
            gate.send_modify(|open| *open = true);
        }

        // Auf Answer und Kandidaten des Angerufenen warten
        let record_updates = self
            .store
            .watch_document(&paths.call)
            .await
            .map_err(CallError::Subscription)?;
        let candidate_updates = self
            .store
            .watch_collection(&paths.answer_candidates)
            .await
            .map_err(CallError::Subscription)?;

        self.spawn_listener(apply_answers(
            record_updates,
            Arc::clone(&pc),
            self.event_tx.clone(),
        ));
        self.spawn_listener(apply_candidates(
            candidate_updates,
            Arc::clone(&pc),
            paths.answer_candidates.clone(),
        ));

        Ok(())
    }

    /// Offer anwenden, Answer schreiben, auf Kandidaten des Anrufers hören
    async fn answer(&self, paths: &CallPaths, offer: SessionDescription) -> Result<(), CallError> {
        let pc = self.connection();

        // Das Call-Dokument existiert bereits
        let (gate, opened) = watch::channel(true);
        *self.publish_gate.lock() = Some(gate);
        pc.on_ice_candidate(self.candidate_publisher(paths.answer_candidates.clone(), opened));

        pc.set_remote_description(offer).await?;
        let answer = pc.create_answer().await?;
        pc.set_local_description(answer.clone()).await?;
        tracing::debug!("Answer description: {:?}", answer);

        let update = CallRecord::answer_update(answer)
            .to_document()
            .map_err(CallError::InvalidRecord)?;
        self.store
            .update(&paths.call, update)
            .await
            .map_err(CallError::SignalingWrite)?;

        let candidate_updates = self
            .store
            .watch_collection(&paths.offer_candidates)
            .await
            .map_err(CallError::Subscription)?;
        self.spawn_listener(apply_candidates(
            candidate_updates,
            Arc::clone(&pc),
            paths.offer_candidates.clone(),
        ));

        Ok(())
    }

    /// Rückkehr nach MediaReady, wenn Create/Join unterwegs scheitert
    fn abandon_call_setup(&self) {
        for handle in self.listeners.lock().drain(..) {
            handle.abort();
        }
        self.publish_gate.lock().take();
        self.set_state(CallState::MediaReady);
    }

    /// Setzt eine frische Peer Connection in den Slot
    async fn replace_connection(&self) -> Result<(), CallError> {
        let fresh = match self.factory.create().await {
            Ok(fresh) => fresh,
            Err(e) => {
                tracing::error!("Failed to create peer connection: {}", e);
                return Err(e.into());
            }
        };

        self.generation.fetch_add(1, Ordering::SeqCst);
        self.install_state_handler(&fresh);
        *self.connection.lock() = fresh;
        Ok(())
    }

    // ========================================================================
    // PRIVATE METHODS
    // ========================================================================

    fn ensure_media_ready(&self) -> Result<(), CallError> {
        match self.state() {
            CallState::MediaReady => Ok(()),
            CallState::Idle | CallState::Closed => Err(CallError::MediaNotReady),
            _ => Err(CallError::AlreadyInCall),
        }
    }

    async fn delete_call(&self, call_id: &str) {
        let result = match CallPaths::existing(call_id) {
            Ok(paths) => self.store.delete(&paths.call).await,
            Err(e) => Err(e),
        };

        match result {
            Ok(()) => tracing::info!("Deleted call document {}", call_id),
            Err(e) => {
                tracing::error!("Error deleting call document: {}", e);
                let _ = self.event_tx.send(CallEvent::Error(e.to_string()));
            }
        }
    }

    /// Schreibt jeden lokalen Kandidaten als eigenes Dokument
    ///
    /// Jeder Schreibvorgang wartet, bis `opened` auf `true` steht. Wird der
    /// Sender verworfen, ohne zu öffnen, gehen die Kandidaten verloren.
    fn candidate_publisher(
        &self,
        collection: CollectionRef,
        opened: watch::Receiver<bool>,
    ) -> CandidateHandler {
        let store = Arc::clone(&self.store);
        let event_tx = self.event_tx.clone();

        Box::new(move |candidate: IceCandidate| {
            let store = Arc::clone(&store);
            let collection = collection.clone();
            let event_tx = event_tx.clone();
            let mut opened = opened.clone();

            tokio::spawn(async move {
                if opened.wait_for(|open| *open).await.is_err() {
                    tracing::debug!("Call setup abandoned, dropping candidate for {}", collection);
                    return;
                }

                let result = match candidate_to_document(&candidate) {
                    Ok(data) => store.add(&collection, data).await.map(|_| ()),
                    Err(e) => Err(e),
                };

                match result {
                    Ok(()) => {
                        tracing::debug!("Published candidate to {}", collection);
                        let _ = event_tx.send(CallEvent::LocalCandidate {
                            collection: collection.name().to_string(),
                        });
                    }
                    Err(e) => {
                        tracing::error!("Failed to publish candidate to {}: {}", collection, e);
                        let _ = event_tx.send(CallEvent::Error(e.to_string()));
                    }
                }
            });
        })
    }

    /// Übersetzt den Netzwerkstatus der Verbindung in den Call-Status
    fn install_state_handler(&self, pc: &Arc<dyn PeerConnection>) {
        let state = Arc::clone(&self.state);
        let event_tx = self.event_tx.clone();
        let generation = Arc::clone(&self.generation);
        let expected = generation.load(Ordering::SeqCst);

        pc.on_connection_state_change(Box::new(move |s: ConnectionState| {
            if generation.load(Ordering::SeqCst) != expected {
                return;
            }

            let new_state = {
                let current = state.lock();
                match (s, &*current) {
                    (
                        ConnectionState::Connected,
                        CallState::Offering { call_id } | CallState::Answering { call_id },
                    ) => Some(CallState::Connected {
                        call_id: call_id.clone(),
                    }),
                    (
                        ConnectionState::Failed | ConnectionState::Disconnected,
                        CallState::Offering { call_id }
                        | CallState::Answering { call_id }
                        | CallState::Connected { call_id },
                    ) => Some(CallState::Failed {
                        call_id: call_id.clone(),
                    }),
                    _ => None,
                }
            };

            if let Some(new_state) = new_state {
                tracing::info!("Call state: {:?}", new_state);
                *state.lock() = new_state.clone();
                let _ = event_tx.send(CallEvent::StateChanged(new_state));
            }
        }));
    }

    fn spawn_listener<F>(&self, future: F)
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        self.listeners.lock().push(tokio::spawn(future));
    }

    /// Aktualisiert den State und sendet Event
    fn set_state(&self, new_state: CallState) {
        *self.state.lock() = new_state.clone();
        let _ = self.event_tx.send(CallEvent::StateChanged(new_state));
    }
}

impl Drop for CallSession {
    fn drop(&mut self) {
        for handle in self.listeners.lock().drain(..) {
            handle.abort();
        }
    }
}

impl std::fmt::Debug for CallSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CallSession")
            .field("state", &self.state())
            .field("connection", &self.connection_state())
            .field("listeners", &self.listeners.lock().len())
            .finish()
    }
}

// ============================================================================
// LISTENERS
// ============================================================================

/// Setzt die erste Answer als Remote Description
///
/// Die Updates werden nacheinander verarbeitet; sobald die Verbindung eine
/// Remote Description hat, werden weitere Answers ignoriert.
async fn apply_answers(
    mut updates: Subscription<DocumentSnapshot>,
    pc: Arc<dyn PeerConnection>,
    event_tx: broadcast::Sender<CallEvent>,
) {
    while let Some(snapshot) = updates.recv().await {
        let record = match snapshot.data_as::<CallRecord>() {
            Ok(Some(record)) => record,
            Ok(None) => continue,
            Err(e) => {
                tracing::warn!("Ignoring malformed call record: {}", e);
                continue;
            }
        };

        let Some(answer) = record.answer else {
            continue;
        };
        if pc.current_remote_description().await.is_some() {
            continue;
        }

        tracing::info!("Answer received, setting remote description");
        match pc.set_remote_description(answer).await {
            Ok(()) => {
                let _ = event_tx.send(CallEvent::AnswerApplied);
            }
            Err(e) => {
                tracing::error!("Failed to apply answer: {}", e);
                let _ = event_tx.send(CallEvent::Error(e.to_string()));
            }
        }
    }
}

/// Wendet jeden neu hinzugekommenen Remote-Kandidaten an
async fn apply_candidates(
    mut updates: Subscription<Vec<DocumentChange>>,
    pc: Arc<dyn PeerConnection>,
    collection: CollectionRef,
) {
    while let Some(changes) = updates.recv().await {
        for change in changes {
            if change.kind != ChangeKind::Added {
                continue;
            }

            let candidate = match candidate_from_document(change.data) {
                Ok(candidate) => candidate,
                Err(e) => {
                    tracing::warn!("Ignoring malformed candidate {} in {}: {}", change.id, collection, e);
                    continue;
                }
            };

            tracing::debug!("Adding remote candidate from {}", collection);
            if let Err(e) = pc.add_ice_candidate(candidate).await {
                tracing::warn!("Failed to add ICE candidate: {}", e);
            }
        }
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::{
        LoopbackConnection, LoopbackFactory, SdpType, SessionDescription, SignalingState,
        StateHandler, TrackHandler,
    };
    use crate::media::{MediaTrack, SyntheticDevices};
    use crate::store::{CollectionRef, Document, DocumentRef, MemoryStore};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicBool, AtomicUsize};
    use std::time::Duration;
    use tracing_test::traced_test;

    async fn session_with(
        store: Arc<dyn DocumentStore>,
        factory: Arc<dyn ConnectionFactory>,
    ) -> CallSession {
        CallSession::new(store, factory, Arc::new(SyntheticDevices::new()))
            .await
            .unwrap()
    }

    async fn session(store: &Arc<MemoryStore>) -> CallSession {
        session_with(store.clone(), Arc::new(LoopbackFactory::new())).await
    }

    async fn wait_for(what: &str, condition: impl Fn() -> bool) {
        let result = tokio::time::timeout(Duration::from_secs(5), async {
            while !condition() {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await;
        assert!(result.is_ok(), "timed out waiting for {}", what);
    }

    async fn record(store: &MemoryStore, call_id: &str) -> Option<CallRecord> {
        let call = CallPaths::existing(call_id).unwrap().call;
        store.get(&call).await.unwrap().data_as().unwrap()
    }

    #[tokio::test]
    async fn test_start_media_enables_call_controls() {
        let store = Arc::new(MemoryStore::new());
        let session = session(&store).await;

        session.start_media().await.unwrap();

        let controls = session.controls();
        assert!(!controls.start && controls.call && controls.answer && !controls.hangup);

        let local = controls.local_video.unwrap();
        let granted = session.local_stream().unwrap();
        assert!(local.same_stream(&granted));
        assert_eq!(local.len(), 2);
        assert!(controls.remote_video.unwrap().is_empty());
        assert_eq!(session.state(), CallState::MediaReady);
    }

    #[tokio::test]
    async fn test_start_media_denied_keeps_controls() {
        let store: Arc<dyn DocumentStore> = Arc::new(MemoryStore::new());
        let session = CallSession::new(
            store,
            Arc::new(LoopbackFactory::new()),
            Arc::new(SyntheticDevices::denied()),
        )
        .await
        .unwrap();

        let err = session.start_media().await.unwrap_err();
        assert!(matches!(err, CallError::MediaAccess(_)));

        let controls = session.controls();
        assert!(controls.start && !controls.call && !controls.answer);
        assert!(controls.local_video.is_none());
        assert_eq!(session.state(), CallState::Idle);
    }

    #[tokio::test]
    async fn test_start_media_twice() {
        let store = Arc::new(MemoryStore::new());
        let session = session(&store).await;

        session.start_media().await.unwrap();
        assert!(matches!(
            session.start_media().await,
            Err(CallError::MediaAlreadyStarted)
        ));
    }

    #[tokio::test]
    async fn test_create_call_requires_media() {
        let store = Arc::new(MemoryStore::new());
        let session = session(&store).await;

        assert!(matches!(
            session.create_call().await,
            Err(CallError::MediaNotReady)
        ));
    }

    #[tokio::test]
    async fn test_create_call_writes_offer() {
        let store = Arc::new(MemoryStore::new());
        let caller = session(&store).await;
        caller.start_media().await.unwrap();

        let call_id = caller.create_call().await.unwrap();

        assert_eq!(caller.controls().call_input, call_id);
        let record = record(&store, &call_id).await.unwrap();
        let offer = record.offer.unwrap();
        assert_eq!(offer.sdp_type, SdpType::Offer);
        assert!(!offer.sdp.is_empty());
        assert!(record.answer.is_none());

        let controls = caller.controls();
        assert!(!controls.start && !controls.call && !controls.answer && controls.hangup);
        assert_eq!(
            caller.state(),
            CallState::Offering {
                call_id: call_id.clone()
            }
        );

        let offer_candidates = CallPaths::existing(&call_id).unwrap().offer_candidates;
        wait_for("offer candidates", || {
            store.collection_len(&offer_candidates) > 0
        })
        .await;
    }

    #[tokio::test]
    async fn test_join_call_writes_single_answer() {
        let store = Arc::new(MemoryStore::new());
        let caller = session(&store).await;
        let callee = session(&store).await;
        caller.start_media().await.unwrap();
        callee.start_media().await.unwrap();

        let call_id = caller.create_call().await.unwrap();
        let offer = record(&store, &call_id).await.unwrap().offer;

        callee.join_call(&call_id).await.unwrap();

        let record = record(&store, &call_id).await.unwrap();
        assert_eq!(record.offer, offer);
        assert_eq!(record.answer.unwrap().sdp_type, SdpType::Answer);
        assert_eq!(callee.controls().call_input, call_id);

        // Ein zweiter Beitritt darf keine weitere Answer schreiben
        let third = session(&store).await;
        third.start_media().await.unwrap();
        assert!(matches!(
            third.join_call(&call_id).await,
            Err(CallError::AlreadyAnswered(_))
        ));
    }

    #[tokio::test]
    async fn test_join_unknown_call() {
        let store = Arc::new(MemoryStore::new());
        let callee = session(&store).await;
        callee.start_media().await.unwrap();

        let err = callee.join_call("doesnotexist").await.unwrap_err();
        assert!(matches!(err, CallError::CallNotFound(_)));
        assert!(matches!(
            callee.join_call("  ").await,
            Err(CallError::CallNotFound(_))
        ));

        let controls = callee.controls();
        assert!(controls.call && controls.answer && !controls.hangup);
        assert_eq!(callee.state(), CallState::MediaReady);
    }

    #[tokio::test]
    async fn test_join_record_without_offer() {
        let store = Arc::new(MemoryStore::new());
        let call = CallPaths::existing("empty").unwrap().call;
        store.set(&call, Document::new()).await.unwrap();

        let callee = session(&store).await;
        callee.start_media().await.unwrap();
        assert!(matches!(
            callee.join_call("empty").await,
            Err(CallError::CallNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_end_to_end_connects() {
        let store = Arc::new(MemoryStore::new());
        let caller = session(&store).await;
        let callee = session(&store).await;
        caller.start_media().await.unwrap();
        callee.start_media().await.unwrap();

        let call_id = caller.create_call().await.unwrap();
        callee.join_call(&call_id).await.unwrap();

        wait_for("both peers connected", || {
            caller.connection_state() == ConnectionState::Connected
                && callee.connection_state() == ConnectionState::Connected
        })
        .await;

        assert_eq!(
            caller.state(),
            CallState::Connected {
                call_id: call_id.clone()
            }
        );
        assert_eq!(
            callee.state(),
            CallState::Connected {
                call_id: call_id.clone()
            }
        );

        let paths = CallPaths::existing(&call_id).unwrap();
        assert!(store.collection_len(&paths.offer_candidates) > 0);
        assert!(store.collection_len(&paths.answer_candidates) > 0);

        // Jede Seite empfängt Kamera und Mikrofon der anderen
        assert_eq!(caller.remote_stream().unwrap().len(), 2);
        assert_eq!(callee.remote_stream().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_duplicate_candidate_keeps_connection() {
        let store = Arc::new(MemoryStore::new());
        let caller = session(&store).await;
        let callee = session(&store).await;
        caller.start_media().await.unwrap();
        callee.start_media().await.unwrap();

        let call_id = caller.create_call().await.unwrap();
        callee.join_call(&call_id).await.unwrap();
        wait_for("callee connected", || {
            callee.connection_state() == ConnectionState::Connected
        })
        .await;

        // Denselben Kandidaten erneut veröffentlichen
        let paths = CallPaths::existing(&call_id).unwrap();
        let mut sub = store.watch_collection(&paths.offer_candidates).await.unwrap();
        let existing = sub.recv().await.unwrap();
        store
            .add(&paths.offer_candidates, existing[0].data.clone())
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(callee.connection_state(), ConnectionState::Connected);
    }

    // ------------------------------------------------------------------------
    // Zählt set_remote_description-Aufrufe
    // ------------------------------------------------------------------------

    struct CountingConnection {
        inner: LoopbackConnection,
        remote_sets: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl PeerConnection for CountingConnection {
        async fn add_track(&self, track: &MediaTrack) -> Result<(), ConnectionError> {
            self.inner.add_track(track).await
        }
        fn on_track(&self, handler: TrackHandler) {
            self.inner.on_track(handler)
        }
        fn on_ice_candidate(&self, handler: CandidateHandler) {
            self.inner.on_ice_candidate(handler)
        }
        fn on_connection_state_change(&self, handler: StateHandler) {
            self.inner.on_connection_state_change(handler)
        }
        async fn create_offer(&self) -> Result<SessionDescription, ConnectionError> {
            self.inner.create_offer().await
        }
        async fn create_answer(&self) -> Result<SessionDescription, ConnectionError> {
            self.inner.create_answer().await
        }
        async fn set_local_description(
            &self,
            desc: SessionDescription,
        ) -> Result<(), ConnectionError> {
            self.inner.set_local_description(desc).await
        }
        async fn set_remote_description(
            &self,
            desc: SessionDescription,
        ) -> Result<(), ConnectionError> {
            self.remote_sets.fetch_add(1, Ordering::SeqCst);
            self.inner.set_remote_description(desc).await
        }
        async fn current_remote_description(&self) -> Option<SessionDescription> {
            self.inner.current_remote_description().await
        }
        async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), ConnectionError> {
            self.inner.add_ice_candidate(candidate).await
        }
        fn signaling_state(&self) -> SignalingState {
            self.inner.signaling_state()
        }
        fn connection_state(&self) -> ConnectionState {
            self.inner.connection_state()
        }
        async fn close(&self) -> Result<(), ConnectionError> {
            self.inner.close().await
        }
    }

    struct CountingFactory {
        remote_sets: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl ConnectionFactory for CountingFactory {
        async fn create(&self) -> Result<Arc<dyn PeerConnection>, ConnectionError> {
            Ok(Arc::new(CountingConnection {
                inner: LoopbackConnection::new(),
                remote_sets: Arc::clone(&self.remote_sets),
            }))
        }
    }

    /// Answer einer unabhängigen Gegenstelle
    async fn answer_for(offer: SessionDescription) -> SessionDescription {
        let peer = LoopbackConnection::new();
        peer.set_remote_description(offer).await.unwrap();
        peer.create_answer().await.unwrap()
    }

    #[tokio::test]
    async fn test_answer_applied_at_most_once() {
        let store = Arc::new(MemoryStore::new());
        let remote_sets = Arc::new(AtomicUsize::new(0));
        let caller = session_with(
            store.clone(),
            Arc::new(CountingFactory {
                remote_sets: Arc::clone(&remote_sets),
            }),
        )
        .await;
        caller.start_media().await.unwrap();
        let call_id = caller.create_call().await.unwrap();

        let offer = record(&store, &call_id).await.unwrap().offer.unwrap();
        let first = answer_for(offer.clone()).await;
        let second = answer_for(offer).await;

        // Zwei Updates direkt hintereinander
        let call = CallPaths::existing(&call_id).unwrap().call;
        for answer in [first.clone(), second] {
            let update = CallRecord::answer_update(answer).to_document().unwrap();
            store.update(&call, update).await.unwrap();
        }

        wait_for("answer applied", || remote_sets.load(Ordering::SeqCst) > 0).await;
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert_eq!(remote_sets.load(Ordering::SeqCst), 1);
        assert_eq!(
            caller.connection().current_remote_description().await,
            Some(first)
        );
    }

    // ------------------------------------------------------------------------
    // Store mit Schreiblatenz und gezielten Fehlern
    // ------------------------------------------------------------------------

    struct FaultyStore {
        inner: MemoryStore,
        set_delay: Duration,
        fail_delete: bool,
        fail_next_watch: AtomicBool,
        /// Kandidat geschrieben, bevor das Call-Dokument existierte
        orphan_candidate: AtomicBool,
    }

    impl FaultyStore {
        fn wrapping(inner: MemoryStore) -> Self {
            Self {
                inner,
                set_delay: Duration::ZERO,
                fail_delete: false,
                fail_next_watch: AtomicBool::new(false),
                orphan_candidate: AtomicBool::new(false),
            }
        }

        fn unavailable() -> StoreError {
            StoreError::Server {
                code: 503,
                message: "unavailable".to_string(),
            }
        }
    }

    #[async_trait]
    impl DocumentStore for FaultyStore {
        async fn set(&self, doc: &DocumentRef, data: Document) -> Result<(), StoreError> {
            tokio::time::sleep(self.set_delay).await;
            self.inner.set(doc, data).await
        }
        async fn update(&self, doc: &DocumentRef, data: Document) -> Result<(), StoreError> {
            self.inner.update(doc, data).await
        }
        async fn get(&self, doc: &DocumentRef) -> Result<DocumentSnapshot, StoreError> {
            self.inner.get(doc).await
        }
        async fn add(
            &self,
            collection: &CollectionRef,
            data: Document,
        ) -> Result<DocumentRef, StoreError> {
            if let Some((owner, _)) = collection.path().rsplit_once('/') {
                let owner = DocumentRef::parse(owner)?;
                if !self.inner.get(&owner).await?.exists() {
                    self.orphan_candidate.store(true, Ordering::SeqCst);
                }
            }
            self.inner.add(collection, data).await
        }
        async fn delete(&self, doc: &DocumentRef) -> Result<(), StoreError> {
            if self.fail_delete {
                return Err(Self::unavailable());
            }
            self.inner.delete(doc).await
        }
        async fn watch_document(
            &self,
            doc: &DocumentRef,
        ) -> Result<Subscription<DocumentSnapshot>, StoreError> {
            self.inner.watch_document(doc).await
        }
        async fn watch_collection(
            &self,
            collection: &CollectionRef,
        ) -> Result<Subscription<Vec<DocumentChange>>, StoreError> {
            if self.fail_next_watch.swap(false, Ordering::SeqCst) {
                return Err(Self::unavailable());
            }
            self.inner.watch_collection(collection).await
        }
    }

    #[tokio::test]
    async fn test_offer_candidates_wait_for_call_record() {
        let backend = MemoryStore::new();
        let mut faulty = FaultyStore::wrapping(backend.clone());
        faulty.set_delay = Duration::from_millis(20);
        let store = Arc::new(faulty);

        let caller = session_with(store.clone(), Arc::new(LoopbackFactory::new())).await;
        caller.start_media().await.unwrap();
        let call_id = caller.create_call().await.unwrap();

        let offer_candidates = CallPaths::existing(&call_id).unwrap().offer_candidates;
        wait_for("offer candidates", || {
            backend.collection_len(&offer_candidates) >= 2
        })
        .await;
        assert!(!store.orphan_candidate.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_failed_subscription_returns_to_media_ready() {
        let backend = MemoryStore::new();
        let faulty = FaultyStore::wrapping(backend.clone());
        faulty.fail_next_watch.store(true, Ordering::SeqCst);
        let store = Arc::new(faulty);

        let caller = session_with(store, Arc::new(LoopbackFactory::new())).await;
        caller.start_media().await.unwrap();

        assert!(matches!(
            caller.create_call().await,
            Err(CallError::Subscription(_))
        ));
        assert_eq!(caller.state(), CallState::MediaReady);
        let controls = caller.controls();
        assert!(controls.call && controls.answer && !controls.hangup);
        wait_for("watchers released", || backend.watcher_count() == 0).await;

        // Nach dem Auflegen lässt sich ein neuer Call anlegen
        caller.hang_up().await.unwrap();
        caller.start_media().await.unwrap();
        let call_id = caller.create_call().await.unwrap();
        assert!(record(&backend, &call_id).await.is_some());
    }

    // ------------------------------------------------------------------------
    // Verbindung, die schon beim Festlegen der Answer verbunden meldet
    // ------------------------------------------------------------------------

    struct EagerConnection {
        inner: LoopbackConnection,
        state_handler: Mutex<Option<Arc<StateHandler>>>,
    }

    #[async_trait]
    impl PeerConnection for EagerConnection {
        async fn add_track(&self, track: &MediaTrack) -> Result<(), ConnectionError> {
            self.inner.add_track(track).await
        }
        fn on_track(&self, handler: TrackHandler) {
            self.inner.on_track(handler)
        }
        fn on_ice_candidate(&self, handler: CandidateHandler) {
            self.inner.on_ice_candidate(handler)
        }
        fn on_connection_state_change(&self, handler: StateHandler) {
            let handler = Arc::new(handler);
            *self.state_handler.lock() = Some(Arc::clone(&handler));
            self.inner
                .on_connection_state_change(Box::new(move |s: ConnectionState| handler(s)));
        }
        async fn create_offer(&self) -> Result<SessionDescription, ConnectionError> {
            self.inner.create_offer().await
        }
        async fn create_answer(&self) -> Result<SessionDescription, ConnectionError> {
            self.inner.create_answer().await
        }
        async fn set_local_description(
            &self,
            desc: SessionDescription,
        ) -> Result<(), ConnectionError> {
            let is_answer = desc.sdp_type == SdpType::Answer;
            self.inner.set_local_description(desc).await?;
            if is_answer {
                let handler = self.state_handler.lock().clone();
                if let Some(handler) = handler {
                    handler(ConnectionState::Connected);
                }
            }
            Ok(())
        }
        async fn set_remote_description(
            &self,
            desc: SessionDescription,
        ) -> Result<(), ConnectionError> {
            self.inner.set_remote_description(desc).await
        }
        async fn current_remote_description(&self) -> Option<SessionDescription> {
            self.inner.current_remote_description().await
        }
        async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), ConnectionError> {
            self.inner.add_ice_candidate(candidate).await
        }
        fn signaling_state(&self) -> SignalingState {
            self.inner.signaling_state()
        }
        fn connection_state(&self) -> ConnectionState {
            self.inner.connection_state()
        }
        async fn close(&self) -> Result<(), ConnectionError> {
            self.inner.close().await
        }
    }

    struct EagerFactory;

    #[async_trait]
    impl ConnectionFactory for EagerFactory {
        async fn create(&self) -> Result<Arc<dyn PeerConnection>, ConnectionError> {
            Ok(Arc::new(EagerConnection {
                inner: LoopbackConnection::new(),
                state_handler: Mutex::new(None),
            }))
        }
    }

    #[tokio::test]
    async fn test_join_keeps_early_connected_report() {
        let store = Arc::new(MemoryStore::new());
        let caller = session(&store).await;
        caller.start_media().await.unwrap();
        let call_id = caller.create_call().await.unwrap();

        let callee = session_with(store.clone(), Arc::new(EagerFactory)).await;
        callee.start_media().await.unwrap();
        callee.join_call(&call_id).await.unwrap();

        assert_eq!(callee.state(), CallState::Connected { call_id });
    }

    // ------------------------------------------------------------------------
    // Factory, die nur die erste Verbindung liefert
    // ------------------------------------------------------------------------

    struct OneShotFactory {
        created: AtomicUsize,
    }

    #[async_trait]
    impl ConnectionFactory for OneShotFactory {
        async fn create(&self) -> Result<Arc<dyn PeerConnection>, ConnectionError> {
            if self.created.fetch_add(1, Ordering::SeqCst) > 0 {
                return Err(ConnectionError::WebRTC("codec registration failed".to_string()));
            }
            Ok(Arc::new(LoopbackConnection::new()))
        }
    }

    #[tokio::test]
    async fn test_hang_up_tears_down_when_replacement_fails() {
        let store = Arc::new(MemoryStore::new());
        let caller = session_with(
            store.clone(),
            Arc::new(OneShotFactory {
                created: AtomicUsize::new(0),
            }),
        )
        .await;
        caller.start_media().await.unwrap();
        let call_id = caller.create_call().await.unwrap();

        let local = caller.local_stream().unwrap();
        let old_connection = caller.connection();

        assert!(matches!(
            caller.hang_up().await,
            Err(CallError::Connection(_))
        ));

        assert_eq!(old_connection.connection_state(), ConnectionState::Closed);
        assert!(local.tracks().iter().all(|t| !t.is_live()));
        let controls = caller.controls();
        assert!(controls.start && !controls.call && !controls.hangup);
        assert!(controls.local_video.is_none() && controls.call_input.is_empty());
        assert_eq!(caller.state(), CallState::Closed);
        assert!(record(&store, &call_id).await.is_none());
        wait_for("watchers released", || store.watcher_count() == 0).await;
    }

    #[tokio::test]
    async fn test_hang_up_resets_session() {
        let store = Arc::new(MemoryStore::new());
        let caller = session(&store).await;
        let callee = session(&store).await;
        caller.start_media().await.unwrap();
        callee.start_media().await.unwrap();

        let call_id = caller.create_call().await.unwrap();
        callee.join_call(&call_id).await.unwrap();
        wait_for("caller connected", || {
            caller.connection_state() == ConnectionState::Connected
        })
        .await;

        let local = caller.local_stream().unwrap();
        let remote = caller.remote_stream().unwrap();
        let old_connection = caller.connection();

        caller.hang_up().await.unwrap();

        let controls = caller.controls();
        assert!(controls.start && !controls.call && !controls.answer && !controls.hangup);
        assert!(controls.local_video.is_none() && controls.remote_video.is_none());
        assert!(controls.call_input.is_empty());
        assert!(local.tracks().iter().all(|t| !t.is_live()));
        assert!(remote.tracks().iter().all(|t| !t.is_live()));

        assert_eq!(old_connection.connection_state(), ConnectionState::Closed);
        assert_eq!(caller.connection_state(), ConnectionState::New);
        assert_eq!(caller.state(), CallState::Closed);
        assert!(record(&store, &call_id).await.is_none());
    }

    #[tokio::test]
    async fn test_hang_up_cancels_subscriptions() {
        let store = Arc::new(MemoryStore::new());
        let caller = session(&store).await;
        caller.start_media().await.unwrap();
        caller.create_call().await.unwrap();
        assert_eq!(store.watcher_count(), 2);

        caller.hang_up().await.unwrap();
        wait_for("watchers released", || store.watcher_count() == 0).await;
    }

    #[tokio::test]
    async fn test_media_restarts_after_hang_up() {
        let store = Arc::new(MemoryStore::new());
        let caller = session(&store).await;
        caller.start_media().await.unwrap();
        caller.create_call().await.unwrap();
        caller.hang_up().await.unwrap();

        caller.start_media().await.unwrap();
        assert_eq!(caller.state(), CallState::MediaReady);
        let call_id = caller.create_call().await.unwrap();
        assert!(record(&store, &call_id).await.is_some());
    }

    #[tokio::test]
    #[traced_test]
    async fn test_hang_up_logs_failed_deletion() {
        let backend = MemoryStore::new();
        let mut faulty = FaultyStore::wrapping(backend.clone());
        faulty.fail_delete = true;
        let store = Arc::new(faulty);
        let caller = session_with(store, Arc::new(LoopbackFactory::new())).await;
        caller.start_media().await.unwrap();
        let call_id = caller.create_call().await.unwrap();

        caller.hang_up().await.unwrap();

        assert_eq!(caller.state(), CallState::Closed);
        assert!(record(&backend, &call_id).await.is_some());
        assert!(logs_contain("Error deleting call document"));
    }
}

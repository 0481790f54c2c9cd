//! WebSocket Client für den Store-Relay
//!
//! Verwaltet die WebSocket-Verbindung zum Relay-Server:
//! - Request/Response-Zuordnung über `requestId`
//! - Weiterleitung von Watch-Updates an die Subscriptions
//! - Timeout pro Request

use super::document::{CollectionRef, Document, DocumentChange, DocumentRef, DocumentSnapshot};
use super::protocol::{ClientMessage, ServerMessage};
use super::subscription::Subscription;
use super::{DocumentStore, StoreError};
use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio_tungstenite::{connect_async, tungstenite::Message};

type PendingMap = Arc<Mutex<HashMap<u64, oneshot::Sender<ServerMessage>>>>;
type SinkMap<T> = Arc<Mutex<HashMap<u64, mpsc::UnboundedSender<T>>>>;

// ============================================================================
// REMOTE STORE
// ============================================================================

/// `DocumentStore` auf einem entfernten Relay-Server
pub struct RemoteStore {
    url: String,
    tx: mpsc::UnboundedSender<ClientMessage>,
    pending: PendingMap,
    document_sinks: SinkMap<DocumentSnapshot>,
    collection_sinks: SinkMap<Vec<DocumentChange>>,
    next_id: AtomicU64,
    connected: Arc<AtomicBool>,
    request_timeout: Duration,
}

impl RemoteStore {
    /// Verbindet mit dem Relay-Server
    ///
    /// `http(s)://` wird zu `ws(s)://` umgeschrieben.
    pub async fn connect(url: &str, request_timeout: Duration) -> Result<Self, StoreError> {
        let mut parsed =
            url::Url::parse(url).map_err(|e| StoreError::ConnectionFailed(e.to_string()))?;
        let scheme = match parsed.scheme() {
            "ws" | "http" => "ws",
            "wss" | "https" => "wss",
            other => {
                return Err(StoreError::ConnectionFailed(format!(
                    "unsupported scheme: {}",
                    other
                )))
            }
        };
        parsed
            .set_scheme(scheme)
            .map_err(|_| StoreError::ConnectionFailed(format!("invalid url: {}", url)))?;
        let ws_url = parsed.to_string();

        tracing::info!("Connecting to store relay: {}", ws_url);

        let (ws_stream, _) = connect_async(ws_url.as_str())
            .await
            .map_err(|e| StoreError::ConnectionFailed(e.to_string()))?;

        let (mut write, mut read) = ws_stream.split();
        let (tx, mut rx) = mpsc::unbounded_channel::<ClientMessage>();

        let pending: PendingMap = Arc::new(Mutex::new(HashMap::new()));
        let document_sinks: SinkMap<DocumentSnapshot> = Arc::new(Mutex::new(HashMap::new()));
        let collection_sinks: SinkMap<Vec<DocumentChange>> =
            Arc::new(Mutex::new(HashMap::new()));
        let connected = Arc::new(AtomicBool::new(true));

        // Read-Task starten
        let pending_clone = Arc::clone(&pending);
        let document_sinks_clone = Arc::clone(&document_sinks);
        let collection_sinks_clone = Arc::clone(&collection_sinks);
        let connected_clone = Arc::clone(&connected);

        tokio::spawn(async move {
            while let Some(msg_result) = read.next().await {
                match msg_result {
                    Ok(Message::Text(text)) => match serde_json::from_str::<ServerMessage>(&text) {
                        Ok(msg) => Self::handle_server_message(
                            msg,
                            &pending_clone,
                            &document_sinks_clone,
                            &collection_sinks_clone,
                        ),
                        Err(e) => tracing::warn!("Invalid message from store relay: {}", e),
                    },
                    Ok(Message::Close(_)) => {
                        tracing::info!("WebSocket closed by store relay");
                        break;
                    }
                    Err(e) => {
                        tracing::error!("WebSocket error: {}", e);
                        break;
                    }
                    _ => {}
                }
            }

            // Offene Requests und Watches beenden
            connected_clone.store(false, Ordering::SeqCst);
            pending_clone.lock().clear();
            document_sinks_clone.lock().clear();
            collection_sinks_clone.lock().clear();
        });

        // Write-Task starten
        tokio::spawn(async move {
            while let Some(msg) = rx.recv().await {
                let text = match serde_json::to_string(&msg) {
                    Ok(text) => text,
                    Err(e) => {
                        tracing::error!("Failed to serialize store request: {}", e);
                        continue;
                    }
                };
                if let Err(e) = write.send(Message::Text(text)).await {
                    tracing::error!("Failed to send WebSocket message: {}", e);
                    break;
                }
            }
        });

        Ok(Self {
            url: ws_url,
            tx,
            pending,
            document_sinks,
            collection_sinks,
            next_id: AtomicU64::new(1),
            connected,
            request_timeout,
        })
    }

    /// Prüft ob verbunden
    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    fn next_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::SeqCst)
    }

    /// Verteilt eingehende Nachrichten an Requests und Subscriptions
    fn handle_server_message(
        msg: ServerMessage,
        pending: &PendingMap,
        document_sinks: &SinkMap<DocumentSnapshot>,
        collection_sinks: &SinkMap<Vec<DocumentChange>>,
    ) {
        match msg {
            ServerMessage::Snapshot {
                subscription,
                snapshot,
            } => {
                if let Some(sink) = document_sinks.lock().get(&subscription) {
                    let _ = sink.send(snapshot);
                }
            }

            ServerMessage::Changes {
                subscription,
                changes,
            } => {
                if let Some(sink) = collection_sinks.lock().get(&subscription) {
                    let _ = sink.send(changes);
                }
            }

            other => match other.request_id() {
                Some(id) => {
                    if let Some(waiter) = pending.lock().remove(&id) {
                        let _ = waiter.send(other);
                    }
                }
                None => {
                    if let ServerMessage::Error { code, message, .. } = other {
                        tracing::error!("Store relay error {}: {}", code, message);
                    }
                }
            },
        }
    }

    /// Sendet einen Request und wartet auf die Antwort
    async fn request(&self, msg: ClientMessage) -> Result<ServerMessage, StoreError> {
        let request_id = match &msg {
            ClientMessage::Set { request_id, .. }
            | ClientMessage::Update { request_id, .. }
            | ClientMessage::Get { request_id, .. }
            | ClientMessage::Add { request_id, .. }
            | ClientMessage::Delete { request_id, .. }
            | ClientMessage::WatchDocument { request_id, .. }
            | ClientMessage::WatchCollection { request_id, .. } => *request_id,
            ClientMessage::Unwatch { .. } => {
                return Err(StoreError::InvalidDocument(
                    "unwatch carries no request".to_string(),
                ))
            }
        };

        if !self.is_connected() {
            return Err(StoreError::NotConnected);
        }

        let (reply_tx, reply_rx) = oneshot::channel();
        self.pending.lock().insert(request_id, reply_tx);

        if self.tx.send(msg).is_err() {
            self.pending.lock().remove(&request_id);
            return Err(StoreError::NotConnected);
        }

        tokio::select! {
            result = reply_rx => {
                match result {
                    Ok(ServerMessage::Error { code, message, .. }) => {
                        Err(StoreError::from_code(code, message))
                    }
                    Ok(reply) => Ok(reply),
                    Err(_) => Err(StoreError::NotConnected),
                }
            }
            _ = tokio::time::sleep(self.request_timeout) => {
                self.pending.lock().remove(&request_id);
                Err(StoreError::Timeout)
            }
        }
    }

    fn expect_ack(reply: ServerMessage) -> Result<(), StoreError> {
        match reply {
            ServerMessage::Ack { .. } => Ok(()),
            other => Err(StoreError::Server {
                code: 500,
                message: format!("unexpected reply: {:?}", other),
            }),
        }
    }
}

#[async_trait]
impl DocumentStore for RemoteStore {
    async fn set(&self, doc: &DocumentRef, data: Document) -> Result<(), StoreError> {
        let reply = self
            .request(ClientMessage::Set {
                request_id: self.next_id(),
                path: doc.path(),
                data,
            })
            .await?;
        Self::expect_ack(reply)
    }

    async fn update(&self, doc: &DocumentRef, data: Document) -> Result<(), StoreError> {
        let reply = self
            .request(ClientMessage::Update {
                request_id: self.next_id(),
                path: doc.path(),
                data,
            })
            .await?;
        Self::expect_ack(reply)
    }

    async fn get(&self, doc: &DocumentRef) -> Result<DocumentSnapshot, StoreError> {
        let reply = self
            .request(ClientMessage::Get {
                request_id: self.next_id(),
                path: doc.path(),
            })
            .await?;
        match reply {
            ServerMessage::Document { snapshot, .. } => Ok(snapshot),
            other => Err(StoreError::Server {
                code: 500,
                message: format!("unexpected reply: {:?}", other),
            }),
        }
    }

    async fn add(
        &self,
        collection: &CollectionRef,
        data: Document,
    ) -> Result<DocumentRef, StoreError> {
        let reply = self
            .request(ClientMessage::Add {
                request_id: self.next_id(),
                collection: collection.path().to_string(),
                data,
            })
            .await?;
        match reply {
            ServerMessage::Added { id, .. } => collection.doc(&id),
            other => Err(StoreError::Server {
                code: 500,
                message: format!("unexpected reply: {:?}", other),
            }),
        }
    }

    async fn delete(&self, doc: &DocumentRef) -> Result<(), StoreError> {
        let reply = self
            .request(ClientMessage::Delete {
                request_id: self.next_id(),
                path: doc.path(),
            })
            .await?;
        Self::expect_ack(reply)
    }

    async fn watch_document(
        &self,
        doc: &DocumentRef,
    ) -> Result<Subscription<DocumentSnapshot>, StoreError> {
        let subscription = self.next_id();
        let (sink, rx) = mpsc::unbounded_channel();
        self.document_sinks.lock().insert(subscription, sink);

        let result = self
            .request(ClientMessage::WatchDocument {
                request_id: self.next_id(),
                subscription,
                path: doc.path(),
            })
            .await
            .and_then(Self::expect_ack);

        if let Err(e) = result {
            self.document_sinks.lock().remove(&subscription);
            return Err(e);
        }

        let sinks = Arc::clone(&self.document_sinks);
        let tx = self.tx.clone();
        Ok(Subscription::new(rx, move || {
            sinks.lock().remove(&subscription);
            let _ = tx.send(ClientMessage::Unwatch { subscription });
        }))
    }

    async fn watch_collection(
        &self,
        collection: &CollectionRef,
    ) -> Result<Subscription<Vec<DocumentChange>>, StoreError> {
        let subscription = self.next_id();
        let (sink, rx) = mpsc::unbounded_channel();
        self.collection_sinks.lock().insert(subscription, sink);

        let result = self
            .request(ClientMessage::WatchCollection {
                request_id: self.next_id(),
                subscription,
                collection: collection.path().to_string(),
            })
            .await
            .and_then(Self::expect_ack);

        if let Err(e) = result {
            self.collection_sinks.lock().remove(&subscription);
            return Err(e);
        }

        let sinks = Arc::clone(&self.collection_sinks);
        let tx = self.tx.clone();
        Ok(Subscription::new(rx, move || {
            sinks.lock().remove(&subscription);
            let _ = tx.send(ClientMessage::Unwatch { subscription });
        }))
    }
}

impl std::fmt::Debug for RemoteStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RemoteStore")
            .field("url", &self.url)
            .field("connected", &self.is_connected())
            .field("pending", &self.pending.lock().len())
            .finish()
    }
}

// ============================================================================
// TESTS
// ============================================================================

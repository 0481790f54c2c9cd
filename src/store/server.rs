//! WebSocket Relay-Server
//!
//! Stellt einen beliebigen `DocumentStore` über das JSON-Protokoll aus
//! `protocol` bereit. Watches gehören zur Verbindung und werden bei
//! `unwatch` oder Verbindungsabbruch beendet.

use super::document::{CollectionRef, DocumentRef};
use super::protocol::{ClientMessage, ServerMessage};
use super::{DocumentStore, StoreError};
use futures::{SinkExt, StreamExt};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::{accept_async, tungstenite::Message};

pub struct StoreServer {
    listener: TcpListener,
    store: Arc<dyn DocumentStore>,
}

impl StoreServer {
    /// Bindet den Server an eine Adresse (Port 0 für einen freien Port)
    pub async fn bind(addr: &str, store: Arc<dyn DocumentStore>) -> Result<Self, StoreError> {
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| StoreError::ConnectionFailed(e.to_string()))?;
        Ok(Self { listener, store })
    }

    pub fn local_addr(&self) -> Result<SocketAddr, StoreError> {
        self.listener
            .local_addr()
            .map_err(|e| StoreError::ConnectionFailed(e.to_string()))
    }

    /// Nimmt Verbindungen an, bis der Listener fehlschlägt
    pub async fn run(self) -> Result<(), StoreError> {
        tracing::info!("Store relay listening on {:?}", self.listener.local_addr());

        loop {
            let (stream, peer) = self
                .listener
                .accept()
                .await
                .map_err(|e| StoreError::ConnectionFailed(e.to_string()))?;

            let store = Arc::clone(&self.store);
            tokio::spawn(async move {
                handle_connection(stream, peer, store).await;
            });
        }
    }
}

async fn handle_connection(stream: TcpStream, peer: SocketAddr, store: Arc<dyn DocumentStore>) {
    let ws_stream = match accept_async(stream).await {
        Ok(ws) => ws,
        Err(e) => {
            tracing::warn!("WebSocket handshake with {} failed: {}", peer, e);
            return;
        }
    };
    tracing::info!("Client connected: {}", peer);

    let (mut write, mut read) = ws_stream.split();
    let (tx, mut rx) = mpsc::unbounded_channel::<ServerMessage>();

    // Write-Task
    let writer = tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            let text = match serde_json::to_string(&msg) {
                Ok(text) => text,
                Err(e) => {
                    tracing::error!("Failed to serialize server message: {}", e);
                    continue;
                }
            };
            if let Err(e) = write.send(Message::Text(text)).await {
                tracing::debug!("Failed to send WebSocket message: {}", e);
                break;
            }
        }
    });

    let mut watches: HashMap<u64, JoinHandle<()>> = HashMap::new();

    while let Some(msg_result) = read.next().await {
        match msg_result {
            Ok(Message::Text(text)) => match serde_json::from_str::<ClientMessage>(&text) {
                Ok(msg) => handle_client_message(msg, &store, &tx, &mut watches).await,
                Err(e) => {
                    tracing::warn!("Invalid message from {}: {}", peer, e);
                    let _ = tx.send(ServerMessage::Error {
                        request_id: None,
                        code: 400,
                        message: e.to_string(),
                    });
                }
            },
            Ok(Message::Close(_)) => break,
            Err(e) => {
                tracing::debug!("WebSocket error from {}: {}", peer, e);
                break;
            }
            _ => {}
        }
    }

    for (_, handle) in watches.drain() {
        handle.abort();
    }
    drop(tx);
    let _ = writer.await;

    tracing::info!("Client disconnected: {}", peer);
}

/// Führt eine Client-Nachricht aus und sendet die Antwort
async fn handle_client_message(
    msg: ClientMessage,
    store: &Arc<dyn DocumentStore>,
    tx: &mpsc::UnboundedSender<ServerMessage>,
    watches: &mut HashMap<u64, JoinHandle<()>>,
) {
    let request_id = match &msg {
        ClientMessage::Set { request_id, .. }
        | ClientMessage::Update { request_id, .. }
        | ClientMessage::Get { request_id, .. }
        | ClientMessage::Add { request_id, .. }
        | ClientMessage::Delete { request_id, .. }
        | ClientMessage::WatchDocument { request_id, .. }
        | ClientMessage::WatchCollection { request_id, .. } => *request_id,
        ClientMessage::Unwatch { subscription } => {
            if let Some(handle) = watches.remove(subscription) {
                handle.abort();
            }
            return;
        }
    };

    let reply = match execute(msg, store, tx, watches).await {
        Ok(reply) => reply,
        Err(e) => ServerMessage::Error {
            request_id: Some(request_id),
            code: e.code(),
            message: e.detail(),
        },
    };
    let _ = tx.send(reply);
}

async fn execute(
    msg: ClientMessage,
    store: &Arc<dyn DocumentStore>,
    tx: &mpsc::UnboundedSender<ServerMessage>,
    watches: &mut HashMap<u64, JoinHandle<()>>,
) -> Result<ServerMessage, StoreError> {
    match msg {
        ClientMessage::Set {
            request_id,
            path,
            data,
        } => {
            store.set(&DocumentRef::parse(&path)?, data).await?;
            Ok(ServerMessage::Ack { request_id })
        }

        ClientMessage::Update {
            request_id,
            path,
            data,
        } => {
            store.update(&DocumentRef::parse(&path)?, data).await?;
            Ok(ServerMessage::Ack { request_id })
        }

        ClientMessage::Get { request_id, path } => {
            let snapshot = store.get(&DocumentRef::parse(&path)?).await?;
            Ok(ServerMessage::Document {
                request_id,
                snapshot,
            })
        }

        ClientMessage::Add {
            request_id,
            collection,
            data,
        } => {
            let doc = store.add(&CollectionRef::parse(&collection)?, data).await?;
            Ok(ServerMessage::Added {
                request_id,
                id: doc.id().to_string(),
            })
        }

        ClientMessage::Delete { request_id, path } => {
            store.delete(&DocumentRef::parse(&path)?).await?;
            Ok(ServerMessage::Ack { request_id })
        }

        ClientMessage::WatchDocument {
            request_id,
            subscription,
            path,
        } => {
            let mut sub = store.watch_document(&DocumentRef::parse(&path)?).await?;
            let tx = tx.clone();
            let handle = tokio::spawn(async move {
                while let Some(snapshot) = sub.recv().await {
                    if tx
                        .send(ServerMessage::Snapshot {
                            subscription,
                            snapshot,
                        })
                        .is_err()
                    {
                        break;
                    }
                }
            });
            if let Some(previous) = watches.insert(subscription, handle) {
                previous.abort();
            }
            Ok(ServerMessage::Ack { request_id })
        }

        ClientMessage::WatchCollection {
            request_id,
            subscription,
            collection,
        } => {
            let mut sub = store
                .watch_collection(&CollectionRef::parse(&collection)?)
                .await?;
            let tx = tx.clone();
            let handle = tokio::spawn(async move {
                while let Some(changes) = sub.recv().await {
                    if tx
                        .send(ServerMessage::Changes {
                            subscription,
                            changes,
                        })
                        .is_err()
                    {
                        break;
                    }
                }
            });
            if let Some(previous) = watches.insert(subscription, handle) {
                previous.abort();
            }
            Ok(ServerMessage::Ack { request_id })
        }

        ClientMessage::Unwatch { .. } => Err(StoreError::InvalidDocument(
            "unwatch carries no request".to_string(),
        )),
    }
}

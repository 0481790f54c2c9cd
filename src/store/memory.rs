//! In-Memory Document Store
//!
//! Hält alle Collections im Prozess. Klone teilen sich denselben Inhalt,
//! so dass mehrere Sessions (oder der Relay-Server) einen Store nutzen.

use super::document::{
    ChangeKind, CollectionRef, Document, DocumentChange, DocumentRef, DocumentSnapshot,
};
use super::subscription::Subscription;
use super::{DocumentStore, StoreError};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::{Arc, Weak};
use tokio::sync::mpsc;

struct StoredDocument {
    /// Einfügereihenfolge innerhalb des Stores
    seq: u64,
    data: Document,
    create_time: DateTime<Utc>,
    update_time: DateTime<Utc>,
}

impl StoredDocument {
    fn snapshot(&self, id: &str) -> DocumentSnapshot {
        DocumentSnapshot {
            id: id.to_string(),
            data: Some(self.data.clone()),
            create_time: Some(self.create_time),
            update_time: Some(self.update_time),
        }
    }
}

struct Watcher<T> {
    path: String,
    tx: mpsc::UnboundedSender<T>,
}

#[derive(Default)]
struct State {
    /// Collection-Pfad → (Dokument-ID → Dokument)
    collections: HashMap<String, HashMap<String, StoredDocument>>,
    next_seq: u64,
    next_watch: u64,
    document_watchers: HashMap<u64, Watcher<DocumentSnapshot>>,
    collection_watchers: HashMap<u64, Watcher<Vec<DocumentChange>>>,
}

impl State {
    fn snapshot(&self, doc: &DocumentRef) -> DocumentSnapshot {
        self.collections
            .get(doc.parent().path())
            .and_then(|docs| docs.get(doc.id()))
            .map(|stored| stored.snapshot(doc.id()))
            .unwrap_or_else(|| DocumentSnapshot::missing(doc.id()))
    }

    /// Alle Dokumente einer Collection in Einfügereihenfolge
    fn ordered(&self, collection: &str) -> Vec<DocumentChange> {
        let Some(docs) = self.collections.get(collection) else {
            return Vec::new();
        };
        let mut entries: Vec<_> = docs.iter().collect();
        entries.sort_by_key(|(_, stored)| stored.seq);
        entries
            .into_iter()
            .map(|(id, stored)| DocumentChange {
                kind: ChangeKind::Added,
                id: id.clone(),
                data: stored.data.clone(),
            })
            .collect()
    }

    fn write(&mut self, doc: &DocumentRef, data: Document, merge: bool) -> Result<(), StoreError> {
        let now = Utc::now();
        let seq = self.next_seq;
        let docs = self
            .collections
            .entry(doc.parent().path().to_string())
            .or_default();

        let kind = match docs.get_mut(doc.id()) {
            Some(existing) => {
                if merge {
                    existing.data.extend(data);
                } else {
                    existing.data = data;
                }
                existing.update_time = now;
                ChangeKind::Modified
            }
            None if merge => return Err(StoreError::NotFound(doc.path())),
            None => {
                docs.insert(
                    doc.id().to_string(),
                    StoredDocument {
                        seq,
                        data,
                        create_time: now,
                        update_time: now,
                    },
                );
                self.next_seq += 1;
                ChangeKind::Added
            }
        };

        self.notify(doc, kind);
        Ok(())
    }

    fn remove(&mut self, doc: &DocumentRef) {
        let removed = self
            .collections
            .get_mut(doc.parent().path())
            .and_then(|docs| docs.remove(doc.id()));

        if let Some(stored) = removed {
            self.notify_removed(doc, stored.data);
        }
    }

    fn notify(&mut self, doc: &DocumentRef, kind: ChangeKind) {
        let snapshot = self.snapshot(doc);
        let data = snapshot.data.clone().unwrap_or_default();
        self.dispatch(doc, snapshot, kind, data);
    }

    fn notify_removed(&mut self, doc: &DocumentRef, data: Document) {
        let snapshot = DocumentSnapshot::missing(doc.id());
        self.dispatch(doc, snapshot, ChangeKind::Removed, data);
    }

    fn dispatch(
        &mut self,
        doc: &DocumentRef,
        snapshot: DocumentSnapshot,
        kind: ChangeKind,
        data: Document,
    ) {
        let doc_path = doc.path();
        let collection_path = doc.parent().path();

        // Watcher mit geschlossenem Receiver werden dabei entfernt
        self.document_watchers.retain(|_, watcher| {
            watcher.path != doc_path || watcher.tx.send(snapshot.clone()).is_ok()
        });

        let change = DocumentChange {
            kind,
            id: doc.id().to_string(),
            data,
        };
        self.collection_watchers.retain(|_, watcher| {
            watcher.path != collection_path || watcher.tx.send(vec![change.clone()]).is_ok()
        });
    }
}

// ============================================================================
// MEMORY STORE
// ============================================================================

#[derive(Clone, Default)]
pub struct MemoryStore {
    state: Arc<Mutex<State>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Anzahl Dokumente in einer Collection
    pub fn collection_len(&self, collection: &CollectionRef) -> usize {
        self.state
            .lock()
            .collections
            .get(collection.path())
            .map(|docs| docs.len())
            .unwrap_or(0)
    }

    /// Anzahl aktiver Watches (Dokumente und Collections)
    pub fn watcher_count(&self) -> usize {
        let state = self.state.lock();
        state.document_watchers.len() + state.collection_watchers.len()
    }

    fn unwatch(state: &Weak<Mutex<State>>, id: u64) {
        if let Some(state) = state.upgrade() {
            let mut state = state.lock();
            state.document_watchers.remove(&id);
            state.collection_watchers.remove(&id);
        }
    }
}

#[async_trait]
impl DocumentStore for MemoryStore {
    async fn set(&self, doc: &DocumentRef, data: Document) -> Result<(), StoreError> {
        self.state.lock().write(doc, data, false)
    }

    async fn update(&self, doc: &DocumentRef, data: Document) -> Result<(), StoreError> {
        self.state.lock().write(doc, data, true)
    }

    async fn get(&self, doc: &DocumentRef) -> Result<DocumentSnapshot, StoreError> {
        Ok(self.state.lock().snapshot(doc))
    }

    async fn add(
        &self,
        collection: &CollectionRef,
        data: Document,
    ) -> Result<DocumentRef, StoreError> {
        let doc = collection.new_doc();
        self.state.lock().write(&doc, data, false)?;
        Ok(doc)
    }

    async fn delete(&self, doc: &DocumentRef) -> Result<(), StoreError> {
        self.state.lock().remove(doc);
        Ok(())
    }

    async fn watch_document(
        &self,
        doc: &DocumentRef,
    ) -> Result<Subscription<DocumentSnapshot>, StoreError> {
        let (tx, rx) = mpsc::unbounded_channel();

        let id = {
            let mut state = self.state.lock();
            let id = state.next_watch;
            state.next_watch += 1;

            let _ = tx.send(state.snapshot(doc));
            state.document_watchers.insert(
                id,
                Watcher {
                    path: doc.path(),
                    tx,
                },
            );
            id
        };

        let state = Arc::downgrade(&self.state);
        Ok(Subscription::new(rx, move || Self::unwatch(&state, id)))
    }

    async fn watch_collection(
        &self,
        collection: &CollectionRef,
    ) -> Result<Subscription<Vec<DocumentChange>>, StoreError> {
        let (tx, rx) = mpsc::unbounded_channel();

        let id = {
            let mut state = self.state.lock();
            let id = state.next_watch;
            state.next_watch += 1;

            let _ = tx.send(state.ordered(collection.path()));
            state.collection_watchers.insert(
                id,
                Watcher {
                    path: collection.path().to_string(),
                    tx,
                },
            );
            id
        };

        let state = Arc::downgrade(&self.state);
        Ok(Subscription::new(rx, move || Self::unwatch(&state, id)))
    }
}

impl std::fmt::Debug for MemoryStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("MemoryStore")
            .field("collections", &state.collections.len())
            .field("watchers", &(state.document_watchers.len() + state.collection_watchers.len()))
            .finish()
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn doc(value: serde_json::Value) -> Document {
        match value {
            serde_json::Value::Object(map) => map,
            _ => panic!("not an object"),
        }
    }

    fn calls() -> CollectionRef {
        CollectionRef::root("calls").unwrap()
    }

    #[tokio::test]
    async fn test_set_get_update() {
        let store = MemoryStore::new();
        let call = calls().new_doc();

        store.set(&call, doc(json!({"offer": 1}))).await.unwrap();
        store.update(&call, doc(json!({"answer": 2}))).await.unwrap();

        let snapshot = store.get(&call).await.unwrap();
        assert_eq!(snapshot.data, Some(doc(json!({"offer": 1, "answer": 2}))));
        assert!(snapshot.update_time >= snapshot.create_time);
    }

    #[tokio::test]
    async fn test_update_missing_fails() {
        let store = MemoryStore::new();
        let call = calls().doc("nope").unwrap();

        let err = store.update(&call, doc(json!({"a": 1}))).await.unwrap_err();
        assert_eq!(err, StoreError::NotFound("calls/nope".to_string()));
    }

    #[tokio::test]
    async fn test_get_missing() {
        let store = MemoryStore::new();
        let snapshot = store.get(&calls().doc("x").unwrap()).await.unwrap();
        assert!(!snapshot.exists());
    }

    #[tokio::test]
    async fn test_delete_does_not_cascade() {
        let store = MemoryStore::new();
        let call = calls().new_doc();
        let candidates = call.collection("offerCandidates").unwrap();

        store.set(&call, doc(json!({"offer": 1}))).await.unwrap();
        store.add(&candidates, doc(json!({"c": 1}))).await.unwrap();
        store.delete(&call).await.unwrap();
        store.delete(&call).await.unwrap();

        assert!(!store.get(&call).await.unwrap().exists());
        assert_eq!(store.collection_len(&candidates), 1);
    }

    #[tokio::test]
    async fn test_watch_document_initial_and_updates() {
        let store = MemoryStore::new();
        let call = calls().new_doc();
        store.set(&call, doc(json!({"offer": 1}))).await.unwrap();

        let mut sub = store.watch_document(&call).await.unwrap();
        let initial = sub.recv().await.unwrap();
        assert_eq!(initial.data, Some(doc(json!({"offer": 1}))));

        store.update(&call, doc(json!({"answer": 2}))).await.unwrap();
        let updated = sub.recv().await.unwrap();
        assert!(updated.data.unwrap().contains_key("answer"));

        store.delete(&call).await.unwrap();
        assert!(!sub.recv().await.unwrap().exists());
    }

    #[tokio::test]
    async fn test_watch_collection_delivers_existing_in_order() {
        let store = MemoryStore::new();
        let candidates = calls().new_doc().collection("answerCandidates").unwrap();

        for i in 0..5 {
            store.add(&candidates, doc(json!({"n": i}))).await.unwrap();
        }

        let mut sub = store.watch_collection(&candidates).await.unwrap();
        let initial = sub.recv().await.unwrap();
        let order: Vec<_> = initial.iter().map(|c| c.data["n"].clone()).collect();
        assert_eq!(order, vec![json!(0), json!(1), json!(2), json!(3), json!(4)]);
        assert!(initial.iter().all(|c| c.kind == ChangeKind::Added));

        store.add(&candidates, doc(json!({"n": 5}))).await.unwrap();
        let next = sub.recv().await.unwrap();
        assert_eq!(next.len(), 1);
        assert_eq!(next[0].kind, ChangeKind::Added);
    }

    #[tokio::test]
    async fn test_watch_collection_ignores_other_collections() {
        let store = MemoryStore::new();
        let call = calls().new_doc();
        let offers = call.collection("offerCandidates").unwrap();
        let answers = call.collection("answerCandidates").unwrap();

        let mut sub = store.watch_collection(&offers).await.unwrap();
        assert!(sub.recv().await.unwrap().is_empty());

        store.add(&answers, doc(json!({"n": 1}))).await.unwrap();
        assert!(sub.try_recv().is_none());
    }

    #[tokio::test]
    async fn test_dropping_subscription_unregisters() {
        let store = MemoryStore::new();
        let call = calls().new_doc();

        let sub = store.watch_document(&call).await.unwrap();
        assert_eq!(store.watcher_count(), 1);
        drop(sub);
        assert_eq!(store.watcher_count(), 0);
    }
}

use crate::change::{ChangeEvent, ChangeRecord, Document, Operation, now_ms};
use crate::checkpoint::CheckpointSnapshot;
use crate::error::{Result, SyncError};
use crate::ledger::LedgerEntry;
use crate::revision::Revision;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::{BTreeMap, HashSet};
use std::sync::Mutex;
use tokio::sync::broadcast;

/// Durable engine state a store keeps per engine instance: the checkpoint
/// snapshot and the not-yet-acknowledged ledger entries.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PersistedState {
    pub checkpoint: CheckpointSnapshot,
    pub ledger: Vec<LedgerEntry>,
}

/// The surface the sync engine consumes from an embedded store.
///
/// `apply_remote_change` is the only mutation the engine performs; local
/// application writes go through the store's own write path, which publishes
/// the change events the engine subscribes to. Applying the same change
/// twice must be a no-op (idempotence by `(document_id, rev)`).
pub trait DocumentStore: Send + Sync + 'static {
    fn list_collections(&self) -> Vec<String>;

    fn subscribe_changes(&self) -> broadcast::Receiver<ChangeEvent>;

    fn get(
        &self,
        collection: &str,
        document_id: &str,
    ) -> impl Future<Output = Result<Option<Document>>> + Send;

    fn apply_remote_change(&self, change: &ChangeRecord) -> impl Future<Output = Result<()>> + Send;

    fn load_state(&self, engine_id: &str) -> impl Future<Output = Result<Option<PersistedState>>> + Send;

    fn save_state(
        &self,
        engine_id: &str,
        state: &PersistedState,
    ) -> impl Future<Output = Result<()>> + Send;
}

#[derive(Debug, Default)]
struct MemoryInner {
    collections: BTreeMap<String, BTreeMap<String, Document>>,
    applied: HashSet<(String, String, String)>,
    states: BTreeMap<String, PersistedState>,
}

/// Reference in-memory store. Serves the test suite and doubles as the
/// executable description of the store contract: revision assignment,
/// vector-clock advancement, tombstone retention and change-event
/// publication on every write.
#[derive(Debug)]
pub struct MemoryStore {
    node_id: String,
    inner: Mutex<MemoryInner>,
    events: broadcast::Sender<ChangeEvent>,
}

impl MemoryStore {
    pub fn new(node_id: impl Into<String>) -> Self {
        let (events, _) = broadcast::channel(256);
        MemoryStore {
            node_id: node_id.into(),
            inner: Mutex::new(MemoryInner::default()),
            events,
        }
    }

    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MemoryInner> {
        self.inner.lock().expect("memory store lock poisoned")
    }

    fn publish(&self, event: ChangeEvent) {
        // No subscribers is fine; the engine may not be running yet.
        let _ = self.events.send(event);
    }

    /// Local insert. Inserting over a live document fails; inserting over a
    /// tombstone revives it with a causally greater clock.
    pub fn insert(&self, collection: &str, id: &str, fields: Map<String, Value>) -> Result<Document> {
        let document = {
            let mut inner = self.lock();
            let docs = inner.collections.entry(collection.to_string()).or_default();
            let prior = docs.get(id);
            if prior.is_some_and(|d| !d.deleted) {
                return Err(SyncError::Store(format!(
                    "document {collection}/{id} already exists"
                )));
            }
            let mut document = Document::new(id, fields);
            if let Some(tombstone) = prior {
                document.vclock = tombstone.vclock.clone();
            }
            self.stamp(&mut document, prior);
            docs.insert(id.to_string(), document.clone());
            document
        };
        self.publish(ChangeEvent {
            collection: collection.to_string(),
            operation: Operation::Insert,
            document_id: id.to_string(),
            document: Some(document.clone()),
            previous_document: None,
            from_sync: false,
            timestamp: document.updated_at,
        });
        Ok(document)
    }

    /// Local field update; merges `patch` over the current fields.
    pub fn update(&self, collection: &str, id: &str, patch: Map<String, Value>) -> Result<Document> {
        let (document, previous) = {
            let mut inner = self.lock();
            let docs = inner
                .collections
                .get_mut(collection)
                .ok_or_else(|| SyncError::Store(format!("unknown collection {collection}")))?;
            let previous = docs
                .get(id)
                .filter(|d| !d.deleted)
                .cloned()
                .ok_or_else(|| SyncError::Store(format!("document {collection}/{id} not found")))?;
            let mut document = previous.clone();
            for (key, value) in patch {
                document.fields.insert(key, value);
            }
            self.stamp(&mut document, Some(&previous));
            docs.insert(id.to_string(), document.clone());
            (document, previous)
        };
        self.publish(ChangeEvent {
            collection: collection.to_string(),
            operation: Operation::Update,
            document_id: id.to_string(),
            document: Some(document.clone()),
            previous_document: Some(previous),
            from_sync: false,
            timestamp: document.updated_at,
        });
        Ok(document)
    }

    /// Local delete; the document becomes a tombstone retaining id, rev and
    /// vector clock.
    pub fn delete(&self, collection: &str, id: &str) -> Result<Document> {
        let (tombstone, previous) = {
            let mut inner = self.lock();
            let docs = inner
                .collections
                .get_mut(collection)
                .ok_or_else(|| SyncError::Store(format!("unknown collection {collection}")))?;
            let previous = docs
                .get(id)
                .filter(|d| !d.deleted)
                .cloned()
                .ok_or_else(|| SyncError::Store(format!("document {collection}/{id} not found")))?;
            let mut tombstone = Document::tombstone(id, None, previous.vclock.clone());
            self.stamp(&mut tombstone, Some(&previous));
            docs.insert(id.to_string(), tombstone.clone());
            (tombstone, previous)
        };
        self.publish(ChangeEvent {
            collection: collection.to_string(),
            operation: Operation::Delete,
            document_id: id.to_string(),
            document: Some(tombstone.clone()),
            previous_document: Some(previous),
            from_sync: false,
            timestamp: tombstone.updated_at,
        });
        Ok(tombstone)
    }

    /// Assigns the next revision, advances the local node's clock entry and
    /// refreshes `updated_at`.
    fn stamp(&self, document: &mut Document, prior: Option<&Document>) {
        document.vclock.increment(&self.node_id);
        document.updated_at = now_ms();
        let seq = prior
            .and_then(|d| d.rev.as_deref())
            .map(Revision::seq_of)
            .unwrap_or(0);
        document.rev = Some(Revision::mint(seq + 1, &document.content()));
    }

    /// Synchronous snapshot of a document, tombstones included.
    pub fn get_sync(&self, collection: &str, document_id: &str) -> Option<Document> {
        self.lock()
            .collections
            .get(collection)
            .and_then(|docs| docs.get(document_id))
            .cloned()
    }

    /// All live (non-tombstone) documents of a collection, for assertions
    /// and demos.
    pub fn live_documents(&self, collection: &str) -> Vec<Document> {
        self.lock()
            .collections
            .get(collection)
            .map(|docs| docs.values().filter(|d| !d.deleted).cloned().collect())
            .unwrap_or_default()
    }
}

impl DocumentStore for MemoryStore {
    fn list_collections(&self) -> Vec<String> {
        self.lock().collections.keys().cloned().collect()
    }

    fn subscribe_changes(&self) -> broadcast::Receiver<ChangeEvent> {
        self.events.subscribe()
    }

    async fn get(&self, collection: &str, document_id: &str) -> Result<Option<Document>> {
        Ok(self.get_sync(collection, document_id))
    }

    async fn apply_remote_change(&self, change: &ChangeRecord) -> Result<()> {
        let applied = {
            let mut inner = self.lock();
            let key = (
                change.collection.clone(),
                change.document_id.clone(),
                change.rev().unwrap_or("").to_string(),
            );
            if inner.applied.contains(&key) {
                return Ok(());
            }

            let incoming = match (&change.operation, &change.document) {
                (Operation::Delete, None) => {
                    Document::tombstone(&change.document_id, None, change.vclock.clone())
                }
                (_, Some(document)) => document.clone(),
                (operation, None) => {
                    return Err(SyncError::Store(format!(
                        "remote {operation:?} for {}/{} carries no document",
                        change.collection, change.document_id
                    )));
                }
            };

            // Idempotence by (document_id, rev): re-applying the current
            // revision is a no-op.
            let already_current = inner
                .collections
                .get(&change.collection)
                .and_then(|docs| docs.get(&change.document_id))
                .is_some_and(|d| d.rev.is_some() && d.rev == incoming.rev);
            if already_current {
                inner.applied.insert(key);
                return Ok(());
            }
            inner
                .collections
                .entry(change.collection.clone())
                .or_default()
                .insert(change.document_id.clone(), incoming.clone());
            inner.applied.insert(key);
            incoming
        };

        self.publish(ChangeEvent {
            collection: change.collection.clone(),
            operation: change.operation,
            document_id: change.document_id.clone(),
            document: Some(applied),
            previous_document: change.previous_document.clone(),
            from_sync: true,
            timestamp: now_ms(),
        });
        Ok(())
    }

    async fn load_state(&self, engine_id: &str) -> Result<Option<PersistedState>> {
        Ok(self.lock().states.get(engine_id).cloned())
    }

    async fn save_state(&self, engine_id: &str, state: &PersistedState) -> Result<()> {
        self.lock()
            .states
            .insert(engine_id.to_string(), state.clone());
        Ok(())
    }
}

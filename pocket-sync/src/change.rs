use crate::vclock::VectorClock;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Millisecond wall-clock timestamp.
pub fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}

fn is_false(b: &bool) -> bool {
    !*b
}

/// A document as exchanged with the store and across the wire: application
/// fields flattened next to the sync metadata.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Document {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rev: Option<String>,
    #[serde(default)]
    pub updated_at: i64,
    #[serde(default, skip_serializing_if = "VectorClock::is_empty")]
    pub vclock: VectorClock,
    #[serde(default, skip_serializing_if = "is_false")]
    pub deleted: bool,
    #[serde(flatten)]
    pub fields: Map<String, Value>,
}

impl Document {
    pub fn new(id: impl Into<String>, fields: Map<String, Value>) -> Self {
        Document {
            id: id.into(),
            fields,
            ..Default::default()
        }
    }

    /// The application content as a JSON object, the input to revision
    /// hashing. Metadata is excluded.
    pub fn content(&self) -> Value {
        Value::Object(self.fields.clone())
    }

    /// Tombstone carrying only id, rev and vector clock.
    pub fn tombstone(id: impl Into<String>, rev: Option<String>, vclock: VectorClock) -> Self {
        Document {
            id: id.into(),
            rev,
            updated_at: now_ms(),
            vclock,
            deleted: true,
            fields: Map::new(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Operation {
    Insert,
    Update,
    Delete,
}

/// The unit exchanged across the wire. Value type: once published it is
/// never mutated.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeRecord {
    pub collection: String,
    pub document_id: String,
    pub operation: Operation,
    /// Full post-state; for deletes only the metadata tombstone.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub document: Option<Document>,
    /// Rollback basis and merge-base detection input.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub previous_document: Option<Document>,
    /// Server-assigned, present only once the change has been accepted.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sequence: Option<u64>,
    pub timestamp: i64,
    pub node_id: String,
    #[serde(default, skip_serializing_if = "VectorClock::is_empty")]
    pub vclock: VectorClock,
    #[serde(default, skip_serializing_if = "is_false")]
    pub from_sync: bool,
}

impl ChangeRecord {
    /// Revision carried by the post-state, when any.
    pub fn rev(&self) -> Option<&str> {
        self.document.as_ref().and_then(|d| d.rev.as_deref())
    }
}

/// Local change event published by a store's write path and consumed by the
/// sync engine's subscription.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeEvent {
    pub collection: String,
    pub operation: Operation,
    pub document_id: String,
    pub document: Option<Document>,
    pub previous_document: Option<Document>,
    pub from_sync: bool,
    pub timestamp: i64,
}

impl ChangeEvent {
    /// Normalizes a local event into the wire-shaped change record.
    pub fn into_record(self, node_id: &str) -> ChangeRecord {
        let vclock = self
            .document
            .as_ref()
            .map(|d| d.vclock.clone())
            .unwrap_or_default();
        ChangeRecord {
            collection: self.collection,
            document_id: self.document_id,
            operation: self.operation,
            document: self.document,
            previous_document: self.previous_document,
            sequence: None,
            timestamp: self.timestamp,
            node_id: node_id.to_string(),
            vclock,
            from_sync: self.from_sync,
        }
    }
}

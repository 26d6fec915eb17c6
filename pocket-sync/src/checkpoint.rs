use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// What pull and push messages carry: per-collection high-water marks of
/// server sequences plus the opaque cursor the server issued last.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CheckpointSnapshot {
    #[serde(default)]
    pub sequences: BTreeMap<String, u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub server_cursor: Option<String>,
}

impl CheckpointSnapshot {
    pub fn sequence(&self, collection: &str) -> u64 {
        self.sequences.get(collection).copied().unwrap_or(0)
    }
}

/// Tracks the local node's pull/push high-water marks. The working copy
/// advances as batches apply; `mark_durable` pins it after the store write
/// and `rollback` returns to the pinned value.
#[derive(Debug, Clone, Default)]
pub struct CheckpointManager {
    current: CheckpointSnapshot,
    durable: CheckpointSnapshot,
}

impl CheckpointManager {
    pub fn new(restored: Option<CheckpointSnapshot>) -> Self {
        let snap = restored.unwrap_or_default();
        CheckpointManager {
            current: snap.clone(),
            durable: snap,
        }
    }

    pub fn snapshot(&self) -> CheckpointSnapshot {
        self.current.clone()
    }

    pub fn sequence(&self, collection: &str) -> u64 {
        self.current.sequence(collection)
    }

    /// Advances a collection's sequence. No-op unless `seq` is greater than
    /// the current value; returns whether it moved.
    pub fn advance_sequence(&mut self, collection: &str, seq: u64) -> bool {
        let entry = self
            .current
            .sequences
            .entry(collection.to_string())
            .or_insert(0);
        if seq > *entry {
            *entry = seq;
            true
        } else {
            false
        }
    }

    /// Replaces the opaque server cursor.
    pub fn update_from_server(&mut self, cursor: Option<&str>) {
        if let Some(cursor) = cursor {
            self.current.server_cursor = Some(cursor.to_string());
        }
    }

    /// Pin the working copy as durable, after the batch and the snapshot
    /// have been committed to the store.
    pub fn mark_durable(&mut self) {
        self.durable = self.current.clone();
    }

    /// Reset to the last durable value.
    pub fn rollback(&mut self) {
        self.current = self.durable.clone();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sequences_are_monotonic() {
        let mut cp = CheckpointManager::new(None);
        assert!(cp.advance_sequence("todos", 5));
        assert!(!cp.advance_sequence("todos", 5));
        assert!(!cp.advance_sequence("todos", 3));
        assert_eq!(cp.sequence("todos"), 5);
        assert!(cp.advance_sequence("todos", 6));
        assert_eq!(cp.sequence("todos"), 6);
    }

    #[test]
    fn rollback_returns_to_durable() {
        let mut cp = CheckpointManager::new(None);
        cp.advance_sequence("todos", 10);
        cp.update_from_server(Some("c10"));
        cp.mark_durable();

        cp.advance_sequence("todos", 25);
        cp.update_from_server(Some("c25"));
        cp.rollback();

        assert_eq!(cp.sequence("todos"), 10);
        assert_eq!(cp.snapshot().server_cursor.as_deref(), Some("c10"));
    }

    #[test]
    fn restores_from_snapshot() {
        let mut snap = CheckpointSnapshot::default();
        snap.sequences.insert("todos".into(), 42);
        snap.server_cursor = Some("c42".into());

        let cp = CheckpointManager::new(Some(snap.clone()));
        assert_eq!(cp.snapshot(), snap);
        assert_eq!(cp.sequence("todos"), 42);
        assert_eq!(cp.sequence("notes"), 0);
    }

    #[test]
    fn cursor_update_ignores_none() {
        let mut cp = CheckpointManager::new(None);
        cp.update_from_server(Some("c1"));
        cp.update_from_server(None);
        assert_eq!(cp.snapshot().server_cursor.as_deref(), Some("c1"));
    }
}

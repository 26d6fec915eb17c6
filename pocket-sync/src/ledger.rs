use crate::change::{ChangeRecord, Document, now_ms};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntryStatus {
    Pending,
    InFlight,
    Synced,
    Rejected,
}

/// A local change awaiting server acknowledgement, with enough context to
/// roll the document back if the server rejects it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LedgerEntry {
    pub id: u64,
    pub collection: String,
    pub change: ChangeRecord,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub previous_document: Option<Document>,
    pub status: EntryStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reject_reason: Option<String>,
    pub created_at: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub synced_at: Option<i64>,
}

/// FIFO ledger of optimistic local updates.
///
/// Synced entries are retained for `retention_ms` so self-echoed pulls can be
/// recognized, then purged. Rejected entries not handled within the same
/// window are dropped.
#[derive(Debug, Default)]
pub struct Ledger {
    entries: Vec<LedgerEntry>,
    next_id: u64,
    retention_ms: i64,
}

impl Ledger {
    pub fn new(retention_ms: i64) -> Self {
        Ledger {
            entries: Vec::new(),
            next_id: 1,
            retention_ms,
        }
    }

    /// Rebuilds the ledger from persisted entries. Entries that were in
    /// flight when the process died go back to pending.
    pub fn restore(retention_ms: i64, mut entries: Vec<LedgerEntry>) -> Self {
        for entry in entries.iter_mut() {
            if entry.status == EntryStatus::InFlight {
                entry.status = EntryStatus::Pending;
            }
        }
        let next_id = entries.iter().map(|e| e.id).max().unwrap_or(0) + 1;
        Ledger {
            entries,
            next_id,
            retention_ms,
        }
    }

    pub fn add(
        &mut self,
        collection: &str,
        change: ChangeRecord,
        previous_document: Option<Document>,
    ) -> u64 {
        let id = self.next_id;
        self.next_id += 1;
        self.entries.push(LedgerEntry {
            id,
            collection: collection.to_string(),
            change,
            previous_document,
            status: EntryStatus::Pending,
            reject_reason: None,
            created_at: now_ms(),
            synced_at: None,
        });
        id
    }

    /// Pending entries for one collection in FIFO order, bounded by `limit`.
    /// Skips any document that already has an in-flight entry or an earlier
    /// entry in this very batch, preserving the single-in-flight invariant.
    pub fn pending_sync(&self, collection: &str, limit: usize) -> Vec<LedgerEntry> {
        let mut out: Vec<LedgerEntry> = Vec::new();
        for entry in self.entries.iter().filter(|e| e.collection == collection) {
            if out.len() >= limit {
                break;
            }
            match entry.status {
                EntryStatus::Pending => {
                    let doc = &entry.change.document_id;
                    let busy = self.in_flight_for(collection, doc)
                        || out.iter().any(|e| &e.change.document_id == doc);
                    if !busy {
                        out.push(entry.clone());
                    }
                }
                _ => continue,
            }
        }
        out
    }

    /// Collections that currently have pending entries.
    pub fn pending_collections(&self) -> Vec<String> {
        let mut out: Vec<String> = Vec::new();
        for entry in self.entries.iter() {
            if entry.status == EntryStatus::Pending && !out.contains(&entry.collection) {
                out.push(entry.collection.clone());
            }
        }
        out
    }

    pub fn has_pending(&self) -> bool {
        self.entries.iter().any(|e| e.status == EntryStatus::Pending)
    }

    fn in_flight_for(&self, collection: &str, document_id: &str) -> bool {
        self.entries.iter().any(|e| {
            e.status == EntryStatus::InFlight
                && e.collection == collection
                && e.change.document_id == document_id
        })
    }

    /// Flips a pending entry to in-flight. Returns false when the entry is
    /// unknown, not pending, or its document already has an in-flight entry.
    pub fn mark_in_flight(&mut self, id: u64) -> bool {
        let Some(index) = self.entries.iter().position(|e| e.id == id) else {
            return false;
        };
        if self.entries[index].status != EntryStatus::Pending {
            return false;
        }
        let (collection, document_id) = (
            self.entries[index].collection.clone(),
            self.entries[index].change.document_id.clone(),
        );
        if self.in_flight_for(&collection, &document_id) {
            return false;
        }
        self.entries[index].status = EntryStatus::InFlight;
        true
    }

    /// Acknowledges an entry. Unknown ids are silently ignored: after a
    /// crash between send and ack the matching change comes back on the next
    /// pull and is suppressed as a self-echo instead.
    pub fn mark_synced(&mut self, id: u64) {
        if let Some(entry) = self.entries.iter_mut().find(|e| e.id == id) {
            entry.status = EntryStatus::Synced;
            entry.synced_at = Some(now_ms());
        }
    }

    pub fn reject(&mut self, id: u64, reason: &str) {
        if let Some(entry) = self.entries.iter_mut().find(|e| e.id == id) {
            entry.status = EntryStatus::Rejected;
            entry.reject_reason = Some(reason.to_string());
        }
    }

    /// Removes an entry, returning its rollback basis.
    pub fn rollback(&mut self, id: u64) -> Option<LedgerEntry> {
        let index = self.entries.iter().position(|e| e.id == id)?;
        Some(self.entries.remove(index))
    }

    /// Removes every non-synced entry for a document, used once a conflict
    /// resolution supersedes the local history of that document.
    pub fn remove_for_document(&mut self, collection: &str, document_id: &str) -> usize {
        let before = self.entries.len();
        self.entries.retain(|e| {
            e.status == EntryStatus::Synced
                || e.collection != collection
                || e.change.document_id != document_id
        });
        before - self.entries.len()
    }

    /// Entries (any status) for one document, FIFO.
    pub fn entries_for(&self, collection: &str, document_id: &str) -> Vec<&LedgerEntry> {
        self.entries
            .iter()
            .filter(|e| e.collection == collection && e.change.document_id == document_id)
            .collect()
    }

    /// Whether a document has entries still awaiting acknowledgement.
    pub fn has_unacked(&self, collection: &str, document_id: &str) -> bool {
        self.entries.iter().any(|e| {
            e.collection == collection
                && e.change.document_id == document_id
                && matches!(e.status, EntryStatus::Pending | EntryStatus::InFlight)
        })
    }

    /// True when a pulled change matches a synced entry still inside the
    /// retention window: the change is our own echo.
    pub fn is_self_echo(&self, collection: &str, document_id: &str, rev: Option<&str>) -> bool {
        let now = now_ms();
        self.entries.iter().any(|e| {
            e.status == EntryStatus::Synced
                && e.collection == collection
                && e.change.document_id == document_id
                && e.change.rev() == rev
                && e.synced_at.is_some_and(|t| now - t <= self.retention_ms)
        })
    }

    /// Puts every in-flight entry back to pending, preserving order. Used on
    /// forced disconnect and send failure.
    pub fn requeue_in_flight(&mut self) -> usize {
        let mut requeued = 0;
        for entry in self.entries.iter_mut() {
            if entry.status == EntryStatus::InFlight {
                entry.status = EntryStatus::Pending;
                requeued += 1;
            }
        }
        requeued
    }

    /// Drops synced and rejected entries older than the retention window.
    pub fn purge(&mut self) {
        let now = now_ms();
        let retention = self.retention_ms;
        self.entries.retain(|e| match e.status {
            EntryStatus::Synced => e.synced_at.is_none_or(|t| now - t <= retention),
            EntryStatus::Rejected => now - e.created_at <= retention,
            _ => true,
        });
    }

    /// Entries worth persisting: everything not yet acknowledged.
    pub fn persistable(&self) -> Vec<LedgerEntry> {
        self.entries
            .iter()
            .filter(|e| e.status != EntryStatus::Synced)
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

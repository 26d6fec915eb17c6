use crate::retry::RetryEvent;
use serde::Serialize;
use tokio::sync::{broadcast, watch};

/// Engine lifecycle state as surfaced to subscribers.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncStatus {
    #[default]
    Idle,
    Syncing,
    Error,
    Offline,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct SyncStats {
    pub push_count: u64,
    pub pull_count: u64,
    pub conflict_count: u64,
    pub last_sync_at: Option<i64>,
    pub last_error: Option<String>,
}

/// Producer side of the engine's observable outputs. Status and stats use
/// watch channels (last-value replay for late subscribers); retry events use
/// a broadcast channel (event-wise delivery, multiple consumers).
#[derive(Debug)]
pub struct Observables {
    status_tx: watch::Sender<SyncStatus>,
    stats_tx: watch::Sender<SyncStats>,
    retry_tx: broadcast::Sender<RetryEvent>,
}

impl Observables {
    pub fn new(retry_tx: broadcast::Sender<RetryEvent>) -> Self {
        let (status_tx, _) = watch::channel(SyncStatus::default());
        let (stats_tx, _) = watch::channel(SyncStats::default());
        Observables {
            status_tx,
            stats_tx,
            retry_tx,
        }
    }

    pub fn set_status(&self, status: SyncStatus) {
        self.status_tx.send_if_modified(|current| {
            if *current != status {
                *current = status;
                true
            } else {
                false
            }
        });
    }

    pub fn status(&self) -> SyncStatus {
        *self.status_tx.borrow()
    }

    pub fn update_stats(&self, f: impl FnOnce(&mut SyncStats)) {
        self.stats_tx.send_modify(f);
    }

    pub fn stats(&self) -> SyncStats {
        self.stats_tx.borrow().clone()
    }

    pub fn watch_status(&self) -> watch::Receiver<SyncStatus> {
        self.status_tx.subscribe()
    }

    pub fn watch_stats(&self) -> watch::Receiver<SyncStats> {
        self.stats_tx.subscribe()
    }

    pub fn retry_events(&self) -> broadcast::Receiver<RetryEvent> {
        self.retry_tx.subscribe()
    }
}

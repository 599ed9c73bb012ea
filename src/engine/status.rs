//! # Sync State Publisher
//!
//! Read-only projection of the engine's state for the UI layer: how many
//! operations still await confirmation, how many conflicts await a
//! decision, and when the last fully successful drain pass finished.
//! Recomputed from the store after every queue mutation and published
//! through a `watch` channel; no business logic lives here.

use crate::error::SyncError;
use crate::store::LocalStore;
use chrono::{DateTime, Utc};
use tokio::sync::watch;

/// Snapshot of the engine's externally visible state
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct SyncStatus {
    /// Operations not yet confirmed by the server (PENDING, IN_FLIGHT or FAILED)
    pub pending_count: u64,
    /// Conflicts awaiting resolution
    pub conflict_count: u64,
    /// End of the last drain pass that completed without transient failures
    pub last_sync_at: Option<DateTime<Utc>>,
    /// A drain pass is currently running
    pub is_syncing: bool,
}

/// Publishes [`SyncStatus`] snapshots to any number of subscribers
#[derive(Debug)]
pub(crate) struct StatusPublisher {
    tx: watch::Sender<SyncStatus>,
}

impl StatusPublisher {
    pub fn new() -> (Self, watch::Receiver<SyncStatus>) {
        let (tx, rx) = watch::channel(SyncStatus::default());
        (Self { tx }, rx)
    }

    pub fn subscribe(&self) -> watch::Receiver<SyncStatus> {
        self.tx.subscribe()
    }

    pub fn current(&self) -> SyncStatus {
        self.tx.borrow().clone()
    }

    /// Recompute the projection from the store and publish it
    pub async fn refresh(&self, store: &LocalStore, is_syncing: bool) -> Result<(), SyncError> {
        let stats = store.queue_stats().await?;
        let status = SyncStatus {
            pending_count: stats.pending + stats.in_flight + stats.failed,
            conflict_count: store.count_pending_conflicts().await?,
            last_sync_at: store.last_sync_at().await?,
            is_syncing,
        };
        self.tx.send_replace(status);
        Ok(())
    }
}

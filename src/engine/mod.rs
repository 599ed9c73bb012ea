//! # Sync Engine
//!
//! The façade the application talks to. Owns the local store, the HTTP
//! client and the background scheduler task, and exposes enqueue,
//! conflict resolution, connectivity and status APIs. All enqueue calls
//! are durable before they return; the network catches up later.

pub mod client;
pub mod resolver;
pub mod scheduler;
pub mod status;

pub use client::{HttpSyncClient, StaticTokenProvider, SyncResult, TokenProvider};
pub use resolver::{ConflictResolver, ResolutionAction};
pub use scheduler::PassSummary;
pub use status::SyncStatus;

use crate::config::SyncConfig;
use crate::error::SyncError;
use crate::store::{
    ConflictKind, LocalStore, NewOperation, OperationKind, QueueStats, Resolution, SyncConflict,
    SyncOperation,
};
use crate::types::{EntityKind, EntityPayload};
use scheduler::SyncContext;
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use uuid::Uuid;

pub struct SyncEngine {
    ctx: Arc<SyncContext>,
    trigger_tx: mpsc::Sender<()>,
    online_tx: watch::Sender<bool>,
    shutdown_tx: watch::Sender<bool>,
    task: std::sync::Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl SyncEngine {
    /// Build the engine around an opened store and spawn the scheduler.
    ///
    /// The engine starts offline; the application reports connectivity
    /// through [`SyncEngine::set_online`].
    pub async fn new(
        config: SyncConfig,
        store: Arc<LocalStore>,
        tokens: Arc<dyn TokenProvider>,
    ) -> Result<Self, SyncError> {
        let client = HttpSyncClient::new(config.clone(), tokens);
        let resolver = ConflictResolver::new(config.clone());
        let (publisher, _) = status::StatusPublisher::new();
        let ctx = Arc::new(SyncContext::new(store, client, resolver, config, publisher));

        ctx.status.refresh(&ctx.store, false).await?;

        let (trigger_tx, trigger_rx) = mpsc::channel(1);
        let (online_tx, online_rx) = watch::channel(false);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let task = tokio::spawn(scheduler::run_scheduler(
            Arc::clone(&ctx),
            trigger_rx,
            online_rx,
            shutdown_rx,
        ));

        Ok(Self {
            ctx,
            trigger_tx,
            online_tx,
            shutdown_tx,
            task: std::sync::Mutex::new(Some(task)),
        })
    }

    // ---- enqueue -------------------------------------------------------

    /// Queue a CREATE carrying a locally assigned tentative id.
    ///
    /// Returns the queued operation id.
    pub async fn enqueue_create(
        &self,
        entity_id: impl Into<String>,
        payload: EntityPayload,
    ) -> Result<Option<Uuid>, SyncError> {
        let entity_kind = payload.kind();
        let id = self
            .ctx
            .store
            .enqueue(NewOperation {
                kind: OperationKind::Create,
                entity_kind,
                entity_id: entity_id.into(),
                payload: Some(payload),
                base_version: None,
            })
            .await?;
        self.after_enqueue().await?;
        Ok(id)
    }

    /// Queue an UPDATE. The base version is stamped from the last
    /// server-confirmed version of the entity, or left empty for an
    /// entity the server has never confirmed.
    pub async fn enqueue_update(
        &self,
        entity_id: impl Into<String>,
        payload: EntityPayload,
    ) -> Result<Option<Uuid>, SyncError> {
        let entity_kind = payload.kind();
        let entity_id = entity_id.into();
        let base_version = self.ctx.store.get_version(entity_kind, &entity_id).await?;
        let id = self
            .ctx
            .store
            .enqueue(NewOperation {
                kind: OperationKind::Update,
                entity_kind,
                entity_id,
                payload: Some(payload),
                base_version,
            })
            .await?;
        self.after_enqueue().await?;
        Ok(id)
    }

    /// Queue a DELETE. Cancels an unconfirmed CREATE outright, in which
    /// case `None` is returned and nothing reaches the server.
    pub async fn enqueue_delete(
        &self,
        entity_kind: EntityKind,
        entity_id: impl Into<String>,
    ) -> Result<Option<Uuid>, SyncError> {
        let entity_id = entity_id.into();
        let base_version = self.ctx.store.get_version(entity_kind, &entity_id).await?;
        let id = self
            .ctx
            .store
            .enqueue(NewOperation {
                kind: OperationKind::Delete,
                entity_kind,
                entity_id,
                payload: None,
                base_version,
            })
            .await?;
        self.after_enqueue().await?;
        Ok(id)
    }

    async fn after_enqueue(&self) -> Result<(), SyncError> {
        self.ctx.status.refresh(&self.ctx.store, false).await?;
        if *self.online_tx.borrow() {
            self.trigger_sync();
        }
        Ok(())
    }

    // ---- conflicts -----------------------------------------------------

    /// Conflicts awaiting a decision, oldest first
    pub async fn pending_conflicts(&self) -> Result<Vec<SyncConflict>, SyncError> {
        self.ctx.store.list_pending_conflicts().await
    }

    /// Apply a user's decision to an escalated conflict.
    ///
    /// `Manual` requires `data`, the hand-merged result. The other
    /// resolutions derive their outcome from the recorded conflict.
    pub async fn resolve_conflict(
        &self,
        conflict_id: Uuid,
        resolution: Resolution,
        data: Option<EntityPayload>,
    ) -> Result<(), SyncError> {
        let conflict = self
            .ctx
            .store
            .get_conflict(conflict_id)
            .await?
            .ok_or(SyncError::ConflictNotFound(conflict_id))?;
        if !conflict.is_pending() {
            return Err(SyncError::ConflictAlreadyResolved(conflict_id));
        }

        match resolution {
            Resolution::ServerWins => self.resolve_server_wins(&conflict).await?,
            Resolution::ClientWins => self.resolve_client_wins(&conflict).await?,
            Resolution::Merge => self.resolve_merge(&conflict).await?,
            Resolution::Manual => {
                let payload = data.ok_or(SyncError::ResolutionNeedsData)?;
                self.resolve_with_payload(&conflict, resolution, payload).await?;
            }
        }

        self.ctx.status.refresh(&self.ctx.store, false).await?;
        if *self.online_tx.borrow() {
            self.trigger_sync();
        }
        Ok(())
    }

    /// Drop the local intent and adopt the server state
    async fn resolve_server_wins(&self, conflict: &SyncConflict) -> Result<(), SyncError> {
        let store = &self.ctx.store;
        if conflict.server_data.is_some() {
            store
                .set_version(conflict.entity_kind, &conflict.entity_id, conflict.server_version)
                .await?;
        } else {
            store.clear_version(conflict.entity_kind, &conflict.entity_id).await?;
        }
        if let Some(op) = store
            .get_conflicted_operation(conflict.entity_kind, &conflict.entity_id)
            .await?
        {
            store.mark_succeeded(op.id).await?;
        }
        // Nothing will be replayed, so the record is finished here.
        store.record_resolution(conflict.id, Resolution::ServerWins, None).await?;
        store.delete_conflict(conflict.id).await?;
        tracing::info!(
            entity = %conflict.entity_kind,
            id = %conflict.entity_id,
            "conflict resolved: server state adopted"
        );
        Ok(())
    }

    /// Reassert the local intent on top of the server's current version
    async fn resolve_client_wins(&self, conflict: &SyncConflict) -> Result<(), SyncError> {
        let (kind, payload, base_version) = match conflict.kind {
            ConflictKind::UpdateUpdate => (
                OperationKind::Update,
                conflict.local_data.clone(),
                Some(conflict.server_version),
            ),
            // Server deleted the entity; winning means recreating it.
            ConflictKind::UpdateDelete => (OperationKind::Create, conflict.local_data.clone(), None),
            // Local deleted, server edited; winning means deleting the
            // fresh server version.
            ConflictKind::DeleteUpdate => {
                (OperationKind::Delete, None, Some(conflict.server_version))
            }
        };

        if matches!(kind, OperationKind::Create | OperationKind::Update) && payload.is_none() {
            return Err(SyncError::ResolutionNeedsData);
        }

        self.requeue_conflicted(conflict, Resolution::ClientWins, kind, payload, base_version)
            .await
    }

    /// Field-merge the two sides and replay the result as an UPDATE
    async fn resolve_merge(&self, conflict: &SyncConflict) -> Result<(), SyncError> {
        if conflict.kind != ConflictKind::UpdateUpdate || !conflict.entity_kind.is_mergeable() {
            return Err(SyncError::ResolutionNeedsData);
        }
        let local = conflict
            .local_data
            .as_ref()
            .ok_or(SyncError::ResolutionNeedsData)?;
        let server = conflict
            .server_data
            .as_ref()
            .ok_or(SyncError::ResolutionNeedsData)?;

        let parked = self
            .ctx
            .store
            .get_conflicted_operation(conflict.entity_kind, &conflict.entity_id)
            .await?;
        let local_newer = parked
            .as_ref()
            .map(|op| op.client_timestamp >= resolver::server_modified_millis(server))
            .unwrap_or(false);

        let merged = resolver::merge_fields(&local.to_wire_value()?, server, local_newer);
        let payload = EntityPayload::from_wire_value(conflict.entity_kind, merged)?;

        self.requeue_conflicted(
            conflict,
            Resolution::Merge,
            OperationKind::Update,
            Some(payload),
            Some(conflict.server_version),
        )
        .await
    }

    /// Replay a caller-provided payload as the resolution
    async fn resolve_with_payload(
        &self,
        conflict: &SyncConflict,
        resolution: Resolution,
        payload: EntityPayload,
    ) -> Result<(), SyncError> {
        // A hand-merged result against a server-side delete recreates
        // the entity.
        let (kind, base_version) = if conflict.server_data.is_some() {
            (OperationKind::Update, Some(conflict.server_version))
        } else {
            (OperationKind::Create, None)
        };
        self.requeue_conflicted(conflict, resolution, kind, Some(payload), base_version)
            .await
    }

    async fn requeue_conflicted(
        &self,
        conflict: &SyncConflict,
        resolution: Resolution,
        kind: OperationKind,
        payload: Option<EntityPayload>,
        base_version: Option<i64>,
    ) -> Result<(), SyncError> {
        let store = &self.ctx.store;
        let resolved_wire = payload.as_ref().map(|p| p.to_wire_value()).transpose()?;
        store
            .record_resolution(conflict.id, resolution, resolved_wire.as_ref())
            .await?;

        match store
            .get_conflicted_operation(conflict.entity_kind, &conflict.entity_id)
            .await?
        {
            Some(op) => {
                store
                    .requeue_resolved(op.id, kind, payload.as_ref(), base_version)
                    .await?;
            }
            // The parked operation is gone (cleanup raced the UI); queue
            // the resolution as a fresh operation.
            None => {
                store
                    .enqueue(NewOperation {
                        kind,
                        entity_kind: conflict.entity_kind,
                        entity_id: conflict.entity_id.clone(),
                        payload,
                        base_version,
                    })
                    .await?;
            }
        }

        tracing::info!(
            entity = %conflict.entity_kind,
            id = %conflict.entity_id,
            resolution = resolution.as_str(),
            "conflict resolved, operation re-enqueued"
        );
        Ok(())
    }

    // ---- scheduling ----------------------------------------------------

    /// Report a connectivity change. Coming online resets backoff and
    /// schedules a drain pass; going offline lets in-flight sends finish
    /// and parks the queue.
    pub fn set_online(&self, online: bool) {
        let changed = self.online_tx.send_replace(online) != online;
        if changed {
            tracing::debug!(online, "connectivity changed");
        }
    }

    /// Ask for a drain pass as soon as possible. Coalesces: while a pass
    /// is running, any number of triggers fold into one follow-up pass.
    pub fn trigger_sync(&self) {
        let _ = self.trigger_tx.try_send(());
    }

    /// Run one drain pass inline and return its summary.
    ///
    /// Shares the pass lock with the scheduler, so it never races a
    /// background pass.
    pub async fn sync_once(&self) -> PassSummary {
        scheduler::drain_pass(&self.ctx, *self.online_tx.borrow()).await
    }

    // ---- maintenance ---------------------------------------------------

    /// Return FAILED operations to the queue with a fresh retry budget
    pub async fn retry_failed(&self) -> Result<u64, SyncError> {
        let restored = self.ctx.store.retry_failed().await?;
        if restored > 0 {
            self.after_enqueue().await?;
        }
        Ok(restored)
    }

    /// Drop FAILED operations older than `max_age`
    pub async fn cleanup_failed(&self, max_age: chrono::Duration) -> Result<u64, SyncError> {
        let removed = self.ctx.store.cleanup_failed(max_age).await?;
        if removed > 0 {
            self.ctx.status.refresh(&self.ctx.store, false).await?;
        }
        Ok(removed)
    }

    pub async fn queue_stats(&self) -> Result<QueueStats, SyncError> {
        self.ctx.store.queue_stats().await
    }

    /// Every operation in the log regardless of status, enqueue order
    pub async fn list_operations(&self) -> Result<Vec<SyncOperation>, SyncError> {
        self.ctx.store.list_operations().await
    }

    // ---- status --------------------------------------------------------

    pub fn status(&self) -> SyncStatus {
        self.ctx.status.current()
    }

    /// Watch channel carrying every status change
    pub fn subscribe_status(&self) -> watch::Receiver<SyncStatus> {
        self.ctx.status.subscribe()
    }

    pub fn store(&self) -> &Arc<LocalStore> {
        &self.ctx.store
    }

    /// Stop the scheduler and wait for it to exit. In-flight sends
    /// complete; pending operations stay durable for the next run.
    pub async fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
        let task = self.task.lock().ok().and_then(|mut guard| guard.take());
        if let Some(task) = task {
            let _ = task.await;
        }
    }
}

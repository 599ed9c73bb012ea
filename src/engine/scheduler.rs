//! # Sync Scheduler
//!
//! Decides *when* a drain pass runs and enforces mutual exclusion between
//! passes. Triggers are the offline-to-online connectivity edge, a
//! periodic timer (active only while online and authenticated) and an
//! explicit manual trigger. A trigger arriving while a pass is running
//! parks in a capacity-one channel and coalesces into a single follow-up
//! pass instead of spawning a concurrent one.
//!
//! A pass drains the operation log entity by entity: operations for one
//! entity replay strictly in enqueue order, distinct entities are
//! dispatched concurrently up to a bounded limit. A transient failure
//! stops only its own entity's chain and sends the scheduler into
//! exponential backoff; rejected and conflicted operations are recorded
//! and never halt unrelated entities.

use crate::config::SyncConfig;
use crate::engine::client::{HttpSyncClient, SyncResult};
use crate::engine::resolver::{ConflictResolver, ResolutionAction};
use crate::engine::status::StatusPublisher;
use crate::error::SyncError;
use crate::store::{LocalStore, OperationKind, SyncOperation};
use chrono::Utc;
use futures_util::stream::{self, StreamExt};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch, Mutex};

/// Shared engine internals, owned behind an `Arc` by the façade and the
/// scheduler task
pub(crate) struct SyncContext {
    pub store: Arc<LocalStore>,
    pub client: HttpSyncClient,
    pub resolver: ConflictResolver,
    pub config: SyncConfig,
    pub status: StatusPublisher,
    /// The one lock in the engine: whoever holds it is the active pass.
    pass_lock: Mutex<()>,
}

impl SyncContext {
    pub fn new(
        store: Arc<LocalStore>,
        client: HttpSyncClient,
        resolver: ConflictResolver,
        config: SyncConfig,
        status: StatusPublisher,
    ) -> Self {
        Self {
            store,
            client,
            resolver,
            config,
            status,
            pass_lock: Mutex::new(()),
        }
    }
}

/// Outcome counts of one drain pass
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PassSummary {
    /// The pass did not run (offline or unauthenticated)
    pub skipped: bool,
    /// Operations confirmed and removed from the log
    pub succeeded: u64,
    /// Operations that failed transiently and will retry
    pub transient: u64,
    /// Operations permanently rejected
    pub rejected: u64,
    /// Conflicts settled automatically (re-enqueued or server adopted)
    pub auto_resolved: u64,
    /// Conflicts persisted for manual review
    pub escalated: u64,
    /// Server states adopted over visibly different local intents
    pub overwrites: u64,
}

impl PassSummary {
    fn absorb(&mut self, other: PassSummary) {
        self.succeeded += other.succeeded;
        self.transient += other.transient;
        self.rejected += other.rejected;
        self.auto_resolved += other.auto_resolved;
        self.escalated += other.escalated;
        self.overwrites += other.overwrites;
    }
}

/// Exponential backoff delay for the given attempt, capped
fn backoff_delay(base: Duration, cap: Duration, attempt: u32) -> Duration {
    let factor = 2u32.saturating_pow(attempt.min(16));
    base.saturating_mul(factor).min(cap)
}

/// Run one drain pass: send every pending operation, entity chains in
/// order, distinct entities concurrently up to the configured bound.
pub(crate) async fn drain_pass(ctx: &SyncContext, online: bool) -> PassSummary {
    let _guard = ctx.pass_lock.lock().await;

    if !online || !ctx.client.is_authenticated() {
        return PassSummary { skipped: true, ..PassSummary::default() };
    }

    let pending = match ctx.store.list_pending().await {
        Ok(pending) => pending,
        Err(err) => {
            tracing::error!(error = %err, "failed to read operation log, skipping pass");
            return PassSummary { skipped: true, ..PassSummary::default() };
        }
    };

    if pending.is_empty() {
        let _ = ctx.store.set_last_sync_at(Utc::now()).await;
        let _ = ctx.status.refresh(&ctx.store, false).await;
        return PassSummary::default();
    }

    tracing::debug!(pending = pending.len(), "drain pass starting");
    let _ = ctx.status.refresh(&ctx.store, true).await;

    // Group into per-entity chains, preserving enqueue order within each
    // chain and first-seen order across chains.
    let mut chains: Vec<Vec<SyncOperation>> = Vec::new();
    let mut index: std::collections::HashMap<(String, String), usize> =
        std::collections::HashMap::new();
    for op in pending {
        let key = (op.entity_kind.resource().to_string(), op.entity_id.clone());
        match index.get(&key) {
            Some(&i) => chains[i].push(op),
            None => {
                index.insert(key, chains.len());
                chains.push(vec![op]);
            }
        }
    }

    let limit = ctx.config.max_concurrency.max(1);
    let summary = stream::iter(chains)
        .map(|chain| process_chain(ctx, chain))
        .buffer_unordered(limit)
        .fold(PassSummary::default(), |mut acc, chain_summary| async move {
            acc.absorb(chain_summary);
            acc
        })
        .await;

    if summary.transient == 0 {
        let _ = ctx.store.set_last_sync_at(Utc::now()).await;
    }

    let _ = ctx.status.refresh(&ctx.store, false).await;
    tracing::info!(
        succeeded = summary.succeeded,
        transient = summary.transient,
        rejected = summary.rejected,
        auto_resolved = summary.auto_resolved,
        escalated = summary.escalated,
        "drain pass finished"
    );
    summary
}

/// Replay one entity's operations in enqueue order; a transient failure
/// stops the chain so ordering is preserved on the next pass
async fn process_chain(ctx: &SyncContext, chain: Vec<SyncOperation>) -> PassSummary {
    let mut summary = PassSummary::default();

    for op in chain {
        // Re-read the row: an earlier CREATE in this chain may have
        // remapped the entity id, or a UI enqueue may have coalesced a
        // fresher payload in.
        let op = match ctx.store.get_operation(op.id).await {
            Ok(Some(op)) => op,
            Ok(None) => continue, // superseded mid-pass
            Err(err) => {
                tracing::error!(error = %err, "failed to re-read operation");
                summary.transient += 1;
                break;
            }
        };
        if op.status != crate::store::OperationStatus::Pending {
            continue;
        }

        match process_operation(ctx, &op).await {
            Ok(outcome) => {
                let stop = matches!(outcome, OpOutcome::Transient);
                match outcome {
                    OpOutcome::Succeeded => summary.succeeded += 1,
                    OpOutcome::Transient => summary.transient += 1,
                    OpOutcome::Rejected => summary.rejected += 1,
                    OpOutcome::AutoResolved => summary.auto_resolved += 1,
                    OpOutcome::ServerAdopted { visibly_different } => {
                        summary.auto_resolved += 1;
                        if visibly_different {
                            summary.overwrites += 1;
                        }
                    }
                    OpOutcome::Escalated => summary.escalated += 1,
                }
                if stop {
                    break;
                }
            }
            Err(err) if err.is_transient() => {
                tracing::warn!(op = %op.id, error = %err, "operation processing failed, will retry");
                let _ = ctx
                    .store
                    .mark_failed(op.id, &err.to_string(), ctx.config.max_retries)
                    .await;
                summary.transient += 1;
                break;
            }
            // Local failures (bad payload, store corruption) never heal
            // through retrying.
            Err(err) => {
                tracing::error!(op = %op.id, error = %err, "operation processing failed");
                let _ = ctx.store.mark_rejected(op.id, &err.to_string()).await;
                summary.rejected += 1;
            }
        }
    }

    summary
}

#[derive(Debug)]
enum OpOutcome {
    Succeeded,
    Transient,
    Rejected,
    AutoResolved,
    ServerAdopted { visibly_different: bool },
    Escalated,
}

async fn process_operation(ctx: &SyncContext, op: &SyncOperation) -> Result<OpOutcome, SyncError> {
    ctx.store.mark_in_flight(op.id).await?;

    // An UPDATE or DELETE queued before the entity was first confirmed
    // carries no base version. The tracker may hold one by send time,
    // once the CREATE ahead of it in the chain has succeeded.
    let mut op = op.clone();
    if op.base_version.is_none() && op.kind != OperationKind::Create {
        op.base_version = ctx.store.get_version(op.entity_kind, &op.entity_id).await?;
    }
    let op = &op;

    let result = ctx.client.send(op).await?;

    match result {
        SyncResult::Accepted { new_version, server_id } => {
            let mut entity_id = op.entity_id.clone();
            if op.kind == OperationKind::Create {
                if let Some(server_id) = server_id.filter(|id| *id != op.entity_id) {
                    let remapped = ctx
                        .store
                        .remap_entity_id(op.entity_kind, &op.entity_id, &server_id)
                        .await?;
                    tracing::debug!(
                        entity = %op.entity_kind,
                        tentative = %op.entity_id,
                        assigned = %server_id,
                        remapped,
                        "server remapped tentative entity id"
                    );
                    entity_id = server_id;
                }
            }

            if op.kind == OperationKind::Delete {
                ctx.store.clear_version(op.entity_kind, &entity_id).await?;
            } else {
                ctx.store.set_version(op.entity_kind, &entity_id, new_version).await?;
            }

            ctx.store.mark_succeeded(op.id).await?;
            // A successful write acknowledges any resolution applied earlier.
            ctx.store.delete_resolved_conflicts(op.entity_kind, &entity_id).await?;
            Ok(OpOutcome::Succeeded)
        }
        SyncResult::Conflict { server_version, server_data } => {
            let (conflict_kind, action) =
                ctx.resolver.decide(op, server_version, server_data.as_ref())?;

            match action {
                ResolutionAction::AdoptServer { visibly_different } => {
                    ctx.store.set_version(op.entity_kind, &op.entity_id, server_version).await?;
                    ctx.store.mark_succeeded(op.id).await?;
                    if visibly_different {
                        tracing::info!(
                            entity = %op.entity_kind,
                            id = %op.entity_id,
                            server_version,
                            "applied remote state over local change"
                        );
                    }
                    Ok(OpOutcome::ServerAdopted { visibly_different })
                }
                ResolutionAction::Requeue { kind, payload, base_version } => {
                    ctx.store
                        .requeue_resolved(op.id, kind, payload.as_ref(), base_version)
                        .await?;
                    tracing::debug!(
                        op = %op.id,
                        entity = %op.entity_kind,
                        server_version,
                        "conflict auto-resolved, operation re-enqueued"
                    );
                    Ok(OpOutcome::AutoResolved)
                }
                ResolutionAction::Escalate => {
                    ctx.store
                        .insert_conflict(
                            op.entity_kind,
                            &op.entity_id,
                            conflict_kind,
                            op.base_version,
                            server_version,
                            op.payload.as_ref(),
                            server_data.as_ref(),
                        )
                        .await?;
                    ctx.store.mark_conflicted(op.id).await?;
                    tracing::warn!(
                        entity = %op.entity_kind,
                        id = %op.entity_id,
                        kind = conflict_kind.as_str(),
                        "conflict escalated for manual resolution"
                    );
                    Ok(OpOutcome::Escalated)
                }
            }
        }
        SyncResult::Rejected { reason } => {
            ctx.store.mark_rejected(op.id, &reason).await?;
            tracing::warn!(op = %op.id, entity = %op.entity_kind, %reason, "operation rejected");
            Ok(OpOutcome::Rejected)
        }
        SyncResult::Transient { error } => {
            let status = ctx
                .store
                .mark_failed(op.id, &error, ctx.config.max_retries)
                .await?;
            tracing::debug!(op = %op.id, %error, status = status.as_str(), "transient send failure");
            Ok(OpOutcome::Transient)
        }
    }
}

/// Scheduler task body.
///
/// State machine: Idle -> Syncing -> (Idle | Backoff) -> Idle, with a
/// terminal Stopped on shutdown. Sequential by construction: the loop is
/// the Syncing state, and the capacity-one trigger channel realizes the
/// run-again coalescing.
pub(crate) async fn run_scheduler(
    ctx: Arc<SyncContext>,
    mut trigger_rx: mpsc::Receiver<()>,
    mut online_rx: watch::Receiver<bool>,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    let period = ctx.config.sync_interval;
    let mut timer = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
    timer.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    let mut backoff_attempt: u32 = 0;

    loop {
        let run = tokio::select! {
            _ = timer.tick() => {
                ctx.config.auto_sync && *online_rx.borrow() && ctx.client.is_authenticated()
            }
            received = trigger_rx.recv() => {
                if received.is_none() {
                    break;
                }
                true
            }
            changed = online_rx.changed() => {
                if changed.is_err() {
                    break;
                }
                let online = *online_rx.borrow();
                if online {
                    tracing::debug!("connectivity restored, scheduling drain pass");
                    backoff_attempt = 0;
                }
                online
            }
            changed = shutdown_rx.changed() => {
                if changed.is_err() || *shutdown_rx.borrow() {
                    break;
                }
                false
            }
        };

        if !run {
            continue;
        }

        let online = *online_rx.borrow();
        let summary = drain_pass(&ctx, online).await;

        if summary.transient > 0 {
            let delay = backoff_delay(ctx.config.backoff_base, ctx.config.backoff_cap, backoff_attempt);
            backoff_attempt = backoff_attempt.saturating_add(1);
            tracing::debug!(?delay, attempt = backoff_attempt, "transient failures, backing off");
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = shutdown_rx.changed() => break,
            }
        } else if !summary.skipped {
            backoff_attempt = 0;
        }
    }

    tracing::debug!("sync scheduler stopped");
}

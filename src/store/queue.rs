//! # Operation Log
//!
//! Durable, append-only record of intended writes made while the client
//! lacked confirmation of server acceptance. Rows live in the
//! `sync_operations` table and survive process restarts; an enqueue is
//! committed before the call returns.
//!
//! ## Coalescing
//!
//! Enqueues on an entity that already has un-sent work are collapsed so a
//! burst of edits costs one network round-trip and the final state wins:
//!
//! - an UPDATE folds into a PENDING UPDATE (or unconfirmed CREATE) for the
//!   same entity, keeping the latest payload and the earliest base version
//! - a DELETE supersedes and removes PENDING work for the entity
//! - a DELETE after a still-unconfirmed CREATE cancels both; nothing is
//!   sent and `enqueue` returns `None`
//!
//! IN_FLIGHT rows are never touched by coalescing. The whole decision runs
//! inside one SQLite transaction, so a UI enqueue cannot interleave with a
//! drain pass mid-rewrite.

use crate::error::SyncError;
use crate::store::LocalStore;
use crate::types::{EntityKind, EntityPayload};
use chrono::Utc;
use sqlx::sqlite::SqliteRow;
use sqlx::Row;
use uuid::Uuid;

/// What a queued operation does to its target entity
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperationKind {
    Create,
    Update,
    Delete,
}

impl OperationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            OperationKind::Create => "CREATE",
            OperationKind::Update => "UPDATE",
            OperationKind::Delete => "DELETE",
        }
    }

    fn from_str(s: &str) -> Option<Self> {
        match s {
            "CREATE" => Some(OperationKind::Create),
            "UPDATE" => Some(OperationKind::Update),
            "DELETE" => Some(OperationKind::Delete),
            _ => None,
        }
    }
}

/// Queue lifecycle state of an operation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperationStatus {
    /// Waiting to be sent
    Pending,
    /// Currently being sent by a drain pass
    InFlight,
    /// Exhausted its retry budget or permanently rejected; kept for manual retry
    Failed,
    /// Parked behind an unresolved conflict record
    Conflicted,
}

impl OperationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            OperationStatus::Pending => "PENDING",
            OperationStatus::InFlight => "IN_FLIGHT",
            OperationStatus::Failed => "FAILED",
            OperationStatus::Conflicted => "CONFLICTED",
        }
    }

    fn from_str(s: &str) -> Option<Self> {
        match s {
            "PENDING" => Some(OperationStatus::Pending),
            "IN_FLIGHT" => Some(OperationStatus::InFlight),
            "FAILED" => Some(OperationStatus::Failed),
            "CONFLICTED" => Some(OperationStatus::Conflicted),
            _ => None,
        }
    }
}

/// A durable record of one intended mutation
#[derive(Debug, Clone)]
pub struct SyncOperation {
    /// Client-generated id, doubles as the idempotency key
    pub id: Uuid,
    pub kind: OperationKind,
    pub entity_kind: EntityKind,
    /// Target entity id; for CREATE, a client-generated tentative id
    pub entity_id: String,
    /// Entity snapshot at enqueue time; absent for DELETE
    pub payload: Option<EntityPayload>,
    /// Monotonic enqueue timestamp in milliseconds
    pub client_timestamp: i64,
    /// Known server version at enqueue time; absent for CREATE
    pub base_version: Option<i64>,
    /// Failed send attempts so far
    pub retries: u32,
    /// Automatic conflict resolutions already spent on this operation
    pub resolution_attempts: u32,
    pub status: OperationStatus,
    pub last_error: Option<String>,
}

/// Input for [`LocalStore::enqueue`]
#[derive(Debug, Clone)]
pub struct NewOperation {
    pub kind: OperationKind,
    pub entity_kind: EntityKind,
    pub entity_id: String,
    pub payload: Option<EntityPayload>,
    pub base_version: Option<i64>,
}

/// Counts per queue status
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueueStats {
    pub pending: u64,
    pub in_flight: u64,
    pub failed: u64,
    pub conflicted: u64,
}

fn row_to_operation(row: &SqliteRow) -> Result<SyncOperation, SyncError> {
    let id: String = row.try_get("id")?;
    let kind: String = row.try_get("kind")?;
    let entity_kind: String = row.try_get("entity_kind")?;
    let status: String = row.try_get("status")?;
    let payload: Option<String> = row.try_get("payload")?;

    let payload = match payload {
        Some(json) => Some(serde_json::from_str(&json)?),
        None => None,
    };

    Ok(SyncOperation {
        id: Uuid::parse_str(&id).map_err(|_| sqlx::Error::ColumnDecode {
            index: "id".into(),
            source: format!("invalid uuid: {id}").into(),
        })?,
        kind: OperationKind::from_str(&kind).ok_or_else(|| sqlx::Error::ColumnDecode {
            index: "kind".into(),
            source: format!("unknown operation kind: {kind}").into(),
        })?,
        entity_kind: EntityKind::from_resource(&entity_kind).ok_or_else(|| {
            sqlx::Error::ColumnDecode {
                index: "entity_kind".into(),
                source: format!("unknown entity kind: {entity_kind}").into(),
            }
        })?,
        entity_id: row.try_get("entity_id")?,
        client_timestamp: row.try_get("client_timestamp")?,
        base_version: row.try_get("base_version")?,
        retries: row.try_get::<i64, _>("retries")? as u32,
        resolution_attempts: row.try_get::<i64, _>("resolution_attempts")? as u32,
        status: OperationStatus::from_str(&status).ok_or_else(|| sqlx::Error::ColumnDecode {
            index: "status".into(),
            source: format!("unknown status: {status}").into(),
        })?,
        last_error: row.try_get("last_error")?,
        payload,
    })
}

const SELECT_COLUMNS: &str = "id, kind, entity_kind, entity_id, payload, client_timestamp, \
     base_version, retries, resolution_attempts, status, last_error";

impl LocalStore {
    /// Enqueue a mutation, coalescing against un-sent work for the entity.
    ///
    /// Returns the id of the row now representing the mutation, or `None`
    /// when the enqueue cancelled out against an unconfirmed CREATE and
    /// nothing remains to send. The row is committed before this returns.
    pub async fn enqueue(&self, new_op: NewOperation) -> Result<Option<Uuid>, SyncError> {
        let timestamp = self.next_timestamp();
        let payload_json = match &new_op.payload {
            Some(p) => Some(serde_json::to_string(p)?),
            None => None,
        };

        let mut tx = self.pool().begin().await?;

        match new_op.kind {
            OperationKind::Update => {
                // Fold into pending un-sent work for the same entity: a
                // pending UPDATE keeps its earliest base_version, a pending
                // CREATE stays a CREATE carrying the newest snapshot.
                let existing: Option<(String,)> = sqlx::query_as(
                    "SELECT id FROM sync_operations
                     WHERE entity_kind = ? AND entity_id = ?
                       AND status = 'PENDING' AND kind IN ('CREATE', 'UPDATE')
                     ORDER BY client_timestamp ASC LIMIT 1",
                )
                .bind(new_op.entity_kind.resource())
                .bind(&new_op.entity_id)
                .fetch_optional(&mut *tx)
                .await?;

                if let Some((existing_id,)) = existing {
                    let id = Uuid::parse_str(&existing_id).map_err(|_| sqlx::Error::ColumnDecode {
                        index: "id".into(),
                        source: format!("invalid uuid: {existing_id}").into(),
                    })?;
                    sqlx::query("UPDATE sync_operations SET payload = ? WHERE id = ?")
                        .bind(&payload_json)
                        .bind(&existing_id)
                        .execute(&mut *tx)
                        .await?;
                    tx.commit().await?;

                    tracing::debug!(%id, entity = %new_op.entity_kind, "coalesced update into pending operation");
                    return Ok(Some(id));
                }
            }
            OperationKind::Delete => {
                let had_create: Option<(i64,)> = sqlx::query_as(
                    "SELECT COUNT(*) FROM sync_operations
                     WHERE entity_kind = ? AND entity_id = ?
                       AND status = 'PENDING' AND kind = 'CREATE'",
                )
                .bind(new_op.entity_kind.resource())
                .bind(&new_op.entity_id)
                .fetch_optional(&mut *tx)
                .await?;

                // A DELETE supersedes everything still un-sent for the entity.
                sqlx::query(
                    "DELETE FROM sync_operations
                     WHERE entity_kind = ? AND entity_id = ? AND status = 'PENDING'",
                )
                .bind(new_op.entity_kind.resource())
                .bind(&new_op.entity_id)
                .execute(&mut *tx)
                .await?;

                if matches!(had_create, Some((n,)) if n > 0) {
                    // The entity never existed server-side; the whole chain
                    // cancels out instead of sending a DELETE for nothing.
                    tx.commit().await?;
                    tracing::debug!(entity = %new_op.entity_kind, id = %new_op.entity_id, "delete cancelled unconfirmed create");
                    return Ok(None);
                }
            }
            OperationKind::Create => {}
        }

        let id = Uuid::new_v4();
        sqlx::query(
            "INSERT INTO sync_operations
                 (id, kind, entity_kind, entity_id, payload, client_timestamp,
                  base_version, retries, resolution_attempts, status, last_error, created_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, 0, 0, 'PENDING', NULL, ?)",
        )
        .bind(id.to_string())
        .bind(new_op.kind.as_str())
        .bind(new_op.entity_kind.resource())
        .bind(&new_op.entity_id)
        .bind(&payload_json)
        .bind(timestamp)
        .bind(new_op.base_version)
        .bind(Utc::now().to_rfc3339())
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(Some(id))
    }

    /// All PENDING operations in enqueue order
    pub async fn list_pending(&self) -> Result<Vec<SyncOperation>, SyncError> {
        let rows = sqlx::query(&format!(
            "SELECT {SELECT_COLUMNS} FROM sync_operations
             WHERE status = 'PENDING'
             ORDER BY client_timestamp ASC, id ASC"
        ))
        .fetch_all(self.pool())
        .await?;

        rows.iter().map(row_to_operation).collect()
    }

    /// All operations regardless of status, in enqueue order
    pub async fn list_operations(&self) -> Result<Vec<SyncOperation>, SyncError> {
        let rows = sqlx::query(&format!(
            "SELECT {SELECT_COLUMNS} FROM sync_operations
             ORDER BY client_timestamp ASC, id ASC"
        ))
        .fetch_all(self.pool())
        .await?;

        rows.iter().map(row_to_operation).collect()
    }

    /// Fetch a single operation
    pub async fn get_operation(&self, id: Uuid) -> Result<Option<SyncOperation>, SyncError> {
        let row = sqlx::query(&format!(
            "SELECT {SELECT_COLUMNS} FROM sync_operations WHERE id = ?"
        ))
        .bind(id.to_string())
        .fetch_optional(self.pool())
        .await?;

        row.as_ref().map(row_to_operation).transpose()
    }

    /// The CONFLICTED operation parked for an entity, if any
    pub async fn get_conflicted_operation(
        &self,
        kind: EntityKind,
        entity_id: &str,
    ) -> Result<Option<SyncOperation>, SyncError> {
        let row = sqlx::query(&format!(
            "SELECT {SELECT_COLUMNS} FROM sync_operations
             WHERE entity_kind = ? AND entity_id = ? AND status = 'CONFLICTED'
             ORDER BY client_timestamp ASC LIMIT 1"
        ))
        .bind(kind.resource())
        .bind(entity_id)
        .fetch_optional(self.pool())
        .await?;

        row.as_ref().map(row_to_operation).transpose()
    }

    /// Transition PENDING -> IN_FLIGHT
    pub async fn mark_in_flight(&self, id: Uuid) -> Result<(), SyncError> {
        let result = sqlx::query(
            "UPDATE sync_operations SET status = 'IN_FLIGHT' WHERE id = ? AND status = 'PENDING'",
        )
        .bind(id.to_string())
        .execute(self.pool())
        .await?;

        if result.rows_affected() == 0 {
            return Err(SyncError::OperationNotFound(id));
        }
        Ok(())
    }

    /// Remove a confirmed operation from the log
    pub async fn mark_succeeded(&self, id: Uuid) -> Result<(), SyncError> {
        sqlx::query("DELETE FROM sync_operations WHERE id = ?")
            .bind(id.to_string())
            .execute(self.pool())
            .await?;
        Ok(())
    }

    /// Record a transient failure.
    ///
    /// Increments the retry count and returns the operation to PENDING, or
    /// to FAILED once the budget is spent. Returns the resulting status.
    pub async fn mark_failed(
        &self,
        id: Uuid,
        error: &str,
        max_retries: u32,
    ) -> Result<OperationStatus, SyncError> {
        let result = sqlx::query(
            "UPDATE sync_operations SET
                retries = retries + 1,
                last_error = ?,
                status = CASE WHEN retries + 1 >= ? THEN 'FAILED' ELSE 'PENDING' END
             WHERE id = ?",
        )
        .bind(error)
        .bind(max_retries as i64)
        .bind(id.to_string())
        .execute(self.pool())
        .await?;

        if result.rows_affected() == 0 {
            return Err(SyncError::OperationNotFound(id));
        }

        let op = self
            .get_operation(id)
            .await?
            .ok_or(SyncError::OperationNotFound(id))?;
        Ok(op.status)
    }

    /// Record a permanent rejection; the row is kept FAILED for visibility
    /// but never retried automatically. The retry count keeps the number
    /// of attempts actually made.
    pub async fn mark_rejected(&self, id: Uuid, reason: &str) -> Result<(), SyncError> {
        let result = sqlx::query(
            "UPDATE sync_operations SET status = 'FAILED', last_error = ? WHERE id = ?",
        )
        .bind(reason)
        .bind(id.to_string())
        .execute(self.pool())
        .await?;

        if result.rows_affected() == 0 {
            return Err(SyncError::OperationNotFound(id));
        }
        Ok(())
    }

    /// Park an operation behind an unresolved conflict record
    pub async fn mark_conflicted(&self, id: Uuid) -> Result<(), SyncError> {
        let result =
            sqlx::query("UPDATE sync_operations SET status = 'CONFLICTED' WHERE id = ?")
                .bind(id.to_string())
                .execute(self.pool())
                .await?;

        if result.rows_affected() == 0 {
            return Err(SyncError::OperationNotFound(id));
        }
        Ok(())
    }

    /// Rewrite an operation after an automatic conflict resolution and
    /// return it to the drain queue with a fresh base version
    pub async fn requeue_resolved(
        &self,
        id: Uuid,
        kind: OperationKind,
        payload: Option<&EntityPayload>,
        base_version: Option<i64>,
    ) -> Result<(), SyncError> {
        let payload_json = match payload {
            Some(p) => Some(serde_json::to_string(p)?),
            None => None,
        };

        let result = sqlx::query(
            "UPDATE sync_operations SET
                kind = ?,
                payload = ?,
                base_version = ?,
                status = 'PENDING',
                resolution_attempts = resolution_attempts + 1,
                last_error = NULL
             WHERE id = ?",
        )
        .bind(kind.as_str())
        .bind(&payload_json)
        .bind(base_version)
        .bind(id.to_string())
        .execute(self.pool())
        .await?;

        if result.rows_affected() == 0 {
            return Err(SyncError::OperationNotFound(id));
        }
        Ok(())
    }

    /// Rewrite a client-tentative entity id after the server assigned the
    /// real one, across every still-queued operation for that entity
    pub async fn remap_entity_id(
        &self,
        kind: EntityKind,
        old_id: &str,
        new_id: &str,
    ) -> Result<u64, SyncError> {
        let mut tx = self.pool().begin().await?;

        let ops = sqlx::query(
            "UPDATE sync_operations SET entity_id = ? WHERE entity_kind = ? AND entity_id = ?",
        )
        .bind(new_id)
        .bind(kind.resource())
        .bind(old_id)
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            "UPDATE OR REPLACE entity_versions SET entity_id = ?
             WHERE entity_kind = ? AND entity_id = ?",
        )
        .bind(new_id)
        .bind(kind.resource())
        .bind(old_id)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(ops.rows_affected())
    }

    /// Startup recovery: IN_FLIGHT -> PENDING
    pub async fn reset_in_flight(&self) -> Result<u64, SyncError> {
        let result = sqlx::query(
            "UPDATE sync_operations SET status = 'PENDING' WHERE status = 'IN_FLIGHT'",
        )
        .execute(self.pool())
        .await?;
        Ok(result.rows_affected())
    }

    /// Manual retry: return every FAILED operation to PENDING with a fresh
    /// retry budget
    pub async fn retry_failed(&self) -> Result<u64, SyncError> {
        let result = sqlx::query(
            "UPDATE sync_operations SET status = 'PENDING', retries = 0 WHERE status = 'FAILED'",
        )
        .execute(self.pool())
        .await?;
        Ok(result.rows_affected())
    }

    /// Remove terminally FAILED operations older than the cutoff
    pub async fn cleanup_failed(&self, max_age: chrono::Duration) -> Result<u64, SyncError> {
        let cutoff = Utc::now() - max_age;
        let result = sqlx::query(
            "DELETE FROM sync_operations WHERE status = 'FAILED' AND created_at < ?",
        )
        .bind(cutoff.to_rfc3339())
        .execute(self.pool())
        .await?;
        Ok(result.rows_affected())
    }

    /// Counts per status
    pub async fn queue_stats(&self) -> Result<QueueStats, SyncError> {
        let rows: Vec<(String, i64)> =
            sqlx::query_as("SELECT status, COUNT(*) FROM sync_operations GROUP BY status")
                .fetch_all(self.pool())
                .await?;

        let mut stats = QueueStats::default();
        for (status, count) in rows {
            match status.as_str() {
                "PENDING" => stats.pending = count as u64,
                "IN_FLIGHT" => stats.in_flight = count as u64,
                "FAILED" => stats.failed = count as u64,
                "CONFLICTED" => stats.conflicted = count as u64,
                _ => {}
            }
        }
        Ok(stats)
    }
}

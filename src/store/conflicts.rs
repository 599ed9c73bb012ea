//! # Conflict Records
//!
//! Persistence for version-mismatch conflicts the resolver could not (or
//! was configured not to) settle automatically. A record is created when
//! the server rejects an operation with a version conflict, mutated only
//! by resolution, and deleted once the resolution has been applied and
//! acknowledged by a follow-up successful sync. Records still awaiting a
//! MANUAL resolution are what the UI's conflict screen lists.

use crate::error::SyncError;
use crate::store::LocalStore;
use crate::types::{EntityKind, EntityPayload};
use chrono::{DateTime, Utc};
use sqlx::sqlite::SqliteRow;
use sqlx::Row;
use uuid::Uuid;

/// Which sides changed or deleted the entity
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConflictKind {
    /// Both sides updated the entity
    UpdateUpdate,
    /// Local deleted, server updated since
    DeleteUpdate,
    /// Local updated, server deleted since
    UpdateDelete,
}

impl ConflictKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConflictKind::UpdateUpdate => "UPDATE_UPDATE",
            ConflictKind::DeleteUpdate => "DELETE_UPDATE",
            ConflictKind::UpdateDelete => "UPDATE_DELETE",
        }
    }

    fn from_str(s: &str) -> Option<Self> {
        match s {
            "UPDATE_UPDATE" => Some(ConflictKind::UpdateUpdate),
            "DELETE_UPDATE" => Some(ConflictKind::DeleteUpdate),
            "UPDATE_DELETE" => Some(ConflictKind::UpdateDelete),
            _ => None,
        }
    }
}

/// How a conflict was (or should be) settled
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resolution {
    ClientWins,
    ServerWins,
    Merge,
    Manual,
}

impl Resolution {
    pub fn as_str(&self) -> &'static str {
        match self {
            Resolution::ClientWins => "CLIENT_WINS",
            Resolution::ServerWins => "SERVER_WINS",
            Resolution::Merge => "MERGE",
            Resolution::Manual => "MANUAL",
        }
    }

    fn from_str(s: &str) -> Option<Self> {
        match s {
            "CLIENT_WINS" => Some(Resolution::ClientWins),
            "SERVER_WINS" => Some(Resolution::ServerWins),
            "MERGE" => Some(Resolution::Merge),
            "MANUAL" => Some(Resolution::Manual),
            _ => None,
        }
    }
}

/// A persisted version-mismatch conflict
#[derive(Debug, Clone)]
pub struct SyncConflict {
    pub id: Uuid,
    pub entity_kind: EntityKind,
    pub entity_id: String,
    /// The base version the rejected operation carried; absent for CREATE
    pub local_version: Option<i64>,
    /// The entity's current version on the server
    pub server_version: i64,
    /// The client's intended result
    pub local_data: Option<EntityPayload>,
    /// The server's current state; `None` when the server deleted the entity
    pub server_data: Option<serde_json::Value>,
    pub kind: ConflictKind,
    /// `None` until resolved
    pub resolution: Option<Resolution>,
    pub resolved_data: Option<serde_json::Value>,
    pub created_at: DateTime<Utc>,
}

impl SyncConflict {
    /// Whether the conflict still awaits a resolution
    pub fn is_pending(&self) -> bool {
        self.resolution.is_none()
    }
}

fn row_to_conflict(row: &SqliteRow) -> Result<SyncConflict, SyncError> {
    let id: String = row.try_get("id")?;
    let entity_kind: String = row.try_get("entity_kind")?;
    let conflict_type: String = row.try_get("conflict_type")?;
    let resolution: Option<String> = row.try_get("resolution")?;
    let local_data: Option<String> = row.try_get("local_data")?;
    let server_data: Option<String> = row.try_get("server_data")?;
    let resolved_data: Option<String> = row.try_get("resolved_data")?;
    let created_at: String = row.try_get("created_at")?;

    Ok(SyncConflict {
        id: Uuid::parse_str(&id).map_err(|_| sqlx::Error::ColumnDecode {
            index: "id".into(),
            source: format!("invalid uuid: {id}").into(),
        })?,
        entity_kind: EntityKind::from_resource(&entity_kind).ok_or_else(|| {
            sqlx::Error::ColumnDecode {
                index: "entity_kind".into(),
                source: format!("unknown entity kind: {entity_kind}").into(),
            }
        })?,
        entity_id: row.try_get("entity_id")?,
        local_version: row.try_get("local_version")?,
        server_version: row.try_get("server_version")?,
        local_data: local_data.map(|json| serde_json::from_str(&json)).transpose()?,
        server_data: server_data.map(|json| serde_json::from_str(&json)).transpose()?,
        kind: ConflictKind::from_str(&conflict_type).ok_or_else(|| sqlx::Error::ColumnDecode {
            index: "conflict_type".into(),
            source: format!("unknown conflict type: {conflict_type}").into(),
        })?,
        resolution: resolution.as_deref().and_then(Resolution::from_str),
        resolved_data: resolved_data.map(|json| serde_json::from_str(&json)).transpose()?,
        created_at: DateTime::parse_from_rfc3339(&created_at)
            .map(|dt| dt.with_timezone(&Utc))
            .unwrap_or_else(|_| Utc::now()),
    })
}

const SELECT_COLUMNS: &str = "id, entity_kind, entity_id, local_version, server_version, \
     local_data, server_data, conflict_type, resolution, resolved_data, created_at";

impl LocalStore {
    /// Persist a new conflict record and return its id
    pub async fn insert_conflict(
        &self,
        kind: EntityKind,
        entity_id: &str,
        conflict_kind: ConflictKind,
        local_version: Option<i64>,
        server_version: i64,
        local_data: Option<&EntityPayload>,
        server_data: Option<&serde_json::Value>,
    ) -> Result<Uuid, SyncError> {
        let id = Uuid::new_v4();
        let local_json = local_data.map(serde_json::to_string).transpose()?;
        let server_json = server_data.map(serde_json::to_string).transpose()?;

        sqlx::query(
            "INSERT INTO sync_conflicts
                 (id, entity_kind, entity_id, local_version, server_version,
                  local_data, server_data, conflict_type, resolution, resolved_data, created_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, NULL, NULL, ?)",
        )
        .bind(id.to_string())
        .bind(kind.resource())
        .bind(entity_id)
        .bind(local_version)
        .bind(server_version)
        .bind(&local_json)
        .bind(&server_json)
        .bind(conflict_kind.as_str())
        .bind(Utc::now().to_rfc3339())
        .execute(self.pool())
        .await?;

        Ok(id)
    }

    /// Fetch one conflict record
    pub async fn get_conflict(&self, id: Uuid) -> Result<Option<SyncConflict>, SyncError> {
        let row = sqlx::query(&format!(
            "SELECT {SELECT_COLUMNS} FROM sync_conflicts WHERE id = ?"
        ))
        .bind(id.to_string())
        .fetch_optional(self.pool())
        .await?;

        row.as_ref().map(row_to_conflict).transpose()
    }

    /// All conflicts still awaiting resolution, oldest first
    pub async fn list_pending_conflicts(&self) -> Result<Vec<SyncConflict>, SyncError> {
        let rows = sqlx::query(&format!(
            "SELECT {SELECT_COLUMNS} FROM sync_conflicts
             WHERE resolution IS NULL
             ORDER BY created_at ASC"
        ))
        .fetch_all(self.pool())
        .await?;

        rows.iter().map(row_to_conflict).collect()
    }

    /// Number of conflicts still awaiting resolution
    pub async fn count_pending_conflicts(&self) -> Result<u64, SyncError> {
        let (count,): (i64,) =
            sqlx::query_as("SELECT COUNT(*) FROM sync_conflicts WHERE resolution IS NULL")
                .fetch_one(self.pool())
                .await?;
        Ok(count as u64)
    }

    /// Record the resolution chosen for a conflict
    pub async fn record_resolution(
        &self,
        id: Uuid,
        resolution: Resolution,
        resolved_data: Option<&serde_json::Value>,
    ) -> Result<(), SyncError> {
        let resolved_json = resolved_data.map(serde_json::to_string).transpose()?;

        let result = sqlx::query(
            "UPDATE sync_conflicts SET resolution = ?, resolved_data = ?
             WHERE id = ? AND resolution IS NULL",
        )
        .bind(resolution.as_str())
        .bind(&resolved_json)
        .bind(id.to_string())
        .execute(self.pool())
        .await?;

        if result.rows_affected() == 0 {
            // Either unknown or already resolved; disambiguate for the caller.
            return match self.get_conflict(id).await? {
                Some(_) => Err(SyncError::ConflictAlreadyResolved(id)),
                None => Err(SyncError::ConflictNotFound(id)),
            };
        }
        Ok(())
    }

    /// Delete one conflict record
    pub async fn delete_conflict(&self, id: Uuid) -> Result<(), SyncError> {
        sqlx::query("DELETE FROM sync_conflicts WHERE id = ?")
            .bind(id.to_string())
            .execute(self.pool())
            .await?;
        Ok(())
    }

    /// Drop resolved records for an entity once a follow-up sync for it
    /// succeeded; pending MANUAL records are retained
    pub async fn delete_resolved_conflicts(
        &self,
        kind: EntityKind,
        entity_id: &str,
    ) -> Result<u64, SyncError> {
        let result = sqlx::query(
            "DELETE FROM sync_conflicts
             WHERE entity_kind = ? AND entity_id = ? AND resolution IS NOT NULL",
        )
        .bind(kind.resource())
        .bind(entity_id)
        .execute(self.pool())
        .await?;
        Ok(result.rows_affected())
    }
}

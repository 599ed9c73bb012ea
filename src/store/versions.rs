//! # Revision Tracker
//!
//! Last server-confirmed `sync_version` per syncable entity, the token the
//! backend checks for optimistic concurrency. Rows are written only from
//! confirmed server responses (an accepted write or a fresh fetch), never
//! from locally optimistic state, and are read to stamp `base_version` on
//! newly enqueued operations.

use crate::error::SyncError;
use crate::store::LocalStore;
use crate::types::EntityKind;
use chrono::Utc;

impl LocalStore {
    /// Last known server version for an entity, if any
    pub async fn get_version(
        &self,
        kind: EntityKind,
        entity_id: &str,
    ) -> Result<Option<i64>, SyncError> {
        let row: Option<(i64,)> = sqlx::query_as(
            "SELECT sync_version FROM entity_versions WHERE entity_kind = ? AND entity_id = ?",
        )
        .bind(kind.resource())
        .bind(entity_id)
        .fetch_optional(self.pool())
        .await?;

        Ok(row.map(|(version,)| version))
    }

    /// Record a server-confirmed version for an entity
    pub async fn set_version(
        &self,
        kind: EntityKind,
        entity_id: &str,
        version: i64,
    ) -> Result<(), SyncError> {
        sqlx::query(
            "INSERT OR REPLACE INTO entity_versions (entity_kind, entity_id, sync_version, updated_at)
             VALUES (?, ?, ?, ?)",
        )
        .bind(kind.resource())
        .bind(entity_id)
        .bind(version)
        .bind(Utc::now().to_rfc3339())
        .execute(self.pool())
        .await?;
        Ok(())
    }

    /// Drop the version row for an entity confirmed deleted server-side
    pub async fn clear_version(&self, kind: EntityKind, entity_id: &str) -> Result<(), SyncError> {
        sqlx::query("DELETE FROM entity_versions WHERE entity_kind = ? AND entity_id = ?")
            .bind(kind.resource())
            .bind(entity_id)
            .execute(self.pool())
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_version_round_trip() {
        let store = LocalStore::open_in_memory().await.unwrap();

        assert_eq!(
            store.get_version(EntityKind::PantryItem, "p-1").await.unwrap(),
            None
        );

        store.set_version(EntityKind::PantryItem, "p-1", 5).await.unwrap();
        assert_eq!(
            store.get_version(EntityKind::PantryItem, "p-1").await.unwrap(),
            Some(5)
        );

        // Same id under another kind is a distinct row.
        assert_eq!(
            store.get_version(EntityKind::GroceryList, "p-1").await.unwrap(),
            None
        );
    }

    #[tokio::test]
    async fn test_set_version_overwrites() {
        let store = LocalStore::open_in_memory().await.unwrap();
        store.set_version(EntityKind::PantryItem, "p-1", 5).await.unwrap();
        store.set_version(EntityKind::PantryItem, "p-1", 6).await.unwrap();
        assert_eq!(
            store.get_version(EntityKind::PantryItem, "p-1").await.unwrap(),
            Some(6)
        );
    }

    #[tokio::test]
    async fn test_clear_version() {
        let store = LocalStore::open_in_memory().await.unwrap();
        store.set_version(EntityKind::PantryItem, "p-1", 5).await.unwrap();
        store.clear_version(EntityKind::PantryItem, "p-1").await.unwrap();
        assert_eq!(
            store.get_version(EntityKind::PantryItem, "p-1").await.unwrap(),
            None
        );
    }
}

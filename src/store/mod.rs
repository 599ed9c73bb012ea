//! # Local Durable Store
//!
//! SQLite-backed storage for everything the sync engine must not lose:
//! the operation log, the per-entity server version map, unresolved
//! conflicts and a small metadata table. The store is the single durable
//! source of truth; in-memory state (including an abandoned in-flight
//! network call) can always be rebuilt from it.
//!
//! ## Key Components
//!
//! - `LocalStore`: connection pool, schema management, metadata
//! - `queue.rs`: operation log with coalescing enqueue
//! - `versions.rs`: revision tracker for optimistic concurrency
//! - `conflicts.rs`: persisted conflict records
//!
//! ## Usage
//!
//! ```rust,no_run
//! use shelfie_sync::store::LocalStore;
//!
//! # async fn example() -> Result<(), shelfie_sync::SyncError> {
//! let store = LocalStore::open_default().await?;
//! let pending = store.list_pending().await?;
//! # Ok(())
//! # }
//! ```

pub mod conflicts;
pub mod queue;
pub mod versions;

pub use conflicts::{ConflictKind, Resolution, SyncConflict};
pub use queue::{NewOperation, OperationKind, OperationStatus, QueueStats, SyncOperation};

use crate::error::SyncError;
use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::SqlitePool;
use std::path::Path;
use std::sync::Mutex;

/// Metadata key holding the last fully successful drain pass timestamp
const META_LAST_SYNC_AT: &str = "last_sync_at";

/// Durable local store for the sync engine
#[derive(Debug)]
pub struct LocalStore {
    pool: SqlitePool,
    /// Monotonic clock for `client_timestamp` stamps; never goes backwards
    /// even when the wall clock does or two enqueues land in the same
    /// millisecond.
    clock: Mutex<i64>,
}

impl LocalStore {
    /// Open or create the store at the platform data directory
    pub async fn open_default() -> Result<Self, SyncError> {
        let mut path = dirs::data_dir().unwrap_or_else(std::env::temp_dir);
        path.push("shelfie");
        path.push("sync.db");
        Self::open(&path).await
    }

    /// Open or create the store at an explicit path
    pub async fn open(path: &Path) -> Result<Self, SyncError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(sqlx::Error::Io)?;
        }

        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true);
        let pool = SqlitePoolOptions::new().connect_with(options).await?;

        Self::from_pool(pool).await
    }

    /// Open an in-memory store, used by tests
    pub async fn open_in_memory() -> Result<Self, SyncError> {
        let options = SqliteConnectOptions::new().in_memory(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await?;
        Self::from_pool(pool).await
    }

    async fn from_pool(pool: SqlitePool) -> Result<Self, SyncError> {
        sqlx::query("PRAGMA journal_mode=WAL").execute(&pool).await?;
        sqlx::query("PRAGMA synchronous=NORMAL").execute(&pool).await?;
        sqlx::query("PRAGMA foreign_keys=ON").execute(&pool).await?;
        sqlx::query("PRAGMA temp_store=MEMORY").execute(&pool).await?;

        let store = Self {
            pool,
            clock: Mutex::new(0),
        };

        store.init_schema().await?;
        store.recover().await?;

        Ok(store)
    }

    /// Create tables and apply pending migrations
    async fn init_schema(&self) -> Result<(), SyncError> {
        sqlx::raw_sql(include_str!("schema.sql"))
            .execute(&self.pool)
            .await?;

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS schema_migrations (
                version INTEGER PRIMARY KEY,
                applied_at TEXT NOT NULL
            )",
        )
        .execute(&self.pool)
        .await?;

        let (current,): (i32,) =
            sqlx::query_as("SELECT COALESCE(MAX(version), 0) FROM schema_migrations")
                .fetch_one(&self.pool)
                .await?;

        if current < 1 {
            sqlx::query("INSERT INTO schema_migrations (version, applied_at) VALUES (1, ?)")
                .bind(Utc::now().to_rfc3339())
                .execute(&self.pool)
                .await?;
        }

        Ok(())
    }

    /// Startup recovery.
    ///
    /// Any operation left IN_FLIGHT by a previous process is returned to
    /// PENDING: the log is the durable source of truth, not the abandoned
    /// network call. Also seeds the monotonic clock past every stored
    /// timestamp.
    async fn recover(&self) -> Result<(), SyncError> {
        let reset = self.reset_in_flight().await?;
        if reset > 0 {
            tracing::info!(count = reset, "recovered in-flight operations to pending");
        }

        let (max_ts,): (i64,) =
            sqlx::query_as("SELECT COALESCE(MAX(client_timestamp), 0) FROM sync_operations")
                .fetch_one(&self.pool)
                .await?;

        let mut clock = self.clock.lock().expect("clock lock poisoned");
        *clock = max_ts.max(Utc::now().timestamp_millis());

        Ok(())
    }

    /// Next monotonic `client_timestamp` in milliseconds
    pub(crate) fn next_timestamp(&self) -> i64 {
        let now = Utc::now().timestamp_millis();
        let mut clock = self.clock.lock().expect("clock lock poisoned");
        *clock = (*clock + 1).max(now);
        *clock
    }

    /// Connection pool reference
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Set a metadata value
    pub async fn set_metadata(&self, key: &str, value: &str) -> Result<(), SyncError> {
        sqlx::query(
            "INSERT OR REPLACE INTO sync_metadata (key, value, updated_at)
             VALUES (?, ?, ?)",
        )
        .bind(key)
        .bind(value)
        .bind(Utc::now().to_rfc3339())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Get a metadata value
    pub async fn get_metadata(&self, key: &str) -> Result<Option<String>, SyncError> {
        let row: Option<(String,)> =
            sqlx::query_as("SELECT value FROM sync_metadata WHERE key = ?")
                .bind(key)
                .fetch_optional(&self.pool)
                .await?;
        Ok(row.map(|(value,)| value))
    }

    /// Timestamp of the last fully successful drain pass
    pub async fn last_sync_at(&self) -> Result<Option<DateTime<Utc>>, SyncError> {
        let value = self.get_metadata(META_LAST_SYNC_AT).await?;
        Ok(value
            .and_then(|v| DateTime::parse_from_rfc3339(&v).ok())
            .map(|dt| dt.with_timezone(&Utc)))
    }

    /// Record the last fully successful drain pass
    pub async fn set_last_sync_at(&self, at: DateTime<Utc>) -> Result<(), SyncError> {
        self.set_metadata(META_LAST_SYNC_AT, &at.to_rfc3339()).await
    }
}

//! Shelfie Sync - Offline-First Synchronization Engine
//!
//! Shelfie Sync keeps a household pantry client usable with or without a
//! network. Every local mutation is appended to a durable operation log
//! before it is acknowledged; a background scheduler replays the log
//! against the backend whenever connectivity allows, detects version
//! conflicts through optimistic concurrency, and resolves them by policy
//! or escalates them to the user.
//!
//! # Module Structure
//!
//! - **`store`** - SQLite persistence: the operation log with write
//!   coalescing, the per-entity version tracker and the conflict records
//! - **`engine`** - the runtime: HTTP sync client, conflict resolver,
//!   drain-pass scheduler, status publisher and the [`SyncEngine`] façade
//! - **`types`** - typed payloads for the syncable entity kinds
//! - **`config`** - validating builder for engine configuration
//! - **`error`** - the crate-wide [`SyncError`] type
//!
//! # Usage
//!
//! ```rust,no_run
//! use shelfie_sync::{LocalStore, StaticTokenProvider, SyncConfig, SyncEngine};
//! use std::sync::Arc;
//!
//! # async fn example() -> Result<(), shelfie_sync::SyncError> {
//! let store = Arc::new(LocalStore::open_default().await?);
//! let config = SyncConfig::builder()
//!     .server_url("https://api.example.com")
//!     .build()?;
//! let tokens = Arc::new(StaticTokenProvider::new("bearer-token"));
//!
//! let engine = SyncEngine::new(config, store, tokens).await?;
//! engine.set_online(true);
//! # Ok(())
//! # }
//! ```
//!
//! # Guarantees
//!
//! - Enqueued operations survive restarts; replay is idempotent through
//!   per-operation idempotency keys
//! - Operations for one entity reach the server in enqueue order
//! - A conflict is auto-resolved at most once; a second conflict on the
//!   same operation always escalates to manual resolution
//! - Delete-edit races are never auto-resolved

pub mod config;
pub mod engine;
pub mod error;
pub mod store;
pub mod types;

pub use config::{ConfigError, ResolutionPolicy, SyncConfig, SyncConfigBuilder};
pub use engine::{
    HttpSyncClient, PassSummary, StaticTokenProvider, SyncEngine, SyncResult, SyncStatus,
    TokenProvider,
};
pub use error::SyncError;
pub use store::{
    ConflictKind, LocalStore, NewOperation, OperationKind, OperationStatus, QueueStats, Resolution,
    SyncConflict, SyncOperation,
};
pub use types::{
    EntityKind, EntityPayload, GroceryItemData, GroceryListData, PantryItemData, StorageLocation,
};

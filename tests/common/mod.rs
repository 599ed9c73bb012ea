//! Shared helpers for the integration suite: in-memory engines wired to
//! a mock backend, payload constructors and canned responses.

#![allow(dead_code)]

use shelfie_sync::{
    EntityKind, EntityPayload, GroceryItemData, GroceryListData, LocalStore, ResolutionPolicy,
    StaticTokenProvider, SyncConfig, SyncEngine,
};
use std::sync::Arc;
use std::time::Duration;
use wiremock::{MockServer, ResponseTemplate};

/// Config pointed at the mock backend, tuned for fast tests
pub fn test_config(server: &MockServer) -> SyncConfig {
    SyncConfig::builder()
        .server_url(server.uri())
        .auto_sync(false)
        .max_retries(2)
        .backoff(Duration::from_millis(1), Duration::from_millis(10))
        .build()
        .unwrap()
}

/// Engine over an in-memory store with the background scheduler already
/// stopped, so every drain pass is driven explicitly by the test
pub async fn manual_engine(config: SyncConfig) -> SyncEngine {
    let store = Arc::new(LocalStore::open_in_memory().await.unwrap());
    let engine = SyncEngine::new(config, store, Arc::new(StaticTokenProvider::new("test-token")))
        .await
        .unwrap();
    engine.shutdown().await;
    engine.set_online(true);
    engine
}

pub async fn manual_engine_for(server: &MockServer) -> SyncEngine {
    manual_engine(test_config(server)).await
}

/// Engine with its background scheduler task left running, for tests
/// that drive passes through connectivity, the timer or the trigger
/// channel instead of calling `sync_once` directly. Starts offline.
pub async fn live_engine(config: SyncConfig) -> SyncEngine {
    let store = Arc::new(LocalStore::open_in_memory().await.unwrap());
    SyncEngine::new(config, store, Arc::new(StaticTokenProvider::new("test-token")))
        .await
        .unwrap()
}

pub async fn manual_engine_with_policy(
    server: &MockServer,
    kind: EntityKind,
    policy: ResolutionPolicy,
) -> SyncEngine {
    let config = SyncConfig::builder()
        .server_url(server.uri())
        .auto_sync(false)
        .max_retries(2)
        .backoff(Duration::from_millis(1), Duration::from_millis(10))
        .policy(kind, policy)
        .build()
        .unwrap();
    manual_engine(config).await
}

pub fn grocery_list(name: &str) -> EntityPayload {
    EntityPayload::GroceryList(GroceryListData {
        name: name.to_string(),
        is_active: true,
        notes: None,
    })
}

pub fn grocery_item(name: &str, quantity: f64) -> EntityPayload {
    EntityPayload::GroceryItem(GroceryItemData {
        list_id: "list-1".to_string(),
        name: name.to_string(),
        quantity,
        unit: "pcs".to_string(),
        is_checked: false,
        notes: None,
    })
}

/// 200 response confirming a write
pub fn accepted(id: &str, sync_version: i64) -> ResponseTemplate {
    ResponseTemplate::new(200).set_body_json(serde_json::json!({
        "id": id,
        "syncVersion": sync_version,
    }))
}

/// 409 response carrying the server's current state
pub fn conflict(server_version: i64, server_data: serde_json::Value) -> ResponseTemplate {
    ResponseTemplate::new(409).set_body_json(serde_json::json!({
        "serverVersion": server_version,
        "serverData": server_data,
    }))
}

/// 409 response for an entity the server has deleted
pub fn conflict_deleted(server_version: i64) -> ResponseTemplate {
    ResponseTemplate::new(409).set_body_json(serde_json::json!({
        "serverVersion": server_version,
        "serverData": null,
    }))
}

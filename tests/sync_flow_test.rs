//! End-to-end drain-pass behavior against a mock backend: replay,
//! coalescing, conflict handling and retry bookkeeping.

mod common;

use common::*;
use pretty_assertions::assert_eq;
use shelfie_sync::{ConflictKind, EntityKind, OperationStatus, Resolution, ResolutionPolicy};
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

#[tokio::test]
async fn test_create_drains_and_records_version() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/api/grocery-lists"))
        .respond_with(accepted("srv-1", 1))
        .mount(&server)
        .await;

    let engine = manual_engine_for(&server).await;
    engine.enqueue_create("tmp-1", grocery_list("Weekly")).await.unwrap();

    let summary = engine.sync_once().await;

    assert_eq!(summary.succeeded, 1);
    assert_eq!(engine.status().pending_count, 0);
    assert!(engine.status().last_sync_at.is_some());
    // The tentative id was remapped to the server-assigned one.
    let version = engine
        .store()
        .get_version(EntityKind::GroceryList, "srv-1")
        .await
        .unwrap();
    assert_eq!(version, Some(1));
}

#[tokio::test]
async fn test_rapid_updates_coalesce_into_one_request() {
    let server = MockServer::start().await;
    Mock::given(method("PUT"))
        .and(path("/api/grocery-lists/list-1"))
        .respond_with(accepted("list-1", 4))
        .mount(&server)
        .await;

    let engine = manual_engine_for(&server).await;
    engine
        .store()
        .set_version(EntityKind::GroceryList, "list-1", 3)
        .await
        .unwrap();

    engine.enqueue_update("list-1", grocery_list("Weekly")).await.unwrap();
    engine.enqueue_update("list-1", grocery_list("Weekend")).await.unwrap();
    engine.enqueue_update("list-1", grocery_list("Party")).await.unwrap();

    assert_eq!(engine.status().pending_count, 1);
    let summary = engine.sync_once().await;
    assert_eq!(summary.succeeded, 1);

    let requests = server.received_requests().await.unwrap();
    assert_eq!(requests.len(), 1);
    let body: serde_json::Value = serde_json::from_slice(&requests[0].body).unwrap();
    // Latest payload, original base version.
    assert_eq!(body["data"]["name"], "Party");
    assert_eq!(body["baseVersion"], 3);
}

#[tokio::test]
async fn test_entity_chain_replays_in_enqueue_order() {
    let server = MockServer::start().await;
    Mock::given(method("PUT"))
        .and(path("/api/grocery-lists/list-1"))
        .respond_with(accepted("list-1", 4))
        .mount(&server)
        .await;

    let engine = manual_engine_for(&server).await;
    let store = engine.store();
    store
        .set_version(EntityKind::GroceryList, "list-1", 3)
        .await
        .unwrap();

    // Build a two-operation chain for one entity: the first update goes
    // in flight (a crashed pass), the second lands as its own row, then
    // recovery returns both to pending.
    let first = engine.enqueue_update("list-1", grocery_list("Weekly")).await.unwrap().unwrap();
    store.mark_in_flight(first).await.unwrap();
    engine.enqueue_update("list-1", grocery_list("Weekend")).await.unwrap();
    store.reset_in_flight().await.unwrap();

    let summary = engine.sync_once().await;
    assert_eq!(summary.succeeded, 2);

    let requests = server.received_requests().await.unwrap();
    assert_eq!(requests.len(), 2);
    let names: Vec<serde_json::Value> = requests
        .iter()
        .map(|r| serde_json::from_slice::<serde_json::Value>(&r.body).unwrap()["data"]["name"].clone())
        .collect();
    assert_eq!(names, vec!["Weekly", "Weekend"]);
}

#[tokio::test]
async fn test_delete_after_confirmed_create_carries_base_version() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/api/grocery-lists"))
        .respond_with(accepted("srv-9", 3))
        .mount(&server)
        .await;
    Mock::given(method("DELETE"))
        .and(path("/api/grocery-lists/srv-9"))
        .respond_with(ResponseTemplate::new(204))
        .mount(&server)
        .await;

    let engine = manual_engine_for(&server).await;
    let store = engine.store();

    // The DELETE lands while the CREATE is on the wire, so no confirmed
    // version exists to stamp it with at enqueue time.
    let create = engine.enqueue_create("tmp-1", grocery_list("Short lived")).await.unwrap().unwrap();
    store.mark_in_flight(create).await.unwrap();
    let delete = engine
        .enqueue_delete(EntityKind::GroceryList, "tmp-1")
        .await
        .unwrap()
        .unwrap();
    assert!(store.get_operation(delete).await.unwrap().unwrap().base_version.is_none());
    store.reset_in_flight().await.unwrap();

    let summary = engine.sync_once().await;
    assert_eq!(summary.succeeded, 2);

    // The DELETE picked up the version the CREATE just confirmed instead
    // of going out unchecked.
    let requests = server.received_requests().await.unwrap();
    let delete_req = requests.iter().find(|r| r.method.as_str() == "DELETE").unwrap();
    assert_eq!(delete_req.url.query(), Some("baseVersion=3"));
    assert!(
        store.get_version(EntityKind::GroceryList, "srv-9").await.unwrap().is_none()
    );
}

#[tokio::test]
async fn test_many_entities_drain_in_one_pass() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/api/grocery-lists"))
        .respond_with(accepted("srv", 1))
        .mount(&server)
        .await;

    // More entities than the concurrency bound of 4.
    let engine = manual_engine_for(&server).await;
    for i in 0..10 {
        engine
            .enqueue_create(format!("tmp-{i}"), grocery_list(&format!("List {i}")))
            .await
            .unwrap();
    }

    let summary = engine.sync_once().await;
    assert_eq!(summary.succeeded, 10);
    assert_eq!(engine.status().pending_count, 0);
    assert_eq!(server.received_requests().await.unwrap().len(), 10);
}

#[tokio::test]
async fn test_conflict_server_wins_adopts_remote_state() {
    let server = MockServer::start().await;
    Mock::given(method("PUT"))
        .respond_with(conflict(
            9,
            serde_json::json!({ "name": "Weekend", "isActive": true }),
        ))
        .mount(&server)
        .await;

    let engine = manual_engine_for(&server).await;
    engine
        .store()
        .set_version(EntityKind::GroceryList, "list-1", 3)
        .await
        .unwrap();
    engine.enqueue_update("list-1", grocery_list("Weekly")).await.unwrap();

    let summary = engine.sync_once().await;

    assert_eq!(summary.auto_resolved, 1);
    assert_eq!(summary.overwrites, 1);
    assert_eq!(engine.status().pending_count, 0);
    assert_eq!(engine.status().conflict_count, 0);
    let version = engine
        .store()
        .get_version(EntityKind::GroceryList, "list-1")
        .await
        .unwrap();
    assert_eq!(version, Some(9));
}

#[tokio::test]
async fn test_delete_edit_race_always_escalates() {
    let server = MockServer::start().await;
    Mock::given(method("DELETE"))
        .respond_with(conflict(
            7,
            serde_json::json!({ "name": "Edited meanwhile", "isActive": true }),
        ))
        .mount(&server)
        .await;

    // ClientWins policy must not matter: delete-edit races are manual.
    let engine =
        manual_engine_with_policy(&server, EntityKind::GroceryList, ResolutionPolicy::ClientWins)
            .await;
    engine
        .store()
        .set_version(EntityKind::GroceryList, "list-1", 3)
        .await
        .unwrap();
    engine.enqueue_delete(EntityKind::GroceryList, "list-1").await.unwrap();

    let summary = engine.sync_once().await;

    assert_eq!(summary.escalated, 1);
    assert_eq!(engine.status().conflict_count, 1);
    let conflicts = engine.pending_conflicts().await.unwrap();
    assert_eq!(conflicts[0].kind, ConflictKind::DeleteUpdate);
    assert_eq!(conflicts[0].server_version, 7);
}

#[tokio::test]
async fn test_update_against_server_delete_escalates() {
    let server = MockServer::start().await;
    Mock::given(method("PUT"))
        .respond_with(conflict_deleted(5))
        .mount(&server)
        .await;

    let engine = manual_engine_for(&server).await;
    engine
        .store()
        .set_version(EntityKind::GroceryList, "list-1", 3)
        .await
        .unwrap();
    engine.enqueue_update("list-1", grocery_list("Weekly")).await.unwrap();

    let summary = engine.sync_once().await;

    assert_eq!(summary.escalated, 1);
    let conflicts = engine.pending_conflicts().await.unwrap();
    assert_eq!(conflicts[0].kind, ConflictKind::UpdateDelete);
    assert!(conflicts[0].server_data.is_none());
}

#[tokio::test]
async fn test_second_conflict_on_same_operation_escalates() {
    let server = MockServer::start().await;
    Mock::given(method("PUT"))
        .respond_with(conflict(
            9,
            serde_json::json!({ "name": "Server edit", "isActive": true }),
        ))
        .mount(&server)
        .await;

    let engine =
        manual_engine_with_policy(&server, EntityKind::GroceryList, ResolutionPolicy::ClientWins)
            .await;
    engine
        .store()
        .set_version(EntityKind::GroceryList, "list-1", 3)
        .await
        .unwrap();
    engine.enqueue_update("list-1", grocery_list("Weekly")).await.unwrap();

    // First conflict: client-wins re-enqueues against version 9.
    let first = engine.sync_once().await;
    assert_eq!(first.auto_resolved, 1);
    assert_eq!(engine.status().conflict_count, 0);

    // Second conflict on the same operation must not loop again.
    let second = engine.sync_once().await;
    assert_eq!(second.escalated, 1);
    assert_eq!(engine.status().conflict_count, 1);
}

#[tokio::test]
async fn test_merge_policy_combines_fields_and_replays() {
    let server = MockServer::start().await;
    Mock::given(method("PUT"))
        .respond_with(conflict(
            9,
            serde_json::json!({
                "listId": "list-1",
                "name": "Milk",
                "quantity": 5.0,
                "unit": "pcs",
                "isChecked": true,
                "notes": "2% fat",
                "updatedAt": "2026-01-01T00:00:00Z",
            }),
        ))
        .up_to_n_times(1)
        .mount(&server)
        .await;
    Mock::given(method("PUT"))
        .respond_with(accepted("item-1", 10))
        .mount(&server)
        .await;

    let engine =
        manual_engine_with_policy(&server, EntityKind::GroceryItem, ResolutionPolicy::Merge).await;
    engine
        .store()
        .set_version(EntityKind::GroceryItem, "item-1", 3)
        .await
        .unwrap();
    engine.enqueue_update("item-1", grocery_item("Milk", 2.0)).await.unwrap();

    let first = engine.sync_once().await;
    assert_eq!(first.auto_resolved, 1);

    let second = engine.sync_once().await;
    assert_eq!(second.succeeded, 1);

    let requests = server.received_requests().await.unwrap();
    let replay: serde_json::Value = serde_json::from_slice(&requests[1].body).unwrap();
    // Local fields are newer and win the overlap; the merge carries the
    // server-only note across.
    assert_eq!(replay["data"]["quantity"], 2.0);
    assert_eq!(replay["data"]["notes"], "2% fat");
    assert_eq!(replay["baseVersion"], 9);
}

#[tokio::test]
async fn test_transient_failure_keeps_operation_and_skips_last_sync() {
    let server = MockServer::start().await;
    Mock::given(method("PUT"))
        .respond_with(ResponseTemplate::new(503))
        .mount(&server)
        .await;

    let engine = manual_engine_for(&server).await;
    engine
        .store()
        .set_version(EntityKind::GroceryList, "list-1", 3)
        .await
        .unwrap();
    engine.enqueue_update("list-1", grocery_list("Weekly")).await.unwrap();

    let summary = engine.sync_once().await;

    assert_eq!(summary.transient, 1);
    assert_eq!(engine.status().pending_count, 1);
    assert!(engine.status().last_sync_at.is_none());
}

#[tokio::test]
async fn test_retry_budget_exhaustion_and_manual_retry() {
    let server = MockServer::start().await;
    Mock::given(method("PUT"))
        .respond_with(ResponseTemplate::new(503))
        .mount(&server)
        .await;

    // max_retries is 2 in the test config.
    let engine = manual_engine_for(&server).await;
    engine
        .store()
        .set_version(EntityKind::GroceryList, "list-1", 3)
        .await
        .unwrap();
    engine.enqueue_update("list-1", grocery_list("Weekly")).await.unwrap();

    engine.sync_once().await;
    engine.sync_once().await;

    let ops = engine.list_operations().await.unwrap();
    assert_eq!(ops[0].status, OperationStatus::Failed);
    // Failed work still counts as unsynced.
    assert_eq!(engine.status().pending_count, 1);

    assert_eq!(engine.retry_failed().await.unwrap(), 1);
    let ops = engine.list_operations().await.unwrap();
    assert_eq!(ops[0].status, OperationStatus::Pending);
    assert_eq!(ops[0].retries, 0);
}

#[tokio::test]
async fn test_idempotency_key_stable_across_retries() {
    let server = MockServer::start().await;
    Mock::given(method("PUT"))
        .respond_with(ResponseTemplate::new(503))
        .up_to_n_times(1)
        .mount(&server)
        .await;
    Mock::given(method("PUT"))
        .respond_with(accepted("list-1", 4))
        .mount(&server)
        .await;

    let engine = manual_engine_for(&server).await;
    engine
        .store()
        .set_version(EntityKind::GroceryList, "list-1", 3)
        .await
        .unwrap();
    engine.enqueue_update("list-1", grocery_list("Weekly")).await.unwrap();

    engine.sync_once().await;
    let summary = engine.sync_once().await;
    assert_eq!(summary.succeeded, 1);

    let requests = server.received_requests().await.unwrap();
    assert_eq!(requests.len(), 2);
    let keys: Vec<_> = requests
        .iter()
        .map(|r| r.headers.get("Idempotency-Key").unwrap().clone())
        .collect();
    assert_eq!(keys[0], keys[1]);
}

#[tokio::test]
async fn test_manual_resolution_replays_user_payload() {
    let server = MockServer::start().await;
    Mock::given(method("PUT"))
        .respond_with(conflict(
            9,
            serde_json::json!({ "name": "Server edit", "isActive": false }),
        ))
        .up_to_n_times(1)
        .mount(&server)
        .await;
    Mock::given(method("PUT"))
        .respond_with(accepted("list-1", 10))
        .mount(&server)
        .await;

    let engine =
        manual_engine_with_policy(&server, EntityKind::GroceryList, ResolutionPolicy::Manual).await;
    engine
        .store()
        .set_version(EntityKind::GroceryList, "list-1", 3)
        .await
        .unwrap();
    engine.enqueue_update("list-1", grocery_list("Weekly")).await.unwrap();

    let first = engine.sync_once().await;
    assert_eq!(first.escalated, 1);

    let conflict = engine.pending_conflicts().await.unwrap().remove(0);
    engine
        .resolve_conflict(
            conflict.id,
            Resolution::Manual,
            Some(grocery_list("Hand merged")),
        )
        .await
        .unwrap();

    let second = engine.sync_once().await;
    assert_eq!(second.succeeded, 1);
    // A confirmed replay retires the resolved conflict record.
    assert_eq!(engine.status().conflict_count, 0);
    assert_eq!(engine.status().pending_count, 0);

    let requests = server.received_requests().await.unwrap();
    let replay: serde_json::Value = serde_json::from_slice(&requests[1].body).unwrap();
    assert_eq!(replay["data"]["name"], "Hand merged");
    assert_eq!(replay["baseVersion"], 9);
}

#[tokio::test]
async fn test_offline_pass_is_a_no_op() {
    let server = MockServer::start().await;
    let engine = manual_engine_for(&server).await;
    engine.enqueue_create("tmp-1", grocery_list("Weekly")).await.unwrap();
    engine.set_online(false);

    let summary = engine.sync_once().await;

    assert!(summary.skipped);
    assert_eq!(engine.status().pending_count, 1);
    assert!(server.received_requests().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_rejected_operation_does_not_retry() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(422).set_body_string("name must not be empty"))
        .mount(&server)
        .await;

    let engine = manual_engine_for(&server).await;
    engine.enqueue_create("tmp-1", grocery_list("")).await.unwrap();

    let summary = engine.sync_once().await;
    assert_eq!(summary.rejected, 1);

    // A second pass must not resend it.
    engine.sync_once().await;
    assert_eq!(server.received_requests().await.unwrap().len(), 1);

    let ops = engine.list_operations().await.unwrap();
    assert_eq!(ops[0].status, OperationStatus::Failed);
    assert!(ops[0]
        .last_error
        .as_deref()
        .unwrap()
        .contains("name must not be empty"));
}

//! Property tests for the operation log's coalescing rules: however a
//! burst of edits to one entity is interleaved, the queue ends in the
//! minimal equivalent form.

mod common;

use common::grocery_list;
use proptest::prelude::*;
use shelfie_sync::{EntityKind, EntityPayload, LocalStore, NewOperation, OperationKind};

fn update(entity_id: &str, name: &str) -> NewOperation {
    NewOperation {
        kind: OperationKind::Update,
        entity_kind: EntityKind::GroceryList,
        entity_id: entity_id.into(),
        payload: Some(grocery_list(name)),
        base_version: Some(1),
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    /// Any burst of updates to one entity collapses to a single pending
    /// operation carrying the latest payload.
    #[test]
    fn test_update_burst_coalesces_to_latest(names in prop::collection::vec("[a-z]{1,12}", 1..20)) {
        let rt = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();
        rt.block_on(async {
            let store = LocalStore::open_in_memory().await.unwrap();
            for name in &names {
                store.enqueue(update("list-1", name)).await.unwrap();
            }

            let pending = store.list_pending().await.unwrap();
            prop_assert_eq!(pending.len(), 1);
            let last = names.last().unwrap();
            prop_assert_eq!(
                pending[0].payload.clone(),
                Some(grocery_list(last))
            );
            // Coalescing keeps the earliest base version.
            prop_assert_eq!(pending[0].base_version, Some(1));
            Ok(())
        })?;
    }

    /// A delete after any number of updates leaves exactly one pending
    /// DELETE; after an unconfirmed create it leaves nothing at all.
    #[test]
    fn test_delete_supersedes(names in prop::collection::vec("[a-z]{1,12}", 0..10), created in any::<bool>()) {
        let rt = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();
        rt.block_on(async {
            let store = LocalStore::open_in_memory().await.unwrap();
            if created {
                store
                    .enqueue(NewOperation {
                        kind: OperationKind::Create,
                        entity_kind: EntityKind::GroceryList,
                        entity_id: "list-1".into(),
                        payload: Some(grocery_list("fresh")),
                        base_version: None,
                    })
                    .await
                    .unwrap();
            }
            for name in &names {
                store.enqueue(update("list-1", name)).await.unwrap();
            }

            let delete_id = store
                .enqueue(NewOperation {
                    kind: OperationKind::Delete,
                    entity_kind: EntityKind::GroceryList,
                    entity_id: "list-1".into(),
                    payload: None,
                    base_version: Some(1),
                })
                .await
                .unwrap();

            let pending = store.list_pending().await.unwrap();
            if created {
                // Deleting a never-confirmed entity cancels everything.
                prop_assert_eq!(delete_id, None);
                prop_assert_eq!(pending.len(), 0);
            } else {
                prop_assert!(delete_id.is_some());
                prop_assert_eq!(pending.len(), 1);
                prop_assert_eq!(pending[0].kind, OperationKind::Delete);
                prop_assert!(pending[0].payload.is_none());
            }
            Ok(())
        })?;
    }

    /// Coalescing never crosses entity boundaries.
    #[test]
    fn test_distinct_entities_never_coalesce(count in 1usize..8) {
        let rt = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();
        rt.block_on(async {
            let store = LocalStore::open_in_memory().await.unwrap();
            for i in 0..count {
                store.enqueue(update(&format!("list-{i}"), "name")).await.unwrap();
            }
            let pending = store.list_pending().await.unwrap();
            prop_assert_eq!(pending.len(), count);
            Ok(())
        })?;
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    #[test]
    fn test_payload_survives_queue_storage(name in "[a-zA-Z0-9 ]{1,24}") {
        let rt = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();
        rt.block_on(async {
            let store = LocalStore::open_in_memory().await.unwrap();
            let payload: EntityPayload = grocery_list(&name);
            let id = store
                .enqueue(update("list-1", &name))
                .await
                .unwrap()
                .unwrap();
            let stored = store.get_operation(id).await.unwrap().unwrap();
            prop_assert_eq!(stored.payload, Some(payload));
            Ok(())
        })?;
    }
}

//! # Conflict Resolver
//!
//! Classifies version-mismatch responses and settles them under the
//! per-entity-kind policy, or escalates to a persisted conflict awaiting
//! manual resolution. Two rules hold regardless of configuration:
//!
//! - delete/edit races (`DELETE_UPDATE`, `UPDATE_DELETE`) always go to
//!   manual review, since either automatic choice risks silently losing a
//!   deletion or a meaningful edit
//! - at most one automatic resolution attempt is spent per conflict
//!   occurrence; a second conflict on the re-enqueued operation escalates
//!   straight to manual, so mutually-resolving replicas cannot loop

use crate::config::{ResolutionPolicy, SyncConfig};
use crate::error::SyncError;
use crate::store::{ConflictKind, OperationKind, SyncOperation};
use crate::types::EntityPayload;
use chrono::DateTime;

/// What the drain pass should do with a conflicted operation
#[derive(Debug, Clone)]
pub enum ResolutionAction {
    /// Discard the local operation and adopt the server state
    AdoptServer {
        /// The discarded local intent differed visibly from what was adopted
        visibly_different: bool,
    },
    /// Rewrite the operation and return it to the queue
    Requeue {
        kind: OperationKind,
        payload: Option<EntityPayload>,
        base_version: Option<i64>,
    },
    /// Persist a conflict record and park the operation
    Escalate,
}

/// Policy-driven conflict resolution
#[derive(Debug, Clone)]
pub struct ConflictResolver {
    config: SyncConfig,
}

impl ConflictResolver {
    pub fn new(config: SyncConfig) -> Self {
        Self { config }
    }

    /// Classify which sides changed or deleted the entity.
    ///
    /// A CREATE that conflicts (the entity already exists server-side) has
    /// diverging content on both sides, which is the update/update shape.
    pub fn classify(
        &self,
        op_kind: OperationKind,
        server_data: Option<&serde_json::Value>,
    ) -> ConflictKind {
        let server_deleted = matches!(server_data, None | Some(serde_json::Value::Null));
        match op_kind {
            OperationKind::Delete => ConflictKind::DeleteUpdate,
            OperationKind::Update | OperationKind::Create if server_deleted => {
                ConflictKind::UpdateDelete
            }
            OperationKind::Update | OperationKind::Create => ConflictKind::UpdateUpdate,
        }
    }

    /// Decide how to settle a conflict reported for `op`
    pub fn decide(
        &self,
        op: &SyncOperation,
        server_version: i64,
        server_data: Option<&serde_json::Value>,
    ) -> Result<(ConflictKind, ResolutionAction), SyncError> {
        let conflict_kind = self.classify(op.kind, server_data);

        // Delete/edit races never auto-resolve.
        if !matches!(conflict_kind, ConflictKind::UpdateUpdate) {
            return Ok((conflict_kind, ResolutionAction::Escalate));
        }

        // One automatic attempt per occurrence.
        if op.resolution_attempts >= 1 {
            tracing::warn!(
                op = %op.id,
                entity = %op.entity_kind,
                "re-conflict after automatic resolution, escalating to manual"
            );
            return Ok((conflict_kind, ResolutionAction::Escalate));
        }

        let action = match self.config.policy(op.entity_kind) {
            ResolutionPolicy::ServerWins => {
                let local_wire = match &op.payload {
                    Some(payload) => Some(payload.to_wire_value()?),
                    None => None,
                };
                let visibly_different = match (&local_wire, server_data) {
                    (Some(local), Some(server)) => !fields_match(local, server),
                    _ => true,
                };
                ResolutionAction::AdoptServer { visibly_different }
            }
            ResolutionPolicy::ClientWins => ResolutionAction::Requeue {
                kind: OperationKind::Update,
                payload: op.payload.clone(),
                base_version: Some(server_version),
            },
            ResolutionPolicy::Merge => {
                let local = op
                    .payload
                    .as_ref()
                    .ok_or_else(|| SyncError::payload_mismatch(op.entity_kind.resource()))?
                    .to_wire_value()?;
                let server = server_data.cloned().unwrap_or(serde_json::Value::Null);
                let local_newer = op.client_timestamp > server_modified_millis(&server);
                let merged = merge_fields(&local, &server, local_newer);
                let payload = EntityPayload::from_wire_value(op.entity_kind, merged)?;
                ResolutionAction::Requeue {
                    kind: OperationKind::Update,
                    payload: Some(payload),
                    base_version: Some(server_version),
                }
            }
            ResolutionPolicy::Manual => ResolutionAction::Escalate,
        };

        Ok((conflict_kind, action))
    }
}

/// Field-level merge of two entity objects.
///
/// Starts from the server state; fields the server does not carry are taken
/// from the local side, fields present on both sides with differing values
/// go to whichever side wrote more recently. A local `null` never overrides
/// a server value: the wire format cannot tell an untouched optional field
/// from a cleared one, so clearing loses to concurrent content.
pub fn merge_fields(
    local: &serde_json::Value,
    server: &serde_json::Value,
    local_newer: bool,
) -> serde_json::Value {
    let (Some(local_map), Some(server_map)) = (local.as_object(), server.as_object()) else {
        return if local_newer { local.clone() } else { server.clone() };
    };

    let mut merged = server_map.clone();
    for (key, local_value) in local_map {
        match server_map.get(key) {
            None => {
                merged.insert(key.clone(), local_value.clone());
            }
            Some(server_value)
                if server_value != local_value && local_newer && !local_value.is_null() =>
            {
                merged.insert(key.clone(), local_value.clone());
            }
            Some(_) => {}
        }
    }

    serde_json::Value::Object(merged)
}

/// Server's own last-modified stamp in milliseconds; absent or unparsable
/// stamps count as "newer than anything local" so the server wins ties
pub(crate) fn server_modified_millis(server_data: &serde_json::Value) -> i64 {
    server_data
        .get("updatedAt")
        .and_then(|v| v.as_str())
        .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
        .map(|dt| dt.timestamp_millis())
        .unwrap_or(i64::MAX)
}

/// Compare the fields the local payload carries against the server object,
/// ignoring server-managed bookkeeping the client never writes
fn fields_match(local: &serde_json::Value, server: &serde_json::Value) -> bool {
    let (Some(local_map), Some(server_map)) = (local.as_object(), server.as_object()) else {
        return local == server;
    };
    local_map
        .iter()
        .all(|(key, value)| server_map.get(key) == Some(value))
}

//! # Network Sync Client
//!
//! Translates a queued operation into a REST call against the backend and
//! interprets the response into a [`SyncResult`]. Every request carries the
//! operation id as an idempotency key so a retried send after a dropped
//! response cannot double-apply server-side, and the `base_version` so the
//! server can run its optimistic-concurrency check and answer with a
//! structured conflict instead of a blind overwrite.

use crate::config::SyncConfig;
use crate::error::SyncError;
use crate::store::{OperationKind, SyncOperation};
use futures_util::future::BoxFuture;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Header carrying the client-generated operation id
const IDEMPOTENCY_KEY_HEADER: &str = "Idempotency-Key";

/// Source of bearer tokens, provided by the (external) auth subsystem.
///
/// `refresh` is invoked once after a 401 before the request is retried;
/// returning `None` means the session cannot be restored and the
/// operation is rejected.
pub trait TokenProvider: Send + Sync {
    /// Current bearer token, if authenticated
    fn bearer_token(&self) -> Option<String>;

    /// Ask the auth collaborator for a fresh token
    fn refresh(&self) -> BoxFuture<'_, Option<String>>;
}

/// A fixed token that never refreshes; sufficient for tests and tools
#[derive(Debug, Clone)]
pub struct StaticTokenProvider {
    token: Option<String>,
}

impl StaticTokenProvider {
    pub fn new(token: impl Into<String>) -> Self {
        Self { token: Some(token.into()) }
    }

    /// A provider with no token at all
    pub fn unauthenticated() -> Self {
        Self { token: None }
    }
}

impl TokenProvider for StaticTokenProvider {
    fn bearer_token(&self) -> Option<String> {
        self.token.clone()
    }

    fn refresh(&self) -> BoxFuture<'_, Option<String>> {
        Box::pin(async { None })
    }
}

/// Outcome of sending one operation to the backend
#[derive(Debug, Clone)]
pub enum SyncResult {
    /// The server accepted the write and bumped the entity version
    Accepted {
        new_version: i64,
        /// For CREATE: the server-assigned id replacing the tentative one
        server_id: Option<String>,
    },
    /// Version mismatch; `server_data` is `None` when the entity was
    /// deleted server-side
    Conflict {
        server_version: i64,
        server_data: Option<serde_json::Value>,
    },
    /// Permanent rejection; not retried automatically
    Rejected { reason: String },
    /// Transient failure worth retrying after backoff
    Transient { error: String },
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct WriteBody<'a> {
    #[serde(skip_serializing_if = "Option::is_none")]
    client_id: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    base_version: Option<i64>,
    data: serde_json::Value,
    client_timestamp: i64,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct AcceptedBody {
    #[serde(default)]
    id: Option<String>,
    sync_version: i64,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ConflictBody {
    server_version: i64,
    #[serde(default)]
    server_data: Option<serde_json::Value>,
}

/// HTTP client for the sync REST surface
pub struct HttpSyncClient {
    http: reqwest::Client,
    config: SyncConfig,
    tokens: Arc<dyn TokenProvider>,
}

impl HttpSyncClient {
    pub fn new(config: SyncConfig, tokens: Arc<dyn TokenProvider>) -> Self {
        Self {
            http: reqwest::Client::new(),
            config,
            tokens,
        }
    }

    /// Whether a bearer token is currently available
    pub fn is_authenticated(&self) -> bool {
        self.tokens.bearer_token().is_some()
    }

    /// Send one operation and interpret the response.
    ///
    /// `Err` is reserved for local failures (payload serialization); every
    /// remote outcome, including transport errors, is a [`SyncResult`].
    pub async fn send(&self, op: &SyncOperation) -> Result<SyncResult, SyncError> {
        let Some(token) = self.tokens.bearer_token() else {
            return Ok(SyncResult::Rejected { reason: "not authenticated".into() });
        };

        match self.send_with_token(op, &token).await? {
            SyncResult::Rejected { reason } if reason == "unauthorized" => {
                // One refresh-and-retry; a second 401 is terminal.
                match self.tokens.refresh().await {
                    Some(fresh) => self.send_with_token(op, &fresh).await,
                    None => Ok(SyncResult::Rejected { reason: "unauthorized".into() }),
                }
            }
            result => Ok(result),
        }
    }

    async fn send_with_token(
        &self,
        op: &SyncOperation,
        token: &str,
    ) -> Result<SyncResult, SyncError> {
        let resource = op.entity_kind.resource();

        let request = match op.kind {
            OperationKind::Create => {
                let data = self.wire_payload(op)?;
                self.http
                    .post(self.config.api_url(&format!("/api/{resource}")))
                    .json(&WriteBody {
                        client_id: Some(&op.entity_id),
                        base_version: None,
                        data,
                        client_timestamp: op.client_timestamp,
                    })
            }
            OperationKind::Update => {
                let data = self.wire_payload(op)?;
                self.http
                    .put(self.config.api_url(&format!("/api/{resource}/{}", op.entity_id)))
                    .json(&WriteBody {
                        client_id: None,
                        base_version: op.base_version,
                        data,
                        client_timestamp: op.client_timestamp,
                    })
            }
            OperationKind::Delete => {
                let mut builder = self
                    .http
                    .delete(self.config.api_url(&format!("/api/{resource}/{}", op.entity_id)));
                if let Some(base) = op.base_version {
                    builder = builder.query(&[("baseVersion", base)]);
                }
                builder
            }
        };

        let response = request
            .header("Authorization", format!("Bearer {token}"))
            .header(IDEMPOTENCY_KEY_HEADER, op.id.to_string())
            .send()
            .await;

        let response = match response {
            Ok(response) => response,
            Err(err) => {
                // Timeouts, refused connections and the like are all
                // retryable from the queue's point of view.
                return Ok(SyncResult::Transient { error: err.to_string() });
            }
        };

        let status = response.status();
        match status {
            s if s.is_success() => {
                if op.kind == OperationKind::Delete {
                    return Ok(SyncResult::Accepted { new_version: 0, server_id: None });
                }
                match response.json::<AcceptedBody>().await {
                    Ok(body) => Ok(SyncResult::Accepted {
                        new_version: body.sync_version,
                        server_id: body.id,
                    }),
                    Err(err) => Ok(SyncResult::Transient {
                        error: format!("malformed success body: {err}"),
                    }),
                }
            }
            StatusCode::CONFLICT => match response.json::<ConflictBody>().await {
                Ok(body) => Ok(SyncResult::Conflict {
                    server_version: body.server_version,
                    server_data: body.server_data,
                }),
                Err(err) => Ok(SyncResult::Transient {
                    error: format!("malformed conflict body: {err}"),
                }),
            },
            StatusCode::UNAUTHORIZED => Ok(SyncResult::Rejected { reason: "unauthorized".into() }),
            s if s.is_client_error() => {
                let body = response.text().await.unwrap_or_default();
                Ok(SyncResult::Rejected {
                    reason: format!("{s}: {body}"),
                })
            }
            s => {
                let body = response.text().await.unwrap_or_default();
                Ok(SyncResult::Transient {
                    error: format!("{s}: {body}"),
                })
            }
        }
    }

    fn wire_payload(&self, op: &SyncOperation) -> Result<serde_json::Value, SyncError> {
        let payload = op
            .payload
            .as_ref()
            .ok_or_else(|| SyncError::payload_mismatch(op.entity_kind.resource()))?;
        Ok(payload.to_wire_value()?)
    }
}

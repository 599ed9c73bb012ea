//! Engine Configuration
//!
//! Configuration for the sync engine, built through a validating builder.
//! Covers the backend base URL, drain scheduling, retry/backoff tuning and
//! the per-entity-kind conflict resolution policies.

use crate::types::EntityKind;
use std::collections::HashMap;
use std::time::Duration;
use thiserror::Error;

/// Default backend URL when none is configured
const DEFAULT_SERVER_URL: &str = "http://127.0.0.1:3000";

/// Environment variable overriding the backend URL
const SERVER_URL_ENV: &str = "SHELFIE_API_URL";

/// Conflict resolution policy applied per entity kind
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResolutionPolicy {
    /// Discard the local operation and adopt the server state (default)
    ServerWins,
    /// Re-apply the local operation on top of the latest server version
    ClientWins,
    /// Field-level merge of local and server state, then re-apply
    Merge,
    /// Persist the conflict and wait for an explicit resolution
    Manual,
}

/// Sync engine configuration
#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// Backend base URL
    pub server_url: String,
    /// Enable the periodic drain timer
    pub auto_sync: bool,
    /// Interval between timer-driven drain passes
    pub sync_interval: Duration,
    /// Transient failures tolerated before an operation turns FAILED
    pub max_retries: u32,
    /// Base delay for exponential backoff after a transient pass
    pub backoff_base: Duration,
    /// Upper bound on the backoff delay
    pub backoff_cap: Duration,
    /// Distinct entities drained concurrently within one pass
    pub max_concurrency: usize,
    /// Per-entity-kind conflict resolution policies
    policies: HashMap<EntityKind, ResolutionPolicy>,
}

impl Default for SyncConfig {
    fn default() -> Self {
        let server_url = std::env::var(SERVER_URL_ENV)
            .unwrap_or_else(|_| DEFAULT_SERVER_URL.to_string());
        Self {
            server_url,
            auto_sync: true,
            sync_interval: Duration::from_secs(30),
            max_retries: 5,
            backoff_base: Duration::from_secs(1),
            backoff_cap: Duration::from_secs(300),
            max_concurrency: 4,
            policies: HashMap::new(),
        }
    }
}

impl SyncConfig {
    /// Create a new builder
    pub fn builder() -> SyncConfigBuilder {
        SyncConfigBuilder::default()
    }

    /// Resolution policy for an entity kind, `ServerWins` when unset
    pub fn policy(&self, kind: EntityKind) -> ResolutionPolicy {
        self.policies
            .get(&kind)
            .copied()
            .unwrap_or(ResolutionPolicy::ServerWins)
    }

    /// Full URL for an API path
    pub fn api_url(&self, path: &str) -> String {
        format!("{}{}", self.server_url.trim_end_matches('/'), path)
    }
}

/// Builder for [`SyncConfig`]
#[derive(Debug, Default)]
pub struct SyncConfigBuilder {
    server_url: Option<String>,
    auto_sync: Option<bool>,
    sync_interval: Option<Duration>,
    max_retries: Option<u32>,
    backoff_base: Option<Duration>,
    backoff_cap: Option<Duration>,
    max_concurrency: Option<usize>,
    policies: HashMap<EntityKind, ResolutionPolicy>,
}

impl SyncConfigBuilder {
    /// Set the backend base URL
    pub fn server_url(mut self, url: impl Into<String>) -> Self {
        self.server_url = Some(url.into());
        self
    }

    /// Enable or disable the periodic drain timer
    pub fn auto_sync(mut self, enabled: bool) -> Self {
        self.auto_sync = Some(enabled);
        self
    }

    /// Set the timer interval between drain passes
    pub fn sync_interval(mut self, interval: Duration) -> Self {
        self.sync_interval = Some(interval);
        self
    }

    /// Set the transient retry budget per operation
    pub fn max_retries(mut self, retries: u32) -> Self {
        self.max_retries = Some(retries);
        self
    }

    /// Set the backoff base delay and cap
    pub fn backoff(mut self, base: Duration, cap: Duration) -> Self {
        self.backoff_base = Some(base);
        self.backoff_cap = Some(cap);
        self
    }

    /// Set the per-pass concurrency bound across distinct entities
    pub fn max_concurrency(mut self, limit: usize) -> Self {
        self.max_concurrency = Some(limit);
        self
    }

    /// Set the resolution policy for an entity kind
    pub fn policy(mut self, kind: EntityKind, policy: ResolutionPolicy) -> Self {
        self.policies.insert(kind, policy);
        self
    }

    /// Build the configuration, validating policy assignments
    pub fn build(self) -> Result<SyncConfig, ConfigError> {
        let defaults = SyncConfig::default();

        for (kind, policy) in &self.policies {
            if *policy == ResolutionPolicy::Merge && !kind.is_mergeable() {
                return Err(ConfigError::InvalidPolicy(kind.resource()));
            }
        }

        if let Some(url) = &self.server_url {
            if !url.starts_with("http://") && !url.starts_with("https://") {
                return Err(ConfigError::InvalidUrl(url.clone()));
            }
        }

        if self.max_concurrency == Some(0) {
            return Err(ConfigError::MissingValue("max_concurrency"));
        }

        Ok(SyncConfig {
            server_url: self.server_url.unwrap_or(defaults.server_url),
            auto_sync: self.auto_sync.unwrap_or(defaults.auto_sync),
            sync_interval: self.sync_interval.unwrap_or(defaults.sync_interval),
            max_retries: self.max_retries.unwrap_or(defaults.max_retries),
            backoff_base: self.backoff_base.unwrap_or(defaults.backoff_base),
            backoff_cap: self.backoff_cap.unwrap_or(defaults.backoff_cap),
            max_concurrency: self.max_concurrency.unwrap_or(defaults.max_concurrency),
            policies: self.policies,
        })
    }
}

/// Configuration errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid URL: {0}")]
    InvalidUrl(String),
    #[error("missing value: {0}")]
    MissingValue(&'static str),
    #[error("merge policy is not valid for entity kind '{0}'")]
    InvalidPolicy(&'static str),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_policy_is_server_wins() {
        let config = SyncConfig::builder().build().unwrap();
        assert_eq!(config.policy(EntityKind::PantryItem), ResolutionPolicy::ServerWins);
    }

    #[test]
    fn test_policy_override() {
        let config = SyncConfig::builder()
            .policy(EntityKind::PantryItem, ResolutionPolicy::ClientWins)
            .build()
            .unwrap();
        assert_eq!(config.policy(EntityKind::PantryItem), ResolutionPolicy::ClientWins);
        assert_eq!(config.policy(EntityKind::GroceryList), ResolutionPolicy::ServerWins);
    }

    #[test]
    fn test_merge_rejected_for_non_mergeable_kind() {
        let result = SyncConfig::builder()
            .policy(EntityKind::PantryItem, ResolutionPolicy::Merge)
            .build();
        assert!(matches!(result, Err(ConfigError::InvalidPolicy(_))));
    }

    #[test]
    fn test_merge_allowed_for_grocery_items() {
        let result = SyncConfig::builder()
            .policy(EntityKind::GroceryItem, ResolutionPolicy::Merge)
            .build();
        assert!(result.is_ok());
    }

    #[test]
    fn test_invalid_url_rejected() {
        let result = SyncConfig::builder().server_url("not-a-url").build();
        assert!(matches!(result, Err(ConfigError::InvalidUrl(_))));
    }

    #[test]
    fn test_api_url_joins_path() {
        let config = SyncConfig::builder()
            .server_url("http://localhost:3000/")
            .build()
            .unwrap();
        assert_eq!(
            config.api_url("/api/pantry-items"),
            "http://localhost:3000/api/pantry-items"
        );
    }
}

//! Shared types for sinks and their deployments
//!
//! - [`SinkState`] - declared or observed lifecycle state of a sink
//! - [`SinkDescriptor`] - immutable snapshot returned by the sink registry
//! - [`DeploymentRecord`] - ledger entry, one per provisioned sink
//! - [`SinkStatus`] - last-known derived state published to the status cache

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use super::config::SinkConfig;

/// Lifecycle state of a sink
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SinkState {
    New,
    Active,
    Inactive,
    Error,
    /// Provisioning not confirmed yet, or an unrecognized state string
    #[default]
    #[serde(other)]
    Unknown,
}

impl SinkState {
    pub fn as_str(&self) -> &'static str {
        match self {
            SinkState::New => "new",
            SinkState::Active => "active",
            SinkState::Inactive => "inactive",
            SinkState::Error => "error",
            SinkState::Unknown => "unknown",
        }
    }
}

impl From<&str> for SinkState {
    fn from(value: &str) -> Self {
        match value.trim().to_ascii_lowercase().as_str() {
            "new" => SinkState::New,
            "active" => SinkState::Active,
            "inactive" => SinkState::Inactive,
            "error" => SinkState::Error,
            _ => SinkState::Unknown,
        }
    }
}

impl fmt::Display for SinkState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Export-enabled sink as reported by the registry
#[derive(Clone, Debug, PartialEq)]
pub struct SinkDescriptor {
    pub id: String,
    pub owner_id: String,
    pub state: SinkState,
    /// Raw configuration blob, JSON encoded
    pub config: Vec<u8>,
}

/// Credentials used by the collector to authenticate against the endpoint
#[derive(Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credentials {
    pub user: String,
    pub password: String,
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("user", &self.user)
            .field("password", &"<redacted>")
            .finish()
    }
}

/// Ledger entry tracking a provisioned sink
///
/// Exactly one record exists per sink id. Records are created once and then
/// updated in place.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct DeploymentRecord {
    pub sink_id: String,
    pub owner_id: String,
    pub endpoint: String,
    pub credentials: Credentials,
    #[serde(default = "default_backend")]
    pub backend: String,
    #[serde(default)]
    pub metadata: Map<String, Value>,
    pub state: SinkState,
    pub created_at: DateTime<Utc>,
}

fn default_backend() -> String {
    super::DEFAULT_BACKEND.to_string()
}

impl DeploymentRecord {
    /// Build a fresh record from a validated configuration
    pub fn new(sink_id: &str, owner_id: &str, config: &SinkConfig, state: SinkState) -> Self {
        Self {
            sink_id: sink_id.to_string(),
            owner_id: owner_id.to_string(),
            endpoint: config.url.clone(),
            credentials: Credentials {
                user: config.user.clone(),
                password: config.password.clone(),
            },
            backend: config.backend.clone(),
            metadata: config.metadata.clone(),
            state,
            created_at: Utc::now(),
        }
    }

    /// Reconstruct the sink configuration this record was built from
    pub fn config_snapshot(&self) -> SinkConfig {
        SinkConfig {
            url: self.endpoint.clone(),
            user: self.credentials.user.clone(),
            password: self.credentials.password.clone(),
            backend: self.backend.clone(),
            metadata: self.metadata.clone(),
        }
    }
}

/// Partial update applied in place to an existing record
#[derive(Clone, Debug, Default, PartialEq)]
pub struct DeploymentUpdate {
    pub state: Option<SinkState>,
    pub config: Option<SinkConfig>,
}

impl DeploymentUpdate {
    pub fn state(state: SinkState) -> Self {
        Self {
            state: Some(state),
            config: None,
        }
    }

    pub fn config(config: SinkConfig) -> Self {
        Self {
            state: None,
            config: Some(config),
        }
    }

    /// Apply the update; `sink_id`, `owner_id` and `created_at` never change
    pub fn apply_to(&self, record: &mut DeploymentRecord) {
        if let Some(state) = self.state {
            record.state = state;
        }
        if let Some(config) = &self.config {
            record.endpoint = config.url.clone();
            record.credentials = Credentials {
                user: config.user.clone(),
                password: config.password.clone(),
            };
            record.backend = config.backend.clone();
            record.metadata = config.metadata.clone();
        }
    }
}

/// Value stored in the status cache
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SinkStatus {
    pub owner_id: String,
    pub sink_id: String,
    pub state: SinkState,
    pub snapshot: SinkConfig,
    pub last_updated: DateTime<Utc>,
}

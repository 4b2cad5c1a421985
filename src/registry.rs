//! Sink registry client
//!
//! The registry is the source of truth for declared sinks. Maestro only
//! needs one call from it: list every export-enabled sink.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use serde_json::Value;
use tracing::{debug, instrument};

use crate::error::{Error, Result};
use crate::sink::{SinkDescriptor, SinkState};

/// Filter applied to `list_sinks`
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SinkFilter {
    /// Only sinks with telemetry export enabled
    pub export_enabled: bool,
}

impl SinkFilter {
    pub fn export_enabled() -> Self {
        Self {
            export_enabled: true,
        }
    }
}

#[async_trait]
pub trait SinkRegistry: Send + Sync {
    async fn list_sinks(&self, filter: SinkFilter) -> Result<Vec<SinkDescriptor>>;
}

#[derive(Debug, Deserialize)]
struct ListSinksResponse {
    #[serde(default)]
    sinks: Vec<SinkEntry>,
}

#[derive(Debug, Deserialize)]
struct SinkEntry {
    id: String,
    #[serde(default, alias = "ownerID", alias = "mf_owner_id")]
    owner_id: String,
    #[serde(default)]
    state: String,
    #[serde(default)]
    config: Value,
}

impl From<SinkEntry> for SinkDescriptor {
    fn from(entry: SinkEntry) -> Self {
        // The registry sends the config either inline or as a JSON string
        let config = match entry.config {
            Value::String(s) => s.into_bytes(),
            Value::Null => Vec::new(),
            other => other.to_string().into_bytes(),
        };
        SinkDescriptor {
            id: entry.id,
            owner_id: entry.owner_id,
            state: SinkState::from(entry.state.as_str()),
            config,
        }
    }
}

/// Registry reached over HTTP/JSON
pub struct HttpSinkRegistry {
    client: Client,
    base_url: String,
}

impl HttpSinkRegistry {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .user_agent(concat!("maestro/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(Error::HttpError)?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }
}

#[async_trait]
impl SinkRegistry for HttpSinkRegistry {
    #[instrument(skip(self), fields(base_url = %self.base_url))]
    async fn list_sinks(&self, filter: SinkFilter) -> Result<Vec<SinkDescriptor>> {
        let url = format!("{}/sinks", self.base_url);
        let mut request = self.client.get(&url);
        if filter.export_enabled {
            request = request.query(&[("otel", "enabled")]);
        }

        let resp = request
            .send()
            .await
            .map_err(|e| Error::RegistryUnavailable(format!("GET {url}: {e}")))?;

        if !resp.status().is_success() {
            return Err(Error::RegistryUnavailable(format!(
                "GET {url} returned HTTP {}",
                resp.status()
            )));
        }

        let body: ListSinksResponse = resp
            .json()
            .await
            .map_err(|e| Error::RegistryUnavailable(format!("decoding sink list: {e}")))?;

        debug!(count = body.sinks.len(), "Fetched sinks from registry");
        Ok(body.sinks.into_iter().map(SinkDescriptor::from).collect())
    }
}

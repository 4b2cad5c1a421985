//! Exporter section builders for collector configs
//!
//! Each sink names an exporter backend. [`ExporterRegistry`] maps the backend
//! kind to a builder constructor; it is populated once at start-up and looked
//! up by key when a collector config is rendered.

use std::collections::{BTreeMap, HashMap};

use serde::Serialize;
use serde_json::{Map, Value};

use crate::error::{Error, Result};
use crate::sink::DeploymentRecord;

const HEADERS_KEY: &str = "headers";
const EXPORTER_KEY: &str = "exporter";
const REMOTE_HOST_KEY: &str = "remote_host";
const ENDPOINT_KEY: &str = "endpoint";
const ORG_ID_HEADER: &str = "X-Scope-OrgID";

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct ExporterAuth {
    pub authenticator: String,
}

/// Exporter entry of the collector's `exporters` section
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct ExporterConfig {
    pub endpoint: String,
    pub auth: ExporterAuth,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub headers: Option<BTreeMap<String, String>>,
}

pub trait ExporterBuilder: Send + Sync {
    /// Collector component name, e.g. `prometheusremotewrite`
    fn exporter_name(&self) -> &'static str;

    fn build(&self, record: &DeploymentRecord, authenticator: &str) -> ExporterConfig;
}

type BuilderConstructor = fn() -> Box<dyn ExporterBuilder>;

/// Table of exporter builders keyed by backend kind
pub struct ExporterRegistry {
    builders: HashMap<&'static str, BuilderConstructor>,
}

impl ExporterRegistry {
    /// Registry with no backends
    pub fn empty() -> Self {
        Self {
            builders: HashMap::new(),
        }
    }

    pub fn register(&mut self, kind: &'static str, constructor: BuilderConstructor) {
        self.builders.insert(kind, constructor);
    }

    pub fn builder(&self, kind: &str) -> Result<Box<dyn ExporterBuilder>> {
        self.builders
            .get(kind)
            .map(|constructor| constructor())
            .ok_or_else(|| Error::UnsupportedBackend(kind.to_string()))
    }

    /// Fails with [`Error::UnsupportedBackend`] if no builder is registered
    pub fn ensure_supported(&self, kind: &str) -> Result<()> {
        if self.builders.contains_key(kind) {
            Ok(())
        } else {
            Err(Error::UnsupportedBackend(kind.to_string()))
        }
    }

    pub fn kinds(&self) -> Vec<&'static str> {
        let mut kinds: Vec<_> = self.builders.keys().copied().collect();
        kinds.sort_unstable();
        kinds
    }
}

impl Default for ExporterRegistry {
    fn default() -> Self {
        let mut registry = Self::empty();
        registry.register("prometheus", || Box::new(PrometheusRemoteWrite));
        registry.register("otlphttp", || Box::new(OtlpHttp));
        registry
    }
}

/// Prometheus remote-write exporter
pub struct PrometheusRemoteWrite;

impl ExporterBuilder for PrometheusRemoteWrite {
    fn exporter_name(&self) -> &'static str {
        "prometheusremotewrite"
    }

    fn build(&self, record: &DeploymentRecord, authenticator: &str) -> ExporterConfig {
        exporter_config(record, REMOTE_HOST_KEY, authenticator)
    }
}

/// OTLP over HTTP exporter
pub struct OtlpHttp;

impl ExporterBuilder for OtlpHttp {
    fn exporter_name(&self) -> &'static str {
        "otlphttp"
    }

    fn build(&self, record: &DeploymentRecord, authenticator: &str) -> ExporterConfig {
        exporter_config(record, ENDPOINT_KEY, authenticator)
    }
}

fn exporter_config(
    record: &DeploymentRecord,
    endpoint_key: &str,
    authenticator: &str,
) -> ExporterConfig {
    ExporterConfig {
        endpoint: exporter_endpoint(&record.metadata, endpoint_key)
            .unwrap_or_else(|| record.endpoint.clone()),
        auth: ExporterAuth {
            authenticator: authenticator.to_string(),
        },
        headers: org_id_header(&record.metadata),
    }
}

/// Endpoint override under `exporter.<key>`, if set to a non-empty string
fn exporter_endpoint(metadata: &Map<String, Value>, key: &str) -> Option<String> {
    metadata
        .get(EXPORTER_KEY)
        .and_then(Value::as_object)
        .and_then(|exporter| exporter.get(key))
        .and_then(Value::as_str)
        .filter(|v| !v.is_empty())
        .map(str::to_string)
}

/// Tenant header for multi-tenant backends such as Mimir or Cortex
fn org_id_header(metadata: &Map<String, Value>) -> Option<BTreeMap<String, String>> {
    let org_id = metadata
        .get(HEADERS_KEY)
        .and_then(Value::as_object)
        .and_then(|headers| headers.get(ORG_ID_HEADER))
        .and_then(Value::as_str)
        .filter(|v| !v.is_empty())?;

    Some(BTreeMap::from([(
        ORG_ID_HEADER.to_string(),
        org_id.to_string(),
    )]))
}

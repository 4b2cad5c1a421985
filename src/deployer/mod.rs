//! Cluster-side provisioning of per-sink collectors
//!
//! The reconciler and event handlers only see the [`Deployer`] trait. The
//! Kubernetes implementation renders an OpenTelemetry collector config for the
//! sink and applies a ConfigMap plus Deployment for it.

pub mod collector;
pub mod exporter;
mod kubernetes;

pub use collector::{render_collector_config, CollectorSettings};
pub use exporter::{ExporterBuilder, ExporterConfig, ExporterRegistry};
pub use kubernetes::{DeployerConfig, KubeDeployer, MANAGED_BY};

use async_trait::async_trait;

use crate::error::Result;
use crate::sink::DeploymentRecord;

#[async_trait]
pub trait Deployer: Send + Sync {
    /// Identifiers of the collectors currently running
    async fn list_live_deployments(&self) -> Result<Vec<String>>;

    /// Provision the collector for a sink. Applying twice converges.
    async fn create_deployment(
        &self,
        owner_id: &str,
        sink_id: &str,
        record: &DeploymentRecord,
    ) -> Result<()>;

    /// Tear down the collector for a sink. Missing objects are not an error.
    async fn remove_deployment(&self, sink_id: &str) -> Result<()>;

    /// Whether the sink's collector has at least one ready replica
    async fn is_ready(&self, sink_id: &str) -> Result<bool>;

    /// Fails with [`Error::UnsupportedBackend`](crate::Error::UnsupportedBackend)
    /// when no collector can be rendered for the backend
    fn ensure_backend(&self, backend: &str) -> Result<()>;
}

/// Name of the collector workload for a sink
pub fn deployment_name(sink_id: &str) -> String {
    format!("otel-{sink_id}")
}

/// A sink is live when any deployment identifier embeds its id.
///
/// Correlation is by substring, so sink ids must not be substrings of one
/// another for this to be exact.
pub fn is_live(live_deployments: &[String], sink_id: &str) -> bool {
    !sink_id.is_empty() && live_deployments.iter().any(|d| d.contains(sink_id))
}

//! Kubernetes implementation of [`Deployer`]
//!
//! Every sink gets a ConfigMap holding its rendered collector config and a
//! single-replica Deployment mounting it. Both are applied with server-side
//! apply so re-applying converges instead of conflicting.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use k8s_openapi::api::apps::v1::{Deployment, DeploymentSpec};
use k8s_openapi::api::core::v1::{
    ConfigMap, ConfigMapVolumeSource, Container, ContainerPort, PodSpec, PodTemplateSpec,
    Volume, VolumeMount,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, ObjectMeta};
use kube::api::{Api, DeleteParams, ListParams, Patch, PatchParams};
use kube::{Client, ResourceExt};
use tracing::{debug, info, instrument, warn};

use super::collector::{render_collector_config, CollectorSettings};
use super::exporter::ExporterRegistry;
use super::{deployment_name, Deployer};
use crate::error::{Error, Result};
use crate::sink::DeploymentRecord;

/// Field manager and `managed-by` label value
pub const MANAGED_BY: &str = "maestro";

const SINK_ID_LABEL: &str = "maestro.orb.community/sink-id";
const OWNER_ID_LABEL: &str = "maestro.orb.community/owner-id";
const CONFIG_FILE: &str = "config.yaml";
const CONFIG_MOUNT_PATH: &str = "/etc/otelcol-contrib";
const HEALTH_CHECK_PORT: i32 = 13133;

/// Settings shared by every collector this deployer creates
#[derive(Clone, Debug)]
pub struct DeployerConfig {
    pub namespace: String,
    pub collector_image: String,
    pub collector: CollectorSettings,
}

/// Deployer applying collector workloads to a Kubernetes namespace
#[derive(Clone)]
pub struct KubeDeployer {
    client: Client,
    config: DeployerConfig,
    exporters: Arc<ExporterRegistry>,
}

impl KubeDeployer {
    pub fn new(client: Client, config: DeployerConfig, exporters: Arc<ExporterRegistry>) -> Self {
        Self {
            client,
            config,
            exporters,
        }
    }

    fn deployments(&self) -> Api<Deployment> {
        Api::namespaced(self.client.clone(), &self.config.namespace)
    }

    fn config_maps(&self) -> Api<ConfigMap> {
        Api::namespaced(self.client.clone(), &self.config.namespace)
    }
}

fn config_map_name(sink_id: &str) -> String {
    format!("otel-collector-config-{sink_id}")
}

/// Label selector matching every collector this service manages
fn managed_selector() -> String {
    format!("app.kubernetes.io/managed-by={MANAGED_BY}")
}

/// Labels for a sink's collector resources
pub(crate) fn collector_labels(owner_id: &str, sink_id: &str) -> BTreeMap<String, String> {
    let mut labels = BTreeMap::new();
    labels.insert(
        "app.kubernetes.io/name".to_string(),
        "otel-collector".to_string(),
    );
    labels.insert(
        "app.kubernetes.io/instance".to_string(),
        deployment_name(sink_id),
    );
    labels.insert(
        "app.kubernetes.io/managed-by".to_string(),
        MANAGED_BY.to_string(),
    );
    labels.insert(SINK_ID_LABEL.to_string(), sink_id.to_string());
    labels.insert(OWNER_ID_LABEL.to_string(), owner_id.to_string());
    labels
}

pub(crate) fn build_config_map(
    namespace: &str,
    owner_id: &str,
    sink_id: &str,
    rendered: String,
) -> ConfigMap {
    ConfigMap {
        metadata: ObjectMeta {
            name: Some(config_map_name(sink_id)),
            namespace: Some(namespace.to_string()),
            labels: Some(collector_labels(owner_id, sink_id)),
            ..Default::default()
        },
        data: Some(BTreeMap::from([(CONFIG_FILE.to_string(), rendered)])),
        ..Default::default()
    }
}

pub(crate) fn build_deployment(
    namespace: &str,
    image: &str,
    owner_id: &str,
    sink_id: &str,
) -> Deployment {
    let labels = collector_labels(owner_id, sink_id);
    // Selector must stay stable across re-applies, so it only carries the sink id
    let selector = BTreeMap::from([(SINK_ID_LABEL.to_string(), sink_id.to_string())]);

    let container = Container {
        name: "otel-collector".to_string(),
        image: Some(image.to_string()),
        args: Some(vec![format!("--config={CONFIG_MOUNT_PATH}/{CONFIG_FILE}")]),
        ports: Some(vec![ContainerPort {
            name: Some("health".to_string()),
            container_port: HEALTH_CHECK_PORT,
            ..Default::default()
        }]),
        volume_mounts: Some(vec![VolumeMount {
            name: "collector-config".to_string(),
            mount_path: CONFIG_MOUNT_PATH.to_string(),
            read_only: Some(true),
            ..Default::default()
        }]),
        ..Default::default()
    };

    Deployment {
        metadata: ObjectMeta {
            name: Some(deployment_name(sink_id)),
            namespace: Some(namespace.to_string()),
            labels: Some(labels.clone()),
            ..Default::default()
        },
        spec: Some(DeploymentSpec {
            replicas: Some(1),
            selector: LabelSelector {
                match_labels: Some(selector),
                ..Default::default()
            },
            template: PodTemplateSpec {
                metadata: Some(ObjectMeta {
                    labels: Some(labels),
                    ..Default::default()
                }),
                spec: Some(PodSpec {
                    containers: vec![container],
                    volumes: Some(vec![Volume {
                        name: "collector-config".to_string(),
                        config_map: Some(ConfigMapVolumeSource {
                            name: Some(config_map_name(sink_id)),
                            ..Default::default()
                        }),
                        ..Default::default()
                    }]),
                    ..Default::default()
                }),
            },
            ..Default::default()
        }),
        status: None,
    }
}

fn ignore_not_found(
    result: std::result::Result<(), kube::Error>,
    kind: &str,
    name: &str,
) -> Result<()> {
    match result {
        Ok(()) => {
            info!("Deleted {} {}", kind, name);
            Ok(())
        }
        Err(kube::Error::Api(e)) if e.code == 404 => {
            debug!("{} {} not found, already deleted", kind, name);
            Ok(())
        }
        Err(e) => Err(Error::KubeError(e)),
    }
}

#[async_trait]
impl Deployer for KubeDeployer {
    #[instrument(skip(self), fields(namespace = %self.config.namespace))]
    async fn list_live_deployments(&self) -> Result<Vec<String>> {
        let lp = ListParams::default().labels(&managed_selector());
        let list = self
            .deployments()
            .list(&lp)
            .await
            .map_err(|e| Error::DeployerUnavailable(format!("listing deployments: {e}")))?;

        Ok(list.items.iter().map(|d| d.name_any()).collect())
    }

    #[instrument(skip(self, record), fields(namespace = %self.config.namespace))]
    async fn create_deployment(
        &self,
        owner_id: &str,
        sink_id: &str,
        record: &DeploymentRecord,
    ) -> Result<()> {
        let rendered =
            render_collector_config(record, &self.exporters, &self.config.collector)?;
        let params = PatchParams::apply(MANAGED_BY).force();

        let cm = build_config_map(&self.config.namespace, owner_id, sink_id, rendered);
        self.config_maps()
            .patch(&config_map_name(sink_id), &params, &Patch::Apply(&cm))
            .await?;

        let deployment = build_deployment(
            &self.config.namespace,
            &self.config.collector_image,
            owner_id,
            sink_id,
        );
        self.deployments()
            .patch(&deployment_name(sink_id), &params, &Patch::Apply(&deployment))
            .await?;

        info!("Applied collector {}", deployment_name(sink_id));
        Ok(())
    }

    #[instrument(skip(self), fields(namespace = %self.config.namespace))]
    async fn remove_deployment(&self, sink_id: &str) -> Result<()> {
        let name = deployment_name(sink_id);
        let deleted = self
            .deployments()
            .delete(&name, &DeleteParams::default())
            .await
            .map(|_| ());
        ignore_not_found(deleted, "Deployment", &name)?;

        let cm_name = config_map_name(sink_id);
        let deleted = self
            .config_maps()
            .delete(&cm_name, &DeleteParams::default())
            .await
            .map(|_| ());
        ignore_not_found(deleted, "ConfigMap", &cm_name)
    }

    async fn is_ready(&self, sink_id: &str) -> Result<bool> {
        match self.deployments().get(&deployment_name(sink_id)).await {
            Ok(deployment) => Ok(deployment
                .status
                .and_then(|s| s.ready_replicas)
                .is_some_and(|ready| ready >= 1)),
            Err(kube::Error::Api(e)) if e.code == 404 => {
                warn!(sink_id, "Collector deployment not found");
                Ok(false)
            }
            Err(e) => Err(Error::KubeError(e)),
        }
    }

    fn ensure_backend(&self, backend: &str) -> Result<()> {
        self.exporters.ensure_supported(backend)
    }
}

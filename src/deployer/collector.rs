//! Rendering of the per-sink OpenTelemetry collector configuration

use serde_json::json;

use super::exporter::ExporterRegistry;
use crate::error::Result;
use crate::sink::DeploymentRecord;

/// Name of the authentication extension the exporter refers to
pub const AUTH_EXTENSION: &str = "basicauth/exporter";

const KAFKA_RECEIVER: &str = "kafka";

/// Cluster-wide inputs to every collector config
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CollectorSettings {
    /// Kafka brokers the collector receives metrics from
    pub kafka_url: String,
}

/// Topic the sinker publishes a sink's metrics on
pub fn metrics_topic(sink_id: &str) -> String {
    format!("otlp_metrics-{sink_id}")
}

/// Render the collector config for a deployment as YAML
pub fn render_collector_config(
    record: &DeploymentRecord,
    exporters: &ExporterRegistry,
    settings: &CollectorSettings,
) -> Result<String> {
    let builder = exporters.builder(&record.backend)?;
    let exporter_name = builder.exporter_name();
    let exporter = builder.build(record, AUTH_EXTENSION);

    let config = json!({
        "receivers": {
            KAFKA_RECEIVER: {
                "brokers": [settings.kafka_url],
                "topic": metrics_topic(&record.sink_id),
                "protocol_version": "2.0.0",
            }
        },
        "extensions": {
            "health_check": {},
            AUTH_EXTENSION: {
                "client_auth": {
                    "username": record.credentials.user,
                    "password": record.credentials.password,
                }
            }
        },
        "exporters": {
            exporter_name: serde_json::to_value(&exporter)?,
        },
        "service": {
            "extensions": ["health_check", AUTH_EXTENSION],
            "pipelines": {
                "metrics": {
                    "receivers": [KAFKA_RECEIVER],
                    "exporters": [exporter_name],
                }
            }
        }
    });

    Ok(serde_yaml::to_string(&config)?)
}

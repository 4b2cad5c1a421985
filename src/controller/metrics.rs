//! Prometheus metrics for maestro
//!
//! # Exported metrics
//! - `maestro_events_total` (counter): stream messages by stream, operation and outcome.
//! - `maestro_bootstrap_sinks_total` (counter): sinks examined at startup by result.
//! - `maestro_consumer_read_errors_total` (counter): failed group reads by stream.
//! - `maestro_deployments_created_total` (counter): collectors provisioned by origin.

use std::sync::atomic::AtomicU64;

use once_cell::sync::Lazy;
use prometheus_client::encoding::EncodeLabelSet;
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::family::Family;
use prometheus_client::registry::Registry;

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct EventLabels {
    pub stream: String,
    pub operation: String,
    /// `applied`, `failed` or `ignored`
    pub outcome: String,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct BootstrapLabels {
    pub result: String,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct StreamLabels {
    pub stream: String,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct OriginLabels {
    /// `bootstrap` or `monitor`
    pub origin: String,
}

pub static EVENTS_TOTAL: Lazy<Family<EventLabels, Counter<u64, AtomicU64>>> =
    Lazy::new(Family::default);

pub static BOOTSTRAP_SINKS_TOTAL: Lazy<Family<BootstrapLabels, Counter<u64, AtomicU64>>> =
    Lazy::new(Family::default);

pub static CONSUMER_READ_ERRORS_TOTAL: Lazy<Family<StreamLabels, Counter<u64, AtomicU64>>> =
    Lazy::new(Family::default);

pub static DEPLOYMENTS_CREATED_TOTAL: Lazy<Family<OriginLabels, Counter<u64, AtomicU64>>> =
    Lazy::new(Family::default);

/// Registry served on `/metrics`. Counter names get the `_total` suffix on encode.
pub static REGISTRY: Lazy<Registry> = Lazy::new(|| {
    let mut registry = Registry::default();

    registry.register(
        "maestro_events",
        "Stream messages handled, by outcome",
        EVENTS_TOTAL.clone(),
    );
    registry.register(
        "maestro_bootstrap_sinks",
        "Sinks examined by the startup reconciliation",
        BOOTSTRAP_SINKS_TOTAL.clone(),
    );
    registry.register(
        "maestro_consumer_read_errors",
        "Failed consumer group reads",
        CONSUMER_READ_ERRORS_TOTAL.clone(),
    );
    registry.register(
        "maestro_deployments_created",
        "Collector deployments created",
        DEPLOYMENTS_CREATED_TOTAL.clone(),
    );

    registry
});

pub fn inc_event(stream: &str, operation: &str, outcome: &str) {
    EVENTS_TOTAL
        .get_or_create(&EventLabels {
            stream: stream.to_string(),
            operation: operation.to_string(),
            outcome: outcome.to_string(),
        })
        .inc();
}

pub fn inc_bootstrap_sink(result: &str) {
    BOOTSTRAP_SINKS_TOTAL
        .get_or_create(&BootstrapLabels {
            result: result.to_string(),
        })
        .inc();
}

pub fn inc_read_error(stream: &str) {
    CONSUMER_READ_ERRORS_TOTAL
        .get_or_create(&StreamLabels {
            stream: stream.to_string(),
        })
        .inc();
}

pub fn inc_deployment_created(origin: &str) {
    DEPLOYMENTS_CREATED_TOTAL
        .get_or_create(&OriginLabels {
            origin: origin.to_string(),
        })
        .inc();
}

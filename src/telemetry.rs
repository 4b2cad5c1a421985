//! OpenTelemetry tracing export
//!
//! Enabled from `main` when `OTEL_EXPORTER_OTLP_ENDPOINT` is set. The OTLP
//! exporter reads the endpoint from the environment itself.

use opentelemetry::KeyValue;
use opentelemetry_sdk::{runtime, trace as sdktrace, Resource};
use tracing::Subscriber;
use tracing_opentelemetry::OpenTelemetryLayer;
use tracing_subscriber::registry::LookupSpan;

const SERVICE_NAME: &str = "maestro";

/// Build the OpenTelemetry tracing layer.
///
/// Returns `None` if the OTLP pipeline cannot be installed; stdout logging
/// keeps working in that case.
pub fn init_telemetry<S>(_registry: &S) -> Option<OpenTelemetryLayer<S, sdktrace::Tracer>>
where
    S: Subscriber + for<'span> LookupSpan<'span>,
{
    let tracer = opentelemetry_otlp::new_pipeline()
        .tracing()
        .with_exporter(opentelemetry_otlp::new_exporter().tonic())
        .with_trace_config(
            sdktrace::config()
                .with_resource(Resource::new(vec![KeyValue::new(
                    "service.name",
                    SERVICE_NAME,
                )])),
        )
        .install_batch(runtime::Tokio);

    match tracer {
        Ok(tracer) => Some(tracing_opentelemetry::layer().with_tracer(tracer)),
        Err(e) => {
            eprintln!("Failed to install OTLP tracing pipeline: {e}");
            None
        }
    }
}

/// Flush pending spans before exit
pub fn shutdown_telemetry() {
    opentelemetry::global::shutdown_tracer_provider();
}

//! Controller module for sink reconciliation
//! This module contains the startup reconciliation, the durable-log
//! consumers, the lifecycle handlers and the collector monitor.

mod backoff;
mod bootstrap;
mod consumer;
#[cfg(test)]
mod consumer_test;
mod handlers;
mod health;
pub mod metrics;
mod monitor;
mod routines;
mod service;

pub use backoff::{Backoff, BackoffConfig};
pub use bootstrap::{BootstrapReport, Reconciler};
pub use consumer::{
    BatchOutcome, ConsumerConfig, EventConsumer, CHANNELS_STREAM, CONSUMER_GROUP,
    DEFAULT_BATCH_SIZE, DEFAULT_BLOCK, SINKS_STREAM,
};
pub use handlers::LifecycleHandler;
pub use health::HealthState;
pub use monitor::{DeploymentMonitor, Monitor, MonitorConfig, Probe, ProbeVerdict};
pub use routines::RoutineRegistry;
pub use service::{RunningService, Service};

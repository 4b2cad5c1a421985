//! Maestro: control plane for per-tenant telemetry collectors
//!
//! This crate keeps one OpenTelemetry collector deployment per export-enabled
//! sink, converging cluster state with the sink registry at startup and
//! applying lifecycle changes from Redis Streams afterwards.

pub mod controller;
pub mod deployer;
pub mod error;
pub mod events;
pub mod registry;
pub mod sink;
pub mod store;
pub mod telemetry;

#[cfg(feature = "rest-api")]
pub mod rest_api;

#[cfg(test)]
mod testing;

pub use crate::error::{Error, Result};

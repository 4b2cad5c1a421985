//! Sink data model
//!
//! Sinks are tenant-declared telemetry export targets. This module holds the
//! registry snapshot, the permissively decoded sink configuration and the
//! ledger record Maestro keeps for each provisioned sink.

mod config;
pub mod types;


pub use config::{SinkConfig, DEFAULT_BACKEND};
pub use types::*;

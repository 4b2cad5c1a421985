//! Operational HTTP surface
//!
//! Serves `/health` for probes and `/metrics` for Prometheus scraping.

mod dto;
mod handlers;
mod server;

pub use server::{router, run_server, ApiState};

//! Startup reconciliation
//!
//! A single pass run before any consumer starts. It diffs the registry's
//! declared sinks against the ledger and the live deployments, backfills
//! missing ledger records and provisions active sinks that have no running
//! collector. Per-sink failures are logged and skipped; only failing to read
//! the registry or the deployer aborts the pass.

use std::sync::Arc;

use serde::Serialize;
use tracing::{debug, info, instrument, warn};

use super::metrics;
use crate::deployer::{is_live, Deployer};
use crate::error::{Error, Result};
use crate::registry::{SinkFilter, SinkRegistry};
use crate::sink::{DeploymentRecord, SinkConfig, SinkDescriptor, SinkState};
use crate::store::{DeploymentLedger, StatusCache};

/// Tally of one reconciliation pass
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct BootstrapReport {
    pub examined: usize,
    pub ledger_created: usize,
    pub skipped_invalid: usize,
    pub deployed: usize,
    pub deploy_failed: usize,
    pub already_live: usize,
}

/// What the pass did with one sink
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum SinkResult {
    Invalid,
    /// Ledger or status write failed; the sink is retried on next start
    StoreFailed,
    Live,
    /// Not declared active, nothing to deploy
    Idle,
    Deployed,
    DeployFailed,
}

impl SinkResult {
    fn label(self) -> &'static str {
        match self {
            SinkResult::Invalid => "invalid",
            SinkResult::StoreFailed => "store_failed",
            SinkResult::Live => "live",
            SinkResult::Idle => "idle",
            SinkResult::Deployed => "deployed",
            SinkResult::DeployFailed => "deploy_failed",
        }
    }
}

pub struct Reconciler {
    registry: Arc<dyn SinkRegistry>,
    ledger: Arc<dyn DeploymentLedger>,
    status: Arc<dyn StatusCache>,
    deployer: Arc<dyn Deployer>,
}

impl Reconciler {
    pub fn new(
        registry: Arc<dyn SinkRegistry>,
        ledger: Arc<dyn DeploymentLedger>,
        status: Arc<dyn StatusCache>,
        deployer: Arc<dyn Deployer>,
    ) -> Self {
        Self {
            registry,
            ledger,
            status,
            deployer,
        }
    }

    /// Run the pass. Errors only when the registry or deployer is unreachable.
    #[instrument(skip(self))]
    pub async fn reconcile(&self) -> Result<BootstrapReport> {
        let sinks = self
            .registry
            .list_sinks(SinkFilter::export_enabled())
            .await?;

        let live = self.deployer.list_live_deployments().await.map_err(|e| match e {
            Error::DeployerUnavailable(_) => e,
            other => Error::DeployerUnavailable(other.to_string()),
        })?;

        info!(
            sinks = sinks.len(),
            live = live.len(),
            "Reconciling sinks against live deployments"
        );

        let mut report = BootstrapReport::default();
        for sink in &sinks {
            report.examined += 1;
            let (created, result) = self.reconcile_sink(sink, &live).await;
            if created {
                report.ledger_created += 1;
            }
            match result {
                SinkResult::Invalid => report.skipped_invalid += 1,
                SinkResult::Live => report.already_live += 1,
                SinkResult::Deployed => report.deployed += 1,
                SinkResult::DeployFailed => report.deploy_failed += 1,
                SinkResult::StoreFailed | SinkResult::Idle => {}
            }
            metrics::inc_bootstrap_sink(result.label());
        }

        info!(?report, "Startup reconciliation finished");
        Ok(report)
    }

    /// Returns whether a ledger record was created, and the final result
    #[instrument(skip(self, sink, live), fields(sink_id = %sink.id, owner_id = %sink.owner_id))]
    async fn reconcile_sink(&self, sink: &SinkDescriptor, live: &[String]) -> (bool, SinkResult) {
        let mut created = false;

        match self.ledger.get(&sink.id).await {
            Ok(Some(_)) => debug!("Ledger record present"),
            Ok(None) => {
                let parsed = SinkConfig::parse_validated(&sink.config).and_then(|config| {
                    self.deployer.ensure_backend(&config.backend)?;
                    Ok(config)
                });
                let config = match parsed {
                    Ok(config) => config,
                    Err(e) => {
                        warn!(error = %e, "Skipping sink with invalid configuration");
                        return (false, SinkResult::Invalid);
                    }
                };

                let record = DeploymentRecord::new(&sink.id, &sink.owner_id, &config, sink.state);
                match self.ledger.create(record).await {
                    Ok(()) => {
                        created = true;
                        if let Err(e) = self
                            .status
                            .set(&sink.owner_id, &sink.id, SinkState::Unknown, &config)
                            .await
                        {
                            warn!(error = %e, "Failed to publish sink status, skipping sink");
                            return (created, SinkResult::StoreFailed);
                        }
                    }
                    Err(Error::AlreadyExists(_)) => {
                        debug!("Ledger record created concurrently");
                    }
                    Err(e) => {
                        warn!(error = %e, "Failed to create ledger record, skipping sink");
                        return (false, SinkResult::StoreFailed);
                    }
                }
            }
            Err(e) => {
                warn!(error = %e, "Failed to read ledger, skipping sink");
                return (false, SinkResult::StoreFailed);
            }
        }

        if is_live(live, &sink.id) {
            debug!("Collector already running");
            return (created, SinkResult::Live);
        }
        if sink.state != SinkState::Active {
            return (created, SinkResult::Idle);
        }

        let record = match self.ledger.get(&sink.id).await {
            Ok(Some(record)) => record,
            Ok(None) => {
                warn!("Ledger record vanished before deployment, skipping sink");
                return (created, SinkResult::StoreFailed);
            }
            Err(e) => {
                warn!(error = %e, "Failed to read ledger record, skipping sink");
                return (created, SinkResult::StoreFailed);
            }
        };

        match self
            .deployer
            .create_deployment(&sink.owner_id, &sink.id, &record)
            .await
        {
            Ok(()) => {
                metrics::inc_deployment_created("bootstrap");
                info!("Deployed collector for active sink");
                (created, SinkResult::Deployed)
            }
            Err(e) => {
                warn!(error = %e, "Failed to deploy collector, skipping sink");
                (created, SinkResult::DeployFailed)
            }
        }
    }
}

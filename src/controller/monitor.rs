//! Collector health monitor
//!
//! Polls the ledger on an interval and keeps one probe routine per tracked
//! sink. A probe checks whether the sink's collector is ready and publishes
//! the derived state. Repeated poll failures are fatal to the service.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn, Instrument};

use super::routines::RoutineRegistry;
use crate::deployer::Deployer;
use crate::error::{Error, Result};
use crate::sink::{DeploymentRecord, DeploymentUpdate, SinkState};
use crate::store::{DeploymentLedger, StatusCache};

#[async_trait]
pub trait Monitor: Send + Sync {
    /// Run until `cancel` fires. An error means monitoring cannot continue.
    async fn start(&self, cancel: CancellationToken) -> Result<()>;
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MonitorConfig {
    /// Time between ledger polls, and between probes of one sink
    pub interval: Duration,
    /// Consecutive failed polls tolerated before giving up
    pub max_failures: u32,
    /// How long an active sink may stay not ready before it is marked `error`
    pub grace_period: Duration,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(30),
            max_failures: 5,
            grace_period: Duration::from_secs(300),
        }
    }
}

/// Result of a single probe
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ProbeVerdict {
    Ready,
    /// Active but not ready, still within the grace period
    Starting,
    /// Active and not ready past the grace period
    Failed,
    /// Not declared active, nothing to judge
    Idle,
    /// Record no longer in the ledger
    Gone,
}

/// Readiness probe for one sink
pub struct Probe {
    sink_id: String,
    ledger: Arc<dyn DeploymentLedger>,
    status: Arc<dyn StatusCache>,
    deployer: Arc<dyn Deployer>,
    grace_period: Duration,
    not_ready_since: Option<Instant>,
}

impl Probe {
    pub fn new(
        sink_id: &str,
        ledger: Arc<dyn DeploymentLedger>,
        status: Arc<dyn StatusCache>,
        deployer: Arc<dyn Deployer>,
        grace_period: Duration,
    ) -> Self {
        Self {
            sink_id: sink_id.to_string(),
            ledger,
            status,
            deployer,
            grace_period,
            not_ready_since: None,
        }
    }

    pub async fn check(&mut self) -> Result<ProbeVerdict> {
        let Some(record) = self.ledger.get(&self.sink_id).await? else {
            return Ok(ProbeVerdict::Gone);
        };

        if self.deployer.is_ready(&self.sink_id).await? {
            self.not_ready_since = None;
            if record.state != SinkState::Active {
                self.ledger
                    .update(&self.sink_id, DeploymentUpdate::state(SinkState::Active))
                    .await?;
            }
            self.publish(&record.owner_id, SinkState::Active, &record)
                .await?;
            return Ok(ProbeVerdict::Ready);
        }

        if record.state != SinkState::Active {
            return Ok(ProbeVerdict::Idle);
        }

        let since = *self.not_ready_since.get_or_insert_with(Instant::now);
        if since.elapsed() < self.grace_period {
            return Ok(ProbeVerdict::Starting);
        }

        warn!(sink_id = %self.sink_id, "Collector not ready past grace period");
        self.ledger
            .update(&self.sink_id, DeploymentUpdate::state(SinkState::Error))
            .await?;
        self.publish(&record.owner_id, SinkState::Error, &record)
            .await?;
        self.not_ready_since = None;
        Ok(ProbeVerdict::Failed)
    }

    /// Write the observed state unless the cache already holds it. Other
    /// writers may stamp `unknown` at any time, so this compares against the
    /// cache rather than what this probe last wrote.
    async fn publish(
        &self,
        owner_id: &str,
        state: SinkState,
        record: &DeploymentRecord,
    ) -> Result<()> {
        let snapshot = record.config_snapshot();
        let cached = self.status.get(owner_id, &self.sink_id).await?;
        if cached.is_some_and(|c| c.state == state && c.snapshot == snapshot) {
            return Ok(());
        }
        self.status
            .set(owner_id, &self.sink_id, state, &snapshot)
            .await?;
        Ok(())
    }
}

pub struct DeploymentMonitor {
    ledger: Arc<dyn DeploymentLedger>,
    status: Arc<dyn StatusCache>,
    deployer: Arc<dyn Deployer>,
    routines: RoutineRegistry,
    config: MonitorConfig,
}

impl DeploymentMonitor {
    pub fn new(
        ledger: Arc<dyn DeploymentLedger>,
        status: Arc<dyn StatusCache>,
        deployer: Arc<dyn Deployer>,
        config: MonitorConfig,
    ) -> Self {
        Self {
            ledger,
            status,
            deployer,
            routines: RoutineRegistry::new(),
            config,
        }
    }

    pub fn routines(&self) -> &RoutineRegistry {
        &self.routines
    }

    /// Sync probe routines with the ledger. Returns the number of probes running.
    pub async fn poll(&self, cancel: &CancellationToken) -> Result<usize> {
        let records = self.ledger.list().await?;
        let tracked: HashSet<&str> = records
            .iter()
            .filter(|r| r.state != SinkState::Inactive)
            .map(|r| r.sink_id.as_str())
            .collect();

        for id in self.routines.ids() {
            if !tracked.contains(id.as_str()) {
                debug!(sink_id = %id, "Stopping probe");
                self.routines.cancel_and_remove(&id);
            }
        }

        for sink_id in tracked {
            if let Some(token) = self.routines.register(sink_id, cancel) {
                debug!(sink_id, "Starting probe");
                self.spawn_probe(sink_id, token);
            }
        }

        Ok(self.routines.ids().len())
    }

    fn spawn_probe(&self, sink_id: &str, token: CancellationToken) {
        let mut probe = Probe::new(
            sink_id,
            self.ledger.clone(),
            self.status.clone(),
            self.deployer.clone(),
            self.config.grace_period,
        );
        let interval = self.config.interval;
        let span = tracing::info_span!("probe", sink_id);

        tokio::spawn(
            async move {
                loop {
                    match probe.check().await {
                        Ok(ProbeVerdict::Gone) => break,
                        Ok(verdict) => debug!(?verdict, "Probe finished"),
                        Err(e) => warn!(error = %e, "Probe failed"),
                    }
                    tokio::select! {
                        _ = token.cancelled() => break,
                        _ = tokio::time::sleep(interval) => {}
                    }
                }
            }
            .instrument(span),
        );
    }
}

#[async_trait]
impl Monitor for DeploymentMonitor {
    async fn start(&self, cancel: CancellationToken) -> Result<()> {
        info!(interval = ?self.config.interval, "Monitor started");
        let mut ticker = tokio::time::interval(self.config.interval);
        let mut failures = 0u32;

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {}
            }

            match self.poll(&cancel).await {
                Ok(probes) => {
                    failures = 0;
                    debug!(probes, "Monitor poll finished");
                }
                Err(e) => {
                    failures += 1;
                    warn!(error = %e, failures, "Monitor poll failed");
                    if failures >= self.config.max_failures {
                        error!(failures, "Monitor giving up");
                        self.routines.cancel_all();
                        return Err(Error::MonitorError(format!(
                            "{failures} consecutive polls failed, last error: {e}"
                        )));
                    }
                }
            }
        }

        self.routines.cancel_all();
        info!("Monitor stopped");
        Ok(())
    }
}

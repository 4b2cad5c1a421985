//! Application of decoded lifecycle events
//!
//! Every handler is a sequence of independently idempotent steps, so a
//! redelivered message converges to the same state no matter where a previous
//! attempt stopped.

use std::sync::Arc;

use serde_json::{Map, Value};
use tracing::{debug, info, instrument, warn};

use super::metrics;
use crate::deployer::{is_live, Deployer};
use crate::error::Result;
use crate::events::DeploymentEvent;
use crate::sink::{DeploymentUpdate, SinkConfig, SinkState};
use crate::store::{DeploymentLedger, StatusCache};

#[derive(Clone)]
pub struct LifecycleHandler {
    ledger: Arc<dyn DeploymentLedger>,
    status: Arc<dyn StatusCache>,
    deployer: Arc<dyn Deployer>,
}

impl LifecycleHandler {
    pub fn new(
        ledger: Arc<dyn DeploymentLedger>,
        status: Arc<dyn StatusCache>,
        deployer: Arc<dyn Deployer>,
    ) -> Self {
        Self {
            ledger,
            status,
            deployer,
        }
    }

    /// Apply one event. An error leaves the message unacknowledged.
    pub async fn handle(&self, event: &DeploymentEvent) -> Result<()> {
        if event.sink_id().is_empty() {
            warn!(operation = event.operation(), "Event carries no sink id, skipping");
            return Ok(());
        }

        match event {
            DeploymentEvent::SinkRemoved { sink_id } => self.sink_removed(sink_id).await,
            DeploymentEvent::SinkDisconnected {
                channel_id,
                sink_id,
            } => {
                debug!(channel_id, "Sink disconnected from channel");
                self.deactivate(sink_id).await
            }
            DeploymentEvent::ChannelUpdated { id, name, metadata } => {
                self.config_updated(id, name, metadata).await
            }
            DeploymentEvent::ChannelRemoved { id } => self.deactivate(id).await,
        }
    }

    /// Tear down everything for a deleted sink. The ledger record goes last so
    /// an interrupted attempt still finds it on redelivery.
    #[instrument(skip(self))]
    async fn sink_removed(&self, sink_id: &str) -> Result<()> {
        let record = self.ledger.get(sink_id).await?;
        self.deployer.remove_deployment(sink_id).await?;

        if let Some(record) = &record {
            self.status
                .set(
                    &record.owner_id,
                    sink_id,
                    SinkState::Inactive,
                    &record.config_snapshot(),
                )
                .await?;
        }

        self.ledger.remove(sink_id).await?;
        info!(had_record = record.is_some(), "Sink removed");
        Ok(())
    }

    /// Stop the collector but keep the record, marked inactive
    #[instrument(skip(self))]
    async fn deactivate(&self, sink_id: &str) -> Result<()> {
        self.deployer.remove_deployment(sink_id).await?;
        self.ledger
            .update(sink_id, DeploymentUpdate::state(SinkState::Inactive))
            .await?;

        match self.ledger.get(sink_id).await? {
            Some(record) => {
                self.status
                    .set(
                        &record.owner_id,
                        sink_id,
                        SinkState::Inactive,
                        &record.config_snapshot(),
                    )
                    .await?;
                info!(owner_id = %record.owner_id, "Sink deactivated");
            }
            None => debug!("No ledger record, nothing to mark inactive"),
        }
        Ok(())
    }

    /// Store the new config and re-apply a running collector so the cluster
    /// follows the ledger. Status goes back to `unknown` until a probe
    /// confirms the collector again.
    #[instrument(skip(self, metadata))]
    async fn config_updated(
        &self,
        sink_id: &str,
        name: &str,
        metadata: &Map<String, Value>,
    ) -> Result<()> {
        let config = SinkConfig::from_map(metadata.clone());
        if let Err(e) = config
            .validate()
            .and_then(|()| self.deployer.ensure_backend(&config.backend))
        {
            warn!(error = %e, "Ignoring invalid sink configuration update");
            return Ok(());
        }

        let Some(mut record) = self.ledger.get(sink_id).await? else {
            debug!("No ledger record, ignoring configuration update");
            return Ok(());
        };

        let update = DeploymentUpdate::config(config.clone());
        self.ledger.update(sink_id, update.clone()).await?;
        update.apply_to(&mut record);

        let running = record.state == SinkState::Active
            || is_live(&self.deployer.list_live_deployments().await?, sink_id);
        if running {
            self.deployer
                .create_deployment(&record.owner_id, sink_id, &record)
                .await?;
            metrics::inc_deployment_created("channel_update");
            debug!("Re-applied collector with updated configuration");
        }

        self.status
            .set(&record.owner_id, sink_id, SinkState::Unknown, &config)
            .await?;

        info!(owner_id = %record.owner_id, reapplied = running, "Sink configuration updated");
        Ok(())
    }
}

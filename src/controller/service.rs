//! Service lifecycle
//!
//! Bootstrap runs to completion first. Only then do the consumers and the
//! monitor start, each as its own task under the one root token. A monitor
//! failure cancels the root token and becomes the service's exit error.

use std::sync::Arc;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use super::bootstrap::{BootstrapReport, Reconciler};
use super::consumer::EventConsumer;
use super::monitor::Monitor;
use crate::error::{Error, Result};

pub struct Service {
    reconciler: Reconciler,
    consumers: Vec<Arc<EventConsumer>>,
    monitor: Arc<dyn Monitor>,
}

/// Background tasks of a started service
pub struct RunningService {
    pub report: BootstrapReport,
    cancel: CancellationToken,
    consumers: Vec<JoinHandle<Result<()>>>,
    monitor: JoinHandle<Result<()>>,
}

impl Service {
    pub fn new(
        reconciler: Reconciler,
        consumers: Vec<EventConsumer>,
        monitor: Arc<dyn Monitor>,
    ) -> Self {
        Self {
            reconciler,
            consumers: consumers.into_iter().map(Arc::new).collect(),
            monitor,
        }
    }

    /// Reconcile, then spawn the consumers and the monitor.
    ///
    /// Fails if the registry or deployer cannot be reached during bootstrap.
    pub async fn start(&self, cancel: CancellationToken) -> Result<RunningService> {
        let report = self.reconciler.reconcile().await?;

        let consumers = self
            .consumers
            .iter()
            .map(|consumer| {
                let consumer = consumer.clone();
                let token = cancel.clone();
                tokio::spawn(async move { consumer.run(token).await })
            })
            .collect();

        let monitor = self.monitor.clone();
        let root = cancel.clone();
        let monitor = tokio::spawn(async move {
            let result = monitor.start(root.clone()).await;
            if let Err(e) = &result {
                error!(error = %e, "Monitor failed, shutting down");
                root.cancel();
            }
            result
        });

        info!(consumers = self.consumers.len(), "Service started");
        Ok(RunningService {
            report,
            cancel,
            consumers,
            monitor,
        })
    }

    /// Start and wait until the root token is cancelled
    pub async fn run(&self, cancel: CancellationToken) -> Result<()> {
        self.start(cancel).await?.wait().await
    }
}

impl RunningService {
    /// Wait for shutdown. Returns the monitor's error if it caused it.
    pub async fn wait(self) -> Result<()> {
        self.cancel.cancelled().await;

        for handle in self.consumers {
            match handle.await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => warn!(error = %e, "Consumer exited with error"),
                Err(e) => warn!(error = %e, "Consumer task panicked"),
            }
        }

        let result = match self.monitor.await {
            Ok(result) => result,
            Err(e) => Err(Error::MonitorError(format!("monitor task failed: {e}"))),
        };
        info!("Service stopped");
        result
    }
}

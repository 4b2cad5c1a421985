//! Durable-log consumer
//!
//! One [`EventConsumer`] per subscription. On start it first replays entries
//! this consumer read earlier but never acknowledged, then follows new
//! entries. Each message is acknowledged individually after its handler
//! succeeds; a handler failure stops the batch so nothing after it is
//! acknowledged out of order.

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::backoff::{Backoff, BackoffConfig};
use super::handlers::LifecycleHandler;
use super::health::HealthState;
use super::metrics;
use crate::error::Result;
use crate::events::{DeploymentEvent, EventLog, LogMessage, ReadCursor, StreamKind};

pub const SINKS_STREAM: &str = "mainflux.things";
pub const CHANNELS_STREAM: &str = "mainflux.channels";
pub const CONSUMER_GROUP: &str = "orb.maestro";

pub const DEFAULT_BATCH_SIZE: usize = 100;
pub const DEFAULT_BLOCK: Duration = Duration::from_secs(5);

#[derive(Clone, Debug)]
pub struct ConsumerConfig {
    pub kind: StreamKind,
    pub stream: String,
    pub group: String,
    /// Consumer name within the group; pending entries are tracked per name
    pub consumer: String,
    pub batch_size: usize,
    /// Longest a single read waits for new entries
    pub block: Duration,
    pub backoff: BackoffConfig,
}

impl ConsumerConfig {
    pub fn for_sinks(consumer: &str) -> Self {
        Self::new(StreamKind::SinkLifecycle, SINKS_STREAM, consumer)
    }

    pub fn for_channels(consumer: &str) -> Self {
        Self::new(StreamKind::Channels, CHANNELS_STREAM, consumer)
    }

    fn new(kind: StreamKind, stream: &str, consumer: &str) -> Self {
        Self {
            kind,
            stream: stream.to_string(),
            group: CONSUMER_GROUP.to_string(),
            consumer: consumer.to_string(),
            batch_size: DEFAULT_BATCH_SIZE,
            block: DEFAULT_BLOCK,
            backoff: BackoffConfig::default(),
        }
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    pub fn with_block(mut self, block: Duration) -> Self {
        self.block = block;
        self
    }

    pub fn with_backoff(mut self, backoff: BackoffConfig) -> Self {
        self.backoff = backoff;
        self
    }

    /// Key under which this consumer reports degradation
    pub fn health_component(&self) -> String {
        format!("consumer:{}", self.kind.label())
    }
}

/// What happened to one batch
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct BatchOutcome {
    /// Messages handled and acknowledged
    pub applied: usize,
    /// Unknown operations acknowledged without a handler
    pub ignored: usize,
    /// Id of the message whose handler failed; it and later ones stay pending
    pub failed_at: Option<String>,
}

pub struct EventConsumer {
    log: Arc<dyn EventLog>,
    handler: LifecycleHandler,
    config: ConsumerConfig,
    health: HealthState,
}

impl EventConsumer {
    pub fn new(
        log: Arc<dyn EventLog>,
        handler: LifecycleHandler,
        config: ConsumerConfig,
        health: HealthState,
    ) -> Self {
        Self {
            log,
            handler,
            config,
            health,
        }
    }

    pub fn config(&self) -> &ConsumerConfig {
        &self.config
    }

    /// Consume until `cancel` fires. Read failures are retried with backoff,
    /// so this only returns on cancellation.
    pub async fn run(&self, cancel: CancellationToken) -> Result<()> {
        let stream = self.config.stream.as_str();
        let component = self.config.health_component();
        let mut backoff = Backoff::new(self.config.backoff);

        if !self.ensure_group(&cancel, &mut backoff).await {
            return Ok(());
        }
        info!(stream, consumer = %self.config.consumer, "Consumer started");

        let mut cursor = ReadCursor::pending_from_start();
        loop {
            let read = tokio::select! {
                _ = cancel.cancelled() => break,
                read = self.log.read_group(
                    stream,
                    &self.config.group,
                    &self.config.consumer,
                    &cursor,
                    self.config.batch_size,
                    self.config.block,
                ) => read,
            };

            let messages = match read {
                Ok(messages) => {
                    if backoff.attempt() > 0 {
                        info!(stream, "Read recovered");
                        self.health.mark_healthy(&component);
                        backoff.reset();
                    }
                    messages
                }
                Err(e) => {
                    metrics::inc_read_error(self.config.kind.label());
                    self.health.mark_degraded(&component, e.to_string());
                    let delay = backoff.next_delay();
                    warn!(
                        stream,
                        error = %e,
                        attempt = backoff.attempt(),
                        ?delay,
                        "Read failed, backing off"
                    );
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        _ = tokio::time::sleep(delay) => continue,
                    }
                }
            };

            if messages.is_empty() {
                if matches!(cursor, ReadCursor::PendingAfter(_)) {
                    debug!(stream, "Pending entries drained");
                    cursor = ReadCursor::New;
                }
                continue;
            }

            if let (ReadCursor::PendingAfter(_), Some(last)) = (&cursor, messages.last()) {
                cursor = ReadCursor::PendingAfter(last.id.clone());
            }

            let outcome = self.process_batch(&messages, &cancel).await;
            debug!(
                stream,
                applied = outcome.applied,
                ignored = outcome.ignored,
                failed_at = ?outcome.failed_at,
                "Batch processed"
            );
        }

        info!(stream, "Consumer stopped");
        Ok(())
    }

    /// Create the group, retrying until it succeeds. False if cancelled first.
    async fn ensure_group(&self, cancel: &CancellationToken, backoff: &mut Backoff) -> bool {
        let stream = self.config.stream.as_str();
        let component = self.config.health_component();
        loop {
            let created = tokio::select! {
                _ = cancel.cancelled() => return false,
                created = self.log.ensure_group(stream, &self.config.group) => created,
            };
            match created {
                Ok(()) => {
                    self.health.mark_healthy(&component);
                    backoff.reset();
                    return true;
                }
                Err(e) => {
                    self.health.mark_degraded(&component, e.to_string());
                    let delay = backoff.next_delay();
                    warn!(stream, error = %e, ?delay, "Creating consumer group failed");
                    tokio::select! {
                        _ = cancel.cancelled() => return false,
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
            }
        }
    }

    /// Handle messages in log order, acknowledging each on success
    pub async fn process_batch(
        &self,
        messages: &[LogMessage],
        cancel: &CancellationToken,
    ) -> BatchOutcome {
        let stream = self.config.stream.as_str();
        let label = self.config.kind.label();
        let mut outcome = BatchOutcome::default();

        for msg in messages {
            if cancel.is_cancelled() {
                break;
            }

            let Some(event) = DeploymentEvent::decode(self.config.kind, msg) else {
                debug!(
                    stream,
                    id = %msg.id,
                    operation = msg.operation(),
                    "Ignoring unknown operation"
                );
                metrics::inc_event(label, msg.operation(), "ignored");
                self.ack(msg).await;
                outcome.ignored += 1;
                continue;
            };

            match self.handler.handle(&event).await {
                Ok(()) => {
                    metrics::inc_event(label, event.operation(), "applied");
                    self.ack(msg).await;
                    outcome.applied += 1;
                }
                Err(e) => {
                    metrics::inc_event(label, event.operation(), "failed");
                    error!(
                        stream,
                        id = %msg.id,
                        operation = event.operation(),
                        sink_id = event.sink_id(),
                        error = %e,
                        "Handler failed, leaving remaining messages pending"
                    );
                    outcome.failed_at = Some(msg.id.clone());
                    break;
                }
            }
        }

        outcome
    }

    async fn ack(&self, msg: &LogMessage) {
        if let Err(e) = self
            .log
            .ack(&self.config.stream, &self.config.group, &msg.id)
            .await
        {
            warn!(
                stream = %self.config.stream,
                id = %msg.id,
                error = %e,
                "Failed to acknowledge message"
            );
        }
    }
}

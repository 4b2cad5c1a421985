//! Tests for the durable-log consumer and the lifecycle handlers
//!
//! These tests verify:
//! - Per-message acknowledgement and batch halting on handler failure
//! - Unknown operations are acknowledged without side effects
//! - Replayed removals converge (at-least-once delivery)
//! - Unacknowledged messages are redelivered to a restarted consumer
//! - Read failures back off and mark the consumer degraded

#[cfg(test)]
mod tests {
    use super::super::backoff::BackoffConfig;
    use super::super::consumer::*;
    use super::super::handlers::LifecycleHandler;
    use super::super::health::HealthState;
    use crate::deployer::Deployer;
    use crate::events::{EventLog, LogMessage, ReadCursor};
    use crate::sink::{DeploymentRecord, SinkConfig, SinkState};
    use crate::store::{DeploymentLedger, MemoryLedger, MemoryStatusCache, StatusCache};
    use crate::testing::{FakeDeployer, MemoryEventLog};
    use std::sync::Arc;
    use std::time::Duration;
    use tokio_util::sync::CancellationToken;

    const CONSUMER: &str = "maestro-0";

    struct Harness {
        log: Arc<MemoryEventLog>,
        ledger: Arc<MemoryLedger>,
        status: Arc<MemoryStatusCache>,
        deployer: Arc<FakeDeployer>,
        health: HealthState,
    }

    impl Harness {
        fn new() -> Self {
            Self::with_deployer(FakeDeployer::new())
        }

        fn with_deployer(deployer: FakeDeployer) -> Self {
            Self {
                log: Arc::new(MemoryEventLog::new()),
                ledger: Arc::new(MemoryLedger::new()),
                status: Arc::new(MemoryStatusCache::new()),
                deployer: Arc::new(deployer),
                health: HealthState::new(),
            }
        }

        /// Same stores and log, different deployer
        fn restarted_with(&self, deployer: FakeDeployer) -> Self {
            Self {
                log: self.log.clone(),
                ledger: self.ledger.clone(),
                status: self.status.clone(),
                deployer: Arc::new(deployer),
                health: HealthState::new(),
            }
        }

        fn consumer(&self, config: ConsumerConfig) -> EventConsumer {
            let handler = LifecycleHandler::new(
                self.ledger.clone(),
                self.status.clone(),
                self.deployer.clone(),
            );
            EventConsumer::new(self.log.clone(), handler, config, self.health.clone())
        }

        async fn seed(&self, sink_id: &str) -> DeploymentRecord {
            let config =
                SinkConfig::parse_validated(br#"{"url":"http://prom","user":"u","password":"p"}"#)
                    .unwrap();
            let record = DeploymentRecord::new(sink_id, "o1", &config, SinkState::Active);
            self.ledger.create(record.clone()).await.unwrap();
            self.deployer
                .create_deployment("o1", sink_id, &record)
                .await
                .unwrap();
            record
        }

        /// Create the group and deliver everything appended so far to `CONSUMER`
        async fn deliver(&self, stream: &str, appended: &[&[(&str, &str)]]) -> Vec<LogMessage> {
            self.log.ensure_group(stream, CONSUMER_GROUP).await.unwrap();
            for fields in appended {
                self.log.append(stream, fields);
            }
            self.log
                .read_group(
                    stream,
                    CONSUMER_GROUP,
                    CONSUMER,
                    &ReadCursor::New,
                    DEFAULT_BATCH_SIZE,
                    Duration::from_millis(1),
                )
                .await
                .unwrap()
        }
    }

    fn fast(config: ConsumerConfig) -> ConsumerConfig {
        config
            .with_block(Duration::from_millis(10))
            .with_backoff(BackoffConfig {
                base: Duration::from_millis(1),
                max: Duration::from_millis(10),
                ..Default::default()
            })
    }

    /// Run a consumer in the background until `done` holds, then stop it
    async fn run_until<F>(consumer: EventConsumer, done: F)
    where
        F: Fn() -> bool,
    {
        let consumer = Arc::new(consumer);
        let cancel = CancellationToken::new();
        let task = {
            let consumer = consumer.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move { consumer.run(cancel).await })
        };

        let waited = tokio::time::timeout(Duration::from_secs(5), async {
            while !done() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await;

        cancel.cancel();
        task.await.unwrap().unwrap();
        waited.expect("condition not reached before timeout");
    }

    // ── batch processing ───────────────────────────────────────────────────

    #[tokio::test]
    async fn test_unknown_operation_is_acked_without_handler() {
        let h = Harness::new();
        let msgs = h
            .deliver(SINKS_STREAM, &[&[("operation", "thing.create"), ("id", "s1")]])
            .await;

        let outcome = h
            .consumer(ConsumerConfig::for_sinks(CONSUMER))
            .process_batch(&msgs, &CancellationToken::new())
            .await;

        assert_eq!(outcome.ignored, 1);
        assert_eq!(outcome.applied, 0);
        assert!(h.log.pending_ids(SINKS_STREAM, CONSUMER_GROUP).is_empty());
        assert!(h.deployer.calls().is_empty());
    }

    #[tokio::test]
    async fn test_channel_operations_on_sink_stream_are_ignored() {
        let h = Harness::new();
        h.seed("s1").await;
        let msgs = h
            .deliver(SINKS_STREAM, &[&[("operation", "channel.remove"), ("id", "s1")]])
            .await;

        let outcome = h
            .consumer(ConsumerConfig::for_sinks(CONSUMER))
            .process_batch(&msgs, &CancellationToken::new())
            .await;

        assert_eq!(outcome.ignored, 1);
        assert_eq!(
            h.ledger.get("s1").await.unwrap().unwrap().state,
            SinkState::Active
        );
    }

    #[tokio::test]
    async fn test_sink_removal_replay_converges() {
        let h = Harness::new();
        h.seed("s1").await;
        let remove: &[(&str, &str)] = &[("operation", "thing.remove"), ("id", "s1")];
        let msgs = h.deliver(SINKS_STREAM, &[remove, remove]).await;

        let outcome = h
            .consumer(ConsumerConfig::for_sinks(CONSUMER))
            .process_batch(&msgs, &CancellationToken::new())
            .await;

        assert_eq!(outcome.applied, 2);
        assert!(outcome.failed_at.is_none());
        assert!(h.ledger.get("s1").await.unwrap().is_none());
        assert!(h.deployer.live().is_empty());
        assert_eq!(h.deployer.removals(), vec!["s1", "s1"]);
        assert_eq!(
            h.status.get("o1", "s1").await.unwrap().unwrap().state,
            SinkState::Inactive
        );
        assert!(h.log.pending_ids(SINKS_STREAM, CONSUMER_GROUP).is_empty());
    }

    #[tokio::test]
    async fn test_handler_failure_halts_batch() {
        let h = Harness::new();
        h.seed("s1").await;
        h.seed("s2").await;
        h.deployer.fail_remove_for("s1");

        let msgs = h
            .deliver(
                SINKS_STREAM,
                &[
                    &[("operation", "thing.remove"), ("id", "s1")],
                    &[("operation", "thing.remove"), ("id", "s2")],
                ],
            )
            .await;

        let outcome = h
            .consumer(ConsumerConfig::for_sinks(CONSUMER))
            .process_batch(&msgs, &CancellationToken::new())
            .await;

        assert_eq!(outcome.applied, 0);
        assert_eq!(outcome.failed_at.as_deref(), Some(msgs[0].id.as_str()));
        assert_eq!(
            h.log.pending_ids(SINKS_STREAM, CONSUMER_GROUP),
            vec![msgs[0].id.clone(), msgs[1].id.clone()]
        );
        // Nothing after the failure was applied
        assert!(h.ledger.get("s2").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_failure_mid_batch_keeps_earlier_acks() {
        let h = Harness::new();
        h.seed("s1").await;
        h.seed("s2").await;
        h.seed("s3").await;
        h.deployer.fail_remove_for("s2");

        let msgs = h
            .deliver(
                SINKS_STREAM,
                &[
                    &[("operation", "thing.remove"), ("id", "s1")],
                    &[("operation", "thing.remove"), ("id", "s2")],
                    &[("operation", "thing.remove"), ("id", "s3")],
                ],
            )
            .await;

        let outcome = h
            .consumer(ConsumerConfig::for_sinks(CONSUMER))
            .process_batch(&msgs, &CancellationToken::new())
            .await;

        assert_eq!(outcome.applied, 1);
        assert_eq!(outcome.failed_at.as_deref(), Some(msgs[1].id.as_str()));
        assert_eq!(
            h.log.pending_ids(SINKS_STREAM, CONSUMER_GROUP),
            vec![msgs[1].id.clone(), msgs[2].id.clone()]
        );
        assert!(h.ledger.get("s1").await.unwrap().is_none());
        assert!(h.ledger.get("s2").await.unwrap().is_some());
        // The message after the failure never reached the handler
        assert!(h.ledger.get("s3").await.unwrap().is_some());
        assert_eq!(h.deployer.removals(), vec!["s1"]);
    }

    #[tokio::test]
    async fn test_sink_disconnect_marks_record_inactive() {
        let h = Harness::new();
        h.seed("s1").await;
        let msgs = h
            .deliver(
                SINKS_STREAM,
                &[&[
                    ("operation", "thing.disconnect"),
                    ("chan_id", "c1"),
                    ("thing_id", "s1"),
                ]],
            )
            .await;

        let outcome = h
            .consumer(ConsumerConfig::for_sinks(CONSUMER))
            .process_batch(&msgs, &CancellationToken::new())
            .await;

        assert_eq!(outcome.applied, 1);
        assert_eq!(
            h.ledger.get("s1").await.unwrap().unwrap().state,
            SinkState::Inactive
        );
        assert_eq!(
            h.status.get("o1", "s1").await.unwrap().unwrap().state,
            SinkState::Inactive
        );
        assert!(h.deployer.live().is_empty());
    }

    type Fields = [(&'static str, &'static str); 4];

    fn channel_update(sink_id: &'static str, metadata: &'static str) -> Fields {
        [
            ("operation", "channel.update"),
            ("id", sink_id),
            ("name", "prod"),
            ("metadata", metadata),
        ]
    }

    #[tokio::test]
    async fn test_channel_update_rewrites_record_and_reapplies_collector() {
        let h = Harness::new();
        h.seed("s1").await;
        let metadata = r#"{
            "url": "http://mimir/api/v1/push",
            "user": "u2",
            "password": "p2",
            "headers": {"X-Scope-OrgID": "t1"}
        }"#;
        let msgs = h
            .deliver(CHANNELS_STREAM, &[&channel_update("s1", metadata)])
            .await;

        let outcome = h
            .consumer(ConsumerConfig::for_channels(CONSUMER))
            .process_batch(&msgs, &CancellationToken::new())
            .await;
        assert_eq!(outcome.applied, 1);

        let record = h.ledger.get("s1").await.unwrap().unwrap();
        assert_eq!(record.endpoint, "http://mimir/api/v1/push");
        assert_eq!(record.credentials.user, "u2");
        assert!(record.metadata.contains_key("headers"));

        // Seeding applied once; the update applies the new config again
        let creates = h.deployer.creates();
        assert_eq!(creates.len(), 2);
        let (_, _, applied) = &creates[1];
        assert_eq!(applied.endpoint, "http://mimir/api/v1/push");
        assert_eq!(applied.credentials.user, "u2");
        assert_eq!(applied.credentials.password, "p2");

        let status = h.status.get("o1", "s1").await.unwrap().unwrap();
        assert_eq!(status.state, SinkState::Unknown);
        assert_eq!(status.snapshot.url, "http://mimir/api/v1/push");
    }

    #[tokio::test]
    async fn test_channel_update_of_stopped_sink_only_rewrites_record() {
        let h = Harness::new();
        let config = SinkConfig::parse_validated(br#"{"url":"http://prom"}"#).unwrap();
        h.ledger
            .create(DeploymentRecord::new("s1", "o1", &config, SinkState::Inactive))
            .await
            .unwrap();
        let msgs = h
            .deliver(
                CHANNELS_STREAM,
                &[&channel_update("s1", r#"{"url":"http://other"}"#)],
            )
            .await;

        h.consumer(ConsumerConfig::for_channels(CONSUMER))
            .process_batch(&msgs, &CancellationToken::new())
            .await;

        assert_eq!(h.ledger.get("s1").await.unwrap().unwrap().endpoint, "http://other");
        assert!(h.deployer.creates().is_empty());
    }

    #[tokio::test]
    async fn test_channel_update_with_unsupported_backend_is_skipped() {
        let h = Harness::new();
        let seeded = h.seed("s1").await;
        let msgs = h
            .deliver(
                CHANNELS_STREAM,
                &[&channel_update("s1", r#"{"url":"http://influx","backend":"influx"}"#)],
            )
            .await;

        let outcome = h
            .consumer(ConsumerConfig::for_channels(CONSUMER))
            .process_batch(&msgs, &CancellationToken::new())
            .await;

        assert_eq!(outcome.applied, 1);
        assert!(h.log.pending_ids(CHANNELS_STREAM, CONSUMER_GROUP).is_empty());
        assert_eq!(h.ledger.get("s1").await.unwrap().unwrap(), seeded);
        assert_eq!(h.deployer.creates().len(), 1);
    }

    #[tokio::test]
    async fn test_invalid_channel_update_is_acked_without_write() {
        let h = Harness::new();
        let seeded = h.seed("s1").await;
        let msgs = h
            .deliver(
                CHANNELS_STREAM,
                &[&[
                    ("operation", "channel.update"),
                    ("id", "s1"),
                    ("metadata", "{not json"),
                ]],
            )
            .await;

        let outcome = h
            .consumer(ConsumerConfig::for_channels(CONSUMER))
            .process_batch(&msgs, &CancellationToken::new())
            .await;

        assert_eq!(outcome.applied, 1);
        assert!(h.log.pending_ids(CHANNELS_STREAM, CONSUMER_GROUP).is_empty());
        assert_eq!(h.ledger.get("s1").await.unwrap().unwrap(), seeded);
        assert!(h.status.get("o1", "s1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_channel_remove_deactivates_sink() {
        let h = Harness::new();
        h.seed("s1").await;
        let msgs = h
            .deliver(
                CHANNELS_STREAM,
                &[&[("operation", "channel.remove"), ("id", "s1")]],
            )
            .await;

        h.consumer(ConsumerConfig::for_channels(CONSUMER))
            .process_batch(&msgs, &CancellationToken::new())
            .await;

        assert_eq!(
            h.ledger.get("s1").await.unwrap().unwrap().state,
            SinkState::Inactive
        );
        assert_eq!(h.deployer.removals(), vec!["s1"]);
    }

    #[tokio::test]
    async fn test_disconnect_on_channel_stream_deactivates_sink() {
        let h = Harness::new();
        h.seed("s1").await;
        let msgs = h
            .deliver(
                CHANNELS_STREAM,
                &[&[
                    ("operation", "thing.disconnect"),
                    ("chan_id", "c1"),
                    ("thing_id", "s1"),
                ]],
            )
            .await;

        let outcome = h
            .consumer(ConsumerConfig::for_channels(CONSUMER))
            .process_batch(&msgs, &CancellationToken::new())
            .await;

        assert_eq!(outcome.applied, 1);
        assert_eq!(outcome.ignored, 0);
        assert_eq!(
            h.ledger.get("s1").await.unwrap().unwrap().state,
            SinkState::Inactive
        );
        assert!(h.deployer.live().is_empty());
    }

    #[tokio::test]
    async fn test_event_without_sink_id_is_skipped() {
        let h = Harness::new();
        let msgs = h
            .deliver(SINKS_STREAM, &[&[("operation", "thing.remove")]])
            .await;

        let outcome = h
            .consumer(ConsumerConfig::for_sinks(CONSUMER))
            .process_batch(&msgs, &CancellationToken::new())
            .await;

        assert_eq!(outcome.applied, 1);
        assert!(h.deployer.calls().is_empty());
    }

    // ── run loop ───────────────────────────────────────────────────────────

    #[tokio::test]
    async fn test_run_applies_new_messages() {
        let h = Harness::new();
        h.seed("s1").await;
        h.log
            .ensure_group(SINKS_STREAM, CONSUMER_GROUP)
            .await
            .unwrap();
        h.log
            .append(SINKS_STREAM, &[("operation", "thing.remove"), ("id", "s1")]);

        let ledger = h.ledger.clone();
        run_until(h.consumer(fast(ConsumerConfig::for_sinks(CONSUMER))), || {
            ledger.try_is_empty()
        })
        .await;

        assert!(h.log.pending_ids(SINKS_STREAM, CONSUMER_GROUP).is_empty());
    }

    #[tokio::test]
    async fn test_group_starts_at_stream_tail() {
        let h = Harness::new();
        h.seed("s1").await;
        h.log
            .append(SINKS_STREAM, &[("operation", "thing.remove"), ("id", "s1")]);

        let log = h.log.clone();
        run_until(h.consumer(fast(ConsumerConfig::for_sinks(CONSUMER))), || {
            log.read_count() >= 3
        })
        .await;

        assert!(h.ledger.get("s1").await.unwrap().is_some());
        assert!(h.deployer.removals().is_empty());
    }

    #[tokio::test]
    async fn test_unacked_message_is_redelivered_after_restart() {
        let failing = FakeDeployer::new();
        failing.fail_remove_for("s1");
        let first = Harness::with_deployer(failing);
        first.ledger.create(seed_record("s1")).await.unwrap();

        let msgs = first
            .deliver(SINKS_STREAM, &[&[("operation", "thing.remove"), ("id", "s1")]])
            .await;
        let outcome = first
            .consumer(ConsumerConfig::for_sinks(CONSUMER))
            .process_batch(&msgs, &CancellationToken::new())
            .await;
        assert!(outcome.failed_at.is_some());
        assert_eq!(first.log.pending_ids(SINKS_STREAM, CONSUMER_GROUP).len(), 1);

        // Same consumer name, healthy deployer
        let second = first.restarted_with(FakeDeployer::new());
        let log = second.log.clone();
        run_until(
            second.consumer(fast(ConsumerConfig::for_sinks(CONSUMER))),
            || log.pending_ids(SINKS_STREAM, CONSUMER_GROUP).is_empty(),
        )
        .await;

        assert!(second.ledger.get("s1").await.unwrap().is_none());
        assert_eq!(second.deployer.removals(), vec!["s1"]);
    }

    #[tokio::test]
    async fn test_read_errors_degrade_then_recover() {
        let h = Harness::new();
        h.seed("s1").await;
        h.log
            .ensure_group(SINKS_STREAM, CONSUMER_GROUP)
            .await
            .unwrap();
        h.log.fail_next_reads(1_000);

        let health = h.health.clone();
        let log = h.log.clone();
        let consumer = Arc::new(h.consumer(fast(ConsumerConfig::for_sinks(CONSUMER))));
        let cancel = CancellationToken::new();
        let task = {
            let consumer = consumer.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move { consumer.run(cancel).await })
        };

        tokio::time::timeout(Duration::from_secs(5), async {
            while health.is_healthy() {
                tokio::time::sleep(Duration::from_millis(2)).await;
            }
        })
        .await
        .unwrap();
        assert!(health.degraded().contains_key("consumer:sinks"));

        log.fail_next_reads(0);
        log.append(SINKS_STREAM, &[("operation", "thing.remove"), ("id", "s1")]);
        let ledger = h.ledger.clone();
        tokio::time::timeout(Duration::from_secs(5), async {
            while !ledger.try_is_empty() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();

        assert!(health.is_healthy());
        cancel.cancel();
        task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_cancelled_consumer_returns() {
        let h = Harness::new();
        let cancel = CancellationToken::new();
        cancel.cancel();

        let result = tokio::time::timeout(
            Duration::from_secs(1),
            h.consumer(ConsumerConfig::for_sinks(CONSUMER)).run(cancel),
        )
        .await
        .unwrap();
        assert!(result.is_ok());
    }

    fn seed_record(sink_id: &str) -> DeploymentRecord {
        let config = SinkConfig::parse_validated(br#"{"url":"http://prom"}"#).unwrap();
        DeploymentRecord::new(sink_id, "o1", &config, SinkState::Active)
    }

    #[test]
    fn test_consumer_config_defaults() {
        let sinks = ConsumerConfig::for_sinks("host-a");
        assert_eq!(sinks.stream, "mainflux.things");
        assert_eq!(sinks.group, "orb.maestro");
        assert_eq!(sinks.batch_size, 100);
        assert_eq!(sinks.block, Duration::from_secs(5));

        let channels = ConsumerConfig::for_channels("host-a").with_batch_size(0);
        assert_eq!(channels.stream, "mainflux.channels");
        assert_eq!(channels.batch_size, 1);
        assert_eq!(channels.health_component(), "consumer:channels");
    }
}

//! Redis Streams implementation of [`EventLog`]

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::streams::{StreamReadOptions, StreamReadReply};
use redis::{AsyncCommands, RedisError, Value};
use tracing::{debug, info};

use super::{EventLog, LogMessage, ReadCursor};
use crate::error::Result;

/// Group start position: only entries appended after the group is created
const GROUP_START_TAIL: &str = "$";

/// Reply code Redis sends when the group already exists
const BUSYGROUP: &str = "BUSYGROUP";

/// Event log over one Redis connection.
///
/// Blocking `XREADGROUP` calls occupy the connection until they return, so
/// every subscription gets its own instance.
#[derive(Clone)]
pub struct RedisEventLog {
    conn: ConnectionManager,
}

impl RedisEventLog {
    pub fn new(conn: ConnectionManager) -> Self {
        Self { conn }
    }

    pub async fn connect(url: &str) -> Result<Self> {
        let client = redis::Client::open(url)?;
        let conn = client.get_connection_manager().await?;
        Ok(Self::new(conn))
    }
}

fn is_busy_group(err: &RedisError) -> bool {
    err.code() == Some(BUSYGROUP) || err.to_string().contains(BUSYGROUP)
}

/// Keep string-convertible fields; anything else is dropped and later read as empty
fn decode_fields(map: HashMap<String, Value>) -> HashMap<String, String> {
    map.into_iter()
        .filter_map(|(k, v)| redis::from_redis_value::<String>(&v).ok().map(|s| (k, s)))
        .collect()
}

#[async_trait]
impl EventLog for RedisEventLog {
    async fn ensure_group(&self, stream: &str, group: &str) -> Result<()> {
        let mut conn = self.conn.clone();
        let created: std::result::Result<(), RedisError> = conn
            .xgroup_create_mkstream(stream, group, GROUP_START_TAIL)
            .await;

        match created {
            Ok(()) => {
                info!(stream, group, "Created consumer group");
                Ok(())
            }
            Err(e) if is_busy_group(&e) => {
                debug!(stream, group, "Consumer group already exists");
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn read_group(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        cursor: &ReadCursor,
        count: usize,
        block: Duration,
    ) -> Result<Vec<LogMessage>> {
        let opts = StreamReadOptions::default()
            .group(group, consumer)
            .count(count)
            .block(block.as_millis() as usize);

        let mut conn = self.conn.clone();
        let reply: Option<StreamReadReply> = conn
            .xread_options(&[stream], &[cursor.as_stream_id()], &opts)
            .await?;

        let messages = reply
            .map(|reply| {
                reply
                    .keys
                    .into_iter()
                    .filter(|key| key.key == stream)
                    .flat_map(|key| key.ids)
                    .map(|entry| LogMessage {
                        id: entry.id,
                        fields: decode_fields(entry.map),
                    })
                    .collect()
            })
            .unwrap_or_default();

        Ok(messages)
    }

    async fn ack(&self, stream: &str, group: &str, id: &str) -> Result<()> {
        let mut conn = self.conn.clone();
        let _: i64 = conn.xack(stream, group, &[id]).await?;
        Ok(())
    }
}

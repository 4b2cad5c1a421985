//! Durable event log access and event decoding
//!
//! Sink lifecycle and channel changes arrive on Redis Streams read through
//! consumer groups. [`EventLog`] is the narrow protocol the consumers need;
//! [`DeploymentEvent`] is the typed form of a message.

mod redis_log;

pub use redis_log::RedisEventLog;

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{Map, Value};

use crate::error::Result;

/// Operation field present on every message
pub const OPERATION_FIELD: &str = "operation";

pub const THING_REMOVE: &str = "thing.remove";
pub const THING_DISCONNECT: &str = "thing.disconnect";
pub const CHANNEL_UPDATE: &str = "channel.update";
pub const CHANNEL_REMOVE: &str = "channel.remove";

/// One stream entry: its log position and string fields
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LogMessage {
    pub id: String,
    pub fields: HashMap<String, String>,
}

impl LogMessage {
    pub fn new(id: impl Into<String>, fields: &[(&str, &str)]) -> Self {
        Self {
            id: id.into(),
            fields: fields
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
        }
    }

    /// Field value, or empty string if absent
    pub fn field(&self, key: &str) -> &str {
        self.fields.get(key).map(String::as_str).unwrap_or_default()
    }

    pub fn operation(&self) -> &str {
        self.field(OPERATION_FIELD)
    }
}

/// Where a group read starts
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ReadCursor {
    /// Entries already delivered to this consumer but never acknowledged,
    /// with ids strictly greater than the given one (`"0"` for all)
    PendingAfter(String),
    /// Entries never delivered to any consumer of the group (`>`)
    New,
}

impl ReadCursor {
    pub fn pending_from_start() -> Self {
        ReadCursor::PendingAfter("0".to_string())
    }

    pub fn as_stream_id(&self) -> &str {
        match self {
            ReadCursor::PendingAfter(id) => id,
            ReadCursor::New => ">",
        }
    }
}

/// Consumer-group protocol over an ordered durable log
#[async_trait]
pub trait EventLog: Send + Sync {
    /// Create the group at the stream tail. An existing group is not an error.
    async fn ensure_group(&self, stream: &str, group: &str) -> Result<()>;

    /// Read up to `count` entries, waiting at most `block` for new ones
    async fn read_group(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        cursor: &ReadCursor,
        count: usize,
        block: Duration,
    ) -> Result<Vec<LogMessage>>;

    /// Acknowledge a single entry
    async fn ack(&self, stream: &str, group: &str, id: &str) -> Result<()>;
}

/// Which subscription a message was read from
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum StreamKind {
    /// Sink lifecycle stream (`thing.*` operations)
    SinkLifecycle,
    /// Tenant/channel status stream (`channel.*` and `thing.disconnect`)
    Channels,
}

impl StreamKind {
    pub fn label(&self) -> &'static str {
        match self {
            StreamKind::SinkLifecycle => "sinks",
            StreamKind::Channels => "channels",
        }
    }
}

/// Typed lifecycle change
#[derive(Clone, Debug, PartialEq)]
pub enum DeploymentEvent {
    /// The sink was deleted
    SinkRemoved { sink_id: String },
    /// The sink was disconnected from a channel
    SinkDisconnected { channel_id: String, sink_id: String },
    /// The channel carrying a sink's export configuration changed
    ChannelUpdated {
        id: String,
        name: String,
        metadata: Map<String, Value>,
    },
    /// The channel carrying a sink's export configuration was removed
    ChannelRemoved { id: String },
}

impl DeploymentEvent {
    /// Decode a message read from `kind`.
    ///
    /// Returns `None` for operations that stream does not carry. Fields are
    /// decoded permissively: anything missing or malformed becomes empty.
    pub fn decode(kind: StreamKind, msg: &LogMessage) -> Option<Self> {
        match (kind, msg.operation()) {
            (StreamKind::SinkLifecycle, THING_REMOVE) => Some(DeploymentEvent::SinkRemoved {
                sink_id: msg.field("id").to_string(),
            }),
            (_, THING_DISCONNECT) => {
                Some(DeploymentEvent::SinkDisconnected {
                    channel_id: msg.field("chan_id").to_string(),
                    sink_id: msg.field("thing_id").to_string(),
                })
            }
            (StreamKind::Channels, CHANNEL_UPDATE) => Some(DeploymentEvent::ChannelUpdated {
                id: msg.field("id").to_string(),
                name: msg.field("name").to_string(),
                metadata: decode_metadata(msg.fields.get("metadata").map(String::as_str)),
            }),
            (StreamKind::Channels, CHANNEL_REMOVE) => Some(DeploymentEvent::ChannelRemoved {
                id: msg.field("id").to_string(),
            }),
            _ => None,
        }
    }

    pub fn operation(&self) -> &'static str {
        match self {
            DeploymentEvent::SinkRemoved { .. } => THING_REMOVE,
            DeploymentEvent::SinkDisconnected { .. } => THING_DISCONNECT,
            DeploymentEvent::ChannelUpdated { .. } => CHANNEL_UPDATE,
            DeploymentEvent::ChannelRemoved { .. } => CHANNEL_REMOVE,
        }
    }

    /// Sink the event applies to
    pub fn sink_id(&self) -> &str {
        match self {
            DeploymentEvent::SinkRemoved { sink_id }
            | DeploymentEvent::SinkDisconnected { sink_id, .. } => sink_id,
            DeploymentEvent::ChannelUpdated { id, .. } | DeploymentEvent::ChannelRemoved { id } => {
                id
            }
        }
    }
}

fn decode_metadata(raw: Option<&str>) -> Map<String, Value> {
    match raw.map(serde_json::from_str::<Value>) {
        Some(Ok(Value::Object(map))) => map,
        _ => Map::new(),
    }
}

//! Sink status cache
//!
//! Secondary store recording the last-known derived state of every sink for
//! other consumers of the platform. Maestro only writes it; writes overwrite
//! unconditionally.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::Utc;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use tokio::sync::RwLock;

use crate::error::{Error, Result};
use crate::sink::{SinkConfig, SinkState, SinkStatus};

/// Namespace shared with the sinker service
pub const STATUS_KEY_PREFIX: &str = "sinker_key";

pub fn status_key(prefix: &str, owner_id: &str, sink_id: &str) -> String {
    format!("{prefix}-{owner_id}:{sink_id}")
}

#[async_trait]
pub trait StatusCache: Send + Sync {
    /// Overwrite the cached status of a sink
    async fn set(
        &self,
        owner_id: &str,
        sink_id: &str,
        state: SinkState,
        snapshot: &SinkConfig,
    ) -> Result<()>;

    async fn get(&self, owner_id: &str, sink_id: &str) -> Result<Option<SinkStatus>>;
}

#[derive(Clone)]
pub struct RedisStatusCache {
    conn: ConnectionManager,
    prefix: String,
}

impl RedisStatusCache {
    pub fn new(conn: ConnectionManager, prefix: impl Into<String>) -> Self {
        Self {
            conn,
            prefix: prefix.into(),
        }
    }

    pub async fn connect(url: &str) -> Result<Self> {
        let client = redis::Client::open(url)?;
        let conn = client.get_connection_manager().await?;
        Ok(Self::new(conn, STATUS_KEY_PREFIX))
    }
}

#[async_trait]
impl StatusCache for RedisStatusCache {
    async fn set(
        &self,
        owner_id: &str,
        sink_id: &str,
        state: SinkState,
        snapshot: &SinkConfig,
    ) -> Result<()> {
        let status = SinkStatus {
            owner_id: owner_id.to_string(),
            sink_id: sink_id.to_string(),
            state,
            snapshot: snapshot.clone(),
            last_updated: Utc::now(),
        };
        let payload = serde_json::to_string(&status)?;
        let mut conn = self.conn.clone();
        let _: () = conn
            .set(status_key(&self.prefix, owner_id, sink_id), payload)
            .await?;
        Ok(())
    }

    async fn get(&self, owner_id: &str, sink_id: &str) -> Result<Option<SinkStatus>> {
        let mut conn = self.conn.clone();
        let raw: Option<String> = conn.get(status_key(&self.prefix, owner_id, sink_id)).await?;
        raw.map(|s| serde_json::from_str(&s).map_err(Error::from))
            .transpose()
    }
}

/// In-process status cache for single-instance runs and tests
#[derive(Default)]
pub struct MemoryStatusCache {
    entries: RwLock<HashMap<(String, String), SinkStatus>>,
}

impl MemoryStatusCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }
}

#[async_trait]
impl StatusCache for MemoryStatusCache {
    async fn set(
        &self,
        owner_id: &str,
        sink_id: &str,
        state: SinkState,
        snapshot: &SinkConfig,
    ) -> Result<()> {
        let status = SinkStatus {
            owner_id: owner_id.to_string(),
            sink_id: sink_id.to_string(),
            state,
            snapshot: snapshot.clone(),
            last_updated: Utc::now(),
        };
        self.entries
            .write()
            .await
            .insert((owner_id.to_string(), sink_id.to_string()), status);
        Ok(())
    }

    async fn get(&self, owner_id: &str, sink_id: &str) -> Result<Option<SinkStatus>> {
        Ok(self
            .entries
            .read()
            .await
            .get(&(owner_id.to_string(), sink_id.to_string()))
            .cloned())
    }
}

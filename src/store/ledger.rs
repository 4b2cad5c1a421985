//! Deployment ledger
//!
//! Persisted mapping sink id → [`DeploymentRecord`]. The ledger answers a
//! single question for the rest of the service: "have we already provisioned
//! this sink?". It is pure state; storing a record never triggers a
//! deployment.
//!
//! Records live under `"<prefix>-<owner_id>:<sink_id>"`. Lookups only know the
//! sink id, so they scan `"<prefix>-*:<sink_id>"`. A claim key
//! `"<prefix>.claim:<sink_id>"` names the record key that owns a sink, so two
//! creates for one sink under different owners cannot both succeed.

use std::collections::HashMap;

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Script};
use tokio::sync::RwLock;
use tracing::{debug, warn};

use super::{escape_glob, scan_keys};
use crate::error::{Error, Result};
use crate::sink::{DeploymentRecord, DeploymentUpdate};

/// Default namespace for ledger keys
pub const LEDGER_KEY_PREFIX: &str = "orb.maestro.deployment";

const CREATE_SCRIPT: &str = include_str!("lua/create_record.lua");

/// Build the ledger key for a record
pub fn ledger_key(prefix: &str, owner_id: &str, sink_id: &str) -> String {
    format!("{prefix}-{owner_id}:{sink_id}")
}

/// Key holding the record key that owns a sink id
pub fn claim_key(prefix: &str, sink_id: &str) -> String {
    format!("{prefix}.claim:{sink_id}")
}

#[async_trait]
pub trait DeploymentLedger: Send + Sync {
    /// Fetch the record for a sink, if any
    async fn get(&self, sink_id: &str) -> Result<Option<DeploymentRecord>>;

    /// Store a new record. Fails with [`Error::AlreadyExists`] if one is present.
    async fn create(&self, record: DeploymentRecord) -> Result<()>;

    /// Update a record in place. No-op if the sink has no record.
    async fn update(&self, sink_id: &str, update: DeploymentUpdate) -> Result<()>;

    /// Remove a record. No-op if the sink has no record.
    async fn remove(&self, sink_id: &str) -> Result<()>;

    /// All records currently tracked
    async fn list(&self) -> Result<Vec<DeploymentRecord>>;
}

/// Ledger backed by a shared Redis instance
#[derive(Clone)]
pub struct RedisLedger {
    conn: ConnectionManager,
    prefix: String,
    create_script: Script,
}

impl RedisLedger {
    pub fn new(conn: ConnectionManager, prefix: impl Into<String>) -> Self {
        Self {
            conn,
            prefix: prefix.into(),
            create_script: Script::new(CREATE_SCRIPT),
        }
    }

    /// Connect to Redis and build a ledger using the default key prefix
    pub async fn connect(url: &str) -> Result<Self> {
        let client = redis::Client::open(url)?;
        let conn = client.get_connection_manager().await?;
        Ok(Self::new(conn, LEDGER_KEY_PREFIX))
    }

    async fn find_key(&self, sink_id: &str) -> Result<Option<String>> {
        let pattern = format!("{}-*:{}", escape_glob(&self.prefix), escape_glob(sink_id));
        let mut conn = self.conn.clone();
        let keys = scan_keys(&mut conn, &pattern).await?;
        if keys.len() > 1 {
            warn!(sink_id, count = keys.len(), "Multiple ledger keys found for sink");
        }
        Ok(keys.into_iter().next())
    }

    async fn read(&self, key: &str) -> Result<Option<DeploymentRecord>> {
        let mut conn = self.conn.clone();
        let raw: Option<String> = conn.get(key).await?;
        raw.map(|s| serde_json::from_str(&s).map_err(Error::from))
            .transpose()
    }
}

#[async_trait]
impl DeploymentLedger for RedisLedger {
    async fn get(&self, sink_id: &str) -> Result<Option<DeploymentRecord>> {
        match self.find_key(sink_id).await? {
            Some(key) => self.read(&key).await,
            None => Ok(None),
        }
    }

    async fn create(&self, record: DeploymentRecord) -> Result<()> {
        if self.find_key(&record.sink_id).await?.is_some() {
            return Err(Error::AlreadyExists(record.sink_id));
        }

        let key = ledger_key(&self.prefix, &record.owner_id, &record.sink_id);
        let claim = claim_key(&self.prefix, &record.sink_id);
        let payload = serde_json::to_string(&record)?;
        let mut conn = self.conn.clone();

        // The script settles concurrent creates, whatever owner they name
        let mut invocation = self.create_script.prepare_invoke();
        invocation.key(&claim).key(&key).arg(payload);
        let created: i64 = invocation.invoke_async(&mut conn).await?;
        if created == 0 {
            return Err(Error::AlreadyExists(record.sink_id));
        }

        debug!(sink_id = %record.sink_id, key = %key, "Created deployment record");
        Ok(())
    }

    async fn update(&self, sink_id: &str, update: DeploymentUpdate) -> Result<()> {
        let Some(key) = self.find_key(sink_id).await? else {
            debug!(sink_id, "No deployment record to update");
            return Ok(());
        };
        let Some(mut record) = self.read(&key).await? else {
            return Ok(());
        };

        update.apply_to(&mut record);
        let payload = serde_json::to_string(&record)?;
        let mut conn = self.conn.clone();

        // XX: a record removed since the read stays removed
        let written: bool = redis::cmd("SET")
            .arg(&key)
            .arg(payload)
            .arg("XX")
            .query_async(&mut conn)
            .await?;
        if !written {
            debug!(sink_id, "Deployment record removed during update");
        }
        Ok(())
    }

    async fn remove(&self, sink_id: &str) -> Result<()> {
        let Some(key) = self.find_key(sink_id).await? else {
            return Ok(());
        };
        let mut conn = self.conn.clone();
        let keys = vec![key.clone(), claim_key(&self.prefix, sink_id)];
        let _: i64 = conn.del(keys).await?;
        debug!(sink_id, key = %key, "Removed deployment record");
        Ok(())
    }

    async fn list(&self) -> Result<Vec<DeploymentRecord>> {
        let pattern = format!("{}-*", escape_glob(&self.prefix));
        let mut conn = self.conn.clone();
        let keys = scan_keys(&mut conn, &pattern).await?;

        let mut records = Vec::with_capacity(keys.len());
        for key in keys {
            match self.read(&key).await {
                Ok(Some(record)) => records.push(record),
                Ok(None) => {}
                Err(e) => warn!(key = %key, error = %e, "Skipping undecodable ledger entry"),
            }
        }
        Ok(records)
    }
}

/// In-process ledger for single-instance runs and tests
#[derive(Default)]
pub struct MemoryLedger {
    records: RwLock<HashMap<String, DeploymentRecord>>,
}

impl MemoryLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.records.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.records.read().await.is_empty()
    }

    /// Non-blocking emptiness check; false while a writer holds the lock
    #[cfg(test)]
    pub(crate) fn try_is_empty(&self) -> bool {
        self.records
            .try_read()
            .map(|records| records.is_empty())
            .unwrap_or(false)
    }
}

#[async_trait]
impl DeploymentLedger for MemoryLedger {
    async fn get(&self, sink_id: &str) -> Result<Option<DeploymentRecord>> {
        Ok(self.records.read().await.get(sink_id).cloned())
    }

    async fn create(&self, record: DeploymentRecord) -> Result<()> {
        let mut records = self.records.write().await;
        if records.contains_key(&record.sink_id) {
            return Err(Error::AlreadyExists(record.sink_id));
        }
        records.insert(record.sink_id.clone(), record);
        Ok(())
    }

    async fn update(&self, sink_id: &str, update: DeploymentUpdate) -> Result<()> {
        if let Some(record) = self.records.write().await.get_mut(sink_id) {
            update.apply_to(record);
        }
        Ok(())
    }

    async fn remove(&self, sink_id: &str) -> Result<()> {
        self.records.write().await.remove(sink_id);
        Ok(())
    }

    async fn list(&self) -> Result<Vec<DeploymentRecord>> {
        let mut records: Vec<_> = self.records.read().await.values().cloned().collect();
        records.sort_by(|a, b| a.sink_id.cmp(&b.sink_id));
        Ok(records)
    }
}

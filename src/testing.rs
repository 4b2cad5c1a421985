//! In-process fakes for the service's external collaborators

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::controller::Monitor;
use crate::deployer::{deployment_name, Deployer, ExporterRegistry};
use crate::error::{Error, Result};
use crate::events::{EventLog, LogMessage, ReadCursor};
use crate::registry::{SinkFilter, SinkRegistry};
use crate::sink::{DeploymentRecord, DeploymentUpdate, SinkDescriptor, SinkState};
use crate::store::DeploymentLedger;

fn connection_refused() -> Error {
    Error::RedisError(redis::RedisError::from((
        redis::ErrorKind::IoError,
        "connection refused",
    )))
}

/// Build a registry descriptor from a JSON config literal
pub fn descriptor(id: &str, owner_id: &str, state: SinkState, config: &str) -> SinkDescriptor {
    SinkDescriptor {
        id: id.to_string(),
        owner_id: owner_id.to_string(),
        state,
        config: config.as_bytes().to_vec(),
    }
}

// ============================================================================
// Event log
// ============================================================================

#[derive(Default)]
struct GroupState {
    /// Index of the first entry never delivered to the group
    next_index: usize,
    /// Delivered but unacknowledged entry id -> consumer name
    pending: HashMap<String, String>,
}

#[derive(Default)]
struct StreamState {
    entries: Vec<LogMessage>,
    next_seq: u64,
    groups: HashMap<String, GroupState>,
}

fn parse_id(id: &str) -> (u64, u64) {
    let (ms, seq) = id.split_once('-').unwrap_or((id, "0"));
    (ms.parse().unwrap_or(0), seq.parse().unwrap_or(0))
}

/// Consumer-group log with the same pending-entry semantics as Redis Streams
#[derive(Default)]
pub struct MemoryEventLog {
    streams: Mutex<HashMap<String, StreamState>>,
    failing_reads: AtomicUsize,
    reads: AtomicUsize,
}

impl MemoryEventLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append an entry and return its id
    pub fn append(&self, stream: &str, fields: &[(&str, &str)]) -> String {
        let mut streams = self.streams.lock().unwrap();
        let state = streams.entry(stream.to_string()).or_default();
        state.next_seq += 1;
        let id = format!("{}-0", state.next_seq);
        state.entries.push(LogMessage::new(id.clone(), fields));
        id
    }

    /// Make the next `n` reads fail
    pub fn fail_next_reads(&self, n: usize) {
        self.failing_reads.store(n, Ordering::SeqCst);
    }

    pub fn read_count(&self) -> usize {
        self.reads.load(Ordering::SeqCst)
    }

    /// Unacknowledged ids of a group, in log order
    pub fn pending_ids(&self, stream: &str, group: &str) -> Vec<String> {
        let streams = self.streams.lock().unwrap();
        let Some(state) = streams.get(stream) else {
            return Vec::new();
        };
        let Some(group) = state.groups.get(group) else {
            return Vec::new();
        };
        state
            .entries
            .iter()
            .filter(|e| group.pending.contains_key(&e.id))
            .map(|e| e.id.clone())
            .collect()
    }

    fn take(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        cursor: &ReadCursor,
        count: usize,
    ) -> Result<Vec<LogMessage>> {
        let mut streams = self.streams.lock().unwrap();
        let state = streams
            .get_mut(stream)
            .ok_or_else(|| Error::ConfigError(format!("no such stream {stream}")))?;
        let group_state = state
            .groups
            .get_mut(group)
            .ok_or_else(|| Error::ConfigError(format!("no such group {group}")))?;

        match cursor {
            ReadCursor::New => {
                let batch: Vec<LogMessage> = state.entries[group_state.next_index..]
                    .iter()
                    .take(count)
                    .cloned()
                    .collect();
                group_state.next_index += batch.len();
                for msg in &batch {
                    group_state
                        .pending
                        .insert(msg.id.clone(), consumer.to_string());
                }
                Ok(batch)
            }
            ReadCursor::PendingAfter(after) => {
                let after = parse_id(after);
                Ok(state
                    .entries
                    .iter()
                    .filter(|e| {
                        group_state.pending.get(&e.id).map(String::as_str) == Some(consumer)
                            && parse_id(&e.id) > after
                    })
                    .take(count)
                    .cloned()
                    .collect())
            }
        }
    }
}

#[async_trait]
impl EventLog for MemoryEventLog {
    async fn ensure_group(&self, stream: &str, group: &str) -> Result<()> {
        let mut streams = self.streams.lock().unwrap();
        let state = streams.entry(stream.to_string()).or_default();
        let tail = state.entries.len();
        state
            .groups
            .entry(group.to_string())
            .or_insert_with(|| GroupState {
                next_index: tail,
                pending: HashMap::new(),
            });
        Ok(())
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
        self.reads.fetch_add(1, Ordering::SeqCst);
        let failed = self
            .failing_reads
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failed {
            return Err(connection_refused());
        }

        let batch = self.take(stream, group, consumer, cursor, count)?;
        if !batch.is_empty() || *cursor != ReadCursor::New {
            return Ok(batch);
        }

        tokio::time::sleep(block).await;
        self.take(stream, group, consumer, cursor, count)
    }

    async fn ack(&self, stream: &str, group: &str, id: &str) -> Result<()> {
        let mut streams = self.streams.lock().unwrap();
        if let Some(group) = streams
            .get_mut(stream)
            .and_then(|s| s.groups.get_mut(group))
        {
            group.pending.remove(id);
        }
        Ok(())
    }
}

// ============================================================================
// Registry
// ============================================================================

#[derive(Default)]
pub struct FakeRegistry {
    sinks: Vec<SinkDescriptor>,
    unavailable: bool,
}

impl FakeRegistry {
    pub fn new(sinks: Vec<SinkDescriptor>) -> Self {
        Self {
            sinks,
            unavailable: false,
        }
    }

    pub fn unavailable() -> Self {
        Self {
            sinks: Vec::new(),
            unavailable: true,
        }
    }
}

#[async_trait]
impl SinkRegistry for FakeRegistry {
    async fn list_sinks(&self, _filter: SinkFilter) -> Result<Vec<SinkDescriptor>> {
        if self.unavailable {
            return Err(Error::RegistryUnavailable("registry down".to_string()));
        }
        Ok(self.sinks.clone())
    }
}

// ============================================================================
// Deployer
// ============================================================================

#[derive(Clone, Debug, PartialEq)]
pub enum DeployerCall {
    Create {
        owner_id: String,
        sink_id: String,
        record: DeploymentRecord,
    },
    Remove {
        sink_id: String,
    },
}

/// Deployer recording every call, with injectable failures
#[derive(Default)]
pub struct FakeDeployer {
    live: Mutex<Vec<String>>,
    calls: Mutex<Vec<DeployerCall>>,
    ready: Mutex<HashSet<String>>,
    fail_create: Mutex<HashSet<String>>,
    fail_remove: Mutex<HashSet<String>>,
    unavailable: AtomicBool,
}

impl FakeDeployer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_live(live: &[&str]) -> Self {
        let deployer = Self::new();
        *deployer.live.lock().unwrap() = live.iter().map(|s| s.to_string()).collect();
        deployer
    }

    pub fn set_ready(&self, sink_id: &str, ready: bool) {
        let mut set = self.ready.lock().unwrap();
        if ready {
            set.insert(sink_id.to_string());
        } else {
            set.remove(sink_id);
        }
    }

    pub fn fail_create_for(&self, sink_id: &str) {
        self.fail_create.lock().unwrap().insert(sink_id.to_string());
    }

    pub fn fail_remove_for(&self, sink_id: &str) {
        self.fail_remove.lock().unwrap().insert(sink_id.to_string());
    }

    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    pub fn calls(&self) -> Vec<DeployerCall> {
        self.calls.lock().unwrap().clone()
    }

    pub fn creates(&self) -> Vec<(String, String, DeploymentRecord)> {
        self.calls()
            .into_iter()
            .filter_map(|call| match call {
                DeployerCall::Create {
                    owner_id,
                    sink_id,
                    record,
                } => Some((owner_id, sink_id, record)),
                DeployerCall::Remove { .. } => None,
            })
            .collect()
    }

    pub fn removals(&self) -> Vec<String> {
        self.calls()
            .into_iter()
            .filter_map(|call| match call {
                DeployerCall::Remove { sink_id } => Some(sink_id),
                DeployerCall::Create { .. } => None,
            })
            .collect()
    }

    pub fn live(&self) -> Vec<String> {
        self.live.lock().unwrap().clone()
    }
}

#[async_trait]
impl Deployer for FakeDeployer {
    async fn list_live_deployments(&self) -> Result<Vec<String>> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(Error::DeployerUnavailable("cluster unreachable".to_string()));
        }
        Ok(self.live())
    }

    async fn create_deployment(
        &self,
        owner_id: &str,
        sink_id: &str,
        record: &DeploymentRecord,
    ) -> Result<()> {
        if self.fail_create.lock().unwrap().contains(sink_id) {
            return Err(Error::DeployerUnavailable(format!("apply failed for {sink_id}")));
        }
        self.calls.lock().unwrap().push(DeployerCall::Create {
            owner_id: owner_id.to_string(),
            sink_id: sink_id.to_string(),
            record: record.clone(),
        });
        let name = deployment_name(sink_id);
        let mut live = self.live.lock().unwrap();
        if !live.contains(&name) {
            live.push(name);
        }
        Ok(())
    }

    async fn remove_deployment(&self, sink_id: &str) -> Result<()> {
        if self.fail_remove.lock().unwrap().contains(sink_id) {
            return Err(Error::DeployerUnavailable(format!("delete failed for {sink_id}")));
        }
        self.calls.lock().unwrap().push(DeployerCall::Remove {
            sink_id: sink_id.to_string(),
        });
        let name = deployment_name(sink_id);
        self.live.lock().unwrap().retain(|d| *d != name);
        Ok(())
    }

    async fn is_ready(&self, sink_id: &str) -> Result<bool> {
        Ok(self.ready.lock().unwrap().contains(sink_id))
    }

    fn ensure_backend(&self, backend: &str) -> Result<()> {
        ExporterRegistry::default().ensure_supported(backend)
    }
}

// ============================================================================
// Monitor and ledger stand-ins
// ============================================================================

/// Monitor that idles until cancelled, or fails after a delay
#[derive(Default)]
pub struct FakeMonitor {
    fail_after: Option<Duration>,
}

impl FakeMonitor {
    pub fn idle() -> Self {
        Self::default()
    }

    pub fn failing_after(delay: Duration) -> Self {
        Self {
            fail_after: Some(delay),
        }
    }
}

#[async_trait]
impl Monitor for FakeMonitor {
    async fn start(&self, cancel: CancellationToken) -> Result<()> {
        match self.fail_after {
            Some(delay) => {
                tokio::select! {
                    _ = cancel.cancelled() => Ok(()),
                    _ = tokio::time::sleep(delay) => {
                        Err(Error::MonitorError("probe backend lost".to_string()))
                    }
                }
            }
            None => {
                cancel.cancelled().await;
                Ok(())
            }
        }
    }
}

/// Ledger whose backing store is never reachable
pub struct UnreachableLedger;

#[async_trait]
impl DeploymentLedger for UnreachableLedger {
    async fn get(&self, _sink_id: &str) -> Result<Option<DeploymentRecord>> {
        Err(connection_refused())
    }

    async fn create(&self, _record: DeploymentRecord) -> Result<()> {
        Err(connection_refused())
    }

    async fn update(&self, _sink_id: &str, _update: DeploymentUpdate) -> Result<()> {
        Err(connection_refused())
    }

    async fn remove(&self, _sink_id: &str) -> Result<()> {
        Err(connection_refused())
    }

    async fn list(&self) -> Result<Vec<DeploymentRecord>> {
        Err(connection_refused())
    }
}

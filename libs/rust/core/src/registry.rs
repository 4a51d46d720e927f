//! Client registry and health monitor.
//!
//! Liveness state machine:
//!
//! ```text
//! register ──> Registered <──heartbeat── Offline
//!                 │  ▲                      ▲
//!   set_activity  ▼  │ set_activity         │ now - last_heartbeat > timeout
//!            Training / Idle ───────────────┘
//!
//! failure_count >= max_failures ──> Failed   (cleared only by register)
//! ```

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::config::RegistryConfig;
use crate::error::{MedFedError, Result};
use crate::metrics_ext::METRICS;

pub type Attributes = BTreeMap<String, serde_json::Value>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClientStatus {
    Registered,
    Training,
    Idle,
    Failed,
    Offline,
}

impl ClientStatus {
    pub fn is_active(self) -> bool { !matches!(self, ClientStatus::Failed | ClientStatus::Offline) }
}

impl fmt::Display for ClientStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ClientStatus::Registered => "registered",
            ClientStatus::Training => "training",
            ClientStatus::Idle => "idle",
            ClientStatus::Failed => "failed",
            ClientStatus::Offline => "offline",
        };
        f.write_str(s)
    }
}

/// Client-reported activity; informational only.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Activity {
    Training,
    Idle,
}

#[derive(Debug, Clone, Serialize)]
pub struct ClientRecord {
    pub id: String,
    pub status: ClientStatus,
    pub data_size: u64,
    pub registered_at: DateTime<Utc>,
    pub last_heartbeat: DateTime<Utc>,
    pub failure_count: u32,
    pub capabilities: Attributes,
    pub metadata: Attributes,
    #[serde(skip)]
    seen: Instant,
}

#[derive(Debug, Clone, Serialize)]
pub struct RegistrySummary {
    pub total: usize,
    pub active: usize,
    pub by_status: BTreeMap<ClientStatus, usize>,
}

struct Shared {
    cfg: RegistryConfig,
    clients: Mutex<HashMap<String, ClientRecord>>,
}

impl Shared {
    fn timeout(&self) -> Duration { Duration::from_secs(self.cfg.heartbeat_timeout_secs) }

    /// Marks stale clients offline. Caller holds the lock.
    fn sweep_locked(&self, clients: &mut HashMap<String, ClientRecord>) -> Vec<String> {
        let now = Instant::now();
        let timeout = self.timeout();
        let mut gone = Vec::new();
        for rec in clients.values_mut() {
            if rec.status.is_active() && now.duration_since(rec.seen) > timeout {
                rec.status = ClientStatus::Offline;
                gone.push(rec.id.clone());
            }
        }
        let active = clients.values().filter(|r| r.status.is_active()).count();
        METRICS.clients.active_clients.set(active as i64);
        for id in &gone {
            warn!(client=%id, timeout_secs = timeout.as_secs(), "client_offline");
        }
        gone
    }
}

struct MonitorHandle {
    stop_tx: watch::Sender<bool>,
    task: JoinHandle<()>,
}

pub struct ClientRegistry {
    shared: Arc<Shared>,
    monitor: Mutex<Option<MonitorHandle>>,
}

impl ClientRegistry {
    pub fn new(cfg: RegistryConfig) -> Self {
        Self { shared: Arc::new(Shared { cfg, clients: Mutex::new(HashMap::new()) }), monitor: Mutex::new(None) }
    }

    /// Registers `id`, or refreshes an existing record: metadata replaced,
    /// status reset to `Registered`, failures cleared.
    pub fn register(&self, id: &str, data_size: u64, capabilities: Attributes, metadata: Attributes) -> ClientRecord {
        let mut clients = self.shared.clients.lock();
        let now = Utc::now();
        let seen = Instant::now();
        match clients.get_mut(id) {
            Some(rec) => {
                let previous = rec.status;
                rec.status = ClientStatus::Registered;
                rec.data_size = data_size;
                rec.capabilities = capabilities;
                rec.metadata = metadata;
                rec.failure_count = 0;
                rec.last_heartbeat = now;
                rec.seen = seen;
                info!(client=%id, previous=%previous, data_size, "client_reregistered");
                rec.clone()
            }
            None => {
                let rec = ClientRecord {
                    id: id.to_string(),
                    status: ClientStatus::Registered,
                    data_size,
                    registered_at: now,
                    last_heartbeat: now,
                    failure_count: 0,
                    capabilities,
                    metadata,
                    seen,
                };
                clients.insert(id.to_string(), rec.clone());
                info!(client=%id, data_size, total = clients.len(), "client_registered");
                rec
            }
        }
    }

    /// Refreshes liveness. Revives `Offline` clients; `Failed` stays failed.
    pub fn record_heartbeat(&self, id: &str) -> Result<ClientStatus> {
        let mut clients = self.shared.clients.lock();
        let rec = clients.get_mut(id).ok_or_else(|| MedFedError::UnknownClient(id.to_string()))?;
        rec.last_heartbeat = Utc::now();
        rec.seen = Instant::now();
        match rec.status {
            ClientStatus::Failed => {
                debug!(client=%id, "heartbeat_from_failed_client");
            }
            ClientStatus::Offline => {
                rec.status = ClientStatus::Registered;
                rec.failure_count = 0;
                info!(client=%id, "client_back_online");
            }
            _ => rec.failure_count = 0,
        }
        Ok(rec.status)
    }

    pub fn record_failure(&self, id: &str) -> Result<ClientStatus> {
        let mut clients = self.shared.clients.lock();
        let rec = clients.get_mut(id).ok_or_else(|| MedFedError::UnknownClient(id.to_string()))?;
        rec.failure_count += 1;
        METRICS.clients.client_failures_total.inc();
        if rec.failure_count >= self.shared.cfg.max_failures && rec.status != ClientStatus::Failed {
            rec.status = ClientStatus::Failed;
            warn!(client=%id, failures = rec.failure_count, "client_failed");
        } else {
            debug!(client=%id, failures = rec.failure_count, "client_failure_recorded");
        }
        Ok(rec.status)
    }

    /// Client-reported activity. Only live clients may report; counts as a heartbeat.
    pub fn set_activity(&self, id: &str, activity: Activity) -> Result<ClientStatus> {
        let mut clients = self.shared.clients.lock();
        let rec = clients.get_mut(id).ok_or_else(|| MedFedError::UnknownClient(id.to_string()))?;
        let to = match activity {
            Activity::Training => ClientStatus::Training,
            Activity::Idle => ClientStatus::Idle,
        };
        if !rec.status.is_active() {
            return Err(MedFedError::InvalidTransition { client: id.to_string(), from: rec.status.to_string(), to: to.to_string() });
        }
        rec.status = to;
        rec.last_heartbeat = Utc::now();
        rec.seen = Instant::now();
        Ok(to)
    }

    /// Live clients, after reclassifying stale ones as `Offline`.
    pub fn get_active_clients(&self) -> Vec<ClientRecord> {
        let mut clients = self.shared.clients.lock();
        self.shared.sweep_locked(&mut clients);
        let mut active: Vec<ClientRecord> = clients.values().filter(|r| r.status.is_active()).cloned().collect();
        active.sort_by(|a, b| a.id.cmp(&b.id));
        active
    }

    /// One monitor pass; returns the ids that just went offline.
    pub fn sweep(&self) -> Vec<String> {
        let mut clients = self.shared.clients.lock();
        self.shared.sweep_locked(&mut clients)
    }

    pub fn unregister(&self, id: &str) -> bool {
        let removed = self.shared.clients.lock().remove(id).is_some();
        if removed { info!(client=%id, "client_unregistered"); }
        removed
    }

    pub fn get_client(&self, id: &str) -> Option<ClientRecord> { self.shared.clients.lock().get(id).cloned() }

    pub fn all_clients(&self) -> Vec<ClientRecord> {
        let mut all: Vec<ClientRecord> = self.shared.clients.lock().values().cloned().collect();
        all.sort_by(|a, b| a.id.cmp(&b.id));
        all
    }

    pub fn client_count(&self) -> usize { self.shared.clients.lock().len() }

    pub fn summary(&self) -> RegistrySummary {
        let clients = self.shared.clients.lock();
        let mut by_status = BTreeMap::new();
        for rec in clients.values() { *by_status.entry(rec.status).or_insert(0) += 1; }
        RegistrySummary { total: clients.len(), active: clients.values().filter(|r| r.status.is_active()).count(), by_status }
    }

    /// Starts the periodic sweep. No-op when already running.
    pub fn start_monitor(&self) {
        let mut slot = self.monitor.lock();
        if slot.is_some() { return; }
        let (stop_tx, mut stop_rx) = watch::channel(false);
        let shared = self.shared.clone();
        let every = Duration::from_secs(shared.cfg.monitor_interval_secs.max(1));
        let task = tokio::spawn(async move {
            info!(interval_secs = every.as_secs(), timeout_secs = shared.cfg.heartbeat_timeout_secs, "health_monitor_started");
            loop {
                tokio::select! {
                    _ = tokio::time::sleep(every) => {}
                    _ = stop_rx.changed() => break,
                }
                if *stop_rx.borrow() { break; }
                shared.sweep_locked(&mut shared.clients.lock());
            }
            info!("health_monitor_stopped");
        });
        *slot = Some(MonitorHandle { stop_tx, task });
    }

    /// Stops the sweep, waiting at most `limit` before aborting it.
    pub async fn stop_monitor(&self, limit: Duration) {
        let taken = self.monitor.lock().take();
        let Some(MonitorHandle { stop_tx, mut task }) = taken else { return };
        let _ = stop_tx.send(true);
        if tokio::time::timeout(limit, &mut task).await.is_err() {
            warn!("health_monitor_abort");
            task.abort();
            let _ = task.await;
        }
    }

    pub fn monitor_running(&self) -> bool { self.monitor.lock().is_some() }
}

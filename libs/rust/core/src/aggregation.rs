//! Background weight aggregation.
//!
//! Feedback events enqueue local weight vectors without blocking; a tokio task
//! wakes every `interval_secs` and folds the queue into a global vector with
//! FedAvg once at least `min_updates_before_aggregate` updates are pending.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::panic::AssertUnwindSafe;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::config::AggregationConfig;
use crate::error::Result;
use crate::federated_learning::fedavg::fed_avg;
use crate::metrics_ext::METRICS;
use crate::persist;
use crate::types::WeightVector;

/// Receiver of each freshly aggregated global vector.
pub trait WeightSink: Send + Sync {
    fn apply_global(&self, weights: &WeightVector);
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LocalUpdate {
    pub weights: WeightVector,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub metadata: BTreeMap<String, serde_json::Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GlobalWeights {
    pub version: u64,
    pub weights: WeightVector,
    pub aggregated_at: DateTime<Utc>,
    pub num_updates: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct AggregationStatus {
    pub running: bool,
    pub pending_updates: usize,
    pub min_updates_before_aggregate: usize,
    pub interval_secs: u64,
    pub aggregation_count: u64,
    pub last_aggregation: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub latest_global: Option<WeightVector>,
}

#[derive(Default)]
struct Progress {
    count: u64,
    last_aggregation: Option<DateTime<Utc>>,
    last_error: Option<String>,
    latest: Option<GlobalWeights>,
}

struct Shared {
    cfg: AggregationConfig,
    queue: Mutex<Vec<LocalUpdate>>,
    progress: Mutex<Progress>,
    global_path: Option<PathBuf>,
    sink: Option<Arc<dyn WeightSink>>,
}

struct LoopHandle {
    stop_tx: watch::Sender<bool>,
    task: JoinHandle<()>,
}

pub struct AggregationService {
    shared: Arc<Shared>,
    handle: Mutex<Option<LoopHandle>>,
}

/// Updates taken out of the queue for one cycle. Returned to the front of the
/// queue on drop unless the cycle committed them.
struct ClaimedBatch<'a> {
    queue: &'a Mutex<Vec<LocalUpdate>>,
    updates: Vec<LocalUpdate>,
    committed: bool,
}

impl ClaimedBatch<'_> {
    fn commit(&mut self) { self.committed = true; }
}

impl Drop for ClaimedBatch<'_> {
    fn drop(&mut self) {
        if self.committed || self.updates.is_empty() { return; }
        let mut q = self.queue.lock();
        let mut later = std::mem::take(&mut *q);
        q.append(&mut self.updates);
        q.append(&mut later);
        warn!(pending = q.len(), "aggregation_batch_returned");
    }
}

impl Shared {
    /// One aggregation pass. With `force`, any non-empty queue qualifies.
    ///
    /// The batch leaves the queue under the same lock that sizes it, so
    /// overlapping cycles never see the same update.
    fn run_cycle(&self, force: bool) -> Result<Option<GlobalWeights>> {
        let mut claimed = {
            let mut q = self.queue.lock();
            let min = if force { 1 } else { self.cfg.min_updates_before_aggregate.max(1) };
            if q.len() < min {
                debug!(pending = q.len(), min, "aggregation_not_enough_updates");
                return Ok(None);
            }
            ClaimedBatch { queue: &self.queue, updates: std::mem::take(&mut *q), committed: false }
        };
        let k = claimed.updates.len();
        let batch: Vec<WeightVector> = claimed.updates.iter().map(|u| u.weights.clone()).collect();
        let Some(weights) = fed_avg(&batch) else { return Ok(None) };

        let global = {
            let mut p = self.progress.lock();
            p.count += 1;
            let g = GlobalWeights { version: p.count, weights, aggregated_at: Utc::now(), num_updates: k };
            p.last_aggregation = Some(g.aggregated_at);
            p.last_error = None;
            p.latest = Some(g.clone());
            g
        };
        claimed.commit();
        drop(claimed);

        if let Some(path) = &self.global_path {
            if let Err(e) = persist::save_json(path, &global) {
                error!(path=%path.display(), error=%e, "global_weights_persist_failed");
            }
        }
        if let Some(sink) = &self.sink {
            sink.apply_global(&global.weights);
        }
        let remaining = self.queue.lock().len();
        METRICS.aggregation.pending_updates.set(remaining as i64);
        METRICS.aggregation.cycles_total.with_label_values(&["ok"]).inc();
        info!(version = global.version, updates = k, remaining, weights=%global.weights.describe(), "aggregation_completed");
        Ok(Some(global))
    }

    fn guarded_cycle(&self) {
        match std::panic::catch_unwind(AssertUnwindSafe(|| self.run_cycle(false))) {
            Ok(Ok(_)) => {}
            Ok(Err(e)) => self.note_error(e.to_string()),
            Err(panic) => {
                let msg = panic
                    .downcast_ref::<&str>()
                    .map(|s| s.to_string())
                    .or_else(|| panic.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "unknown panic".into());
                self.note_error(format!("panic: {msg}"));
            }
        }
    }

    fn note_error(&self, msg: String) {
        error!(error=%msg, "aggregation_cycle_failed");
        METRICS.aggregation.cycles_total.with_label_values(&["error"]).inc();
        self.progress.lock().last_error = Some(msg);
    }
}

impl AggregationService {
    pub fn new(cfg: AggregationConfig, global_path: Option<PathBuf>, sink: Option<Arc<dyn WeightSink>>) -> Self {
        let latest = global_path.as_ref().and_then(|p| match persist::load_json::<GlobalWeights>(p) {
            Ok(v) => v,
            Err(e) => {
                warn!(path=%p.display(), error=%e, "global_weights_unreadable");
                None
            }
        });
        let progress = Progress { count: latest.as_ref().map(|g| g.version).unwrap_or(0), last_aggregation: latest.as_ref().map(|g| g.aggregated_at), last_error: None, latest };
        let shared = Shared { cfg, queue: Mutex::new(Vec::new()), progress: Mutex::new(progress), global_path, sink };
        Self { shared: Arc::new(shared), handle: Mutex::new(None) }
    }

    /// Queues a local vector for the next cycle. Never aggregates inline.
    pub fn add_local_update(&self, weights: WeightVector, metadata: BTreeMap<String, serde_json::Value>) {
        let pending = {
            let mut q = self.shared.queue.lock();
            q.push(LocalUpdate { weights, timestamp: Utc::now(), metadata });
            q.len()
        };
        METRICS.aggregation.pending_updates.set(pending as i64);
        debug!(pending, "local_update_queued");
    }

    pub fn pending_count(&self) -> usize { self.shared.queue.lock().len() }

    /// Runs one cycle under the normal threshold, as the background loop does.
    pub fn aggregate_once(&self) -> Result<Option<GlobalWeights>> { self.shared.run_cycle(false) }

    /// Aggregates whatever is pending, ignoring the threshold.
    pub fn trigger_now(&self) -> Result<Option<GlobalWeights>> { self.shared.run_cycle(true) }

    pub fn latest_global(&self) -> Option<GlobalWeights> { self.shared.progress.lock().latest.clone() }

    pub fn is_running(&self) -> bool { self.handle.lock().is_some() }

    pub fn status(&self) -> AggregationStatus {
        let pending = self.pending_count();
        let p = self.shared.progress.lock();
        AggregationStatus {
            running: self.is_running(),
            pending_updates: pending,
            min_updates_before_aggregate: self.shared.cfg.min_updates_before_aggregate,
            interval_secs: self.shared.cfg.interval_secs,
            aggregation_count: p.count,
            last_aggregation: p.last_aggregation,
            last_error: p.last_error.clone(),
            latest_global: p.latest.as_ref().map(|g| g.weights.clone()),
        }
    }

    /// Spawns the periodic loop. No-op when already running or disabled.
    pub fn start(&self) {
        let mut slot = self.handle.lock();
        if slot.is_some() { return; }
        if !self.shared.cfg.enabled {
            info!("aggregation_disabled");
            return;
        }
        let (stop_tx, mut stop_rx) = watch::channel(false);
        let shared = self.shared.clone();
        let interval = Duration::from_secs(shared.cfg.interval_secs.max(1));
        let task = tokio::spawn(async move {
            info!(interval_secs = interval.as_secs(), min_updates = shared.cfg.min_updates_before_aggregate, "aggregation_loop_started");
            loop {
                tokio::select! {
                    _ = tokio::time::sleep(interval) => {}
                    _ = stop_rx.changed() => break,
                }
                if *stop_rx.borrow() { break; }
                shared.guarded_cycle();
            }
            info!("aggregation_loop_stopped");
        });
        *slot = Some(LoopHandle { stop_tx, task });
    }

    /// Stops the loop and waits up to `stop_timeout_ms` for it; an overrunning
    /// task is aborted. Safe to call repeatedly or before `start`.
    pub async fn stop(&self) {
        let taken = self.handle.lock().take();
        let Some(LoopHandle { stop_tx, mut task }) = taken else { return };
        let _ = stop_tx.send(true);
        let limit = Duration::from_millis(self.shared.cfg.stop_timeout_ms);
        if tokio::time::timeout(limit, &mut task).await.is_err() {
            warn!(timeout_ms = self.shared.cfg.stop_timeout_ms, "aggregation_loop_abort");
            task.abort();
            let _ = task.await;
        }
    }
}

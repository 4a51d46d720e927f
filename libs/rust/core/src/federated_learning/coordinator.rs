use chrono::{DateTime, Utc};
use futures::future::join_all;
use parking_lot::RwLock;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tracing::{error, info, warn};

use super::client::FlClient;
use super::fedavg::weighted_fed_avg;
use super::protocol::{weighted_metrics, DataSource, EvaluateIns, FitIns, Metrics};
use crate::config::FederatedConfig;
use crate::error::{MedFedError, Result};
use crate::metrics_ext::METRICS;
use crate::persist;
use crate::registry::{Activity, ClientRegistry};
use crate::types::WeightVector;

pub type RoundId = u32;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoundRecord {
    pub round: RoundId,
    pub participants: Vec<String>,
    pub failed: Vec<String>,
    pub fit_metrics: Metrics,
    pub evaluate_loss: Option<f64>,
    pub evaluate_metrics: Metrics,
    pub weights: WeightVector,
    pub weights_fingerprint: String,
    pub data_source: DataSource,
    pub timestamp: DateTime<Utc>,
    pub duration_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunSummary {
    pub complete: bool,
    pub started_at: DateTime<Utc>,
    pub duration_secs: f64,
    pub rounds: Vec<RoundRecord>,
    pub config: FederatedConfig,
    pub data_source: DataSource,
    pub final_weights: WeightVector,
}

/// SHA-256 hex of the canonical JSON encoding (keys are ordered).
pub fn weights_fingerprint(w: &WeightVector) -> String {
    let bytes = serde_json::to_vec(w).unwrap_or_default();
    hex::encode(Sha256::digest(&bytes))
}

/// Number of clients asked to fit: `max(min_fit, ceil(fraction * available))`,
/// never more than are available.
pub fn fit_sample_size(cfg: &FederatedConfig, available: usize) -> usize {
    let by_fraction = (cfg.fraction_fit * available as f64).ceil() as usize;
    by_fraction.max(cfg.min_fit_clients).min(available)
}

fn evaluate_sample_size(cfg: &FederatedConfig, available: usize) -> usize {
    if cfg.fraction_evaluate <= 0.0 { return 0; }
    ((cfg.fraction_evaluate * available as f64).ceil() as usize).clamp(1, available.max(1)).min(available)
}

struct RunGuard<'a>(&'a AtomicBool);

impl Drop for RunGuard<'_> {
    fn drop(&mut self) { self.0.store(false, Ordering::SeqCst); }
}

/// Multi-round fit/evaluate protocol over registered clients.
pub struct Orchestrator {
    cfg: FederatedConfig,
    registry: Arc<ClientRegistry>,
    clients: RwLock<HashMap<String, Arc<dyn FlClient>>>,
    global: RwLock<WeightVector>,
    rounds: RwLock<Vec<RoundRecord>>,
    running: AtomicBool,
    stop_requested: AtomicBool,
    results_path: Option<PathBuf>,
}

impl Orchestrator {
    pub fn new(cfg: FederatedConfig, registry: Arc<ClientRegistry>, results_path: Option<PathBuf>) -> Self {
        Self {
            cfg,
            registry,
            clients: RwLock::new(HashMap::new()),
            global: RwLock::new(WeightVector::new()),
            rounds: RwLock::new(Vec::new()),
            running: AtomicBool::new(false),
            stop_requested: AtomicBool::new(false),
            results_path,
        }
    }

    pub fn config(&self) -> &FederatedConfig { &self.cfg }

    /// Makes a client reachable for rounds. It must also be registered.
    pub fn attach_client(&self, client: Arc<dyn FlClient>) {
        let id = client.id().to_string();
        self.clients.write().insert(id.clone(), client);
        info!(client=%id, "fl_client_attached");
    }

    pub fn detach_client(&self, id: &str) -> bool { self.clients.write().remove(id).is_some() }

    pub fn attached_count(&self) -> usize { self.clients.read().len() }

    /// Clients a run could use right now.
    pub fn available_count(&self) -> usize { self.available().len() }

    pub fn global_weights(&self) -> WeightVector { self.global.read().clone() }

    pub fn rounds(&self) -> Vec<RoundRecord> { self.rounds.read().clone() }

    pub fn is_running(&self) -> bool { self.running.load(Ordering::SeqCst) }

    /// Asks a running run to finish after its current round.
    pub fn stop(&self) {
        if self.is_running() {
            self.stop_requested.store(true, Ordering::SeqCst);
            info!("fl_stop_requested");
        }
    }

    /// Live, registered clients that have a handle attached, ordered by id.
    fn available(&self) -> Vec<Arc<dyn FlClient>> {
        let handles = self.clients.read();
        self.registry.get_active_clients().iter().filter_map(|r| handles.get(&r.id).cloned()).collect()
    }

    fn rng_for(&self, round: RoundId) -> StdRng {
        match self.cfg.seed {
            Some(seed) => StdRng::seed_from_u64(seed.wrapping_add(round as u64)),
            None => StdRng::from_entropy(),
        }
    }

    /// Runs up to `num_rounds` rounds starting from `initial`.
    pub async fn run(&self, initial: WeightVector, data_source: DataSource) -> Result<RunSummary> {
        if self.running.swap(true, Ordering::SeqCst) {
            return Err(MedFedError::RunInProgress);
        }
        let _guard = RunGuard(&self.running);
        self.stop_requested.store(false, Ordering::SeqCst);

        let available = self.available().len();
        let required = self.cfg.min_available_clients.max(self.cfg.min_fit_clients);
        if available < required {
            warn!(available, required, "fl_not_enough_clients");
            return Err(MedFedError::NotEnoughClients { available, required });
        }

        let mut init = initial;
        init.normalize();
        *self.global.write() = init;
        self.rounds.write().clear();

        let started_at = Utc::now();
        let started = Instant::now();
        info!(rounds = self.cfg.num_rounds, available, ?data_source, "fl_run_started");
        let mut completed = 0;
        for round in 1..=self.cfg.num_rounds {
            if self.stop_requested.load(Ordering::SeqCst) {
                info!(round, "fl_run_stopped");
                break;
            }
            let record = self.run_round(round, data_source).await?;
            self.rounds.write().push(record);
            completed = round;
            self.save_summary(self.summary(false, started_at, started, data_source));
        }
        let summary = self.summary(completed == self.cfg.num_rounds, started_at, started, data_source);
        self.save_summary(summary.clone());
        info!(rounds = completed, complete = summary.complete, weights=%summary.final_weights.describe(), "fl_run_finished");
        Ok(summary)
    }

    fn summary(&self, complete: bool, started_at: DateTime<Utc>, started: Instant, data_source: DataSource) -> RunSummary {
        RunSummary {
            complete,
            started_at,
            duration_secs: started.elapsed().as_secs_f64(),
            rounds: self.rounds(),
            config: self.cfg.clone(),
            data_source,
            final_weights: self.global_weights(),
        }
    }

    fn save_summary(&self, summary: RunSummary) {
        if let Some(path) = &self.results_path {
            if let Err(e) = persist::save_json(path, &summary) {
                error!(path=%path.display(), error=%e, "fl_results_persist_failed");
            }
        }
    }

    /// One fit + evaluate round. The global vector changes only when at least
    /// one client returns a fit result.
    pub async fn run_round(&self, round: RoundId, data_source: DataSource) -> Result<RoundRecord> {
        let started = Instant::now();
        let available = self.available();
        if available.len() < self.cfg.min_fit_clients {
            return Err(MedFedError::NotEnoughClients { available: available.len(), required: self.cfg.min_fit_clients });
        }
        let mut rng = self.rng_for(round);
        let fit_n = fit_sample_size(&self.cfg, available.len());
        let selected: Vec<Arc<dyn FlClient>> = available.choose_multiple(&mut rng, fit_n).cloned().collect();
        let global = self.global_weights();
        let timeout = self.cfg.round_timeout();

        let fits = join_all(selected.iter().map(|c| {
            let ins = FitIns { round, weights: global.clone(), local_epochs: self.cfg.local_epochs, learning_rate: self.cfg.learning_rate };
            let client = c.clone();
            async move {
                let _ = self.registry.set_activity(client.id(), Activity::Training);
                let res = match tokio::time::timeout(timeout, client.fit(ins)).await {
                    Ok(r) => r,
                    Err(_) => Err(MedFedError::ClientTimeout { client: client.id().to_string(), task: "fit".into(), timeout_ms: timeout.as_millis() as u64 }),
                };
                (client, res)
            }
        }))
        .await;

        let mut participants = Vec::new();
        let mut failed = Vec::new();
        let mut results = Vec::new();
        for (client, res) in fits {
            let id = client.id().to_string();
            match res {
                Ok(r) => {
                    let _ = self.registry.record_heartbeat(&id);
                    let _ = self.registry.set_activity(&id, Activity::Idle);
                    participants.push(id);
                    results.push(r);
                }
                Err(e) => {
                    warn!(client=%id, round, error=%e, "fl_fit_failed");
                    let _ = self.registry.set_activity(&id, Activity::Idle);
                    let _ = self.registry.record_failure(&id);
                    failed.push(id);
                }
            }
        }

        let pairs: Vec<(&WeightVector, u64)> = results.iter().map(|r| (&r.weights, r.num_examples)).collect();
        let new_global = match weighted_fed_avg(&pairs) {
            Some(w) => {
                *self.global.write() = w.clone();
                w
            }
            None => {
                warn!(round, "fl_round_no_results_keeping_weights");
                global
            }
        };
        let fit_metrics = weighted_metrics(results.iter().map(|r| (r.num_examples, &r.metrics)));

        let (evaluate_loss, evaluate_metrics) = self.evaluate_round(round, &available, &new_global, &mut rng).await;

        let record = RoundRecord {
            round,
            participants,
            failed,
            fit_metrics,
            evaluate_loss,
            evaluate_metrics,
            weights_fingerprint: weights_fingerprint(&new_global),
            weights: new_global,
            data_source,
            timestamp: Utc::now(),
            duration_ms: started.elapsed().as_millis() as u64,
        };
        METRICS.fl.rounds_total.inc();
        METRICS.fl.round_latency_seconds.observe(started.elapsed().as_secs_f64());
        info!(round, participants = record.participants.len(), failed = record.failed.len(),
            loss = ?record.evaluate_loss, fingerprint=%record.weights_fingerprint, "fl_round_completed");
        Ok(record)
    }

    async fn evaluate_round(&self, round: RoundId, available: &[Arc<dyn FlClient>], weights: &WeightVector, rng: &mut StdRng) -> (Option<f64>, Metrics) {
        let n = evaluate_sample_size(&self.cfg, available.len());
        if n == 0 {
            return (None, Metrics::new());
        }
        let timeout = self.cfg.round_timeout();
        let chosen: Vec<Arc<dyn FlClient>> = available.choose_multiple(rng, n).cloned().collect();
        let evals = join_all(chosen.iter().map(|c| {
            let ins = EvaluateIns { round, weights: weights.clone() };
            let client = c.clone();
            async move {
                let res = tokio::time::timeout(timeout, client.evaluate(ins)).await;
                (client, res)
            }
        }))
        .await;

        let mut ok = Vec::new();
        for (client, res) in evals {
            match res {
                Ok(Ok(r)) => ok.push(r),
                Ok(Err(e)) => warn!(client=%client.id(), round, error=%e, "fl_evaluate_failed"),
                Err(_) => warn!(client=%client.id(), round, "fl_evaluate_timeout"),
            }
        }
        let total: u64 = ok.iter().map(|r| r.num_examples).sum();
        let loss = if ok.is_empty() {
            None
        } else if total == 0 {
            Some(ok.iter().map(|r| r.loss).sum::<f64>() / ok.len() as f64)
        } else {
            Some(ok.iter().map(|r| r.loss * r.num_examples as f64).sum::<f64>() / total as f64)
        };
        (loss, weighted_metrics(ok.iter().map(|r| (r.num_examples, &r.metrics))))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cfg(fraction: f64, min_fit: usize) -> FederatedConfig {
        FederatedConfig { fraction_fit: fraction, min_fit_clients: min_fit, ..Default::default() }
    }

    #[test]
    fn sample_size_respects_minimum_and_availability() {
        assert_eq!(fit_sample_size(&cfg(0.5, 2), 10), 5);
        assert_eq!(fit_sample_size(&cfg(0.1, 2), 10), 2);
        assert_eq!(fit_sample_size(&cfg(0.5, 2), 3), 2);
        assert_eq!(fit_sample_size(&cfg(1.0, 2), 1), 1);
    }

    #[test]
    fn fingerprint_is_stable_hex() {
        let w = WeightVector::uniform(["a", "b"]);
        let f = weights_fingerprint(&w);
        assert_eq!(f.len(), 64);
        assert_eq!(f, weights_fingerprint(&w.clone()));
        assert_ne!(f, weights_fingerprint(&WeightVector::uniform(["a"])));
    }
}

//! Engine assembly and lifecycle.
//!
//! Phases:
//! - Constructed: every component built, no background task running
//! - Running: health monitor and aggregation loop started
//! - Stopped: loops joined; terminal
//!
//! Components are wired explicitly here; nothing is reached through globals.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::info;

use crate::aggregation::{AggregationService, WeightSink};
use crate::config::EngineConfig;
use crate::ensemble::ScoreAggregator;
use crate::error::Result;
use crate::federated_learning::Orchestrator;
use crate::learning::{IncrementalLearner, LearningHistory};
use crate::registry::ClientRegistry;
use crate::scoring::{default_models, ScoringModel};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum EnginePhase { Constructed, Running, Stopped }

pub struct Engine {
    pub config: EngineConfig,
    pub ensemble: Arc<ScoreAggregator>,
    pub registry: Arc<ClientRegistry>,
    pub aggregation: Arc<AggregationService>,
    pub history: Arc<LearningHistory>,
    pub learner: Arc<IncrementalLearner>,
    pub orchestrator: Arc<Orchestrator>,
    phase: Mutex<EnginePhase>,
    phase_started_at: Mutex<Instant>,
}

impl Engine {
    /// Builds the engine around caller-supplied scoring models.
    pub fn build(config: EngineConfig, models: Vec<Arc<dyn ScoringModel>>) -> Result<Self> {
        let history = Arc::new(Self::open_history(&config));
        Self::assemble(config, history, models)
    }

    /// Builds the engine with the four built-in models; the collaborative
    /// model reads from the engine's own learning history.
    pub fn with_default_models(config: EngineConfig) -> Result<Self> {
        let history = Arc::new(Self::open_history(&config));
        let models = default_models(history.clone());
        Self::assemble(config, history, models)
    }

    fn open_history(config: &EngineConfig) -> LearningHistory {
        LearningHistory::open(config.storage.history_path(), config.storage.stats_path(), config.learning.clone())
    }

    fn assemble(config: EngineConfig, history: Arc<LearningHistory>, models: Vec<Arc<dyn ScoringModel>>) -> Result<Self> {
        config.federated.validate()?;
        let storage = &config.storage;
        let ensemble = Arc::new(ScoreAggregator::new(models, config.ensemble.clone(), Some(storage.weights_path())));
        let registry = Arc::new(ClientRegistry::new(config.registry.clone()));
        let sink: Option<Arc<dyn WeightSink>> =
            if config.aggregation.apply_to_ensemble { Some(ensemble.clone() as Arc<dyn WeightSink>) } else { None };
        let aggregation = Arc::new(AggregationService::new(config.aggregation.clone(), Some(storage.global_weights_path()), sink));
        let learner = Arc::new(IncrementalLearner::new(ensemble.clone(), history.clone(), Some(aggregation.clone()), config.learning.learning_rate));
        let orchestrator = Arc::new(Orchestrator::new(config.federated.clone(), registry.clone(), Some(storage.results_path())));
        info!(models = ?ensemble.model_ids(), data_dir=%storage.data_dir.display(), "engine_constructed");
        Ok(Self {
            config,
            ensemble,
            registry,
            aggregation,
            history,
            learner,
            orchestrator,
            phase: Mutex::new(EnginePhase::Constructed),
            phase_started_at: Mutex::new(Instant::now()),
        })
    }

    pub fn phase(&self) -> EnginePhase { *self.phase.lock() }

    pub fn time_in_phase(&self) -> Duration { self.phase_started_at.lock().elapsed() }

    fn advance(&self, to: EnginePhase) {
        *self.phase.lock() = to;
        *self.phase_started_at.lock() = Instant::now();
    }

    /// Constructed -> Running. Ignored in any other phase.
    pub fn start(&self) {
        if self.phase() != EnginePhase::Constructed { return; }
        self.registry.start_monitor();
        self.aggregation.start();
        self.advance(EnginePhase::Running);
        crate::mark_ready();
        info!("engine_started");
    }

    /// Stops the loops. Safe to call repeatedly and before `start`.
    pub async fn shutdown(&self) {
        if self.phase() == EnginePhase::Stopped { return; }
        crate::clear_ready();
        self.orchestrator.stop();
        self.registry.stop_monitor(Duration::from_millis(self.config.aggregation.stop_timeout_ms)).await;
        self.aggregation.stop().await;
        self.advance(EnginePhase::Stopped);
        info!("engine_stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StorageConfig;

    fn config(dir: &std::path::Path) -> EngineConfig {
        EngineConfig { storage: StorageConfig::in_dir(dir), ..Default::default() }
    }

    #[tokio::test]
    async fn phases_progress_and_shutdown_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let engine = Engine::with_default_models(config(dir.path())).unwrap();
        assert_eq!(engine.phase(), EnginePhase::Constructed);
        assert_eq!(engine.ensemble.model_ids(), vec!["semantic", "tfidf", "knowledge", "collaborative"]);

        engine.start();
        assert_eq!(engine.phase(), EnginePhase::Running);
        assert!(engine.registry.monitor_running());
        assert!(engine.aggregation.is_running());

        engine.shutdown().await;
        engine.shutdown().await;
        assert_eq!(engine.phase(), EnginePhase::Stopped);
        assert!(!engine.registry.monitor_running());
        assert!(!engine.aggregation.is_running());

        // a stopped engine cannot be restarted
        engine.start();
        assert_eq!(engine.phase(), EnginePhase::Stopped);
    }

    #[tokio::test]
    async fn shutdown_before_start_is_safe() {
        let dir = tempfile::tempdir().unwrap();
        let engine = Engine::with_default_models(config(dir.path())).unwrap();
        engine.shutdown().await;
        assert_eq!(engine.phase(), EnginePhase::Stopped);
    }

    #[test]
    fn invalid_federated_config_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let mut cfg = config(dir.path());
        cfg.federated.fraction_fit = 1.5;
        assert!(Engine::with_default_models(cfg).is_err());
    }
}

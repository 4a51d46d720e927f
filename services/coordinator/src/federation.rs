use anyhow::{Context, Result};
use medfed_core::config::ServerConfig;
use medfed_core::federated_learning::{LocalTrainer, RunSummary};
use medfed_core::net::{self, AppState, Participant, ParticipantConfig};
use medfed_core::scoring::{default_models, StaticHistory};
use medfed_core::{Candidate, Engine, EngineConfig, LabeledQuery, Simulation};
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::info;

/// Owns the engine for the lifetime of one command.
pub struct FederationModule {
    engine: Arc<Engine>,
}

impl FederationModule {
    pub fn new(config: EngineConfig) -> Result<Self> {
        let engine = Arc::new(Engine::with_default_models(config).context("building engine")?);
        info!(data_dir=%engine.config.storage.data_dir.display(), "federation_module_initialized");
        Ok(Self { engine })
    }

    pub fn engine(&self) -> &Arc<Engine> { &self.engine }

    /// Runs the coordinator server until `shutdown` resolves.
    pub async fn serve<F>(&self, bind: &str, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let addr: SocketAddr = bind.parse().with_context(|| format!("invalid bind address {bind}"))?;
        self.engine.start();
        let state = AppState::new(self.engine.clone());
        net::serve(state, addr, shutdown).await.context("coordinator server failed")?;
        Ok(())
    }

    /// In-process run over simulated clients. Uses `examples`, or the logged
    /// history when none are given, or the synthetic set as a last resort.
    pub async fn simulate(&self, catalog: Vec<Candidate>, examples: Vec<LabeledQuery>, apply: bool) -> Result<RunSummary> {
        let examples = if examples.is_empty() { self.engine.history.training_examples() } else { examples };
        let cfg = &self.engine.config;
        let models = default_models(self.engine.history.clone());
        let sim = Simulation::build(&cfg.federated, &cfg.ensemble, models, catalog, examples);
        sim.enroll(&self.engine.registry, &self.engine.orchestrator);

        let initial = self.engine.ensemble.get_model_weights();
        let summary = self.engine.orchestrator.run(initial, sim.data_source).await.context("federated run failed")?;
        if apply {
            let applied = self.engine.ensemble.set_model_weights(summary.final_weights.clone());
            info!(weights=%applied.describe(), "fl_weights_applied");
        }
        Ok(summary)
    }

    pub async fn shutdown(&self) -> Result<()> {
        self.engine.shutdown().await;
        info!("federation_module_shutdown");
        Ok(())
    }
}

/// Runs a participant process against `server` until `stop` flips.
pub async fn run_participant(
    server: &ServerConfig,
    client_id: &str,
    engine_cfg: &EngineConfig,
    catalog: Vec<Candidate>,
    examples: Vec<LabeledQuery>,
    stop: watch::Receiver<bool>,
) -> Result<()> {
    let models = default_models(Arc::new(StaticHistory::new(examples.clone())));
    let trainer = LocalTrainer::new(models, Arc::new(catalog), examples, &engine_cfg.ensemble);
    let participant = Participant::new(ParticipantConfig::from_server(server, client_id), trainer);
    participant.run(stop).await.with_context(|| format!("participant {client_id} failed"))?;
    Ok(())
}

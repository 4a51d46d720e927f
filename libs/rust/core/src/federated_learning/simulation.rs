//! In-process federated runs: one [`SimulatedClient`] per data shard.

use rand::rngs::StdRng;
use rand::SeedableRng;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::info;

use super::client::{FlClient, LocalTrainer, SimulatedClient};
use super::coordinator::Orchestrator;
use super::partition::{partition, synthetic_catalog, Dataset};
use super::protocol::DataSource;
use crate::config::{EnsembleConfig, FederatedConfig};
use crate::registry::ClientRegistry;
use crate::scoring::ScoringModel;
use crate::types::{Candidate, LabeledQuery};

pub struct Simulation {
    pub clients: Vec<Arc<SimulatedClient>>,
    pub data_source: DataSource,
    pub catalog: Arc<Vec<Candidate>>,
}

impl Simulation {
    /// Partitions `examples` (or the synthetic set) over
    /// `cfg.num_simulated_clients` clients named `sim-client-{i}`.
    pub fn build(
        cfg: &FederatedConfig,
        ensemble: &EnsembleConfig,
        models: Vec<Arc<dyn ScoringModel>>,
        catalog: Vec<Candidate>,
        examples: Vec<LabeledQuery>,
    ) -> Self {
        let n = cfg.num_simulated_clients.max(1);
        let dataset = Dataset::real_or_synthetic(examples, n);
        let catalog = match dataset.source {
            DataSource::Synthetic => synthetic_catalog(),
            DataSource::Real if catalog.is_empty() => synthetic_catalog(),
            DataSource::Real => catalog,
        };
        let catalog = Arc::new(catalog);
        let mut rng = match cfg.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        let shards = partition(&dataset.examples, n, cfg.data_split, &mut rng);
        let clients = shards
            .into_iter()
            .enumerate()
            .map(|(i, shard)| {
                let trainer = LocalTrainer::new(models.clone(), catalog.clone(), shard, ensemble);
                Arc::new(SimulatedClient::new(format!("sim-client-{i}"), trainer))
            })
            .collect::<Vec<_>>();
        info!(clients = clients.len(), examples = dataset.examples.len(), source = ?dataset.source, "simulation_built");
        Self { clients, data_source: dataset.source, catalog }
    }

    /// Registers every client and attaches it to the orchestrator.
    pub fn enroll(&self, registry: &ClientRegistry, orchestrator: &Orchestrator) {
        for c in &self.clients {
            let mut caps = BTreeMap::new();
            caps.insert("simulated".to_string(), serde_json::Value::Bool(true));
            registry.register(c.id(), c.num_examples(), caps, BTreeMap::new());
            orchestrator.attach_client(c.clone());
        }
    }
}

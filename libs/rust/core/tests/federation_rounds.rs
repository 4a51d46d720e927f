use async_trait::async_trait;
use medfed_core::config::{EnsembleConfig, FederatedConfig, RegistryConfig};
use medfed_core::federated_learning::{EvaluateIns, EvaluateRes, FitIns, FitRes, Metrics, RunSummary};
use medfed_core::scoring::{FnModel, ScoringModel};
use medfed_core::{
    Candidate, ClientRegistry, ClientStatus, DataSource, FlClient, LabeledQuery, MedFedError, Orchestrator, Simulation, WeightVector,
};
use std::collections::BTreeMap;
use std::sync::Arc;

/// Answers every fit with the same vector.
struct Stub {
    id: String,
    weights: WeightVector,
    examples: u64,
}

#[async_trait]
impl FlClient for Stub {
    fn id(&self) -> &str { &self.id }

    async fn fit(&self, _ins: FitIns) -> medfed_core::Result<FitRes> {
        let metrics: Metrics = [("precision".to_string(), 1.0)].into();
        Ok(FitRes { weights: self.weights.clone(), num_examples: self.examples, metrics })
    }

    async fn evaluate(&self, _ins: EvaluateIns) -> medfed_core::Result<EvaluateRes> {
        Ok(EvaluateRes { loss: 0.25, num_examples: self.examples, metrics: Metrics::new() })
    }
}

struct Broken(String);

#[async_trait]
impl FlClient for Broken {
    fn id(&self) -> &str { &self.0 }

    async fn fit(&self, _ins: FitIns) -> medfed_core::Result<FitRes> {
        Err(MedFedError::ClientReported { client: self.0.clone(), reason: "disk full".into() })
    }

    async fn evaluate(&self, _ins: EvaluateIns) -> medfed_core::Result<EvaluateRes> {
        Err(MedFedError::ClientReported { client: self.0.clone(), reason: "disk full".into() })
    }
}

fn fl_config(rounds: u32) -> FederatedConfig {
    FederatedConfig { num_rounds: rounds, fraction_fit: 1.0, fraction_evaluate: 1.0, min_fit_clients: 2, min_available_clients: 2, seed: Some(42), ..Default::default() }
}

fn enroll(registry: &ClientRegistry, orch: &Orchestrator, client: Arc<dyn FlClient>) {
    registry.register(client.id(), 1, BTreeMap::new(), BTreeMap::new());
    orch.attach_client(client);
}

fn models() -> Vec<Arc<dyn ScoringModel>> {
    vec![
        Arc::new(FnModel::new("first", |_q: &str, c: &[Candidate]| Ok((0..c.len()).map(|i| if i == 0 { 1.0 } else { 0.0 }).collect()))),
        Arc::new(FnModel::new("last", |_q: &str, c: &[Candidate]| Ok((0..c.len()).map(|i| if i + 1 == c.len() { 1.0 } else { 0.0 }).collect()))),
    ]
}

#[tokio::test]
async fn round_weights_are_example_weighted() {
    let registry = Arc::new(ClientRegistry::new(RegistryConfig::default()));
    let orch = Orchestrator::new(fl_config(1), registry.clone(), None);
    enroll(&registry, &orch, Arc::new(Stub { id: "big".into(), weights: WeightVector::normalized_from([("a", 1.0), ("b", 0.0)]), examples: 3 }));
    enroll(&registry, &orch, Arc::new(Stub { id: "small".into(), weights: WeightVector::normalized_from([("a", 0.0), ("b", 1.0)]), examples: 1 }));

    let summary = orch.run(WeightVector::uniform(["a", "b"]), DataSource::Real).await.unwrap();
    assert!(summary.complete);
    let round = &summary.rounds[0];
    assert!((round.weights.get("a").unwrap() - 0.75).abs() < 1e-9);
    assert!(round.weights.is_normalized());
    assert_eq!(round.evaluate_loss, Some(0.25));
    assert_eq!(round.fit_metrics["precision"], 1.0);
    assert_eq!(round.weights_fingerprint.len(), 64);
    assert_eq!(summary.final_weights, round.weights);
}

#[tokio::test]
async fn failing_client_is_dropped_after_max_failures() {
    let registry = Arc::new(ClientRegistry::new(RegistryConfig { max_failures: 3, ..Default::default() }));
    let orch = Orchestrator::new(fl_config(4), registry.clone(), None);
    let w = WeightVector::uniform(["a", "b"]);
    enroll(&registry, &orch, Arc::new(Stub { id: "ok-1".into(), weights: w.clone(), examples: 2 }));
    enroll(&registry, &orch, Arc::new(Stub { id: "ok-2".into(), weights: w.clone(), examples: 2 }));
    enroll(&registry, &orch, Arc::new(Broken("flaky".into())));

    let summary = orch.run(w, DataSource::Real).await.unwrap();
    let failed_per_round: Vec<usize> = summary.rounds.iter().map(|r| r.failed.len()).collect();
    assert_eq!(failed_per_round, vec![1, 1, 1, 0]);
    let mut last = summary.rounds[3].participants.clone();
    last.sort();
    assert_eq!(last, vec!["ok-1", "ok-2"]);
    assert_eq!(registry.get_client("flaky").unwrap().status, ClientStatus::Failed);
    assert_eq!(registry.get_client("ok-1").unwrap().status, ClientStatus::Idle);
}

#[tokio::test]
async fn client_returns_to_idle_after_a_failed_fit() {
    let registry = Arc::new(ClientRegistry::new(RegistryConfig { max_failures: 3, ..Default::default() }));
    let orch = Orchestrator::new(fl_config(1), registry.clone(), None);
    enroll(&registry, &orch, Arc::new(Stub { id: "steady".into(), weights: WeightVector::uniform(["a", "b"]), examples: 2 }));
    enroll(&registry, &orch, Arc::new(Broken("shaky".into())));

    let summary = orch.run(WeightVector::uniform(["a", "b"]), DataSource::Real).await.unwrap();
    assert_eq!(summary.rounds[0].failed, vec!["shaky".to_string()]);
    let shaky = registry.get_client("shaky").unwrap();
    assert_eq!(shaky.status, ClientStatus::Idle);
    assert_eq!(shaky.failure_count, 1);
}

#[tokio::test]
async fn run_requires_enough_clients() {
    let registry = Arc::new(ClientRegistry::new(RegistryConfig::default()));
    let orch = Orchestrator::new(fl_config(1), registry.clone(), None);
    enroll(&registry, &orch, Arc::new(Broken("alone".into())));
    let err = orch.run(WeightVector::uniform(["a"]), DataSource::Real).await.unwrap_err();
    assert!(matches!(err, MedFedError::NotEnoughClients { available: 1, required: 2 }));
    assert!(!orch.is_running());
}

#[tokio::test]
async fn synthetic_simulation_persists_flagged_results() {
    let dir = tempfile::tempdir().unwrap();
    let results = dir.path().join("fl_results.json");
    let cfg = FederatedConfig { num_rounds: 3, num_simulated_clients: 3, ..fl_config(3) };
    let registry = Arc::new(ClientRegistry::new(RegistryConfig::default()));
    let orch = Orchestrator::new(cfg.clone(), registry.clone(), Some(results.clone()));
    let sim = Simulation::build(&cfg, &EnsembleConfig::default(), models(), vec![], vec![]);
    sim.enroll(&registry, &orch);

    let summary = orch.run(WeightVector::uniform(["first", "last"]), sim.data_source).await.unwrap();
    assert_eq!(summary.data_source, DataSource::Synthetic);
    assert_eq!(summary.rounds.len(), 3);
    assert!(summary.rounds.iter().all(|r| r.data_source == DataSource::Synthetic && r.participants.len() == 3));
    assert!(summary.final_weights.is_normalized());

    let saved: RunSummary = serde_json::from_str(&std::fs::read_to_string(&results).unwrap()).unwrap();
    assert!(saved.complete);
    assert_eq!(saved.rounds.len(), 3);
    assert_eq!(saved.final_weights, summary.final_weights);
}

#[tokio::test]
async fn real_examples_are_partitioned_across_clients() {
    let cfg = FederatedConfig { num_simulated_clients: 2, ..fl_config(2) };
    let catalog = vec![Candidate::new("A", ""), Candidate::new("B", "")];
    let examples: Vec<LabeledQuery> = (0..5).map(|i| LabeledQuery::new(format!("query {i}"), ["A"])).collect();
    let sim = Simulation::build(&cfg, &EnsembleConfig::default(), models(), catalog, examples);
    assert_eq!(sim.data_source, DataSource::Real);
    let sizes: Vec<u64> = sim.clients.iter().map(|c| c.num_examples()).collect();
    assert_eq!(sizes, vec![3, 2]);

    let registry = Arc::new(ClientRegistry::new(RegistryConfig::default()));
    let orch = Orchestrator::new(cfg, registry.clone(), None);
    sim.enroll(&registry, &orch);
    let summary = orch.run(WeightVector::uniform(["first", "last"]), sim.data_source).await.unwrap();
    // every label is "A", which only the "first" model scores highest
    assert!(summary.final_weights.get("first").unwrap() > 0.5);
}

use async_trait::async_trait;
use std::sync::Arc;
use tracing::debug;

use super::protocol::{EvaluateIns, EvaluateRes, FitIns, FitRes, Metrics};
use crate::config::EnsembleConfig;
use crate::ensemble::{RecommendationSet, ScoreAggregator};
use crate::error::Result;
use crate::scoring::ScoringModel;
use crate::types::{Candidate, LabeledQuery};

/// A federated participant as seen by the orchestrator: in-process
/// simulation or a proxy for a remote process.
#[async_trait]
pub trait FlClient: Send + Sync {
    fn id(&self) -> &str;
    async fn fit(&self, ins: FitIns) -> Result<FitRes>;
    async fn evaluate(&self, ins: EvaluateIns) -> Result<EvaluateRes>;
}

/// Top-k precision with k = |truth|: share of true items in the first k.
pub fn top_k_precision(set: &RecommendationSet, truth: &[String]) -> f64 {
    if truth.is_empty() { return 0.0; }
    let hits = set.top(truth.len()).filter(|r| truth.contains(&r.candidate.id)).count();
    hits as f64 / truth.len() as f64
}

/// Trains a private ensemble copy on one client's examples.
#[derive(Clone)]
pub struct LocalTrainer {
    models: Vec<Arc<dyn ScoringModel>>,
    catalog: Arc<Vec<Candidate>>,
    examples: Arc<Vec<LabeledQuery>>,
    ensemble: EnsembleConfig,
}

impl LocalTrainer {
    pub fn new(models: Vec<Arc<dyn ScoringModel>>, catalog: Arc<Vec<Candidate>>, examples: Vec<LabeledQuery>, ensemble: &EnsembleConfig) -> Self {
        let ensemble = EnsembleConfig { learnable_weights: false, session_capacity: 4, ..ensemble.clone() };
        Self { models, catalog, examples: Arc::new(examples), ensemble }
    }

    pub fn num_examples(&self) -> u64 { self.examples.len() as u64 }

    fn local_ensemble(&self, weights: crate::types::WeightVector) -> ScoreAggregator {
        let agg = ScoreAggregator::new(self.models.clone(), self.ensemble.clone(), None);
        agg.set_model_weights(weights);
        agg
    }

    fn summarize(precisions: &[f64]) -> Metrics {
        let mean = if precisions.is_empty() { 0.0 } else { precisions.iter().sum::<f64>() / precisions.len() as f64 };
        let mut m = Metrics::new();
        m.insert("precision".into(), mean);
        m.insert("loss".into(), 1.0 - mean);
        m
    }

    /// For each epoch and example: recommend, measure precision, then reward
    /// every true item present in the catalog with `lr / |truth|`.
    pub async fn fit(&self, ins: &FitIns) -> FitRes {
        let agg = self.local_ensemble(ins.weights.clone());
        let mut precisions = Vec::new();
        for _ in 0..ins.local_epochs.max(1) {
            for ex in self.examples.iter() {
                let set = agg.recommend(&ex.query, &self.catalog).await;
                precisions.push(top_k_precision(&set, &ex.items));
                let step = ins.learning_rate / ex.items.len().max(1) as f64;
                for item in ex.items.iter().filter(|i| self.catalog.iter().any(|c| &c.id == *i)) {
                    agg.feedback_for_session(&set.session_id, item, step);
                }
            }
        }
        let metrics = Self::summarize(&precisions);
        debug!(round = ins.round, examples = self.examples.len(), precision = metrics["precision"], "local_fit_done");
        FitRes { weights: agg.get_model_weights(), num_examples: self.num_examples(), metrics }
    }

    pub async fn evaluate(&self, ins: &EvaluateIns) -> EvaluateRes {
        let agg = self.local_ensemble(ins.weights.clone());
        let mut precisions = Vec::with_capacity(self.examples.len());
        for ex in self.examples.iter() {
            let set = agg.recommend(&ex.query, &self.catalog).await;
            precisions.push(top_k_precision(&set, &ex.items));
        }
        let metrics = Self::summarize(&precisions);
        EvaluateRes { loss: metrics["loss"], num_examples: self.num_examples(), metrics }
    }
}

/// In-process participant used by simulations.
pub struct SimulatedClient {
    id: String,
    trainer: LocalTrainer,
}

impl SimulatedClient {
    pub fn new(id: impl Into<String>, trainer: LocalTrainer) -> Self { Self { id: id.into(), trainer } }
    pub fn num_examples(&self) -> u64 { self.trainer.num_examples() }
}

#[async_trait]
impl FlClient for SimulatedClient {
    fn id(&self) -> &str { &self.id }

    async fn fit(&self, ins: FitIns) -> Result<FitRes> { Ok(self.trainer.fit(&ins).await) }

    async fn evaluate(&self, ins: EvaluateIns) -> Result<EvaluateRes> { Ok(self.trainer.evaluate(&ins).await) }
}

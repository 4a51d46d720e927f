use chrono::{DateTime, Utc};
use futures::FutureExt;
use serde::Serialize;
use serde_json::json;
use std::collections::BTreeMap;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{error, info, warn};
use uuid::Uuid;

use super::history::{LearningHistory, NewEvent};
use crate::aggregation::AggregationService;
use crate::ensemble::{FeedbackOutcome, ScoreAggregator, VoteSnapshot};
use crate::metrics_ext::METRICS;
use crate::types::{Candidate, WeightVector};

#[derive(Debug, Clone, Serialize)]
pub struct LearningResult {
    pub learning_count: u64,
    pub event_id: u64,
    pub session_id: Uuid,
    pub selected: String,
    pub weights_before: WeightVector,
    pub weights_after: WeightVector,
    pub delta: WeightVector,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum LearningOutcome {
    Learned(LearningResult),
    Skipped { reason: String },
    Failed { error: String },
}

impl LearningOutcome {
    fn label(&self) -> &'static str {
        match self {
            LearningOutcome::Learned(_) => "learned",
            LearningOutcome::Skipped { .. } => "skipped",
            LearningOutcome::Failed { .. } => "failed",
        }
    }
}

/// Turns one feedback event (what was recommended, what was actually chosen)
/// into a weight update, a history entry and a queued local update.
pub struct IncrementalLearner {
    aggregator: Arc<ScoreAggregator>,
    history: Arc<LearningHistory>,
    aggregation: Option<Arc<AggregationService>>,
    learning_rate: f64,
    count: AtomicU64,
}

impl IncrementalLearner {
    pub fn new(aggregator: Arc<ScoreAggregator>, history: Arc<LearningHistory>, aggregation: Option<Arc<AggregationService>>, learning_rate: f64) -> Self {
        let count = AtomicU64::new(history.len() as u64);
        Self { aggregator, history, aggregation, learning_rate, count }
    }

    pub fn learning_count(&self) -> u64 { self.count.load(Ordering::SeqCst) }
    pub fn current_weights(&self) -> WeightVector { self.aggregator.get_model_weights() }

    /// Never returns an error or unwinds: every problem becomes `Skipped` or `Failed`.
    pub async fn learn_from_prescription(
        &self,
        query: &str,
        recommended: &[String],
        selected: &str,
        universe: &[Candidate],
        session_id: Option<Uuid>,
    ) -> LearningOutcome {
        let fut = AssertUnwindSafe(self.learn_inner(query, recommended, selected, universe, session_id));
        let outcome = match fut.catch_unwind().await {
            Ok(o) => o,
            Err(panic) => {
                let msg = panic
                    .downcast_ref::<&str>()
                    .map(|s| s.to_string())
                    .or_else(|| panic.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "unknown panic".into());
                error!(selected=%selected, error=%msg, "learning_panicked");
                LearningOutcome::Failed { error: format!("panic: {msg}") }
            }
        };
        METRICS.fl.learning_events_total.with_label_values(&[outcome.label()]).inc();
        outcome
    }

    async fn resolve_snapshot(&self, query: &str, selected: &str, universe: &[Candidate], session_id: Option<Uuid>) -> Option<Arc<VoteSnapshot>> {
        let holds = |s: &Arc<VoteSnapshot>| s.position(selected).is_some();
        if let Some(id) = session_id {
            match self.aggregator.session(&id) {
                Some(s) if holds(&s) => return Some(s),
                _ => warn!(session=%id, "learning_session_unusable"),
            }
        }
        if let Some(s) = self.aggregator.latest_snapshot().filter(holds) {
            return Some(s);
        }
        if universe.is_empty() {
            return None;
        }
        warn!(selected=%selected, "learning_regenerating_votes");
        let set = self.aggregator.recommend(query, universe).await;
        self.aggregator.session(&set.session_id)
    }

    async fn learn_inner(&self, query: &str, recommended: &[String], selected: &str, universe: &[Candidate], session_id: Option<Uuid>) -> LearningOutcome {
        let Some(snapshot) = self.resolve_snapshot(query, selected, universe, session_id).await else {
            warn!(selected=%selected, "learning_skipped_no_votes");
            return LearningOutcome::Skipped { reason: "no vote snapshot and no candidates to regenerate one".into() };
        };
        let (before, after) = match self.aggregator.update_weights_from_feedback(&snapshot, selected, self.learning_rate) {
            FeedbackOutcome::Applied { before, after } => (before, after),
            FeedbackOutcome::Skipped { reason } => return LearningOutcome::Skipped { reason: reason.to_string() },
        };
        let delta = after.delta_from(&before);
        let learning_count = self.count.fetch_add(1, Ordering::SeqCst) + 1;

        let event = self.history.append(NewEvent {
            query,
            recommended,
            selected,
            weights_before: before.clone(),
            weights_after: after.clone(),
            delta: delta.clone(),
            learning_count,
        });

        if let Some(agg) = &self.aggregation {
            let mut meta = BTreeMap::new();
            meta.insert("source".to_string(), json!("incremental"));
            meta.insert("selected".to_string(), json!(selected));
            meta.insert("learning_count".to_string(), json!(learning_count));
            agg.add_local_update(after.clone(), meta);
        }

        info!(count = learning_count, selected=%selected, delta=%delta.describe(), "learned_from_prescription");
        LearningOutcome::Learned(LearningResult {
            learning_count,
            event_id: event.id,
            session_id: snapshot.session_id,
            selected: selected.to_string(),
            weights_before: before,
            weights_after: after,
            delta,
            timestamp: event.timestamp,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{AggregationConfig, EnsembleConfig, LearningConfig};
    use crate::scoring::{FnModel, ScoringModel};

    fn setup(models: Vec<Arc<dyn ScoringModel>>) -> (IncrementalLearner, Arc<AggregationService>, Arc<LearningHistory>) {
        let agg = Arc::new(ScoreAggregator::new(models, EnsembleConfig { learnable_weights: false, ..Default::default() }, None));
        let history = Arc::new(LearningHistory::in_memory(LearningConfig::default()));
        let svc = Arc::new(AggregationService::new(AggregationConfig::default(), None, None));
        (IncrementalLearner::new(agg, history.clone(), Some(svc.clone()), 0.1), svc, history)
    }

    fn catalog() -> Vec<Candidate> { vec![Candidate::new("A", ""), Candidate::new("B", "")] }

    #[tokio::test]
    async fn learns_by_regenerating_when_no_snapshot() {
        let m: Arc<dyn ScoringModel> = Arc::new(FnModel::new("m1", |_q: &str, c: &[Candidate]| Ok(vec![0.5; c.len()])));
        let (learner, svc, history) = setup(vec![m]);
        let out = learner.learn_from_prescription("q", &[], "B", &catalog(), None).await;
        assert!(matches!(out, LearningOutcome::Learned(_)));
        assert_eq!(learner.learning_count(), 1);
        assert_eq!(svc.pending_count(), 1);
        assert_eq!(history.len(), 1);
    }

    #[tokio::test]
    async fn skipped_without_votes_or_catalog() {
        let m: Arc<dyn ScoringModel> = Arc::new(FnModel::new("m1", |_q: &str, c: &[Candidate]| Ok(vec![0.5; c.len()])));
        let (learner, svc, _) = setup(vec![m]);
        let out = learner.learn_from_prescription("q", &[], "B", &[], None).await;
        assert!(matches!(out, LearningOutcome::Skipped { .. }));
        assert_eq!(svc.pending_count(), 0);
    }

    #[tokio::test]
    async fn panicking_model_does_not_escape() {
        let m: Arc<dyn ScoringModel> = Arc::new(FnModel::new("boom", |_q: &str, _c: &[Candidate]| -> anyhow::Result<Vec<f64>> { panic!("kaput") }));
        let (learner, _, _) = setup(vec![m]);
        // the panic is contained by the ensemble; learning still proceeds on zero votes
        let out = learner.learn_from_prescription("q", &[], "A", &catalog(), None).await;
        assert!(matches!(out, LearningOutcome::Learned(_)));
    }
}

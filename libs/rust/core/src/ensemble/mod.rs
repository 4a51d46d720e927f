//! Score aggregator: runs every scoring model over one query, blends the
//! scores by the learned weight vector and adapts that vector from feedback.

pub mod smoothing;
pub mod snapshot;

use chrono::Utc;
use futures::future::join_all;
use parking_lot::RwLock;
use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::aggregation::WeightSink;
use crate::config::EnsembleConfig;
use crate::metrics_ext::METRICS;
use crate::persist;
use crate::scoring::ScoringModel;
use crate::types::{Candidate, ScoreVector, WeightVector};

pub use smoothing::{display_vote, stable_offset};
pub use snapshot::{SessionStore, VoteSnapshot};

#[derive(Debug, Clone, Serialize)]
pub struct RankedCandidate {
    pub candidate: Candidate,
    pub final_score: f64,
    /// Per-model votes as shown to users (smoothed, 3 decimals).
    pub votes: BTreeMap<String, f64>,
    /// Per-model scores used for ranking.
    pub raw_votes: BTreeMap<String, f64>,
}

#[derive(Debug, Clone, Serialize)]
pub struct RecommendationSet {
    pub session_id: Uuid,
    pub items: Vec<RankedCandidate>,
    /// Models that contributed a zero vector in this call.
    pub failed_models: Vec<String>,
}

impl RecommendationSet {
    pub fn top(&self, k: usize) -> impl Iterator<Item = &RankedCandidate> { self.items.iter().take(k) }
    pub fn ids(&self) -> Vec<String> { self.items.iter().map(|r| r.candidate.id.clone()).collect() }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "reason", content = "detail", rename_all = "snake_case")]
pub enum SkipReason {
    NoSnapshot,
    UnknownSession(Uuid),
    UnknownCandidate(String),
    InvalidLearningRate(f64),
}

impl fmt::Display for SkipReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SkipReason::NoSnapshot => write!(f, "no recommendation snapshot cached"),
            SkipReason::UnknownSession(id) => write!(f, "session {id} unknown or expired"),
            SkipReason::UnknownCandidate(c) => write!(f, "candidate {c} not in snapshot"),
            SkipReason::InvalidLearningRate(lr) => write!(f, "invalid learning rate {lr}"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum FeedbackOutcome {
    Applied { before: WeightVector, after: WeightVector },
    Skipped { reason: SkipReason },
}

impl FeedbackOutcome {
    pub fn is_applied(&self) -> bool { matches!(self, FeedbackOutcome::Applied { .. }) }
}

#[derive(Debug, Clone, Copy)]
enum FailureKind {
    Error,
    Panic,
    Timeout,
    Shape,
}

impl FailureKind {
    fn as_str(self) -> &'static str {
        match self {
            FailureKind::Error => "error",
            FailureKind::Panic => "panic",
            FailureKind::Timeout => "timeout",
            FailureKind::Shape => "shape",
        }
    }
}

pub struct ScoreAggregator {
    models: Vec<Arc<dyn ScoringModel>>,
    weights: RwLock<WeightVector>,
    sessions: SessionStore,
    cfg: EnsembleConfig,
    weights_path: Option<PathBuf>,
}

impl ScoreAggregator {
    /// Builds the aggregator. When `weights_path` is set and learnable weights
    /// are enabled, a previously saved vector is merged with the model list.
    pub fn new(models: Vec<Arc<dyn ScoringModel>>, cfg: EnsembleConfig, weights_path: Option<PathBuf>) -> Self {
        let weights_path = if cfg.learnable_weights { weights_path } else { None };
        let ids: Vec<String> = models.iter().map(|m| m.id().to_string()).collect();
        let mut weights = WeightVector::uniform(ids.iter().cloned());
        if let Some(path) = &weights_path {
            let stored: Option<WeightVector> = match persist::load_json(path) {
                Ok(v) => v,
                Err(e) => {
                    warn!(path=%path.display(), error=%e, "weights_unreadable_using_defaults");
                    None
                }
            };
            if let Some(stored) = stored {
                let default_w = 1.0 / ids.len().max(1) as f64;
                weights = ids.iter().map(|id| (id.clone(), stored.get(id).unwrap_or(default_w))).collect();
                weights.normalize();
                info!(path=%path.display(), weights=%weights.describe(), "weights_loaded");
            }
        }
        let sessions = SessionStore::new(cfg.session_capacity, cfg.session_ttl());
        Self { models, weights: RwLock::new(weights), sessions, cfg, weights_path }
    }

    pub fn model_ids(&self) -> Vec<String> { self.models.iter().map(|m| m.id().to_string()).collect() }

    pub fn get_model_weights(&self) -> WeightVector { self.weights.read().clone() }

    /// Replaces the weight vector. Always renormalized before it is stored.
    pub fn set_model_weights(&self, weights: WeightVector) -> WeightVector {
        let mut w = weights;
        w.normalize();
        *self.weights.write() = w.clone();
        info!(weights=%w.describe(), "weights_set");
        self.persist(&w);
        w
    }

    fn persist(&self, w: &WeightVector) {
        if let Some(path) = &self.weights_path {
            if let Err(e) = persist::save_json(path, w) {
                error!(path=%path.display(), error=%e, "weights_persist_failed");
            }
        }
    }

    fn effective_weights(&self, current: &WeightVector) -> Vec<f64> {
        let default_w = 1.0 / self.models.len().max(1) as f64;
        self.models.iter().map(|m| current.get(m.id()).unwrap_or(default_w).max(0.0)).collect()
    }

    fn record_failure(model: &str, kind: FailureKind, detail: &str) {
        warn!(model=%model, kind=kind.as_str(), detail=%detail, "model_failed_zero_vector");
        METRICS.ensemble.model_failures_total.with_label_values(&[model, kind.as_str()]).inc();
    }

    async fn run_model(&self, model: Arc<dyn ScoringModel>, query: Arc<str>, candidates: Arc<Vec<Candidate>>) -> (ScoreVector, bool) {
        let n = candidates.len();
        let id = model.id().to_string();
        let task = tokio::task::spawn_blocking(move || model.score(&query, &candidates));
        let outcome = tokio::time::timeout(self.cfg.model_timeout(), task).await;
        let scores = match outcome {
            Err(_) => {
                Self::record_failure(&id, FailureKind::Timeout, &format!("{}ms", self.cfg.model_timeout_ms));
                None
            }
            Ok(Err(join)) => {
                let kind = if join.is_panic() { FailureKind::Panic } else { FailureKind::Error };
                Self::record_failure(&id, kind, &join.to_string());
                None
            }
            Ok(Ok(Err(e))) => {
                Self::record_failure(&id, FailureKind::Error, &format!("{e:#}"));
                None
            }
            Ok(Ok(Ok(v))) if v.len() != n => {
                Self::record_failure(&id, FailureKind::Shape, &format!("expected {n} scores, got {}", v.len()));
                None
            }
            Ok(Ok(Ok(v))) => Some(v),
        };
        match scores {
            Some(v) => (v.into_iter().map(|s| if s.is_finite() { s.clamp(0.0, 1.0) } else { 0.0 }).collect(), true),
            None => (vec![0.0; n], false),
        }
    }

    /// Scores `candidates` with every model and returns them ranked by blended
    /// score. The call's snapshot is kept under the returned session id.
    pub async fn recommend(&self, query: &str, candidates: &[Candidate]) -> RecommendationSet {
        let started = Instant::now();
        let n = candidates.len();
        let shared_query: Arc<str> = Arc::from(query);
        let shared_candidates = Arc::new(candidates.to_vec());

        let results: Vec<(ScoreVector, bool)> = if self.cfg.parallel {
            join_all(self.models.iter().map(|m| self.run_model(m.clone(), shared_query.clone(), shared_candidates.clone()))).await
        } else {
            let mut out = Vec::with_capacity(self.models.len());
            for m in &self.models {
                out.push(self.run_model(m.clone(), shared_query.clone(), shared_candidates.clone()).await);
            }
            out
        };

        let weights_now = self.get_model_weights();
        let w = self.effective_weights(&weights_now);
        let w_total: f64 = w.iter().sum();
        let mut finals = vec![0.0; n];
        if w_total > 0.0 {
            for (wm, (scores, _)) in w.iter().zip(&results) {
                for (f, s) in finals.iter_mut().zip(scores) { *f += wm * s; }
            }
            for f in finals.iter_mut() { *f = (*f / w_total).clamp(0.0, 1.0); }
        }

        let mut order: Vec<usize> = (0..n).collect();
        // stable: equal scores keep catalog order
        order.sort_by(|&a, &b| finals[b].total_cmp(&finals[a]));

        let ids: Vec<&str> = self.models.iter().map(|m| m.id()).collect();
        let items = order
            .iter()
            .map(|&i| {
                let c = &candidates[i];
                let raw_votes: BTreeMap<String, f64> = ids.iter().zip(&results).map(|(id, (s, _))| (id.to_string(), s[i])).collect();
                let votes = raw_votes
                    .iter()
                    .map(|(m, &raw)| (m.clone(), display_vote(raw, finals[i], &c.id, m, self.cfg.interest_threshold)))
                    .collect();
                RankedCandidate { candidate: c.clone(), final_score: finals[i], votes, raw_votes }
            })
            .collect();

        let failed_models: Vec<String> =
            ids.iter().zip(&results).filter(|(_, (_, ok))| !ok).map(|(id, _)| id.to_string()).collect();
        let snapshot = Arc::new(VoteSnapshot {
            session_id: Uuid::new_v4(),
            created_at: Utc::now(),
            query: query.to_string(),
            candidate_ids: candidates.iter().map(|c| c.id.clone()).collect(),
            scores: ids.iter().zip(results).map(|(id, (s, _))| (id.to_string(), s)).collect(),
            weights: weights_now,
        });
        let session_id = snapshot.session_id;
        self.sessions.insert(snapshot);

        METRICS.ensemble.recommendations_total.inc();
        METRICS.ensemble.recommend_latency_seconds.observe(started.elapsed().as_secs_f64());
        debug!(session=%session_id, candidates=n, models=self.models.len(), failed=failed_models.len(),
            elapsed_ms=started.elapsed().as_millis() as u64, "recommendation_served");
        RecommendationSet { session_id, items, failed_models }
    }

    pub fn session(&self, session_id: &Uuid) -> Option<Arc<VoteSnapshot>> { self.sessions.get(session_id) }
    pub fn latest_snapshot(&self) -> Option<Arc<VoteSnapshot>> { self.sessions.latest() }

    /// Models x candidates raw scores plus weights, for explanation consumers.
    /// `None` selects the latest call.
    pub fn vote_matrix(&self, session_id: Option<&Uuid>) -> Option<Arc<VoteSnapshot>> {
        match session_id {
            Some(id) => self.sessions.get(id),
            None => self.sessions.latest(),
        }
    }

    pub fn feedback_for_session(&self, session_id: &Uuid, selected_id: &str, learning_rate: f64) -> FeedbackOutcome {
        match self.sessions.get(session_id) {
            Some(s) => self.update_weights_from_feedback(&s, selected_id, learning_rate),
            None => Self::skipped(SkipReason::UnknownSession(*session_id)),
        }
    }

    pub fn feedback_latest(&self, selected_id: &str, learning_rate: f64) -> FeedbackOutcome {
        match self.sessions.latest() {
            Some(s) => self.update_weights_from_feedback(&s, selected_id, learning_rate),
            None => Self::skipped(SkipReason::NoSnapshot),
        }
    }

    fn skipped(reason: SkipReason) -> FeedbackOutcome {
        warn!(reason=%reason, "feedback_skipped");
        METRICS.ensemble.feedback_total.with_label_values(&["skipped"]).inc();
        FeedbackOutcome::Skipped { reason }
    }

    /// Rewards models that ranked `selected_id` highly in `snapshot`.
    ///
    /// Per model, performance is the share of candidates scored at or below the
    /// selection; performances are normalized to sum 1 and blended in with
    /// `new = (1 - lr) * old + lr * perf`.
    pub fn update_weights_from_feedback(&self, snapshot: &VoteSnapshot, selected_id: &str, learning_rate: f64) -> FeedbackOutcome {
        if !learning_rate.is_finite() {
            return Self::skipped(SkipReason::InvalidLearningRate(learning_rate));
        }
        let lr = learning_rate.clamp(0.0, 1.0);
        let Some(sel) = snapshot.position(selected_id) else {
            return Self::skipped(SkipReason::UnknownCandidate(selected_id.to_string()));
        };
        let n = snapshot.candidate_count() as f64;

        let mut perf: BTreeMap<&str, f64> = snapshot
            .scores
            .iter()
            .map(|(m, s)| {
                let at_or_below = s.iter().filter(|v| **v <= s[sel]).count() as f64;
                (m.as_str(), at_or_below / n)
            })
            .collect();
        let total: f64 = perf.values().sum();
        if total > 0.0 {
            for p in perf.values_mut() { *p /= total; }
        } else if !perf.is_empty() {
            let u = 1.0 / perf.len() as f64;
            for p in perf.values_mut() { *p = u; }
        }

        let (before, after) = {
            let mut guard = self.weights.write();
            let before = guard.clone();
            let mut next: WeightVector = before
                .iter()
                .map(|(m, old)| (m.clone(), (1.0 - lr) * old + lr * perf.get(m.as_str()).copied().unwrap_or(0.0)))
                .collect();
            for (m, p) in &perf {
                if !next.contains(m) { next.insert(*m, lr * p); }
            }
            next.normalize();
            *guard = next.clone();
            (before, next)
        };
        self.persist(&after);
        METRICS.ensemble.feedback_total.with_label_values(&["applied"]).inc();
        info!(session=%snapshot.session_id, selected=%selected_id, lr, weights=%after.describe(), "feedback_applied");
        FeedbackOutcome::Applied { before, after }
    }
}

impl WeightSink for ScoreAggregator {
    fn apply_global(&self, weights: &WeightVector) {
        let known = self.model_ids();
        let filtered: WeightVector = weights.iter().filter(|(k, _)| known.contains(k)).map(|(k, v)| (k.clone(), *v)).collect();
        if filtered.is_empty() {
            warn!("global_weights_share_no_models");
            return;
        }
        self.set_model_weights(filtered);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scoring::FnModel;
    use crate::types::WEIGHT_SUM_EPSILON;

    fn fixed(id: &str, scores: Vec<f64>) -> Arc<dyn ScoringModel> {
        Arc::new(FnModel::new(id, move |_q: &str, _c: &[Candidate]| Ok(scores.clone())))
    }

    fn pair() -> Vec<Candidate> { vec![Candidate::new("Paracetamol", ""), Candidate::new("Ibuprofen", "")] }

    fn cfg() -> EnsembleConfig { EnsembleConfig { learnable_weights: false, ..Default::default() } }

    #[tokio::test]
    async fn equal_weights_tie_keeps_catalog_order() {
        let agg = ScoreAggregator::new(vec![fixed("semantic", vec![0.9, 0.2]), fixed("tfidf", vec![0.1, 0.8])], cfg(), None);
        let set = agg.recommend("fever", &pair()).await;
        assert_eq!(set.ids(), vec!["Paracetamol", "Ibuprofen"]);
        assert!((set.items[0].final_score - 0.5).abs() < 1e-12);
        assert!((set.items[1].final_score - 0.5).abs() < 1e-12);
    }

    #[tokio::test]
    async fn weights_shift_the_ranking() {
        let agg = ScoreAggregator::new(vec![fixed("semantic", vec![0.9, 0.2]), fixed("tfidf", vec![0.1, 0.8])], cfg(), None);
        agg.set_model_weights(WeightVector::normalized_from([("semantic", 1.0), ("tfidf", 3.0)]));
        let set = agg.recommend("fever", &pair()).await;
        assert_eq!(set.items[0].candidate.id, "Ibuprofen");
    }

    #[tokio::test]
    async fn sequential_mode_matches_parallel() {
        let models = || vec![fixed("a", vec![0.3, 0.6]), fixed("b", vec![0.9, 0.0])];
        let par = ScoreAggregator::new(models(), cfg(), None).recommend("q", &pair()).await;
        let seq = ScoreAggregator::new(models(), EnsembleConfig { parallel: false, ..cfg() }, None).recommend("q", &pair()).await;
        assert_eq!(par.ids(), seq.ids());
    }

    #[tokio::test]
    async fn feedback_rewards_model_that_ranked_selection_first() {
        let agg = ScoreAggregator::new(vec![fixed("semantic", vec![0.9, 0.2]), fixed("tfidf", vec![0.1, 0.8])], cfg(), None);
        let set = agg.recommend("fever", &pair()).await;
        let out = agg.feedback_for_session(&set.session_id, "Ibuprofen", 0.2);
        let FeedbackOutcome::Applied { before, after } = out else { panic!("expected applied") };
        assert!(after.get("tfidf").unwrap() > before.get("tfidf").unwrap());
        assert!((after.sum() - 1.0).abs() <= WEIGHT_SUM_EPSILON);
    }

    #[tokio::test]
    async fn feedback_without_snapshot_is_skipped() {
        let agg = ScoreAggregator::new(vec![fixed("a", vec![0.5])], cfg(), None);
        let before = agg.get_model_weights();
        assert_eq!(agg.feedback_latest("x", 0.1), FeedbackOutcome::Skipped { reason: SkipReason::NoSnapshot });
        agg.recommend("q", &[Candidate::new("y", "")]).await;
        assert!(matches!(agg.feedback_latest("x", 0.1), FeedbackOutcome::Skipped { reason: SkipReason::UnknownCandidate(_) }));
        assert!(matches!(agg.feedback_latest("y", f64::NAN), FeedbackOutcome::Skipped { reason: SkipReason::InvalidLearningRate(_) }));
        assert_eq!(agg.get_model_weights(), before);
    }

    #[tokio::test]
    async fn smoothing_never_changes_ranking_scores() {
        let agg = ScoreAggregator::new(vec![fixed("a", vec![0.0, 0.4]), fixed("b", vec![0.0, 0.4])], cfg(), None);
        let set = agg.recommend("q", &pair()).await;
        let top = &set.items[0];
        assert_eq!(top.candidate.id, "Ibuprofen");
        assert_eq!(top.raw_votes["a"], 0.4);
        let bottom = &set.items[1];
        assert_eq!(bottom.final_score, 0.0);
        assert_eq!(bottom.votes["a"], 0.0);
    }

    #[tokio::test]
    async fn weights_persist_and_reload() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("w.json");
        let cfg = EnsembleConfig::default();
        let models = || vec![fixed("semantic", vec![0.5]), fixed("tfidf", vec![0.5])];
        let agg = ScoreAggregator::new(models(), cfg.clone(), Some(path.clone()));
        agg.set_model_weights(WeightVector::normalized_from([("semantic", 3.0), ("tfidf", 1.0)]));
        let reloaded = ScoreAggregator::new(models(), cfg, Some(path));
        assert!((reloaded.get_model_weights().get("semantic").unwrap() - 0.75).abs() < 1e-9);
    }
}

//! Pluggable scoring models and the four built-in ones.
//!
//! A model maps `(query, candidates)` to one score per candidate. The ensemble
//! treats every model as untrusted: errors, panics, wrong lengths and slow
//! calls are all absorbed there, so implementations may simply return `Err`.

pub mod collaborative;
pub mod knowledge;
pub mod semantic;
pub mod text;
pub mod tfidf;

use std::sync::Arc;

use crate::types::{Candidate, ScoreVector};

pub use collaborative::{CollaborativeModel, PrescriptionHistory, StaticHistory};
pub use knowledge::KnowledgeModel;
pub use semantic::SemanticModel;
pub use tfidf::TfidfModel;

pub trait ScoringModel: Send + Sync {
    /// Stable id, also the key in the weight vector.
    fn id(&self) -> &str;

    /// One score in [0,1] per candidate, same order as `candidates`.
    fn score(&self, query: &str, candidates: &[Candidate]) -> anyhow::Result<ScoreVector>;
}

/// Adapter turning a closure into a model. Handy for wiring external scorers.
pub struct FnModel<F> {
    id: String,
    f: F,
}

impl<F> FnModel<F>
where
    F: Fn(&str, &[Candidate]) -> anyhow::Result<ScoreVector> + Send + Sync,
{
    pub fn new(id: impl Into<String>, f: F) -> Self { Self { id: id.into(), f } }
}

impl<F> ScoringModel for FnModel<F>
where
    F: Fn(&str, &[Candidate]) -> anyhow::Result<ScoreVector> + Send + Sync,
{
    fn id(&self) -> &str { &self.id }
    fn score(&self, query: &str, candidates: &[Candidate]) -> anyhow::Result<ScoreVector> { (self.f)(query, candidates) }
}

/// `semantic`, `tfidf`, `knowledge`, `collaborative`, in that order.
pub fn default_models(history: Arc<dyn PrescriptionHistory>) -> Vec<Arc<dyn ScoringModel>> {
    vec![
        Arc::new(SemanticModel::default()),
        Arc::new(TfidfModel::default()),
        Arc::new(KnowledgeModel::default()),
        Arc::new(CollaborativeModel::new(history)),
    ]
}

/// Divides by the maximum when it is positive; leaves all-zero vectors alone.
pub(crate) fn normalize_by_max(scores: &mut [f64]) {
    let max = scores.iter().copied().fold(0.0f64, f64::max);
    if max > 0.0 {
        for s in scores.iter_mut() { *s /= max; }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::LabeledQuery;

    #[test]
    fn default_model_ids() {
        let models = default_models(Arc::new(StaticHistory::default()));
        let ids: Vec<&str> = models.iter().map(|m| m.id()).collect();
        assert_eq!(ids, ["semantic", "tfidf", "knowledge", "collaborative"]);
    }

    #[test]
    fn builtins_stay_in_range() {
        let catalog = vec![
            Candidate::new("Paracetamol", "analgesic and antipyretic for fever and pain").with_usage(12),
            Candidate::new("Cetirizine", "antihistamine for allergy and itching").with_usage(3),
            Candidate::new("Omeprazole", "proton pump inhibitor for acidity").with_usage(0),
        ];
        let history = StaticHistory::new(vec![LabeledQuery::new("fever and headache", ["Paracetamol"])]);
        for m in default_models(Arc::new(history)) {
            let s = m.score("fever with headache", &catalog).unwrap();
            assert_eq!(s.len(), catalog.len(), "{}", m.id());
            assert!(s.iter().all(|v| (0.0..=1.0).contains(v)), "{} {:?}", m.id(), s);
        }
    }

    #[test]
    fn fn_model_delegates() {
        let m = FnModel::new("const", |_q: &str, c: &[Candidate]| Ok(vec![0.5; c.len()]));
        assert_eq!(m.id(), "const");
        assert_eq!(m.score("x", &[Candidate::new("a", "")]).unwrap(), vec![0.5]);
    }
}

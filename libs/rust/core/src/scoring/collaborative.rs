use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use super::{normalize_by_max, ScoringModel};
use crate::types::{Candidate, LabeledQuery, ScoreVector};

const SIMILARITY_THRESHOLD: f64 = 0.1;
const FREQUENCY_BOOST: f64 = 0.1;

/// Source of past prescriptions. Implemented by the learning history.
pub trait PrescriptionHistory: Send + Sync {
    fn prescriptions(&self) -> Vec<LabeledQuery>;
}

/// Fixed in-memory history, e.g. loaded from an examples file.
#[derive(Debug, Clone, Default)]
pub struct StaticHistory(Vec<LabeledQuery>);

impl StaticHistory {
    pub fn new(records: Vec<LabeledQuery>) -> Self { Self(records) }
}

impl PrescriptionHistory for StaticHistory {
    fn prescriptions(&self) -> Vec<LabeledQuery> { self.0.clone() }
}

fn words(text: &str) -> HashSet<String> { text.to_lowercase().split_whitespace().map(str::to_string).collect() }

/// Scores items by how often they were chosen for similar past queries
/// (word-set Jaccard above 0.1). Without any history it ranks by usage frequency.
pub struct CollaborativeModel {
    history: Arc<dyn PrescriptionHistory>,
}

impl CollaborativeModel {
    pub fn new(history: Arc<dyn PrescriptionHistory>) -> Self { Self { history } }

    fn similar_item_scores(query: &str, history: &[LabeledQuery]) -> HashMap<String, f64> {
        let q = words(query);
        let mut scores: HashMap<String, f64> = HashMap::new();
        for record in history {
            let h = words(&record.query);
            let union = q.union(&h).count();
            if union == 0 { continue; }
            let sim = q.intersection(&h).count() as f64 / union as f64;
            if sim > SIMILARITY_THRESHOLD {
                for item in record.items.iter().filter(|i| !i.is_empty()) {
                    *scores.entry(item.clone()).or_default() += sim;
                }
            }
        }
        scores
    }
}

impl ScoringModel for CollaborativeModel {
    fn id(&self) -> &str { "collaborative" }

    fn score(&self, query: &str, candidates: &[Candidate]) -> anyhow::Result<ScoreVector> {
        if query.trim().is_empty() || candidates.is_empty() {
            return Ok(vec![0.0; candidates.len()]);
        }
        let history = self.history.prescriptions();
        let mut scores: Vec<f64> = if history.is_empty() {
            candidates.iter().map(|c| c.usage_frequency.max(0) as f64).collect()
        } else {
            let by_item = Self::similar_item_scores(query, &history);
            candidates
                .iter()
                .map(|c| match by_item.get(&c.id) {
                    Some(s) => s + c.usage_frequency.max(0) as f64 * FREQUENCY_BOOST,
                    None => 0.0,
                })
                .collect()
        };
        normalize_by_max(&mut scores);
        Ok(scores)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn catalog() -> Vec<Candidate> {
        vec![
            Candidate::new("Paracetamol", "").with_usage(10),
            Candidate::new("Ibuprofen", "").with_usage(5),
            Candidate::new("Antacid", "").with_usage(0),
        ]
    }

    #[test]
    fn no_history_falls_back_to_usage() {
        let m = CollaborativeModel::new(Arc::new(StaticHistory::default()));
        assert_eq!(m.score("fever", &catalog()).unwrap(), vec![1.0, 0.5, 0.0]);
    }

    #[test]
    fn similar_queries_vote_for_their_items() {
        let h = StaticHistory::new(vec![
            LabeledQuery::new("fever headache", ["Ibuprofen"]),
            LabeledQuery::new("stomach pain", ["Antacid"]),
        ]);
        let m = CollaborativeModel::new(Arc::new(h));
        let s = m.score("fever headache", &catalog()).unwrap();
        assert_eq!(s[0], 0.0);
        assert_eq!(s[1], 1.0);
        assert_eq!(s[2], 0.0);
    }
}

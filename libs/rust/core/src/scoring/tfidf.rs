use std::collections::{HashMap, HashSet};

use super::text::{content_tokens, dot_sparse, l2_normalize_sparse, unigrams_and_bigrams, SparseVector};
use super::ScoringModel;
use crate::types::{Candidate, ScoreVector};

/// TF-IDF over unigrams and bigrams, refitted on every call with the query and
/// the candidate texts as the corpus. Scores are query/candidate cosines.
pub struct TfidfModel {
    max_features: usize,
}

impl Default for TfidfModel {
    fn default() -> Self { Self { max_features: 1000 } }
}

impl TfidfModel {
    fn vocabulary(&self, docs: &[Vec<String>]) -> HashSet<String> {
        let mut totals: HashMap<&str, usize> = HashMap::new();
        for doc in docs {
            for term in doc { *totals.entry(term.as_str()).or_default() += 1; }
        }
        let mut ranked: Vec<(&str, usize)> = totals.into_iter().collect();
        // most frequent first, alphabetical among ties
        ranked.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(b.0)));
        ranked.into_iter().take(self.max_features).map(|(t, _)| t.to_string()).collect()
    }
}

impl ScoringModel for TfidfModel {
    fn id(&self) -> &str { "tfidf" }

    fn score(&self, query: &str, candidates: &[Candidate]) -> anyhow::Result<ScoreVector> {
        if query.trim().is_empty() || candidates.is_empty() {
            return Ok(vec![0.0; candidates.len()]);
        }
        let docs: Vec<Vec<String>> = std::iter::once(query.to_string())
            .chain(candidates.iter().map(Candidate::text))
            .map(|t| unigrams_and_bigrams(&content_tokens(&t)))
            .collect();
        let vocab = self.vocabulary(&docs);
        if vocab.is_empty() {
            return Ok(vec![0.0; candidates.len()]);
        }

        let n_docs = docs.len() as f64;
        let mut df: HashMap<&str, f64> = HashMap::new();
        for doc in &docs {
            let unique: HashSet<&str> = doc.iter().map(String::as_str).filter(|t| vocab.contains(*t)).collect();
            for t in unique { *df.entry(t).or_default() += 1.0; }
        }

        let vectors: Vec<SparseVector> = docs
            .iter()
            .map(|doc| {
                let mut v = SparseVector::new();
                for t in doc.iter().filter(|t| vocab.contains(*t)) { *v.entry(t.clone()).or_default() += 1.0; }
                for (t, tf) in v.iter_mut() {
                    let d = df.get(t.as_str()).copied().unwrap_or(0.0);
                    *tf *= ((1.0 + n_docs) / (1.0 + d)).ln() + 1.0;
                }
                l2_normalize_sparse(&mut v);
                v
            })
            .collect();

        let q = &vectors[0];
        Ok(vectors[1..].iter().map(|c| dot_sparse(q, c).clamp(0.0, 1.0)).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn catalog() -> Vec<Candidate> {
        vec![
            Candidate::new("Cough Syrup", "relieves dry cough and sore throat"),
            Candidate::new("Antacid", "neutralizes stomach acid"),
        ]
    }

    #[test]
    fn shared_terms_rank_higher() {
        let s = TfidfModel::default().score("dry cough", &catalog()).unwrap();
        assert!(s[0] > 0.0);
        assert_eq!(s[1], 0.0);
    }

    #[test]
    fn empty_query_scores_zero() {
        assert_eq!(TfidfModel::default().score("   ", &catalog()).unwrap(), vec![0.0, 0.0]);
    }

    #[test]
    fn only_stop_words_scores_zero() {
        assert_eq!(TfidfModel::default().score("and the of", &catalog()).unwrap()[0], 0.0);
    }
}

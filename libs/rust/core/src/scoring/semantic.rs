use sha2::{Digest, Sha256};

use super::text::{cosine_dense, tokenize};
use super::ScoringModel;
use crate::types::{Candidate, ScoreVector};

pub const EMBEDDING_DIM: usize = 256;

/// Dense text similarity from hashed word and character-trigram features.
///
/// Each feature lands in one of `dim` buckets with a hash-derived sign; the
/// trigram features let inflections ("cough"/"coughing") still overlap.
pub struct SemanticModel {
    dim: usize,
}

impl Default for SemanticModel {
    fn default() -> Self { Self { dim: EMBEDDING_DIM } }
}

impl SemanticModel {
    fn add_feature(&self, v: &mut [f64], feature: &str, weight: f64) {
        let digest = Sha256::digest(feature.as_bytes());
        let mut idx = [0u8; 8];
        idx.copy_from_slice(&digest[..8]);
        let bucket = (u64::from_le_bytes(idx) % self.dim as u64) as usize;
        let sign = if digest[8] & 1 == 0 { 1.0 } else { -1.0 };
        v[bucket] += sign * weight;
    }

    pub fn embed(&self, text: &str) -> Vec<f64> {
        let mut v = vec![0.0; self.dim];
        for word in tokenize(text) {
            self.add_feature(&mut v, &format!("w:{word}"), 1.0);
            let padded: Vec<char> = format!(" {word} ").chars().collect();
            for tri in padded.windows(3) {
                let tri: String = tri.iter().collect();
                self.add_feature(&mut v, &format!("c:{tri}"), 0.5);
            }
        }
        v
    }
}

impl ScoringModel for SemanticModel {
    fn id(&self) -> &str { "semantic" }

    fn score(&self, query: &str, candidates: &[Candidate]) -> anyhow::Result<ScoreVector> {
        if query.trim().is_empty() {
            return Ok(vec![0.0; candidates.len()]);
        }
        let q = self.embed(query);
        Ok(candidates.iter().map(|c| cosine_dense(&q, &self.embed(&c.text())).clamp(0.0, 1.0)).collect())
    }
}

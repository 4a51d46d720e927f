//! Cosmetic display floor for per-model votes. Never used for ranking.

use sha2::{Digest, Sha256};

pub const DISPLAY_FLOOR: f64 = 0.05;

/// Offset in [0, 0.049] derived from SHA-256 of `(candidate, model)`.
/// Stable across processes and platforms.
pub fn stable_offset(candidate_id: &str, model_id: &str) -> f64 {
    let mut hasher = Sha256::new();
    hasher.update(candidate_id.as_bytes());
    hasher.update([0x1f]);
    hasher.update(model_id.as_bytes());
    let digest = hasher.finalize();
    let mut head = [0u8; 8];
    head.copy_from_slice(&digest[..8]);
    (u64::from_be_bytes(head) % 50) as f64 / 1000.0
}

pub fn round3(x: f64) -> f64 { (x * 1000.0).round() / 1000.0 }

/// Vote shown next to a recommendation. When the blended score clears
/// `threshold`, near-zero votes are lifted to a per-pair floor.
pub fn display_vote(raw: f64, final_score: f64, candidate_id: &str, model_id: &str, threshold: f64) -> f64 {
    let shown = if final_score > threshold {
        raw.max(DISPLAY_FLOOR + stable_offset(candidate_id, model_id)).min(1.0)
    } else {
        raw
    };
    round3(shown)
}

//! Federated averaging over weight vectors.

use std::collections::BTreeSet;

use crate::types::WeightVector;

/// Plain mean over `updates`: a key missing from an update counts as 0 for
/// that update. Renormalized. `None` for no input.
pub fn fed_avg(updates: &[WeightVector]) -> Option<WeightVector> {
    let weighted: Vec<(&WeightVector, u64)> = updates.iter().map(|u| (u, 1)).collect();
    weighted_fed_avg(&weighted)
}

/// Sample-count weighted mean. Each update is weighted by
/// `sample_count / total_samples`; when every count is 0 all updates weigh the same.
pub fn weighted_fed_avg(updates: &[(&WeightVector, u64)]) -> Option<WeightVector> {
    if updates.is_empty() { return None; }
    let keys: BTreeSet<&String> = updates.iter().flat_map(|(w, _)| w.keys()).collect();
    let total_samples: u64 = updates.iter().map(|(_, n)| *n).sum();
    let share = |n: u64| {
        if total_samples == 0 { 1.0 / updates.len() as f64 } else { n as f64 / total_samples as f64 }
    };
    let mut out: WeightVector = keys
        .into_iter()
        .map(|k| {
            let v: f64 = updates.iter().map(|(w, n)| w.get(k).unwrap_or(0.0) * share(*n)).sum();
            (k.clone(), v)
        })
        .collect();
    out.normalize();
    Some(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::WEIGHT_SUM_EPSILON;

    fn w(pairs: &[(&str, f64)]) -> WeightVector { pairs.iter().map(|(k, v)| (k.to_string(), *v)).collect() }

    #[test]
    fn equal_counts_give_plain_mean() {
        let out = fed_avg(&[w(&[("semantic", 0.6), ("tfidf", 0.4)]), w(&[("semantic", 0.2), ("tfidf", 0.8)])]).unwrap();
        assert!((out.get("semantic").unwrap() - 0.4).abs() < 1e-9);
        assert!((out.get("tfidf").unwrap() - 0.6).abs() < 1e-9);
    }

    #[test]
    fn missing_keys_count_as_zero() {
        let out = fed_avg(&[w(&[("a", 1.0)]), w(&[("a", 0.5), ("b", 0.5)])]).unwrap();
        // raw means a=0.75, b=0.25 already sum to 1
        assert!((out.get("a").unwrap() - 0.75).abs() < 1e-9);
        assert!((out.get("b").unwrap() - 0.25).abs() < 1e-9);
    }

    #[test]
    fn sample_counts_weight_the_mean() {
        let a = w(&[("x", 1.0), ("y", 0.0)]);
        let b = w(&[("x", 0.0), ("y", 1.0)]);
        let out = weighted_fed_avg(&[(&a, 30), (&b, 10)]).unwrap();
        assert!((out.get("x").unwrap() - 0.75).abs() < 1e-9);
        assert!((out.sum() - 1.0).abs() <= WEIGHT_SUM_EPSILON);
    }

    #[test]
    fn empty_input() {
        assert!(fed_avg(&[]).is_none());
    }
}

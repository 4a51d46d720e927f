//! Messages exchanged between the round orchestrator and its clients. The
//! transported parameter is the weight vector itself.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::types::WeightVector;

/// Scalar metrics reported by a client (precision, loss, ...).
pub type Metrics = BTreeMap<String, f64>;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FitIns {
    pub round: u32,
    pub weights: WeightVector,
    pub local_epochs: u32,
    pub learning_rate: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FitRes {
    pub weights: WeightVector,
    pub num_examples: u64,
    #[serde(default)]
    pub metrics: Metrics,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvaluateIns {
    pub round: u32,
    pub weights: WeightVector,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvaluateRes {
    pub loss: f64,
    pub num_examples: u64,
    #[serde(default)]
    pub metrics: Metrics,
}

/// Where a run's training data came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DataSource {
    Real,
    Synthetic,
}

/// Example-count weighted mean of each metric key. Keys absent from a report
/// are averaged over the reports that carry them.
pub fn weighted_metrics<'a, I>(reports: I) -> Metrics
where
    I: IntoIterator<Item = (u64, &'a Metrics)>,
{
    let mut sums: BTreeMap<String, (f64, f64)> = BTreeMap::new();
    for (n, metrics) in reports {
        let w = n as f64;
        for (k, v) in metrics.iter().filter(|(_, v)| v.is_finite()) {
            let e = sums.entry(k.clone()).or_insert((0.0, 0.0));
            e.0 += v * w;
            e.1 += w;
        }
    }
    sums.into_iter().filter(|(_, (_, w))| *w > 0.0).map(|(k, (s, w))| (k, s / w)).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn metrics_weighted_by_examples() {
        let a: Metrics = [("precision".to_string(), 1.0)].into();
        let b: Metrics = [("precision".to_string(), 0.0), ("loss".to_string(), 1.0)].into();
        let out = weighted_metrics([(3, &a), (1, &b)]);
        assert!((out["precision"] - 0.75).abs() < 1e-12);
        assert!((out["loss"] - 1.0).abs() < 1e-12);
    }

    #[test]
    fn fit_ins_wire_format() {
        let ins = FitIns { round: 2, weights: WeightVector::uniform(["a"]), local_epochs: 1, learning_rate: 0.1 };
        let v = serde_json::to_value(&ins).unwrap();
        assert_eq!(v["weights"]["a"], 1.0);
        assert_eq!(serde_json::from_value::<FitIns>(v).unwrap(), ins);
    }
}

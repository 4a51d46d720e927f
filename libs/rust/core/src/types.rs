//! Core data model: candidates and the blending weight vector.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Tolerance used when checking that a weight vector is normalized.
pub const WEIGHT_SUM_EPSILON: f64 = 1e-6;

/// An item that can be recommended. `id` is the unique key (the item name).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Candidate {
    #[serde(alias = "name")]
    pub id: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub stock_level: i64,
    #[serde(default, alias = "prescription_frequency")]
    pub usage_frequency: i64,
}

impl Candidate {
    pub fn new(id: impl Into<String>, description: impl Into<String>) -> Self {
        Self { id: id.into(), description: description.into(), stock_level: 0, usage_frequency: 0 }
    }

    pub fn with_stock(mut self, stock_level: i64) -> Self { self.stock_level = stock_level; self }
    pub fn with_usage(mut self, usage_frequency: i64) -> Self { self.usage_frequency = usage_frequency; self }

    /// Text the lexical models match against.
    pub fn text(&self) -> String { format!("{} {}", self.id, self.description) }
}

/// A query paired with the items actually chosen for it. Used as training
/// data for federated rounds and as history for collaborative scoring.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LabeledQuery {
    #[serde(alias = "symptoms")]
    pub query: String,
    #[serde(alias = "medicines")]
    pub items: Vec<String>,
}

impl LabeledQuery {
    pub fn new<I, S>(query: impl Into<String>, items: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self { query: query.into(), items: items.into_iter().map(Into::into).collect() }
    }
}

/// One model's scores for one call, aligned 1:1 with the candidate list.
pub type ScoreVector = Vec<f64>;

/// Model id -> non-negative weight. Kept ordered so serialized artifacts are stable.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct WeightVector(BTreeMap<String, f64>);

impl WeightVector {
    pub fn new() -> Self { Self(BTreeMap::new()) }

    /// Equal weight for every id, already normalized.
    pub fn uniform<I, S>(ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut map: BTreeMap<String, f64> = ids.into_iter().map(|id| (id.into(), 1.0)).collect();
        let n = map.len() as f64;
        for v in map.values_mut() { *v /= n; }
        Self(map)
    }

    /// Builds a vector from raw pairs and normalizes it.
    pub fn normalized_from<I, S>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (S, f64)>,
        S: Into<String>,
    {
        let mut w = Self(pairs.into_iter().map(|(k, v)| (k.into(), v)).collect());
        w.normalize();
        w
    }

    pub fn get(&self, id: &str) -> Option<f64> { self.0.get(id).copied() }
    pub fn insert(&mut self, id: impl Into<String>, weight: f64) { self.0.insert(id.into(), weight); }
    pub fn contains(&self, id: &str) -> bool { self.0.contains_key(id) }
    pub fn len(&self) -> usize { self.0.len() }
    pub fn is_empty(&self) -> bool { self.0.is_empty() }
    pub fn keys(&self) -> impl Iterator<Item = &String> { self.0.keys() }
    pub fn iter(&self) -> impl Iterator<Item = (&String, &f64)> { self.0.iter() }
    pub fn sum(&self) -> f64 { self.0.values().sum() }
    pub fn as_map(&self) -> &BTreeMap<String, f64> { &self.0 }

    /// Clamps negatives and non-finite entries to zero, then scales to sum 1.
    /// A zero total falls back to uniform over the existing keys.
    pub fn normalize(&mut self) {
        for v in self.0.values_mut() {
            if !v.is_finite() || *v < 0.0 { *v = 0.0; }
        }
        let total = self.sum();
        if total > 0.0 {
            for v in self.0.values_mut() { *v /= total; }
        } else if !self.0.is_empty() {
            let n = self.0.len() as f64;
            for v in self.0.values_mut() { *v = 1.0 / n; }
        }
    }

    pub fn is_normalized(&self) -> bool {
        !self.0.is_empty() && (self.sum() - 1.0).abs() <= WEIGHT_SUM_EPSILON
    }

    /// Per-key `self - before`, over the union of keys (missing = 0).
    pub fn delta_from(&self, before: &WeightVector) -> WeightVector {
        let mut out = BTreeMap::new();
        for k in self.0.keys().chain(before.0.keys()) {
            let d = self.get(k).unwrap_or(0.0) - before.get(k).unwrap_or(0.0);
            out.insert(k.clone(), d);
        }
        WeightVector(out)
    }

    /// Ordered `model=weight` list used in log lines.
    pub fn describe(&self) -> String {
        self.0.iter().map(|(k, v)| format!("{k}={v:.4}")).collect::<Vec<_>>().join(",")
    }
}

impl FromIterator<(String, f64)> for WeightVector {
    fn from_iter<T: IntoIterator<Item = (String, f64)>>(iter: T) -> Self { Self(iter.into_iter().collect()) }
}

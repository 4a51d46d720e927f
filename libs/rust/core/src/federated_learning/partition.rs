//! Splitting training examples across simulated clients.

use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::Rng;
use tracing::warn;

use super::protocol::DataSource;
use crate::config::DataSplit;
use crate::types::{Candidate, LabeledQuery};

const NON_IID_VARIATION: f64 = 0.3;

/// Fixed fallback examples, repeated once per client.
pub fn synthetic_examples(num_clients: usize) -> Vec<LabeledQuery> {
    let base = [
        LabeledQuery::new("fever headache", ["Paracetamol", "Ibuprofen"]),
        LabeledQuery::new("cough cold", ["Cough Syrup", "Decongestant"]),
        LabeledQuery::new("stomach pain", ["Antacid", "Omeprazole"]),
    ];
    (0..num_clients.max(1)).flat_map(|_| base.iter().cloned()).collect()
}

/// Catalog covering every item named by [`synthetic_examples`].
pub fn synthetic_catalog() -> Vec<Candidate> {
    vec![
        Candidate::new("Paracetamol", "analgesic antipyretic for fever and headache pain relief").with_usage(40),
        Candidate::new("Ibuprofen", "nsaid analgesic for pain fever and inflammation").with_usage(30),
        Candidate::new("Cough Syrup", "antitussive expectorant cough syrup for dry cough").with_usage(20),
        Candidate::new("Decongestant", "nasal decongestant for cold and congestion").with_usage(15),
        Candidate::new("Antacid", "antacid for stomach acidity and indigestion").with_usage(25),
        Candidate::new("Omeprazole", "proton pump inhibitor for stomach acidity").with_usage(10),
    ]
}

/// Training data plus where it came from.
#[derive(Debug, Clone)]
pub struct Dataset {
    pub examples: Vec<LabeledQuery>,
    pub source: DataSource,
}

impl Dataset {
    /// Real examples when there are any, otherwise the synthetic set.
    pub fn real_or_synthetic(examples: Vec<LabeledQuery>, num_clients: usize) -> Self {
        let examples: Vec<LabeledQuery> = examples.into_iter().filter(|e| !e.query.trim().is_empty() && !e.items.is_empty()).collect();
        if examples.is_empty() {
            warn!(num_clients, "no_training_examples_using_synthetic");
            Self { examples: synthetic_examples(num_clients), source: DataSource::Synthetic }
        } else {
            Self { examples, source: DataSource::Real }
        }
    }
}

/// Splits `examples` into `n` shards.
///
/// IID shuffles then splits evenly, the first `len % n` shards taking one
/// extra. Non-IID sorts by query length and cuts shards whose sizes vary by
/// up to ±30 % around the even size, rescaled so every example is assigned.
pub fn partition(examples: &[LabeledQuery], n: usize, split: DataSplit, rng: &mut StdRng) -> Vec<Vec<LabeledQuery>> {
    let n = n.max(1);
    match split {
        DataSplit::Iid => {
            let mut shuffled = examples.to_vec();
            shuffled.shuffle(rng);
            let sizes = even_sizes(shuffled.len(), n);
            cut(shuffled, &sizes)
        }
        DataSplit::NonIid => {
            let mut sorted = examples.to_vec();
            sorted.sort_by_key(|e| e.query.chars().count());
            let sizes = varied_sizes(sorted.len(), n, rng);
            cut(sorted, &sizes)
        }
    }
}

fn even_sizes(total: usize, n: usize) -> Vec<usize> {
    let (base, extra) = (total / n, total % n);
    (0..n).map(|i| base + usize::from(i < extra)).collect()
}

fn varied_sizes(total: usize, n: usize, rng: &mut StdRng) -> Vec<usize> {
    let base = (total / n) as f64;
    let mut sizes: Vec<usize> = (0..n)
        .map(|_| {
            let factor = 1.0 + rng.gen_range(-NON_IID_VARIATION..=NON_IID_VARIATION);
            ((base * factor).round() as usize).max(1)
        })
        .collect();
    let allocated: usize = sizes.iter().sum();
    if allocated != total {
        for s in sizes.iter_mut() {
            *s = *s * total / allocated;
        }
        let assigned: usize = sizes.iter().sum();
        sizes[0] += total - assigned;
    }
    sizes
}

fn cut(items: Vec<LabeledQuery>, sizes: &[usize]) -> Vec<Vec<LabeledQuery>> {
    let mut iter = items.into_iter();
    sizes.iter().map(|&s| iter.by_ref().take(s).collect()).collect()
}

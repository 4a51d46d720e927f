//! Tokenization and vector helpers shared by the lexical models.

use std::collections::HashMap;

/// Common English function words dropped before n-gram extraction.
pub const STOP_WORDS: &[&str] = &[
    "a", "about", "above", "after", "again", "against", "all", "also", "am", "an", "and", "any", "are", "as", "at",
    "be", "because", "been", "before", "being", "below", "between", "both", "but", "by", "can", "cannot", "could",
    "did", "do", "does", "doing", "down", "during", "each", "either", "else", "etc", "ever", "every", "few", "for",
    "from", "further", "had", "has", "have", "having", "he", "her", "here", "hers", "herself", "him", "himself",
    "his", "how", "however", "i", "if", "in", "into", "is", "it", "its", "itself", "just", "least", "less", "may",
    "me", "might", "more", "most", "much", "must", "my", "myself", "neither", "no", "nor", "not", "now", "of",
    "off", "often", "on", "once", "only", "or", "other", "our", "ours", "ourselves", "out", "over", "own", "per",
    "rather", "same", "she", "should", "since", "so", "some", "still", "such", "than", "that", "the", "their",
    "theirs", "them", "themselves", "then", "there", "these", "they", "this", "those", "though", "through", "thus",
    "to", "too", "under", "until", "up", "upon", "us", "very", "was", "we", "were", "what", "when", "where",
    "whether", "which", "while", "who", "whom", "whose", "why", "will", "with", "within", "without", "would",
    "yet", "you", "your", "yours", "yourself", "yourselves",
];

pub fn is_stop_word(token: &str) -> bool { STOP_WORDS.binary_search(&token).is_ok() }

/// Lowercased alphanumeric runs of two or more characters.
pub fn tokenize(text: &str) -> Vec<String> {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|t| t.chars().count() >= 2)
        .map(|t| t.to_lowercase())
        .collect()
}

/// Tokens with stop words removed.
pub fn content_tokens(text: &str) -> Vec<String> {
    tokenize(text).into_iter().filter(|t| !is_stop_word(t)).collect()
}

/// Unigrams followed by adjacent-pair bigrams.
pub fn unigrams_and_bigrams(tokens: &[String]) -> Vec<String> {
    let mut out: Vec<String> = tokens.to_vec();
    out.extend(tokens.windows(2).map(|w| format!("{} {}", w[0], w[1])));
    out
}

pub type SparseVector = HashMap<String, f64>;

pub fn l2_normalize_sparse(v: &mut SparseVector) {
    let norm = v.values().map(|x| x * x).sum::<f64>().sqrt();
    if norm > 0.0 {
        for x in v.values_mut() { *x /= norm; }
    }
}

pub fn dot_sparse(a: &SparseVector, b: &SparseVector) -> f64 {
    let (small, large) = if a.len() <= b.len() { (a, b) } else { (b, a) };
    small.iter().filter_map(|(k, x)| large.get(k).map(|y| x * y)).sum()
}

/// Cosine similarity of dense vectors, 0 when either is all-zero.
pub fn cosine_dense(a: &[f64], b: &[f64]) -> f64 {
    let dot: f64 = a.iter().zip(b).map(|(x, y)| x * y).sum();
    let na = a.iter().map(|x| x * x).sum::<f64>().sqrt();
    let nb = b.iter().map(|x| x * x).sum::<f64>().sqrt();
    if na == 0.0 || nb == 0.0 { 0.0 } else { dot / (na * nb) }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stop_words_sorted_for_binary_search() {
        assert!(STOP_WORDS.windows(2).all(|w| w[0] < w[1]));
        assert!(is_stop_word("the"));
        assert!(!is_stop_word("fever"));
    }

    #[test]
    fn tokenize_drops_short_and_punctuation() {
        assert_eq!(tokenize("Fever, a HEADACHE!"), vec!["fever", "headache"]);
        assert_eq!(content_tokens("pain in the chest"), vec!["pain", "chest"]);
    }

    #[test]
    fn bigrams_follow_unigrams() {
        let toks = content_tokens("sore throat pain");
        assert_eq!(unigrams_and_bigrams(&toks), vec!["sore", "throat", "pain", "sore throat", "throat pain"]);
    }

    #[test]
    fn cosine_of_zero_vector_is_zero() {
        assert_eq!(cosine_dense(&[0.0, 0.0], &[1.0, 0.0]), 0.0);
        assert!((cosine_dense(&[1.0, 1.0], &[2.0, 2.0]) - 1.0).abs() < 1e-12);
    }
}

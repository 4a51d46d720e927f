use std::collections::{BTreeMap, BTreeSet};

use super::{normalize_by_max, ScoringModel};
use crate::types::{Candidate, ScoreVector};

const RULES: &[(&str, &[&str])] = &[
    // pain & fever
    ("fever", &["analgesic", "antipyretic", "paracetamol", "acetaminophen", "ibuprofen"]),
    ("headache", &["analgesic", "pain relief", "paracetamol", "aspirin", "ibuprofen", "migraine"]),
    ("pain", &["analgesic", "pain relief", "paracetamol", "ibuprofen", "diclofenac"]),
    ("body ache", &["analgesic", "pain relief", "muscle relaxant", "paracetamol"]),
    ("muscle pain", &["muscle relaxant", "pain relief", "analgesic"]),
    ("chills", &["paracetamol", "antipyretic", "flu relief"]),
    // respiratory
    ("cough", &["antitussive", "cough syrup", "expectorant", "dextromethorphan"]),
    ("cold", &["decongestant", "antihistamine", "cold relief"]),
    ("congestion", &["decongestant", "nasal spray", "pseudoephedrine"]),
    ("sore throat", &["antiseptic", "lozenge", "throat relief"]),
    ("runny nose", &["antihistamine", "decongestant"]),
    // gastrointestinal
    ("nausea", &["antiemetic", "domperidone", "ondansetron"]),
    ("vomiting", &["antiemetic", "domperidone"]),
    ("diarrhea", &["antidiarrheal", "loperamide", "oral rehydration"]),
    ("stomach", &["antacid", "proton pump inhibitor", "omeprazole"]),
    ("acidity", &["antacid", "ranitidine", "omeprazole"]),
    ("indigestion", &["digestive", "antacid", "enzyme"]),
    // allergy
    ("allergy", &["antihistamine", "cetirizine", "loratadine", "fexofenadine"]),
    ("itching", &["antihistamine", "antipruritic", "calamine"]),
    ("rash", &["antihistamine", "corticosteroid", "calamine"]),
    ("hives", &["antihistamine", "epinephrine"]),
    // infection
    ("infection", &["antibiotic", "antimicrobial", "antiseptic"]),
    ("bacterial", &["antibiotic", "amoxicillin", "azithromycin"]),
    ("viral", &["antiviral", "oseltamivir"]),
    ("fungal", &["antifungal", "clotrimazole", "fluconazole"]),
    // chronic
    ("diabetes", &["antidiabetic", "metformin", "insulin", "blood sugar"]),
    ("hypertension", &["antihypertensive", "blood pressure", "amlodipine", "losartan"]),
    ("asthma", &["bronchodilator", "inhaler", "salbutamol", "corticosteroid"]),
    // sleep & anxiety
    ("insomnia", &["sedative", "sleep aid", "melatonin"]),
    ("anxiety", &["anxiolytic", "alprazolam", "diazepam"]),
    ("stress", &["anxiolytic", "adaptogen"]),
    // other
    ("inflammation", &["anti-inflammatory", "nsaid", "corticosteroid"]),
    ("swelling", &["anti-inflammatory", "nsaid", "diuretic"]),
    ("fatigue", &["vitamin", "multivitamin", "iron", "supplement"]),
    ("weakness", &["vitamin", "supplement", "iron", "b12"]),
];

/// Rule table scorer: symptom phrases found in the query select keyword sets,
/// and a candidate scores the fraction of those keywords its text contains.
pub struct KnowledgeModel {
    rules: BTreeMap<String, BTreeSet<String>>,
}

impl Default for KnowledgeModel {
    fn default() -> Self {
        let rules = RULES
            .iter()
            .map(|(symptom, kws)| (symptom.to_string(), kws.iter().map(|k| k.to_string()).collect()))
            .collect();
        Self { rules }
    }
}

impl KnowledgeModel {
    /// Adds or replaces rules on top of the built-in table.
    pub fn with_rules<I, S, K>(mut self, extra: I) -> Self
    where
        I: IntoIterator<Item = (S, Vec<K>)>,
        S: Into<String>,
        K: Into<String>,
    {
        for (symptom, kws) in extra {
            self.rules.insert(symptom.into().to_lowercase(), kws.into_iter().map(|k| k.into().to_lowercase()).collect());
        }
        self
    }

    pub fn matched_symptoms(&self, query: &str) -> Vec<&str> {
        let q = query.to_lowercase();
        self.rules.keys().filter(|s| q.contains(s.as_str())).map(String::as_str).collect()
    }
}

impl ScoringModel for KnowledgeModel {
    fn id(&self) -> &str { "knowledge" }

    fn score(&self, query: &str, candidates: &[Candidate]) -> anyhow::Result<ScoreVector> {
        let mut scores = vec![0.0; candidates.len()];
        let symptoms = self.matched_symptoms(query);
        if symptoms.is_empty() {
            return Ok(scores);
        }
        let keywords: BTreeSet<&str> =
            symptoms.iter().filter_map(|s| self.rules.get(*s)).flatten().map(String::as_str).collect();
        let total = keywords.len() as f64;
        for (slot, c) in scores.iter_mut().zip(candidates) {
            let text = c.text().to_lowercase();
            let matched = keywords.iter().filter(|k| text.contains(**k)).count();
            *slot = matched as f64 / total;
        }
        normalize_by_max(&mut scores);
        Ok(scores)
    }
}

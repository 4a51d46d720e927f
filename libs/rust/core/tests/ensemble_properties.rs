use medfed_core::config::EnsembleConfig;
use medfed_core::scoring::{FnModel, ScoringModel};
use medfed_core::{Candidate, ScoreAggregator, WeightVector};
use std::sync::Arc;
use std::time::{Duration, Instant};

fn fixed(id: &'static str, scores: Vec<f64>) -> Arc<dyn ScoringModel> {
    Arc::new(FnModel::new(id, move |_q: &str, _c: &[Candidate]| Ok(scores.clone())))
}

fn ensemble(models: Vec<Arc<dyn ScoringModel>>) -> ScoreAggregator {
    ScoreAggregator::new(models, EnsembleConfig { learnable_weights: false, ..Default::default() }, None)
}

#[tokio::test]
async fn tie_keeps_catalog_order() {
    let agg = ensemble(vec![fixed("semantic", vec![0.9, 0.2]), fixed("tfidf", vec![0.1, 0.8])]);
    agg.set_model_weights(WeightVector::normalized_from([("semantic", 0.5), ("tfidf", 0.5)]));
    let catalog = vec![Candidate::new("Paracetamol", ""), Candidate::new("Ibuprofen", "")];
    let set = agg.recommend("fever", &catalog).await;
    assert_eq!(set.ids(), vec!["Paracetamol", "Ibuprofen"]);
    for item in &set.items {
        assert!((item.final_score - 0.5).abs() < 1e-9);
    }
}

#[tokio::test]
async fn scores_cover_every_candidate_within_unit_range() {
    // out-of-range and non-finite values are sanitized before blending
    let agg = ensemble(vec![
        fixed("wild", vec![1.7, -0.3, f64::NAN, 0.4, f64::INFINITY]),
        fixed("calm", vec![0.2, 0.2, 0.2, 0.2, 0.2]),
    ]);
    let catalog: Vec<Candidate> = (0..5).map(|i| Candidate::new(format!("c{i}"), "")).collect();
    let set = agg.recommend("anything", &catalog).await;
    assert_eq!(set.items.len(), 5);
    for item in &set.items {
        assert!((0.0..=1.0).contains(&item.final_score), "{}", item.final_score);
        for v in item.raw_votes.values() {
            assert!((0.0..=1.0).contains(v));
        }
    }
}

#[tokio::test]
async fn weights_stay_normalized_through_updates() {
    let agg = ensemble(vec![fixed("a", vec![0.9, 0.1, 0.3]), fixed("b", vec![0.1, 0.9, 0.3]), fixed("c", vec![0.5, 0.5, 0.5])]);
    let w = agg.set_model_weights(WeightVector::normalized_from([("a", 3.0), ("b", 1.0), ("c", 0.0)]));
    assert!(w.is_normalized());
    assert_eq!(agg.get_model_weights(), agg.get_model_weights());

    let catalog = vec![Candidate::new("x", ""), Candidate::new("y", ""), Candidate::new("z", "")];
    for selected in ["x", "y", "z", "y"] {
        let set = agg.recommend("q", &catalog).await;
        assert!(agg.feedback_for_session(&set.session_id, selected, 0.3).is_applied());
        assert!(agg.get_model_weights().is_normalized());
    }
}

#[tokio::test]
async fn feedback_is_attributed_to_its_own_session() {
    let agg = ensemble(vec![fixed("a", vec![0.9, 0.1]), fixed("b", vec![0.1, 0.9])]);
    let catalog = vec![Candidate::new("x", ""), Candidate::new("y", "")];
    let first = agg.recommend("first", &catalog).await;
    let second = agg.recommend("second", &catalog[..1]).await;
    // "y" only exists in the first session's snapshot
    assert!(!agg.feedback_latest("y", 0.1).is_applied());
    assert!(agg.feedback_for_session(&first.session_id, "y", 0.1).is_applied());
    assert!(agg.get_model_weights().get("b").unwrap() > 0.5);
    assert_eq!(agg.vote_matrix(Some(&second.session_id)).map(|s| s.candidate_count()), Some(1));
}

#[tokio::test]
async fn stored_weights_survive_restart() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("ensemble_weights.json");
    let models = || vec![fixed("a", vec![0.5]), fixed("b", vec![0.5])];
    {
        let agg = ScoreAggregator::new(models(), EnsembleConfig::default(), Some(path.clone()));
        agg.set_model_weights(WeightVector::normalized_from([("a", 0.8), ("b", 0.2)]));
    }
    let reloaded = ScoreAggregator::new(models(), EnsembleConfig::default(), Some(path));
    assert!((reloaded.get_model_weights().get("a").unwrap() - 0.8).abs() < 1e-9);
}

#[tokio::test]
async fn failing_models_are_isolated_and_reported() {
    let good = fixed("good", vec![0.8]);
    let bad: Arc<dyn ScoringModel> = Arc::new(FnModel::new("bad", |_q: &str, _c: &[Candidate]| Err(anyhow::anyhow!("index missing"))));
    let hung: Arc<dyn ScoringModel> = Arc::new(FnModel::new("hung", |_q: &str, c: &[Candidate]| {
        std::thread::sleep(Duration::from_secs(1));
        Ok(vec![1.0; c.len()])
    }));
    let cfg = EnsembleConfig { learnable_weights: false, model_timeout_ms: 200, ..Default::default() };
    let agg = ScoreAggregator::new(vec![good, bad, hung], cfg, None);

    let started = Instant::now();
    let set = agg.recommend("cough", &[Candidate::new("Syrup", "")]).await;
    assert!(started.elapsed() < Duration::from_millis(900));
    assert_eq!(set.failed_models, vec!["bad".to_string(), "hung".to_string()]);
    assert!((set.items[0].final_score - 0.8 / 3.0).abs() < 1e-9);
    assert_eq!(set.items[0].raw_votes["bad"], 0.0);
    assert_eq!(set.items[0].raw_votes["hung"], 0.0);
}

#[tokio::test]
async fn panicking_model_scores_zero_without_aborting_the_call() {
    let steady = fixed("steady", vec![0.6, 0.2]);
    let broken: Arc<dyn ScoringModel> = Arc::new(FnModel::new("broken", |_q: &str, _c: &[Candidate]| -> anyhow::Result<Vec<f64>> {
        panic!("scorer blew up")
    }));
    let agg = ensemble(vec![steady, broken]);
    let catalog = vec![Candidate::new("x", ""), Candidate::new("y", "")];
    let set = agg.recommend("q", &catalog).await;
    assert_eq!(set.failed_models, vec!["broken".to_string()]);
    assert_eq!(set.ids(), vec!["x", "y"]);
    assert!((set.items[0].final_score - 0.3).abs() < 1e-9);

    // the ensemble keeps serving after the panic
    let again = agg.recommend("q", &catalog).await;
    assert_eq!(again.items.len(), 2);
}

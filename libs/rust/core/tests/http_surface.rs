use medfed_core::config::{FederatedConfig, StorageConfig};
use medfed_core::federated_learning::LocalTrainer;
use medfed_core::net::{serve_on, AppState, Participant, ParticipantConfig};
use medfed_core::scoring::{FnModel, ScoringModel};
use medfed_core::{Candidate, ClientStatus, Engine, EngineConfig, LabeledQuery, RetryConfig};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::watch;

fn models() -> Vec<Arc<dyn ScoringModel>> {
    vec![
        Arc::new(FnModel::new("first", |_q: &str, c: &[Candidate]| Ok((0..c.len()).map(|i| if i == 0 { 1.0 } else { 0.0 }).collect()))),
        Arc::new(FnModel::new("flat", |_q: &str, c: &[Candidate]| Ok(vec![0.5; c.len()]))),
    ]
}

fn catalog() -> Vec<Candidate> { vec![Candidate::new("A", "first item"), Candidate::new("B", "second item")] }

async fn start_server(dir: &std::path::Path) -> (String, Arc<AppState>, watch::Sender<bool>) {
    let federated = FederatedConfig { num_rounds: 2, min_fit_clients: 1, min_available_clients: 1, fraction_fit: 1.0, fraction_evaluate: 1.0, round_timeout_secs: 10, seed: Some(5), ..Default::default() };
    let cfg = EngineConfig { federated, storage: StorageConfig::in_dir(dir), ..Default::default() };
    let engine = Arc::new(Engine::build(cfg, models()).unwrap());
    engine.start();
    let state = AppState::new(engine);
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let url = format!("http://{}", listener.local_addr().unwrap());
    let (tx, mut rx) = watch::channel(false);
    let server_state = state.clone();
    tokio::spawn(async move {
        let shutdown = async move { let _ = rx.changed().await; };
        serve_on(server_state, listener, shutdown).await.unwrap();
    });
    (url, state, tx)
}

async fn wait_until<F: Fn() -> bool>(what: &str, cond: F) {
    for _ in 0..400 {
        if cond() { return; }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    panic!("timed out waiting for {what}");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn remote_participant_completes_a_run() {
    let dir = tempfile::tempdir().unwrap();
    let (url, state, server_stop) = start_server(dir.path()).await;
    let http = reqwest::Client::new();

    let examples = vec![LabeledQuery::new("one", ["A"]), LabeledQuery::new("two", ["A"])];
    let trainer = LocalTrainer::new(models(), Arc::new(catalog()), examples, &state.engine.config.ensemble);
    let pcfg = ParticipantConfig {
        server_url: url.clone(),
        client_id: "p1".into(),
        poll_interval: Duration::from_millis(20),
        heartbeat_interval: Duration::from_millis(500),
        retry: RetryConfig::default(),
    };
    let participant = Arc::new(Participant::new(pcfg, trainer));
    let (p_stop, p_rx) = watch::channel(false);
    let runner = {
        let p = participant.clone();
        tokio::spawn(async move { p.run(p_rx).await })
    };

    let engine = state.engine.clone();
    wait_until("registration", || engine.registry.client_count() == 1).await;
    let clients: Value = http.get(format!("{url}/v1/clients")).send().await.unwrap().json().await.unwrap();
    assert_eq!(clients["clients"][0]["data_size"], 2);

    let resp = http.post(format!("{url}/v1/rounds")).json(&json!({})).send().await.unwrap();
    assert_eq!(resp.status(), 202);
    wait_until("run completion", || state.last_run().is_some()).await;
    let summary = state.last_run().unwrap();
    assert!(summary.complete);
    assert_eq!(summary.rounds.len(), 2);
    assert!(summary.rounds.iter().all(|r| r.participants == vec!["p1".to_string()]));

    let rounds: Value = http.get(format!("{url}/v1/rounds")).send().await.unwrap().json().await.unwrap();
    assert_eq!(rounds["running"], false);
    assert_eq!(rounds["rounds"].as_array().map(Vec::len), Some(2));

    p_stop.send(true).unwrap();
    runner.await.unwrap().unwrap();
    assert_eq!(engine.registry.client_count(), 0);

    let _ = server_stop.send(true);
    engine.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn engine_routes_and_probes() {
    let dir = tempfile::tempdir().unwrap();
    let (url, state, server_stop) = start_server(dir.path()).await;
    let http = reqwest::Client::new();

    let live: Value = http.get(format!("{url}/live")).send().await.unwrap().json().await.unwrap();
    assert_eq!(live["live"], true);

    let set: Value = http
        .post(format!("{url}/v1/recommend"))
        .json(&json!({ "query": "anything", "candidates": catalog() }))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(set["items"][0]["candidate"]["id"], "A");
    let session = set["session_id"].as_str().unwrap().to_string();

    let out: Value = http
        .post(format!("{url}/v1/feedback"))
        .json(&json!({ "query": "anything", "selected": "A", "session_id": session }))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(out["status"], "learned");

    let agg: Value = http.get(format!("{url}/v1/aggregation")).send().await.unwrap().json().await.unwrap();
    assert_eq!(agg["pending_updates"], 1);

    let weights: Value = http.put(format!("{url}/v1/weights")).json(&json!({ "first": 3.0, "flat": 1.0 })).send().await.unwrap().json().await.unwrap();
    assert_eq!(weights["first"], 0.75);

    let missing = http.post(format!("{url}/v1/clients/ghost/heartbeat")).send().await.unwrap();
    assert_eq!(missing.status(), 404);
    let no_clients = http.post(format!("{url}/v1/rounds")).send().await.unwrap();
    assert_eq!(no_clients.status(), 412);

    let metrics = http.get(format!("{url}/metrics")).send().await.unwrap().text().await.unwrap();
    assert!(metrics.contains("medfed_recommendations_total"));

    let _ = server_stop.send(true);
    state.engine.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn failed_participant_rejoins_on_heartbeat() {
    let dir = tempfile::tempdir().unwrap();
    let (url, state, server_stop) = start_server(dir.path()).await;
    let trainer = LocalTrainer::new(models(), Arc::new(catalog()), vec![LabeledQuery::new("one", ["A"])], &state.engine.config.ensemble);
    let pcfg = ParticipantConfig {
        server_url: url,
        client_id: "p2".into(),
        poll_interval: Duration::from_millis(20),
        heartbeat_interval: Duration::from_millis(500),
        retry: RetryConfig::default(),
    };
    let participant = Participant::new(pcfg, trainer);
    assert_eq!(participant.register().await.unwrap(), ClientStatus::Registered);

    let registry = &state.engine.registry;
    let max = state.engine.config.registry.max_failures;
    for _ in 0..max { registry.record_failure("p2").unwrap(); }
    assert_eq!(registry.get_client("p2").unwrap().status, ClientStatus::Failed);

    assert_eq!(participant.heartbeat().await.unwrap(), ClientStatus::Registered);
    let rec = registry.get_client("p2").unwrap();
    assert_eq!(rec.status, ClientStatus::Registered);
    assert_eq!(rec.failure_count, 0);

    let _ = server_stop.send(true);
    state.engine.shutdown().await;
}

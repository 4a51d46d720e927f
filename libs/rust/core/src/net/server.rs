//! Coordinator HTTP server.
//!
//! Client lifecycle:
//! - POST   /v1/clients/register
//! - POST   /v1/clients/:id/heartbeat
//! - DELETE /v1/clients/:id
//! - GET    /v1/clients
//! - GET    /v1/clients/:id/task     (returns immediately; `idle` when nothing is queued)
//! - POST   /v1/clients/:id/result
//!
//! Engine:
//! - GET|PUT /v1/weights, POST /v1/recommend, POST /v1/feedback
//! - GET|POST /v1/rounds, POST /v1/rounds/stop, GET /v1/aggregation
//!
//! Probes: /live, /ready, /metrics

use axum::{
    extract::{Path, State},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::{delete, get, post},
    Json, Router,
};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use super::{ClientTask, FeedbackRequest, RecommendRequest, RegisterRequest, RemoteClient, StatusResponse, TaskBoard, TaskResult};
use crate::error::{MedFedError, Result};
use crate::federated_learning::{DataSource, RunSummary};
use crate::lifecycle::Engine;
use crate::metrics_ext::gather_text;
use crate::registry::{ClientRecord, RegistrySummary};
use crate::types::WeightVector;
use crate::NODE_LIVENESS;

pub struct AppState {
    pub engine: Arc<Engine>,
    pub board: Arc<TaskBoard>,
    run: Mutex<Option<JoinHandle<()>>>,
    last_run: Arc<RwLock<Option<RunSummary>>>,
}

impl AppState {
    pub fn new(engine: Arc<Engine>) -> Arc<Self> {
        Arc::new(Self { engine, board: Arc::new(TaskBoard::new()), run: Mutex::new(None), last_run: Arc::new(RwLock::new(None)) })
    }

    pub fn last_run(&self) -> Option<RunSummary> { self.last_run.read().clone() }
}

pub enum ApiError {
    Engine(MedFedError),
    BadRequest(String),
    NotFound(String),
}

impl From<MedFedError> for ApiError {
    fn from(e: MedFedError) -> Self { ApiError::Engine(e) }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, msg) = match self {
            ApiError::BadRequest(m) => (StatusCode::BAD_REQUEST, m),
            ApiError::NotFound(m) => (StatusCode::NOT_FOUND, m),
            ApiError::Engine(e) => {
                let status = match &e {
                    MedFedError::UnknownClient(_) => StatusCode::NOT_FOUND,
                    MedFedError::InvalidTransition { .. } | MedFedError::RunInProgress => StatusCode::CONFLICT,
                    MedFedError::NotEnoughClients { .. } => StatusCode::PRECONDITION_FAILED,
                    MedFedError::Config(_) => StatusCode::BAD_REQUEST,
                    _ => StatusCode::INTERNAL_SERVER_ERROR,
                };
                (status, e.to_string())
            }
        };
        (status, Json(json!({ "error": msg }))).into_response()
    }
}

type ApiResult<T> = std::result::Result<Json<T>, ApiError>;

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/v1/clients/register", post(register))
        .route("/v1/clients", get(list_clients))
        .route("/v1/clients/:id", delete(unregister))
        .route("/v1/clients/:id/heartbeat", post(heartbeat))
        .route("/v1/clients/:id/task", get(next_task))
        .route("/v1/clients/:id/result", post(post_result))
        .route("/v1/weights", get(get_weights).put(put_weights))
        .route("/v1/recommend", post(recommend))
        .route("/v1/feedback", post(feedback))
        .route("/v1/rounds", get(rounds).post(start_run))
        .route("/v1/rounds/stop", post(stop_run))
        .route("/v1/aggregation", get(aggregation_status))
        .route("/live", get(|| async { Json(json!({ "live": NODE_LIVENESS.load(Ordering::SeqCst) })) }))
        .route("/ready", get(|| async { Json(json!({ "ready": crate::is_ready() })) }))
        .route("/metrics", get(metrics))
        .with_state(state)
}

/// Binds `addr` and serves until `shutdown` resolves.
pub async fn serve<F>(state: Arc<AppState>, addr: SocketAddr, shutdown: F) -> Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let listener = TcpListener::bind(addr).await?;
    serve_on(state, listener, shutdown).await
}

pub async fn serve_on<F>(state: Arc<AppState>, listener: TcpListener, shutdown: F) -> Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    info!(addr=%listener.local_addr()?, "coordinator_listening");
    axum::serve(listener, router(state)).with_graceful_shutdown(shutdown).await?;
    Ok(())
}

async fn register(State(st): State<Arc<AppState>>, Json(req): Json<RegisterRequest>) -> ApiResult<ClientRecord> {
    let id = req.client_id.trim();
    if id.is_empty() {
        return Err(ApiError::BadRequest("client_id must not be empty".into()));
    }
    let rec = st.engine.registry.register(id, req.data_size, req.capabilities, req.metadata);
    let timeout = st.engine.config.federated.round_timeout();
    st.engine.orchestrator.attach_client(Arc::new(RemoteClient::new(id, st.board.clone(), timeout)));
    Ok(Json(rec))
}

async fn heartbeat(State(st): State<Arc<AppState>>, Path(id): Path<String>) -> ApiResult<StatusResponse> {
    let status = st.engine.registry.record_heartbeat(&id)?;
    Ok(Json(StatusResponse { client_id: id, status }))
}

async fn unregister(State(st): State<Arc<AppState>>, Path(id): Path<String>) -> std::result::Result<StatusCode, ApiError> {
    st.engine.orchestrator.detach_client(&id);
    st.board.drop_client(&id);
    if st.engine.registry.unregister(&id) {
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(MedFedError::UnknownClient(id).into())
    }
}

#[derive(Serialize)]
struct ClientList {
    summary: RegistrySummary,
    clients: Vec<ClientRecord>,
}

async fn list_clients(State(st): State<Arc<AppState>>) -> Json<ClientList> {
    let registry = &st.engine.registry;
    Json(ClientList { summary: registry.summary(), clients: registry.all_clients() })
}

async fn next_task(State(st): State<Arc<AppState>>, Path(id): Path<String>) -> ApiResult<ClientTask> {
    if st.engine.registry.get_client(&id).is_none() {
        return Err(MedFedError::UnknownClient(id).into());
    }
    Ok(Json(st.board.next_task(&id)))
}

async fn post_result(State(st): State<Arc<AppState>>, Path(id): Path<String>, Json(result): Json<TaskResult>) -> std::result::Result<StatusCode, ApiError> {
    let task_id = result.task_id();
    if st.board.complete(&id, result) {
        Ok(StatusCode::ACCEPTED)
    } else {
        Err(ApiError::NotFound(format!("no outstanding task {task_id} for {id}")))
    }
}

async fn get_weights(State(st): State<Arc<AppState>>) -> Json<WeightVector> { Json(st.engine.ensemble.get_model_weights()) }

async fn put_weights(State(st): State<Arc<AppState>>, Json(weights): Json<WeightVector>) -> ApiResult<WeightVector> {
    if weights.iter().any(|(_, v)| !v.is_finite() || *v < 0.0) {
        return Err(ApiError::BadRequest("weights must be finite and non-negative".into()));
    }
    Ok(Json(st.engine.ensemble.set_model_weights(weights)))
}

async fn recommend(State(st): State<Arc<AppState>>, Json(req): Json<RecommendRequest>) -> impl IntoResponse {
    Json(st.engine.ensemble.recommend(&req.query, &req.candidates).await)
}

async fn feedback(State(st): State<Arc<AppState>>, Json(req): Json<FeedbackRequest>) -> impl IntoResponse {
    let outcome = st
        .engine
        .learner
        .learn_from_prescription(&req.query, &req.recommended, &req.selected, &req.candidates, req.session_id)
        .await;
    Json(outcome)
}

#[derive(Debug, Default, Deserialize)]
struct StartRun {
    #[serde(default)]
    initial: Option<WeightVector>,
}

async fn start_run(State(st): State<Arc<AppState>>, body: Option<Json<StartRun>>) -> std::result::Result<(StatusCode, Json<serde_json::Value>), ApiError> {
    let orch = st.engine.orchestrator.clone();
    let mut slot = st.run.lock();
    if orch.is_running() || slot.as_ref().is_some_and(|h| !h.is_finished()) {
        return Err(MedFedError::RunInProgress.into());
    }
    let cfg = orch.config();
    let required = cfg.min_available_clients.max(cfg.min_fit_clients);
    let available = orch.available_count();
    if available < required {
        return Err(MedFedError::NotEnoughClients { available, required }.into());
    }
    let initial = body.and_then(|Json(b)| b.initial).unwrap_or_else(|| st.engine.ensemble.get_model_weights());
    let last_run = st.last_run.clone();
    *slot = Some(tokio::spawn(async move {
        match orch.run(initial, DataSource::Real).await {
            Ok(summary) => *last_run.write() = Some(summary),
            Err(e) => error!(error=%e, "fl_run_failed"),
        }
    }));
    info!(available, "fl_run_requested");
    Ok((StatusCode::ACCEPTED, Json(json!({ "started": true, "available_clients": available }))))
}

async fn stop_run(State(st): State<Arc<AppState>>) -> Json<serde_json::Value> {
    let was_running = st.engine.orchestrator.is_running();
    st.engine.orchestrator.stop();
    if !was_running { warn!("fl_stop_without_run"); }
    Json(json!({ "stopping": was_running }))
}

async fn rounds(State(st): State<Arc<AppState>>) -> Json<serde_json::Value> {
    let orch = &st.engine.orchestrator;
    Json(json!({
        "running": orch.is_running(),
        "rounds": orch.rounds(),
        "global_weights": orch.global_weights(),
        "last_run": st.last_run(),
    }))
}

async fn aggregation_status(State(st): State<Arc<AppState>>) -> impl IntoResponse { Json(st.engine.aggregation.status()) }

async fn metrics() -> Response {
    match gather_text() {
        Ok(body) => ([(header::CONTENT_TYPE, "text/plain; version=0.0.4")], body).into_response(),
        Err(e) => (StatusCode::INTERNAL_SERVER_ERROR, format!("encode error: {e}")).into_response(),
    }
}

//! Adaptive ensemble recommender with federated weight learning.
//!
//! N scoring models are blended by a learned weight vector. Feedback adapts
//! the weights online; a background service and a multi-round federated
//! protocol reconcile weight vectors across participants with FedAvg.

use once_cell::sync::OnceCell;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::info;
use tracing_subscriber::prelude::*;

static TRACING_INIT: OnceCell<()> = OnceCell::new();
pub(crate) static NODE_LIVENESS: AtomicBool = AtomicBool::new(true);
pub(crate) static NODE_READINESS: AtomicBool = AtomicBool::new(false);
pub fn mark_ready() { NODE_READINESS.store(true, Ordering::SeqCst); }
pub fn clear_ready() { NODE_READINESS.store(false, Ordering::SeqCst); }
pub fn is_ready() -> bool { NODE_READINESS.load(Ordering::SeqCst) }

/// Installs the global subscriber once. `MEDFED_JSON_LOG=1|true` switches to
/// JSON lines; filtering follows `RUST_LOG`.
pub fn init_tracing(service: &str) -> anyhow::Result<()> {
    TRACING_INIT.get_or_try_init(|| -> anyhow::Result<()> {
        let json = std::env::var("MEDFED_JSON_LOG").ok().map(|v| v == "1" || v.eq_ignore_ascii_case("true")).unwrap_or(false);
        let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
        let registry = tracing_subscriber::registry().with(env_filter);
        if json {
            registry
                .with(tracing_subscriber::fmt::layer().json().flatten_event(true).with_current_span(true).with_span_list(false))
                .try_init()?;
        } else {
            registry
                .with(tracing_subscriber::fmt::layer().with_target(true).with_thread_ids(false).with_line_number(true))
                .try_init()?;
        }
        Ok(())
    })?;
    info!(service, "tracing_initialized");
    Ok(())
}

pub mod aggregation;
pub mod config;
pub mod ensemble;
pub mod error;
pub mod federated_learning;
pub mod learning;
pub mod lifecycle;
pub mod metrics_ext;
pub mod net;
pub mod persist;
pub mod registry;
pub mod resilience;
pub mod scoring;
pub mod types;

pub use aggregation::{AggregationService, AggregationStatus, GlobalWeights, LocalUpdate, WeightSink};
pub use config::{load_config, load_config_from, DataSplit, EngineConfig};
pub use ensemble::{FeedbackOutcome, RankedCandidate, RecommendationSet, ScoreAggregator, SkipReason, VoteSnapshot};
pub use error::{MedFedError, Result};
pub use federated_learning::{DataSource, FlClient, Orchestrator, RoundRecord, RunSummary, Simulation};
pub use learning::{IncrementalLearner, LearningHistory, LearningOutcome, LearningResult};
pub use lifecycle::{Engine, EnginePhase};
pub use registry::{Activity, ClientRecord, ClientRegistry, ClientStatus};
pub use resilience::{retry_async, RetryConfig};
pub use scoring::{default_models, ScoringModel};
pub use types::{Candidate, LabeledQuery, WeightVector};

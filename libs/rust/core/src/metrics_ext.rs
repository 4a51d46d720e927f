//! Prometheus metrics for the engine, grouped per component.
//!
//! Everything registers into one process registry (prefix `medfed_`) that the
//! `/metrics` route encodes.

use once_cell::sync::Lazy;
use prometheus::{Encoder, Histogram, HistogramOpts, IntCounter, IntCounterVec, IntGauge, Opts, Registry, TextEncoder};
use tracing::warn;

pub struct EnsembleMetrics {
    pub recommendations_total: IntCounter,
    pub recommend_latency_seconds: Histogram,
    /// Labels: model, kind (error|panic|timeout|shape).
    pub model_failures_total: IntCounterVec,
    /// Labels: outcome (applied|skipped).
    pub feedback_total: IntCounterVec,
}

pub struct RegistryMetrics {
    pub client_failures_total: IntCounter,
    pub active_clients: IntGauge,
}

pub struct AggregationMetrics {
    /// Labels: outcome (ok|error).
    pub cycles_total: IntCounterVec,
    pub pending_updates: IntGauge,
}

pub struct FederatedMetrics {
    pub rounds_total: IntCounter,
    pub round_latency_seconds: Histogram,
    /// Labels: outcome (learned|skipped|failed).
    pub learning_events_total: IntCounterVec,
}

pub struct EngineMetrics {
    pub registry: Registry,
    pub ensemble: EnsembleMetrics,
    pub clients: RegistryMetrics,
    pub aggregation: AggregationMetrics,
    pub fl: FederatedMetrics,
}

pub static METRICS: Lazy<EngineMetrics> = Lazy::new(EngineMetrics::register);

fn track<C: prometheus::core::Collector + Clone + 'static>(registry: &Registry, c: C) -> C {
    if let Err(e) = registry.register(Box::new(c.clone())) {
        warn!(error=%e, "metric_registration_failed");
    }
    c
}

// Metric names and label sets below are constants, so construction cannot fail.
fn counter(r: &Registry, name: &str, help: &str) -> IntCounter {
    track(r, IntCounter::with_opts(Opts::new(name, help)).expect("valid counter opts"))
}

fn counter_vec(r: &Registry, name: &str, help: &str, labels: &[&str]) -> IntCounterVec {
    track(r, IntCounterVec::new(Opts::new(name, help), labels).expect("valid counter vec opts"))
}

fn gauge(r: &Registry, name: &str, help: &str) -> IntGauge {
    track(r, IntGauge::with_opts(Opts::new(name, help)).expect("valid gauge opts"))
}

fn histogram(r: &Registry, name: &str, help: &str) -> Histogram {
    track(r, Histogram::with_opts(HistogramOpts::new(name, help)).expect("valid histogram opts"))
}

impl EngineMetrics {
    fn register() -> Self {
        let registry = Registry::new_custom(Some("medfed".into()), None).unwrap_or_default();
        let r = &registry;
        let ensemble = EnsembleMetrics {
            recommendations_total: counter(r, "recommendations_total", "Recommendation calls served"),
            recommend_latency_seconds: histogram(r, "recommend_latency_seconds", "Wall time of one recommendation call"),
            model_failures_total: counter_vec(r, "model_failures_total", "Scoring model calls replaced by a zero vector", &["model", "kind"]),
            feedback_total: counter_vec(r, "feedback_total", "Feedback events by outcome", &["outcome"]),
        };
        let clients = RegistryMetrics {
            client_failures_total: counter(r, "client_failures_total", "Failures recorded against registered clients"),
            active_clients: gauge(r, "active_clients", "Clients currently eligible for rounds"),
        };
        let aggregation = AggregationMetrics {
            cycles_total: counter_vec(r, "aggregation_cycles_total", "Background aggregation cycles by outcome", &["outcome"]),
            pending_updates: gauge(r, "aggregation_pending_updates", "Local updates waiting for aggregation"),
        };
        let fl = FederatedMetrics {
            rounds_total: counter(r, "fl_rounds_total", "Completed federated rounds"),
            round_latency_seconds: histogram(r, "fl_round_latency_seconds", "Wall time of one federated round"),
            learning_events_total: counter_vec(r, "learning_events_total", "Incremental learning triggers by outcome", &["outcome"]),
        };
        Self { registry, ensemble, clients, aggregation, fl }
    }
}

/// Prometheus text exposition of every engine metric.
pub fn gather_text() -> Result<String, prometheus::Error> {
    let families = METRICS.registry.gather();
    let mut buf = Vec::new();
    TextEncoder::new().encode(&families, &mut buf)?;
    Ok(String::from_utf8_lossy(&buf).into_owned())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exposition_contains_prefixed_names() {
        METRICS.ensemble.recommendations_total.inc();
        METRICS.ensemble.feedback_total.with_label_values(&["applied"]).inc();
        let text = gather_text().unwrap();
        assert!(text.contains("medfed_recommendations_total"));
        assert!(text.contains("medfed_feedback_total{outcome=\"applied\"}"));
    }
}

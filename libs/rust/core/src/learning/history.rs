//! Append-only learning event log with derived statistics.
//!
//! Two JSON artifacts: the event log and the stats summary. Both are reloaded
//! on startup (empty when absent or unreadable) and rewritten after each event.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;
use tracing::{error, info};

use crate::config::LearningConfig;
use crate::persist;
use crate::scoring::PrescriptionHistory;
use crate::types::{LabeledQuery, WeightVector};

pub const QUERY_EXCERPT_CHARS: usize = 200;
pub const RECOMMENDED_KEEP: usize = 10;
pub const PATTERN_KEY_CHARS: usize = 50;

fn excerpt(text: &str, max_chars: usize) -> String { text.chars().take(max_chars).collect() }

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LearningEvent {
    pub id: u64,
    pub timestamp: DateTime<Utc>,
    pub query: String,
    pub recommended: Vec<String>,
    pub selected: String,
    pub weights_before: WeightVector,
    pub weights_after: WeightVector,
    pub delta: WeightVector,
    pub learning_count: u64,
}

/// Input for [`LearningHistory::append`]; truncation happens on append.
#[derive(Debug, Clone)]
pub struct NewEvent<'a> {
    pub query: &'a str,
    pub recommended: &'a [String],
    pub selected: &'a str,
    pub weights_before: WeightVector,
    pub weights_after: WeightVector,
    pub delta: WeightVector,
    pub learning_count: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WeightPoint {
    pub timestamp: DateTime<Utc>,
    pub weights: WeightVector,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ItemPattern {
    pub query: String,
    pub items: Vec<String>,
    pub count: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LearningStats {
    pub total_learnings: u64,
    pub today_count: u64,
    pub last_learning: Option<DateTime<Utc>>,
    pub weight_evolution: Vec<WeightPoint>,
    /// First 50 chars of the lowercased query -> items chosen for it.
    pub item_patterns: BTreeMap<String, ItemPattern>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(default)]
struct EventLog {
    events: Vec<LearningEvent>,
    last_updated: Option<DateTime<Utc>>,
    total_events: usize,
}

#[derive(Default)]
struct State {
    events: Vec<LearningEvent>,
    stats: LearningStats,
}

pub struct LearningHistory {
    state: RwLock<State>,
    history_path: Option<PathBuf>,
    stats_path: Option<PathBuf>,
    cfg: LearningConfig,
}

impl LearningHistory {
    /// Loads both artifacts. Never fails: a missing or corrupt file starts empty.
    pub fn open(history_path: PathBuf, stats_path: PathBuf, cfg: LearningConfig) -> Self {
        let log: EventLog = persist::load_or_default(&history_path);
        let stats: LearningStats = persist::load_or_default(&stats_path);
        info!(events = log.events.len(), path=%history_path.display(), "learning_history_loaded");
        Self { state: RwLock::new(State { events: log.events, stats }), history_path: Some(history_path), stats_path: Some(stats_path), cfg }
    }

    pub fn in_memory(cfg: LearningConfig) -> Self {
        Self { state: RwLock::new(State::default()), history_path: None, stats_path: None, cfg }
    }

    pub fn append(&self, new: NewEvent<'_>) -> LearningEvent {
        let now = Utc::now();
        let (event, log, stats) = {
            let mut st = self.state.write();
            let event = LearningEvent {
                id: st.events.len() as u64 + 1,
                timestamp: now,
                query: excerpt(new.query, QUERY_EXCERPT_CHARS),
                recommended: new.recommended.iter().take(RECOMMENDED_KEEP).cloned().collect(),
                selected: new.selected.to_string(),
                weights_before: new.weights_before,
                weights_after: new.weights_after,
                delta: new.delta,
                learning_count: new.learning_count,
            };
            st.events.push(event.clone());
            self.update_stats(&mut st, &event);
            let log = EventLog { events: st.events.clone(), last_updated: Some(now), total_events: st.events.len() };
            (event, log, st.stats.clone())
        };
        self.save(&log, &stats);
        info!(id = event.id, selected=%event.selected, "learning_event_recorded");
        event
    }

    fn update_stats(&self, st: &mut State, event: &LearningEvent) {
        let today = event.timestamp.date_naive();
        st.stats.total_learnings = st.events.len() as u64;
        st.stats.today_count = st.events.iter().filter(|e| e.timestamp.date_naive() == today).count() as u64;
        st.stats.last_learning = Some(event.timestamp);

        let evo = &mut st.stats.weight_evolution;
        evo.push(WeightPoint { timestamp: event.timestamp, weights: event.weights_after.clone() });
        let cutoff = event.timestamp - ChronoDuration::days(self.cfg.evolution_window_days.max(0));
        evo.retain(|p| p.timestamp >= cutoff);
        let max = self.cfg.evolution_max_points.max(1);
        if evo.len() > max {
            let excess = evo.len() - max;
            evo.drain(..excess);
        }

        let key = excerpt(&event.query, PATTERN_KEY_CHARS).to_lowercase();
        let pattern = st
            .stats
            .item_patterns
            .entry(key)
            .or_insert_with(|| ItemPattern { query: event.query.clone(), items: Vec::new(), count: 0 });
        if !pattern.items.contains(&event.selected) {
            pattern.items.push(event.selected.clone());
        }
        pattern.count += 1;
    }

    fn save(&self, log: &EventLog, stats: &LearningStats) {
        if let Some(path) = &self.history_path {
            if let Err(e) = persist::save_json(path, log) {
                error!(path=%path.display(), error=%e, "learning_history_persist_failed");
            }
        }
        if let Some(path) = &self.stats_path {
            if let Err(e) = persist::save_json(path, stats) {
                error!(path=%path.display(), error=%e, "learning_stats_persist_failed");
            }
        }
    }

    pub fn len(&self) -> usize { self.state.read().events.len() }
    pub fn is_empty(&self) -> bool { self.len() == 0 }

    /// Stats with `today_count` recomputed against the current date.
    pub fn stats(&self) -> LearningStats {
        let st = self.state.read();
        let mut stats = st.stats.clone();
        let today = Utc::now().date_naive();
        stats.today_count = st.events.iter().filter(|e| e.timestamp.date_naive() == today).count() as u64;
        stats
    }

    pub fn recent_events(&self, limit: usize) -> Vec<LearningEvent> {
        let st = self.state.read();
        let start = st.events.len().saturating_sub(limit);
        st.events[start..].to_vec()
    }

    pub fn today_events(&self) -> Vec<LearningEvent> {
        let today = Utc::now().date_naive();
        self.state.read().events.iter().filter(|e| e.timestamp.date_naive() == today).cloned().collect()
    }

    /// Events per hour between the first and last event; 0 with fewer than two.
    pub fn events_per_hour(&self) -> f64 {
        let st = self.state.read();
        let (Some(first), Some(last)) = (st.events.first(), st.events.last()) else { return 0.0 };
        if st.events.len() < 2 { return 0.0; }
        let hours = (last.timestamp - first.timestamp).num_milliseconds() as f64 / 3_600_000.0;
        if hours <= 0.0 { 0.0 } else { st.events.len() as f64 / hours }
    }

    pub fn weight_evolution(&self) -> Vec<WeightPoint> {
        let mut evo = self.state.read().stats.weight_evolution.clone();
        evo.sort_by_key(|p| p.timestamp);
        evo
    }

    /// Logged events grouped by query: query -> every item selected for it.
    pub fn training_examples(&self) -> Vec<LabeledQuery> {
        let st = self.state.read();
        let mut order: Vec<String> = Vec::new();
        let mut grouped: BTreeMap<String, Vec<String>> = BTreeMap::new();
        for e in &st.events {
            if e.query.trim().is_empty() || e.selected.is_empty() { continue; }
            let items = grouped.entry(e.query.clone()).or_insert_with(|| {
                order.push(e.query.clone());
                Vec::new()
            });
            if !items.contains(&e.selected) { items.push(e.selected.clone()); }
        }
        order.into_iter().filter_map(|q| grouped.remove(&q).map(|items| LabeledQuery { query: q, items })).collect()
    }
}

impl PrescriptionHistory for LearningHistory {
    fn prescriptions(&self) -> Vec<LabeledQuery> { self.training_examples() }
}

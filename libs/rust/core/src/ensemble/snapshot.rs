//! Vote snapshots and the session store that keeps them for feedback.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};
use uuid::Uuid;

use crate::types::WeightVector;

/// Raw per-model scores of one `recommend` call, in the candidate order the
/// models saw. Immutable once built.
#[derive(Debug, Clone, Serialize)]
pub struct VoteSnapshot {
    pub session_id: Uuid,
    pub created_at: DateTime<Utc>,
    pub query: String,
    pub candidate_ids: Vec<String>,
    /// model id -> scores aligned with `candidate_ids`
    pub scores: BTreeMap<String, Vec<f64>>,
    pub weights: WeightVector,
}

impl VoteSnapshot {
    pub fn position(&self, candidate_id: &str) -> Option<usize> { self.candidate_ids.iter().position(|c| c == candidate_id) }
    pub fn candidate_count(&self) -> usize { self.candidate_ids.len() }
}

struct Entry {
    stored_at: Instant,
    snapshot: Arc<VoteSnapshot>,
}

#[derive(Default)]
struct Inner {
    by_id: HashMap<Uuid, Entry>,
    order: VecDeque<Uuid>,
    latest: Option<Arc<VoteSnapshot>>,
}

/// Bounded, TTL-evicting map of session id -> snapshot, plus the most recent
/// snapshot for callers that do not carry a session id.
pub struct SessionStore {
    inner: Mutex<Inner>,
    capacity: usize,
    ttl: Duration,
}

impl SessionStore {
    pub fn new(capacity: usize, ttl: Duration) -> Self {
        Self { inner: Mutex::new(Inner::default()), capacity: capacity.max(1), ttl }
    }

    pub fn insert(&self, snapshot: Arc<VoteSnapshot>) {
        let mut g = self.inner.lock();
        let now = Instant::now();
        Self::evict_expired_locked(&mut g, now, self.ttl);
        while g.order.len() >= self.capacity {
            if let Some(old) = g.order.pop_front() { g.by_id.remove(&old); }
        }
        let id = snapshot.session_id;
        g.order.push_back(id);
        g.by_id.insert(id, Entry { stored_at: now, snapshot: snapshot.clone() });
        g.latest = Some(snapshot);
    }

    /// Snapshot for `session_id`, or `None` when unknown or expired.
    pub fn get(&self, session_id: &Uuid) -> Option<Arc<VoteSnapshot>> {
        let mut g = self.inner.lock();
        let expired = match g.by_id.get(session_id) {
            None => return None,
            Some(e) => e.stored_at.elapsed() > self.ttl,
        };
        if expired {
            g.by_id.remove(session_id);
            g.order.retain(|id| id != session_id);
            return None;
        }
        g.by_id.get(session_id).map(|e| e.snapshot.clone())
    }

    /// Most recent snapshot regardless of session; single-writer-latest.
    pub fn latest(&self) -> Option<Arc<VoteSnapshot>> { self.inner.lock().latest.clone() }

    pub fn len(&self) -> usize { self.inner.lock().by_id.len() }
    pub fn is_empty(&self) -> bool { self.len() == 0 }

    fn evict_expired_locked(g: &mut Inner, now: Instant, ttl: Duration) {
        while let Some(front) = g.order.front().copied() {
            let stale = g.by_id.get(&front).map(|e| now.duration_since(e.stored_at) > ttl).unwrap_or(true);
            if !stale { break; }
            g.order.pop_front();
            g.by_id.remove(&front);
        }
    }
}

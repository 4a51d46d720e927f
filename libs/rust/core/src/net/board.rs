use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tracing::{debug, warn};
use uuid::Uuid;

use super::{ClientTask, TaskResult};
use crate::error::{MedFedError, Result};
use crate::federated_learning::{EvaluateIns, EvaluateRes, FitIns, FitRes, FlClient};

#[derive(Default)]
struct BoardState {
    queues: HashMap<String, VecDeque<ClientTask>>,
    waiting: HashMap<Uuid, (String, oneshot::Sender<TaskResult>)>,
}

/// Per-client task queues plus the result channels the orchestrator awaits.
#[derive(Default)]
pub struct TaskBoard {
    state: Mutex<BoardState>,
}

impl TaskBoard {
    pub fn new() -> Self { Self::default() }

    /// Queues `task` for `client`; the receiver resolves when the result is posted.
    pub fn submit(&self, client: &str, task: ClientTask) -> Option<oneshot::Receiver<TaskResult>> {
        let task_id = task.task_id()?;
        let (tx, rx) = oneshot::channel();
        let mut st = self.state.lock();
        st.waiting.insert(task_id, (client.to_string(), tx));
        st.queues.entry(client.to_string()).or_default().push_back(task);
        Some(rx)
    }

    /// Next queued task for `client`, or `Idle`.
    pub fn next_task(&self, client: &str) -> ClientTask {
        self.state.lock().queues.get_mut(client).and_then(VecDeque::pop_front).unwrap_or(ClientTask::Idle)
    }

    /// Delivers a posted result. False when nobody waits for it or it came
    /// from a different client than the task was issued to.
    pub fn complete(&self, client: &str, result: TaskResult) -> bool {
        let task_id = result.task_id();
        let waiter = {
            let mut st = self.state.lock();
            let owned = st.waiting.get(&task_id).is_some_and(|(owner, _)| owner == client);
            if owned { st.waiting.remove(&task_id) } else { None }
        };
        match waiter {
            Some((_, tx)) => tx.send(result).is_ok(),
            None => {
                debug!(client=%client, task=%task_id, "unexpected_task_result");
                false
            }
        }
    }

    /// Forgets a task whether or not it was handed out.
    pub fn cancel(&self, task_id: &Uuid) {
        let mut st = self.state.lock();
        if let Some((client, _)) = st.waiting.remove(task_id) {
            if let Some(q) = st.queues.get_mut(&client) {
                q.retain(|t| t.task_id().as_ref() != Some(task_id));
            }
        }
    }

    /// Drops every queued and outstanding task of `client`.
    pub fn drop_client(&self, client: &str) {
        let mut st = self.state.lock();
        st.queues.remove(client);
        st.waiting.retain(|_, (owner, _)| owner != client);
    }

    pub fn queued(&self, client: &str) -> usize { self.state.lock().queues.get(client).map_or(0, VecDeque::len) }

    pub fn outstanding(&self) -> usize { self.state.lock().waiting.len() }
}

/// Cancels the task if the awaiting future is dropped first.
struct PendingTask<'a> {
    board: &'a TaskBoard,
    task_id: Uuid,
}

impl Drop for PendingTask<'_> {
    fn drop(&mut self) { self.board.cancel(&self.task_id); }
}

/// Orchestrator-side proxy for a participant that polls over HTTP.
pub struct RemoteClient {
    id: String,
    board: Arc<TaskBoard>,
    timeout: Duration,
}

impl RemoteClient {
    pub fn new(id: impl Into<String>, board: Arc<TaskBoard>, timeout: Duration) -> Self {
        Self { id: id.into(), board, timeout }
    }

    async fn dispatch(&self, task: ClientTask, kind: &str) -> Result<TaskResult> {
        let task_id = task.task_id().ok_or_else(|| MedFedError::Transport("idle task cannot be dispatched".into()))?;
        let rx = self.board.submit(&self.id, task).ok_or_else(|| MedFedError::Transport("task rejected".into()))?;
        let _pending = PendingTask { board: &self.board, task_id };
        match tokio::time::timeout(self.timeout, rx).await {
            Ok(Ok(TaskResult::Error { reason, .. })) => Err(MedFedError::ClientReported { client: self.id.clone(), reason }),
            Ok(Ok(result)) => Ok(result),
            Ok(Err(_)) => Err(MedFedError::Transport(format!("{kind} task for {} was dropped", self.id))),
            Err(_) => {
                warn!(client=%self.id, task=%task_id, kind, "remote_task_timeout");
                Err(MedFedError::ClientTimeout { client: self.id.clone(), task: kind.to_string(), timeout_ms: self.timeout.as_millis() as u64 })
            }
        }
    }

    fn mismatch(&self, kind: &str) -> MedFedError {
        MedFedError::Transport(format!("client {} answered {kind} with the wrong result type", self.id))
    }
}

#[async_trait]
impl FlClient for RemoteClient {
    fn id(&self) -> &str { &self.id }

    async fn fit(&self, ins: FitIns) -> Result<FitRes> {
        match self.dispatch(ClientTask::Fit { task_id: Uuid::new_v4(), ins }, "fit").await? {
            TaskResult::Fit { res, .. } => Ok(res),
            _ => Err(self.mismatch("fit")),
        }
    }

    async fn evaluate(&self, ins: EvaluateIns) -> Result<EvaluateRes> {
        match self.dispatch(ClientTask::Evaluate { task_id: Uuid::new_v4(), ins }, "evaluate").await? {
            TaskResult::Evaluate { res, .. } => Ok(res),
            _ => Err(self.mismatch("evaluate")),
        }
    }
}

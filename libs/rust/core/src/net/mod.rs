//! HTTP/JSON surface: the coordinator server, the task board that proxies
//! remote participants, and the participant runtime.

pub mod board;
pub mod participant;
pub mod server;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::federated_learning::{EvaluateIns, EvaluateRes, FitIns, FitRes};
use crate::registry::{Attributes, ClientStatus};
use crate::types::Candidate;

pub use board::{RemoteClient, TaskBoard};
pub use participant::{Participant, ParticipantConfig};
pub use server::{router, serve, serve_on, AppState};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegisterRequest {
    pub client_id: String,
    #[serde(default)]
    pub data_size: u64,
    #[serde(default)]
    pub capabilities: Attributes,
    #[serde(default)]
    pub metadata: Attributes,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusResponse {
    pub client_id: String,
    pub status: ClientStatus,
}

/// Work handed to a participant on poll.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientTask {
    Fit { task_id: Uuid, ins: FitIns },
    Evaluate { task_id: Uuid, ins: EvaluateIns },
    Idle,
}

impl ClientTask {
    pub fn task_id(&self) -> Option<Uuid> {
        match self {
            ClientTask::Fit { task_id, .. } | ClientTask::Evaluate { task_id, .. } => Some(*task_id),
            ClientTask::Idle => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TaskResult {
    Fit { task_id: Uuid, res: FitRes },
    Evaluate { task_id: Uuid, res: EvaluateRes },
    Error { task_id: Uuid, reason: String },
}

impl TaskResult {
    pub fn task_id(&self) -> Uuid {
        match self {
            TaskResult::Fit { task_id, .. } | TaskResult::Evaluate { task_id, .. } | TaskResult::Error { task_id, .. } => *task_id,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecommendRequest {
    pub query: String,
    pub candidates: Vec<Candidate>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FeedbackRequest {
    pub query: String,
    #[serde(default)]
    pub recommended: Vec<String>,
    pub selected: String,
    #[serde(default)]
    pub candidates: Vec<Candidate>,
    #[serde(default)]
    pub session_id: Option<Uuid>,
}

//! Participant runtime: registers with the coordinator, keeps the
//! registration alive and executes the fit/evaluate tasks it polls.

use reqwest::StatusCode;
use std::collections::BTreeMap;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use super::{ClientTask, RegisterRequest, StatusResponse, TaskResult};
use crate::config::ServerConfig;
use crate::error::{MedFedError, Result};
use crate::federated_learning::LocalTrainer;
use crate::registry::{Attributes, ClientStatus};
use crate::resilience::{retry_async, RetryConfig};

#[derive(Debug, Clone)]
pub struct ParticipantConfig {
    pub server_url: String,
    pub client_id: String,
    pub poll_interval: Duration,
    pub heartbeat_interval: Duration,
    pub retry: RetryConfig,
}

impl ParticipantConfig {
    pub fn from_server(server: &ServerConfig, client_id: impl Into<String>) -> Self {
        Self {
            server_url: server.server_url.trim_end_matches('/').to_string(),
            client_id: client_id.into(),
            poll_interval: Duration::from_millis(server.poll_interval_ms.max(10)),
            heartbeat_interval: Duration::from_secs(server.heartbeat_interval_secs.max(1)),
            retry: RetryConfig::default(),
        }
    }
}

pub struct Participant {
    cfg: ParticipantConfig,
    http: reqwest::Client,
    trainer: LocalTrainer,
    capabilities: Attributes,
}

impl Participant {
    pub fn new(cfg: ParticipantConfig, trainer: LocalTrainer) -> Self {
        let mut capabilities = BTreeMap::new();
        capabilities.insert("tasks".to_string(), serde_json::json!(["fit", "evaluate"]));
        Self { cfg, http: reqwest::Client::new(), trainer, capabilities }
    }

    pub fn id(&self) -> &str { &self.cfg.client_id }

    fn url(&self, path: &str) -> String { format!("{}{}", self.cfg.server_url, path) }

    fn client_url(&self, suffix: &str) -> String { self.url(&format!("/v1/clients/{}{}", self.cfg.client_id, suffix)) }

    async fn register_once(&self) -> Result<ClientStatus> {
        let req = RegisterRequest {
            client_id: self.cfg.client_id.clone(),
            data_size: self.trainer.num_examples(),
            capabilities: self.capabilities.clone(),
            metadata: BTreeMap::new(),
        };
        let resp = self.http.post(self.url("/v1/clients/register")).json(&req).send().await?.error_for_status()?;
        let value: serde_json::Value = resp.json().await?;
        Ok(serde_json::from_value(value["status"].clone())?)
    }

    /// Registers, retrying with exponential backoff and jitter.
    pub async fn register(&self) -> Result<ClientStatus> {
        let status = retry_async("register", &self.cfg.retry, |_| self.register_once()).await?;
        info!(client=%self.cfg.client_id, examples = self.trainer.num_examples(), %status, "participant_registered");
        Ok(status)
    }

    /// Sends one heartbeat. Re-registers when the coordinator no longer knows us
    /// or has marked us `Failed`, since only registration clears that state.
    pub async fn heartbeat(&self) -> Result<ClientStatus> {
        let resp = self.http.post(self.client_url("/heartbeat")).send().await?;
        if resp.status() == StatusCode::NOT_FOUND {
            warn!(client=%self.cfg.client_id, "participant_unknown_reregistering");
            return self.register().await;
        }
        let ack: StatusResponse = resp.error_for_status()?.json().await?;
        if ack.status == ClientStatus::Failed {
            warn!(client=%self.cfg.client_id, "participant_failed_reregistering");
            return self.register().await;
        }
        debug!(client=%self.cfg.client_id, status=%ack.status, "heartbeat_sent");
        Ok(ack.status)
    }

    /// Polls for one task and executes it. Returns false when idle.
    pub async fn poll_once(&self) -> Result<bool> {
        let task: ClientTask = self.http.get(self.client_url("/task")).send().await?.error_for_status()?.json().await?;
        let result = match task {
            ClientTask::Idle => return Ok(false),
            ClientTask::Fit { task_id, ins } => {
                info!(client=%self.cfg.client_id, round = ins.round, "participant_fit");
                TaskResult::Fit { task_id, res: self.trainer.fit(&ins).await }
            }
            ClientTask::Evaluate { task_id, ins } => {
                info!(client=%self.cfg.client_id, round = ins.round, "participant_evaluate");
                TaskResult::Evaluate { task_id, res: self.trainer.evaluate(&ins).await }
            }
        };
        let resp = self.http.post(self.client_url("/result")).json(&result).send().await?;
        if !resp.status().is_success() {
            return Err(MedFedError::Transport(format!("result for task {} rejected with {}", result.task_id(), resp.status())));
        }
        Ok(true)
    }

    pub async fn unregister(&self) -> Result<()> {
        self.http.delete(self.client_url("")).send().await?.error_for_status()?;
        Ok(())
    }

    /// Runs until `stop` flips to true, then unregisters.
    pub async fn run(&self, mut stop: watch::Receiver<bool>) -> Result<()> {
        self.register().await?;
        let mut heartbeat = tokio::time::interval(self.cfg.heartbeat_interval);
        let mut poll = tokio::time::interval(self.cfg.poll_interval);
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);
        poll.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                changed = stop.changed() => if changed.is_err() || *stop.borrow() { break },
                _ = heartbeat.tick() => {
                    if let Err(e) = self.heartbeat().await { warn!(client=%self.cfg.client_id, error=%e, "heartbeat_failed"); }
                }
                _ = poll.tick() => {
                    if let Err(e) = self.poll_once().await { warn!(client=%self.cfg.client_id, error=%e, "poll_failed"); }
                }
            }
        }
        if let Err(e) = self.unregister().await {
            warn!(client=%self.cfg.client_id, error=%e, "unregister_failed");
        }
        info!(client=%self.cfg.client_id, "participant_stopped");
        Ok(())
    }
}

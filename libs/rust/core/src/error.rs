//! Error type shared by every component of the engine.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum MedFedError {
    #[error("unknown client {0}")]
    UnknownClient(String),

    #[error("invalid client transition for {client}: {from} -> {to}")]
    InvalidTransition { client: String, from: String, to: String },

    #[error("not enough clients: {available} available, {required} required")]
    NotEnoughClients { available: usize, required: usize },

    #[error("federated run already in progress")]
    RunInProgress,

    #[error("client {client} did not answer {task} within {timeout_ms}ms")]
    ClientTimeout { client: String, task: String, timeout_ms: u64 },

    #[error("client {client} reported error: {reason}")]
    ClientReported { client: String, reason: String },

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("persistence error at {path}: {reason}")]
    Persistence { path: String, reason: String },

    #[error("transport error: {0}")]
    Transport(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, MedFedError>;

impl From<config::ConfigError> for MedFedError {
    fn from(e: config::ConfigError) -> Self { MedFedError::Config(e.to_string()) }
}

impl From<reqwest::Error> for MedFedError {
    fn from(e: reqwest::Error) -> Self { MedFedError::Transport(e.to_string()) }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn messages_carry_context() {
        let err = MedFedError::NotEnoughClients { available: 1, required: 3 };
        assert!(err.to_string().contains("1 available"));
        let err = MedFedError::ClientTimeout { client: "h1".into(), task: "fit".into(), timeout_ms: 500 };
        assert!(err.to_string().contains("h1"));
        assert!(err.to_string().contains("500ms"));
    }
}

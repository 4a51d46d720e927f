//! Layered engine configuration.
//!
//! Sources, lowest precedence first:
//! 1. compiled defaults (`Default` impls below)
//! 2. optional file named by `MEDFED_CONFIG_FILE` (format picked from the extension)
//! 3. environment, e.g. `MEDFED__REGISTRY__HEARTBEAT_TIMEOUT_SECS=30`

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::info;

use crate::error::{MedFedError, Result};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub ensemble: EnsembleConfig,
    pub registry: RegistryConfig,
    pub aggregation: AggregationConfig,
    pub learning: LearningConfig,
    pub federated: FederatedConfig,
    pub server: ServerConfig,
    pub storage: StorageConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EnsembleConfig {
    /// Run scoring models concurrently (one blocking task per model).
    pub parallel: bool,
    pub model_timeout_ms: u64,
    /// Blended score above which display smoothing applies.
    pub interest_threshold: f64,
    pub session_capacity: usize,
    pub session_ttl_secs: u64,
    /// Load and persist learned weights; otherwise always start uniform.
    pub learnable_weights: bool,
}

impl Default for EnsembleConfig {
    fn default() -> Self {
        Self { parallel: true, model_timeout_ms: 5_000, interest_threshold: 0.05, session_capacity: 256, session_ttl_secs: 1_800, learnable_weights: true }
    }
}

impl EnsembleConfig {
    pub fn model_timeout(&self) -> Duration { Duration::from_millis(self.model_timeout_ms) }
    pub fn session_ttl(&self) -> Duration { Duration::from_secs(self.session_ttl_secs) }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RegistryConfig {
    pub heartbeat_timeout_secs: u64,
    pub max_failures: u32,
    pub monitor_interval_secs: u64,
}

impl Default for RegistryConfig {
    fn default() -> Self { Self { heartbeat_timeout_secs: 60, max_failures: 3, monitor_interval_secs: 10 } }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AggregationConfig {
    pub enabled: bool,
    pub interval_secs: u64,
    pub min_updates_before_aggregate: usize,
    /// Push each aggregated vector back into the local ensemble.
    pub apply_to_ensemble: bool,
    pub stop_timeout_ms: u64,
}

impl Default for AggregationConfig {
    fn default() -> Self { Self { enabled: true, interval_secs: 300, min_updates_before_aggregate: 5, apply_to_ensemble: false, stop_timeout_ms: 5_000 } }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LearningConfig {
    pub learning_rate: f64,
    pub evolution_window_days: i64,
    pub evolution_max_points: usize,
}

impl Default for LearningConfig {
    fn default() -> Self { Self { learning_rate: 0.1, evolution_window_days: 30, evolution_max_points: 500 } }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DataSplit {
    Iid,
    NonIid,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FederatedConfig {
    pub num_rounds: u32,
    pub fraction_fit: f64,
    pub fraction_evaluate: f64,
    pub min_fit_clients: usize,
    pub min_available_clients: usize,
    pub local_epochs: u32,
    pub learning_rate: f64,
    pub data_split: DataSplit,
    pub seed: Option<u64>,
    pub num_simulated_clients: usize,
    pub round_timeout_secs: u64,
}

impl Default for FederatedConfig {
    fn default() -> Self {
        Self {
            num_rounds: 5,
            fraction_fit: 0.5,
            fraction_evaluate: 0.5,
            min_fit_clients: 2,
            min_available_clients: 2,
            local_epochs: 1,
            learning_rate: 0.1,
            data_split: DataSplit::Iid,
            seed: None,
            num_simulated_clients: 3,
            round_timeout_secs: 120,
        }
    }
}

impl FederatedConfig {
    pub fn round_timeout(&self) -> Duration { Duration::from_secs(self.round_timeout_secs) }

    pub fn validate(&self) -> Result<()> {
        if !(0.0..=1.0).contains(&self.fraction_fit) || !(0.0..=1.0).contains(&self.fraction_evaluate) {
            return Err(MedFedError::Config("fractions must lie in [0,1]".into()));
        }
        if !(0.0..=1.0).contains(&self.learning_rate) {
            return Err(MedFedError::Config("learning_rate must lie in [0,1]".into()));
        }
        if self.min_fit_clients == 0 {
            return Err(MedFedError::Config("min_fit_clients must be at least 1".into()));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub bind_addr: String,
    /// Base URL participants use to reach the coordinator.
    pub server_url: String,
    pub poll_interval_ms: u64,
    pub heartbeat_interval_secs: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self { bind_addr: "0.0.0.0:8080".into(), server_url: "http://127.0.0.1:8080".into(), poll_interval_ms: 1_000, heartbeat_interval_secs: 15 }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub data_dir: PathBuf,
    pub weights_file: String,
    pub global_weights_file: String,
    pub history_file: String,
    pub stats_file: String,
    pub results_file: String,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("data"),
            weights_file: "ensemble_weights.json".into(),
            global_weights_file: "global_weights.json".into(),
            history_file: "fl_learning_history.json".into(),
            stats_file: "fl_learning_stats.json".into(),
            results_file: "fl_results.json".into(),
        }
    }
}

impl StorageConfig {
    fn resolve(&self, file: &str) -> PathBuf {
        let p = Path::new(file);
        if p.is_absolute() { p.to_path_buf() } else { self.data_dir.join(p) }
    }
    pub fn weights_path(&self) -> PathBuf { self.resolve(&self.weights_file) }
    pub fn global_weights_path(&self) -> PathBuf { self.resolve(&self.global_weights_file) }
    pub fn history_path(&self) -> PathBuf { self.resolve(&self.history_file) }
    pub fn stats_path(&self) -> PathBuf { self.resolve(&self.stats_file) }
    pub fn results_path(&self) -> PathBuf { self.resolve(&self.results_file) }

    /// Storage rooted at `dir`, keeping default file names.
    pub fn in_dir(dir: impl Into<PathBuf>) -> Self { Self { data_dir: dir.into(), ..Self::default() } }
}

/// Loads configuration from the optional file named by `MEDFED_CONFIG_FILE`
/// plus `MEDFED__*` environment overrides.
pub fn load_config() -> Result<EngineConfig> {
    let file = std::env::var("MEDFED_CONFIG_FILE").ok().map(PathBuf::from);
    load_config_from(file.as_deref())
}

pub fn load_config_from(file: Option<&Path>) -> Result<EngineConfig> {
    let mut builder = config::Config::builder();
    if let Some(path) = file {
        builder = builder.add_source(config::File::from(path).required(false));
    }
    builder = builder.add_source(
        config::Environment::with_prefix("MEDFED")
            .prefix_separator("__")
            .separator("__")
            .try_parsing(true),
    );
    let cfg: EngineConfig = builder.build()?.try_deserialize()?;
    cfg.federated.validate()?;
    info!(file=?file, data_dir=%cfg.storage.data_dir.display(), "config_loaded");
    Ok(cfg)
}

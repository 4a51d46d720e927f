//! Multi-round federated training of the ensemble weight vector.

pub mod client;
pub mod coordinator;
pub mod fedavg;
pub mod partition;
pub mod protocol;
pub mod simulation;

pub use client::{top_k_precision, FlClient, LocalTrainer, SimulatedClient};
pub use coordinator::{fit_sample_size, weights_fingerprint, Orchestrator, RoundId, RoundRecord, RunSummary};
pub use fedavg::{fed_avg, weighted_fed_avg};
pub use partition::{partition, synthetic_catalog, synthetic_examples, Dataset};
pub use protocol::{weighted_metrics, DataSource, EvaluateIns, EvaluateRes, FitIns, FitRes, Metrics};
pub use simulation::Simulation;

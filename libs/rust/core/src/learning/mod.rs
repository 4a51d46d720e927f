//! Incremental learning from single feedback events, plus the audit trail.

pub mod history;
pub mod incremental;

pub use history::{ItemPattern, LearningEvent, LearningHistory, LearningStats, NewEvent, WeightPoint};
pub use incremental::{IncrementalLearner, LearningOutcome, LearningResult};

//! # rt-optimizer
//!
//! Sequential model-based parameter search for RegTune.
//!
//! A [`SearchSession`] proposes parameter vectors (seeded random warm-up,
//! then a Gaussian-process surrogate with Expected Improvement), evaluates
//! each over the cohort through a [`Fitness`] implementation, keeps only the
//! best trial's artifacts and checkpoints after every trial so that an
//! interrupted search resumes with identical proposals.

pub mod checkpoint;
pub mod config;
pub mod fitness;
pub mod retention;
pub mod search;
pub mod session;
pub mod surrogate;
pub mod trial;

pub use checkpoint::{Checkpoint, CheckpointStore, CHECKPOINT_VERSION};
pub use config::SessionConfig;
pub use fitness::{Evaluation, Fitness, FitnessEvaluator};
pub use retention::ArtifactRetention;
pub use search::{BayesianSearch, ProposerConfig, ProposerKind, RandomSearch, SearchStrategy};
pub use session::{report_best, LoopPhase, SearchReport, SearchSession, StopSignal, TerminationReason};
pub use trial::{OptimizerState, TrialRecord, TrialStatus, PENALTY_OBJECTIVE};

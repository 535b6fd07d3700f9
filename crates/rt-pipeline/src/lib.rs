//! # rt-pipeline
//!
//! Per-subject registration pipelines for RegTune.
//!
//! A [`PipelineBuilder`] binds one trial's parameter vector onto the
//! registration → resample → similarity chain for each subject, and the
//! [`ExecutionEngine`] runs the resulting [`SubjectGraph`]s concurrently under
//! an isolated [`TrialWorkspace`].

pub mod ants;
pub mod builder;
pub mod engine;
pub mod graph;
pub mod schedule;
pub mod stage;
pub mod workspace;

pub use ants::AntsToolkit;
pub use builder::{default_parameters, registration_seed, registration_space, PipelineBuilder};
pub use engine::{BatchResult, EngineConfig, ExecutionEngine, ExecutionResult};
pub use graph::{InputSource, Link, StageNode, SubjectGraph};
pub use schedule::MultiResolutionSchedule;
pub use stage::{
    OutputKind, OutputSlot, ParameterRecord, Stage, StageInvocation, StageOutputs, StageRegistry,
    StageSpec,
};
pub use workspace::TrialWorkspace;

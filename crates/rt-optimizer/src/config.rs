use rt_pipeline::{registration_seed, registration_space};
use rt_types::{config_error, ParameterVector, RtResult, SearchSpace};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::checkpoint::Checkpoint;
use crate::search::ProposerConfig;

pub const DEFAULT_MAX_CONSECUTIVE_FAILURES: usize = 3;

/// Configuration of one search session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    pub name: String,

    /// Holds the checkpoint, the retained best artifacts and in-flight trial
    /// workspaces.
    pub work_dir: PathBuf,

    pub search_space: SearchSpace,

    /// Evaluated as trial 0 of a fresh session.
    pub initial: Option<ParameterVector>,

    /// Total trials including those restored from a checkpoint.
    pub trial_budget: usize,

    /// Subject graphs executed concurrently within a trial.
    pub worker_budget: usize,

    /// Consecutive failed trials that abort the session.
    pub max_consecutive_failures: usize,

    pub proposer: ProposerConfig,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            name: "regtune".to_string(),
            work_dir: PathBuf::from("optimize"),
            search_space: registration_space(),
            initial: Some(registration_seed()),
            trial_budget: 11,
            worker_budget: 1,
            max_consecutive_failures: DEFAULT_MAX_CONSECUTIVE_FAILURES,
            proposer: ProposerConfig::default(),
        }
    }
}

impl SessionConfig {
    pub fn new(name: impl Into<String>, work_dir: impl Into<PathBuf>) -> Self {
        Self {
            name: name.into(),
            work_dir: work_dir.into(),
            ..Self::default()
        }
    }

    pub fn from_json_file(path: impl AsRef<Path>) -> RtResult<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)
            .map_err(|e| config_error!("cannot read session config {}: {}", path.display(), e))?;
        serde_json::from_str(&raw)
            .map_err(|e| config_error!("invalid session config {}: {}", path.display(), e))
    }

    /// Session settings recorded in a checkpoint, for resuming it from
    /// `work_dir`.
    pub fn from_checkpoint(work_dir: impl Into<PathBuf>, checkpoint: &Checkpoint) -> Self {
        Self {
            name: checkpoint.name.clone(),
            work_dir: work_dir.into(),
            search_space: checkpoint.search_space.clone(),
            initial: checkpoint.initial.clone(),
            proposer: checkpoint.proposer.clone(),
            trial_budget: checkpoint.state.len().max(1),
            worker_budget: checkpoint.worker_budget,
            max_consecutive_failures: checkpoint.max_consecutive_failures,
        }
    }

    pub fn with_search_space(mut self, space: SearchSpace) -> Self {
        self.search_space = space;
        self
    }

    pub fn with_initial(mut self, initial: Option<ParameterVector>) -> Self {
        self.initial = initial;
        self
    }

    pub fn with_trial_budget(mut self, n: usize) -> Self {
        self.trial_budget = n;
        self
    }

    pub fn with_worker_budget(mut self, n: usize) -> Self {
        self.worker_budget = n;
        self
    }

    pub fn with_max_consecutive_failures(mut self, n: usize) -> Self {
        self.max_consecutive_failures = n;
        self
    }

    pub fn with_proposer(mut self, proposer: ProposerConfig) -> Self {
        self.proposer = proposer;
        self
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.proposer.seed = seed;
        self
    }

    pub fn with_min_model_observations(mut self, n: usize) -> Self {
        self.proposer.min_model_observations = n;
        self
    }

    pub fn validate(&self) -> RtResult<()> {
        self.search_space
            .check()
            .map_err(|e| config_error!("search space: {}", e))?;
        if let Some(initial) = &self.initial {
            self.search_space
                .validate(initial)
                .map_err(|e| config_error!("initial vector: {}", e))?;
        }
        if self.trial_budget == 0 {
            return Err(config_error!("trial budget must be at least 1"));
        }
        if self.worker_budget == 0 {
            return Err(config_error!("worker budget must be at least 1"));
        }
        if self.max_consecutive_failures == 0 {
            return Err(config_error!("max consecutive failures must be at least 1"));
        }
        if self.proposer.length_scale.is_nan() || self.proposer.length_scale <= 0.0 {
            return Err(config_error!("proposer length scale must be positive"));
        }
        Ok(())
    }
}

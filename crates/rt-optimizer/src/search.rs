//! Proposal strategies for the next trial's parameter vector.
//!
//! Every strategy is a pure function of its configuration, the search space
//! and the trial history: the random stream for trial `n` is the ChaCha
//! stream `n` of the configured seed. Replaying a checkpointed history
//! therefore reproduces exactly the proposals an uninterrupted run makes.

use ndarray::Array1;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use rt_types::{ParameterKind, ParameterValue, ParameterVector, SearchSpace, TrialId};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::surrogate::{encode, encode_all, expected_improvement, GaussianProcess};
use crate::trial::TrialRecord;

/// Draws tried before a random proposal accepts a repeat.
const MAX_RESAMPLES: usize = 64;

/// Common trait for all proposal strategies.
pub trait SearchStrategy: Send + Sync {
    /// Propose the vector for `trial` given everything evaluated so far.
    fn propose(&self, space: &SearchSpace, history: &[TrialRecord], trial: TrialId) -> ParameterVector;

    /// Human-readable strategy name.
    fn name(&self) -> &str;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProposerKind {
    Random,
    Bayesian,
}

/// Proposal policy settings. Stored in the checkpoint, since proposals
/// depend on them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProposerConfig {
    pub kind: ProposerKind,
    pub seed: u64,
    /// Completed trials required before the surrogate takes over from
    /// random proposals.
    pub min_model_observations: usize,
    /// Random candidates scored per proposal when the space is too large to
    /// enumerate.
    pub candidate_pool: usize,
    /// RBF length scale on the unit hypercube.
    pub length_scale: f64,
    /// Observation noise added to the kernel diagonal.
    pub noise: f64,
    /// Exploration margin of Expected Improvement.
    pub xi: f64,
}

impl Default for ProposerConfig {
    fn default() -> Self {
        Self {
            kind: ProposerKind::Bayesian,
            seed: 0,
            min_model_observations: 10,
            candidate_pool: 256,
            length_scale: 0.5,
            noise: 1e-6,
            xi: 0.01,
        }
    }
}

impl ProposerConfig {
    pub fn random(seed: u64) -> Self {
        Self {
            kind: ProposerKind::Random,
            seed,
            ..Self::default()
        }
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    pub fn with_min_model_observations(mut self, n: usize) -> Self {
        self.min_model_observations = n;
        self
    }

    pub fn with_candidate_pool(mut self, n: usize) -> Self {
        self.candidate_pool = n;
        self
    }

    pub fn build(&self) -> Box<dyn SearchStrategy> {
        match self.kind {
            ProposerKind::Random => Box::new(RandomSearch::new(self.seed)),
            ProposerKind::Bayesian => Box::new(BayesianSearch::new(self.clone())),
        }
    }
}

fn trial_rng(seed: u64, trial: TrialId) -> ChaCha8Rng {
    let mut rng = ChaCha8Rng::seed_from_u64(seed);
    rng.set_stream(trial.0 as u64);
    rng
}

fn seen(history: &[TrialRecord], vector: &ParameterVector) -> bool {
    history.iter().any(|r| &r.parameters == vector)
}

/// Every point of a fully discrete space, or `None` if a dimension is
/// continuous or the grid exceeds `limit`.
fn enumerate_grid(space: &SearchSpace, limit: usize) -> Option<Vec<ParameterVector>> {
    if space.grid_size()? > limit {
        return None;
    }
    let mut grid: Vec<Vec<(String, ParameterValue)>> = vec![Vec::new()];
    for param in &space.parameters {
        let axis: Vec<ParameterValue> = match &param.kind {
            ParameterKind::Categorical { choices } => {
                choices.iter().cloned().map(ParameterValue::Text).collect()
            }
            ParameterKind::IntRange { low, high } => (*low..=*high).map(ParameterValue::Int).collect(),
            ParameterKind::Boolean => vec![ParameterValue::Bool(false), ParameterValue::Bool(true)],
            ParameterKind::RealRange { .. } | ParameterKind::LogUniform { .. } => return None,
        };
        let mut next = Vec::with_capacity(grid.len() * axis.len());
        for combo in &grid {
            for value in &axis {
                let mut combo = combo.clone();
                combo.push((param.name.clone(), value.clone()));
                next.push(combo);
            }
        }
        grid = next;
    }
    Some(grid.into_iter().map(ParameterVector::from_pairs).collect())
}

// ---- Random search ----

/// Seeded space-filling proposals that avoid already evaluated points.
#[derive(Debug, Clone)]
pub struct RandomSearch {
    seed: u64,
}

impl RandomSearch {
    pub fn new(seed: u64) -> Self {
        Self { seed }
    }
}

impl SearchStrategy for RandomSearch {
    fn propose(&self, space: &SearchSpace, history: &[TrialRecord], trial: TrialId) -> ParameterVector {
        let mut rng = trial_rng(self.seed, trial);
        let mut vector = space.sample(&mut rng);
        for _ in 1..MAX_RESAMPLES {
            if !seen(history, &vector) {
                break;
            }
            vector = space.sample(&mut rng);
        }
        vector
    }

    fn name(&self) -> &str {
        "random"
    }
}

// ---- Bayesian search ----

/// Gaussian-process surrogate with Expected Improvement.
///
/// Costs (negated objectives) are modelled; failed trials are imputed with
/// the worst completed cost so the model steers away from them. Fully
/// discrete spaces up to `candidate_pool` points are scored exhaustively,
/// larger ones through a seeded random pool. Ties go to the first candidate.
#[derive(Debug, Clone)]
pub struct BayesianSearch {
    config: ProposerConfig,
    random: RandomSearch,
}

impl BayesianSearch {
    pub fn new(config: ProposerConfig) -> Self {
        let random = RandomSearch::new(config.seed);
        Self { config, random }
    }

    fn candidates(&self, space: &SearchSpace, trial: TrialId) -> Vec<ParameterVector> {
        let pool = self.config.candidate_pool.max(1);
        if let Some(grid) = enumerate_grid(space, pool) {
            return grid;
        }
        let mut rng = trial_rng(self.config.seed, trial);
        (0..pool).map(|_| space.sample(&mut rng)).collect()
    }
}

impl SearchStrategy for BayesianSearch {
    fn propose(&self, space: &SearchSpace, history: &[TrialRecord], trial: TrialId) -> ParameterVector {
        let completed: Vec<&TrialRecord> = history.iter().filter(|r| r.is_completed()).collect();
        if completed.len() < self.config.min_model_observations.max(1) {
            debug!(trial = %trial, observations = completed.len(), "Proposing from random warm-up");
            return self.random.propose(space, history, trial);
        }

        let worst = completed.iter().map(|r| r.cost()).fold(f64::MIN, f64::max);
        let best = completed.iter().map(|r| r.cost()).fold(f64::MAX, f64::min);
        let inputs = encode_all(space, history.iter().map(|r| &r.parameters));
        let targets: Array1<f64> = history
            .iter()
            .map(|r| if r.is_completed() { r.cost() } else { worst })
            .collect();

        let Some(gp) =
            GaussianProcess::fit(inputs, &targets, self.config.length_scale, self.config.noise)
        else {
            warn!(trial = %trial, "Surrogate fit failed, falling back to a random proposal");
            return self.random.propose(space, history, trial);
        };

        let candidates = self.candidates(space, trial);
        let unseen: Vec<&ParameterVector> = candidates.iter().filter(|c| !seen(history, c)).collect();
        let pool: Vec<&ParameterVector> = if unseen.is_empty() {
            candidates.iter().collect()
        } else {
            unseen
        };

        let mut choice: Option<(&ParameterVector, f64)> = None;
        for candidate in pool {
            let (mean, std) = gp.predict(&encode(space, candidate));
            let ei = expected_improvement(mean, std, best, self.config.xi);
            if choice.map(|(_, top)| ei > top).unwrap_or(true) {
                choice = Some((candidate, ei));
            }
        }

        match choice {
            Some((vector, ei)) => {
                debug!(trial = %trial, expected_improvement = ei, "Proposing from surrogate");
                vector.clone()
            }
            None => self.random.propose(space, history, trial),
        }
    }

    fn name(&self) -> &str {
        "bayesian"
    }
}

//! The optimizer loop.
//!
//! ```text
//! INITIALIZING -> PROPOSING -> EVALUATING -> UPDATING -> CHECKPOINTING
//!                     ^                                        |
//!                     +---------------- (budget left) ---------+--> TERMINATED
//! ```
//!
//! Trials run strictly one after another because each proposal depends on
//! every earlier objective. A failed evaluation becomes a penalised record;
//! only systemic faults (checkpoint, artifact swap, a run of failed trials)
//! end the session early.

use chrono::Utc;
use rt_pipeline::TrialWorkspace;
use rt_types::{config_error, RtResult, SystemicError, TrialError, TrialId};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::checkpoint::{Checkpoint, CheckpointStore};
use crate::config::SessionConfig;
use crate::fitness::Fitness;
use crate::retention::{ArtifactRetention, TRIALS_DIR};
use crate::search::SearchStrategy;
use crate::trial::{OptimizerState, TrialRecord};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopPhase {
    Initializing,
    Proposing,
    Evaluating,
    Updating,
    Checkpointing,
    Terminated,
}

/// Requests a stop after the trial in flight has been checkpointed.
#[derive(Debug, Clone, Default)]
pub struct StopSignal(Arc<AtomicBool>);

impl StopSignal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn request(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_requested(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TerminationReason {
    BudgetExhausted,
    Stopped,
}

/// Best result of a session, as reported on termination or read back from
/// a checkpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchReport {
    pub session_id: Uuid,
    pub name: String,
    pub trials: usize,
    pub failed_trials: usize,
    pub best: Option<TrialRecord>,
    /// Retained artifacts of the best trial, if still on disk.
    pub best_artifacts: Option<PathBuf>,
    /// Best objective after each trial.
    pub best_so_far: Vec<Option<f64>>,
    pub termination: Option<TerminationReason>,
}

impl SearchReport {
    fn new(
        checkpoint: &Checkpoint,
        retention: &ArtifactRetention,
        termination: Option<TerminationReason>,
    ) -> Self {
        let best = checkpoint.state.best().cloned();
        let best_artifacts = best
            .as_ref()
            .map(|b| retention.generation_dir(b.trial))
            .filter(|dir| dir.is_dir());
        Self {
            session_id: checkpoint.session_id,
            name: checkpoint.name.clone(),
            trials: checkpoint.state.len(),
            failed_trials: checkpoint.state.failed_count(),
            best,
            best_artifacts,
            best_so_far: checkpoint.state.best_so_far(),
            termination,
        }
    }
}

/// Read the best result of the session checkpointed in `work_dir`.
pub fn report_best(work_dir: impl AsRef<Path>) -> RtResult<SearchReport> {
    let work_dir = work_dir.as_ref();
    let store = CheckpointStore::in_dir(work_dir);
    let checkpoint = store
        .load()?
        .ok_or_else(|| config_error!("no checkpoint found at {}", store.path().display()))?;
    Ok(SearchReport::new(
        &checkpoint,
        &ArtifactRetention::new(work_dir),
        None,
    ))
}

/// A resumable sequential search over one fitness function.
pub struct SearchSession<F: Fitness> {
    config: SessionConfig,
    fitness: F,
    strategy: Box<dyn SearchStrategy>,
    store: CheckpointStore,
    retention: ArtifactRetention,
    state: OptimizerState,
    session_id: Uuid,
    phase: LoopPhase,
    stop: StopSignal,
}

impl<F: Fitness> SearchSession<F> {
    /// INITIALIZING: restore the checkpoint in the work directory if there
    /// is one, otherwise start empty.
    pub fn open(config: SessionConfig, fitness: F) -> RtResult<Self> {
        config.validate()?;
        let retention = ArtifactRetention::new(&config.work_dir);
        retention.prepare()?;
        let store = CheckpointStore::in_dir(&config.work_dir);

        let (session_id, state) = match store.load()? {
            Some(checkpoint) => {
                Self::check_resumable(&config, &checkpoint)?;
                info!(
                    session = %checkpoint.session_id,
                    trials = checkpoint.state.len(),
                    best = ?checkpoint.state.best().map(|b| b.objective),
                    "Resuming search from checkpoint"
                );
                (checkpoint.session_id, checkpoint.state)
            }
            None => {
                let id = Uuid::new_v4();
                info!(session = %id, name = %config.name, "Starting new search");
                (id, OptimizerState::new())
            }
        };
        retention.reconcile(state.best().map(|b| b.trial))?;

        let strategy = config.proposer.build();
        Ok(Self {
            config,
            fitness,
            strategy,
            store,
            retention,
            state,
            session_id,
            phase: LoopPhase::Initializing,
            stop: StopSignal::new(),
        })
    }

    fn check_resumable(config: &SessionConfig, checkpoint: &Checkpoint) -> Result<(), SystemicError> {
        if checkpoint.search_space != config.search_space {
            return Err(SystemicError::CheckpointMismatch {
                message: "search space differs from the checkpointed session".into(),
            });
        }
        if checkpoint.proposer != config.proposer {
            return Err(SystemicError::CheckpointMismatch {
                message: "proposer settings differ from the checkpointed session".into(),
            });
        }
        let out_of_order = checkpoint
            .state
            .records()
            .iter()
            .enumerate()
            .any(|(i, r)| r.trial != TrialId(i));
        if out_of_order {
            return Err(SystemicError::CorruptCheckpoint {
                path: CheckpointStore::in_dir(&config.work_dir).path().display().to_string(),
                message: "trial records are not in sequence".into(),
            });
        }
        Ok(())
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub fn session_id(&self) -> Uuid {
        self.session_id
    }

    pub fn state(&self) -> &OptimizerState {
        &self.state
    }

    pub fn phase(&self) -> LoopPhase {
        self.phase
    }

    pub fn retention(&self) -> &ArtifactRetention {
        &self.retention
    }

    /// Handle for stopping the loop from another task.
    pub fn stop_signal(&self) -> StopSignal {
        self.stop.clone()
    }

    /// Run trials until the budget is spent or a stop is requested.
    pub async fn run(&mut self) -> RtResult<SearchReport> {
        let reason = loop {
            if self.state.len() >= self.config.trial_budget {
                break TerminationReason::BudgetExhausted;
            }
            if self.stop.is_requested() {
                warn!(trials = self.state.len(), "Stop requested, ending search");
                break TerminationReason::Stopped;
            }
            self.step().await?;
        };
        self.enter(LoopPhase::Terminated);

        let report = SearchReport::new(&self.checkpoint(), &self.retention, Some(reason));
        match &report.best {
            Some(best) => info!(
                trial = %best.trial,
                objective = best.objective,
                parameters = %best.parameters,
                trials = report.trials,
                failed = report.failed_trials,
                "Search finished"
            ),
            None => warn!(trials = report.trials, "Search finished without a successful trial"),
        }
        Ok(report)
    }

    /// One PROPOSING → CHECKPOINTING cycle.
    pub async fn step(&mut self) -> RtResult<TrialRecord> {
        let trial = self.state.next_trial();

        self.enter(LoopPhase::Proposing);
        let parameters = match (&self.config.initial, trial.0) {
            (Some(initial), 0) => initial.clone(),
            _ => self
                .strategy
                .propose(&self.config.search_space, self.state.records(), trial),
        };
        info!(
            trial = %trial,
            strategy = self.strategy.name(),
            parameters = %parameters,
            "Evaluating trial"
        );

        self.enter(LoopPhase::Evaluating);
        let started_at = Utc::now();
        let outcome = match TrialWorkspace::create(self.retention.trials_dir(), trial) {
            Ok(workspace) => self.fitness.evaluate(&parameters, &workspace).await,
            Err(e) => Err(TrialError::Workspace {
                trial: trial.0,
                message: e.to_string(),
            }),
        };

        self.enter(LoopPhase::Updating);
        let workspace_dir = Path::new(TRIALS_DIR).join(trial.dir_name());
        let record = match outcome {
            Ok(evaluation) => {
                TrialRecord::completed(trial, parameters, evaluation, workspace_dir, started_at)
            }
            Err(e) => {
                warn!(trial = %trial, error = %e, "Trial failed, recording penalty objective");
                TrialRecord::failed(trial, parameters, e.to_string(), workspace_dir, started_at)
            }
        };
        if record.is_completed() {
            info!(
                trial = %trial,
                objective = record.objective,
                seconds = record.duration_seconds(),
                "Trial finished"
            );
        }
        let improved = self.state.push(record.clone());
        let superseded = if improved {
            info!(trial = %trial, objective = record.objective, "New best objective");
            self.retention.promote(trial)?
        } else {
            if let Err(e) = self.retention.discard(trial) {
                warn!(trial = %trial, error = %e, "Failed to discard trial artifacts");
            }
            None
        };

        self.enter(LoopPhase::Checkpointing);
        self.store.save(&self.checkpoint())?;
        if let Some(old) = superseded {
            if let Err(e) = self.retention.release(&old) {
                warn!(dir = %old.display(), error = %e, "Failed to release superseded artifacts");
            }
        }

        let failures = self.state.consecutive_failures();
        if failures >= self.config.max_consecutive_failures {
            let last_error = record.error.clone().unwrap_or_default();
            error!(failures, last_error = %last_error, "Too many consecutive trial failures");
            return Err(SystemicError::ConsecutiveTrialFailures {
                count: failures,
                last_error,
            }
            .into());
        }
        Ok(record)
    }

    fn checkpoint(&self) -> Checkpoint {
        Checkpoint::new(self.session_id, &self.config, self.state.clone())
    }

    fn enter(&mut self, phase: LoopPhase) {
        debug!(from = ?self.phase, to = ?phase, trial = %self.state.next_trial(), "Loop phase");
        self.phase = phase;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fitness::Evaluation;
    use crate::search::ProposerConfig;
    use async_trait::async_trait;
    use rt_types::{ParameterValue, ParameterVector, RtError, SearchSpace, SubjectId};
    use std::collections::BTreeMap;
    use std::sync::atomic::AtomicUsize;

    /// Scores `x` by a fixed table; `None` entries fail the trial.
    struct Table {
        scores: Vec<Option<f64>>,
        calls: AtomicUsize,
    }

    impl Table {
        fn new(scores: Vec<Option<f64>>) -> Self {
            Self {
                scores,
                calls: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl Fitness for Table {
        async fn evaluate(
            &self,
            parameters: &ParameterVector,
            workspace: &TrialWorkspace,
        ) -> Result<Evaluation, TrialError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            std::fs::write(workspace.dir().join("marker"), workspace.trial().to_string()).unwrap();
            let x = parameters.get("x").and_then(ParameterValue::as_int).unwrap() as usize;
            match self.scores[x] {
                Some(objective) => Ok(Evaluation {
                    objective,
                    subject_scores: BTreeMap::from([(SubjectId::new("sub-1"), objective)]),
                    failed_subjects: BTreeMap::new(),
                }),
                None => Err(TrialError::AllSubjectsFailed {
                    trial: workspace.trial().0,
                    subjects: 1,
                }),
            }
        }
    }

    fn config(dir: &Path, budget: usize) -> SessionConfig {
        SessionConfig::new("unit", dir)
            .with_search_space(SearchSpace::new().add_int("x", 0, 7))
            .with_initial(Some(ParameterVector::from_pairs([("x", ParameterValue::Int(0))])))
            .with_proposer(ProposerConfig::random(11))
            .with_trial_budget(budget)
    }

    #[tokio::test]
    async fn first_trial_uses_the_initial_vector() {
        let dir = tempfile::tempdir().unwrap();
        let fitness = Table::new(vec![Some(0.5); 8]);
        let mut session = SearchSession::open(config(dir.path(), 1), fitness).unwrap();
        let report = session.run().await.unwrap();

        assert_eq!(report.trials, 1);
        assert_eq!(report.termination, Some(TerminationReason::BudgetExhausted));
        let best = report.best.unwrap();
        assert_eq!(best.parameters.get("x"), Some(&ParameterValue::Int(0)));
        assert_eq!(session.phase(), LoopPhase::Terminated);
        assert!(CheckpointStore::in_dir(dir.path()).exists());
    }

    #[tokio::test]
    async fn stop_signal_ends_after_a_checkpointed_trial() {
        let dir = tempfile::tempdir().unwrap();
        let fitness = Table::new(vec![Some(0.5); 8]);
        let mut session = SearchSession::open(config(dir.path(), 5), fitness).unwrap();

        session.step().await.unwrap();
        session.stop_signal().request();
        let report = session.run().await.unwrap();
        assert_eq!(report.trials, 1);
        assert_eq!(report.termination, Some(TerminationReason::Stopped));

        let persisted = report_best(dir.path()).unwrap();
        assert_eq!(persisted.trials, 1);
        assert_eq!(persisted.termination, None);
    }

    #[tokio::test]
    async fn consecutive_failures_abort_after_checkpointing() {
        let dir = tempfile::tempdir().unwrap();
        let fitness = Table::new(vec![None; 8]);
        let mut session = SearchSession::open(
            config(dir.path(), 10).with_max_consecutive_failures(3),
            fitness,
        )
        .unwrap();

        let err = session.run().await.unwrap_err();
        assert!(matches!(
            err,
            RtError::Systemic(SystemicError::ConsecutiveTrialFailures { count: 3, .. })
        ));
        assert_eq!(session.state().len(), 3);
        let persisted = report_best(dir.path()).unwrap();
        assert_eq!(persisted.trials, 3);
        assert_eq!(persisted.failed_trials, 3);
        assert!(persisted.best.is_none());
        assert_eq!(
            std::fs::read_dir(session.retention().trials_dir()).unwrap().count(),
            0
        );
    }

    #[tokio::test]
    async fn isolated_failures_are_penalised_not_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let mut scores = vec![None; 8];
        scores[0] = Some(0.2);
        let fitness = Table::new(scores);
        let mut session = SearchSession::open(
            config(dir.path(), 3).with_max_consecutive_failures(3),
            fitness,
        )
        .unwrap();

        let report = session.run().await.unwrap();
        assert_eq!(report.trials, 3);
        assert_eq!(report.best.unwrap().trial, TrialId(0));
        assert_eq!(report.best_so_far, vec![Some(0.2), Some(0.2), Some(0.2)]);
    }

    #[tokio::test]
    async fn resume_rejects_a_different_search_space() {
        let dir = tempfile::tempdir().unwrap();
        let mut session =
            SearchSession::open(config(dir.path(), 1), Table::new(vec![Some(0.1); 8])).unwrap();
        session.run().await.unwrap();

        let changed = config(dir.path(), 2).with_search_space(SearchSpace::new().add_int("x", 0, 3));
        let err = SearchSession::open(changed, Table::new(vec![Some(0.1); 8]))
            .err()
            .unwrap();
        assert!(matches!(
            err,
            RtError::Systemic(SystemicError::CheckpointMismatch { .. })
        ));
    }

    #[test]
    fn report_without_checkpoint_is_a_config_error() {
        let dir = tempfile::tempdir().unwrap();
        assert!(matches!(report_best(dir.path()), Err(RtError::Config(_))));
    }
}

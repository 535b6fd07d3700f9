//! Fitness evaluation: one parameter vector in, one aggregate objective out.

use async_trait::async_trait;
use rt_pipeline::{BatchResult, ExecutionEngine, ExecutionResult, PipelineBuilder, TrialWorkspace};
use rt_types::{Cohort, ParameterVector, SubjectId, TrialError};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::{info, warn};

/// Aggregate outcome of a successful trial.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Evaluation {
    /// Mean similarity over the subjects that succeeded. Higher is better.
    pub objective: f64,
    pub subject_scores: BTreeMap<SubjectId, f64>,
    pub failed_subjects: BTreeMap<SubjectId, String>,
}

impl Evaluation {
    /// Reduce a batch to its mean score over successful subjects.
    pub fn from_batch(batch: &BatchResult) -> Result<Self, TrialError> {
        let trial = batch.trial.map(|t| t.0).unwrap_or_default();
        if batch.is_empty() {
            return Err(TrialError::EmptyCohort { trial });
        }

        let subject_scores: BTreeMap<SubjectId, f64> = batch
            .successes()
            .map(|(id, score)| (id.clone(), score))
            .collect();
        let failed_subjects: BTreeMap<SubjectId, String> = batch
            .failures()
            .map(|(id, result)| (id.clone(), describe_failure(result)))
            .collect();

        if subject_scores.is_empty() {
            return Err(TrialError::AllSubjectsFailed {
                trial,
                subjects: batch.len(),
            });
        }

        let objective = subject_scores.values().sum::<f64>() / subject_scores.len() as f64;
        if !objective.is_finite() {
            return Err(TrialError::NonFiniteObjective { trial });
        }

        Ok(Self {
            objective,
            subject_scores,
            failed_subjects,
        })
    }

    /// The objective as a cost to minimize.
    ///
    /// This is the only place the maximized similarity is negated; the
    /// surrogate model consumes costs, everything else reports objectives.
    pub fn cost(&self) -> f64 {
        -self.objective
    }
}

fn describe_failure(result: &ExecutionResult) -> String {
    match result {
        ExecutionResult::Failure { error, skipped, .. } if skipped.is_empty() => error.to_string(),
        ExecutionResult::Failure { error, skipped, .. } => {
            format!("{error} (skipped: {})", skipped.join(", "))
        }
        ExecutionResult::Success { .. } => String::new(),
    }
}

/// Maps a parameter vector to an aggregate objective.
#[async_trait]
pub trait Fitness: Send + Sync {
    async fn evaluate(
        &self,
        parameters: &ParameterVector,
        workspace: &TrialWorkspace,
    ) -> Result<Evaluation, TrialError>;
}

/// Runs the registration pipeline over a whole cohort.
#[derive(Debug, Clone)]
pub struct FitnessEvaluator {
    builder: PipelineBuilder,
    engine: ExecutionEngine,
    cohort: Cohort,
}

impl FitnessEvaluator {
    pub fn new(builder: PipelineBuilder, engine: ExecutionEngine, cohort: Cohort) -> Self {
        Self {
            builder,
            engine,
            cohort,
        }
    }
}

#[async_trait]
impl Fitness for FitnessEvaluator {
    async fn evaluate(
        &self,
        parameters: &ParameterVector,
        workspace: &TrialWorkspace,
    ) -> Result<Evaluation, TrialError> {
        let trial = workspace.trial();
        let graphs = self
            .builder
            .build(parameters, &self.cohort.subjects)
            .map_err(|e| TrialError::GraphConstruction {
                trial: trial.0,
                message: e.to_string(),
            })?;

        let batch = self.engine.run_batch(workspace, graphs).await;
        let evaluation = Evaluation::from_batch(&batch)?;

        for (subject, reason) in &evaluation.failed_subjects {
            warn!(trial = %trial, subject = %subject, reason = %reason, "Subject excluded from objective");
        }
        info!(
            trial = %trial,
            objective = evaluation.objective,
            succeeded = evaluation.subject_scores.len(),
            failed = evaluation.failed_subjects.len(),
            "Trial evaluated"
        );
        Ok(evaluation)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rt_pipeline::builder::{outputs, params, stages};
    use rt_pipeline::{EngineConfig, Stage, StageInvocation, StageOutputs, StageRegistry};
    use rt_types::{ParameterValue, StageError, SubjectPair, TrialId};
    use std::path::PathBuf;
    use std::sync::Arc;

    fn success(score: f64) -> ExecutionResult {
        ExecutionResult::Success {
            score,
            artifacts: BTreeMap::new(),
        }
    }

    fn failure() -> ExecutionResult {
        ExecutionResult::Failure {
            stage: stages::REGISTRATION.into(),
            error: StageError::MissingOutput {
                stage: stages::REGISTRATION.into(),
                output: outputs::TRANSFORM.into(),
            },
            skipped: vec![stages::RESAMPLE.into(), stages::SIMILARITY.into()],
        }
    }

    fn batch(results: Vec<(&str, ExecutionResult)>) -> BatchResult {
        BatchResult {
            trial: Some(TrialId(4)),
            results: results
                .into_iter()
                .map(|(id, r)| (SubjectId::new(id), r))
                .collect(),
        }
    }

    #[test]
    fn objective_is_mean_of_successes() {
        let eval = Evaluation::from_batch(&batch(vec![
            ("sub-1", success(0.2)),
            ("sub-2", failure()),
            ("sub-3", success(0.6)),
        ]))
        .unwrap();
        assert!((eval.objective - 0.4).abs() < 1e-12);
        assert_eq!(eval.subject_scores.len(), 2);
        assert!(eval.failed_subjects[&SubjectId::new("sub-2")].contains("skipped"));
        assert_eq!(eval.cost(), -eval.objective);
    }

    #[test]
    fn all_failed_is_a_trial_failure() {
        let err = Evaluation::from_batch(&batch(vec![("sub-1", failure()), ("sub-2", failure())]))
            .unwrap_err();
        assert_eq!(
            err,
            TrialError::AllSubjectsFailed {
                trial: 4,
                subjects: 2
            }
        );
    }

    #[test]
    fn empty_batch_is_a_trial_failure() {
        let err = Evaluation::from_batch(&batch(vec![])).unwrap_err();
        assert_eq!(err, TrialError::EmptyCohort { trial: 4 });
    }

    #[test]
    fn non_finite_mean_is_rejected() {
        let err = Evaluation::from_batch(&batch(vec![
            ("sub-1", success(f64::MAX)),
            ("sub-2", success(f64::MAX)),
        ]))
        .unwrap_err();
        assert_eq!(err, TrialError::NonFiniteObjective { trial: 4 });
    }

    /// Writes a placeholder file for each file output.
    struct Touch(&'static str);

    #[async_trait]
    impl Stage for Touch {
        async fn run(&self, inv: &StageInvocation) -> Result<StageOutputs, StageError> {
            let path = inv.output_dir.join(self.0);
            tokio::fs::write(&path, b"").await.map_err(|e| StageError::Failed {
                stage: inv.stage.clone(),
                message: e.to_string(),
            })?;
            Ok(StageOutputs::new().with_file(self.0, path))
        }
    }

    /// Scores by the similarity bin count.
    struct BinsScore;

    #[async_trait]
    impl Stage for BinsScore {
        async fn run(&self, inv: &StageInvocation) -> Result<StageOutputs, StageError> {
            let bins = inv
                .parameter(params::SIMILARITY_BINS)?
                .as_int()
                .unwrap_or_default();
            Ok(StageOutputs::new().with_scalar(outputs::SIMILARITY, bins as f64 / 64.0))
        }
    }

    fn evaluator(subjects: usize) -> FitnessEvaluator {
        let registry = StageRegistry::new()
            .register(stages::REGISTRATION, Arc::new(Touch(outputs::TRANSFORM)))
            .register(stages::RESAMPLE, Arc::new(Touch(outputs::WARPED_IMAGE)))
            .register(stages::SIMILARITY, Arc::new(BinsScore));
        let cohort = Cohort::new(
            (0..subjects)
                .map(|i| {
                    SubjectPair::new(
                        format!("sub-{i}"),
                        PathBuf::from("/atlas/fixed.nii.gz"),
                        PathBuf::from(format!("/d/{i}.nii.gz")),
                    )
                })
                .collect(),
        )
        .unwrap();
        FitnessEvaluator::new(
            PipelineBuilder::new(),
            ExecutionEngine::new(EngineConfig::default().with_workers(2), registry),
            cohort,
        )
    }

    #[tokio::test]
    async fn evaluates_the_cohort_under_the_trial_workspace() {
        let root = tempfile::tempdir().unwrap();
        let ws = TrialWorkspace::create(root.path(), TrialId(0)).unwrap();
        let vector = ParameterVector::from_pairs([
            (params::METRIC, ParameterValue::Text("MI".into())),
            (params::RESOLUTION_LEVELS, ParameterValue::Int(2)),
        ]);

        let eval = evaluator(3).evaluate(&vector, &ws).await.unwrap();
        assert_eq!(eval.subject_scores.len(), 3);
        assert!((eval.objective - 0.5).abs() < 1e-12);
        assert!(ws.subject_dir(&SubjectId::new("sub-1")).join(stages::REGISTRATION).is_dir());
    }

    #[tokio::test]
    async fn invalid_schedule_fails_the_trial() {
        let root = tempfile::tempdir().unwrap();
        let ws = TrialWorkspace::create(root.path(), TrialId(2)).unwrap();
        let vector = ParameterVector::from_pairs([
            (params::METRIC, ParameterValue::Text("CC".into())),
            (params::RESOLUTION_LEVELS, ParameterValue::Int(0)),
        ]);

        let err = evaluator(1).evaluate(&vector, &ws).await.unwrap_err();
        assert!(matches!(err, TrialError::GraphConstruction { trial: 2, .. }));
    }
}

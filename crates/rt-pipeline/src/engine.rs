//! Execution engine: runs a batch of independent subject graphs.
//!
//! Stages of one subject run in dependency order; subjects run concurrently,
//! at most `max_parallel_subjects` at a time. A stage failure skips everything
//! downstream of it in the same subject and nothing else.

use petgraph::graph::NodeIndex;
use rt_types::{StageError, SubjectId, TrialId};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::Semaphore;
use tracing::{debug, error, info, warn};

use crate::graph::{InputSource, SubjectGraph};
use crate::stage::{StageInvocation, StageOutputs, StageRegistry};
use crate::workspace::TrialWorkspace;

/// Engine configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Worker budget: subject graphs executing at the same time.
    pub max_parallel_subjects: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_parallel_subjects: 1,
        }
    }
}

impl EngineConfig {
    pub fn with_workers(mut self, n: usize) -> Self {
        self.max_parallel_subjects = n;
        self
    }
}

/// Outcome of running one subject graph.
#[derive(Debug, Clone, PartialEq)]
pub enum ExecutionResult {
    Success {
        score: f64,
        /// `"<stage>.<output>"` → file produced in the trial workspace.
        artifacts: BTreeMap<String, PathBuf>,
    },
    Failure {
        stage: String,
        error: StageError,
        /// Stages not run because they depend on a failed stage.
        skipped: Vec<String>,
    },
}

impl ExecutionResult {
    pub fn is_success(&self) -> bool {
        matches!(self, ExecutionResult::Success { .. })
    }

    pub fn score(&self) -> Option<f64> {
        match self {
            ExecutionResult::Success { score, .. } => Some(*score),
            ExecutionResult::Failure { .. } => None,
        }
    }

    pub fn failed_stage(&self) -> Option<&str> {
        match self {
            ExecutionResult::Failure { stage, .. } => Some(stage),
            ExecutionResult::Success { .. } => None,
        }
    }
}

/// Per-subject outcomes of one batch.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BatchResult {
    pub trial: Option<TrialId>,
    pub results: BTreeMap<SubjectId, ExecutionResult>,
}

impl BatchResult {
    pub fn successes(&self) -> impl Iterator<Item = (&SubjectId, f64)> {
        self.results
            .iter()
            .filter_map(|(id, r)| r.score().map(|s| (id, s)))
    }

    pub fn failures(&self) -> impl Iterator<Item = (&SubjectId, &ExecutionResult)> {
        self.results.iter().filter(|(_, r)| !r.is_success())
    }

    pub fn success_count(&self) -> usize {
        self.results.values().filter(|r| r.is_success()).count()
    }

    pub fn len(&self) -> usize {
        self.results.len()
    }

    pub fn is_empty(&self) -> bool {
        self.results.is_empty()
    }
}

/// Runs subject graphs against a registry of stage implementations.
#[derive(Debug, Clone)]
pub struct ExecutionEngine {
    config: EngineConfig,
    registry: Arc<StageRegistry>,
}

impl ExecutionEngine {
    pub fn new(config: EngineConfig, registry: StageRegistry) -> Self {
        Self {
            config,
            registry: Arc::new(registry),
        }
    }

    /// Execute every graph under `workspace`, bounded by the worker budget.
    pub async fn run_batch(
        &self,
        workspace: &TrialWorkspace,
        graphs: Vec<SubjectGraph>,
    ) -> BatchResult {
        let workers = self.config.max_parallel_subjects.max(1);
        let semaphore = Arc::new(Semaphore::new(workers));
        info!(
            trial = %workspace.trial(),
            subjects = graphs.len(),
            workers,
            "Running subject batch"
        );

        let mut handles = Vec::with_capacity(graphs.len());
        for graph in graphs {
            let subject = graph.subject().id.clone();
            let subject_dir = workspace.subject_dir(&subject);
            let registry = Arc::clone(&self.registry);
            let semaphore = Arc::clone(&semaphore);

            let handle = tokio::spawn(async move {
                let _permit = match semaphore.acquire_owned().await {
                    Ok(permit) => permit,
                    Err(_) => {
                        return engine_failure("worker pool closed before the subject could run")
                    }
                };
                run_subject(&registry, &graph, &subject_dir).await
            });
            handles.push((subject, handle));
        }

        let mut results = BTreeMap::new();
        for (subject, handle) in handles {
            let result = match handle.await {
                Ok(result) => result,
                Err(join_error) => {
                    error!(subject = %subject, "Subject task aborted: {}", join_error);
                    engine_failure(&format!("subject task aborted: {join_error}"))
                }
            };
            results.insert(subject, result);
        }

        let batch = BatchResult {
            trial: Some(workspace.trial()),
            results,
        };
        info!(
            trial = %workspace.trial(),
            succeeded = batch.success_count(),
            failed = batch.len() - batch.success_count(),
            "Subject batch finished"
        );
        batch
    }
}

fn engine_failure(message: &str) -> ExecutionResult {
    ExecutionResult::Failure {
        stage: "engine".to_string(),
        error: StageError::Failed {
            stage: "engine".to_string(),
            message: message.to_string(),
        },
        skipped: Vec::new(),
    }
}

/// Run one subject's stages in topological order. Each stage runs at most once.
async fn run_subject(
    registry: &StageRegistry,
    graph: &SubjectGraph,
    subject_dir: &Path,
) -> ExecutionResult {
    let subject = &graph.subject().id;
    let mut produced: HashMap<NodeIndex, StageOutputs> = HashMap::new();
    let mut blocked: HashSet<NodeIndex> = HashSet::new();
    let mut first_failure: Option<(String, StageError)> = None;
    let mut skipped = Vec::new();

    for &idx in graph.topological_order() {
        let node = graph.node(idx);

        if graph.dependencies(idx).any(|dep| blocked.contains(&dep)) {
            debug!(subject = %subject, stage = node.name(), "Skipping stage downstream of a failure");
            blocked.insert(idx);
            skipped.push(node.name().to_string());
            continue;
        }

        match run_stage(registry, graph, idx, &produced, subject_dir).await {
            Ok(outputs) => {
                produced.insert(idx, outputs);
            }
            Err(err) => {
                warn!(subject = %subject, stage = node.name(), "Stage failed: {}", err);
                blocked.insert(idx);
                if first_failure.is_none() {
                    first_failure = Some((node.name().to_string(), err));
                }
            }
        }
    }

    if let Some((stage, error)) = first_failure {
        return ExecutionResult::Failure {
            stage,
            error,
            skipped,
        };
    }

    let objective = graph.objective_stage();
    let score = produced
        .get(&objective)
        .and_then(|o| o.scalars.get(graph.objective_output()).copied());
    let Some(score) = score else {
        let stage = graph.node(objective).name().to_string();
        return ExecutionResult::Failure {
            error: StageError::MissingOutput {
                stage: stage.clone(),
                output: graph.objective_output().to_string(),
            },
            stage,
            skipped,
        };
    };

    let mut artifacts = BTreeMap::new();
    for (idx, outputs) in &produced {
        let stage = graph.node(*idx).name();
        for (name, path) in &outputs.files {
            artifacts.insert(format!("{stage}.{name}"), path.clone());
        }
    }

    debug!(subject = %subject, score, "Subject graph succeeded");
    ExecutionResult::Success { score, artifacts }
}

async fn run_stage(
    registry: &StageRegistry,
    graph: &SubjectGraph,
    idx: NodeIndex,
    produced: &HashMap<NodeIndex, StageOutputs>,
    subject_dir: &Path,
) -> Result<StageOutputs, StageError> {
    let node = graph.node(idx);
    let name = node.name().to_string();

    let mut inputs = BTreeMap::new();
    for (slot, source) in &node.bindings {
        let path = match source {
            InputSource::External(path) => path.clone(),
            InputSource::Upstream { stage, output } => graph
                .dependencies(idx)
                .find(|dep| graph.node(*dep).name() == stage)
                .and_then(|dep| produced.get(&dep))
                .and_then(|o| o.files.get(output))
                .cloned()
                .ok_or_else(|| StageError::UnboundInput {
                    stage: name.clone(),
                    slot: slot.clone(),
                })?,
        };
        inputs.insert(slot.clone(), path);
    }

    let output_dir = subject_dir.join(&name);
    tokio::fs::create_dir_all(&output_dir)
        .await
        .map_err(|e| StageError::LaunchFailed {
            stage: name.clone(),
            message: format!("cannot create {}: {}", output_dir.display(), e),
        })?;

    let stage = registry.get(&name).ok_or_else(|| StageError::LaunchFailed {
        stage: name.clone(),
        message: "no implementation registered".to_string(),
    })?;

    let invocation = StageInvocation {
        stage: name.clone(),
        subject: graph.subject().id.clone(),
        inputs,
        parameters: node.parameters.clone(),
        output_dir,
    };

    debug!(subject = %invocation.subject, stage = %name, "Running stage");
    let outputs = stage.run(&invocation).await?;

    if let Some(missing) = node.spec.outputs.iter().find(|slot| !outputs.provides(slot)) {
        return Err(StageError::MissingOutput {
            stage: name,
            output: missing.name.clone(),
        });
    }
    Ok(outputs)
}

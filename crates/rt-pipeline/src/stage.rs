//! The stage capability: one opaque external computation with declared
//! inputs, parameters and outputs.

use async_trait::async_trait;
use rt_types::{ParameterValue, StageError, SubjectId};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::sync::Arc;

/// Parameters bound to one stage instance, keyed by parameter name.
pub type ParameterRecord = BTreeMap<String, ParameterValue>;

/// What a declared output slot carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OutputKind {
    /// A file materialized in the stage's output directory.
    File,
    /// A single number (e.g. a similarity score).
    Scalar,
}

/// A named output slot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutputSlot {
    pub name: String,
    pub kind: OutputKind,
}

/// Stateless descriptor of a stage.
///
/// Shared by every subject graph built from the same pipeline; only the
/// parameter record and input bindings differ per instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageSpec {
    pub name: String,
    /// Ordered input slot names.
    pub inputs: Vec<String>,
    /// Names of the parameters this stage consumes.
    pub parameters: Vec<String>,
    pub outputs: Vec<OutputSlot>,
}

impl StageSpec {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            inputs: Vec::new(),
            parameters: Vec::new(),
            outputs: Vec::new(),
        }
    }

    pub fn with_inputs<S: Into<String>>(mut self, inputs: impl IntoIterator<Item = S>) -> Self {
        self.inputs = inputs.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_parameters<S: Into<String>>(
        mut self,
        parameters: impl IntoIterator<Item = S>,
    ) -> Self {
        self.parameters = parameters.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_output(mut self, name: impl Into<String>, kind: OutputKind) -> Self {
        self.outputs.push(OutputSlot {
            name: name.into(),
            kind,
        });
        self
    }

    pub fn output(&self, name: &str) -> Option<&OutputSlot> {
        self.outputs.iter().find(|o| o.name == name)
    }
}

/// Everything a stage is handed when it runs.
#[derive(Debug, Clone, PartialEq)]
pub struct StageInvocation {
    pub stage: String,
    pub subject: SubjectId,
    /// Input slot name → resolved file path.
    pub inputs: BTreeMap<String, PathBuf>,
    pub parameters: ParameterRecord,
    /// Directory the stage must write its outputs into.
    pub output_dir: PathBuf,
}

impl StageInvocation {
    pub fn input(&self, slot: &str) -> Result<&PathBuf, StageError> {
        self.inputs.get(slot).ok_or_else(|| StageError::UnboundInput {
            stage: self.stage.clone(),
            slot: slot.to_string(),
        })
    }

    pub fn parameter(&self, name: &str) -> Result<&ParameterValue, StageError> {
        self.parameters.get(name).ok_or_else(|| StageError::Parameter {
            stage: self.stage.clone(),
            message: format!("missing parameter '{name}'"),
        })
    }
}

/// Outputs reported by a successful stage run.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StageOutputs {
    pub files: BTreeMap<String, PathBuf>,
    pub scalars: BTreeMap<String, f64>,
}

impl StageOutputs {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_file(mut self, name: impl Into<String>, path: impl Into<PathBuf>) -> Self {
        self.files.insert(name.into(), path.into());
        self
    }

    pub fn with_scalar(mut self, name: impl Into<String>, value: f64) -> Self {
        self.scalars.insert(name.into(), value);
        self
    }

    /// Whether a declared slot was produced with the right kind.
    ///
    /// File outputs must also exist on disk.
    pub fn provides(&self, slot: &OutputSlot) -> bool {
        match slot.kind {
            OutputKind::File => self
                .files
                .get(&slot.name)
                .map(|p| p.exists())
                .unwrap_or(false),
            OutputKind::Scalar => self
                .scalars
                .get(&slot.name)
                .map(|v| v.is_finite())
                .unwrap_or(false),
        }
    }
}

/// An external computation (registration, resampling, scoring, ...).
///
/// Implementations may block on an external process; the engine awaits
/// them without holding more than the one worker slot of their subject.
#[async_trait]
pub trait Stage: Send + Sync {
    async fn run(&self, invocation: &StageInvocation) -> Result<StageOutputs, StageError>;
}

/// Maps stage names to the implementation that runs them.
#[derive(Clone, Default)]
pub struct StageRegistry {
    stages: HashMap<String, Arc<dyn Stage>>,
}

impl StageRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(mut self, name: impl Into<String>, stage: Arc<dyn Stage>) -> Self {
        self.stages.insert(name.into(), stage);
        self
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Stage>> {
        self.stages.get(name).cloned()
    }
}

impl std::fmt::Debug for StageRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut names: Vec<&String> = self.stages.keys().collect();
        names.sort();
        f.debug_struct("StageRegistry").field("stages", &names).finish()
    }
}

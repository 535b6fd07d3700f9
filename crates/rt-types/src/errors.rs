use thiserror::Error;

/// Main error type for the RegTune system
#[derive(Error, Debug)]
pub enum RtError {
    #[error("Stage failure: {0}")]
    Stage(#[from] StageError),

    #[error("Trial failure: {0}")]
    Trial(#[from] TrialError),

    #[error("Systemic failure: {0}")]
    Systemic(#[from] SystemicError),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Validation error: {0}")]
    Validation(String),
}

impl RtError {
    /// Whether this error must abort a search session.
    pub fn is_systemic(&self) -> bool {
        matches!(self, RtError::Systemic(_))
    }
}

/// An external stage did not produce its declared output.
///
/// Scoped to a single subject graph; the engine folds it into that
/// subject's `ExecutionResult` and keeps running the rest of the batch.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum StageError {
    #[error("Stage {stage} could not be launched: {message}")]
    LaunchFailed { stage: String, message: String },

    #[error("Stage {stage} exited with status {code:?}: {stderr}")]
    NonZeroExit {
        stage: String,
        code: Option<i32>,
        stderr: String,
    },

    #[error("Stage {stage} did not produce declared output '{output}'")]
    MissingOutput { stage: String, output: String },

    #[error("Stage {stage} input '{slot}' is unbound")]
    UnboundInput { stage: String, slot: String },

    #[error("Stage {stage} parameter error: {message}")]
    Parameter { stage: String, message: String },

    #[error("Stage {stage} produced unreadable output: {message}")]
    InvalidOutput { stage: String, message: String },

    #[error("Stage {stage} failed: {message}")]
    Failed { stage: String, message: String },
}

impl StageError {
    /// Name of the stage this failure belongs to.
    pub fn stage(&self) -> &str {
        match self {
            StageError::LaunchFailed { stage, .. }
            | StageError::NonZeroExit { stage, .. }
            | StageError::MissingOutput { stage, .. }
            | StageError::UnboundInput { stage, .. }
            | StageError::Parameter { stage, .. }
            | StageError::InvalidOutput { stage, .. }
            | StageError::Failed { stage, .. } => stage,
        }
    }
}

/// A whole trial could not be scored.
///
/// Recovered by the optimizer loop into a penalized trial record.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum TrialError {
    #[error("All {subjects} subjects failed in trial {trial}")]
    AllSubjectsFailed { trial: usize, subjects: usize },

    #[error("Trial {trial} has an empty cohort")]
    EmptyCohort { trial: usize },

    #[error("Trial {trial} produced a non-finite objective")]
    NonFiniteObjective { trial: usize },

    #[error("Pipeline construction failed for trial {trial}: {message}")]
    GraphConstruction { trial: usize, message: String },

    #[error("Trial {trial} workspace error: {message}")]
    Workspace { trial: usize, message: String },
}

/// Failures that abort a search session.
#[derive(Error, Debug)]
pub enum SystemicError {
    #[error("{count} consecutive trials failed; last error: {last_error}")]
    ConsecutiveTrialFailures { count: usize, last_error: String },

    #[error("Checkpoint {path} is unreadable: {message}")]
    CorruptCheckpoint { path: String, message: String },

    #[error("Checkpoint version {found} is not supported (expected {expected})")]
    UnsupportedCheckpointVersion { found: u32, expected: u32 },

    #[error("Checkpoint does not match the configured session: {message}")]
    CheckpointMismatch { message: String },

    #[error("Failed to persist checkpoint {path}: {message}")]
    CheckpointWrite { path: String, message: String },

    #[error("Best-artifact swap failed for trial {trial}: {message}")]
    ArtifactSwap { trial: usize, message: String },
}

/// Result type alias for RegTune operations
pub type RtResult<T> = Result<T, RtError>;

/// Macro for creating validation errors
#[macro_export]
macro_rules! validation_error {
    ($($arg:tt)*) => {
        $crate::RtError::Validation(format!($($arg)*))
    };
}

/// Macro for creating internal errors
#[macro_export]
macro_rules! internal_error {
    ($($arg:tt)*) => {
        $crate::RtError::Internal(format!($($arg)*))
    };
}

/// Macro for creating configuration errors
#[macro_export]
macro_rules! config_error {
    ($($arg:tt)*) => {
        $crate::RtError::Config(format!($($arg)*))
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display_names_the_stage() {
        let error = StageError::MissingOutput {
            stage: "registration".to_string(),
            output: "transform".to_string(),
        };

        assert!(error.to_string().contains("registration"));
        assert!(error.to_string().contains("transform"));
        assert_eq!(error.stage(), "registration");
    }

    #[test]
    fn sub_errors_convert_into_rt_error() {
        let trial_error = TrialError::AllSubjectsFailed {
            trial: 4,
            subjects: 2,
        };
        let rt_error: RtError = trial_error.into();

        match rt_error {
            RtError::Trial(_) => (),
            _ => panic!("Expected Trial error"),
        }
        assert!(!rt_error.is_systemic());
    }

    #[test]
    fn systemic_classification() {
        let err: RtError = SystemicError::ConsecutiveTrialFailures {
            count: 3,
            last_error: "boom".into(),
        }
        .into();
        assert!(err.is_systemic());
        assert!(err.to_string().contains("3 consecutive"));
    }

    #[test]
    fn macros_build_classified_errors() {
        let validation_err = validation_error!("Invalid value: {}", 42);
        assert!(matches!(validation_err, RtError::Validation(_)));
        let _internal_err = internal_error!("Something went wrong");
        let config_err = config_error!("Missing required field: {}", "cohort");
        assert!(config_err.to_string().contains("cohort"));
    }
}

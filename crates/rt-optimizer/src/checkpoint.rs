//! Durable, versioned snapshots of a search session.

use chrono::{DateTime, Utc};
use rt_types::{ParameterVector, RtResult, SearchSpace, SystemicError};
use serde::{Deserialize, Serialize};
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::debug;
use uuid::Uuid;

use crate::config::{SessionConfig, DEFAULT_MAX_CONSECUTIVE_FAILURES};
use crate::search::ProposerConfig;
use crate::trial::OptimizerState;

pub const CHECKPOINT_VERSION: u32 = 1;
pub const CHECKPOINT_FILE: &str = "checkpoint.json";

/// Everything needed to resume a search with identical proposals.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub version: u32,
    pub session_id: Uuid,
    pub name: String,
    pub search_space: SearchSpace,
    pub initial: Option<ParameterVector>,
    pub proposer: ProposerConfig,
    #[serde(default = "default_worker_budget")]
    pub worker_budget: usize,
    #[serde(default = "default_max_consecutive_failures")]
    pub max_consecutive_failures: usize,
    pub state: OptimizerState,
    pub saved_at: DateTime<Utc>,
}

fn default_worker_budget() -> usize {
    1
}

fn default_max_consecutive_failures() -> usize {
    DEFAULT_MAX_CONSECUTIVE_FAILURES
}

impl Checkpoint {
    /// Snapshot of `state` under the settings of `config`.
    pub fn new(session_id: Uuid, config: &SessionConfig, state: OptimizerState) -> Self {
        Self {
            version: CHECKPOINT_VERSION,
            session_id,
            name: config.name.clone(),
            search_space: config.search_space.clone(),
            initial: config.initial.clone(),
            proposer: config.proposer.clone(),
            worker_budget: config.worker_budget,
            max_consecutive_failures: config.max_consecutive_failures,
            state,
            saved_at: Utc::now(),
        }
    }
}

/// A single checkpoint file, replaced atomically on every save.
#[derive(Debug, Clone)]
pub struct CheckpointStore {
    path: PathBuf,
}

impl CheckpointStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// The checkpoint file inside a session work directory.
    pub fn in_dir(work_dir: impl AsRef<Path>) -> Self {
        Self::new(work_dir.as_ref().join(CHECKPOINT_FILE))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Write to a temporary sibling, fsync, then rename over the old file.
    pub fn save(&self, checkpoint: &Checkpoint) -> Result<(), SystemicError> {
        let write_err = |message: String| SystemicError::CheckpointWrite {
            path: self.path.display().to_string(),
            message,
        };
        let dir = match self.path.parent() {
            Some(p) if !p.as_os_str().is_empty() => p,
            _ => Path::new("."),
        };

        let bytes = serde_json::to_vec_pretty(checkpoint).map_err(|e| write_err(e.to_string()))?;
        let mut tmp = tempfile::NamedTempFile::new_in(dir).map_err(|e| write_err(e.to_string()))?;
        tmp.write_all(&bytes).map_err(|e| write_err(e.to_string()))?;
        tmp.as_file().sync_all().map_err(|e| write_err(e.to_string()))?;
        tmp.persist(&self.path)
            .map_err(|e| write_err(e.error.to_string()))?;

        debug!(
            path = %self.path.display(),
            trials = checkpoint.state.len(),
            "Checkpoint saved"
        );
        Ok(())
    }

    /// `None` if no checkpoint exists yet.
    pub fn load(&self) -> RtResult<Option<Checkpoint>> {
        let bytes = match std::fs::read(&self.path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(self.corrupt(e.to_string()).into()),
        };

        let raw: serde_json::Value =
            serde_json::from_slice(&bytes).map_err(|e| self.corrupt(e.to_string()))?;
        let version = raw
            .get("version")
            .and_then(serde_json::Value::as_u64)
            .ok_or_else(|| self.corrupt("missing format version".into()))?;
        if version != u64::from(CHECKPOINT_VERSION) {
            return Err(SystemicError::UnsupportedCheckpointVersion {
                found: version as u32,
                expected: CHECKPOINT_VERSION,
            }
            .into());
        }

        let checkpoint: Checkpoint =
            serde_json::from_value(raw).map_err(|e| self.corrupt(e.to_string()))?;
        Ok(Some(checkpoint))
    }

    pub fn exists(&self) -> bool {
        self.path.exists()
    }

    fn corrupt(&self, message: String) -> SystemicError {
        SystemicError::CorruptCheckpoint {
            path: self.path.display().to_string(),
            message,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fitness::Evaluation;
    use crate::trial::TrialRecord;
    use rt_types::{ParameterValue, RtError, SubjectId, TrialId};
    use std::collections::BTreeMap;

    fn checkpoint() -> Checkpoint {
        let space = SearchSpace::new().add_real("step", 0.0, 1.0);
        let mut state = OptimizerState::new();
        for (i, objective) in [0.1 + 0.2, 1.0 / 3.0].into_iter().enumerate() {
            let vector = ParameterVector::from_pairs([("step", ParameterValue::Float(objective / 7.0))]);
            state.push(TrialRecord::completed(
                TrialId(i),
                vector,
                Evaluation {
                    objective,
                    subject_scores: BTreeMap::from([(SubjectId::new("sub-1"), objective)]),
                    failed_subjects: BTreeMap::new(),
                },
                TrialId(i).dir_name().into(),
                Utc::now(),
            ));
        }
        let config = SessionConfig::new("unit", "unused")
            .with_search_space(space)
            .with_initial(None)
            .with_proposer(ProposerConfig::random(5))
            .with_worker_budget(4)
            .with_max_consecutive_failures(6);
        Checkpoint::new(Uuid::new_v4(), &config, state)
    }

    #[test]
    fn missing_checkpoint_loads_as_none() {
        let dir = tempfile::tempdir().unwrap();
        let store = CheckpointStore::in_dir(dir.path());
        assert!(!store.exists());
        assert!(store.load().unwrap().is_none());
    }

    #[test]
    fn save_and_load_is_exact() {
        let dir = tempfile::tempdir().unwrap();
        let store = CheckpointStore::in_dir(dir.path());
        let cp = checkpoint();
        store.save(&cp).unwrap();
        assert_eq!(store.load().unwrap().unwrap(), cp);

        // overwrite leaves no temporaries behind
        store.save(&cp).unwrap();
        let entries = std::fs::read_dir(dir.path()).unwrap().count();
        assert_eq!(entries, 1);
    }

    #[test]
    fn session_limits_default_when_absent() {
        let dir = tempfile::tempdir().unwrap();
        let store = CheckpointStore::in_dir(dir.path());
        let cp = checkpoint();
        assert_eq!((cp.worker_budget, cp.max_consecutive_failures), (4, 6));

        let mut raw = serde_json::to_value(&cp).unwrap();
        let fields = raw.as_object_mut().unwrap();
        fields.remove("worker_budget");
        fields.remove("max_consecutive_failures");
        std::fs::write(store.path(), serde_json::to_vec(&raw).unwrap()).unwrap();

        let loaded = store.load().unwrap().unwrap();
        assert_eq!(loaded.worker_budget, 1);
        assert_eq!(loaded.max_consecutive_failures, DEFAULT_MAX_CONSECUTIVE_FAILURES);
        assert_eq!(loaded.state, cp.state);
    }

    #[test]
    fn garbage_is_a_systemic_error() {
        let dir = tempfile::tempdir().unwrap();
        let store = CheckpointStore::in_dir(dir.path());
        std::fs::write(store.path(), b"{ not json").unwrap();
        let err = store.load().unwrap_err();
        assert!(matches!(
            err,
            RtError::Systemic(SystemicError::CorruptCheckpoint { .. })
        ));
        assert!(err.is_systemic());
    }

    #[test]
    fn unknown_version_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let store = CheckpointStore::in_dir(dir.path());
        let mut raw = serde_json::to_value(checkpoint()).unwrap();
        raw["version"] = serde_json::json!(99);
        std::fs::write(store.path(), serde_json::to_vec(&raw).unwrap()).unwrap();
        assert!(matches!(
            store.load().unwrap_err(),
            RtError::Systemic(SystemicError::UnsupportedCheckpointVersion {
                found: 99,
                expected: 1
            })
        ));
    }
}

use rt_types::{SubjectId, TrialId};
use std::path::{Path, PathBuf};
use tracing::debug;

/// Isolated scratch directory of one trial.
///
/// Every stage of every subject writes beneath it, so neither concurrent
/// subjects nor successive trials can collide on stage names.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrialWorkspace {
    trial: TrialId,
    dir: PathBuf,
}

impl TrialWorkspace {
    /// Create `<root>/trial-NNNN`, discarding anything a previous,
    /// interrupted attempt at the same trial left behind.
    pub fn create(root: impl AsRef<Path>, trial: TrialId) -> std::io::Result<Self> {
        let dir = root.as_ref().join(trial.dir_name());
        if dir.exists() {
            debug!(trial = %trial, dir = %dir.display(), "Removing stale trial workspace");
            std::fs::remove_dir_all(&dir)?;
        }
        std::fs::create_dir_all(&dir)?;
        Ok(Self { trial, dir })
    }

    pub fn trial(&self) -> TrialId {
        self.trial
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn subject_dir(&self, subject: &SubjectId) -> PathBuf {
        self.dir.join(subject.as_str())
    }
}

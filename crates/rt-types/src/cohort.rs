use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::errors::RtResult;
use crate::{config_error, validation_error};

/// Identity of one subject in the cohort.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SubjectId(String);

impl SubjectId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for SubjectId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// A fixed/moving image pair registered against each other in every trial.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubjectPair {
    pub id: SubjectId,
    pub fixed_image: PathBuf,
    pub moving_image: PathBuf,
}

impl SubjectPair {
    pub fn new(
        id: impl Into<String>,
        fixed_image: impl Into<PathBuf>,
        moving_image: impl Into<PathBuf>,
    ) -> Self {
        Self {
            id: SubjectId::new(id),
            fixed_image: fixed_image.into(),
            moving_image: moving_image.into(),
        }
    }
}

/// The set of subject pairs evaluated by every trial.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Cohort {
    pub subjects: Vec<SubjectPair>,
}

impl Cohort {
    pub fn new(subjects: Vec<SubjectPair>) -> RtResult<Self> {
        let cohort = Self { subjects };
        cohort.check()?;
        Ok(cohort)
    }

    /// Load a cohort from a JSON file holding either a `{"subjects": [...]}`
    /// object or a bare list of pairs.
    pub fn from_json_file(path: impl AsRef<Path>) -> RtResult<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)
            .map_err(|e| config_error!("cannot read cohort file {}: {}", path.display(), e))?;
        let value: serde_json::Value = serde_json::from_str(&raw)?;
        let cohort = if value.is_array() {
            Self {
                subjects: serde_json::from_value(value)?,
            }
        } else {
            serde_json::from_value(value)?
        };
        cohort.check()?;
        Ok(cohort)
    }

    /// Keep only the first `n` subjects.
    pub fn truncate(mut self, n: usize) -> Self {
        self.subjects.truncate(n);
        self
    }

    pub fn len(&self) -> usize {
        self.subjects.len()
    }

    pub fn is_empty(&self) -> bool {
        self.subjects.is_empty()
    }

    fn check(&self) -> RtResult<()> {
        if self.subjects.is_empty() {
            return Err(validation_error!("cohort has no subjects"));
        }
        let mut ids: Vec<&SubjectId> = self.subjects.iter().map(|s| &s.id).collect();
        ids.sort();
        if let Some(pair) = ids.windows(2).find(|w| w[0] == w[1]) {
            return Err(validation_error!("duplicate subject id '{}'", pair[0]));
        }
        Ok(())
    }
}

/// Sequence index of a trial within one search session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TrialId(pub usize);

impl TrialId {
    /// Directory name of this trial's isolated workspace.
    pub fn dir_name(&self) -> String {
        format!("trial-{:04}", self.0)
    }
}

impl std::fmt::Display for TrialId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

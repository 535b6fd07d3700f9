//! Artifact retention: only the best trial's outputs survive.
//!
//! Session directory layout:
//!
//! ```text
//! <work_dir>/
//!   checkpoint.json
//!   trials/trial-NNNN/   in-flight trial workspace
//!   best-NNNN/           retained generation (at most one after a trial)
//!   best -> best-NNNN    symlink, replaced by rename
//! ```
//!
//! A new best is moved (never copied) out of `trials/` into its own
//! generation directory, and the `best` link is swung over with an atomic
//! rename, so the link always names a complete generation. The superseded
//! generation is released only once the checkpoint recording the new best
//! is durable.

use rt_types::{SystemicError, TrialId};
use std::io;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

pub const TRIALS_DIR: &str = "trials";
pub const BEST_LINK: &str = "best";
const GENERATION_PREFIX: &str = "best-";
const LINK_TMP: &str = ".best.tmp";

#[derive(Debug, Clone)]
pub struct ArtifactRetention {
    root: PathBuf,
}

impl ArtifactRetention {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Create the session and trial directories.
    pub fn prepare(&self) -> io::Result<()> {
        std::fs::create_dir_all(self.trials_dir())
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Parent of every trial workspace.
    pub fn trials_dir(&self) -> PathBuf {
        self.root.join(TRIALS_DIR)
    }

    pub fn best_link(&self) -> PathBuf {
        self.root.join(BEST_LINK)
    }

    pub fn generation_dir(&self, trial: TrialId) -> PathBuf {
        self.root.join(generation_name(trial))
    }

    /// Generation the `best` link currently points at.
    pub fn current_best(&self) -> Option<PathBuf> {
        let target = std::fs::read_link(self.best_link()).ok()?;
        Some(if target.is_relative() {
            self.root.join(target)
        } else {
            target
        })
    }

    /// Delete a finished trial's workspace.
    pub fn discard(&self, trial: TrialId) -> io::Result<()> {
        let dir = self.trials_dir().join(trial.dir_name());
        remove_dir_if_exists(&dir)?;
        debug!(trial = %trial, "Trial artifacts discarded");
        Ok(())
    }

    /// Make `trial` the retained best. Returns the superseded generation,
    /// which the caller releases after checkpointing.
    pub fn promote(&self, trial: TrialId) -> Result<Option<PathBuf>, SystemicError> {
        let swap_err = |e: io::Error| SystemicError::ArtifactSwap {
            trial: trial.0,
            message: e.to_string(),
        };

        let source = self.trials_dir().join(trial.dir_name());
        let generation = self.generation_dir(trial);
        remove_dir_if_exists(&generation).map_err(swap_err)?;
        if source.exists() {
            std::fs::rename(&source, &generation).map_err(swap_err)?;
        } else {
            std::fs::create_dir_all(&generation).map_err(swap_err)?;
        }

        let previous = self.current_best();
        self.point_link_at(trial).map_err(swap_err)?;
        info!(trial = %trial, dir = %generation.display(), "Best artifacts retained");
        Ok(previous.filter(|p| p != &generation))
    }

    /// Delete a superseded generation.
    pub fn release(&self, generation: &Path) -> io::Result<()> {
        remove_dir_if_exists(generation)?;
        debug!(dir = %generation.display(), "Superseded best artifacts released");
        Ok(())
    }

    /// Bring the directory in line with a checkpoint whose best trial is
    /// `best`, after an interruption at any point of a trial.
    pub fn reconcile(&self, best: Option<TrialId>) -> Result<(), SystemicError> {
        let trial = best.map(|t| t.0).unwrap_or_default();
        let swap_err = |e: io::Error| SystemicError::ArtifactSwap {
            trial,
            message: e.to_string(),
        };

        for entry in std::fs::read_dir(self.trials_dir()).map_err(swap_err)? {
            let path = entry.map_err(swap_err)?.path();
            warn!(dir = %path.display(), "Removing workspace of an unrecorded trial");
            remove_any(&path).map_err(swap_err)?;
        }

        let keep = best.map(|t| self.generation_dir(t));
        for entry in std::fs::read_dir(&self.root).map_err(swap_err)? {
            let path = entry.map_err(swap_err)?.path();
            let is_generation = path
                .file_name()
                .and_then(|n| n.to_str())
                .map(|n| n.starts_with(GENERATION_PREFIX))
                .unwrap_or(false);
            if is_generation && Some(&path) != keep.as_ref() {
                warn!(dir = %path.display(), "Removing stale best generation");
                remove_any(&path).map_err(swap_err)?;
            }
        }

        match (best, keep) {
            (Some(t), Some(dir)) if dir.is_dir() => {
                if self.current_best().as_ref() != Some(&dir) {
                    self.point_link_at(t).map_err(swap_err)?;
                }
            }
            (Some(t), _) => {
                warn!(trial = %t, "Best trial artifacts are missing");
                remove_link_if_exists(&self.best_link()).map_err(swap_err)?;
            }
            (None, _) => remove_link_if_exists(&self.best_link()).map_err(swap_err)?,
        }
        Ok(())
    }

    fn point_link_at(&self, trial: TrialId) -> io::Result<()> {
        let tmp = self.root.join(LINK_TMP);
        remove_link_if_exists(&tmp)?;
        make_link(Path::new(&generation_name(trial)), &tmp)?;
        std::fs::rename(&tmp, self.best_link())
    }
}

fn generation_name(trial: TrialId) -> String {
    format!("{GENERATION_PREFIX}{:04}", trial.0)
}

fn remove_dir_if_exists(dir: &Path) -> io::Result<()> {
    match std::fs::remove_dir_all(dir) {
        Err(e) if e.kind() != io::ErrorKind::NotFound => Err(e),
        _ => Ok(()),
    }
}

fn remove_any(path: &Path) -> io::Result<()> {
    let meta = std::fs::symlink_metadata(path)?;
    if meta.is_dir() {
        std::fs::remove_dir_all(path)
    } else {
        std::fs::remove_file(path)
    }
}

fn remove_link_if_exists(link: &Path) -> io::Result<()> {
    if std::fs::symlink_metadata(link).is_err() {
        return Ok(());
    }
    std::fs::remove_file(link).or_else(|_| std::fs::remove_dir(link))
}

#[cfg(unix)]
fn make_link(target: &Path, link: &Path) -> io::Result<()> {
    std::os::unix::fs::symlink(target, link)
}

#[cfg(windows)]
fn make_link(target: &Path, link: &Path) -> io::Result<()> {
    std::os::windows::fs::symlink_dir(target, link)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn retention() -> (tempfile::TempDir, ArtifactRetention) {
        let dir = tempfile::tempdir().unwrap();
        let retention = ArtifactRetention::new(dir.path());
        retention.prepare().unwrap();
        (dir, retention)
    }

    fn fill(retention: &ArtifactRetention, trial: TrialId) {
        let dir = retention.trials_dir().join(trial.dir_name());
        std::fs::create_dir_all(dir.join("sub-1")).unwrap();
        std::fs::write(dir.join("sub-1").join("warped.nii.gz"), trial.dir_name()).unwrap();
    }

    #[test]
    fn promote_moves_trial_and_swings_link() {
        let (_dir, retention) = retention();
        fill(&retention, TrialId(0));
        assert_eq!(retention.promote(TrialId(0)).unwrap(), None);

        let best = retention.best_link();
        let content = std::fs::read_to_string(best.join("sub-1").join("warped.nii.gz")).unwrap();
        assert_eq!(content, "trial-0000");
        assert!(!retention.trials_dir().join("trial-0000").exists());

        fill(&retention, TrialId(3));
        let superseded = retention.promote(TrialId(3)).unwrap();
        assert_eq!(superseded, Some(retention.generation_dir(TrialId(0))));
        assert_eq!(retention.current_best(), Some(retention.generation_dir(TrialId(3))));

        // the old generation stays until released
        assert!(retention.generation_dir(TrialId(0)).exists());
        retention.release(&superseded.unwrap()).unwrap();
        assert!(!retention.generation_dir(TrialId(0)).exists());
    }

    #[test]
    fn discard_removes_workspace() {
        let (_dir, retention) = retention();
        fill(&retention, TrialId(1));
        retention.discard(TrialId(1)).unwrap();
        assert!(!retention.trials_dir().join("trial-0001").exists());
        retention.discard(TrialId(1)).unwrap();
    }

    #[test]
    fn reconcile_rolls_back_an_unrecorded_promotion() {
        let (_dir, retention) = retention();
        fill(&retention, TrialId(0));
        retention.promote(TrialId(0)).unwrap();
        // trial 2 promoted, then interrupted before its checkpoint
        fill(&retention, TrialId(2));
        retention.promote(TrialId(2)).unwrap();
        fill(&retention, TrialId(3));

        retention.reconcile(Some(TrialId(0))).unwrap();
        assert_eq!(retention.current_best(), Some(retention.generation_dir(TrialId(0))));
        assert!(!retention.generation_dir(TrialId(2)).exists());
        assert_eq!(std::fs::read_dir(retention.trials_dir()).unwrap().count(), 0);
    }

    #[test]
    fn reconcile_without_best_clears_everything() {
        let (_dir, retention) = retention();
        fill(&retention, TrialId(0));
        retention.promote(TrialId(0)).unwrap();
        retention.reconcile(None).unwrap();
        assert!(std::fs::symlink_metadata(retention.best_link()).is_err());
        assert!(!retention.generation_dir(TrialId(0)).exists());
    }
}

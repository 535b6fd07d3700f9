//! Trial records and the optimizer state they accumulate into.

use chrono::{DateTime, Utc};
use rt_types::{ParameterVector, SubjectId, TrialId};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;

use crate::fitness::Evaluation;

/// Objective recorded for a failed trial; below any real similarity.
pub const PENALTY_OBJECTIVE: f64 = f64::MIN;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TrialStatus {
    Completed,
    Failed,
}

/// One full cohort evaluation of a single parameter vector.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrialRecord {
    pub trial: TrialId,
    pub parameters: ParameterVector,
    /// Mean similarity over successful subjects (higher is better), or
    /// [`PENALTY_OBJECTIVE`] when the trial failed.
    pub objective: f64,
    pub status: TrialStatus,
    pub error: Option<String>,
    pub subject_scores: BTreeMap<SubjectId, f64>,
    pub failed_subjects: BTreeMap<SubjectId, String>,
    /// Scratch workspace the trial ran in, relative to the session work
    /// directory. It is gone once the trial settles: a best trial's
    /// artifacts move to [`ArtifactRetention::generation_dir`], every other
    /// trial's are discarded.
    ///
    /// [`ArtifactRetention::generation_dir`]: crate::retention::ArtifactRetention::generation_dir
    pub workspace_dir: PathBuf,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

impl TrialRecord {
    pub fn completed(
        trial: TrialId,
        parameters: ParameterVector,
        evaluation: Evaluation,
        workspace_dir: PathBuf,
        started_at: DateTime<Utc>,
    ) -> Self {
        Self {
            trial,
            parameters,
            objective: evaluation.objective,
            status: TrialStatus::Completed,
            error: None,
            subject_scores: evaluation.subject_scores,
            failed_subjects: evaluation.failed_subjects,
            workspace_dir,
            started_at,
            finished_at: Utc::now(),
        }
    }

    pub fn failed(
        trial: TrialId,
        parameters: ParameterVector,
        error: String,
        workspace_dir: PathBuf,
        started_at: DateTime<Utc>,
    ) -> Self {
        Self {
            trial,
            parameters,
            objective: PENALTY_OBJECTIVE,
            status: TrialStatus::Failed,
            error: Some(error),
            subject_scores: BTreeMap::new(),
            failed_subjects: BTreeMap::new(),
            workspace_dir,
            started_at,
            finished_at: Utc::now(),
        }
    }

    /// Minimization cost the surrogate consumes; see [`Evaluation::cost`].
    pub fn cost(&self) -> f64 {
        -self.objective
    }

    pub fn is_completed(&self) -> bool {
        self.status == TrialStatus::Completed
    }

    pub fn duration_seconds(&self) -> f64 {
        (self.finished_at - self.started_at).num_milliseconds() as f64 / 1000.0
    }
}

/// Ordered history of a search session.
///
/// The surrogate is refit from this history on every proposal, so the
/// records plus the strategy settings are the whole of the search state.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct OptimizerState {
    records: Vec<TrialRecord>,
}

impl OptimizerState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn records(&self) -> &[TrialRecord] {
        &self.records
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Identifier the next trial will get.
    pub fn next_trial(&self) -> TrialId {
        TrialId(self.records.len())
    }

    /// Append a record; returns `true` if it became the new best.
    pub fn push(&mut self, record: TrialRecord) -> bool {
        let improves = record.is_completed()
            && self
                .best()
                .map(|best| record.objective > best.objective)
                .unwrap_or(true);
        self.records.push(record);
        improves
    }

    /// Highest objective among completed trials; the earliest trial wins ties.
    pub fn best(&self) -> Option<&TrialRecord> {
        self.records
            .iter()
            .filter(|r| r.is_completed())
            .fold(None, |best: Option<&TrialRecord>, r| match best {
                Some(b) if b.objective >= r.objective => Some(b),
                _ => Some(r),
            })
    }

    /// Best objective seen after each trial, `None` until one completes.
    pub fn best_so_far(&self) -> Vec<Option<f64>> {
        let mut best: Option<f64> = None;
        self.records
            .iter()
            .map(|r| {
                if r.is_completed() && best.map(|b| r.objective > b).unwrap_or(true) {
                    best = Some(r.objective);
                }
                best
            })
            .collect()
    }

    /// Failed trials at the end of the history.
    pub fn consecutive_failures(&self) -> usize {
        self.records
            .iter()
            .rev()
            .take_while(|r| !r.is_completed())
            .count()
    }

    pub fn failed_count(&self) -> usize {
        self.records.iter().filter(|r| !r.is_completed()).count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rt_types::ParameterValue;

    fn params(levels: i64) -> ParameterVector {
        ParameterVector::from_pairs([("resolution_levels", ParameterValue::Int(levels))])
    }

    fn completed(i: usize, objective: f64) -> TrialRecord {
        let evaluation = Evaluation {
            objective,
            subject_scores: BTreeMap::new(),
            failed_subjects: BTreeMap::new(),
        };
        TrialRecord::completed(
            TrialId(i),
            params(i as i64),
            evaluation,
            PathBuf::from(TrialId(i).dir_name()),
            Utc::now(),
        )
    }

    fn failed(i: usize) -> TrialRecord {
        TrialRecord::failed(
            TrialId(i),
            params(i as i64),
            "all subjects failed".into(),
            PathBuf::from(TrialId(i).dir_name()),
            Utc::now(),
        )
    }

    #[test]
    fn best_tracking_maximizes() {
        let mut state = OptimizerState::new();
        assert!(state.push(completed(0, 0.5)));
        assert!(state.push(completed(1, 0.8)));
        assert!(!state.push(completed(2, 0.6)));
        assert_eq!(state.best().unwrap().trial, TrialId(1));
        assert_eq!(state.next_trial(), TrialId(3));
    }

    #[test]
    fn duration_spans_start_to_finish() {
        let mut record = completed(0, 0.5);
        record.finished_at = record.started_at + chrono::Duration::milliseconds(2500);
        assert_eq!(record.duration_seconds(), 2.5);
    }

    #[test]
    fn earliest_trial_wins_ties() {
        let mut state = OptimizerState::new();
        state.push(completed(0, 0.1));
        assert!(state.push(completed(1, 0.7)));
        assert!(!state.push(completed(2, 0.7)));
        assert_eq!(state.best().unwrap().trial, TrialId(1));
    }

    #[test]
    fn failed_trials_never_become_best() {
        let mut state = OptimizerState::new();
        assert!(!state.push(failed(0)));
        assert!(state.best().is_none());
        assert!(state.push(completed(1, -3.0)));
        assert!(!state.push(failed(2)));
        assert_eq!(state.best().unwrap().trial, TrialId(1));
        assert_eq!(state.records()[2].objective, PENALTY_OBJECTIVE);
    }

    #[test]
    fn best_so_far_is_monotone() {
        let mut state = OptimizerState::new();
        for (i, obj) in [0.3, 0.1, 0.6, 0.2].into_iter().enumerate() {
            state.push(completed(i, obj));
        }
        state.push(failed(4));
        let curve: Vec<f64> = state.best_so_far().into_iter().map(Option::unwrap).collect();
        assert_eq!(curve, vec![0.3, 0.3, 0.6, 0.6, 0.6]);
    }

    #[test]
    fn counts_trailing_failures() {
        let mut state = OptimizerState::new();
        state.push(failed(0));
        state.push(completed(1, 0.2));
        state.push(failed(2));
        state.push(failed(3));
        assert_eq!(state.consecutive_failures(), 2);
        assert_eq!(state.failed_count(), 3);
    }

    #[test]
    fn penalty_survives_json() {
        let record = failed(0);
        let json = serde_json::to_string(&record).unwrap();
        let back: TrialRecord = serde_json::from_str(&json).unwrap();
        assert_eq!(back, record);
    }
}

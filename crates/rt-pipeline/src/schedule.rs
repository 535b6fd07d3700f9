//! Multi-resolution schedule derived from a single "resolution levels" count.
//!
//! For `n` levels, coarsest first:
//!
//! * shrink factor at level `i` is `2^(n-1-i)`, i.e. `[2^(n-1), ..., 2, 1]`
//! * smoothing sigma (voxels) at level `i` is `n-1-i`, i.e. `[n-1, ..., 1, 0]`
//! * convergence iterations at level `i` are `CONVERGENCE_BASE + shrink[i]`

use rt_types::{ParameterValue, RtResult};
use serde::{Deserialize, Serialize};

use rt_types::validation_error;

/// Base iteration count offset by each level's shrink factor.
pub const CONVERGENCE_BASE: i64 = 100;

/// Upper bound on levels; `2^(n-1)` stays far below `i64::MAX`.
pub const MAX_RESOLUTION_LEVELS: i64 = 16;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MultiResolutionSchedule {
    pub shrink_factors: Vec<i64>,
    pub smoothing_sigmas: Vec<i64>,
    pub convergence: Vec<i64>,
}

impl MultiResolutionSchedule {
    pub fn from_levels(levels: i64) -> RtResult<Self> {
        if !(1..=MAX_RESOLUTION_LEVELS).contains(&levels) {
            return Err(validation_error!(
                "resolution levels must be in [1, {}], got {}",
                MAX_RESOLUTION_LEVELS,
                levels
            ));
        }

        let shrink_factors: Vec<i64> = (0..levels).rev().map(|i| 1i64 << i).collect();
        let smoothing_sigmas: Vec<i64> = (0..levels).rev().collect();
        let convergence = shrink_factors
            .iter()
            .map(|s| CONVERGENCE_BASE + s)
            .collect();

        Ok(Self {
            shrink_factors,
            smoothing_sigmas,
            convergence,
        })
    }

    pub fn levels(&self) -> usize {
        self.shrink_factors.len()
    }

    /// The three schedule vectors as parameter values, in
    /// (shrink, smoothing, convergence) order.
    pub fn to_values(&self) -> [ParameterValue; 3] {
        [
            ParameterValue::IntList(self.shrink_factors.clone()),
            ParameterValue::IntList(self.smoothing_sigmas.clone()),
            ParameterValue::IntList(self.convergence.clone()),
        ]
    }
}

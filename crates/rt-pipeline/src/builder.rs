//! Pipeline Graph Builder: binds a parameter vector and a cohort onto the
//! registration → resample → similarity stage chain.
//!
//! Pure construction. No files are touched and no processes are started.

use rt_types::{
    validation_error, ParameterValue, ParameterVector, RtResult, SearchSpace, SubjectPair,
};
use std::sync::Arc;

use crate::graph::{InputSource, StageNode, SubjectGraph};
use crate::schedule::MultiResolutionSchedule;
use crate::stage::{OutputKind, ParameterRecord, StageSpec};

/// Stage names.
pub mod stages {
    pub const REGISTRATION: &str = "registration";
    pub const RESAMPLE: &str = "resample";
    pub const SIMILARITY: &str = "similarity";
}

/// Output slot names.
pub mod outputs {
    pub const TRANSFORM: &str = "transform";
    pub const WARPED_IMAGE: &str = "warped_image";
    pub const SIMILARITY: &str = "similarity";
}

/// Parameter names, searched and derived.
pub mod params {
    // searchable
    pub const METRIC: &str = "metric";
    pub const RADIUS: &str = "radius";
    pub const RESOLUTION_LEVELS: &str = "resolution_levels";
    pub const MI_BINS: &str = "mi_bins";
    pub const HISTOGRAM_MATCHING: &str = "histogram_matching";

    // derived from the searchable ones
    pub const SHRINK_FACTORS: &str = "shrink_factors";
    pub const SMOOTHING_SIGMAS: &str = "smoothing_sigmas";
    pub const CONVERGENCE: &str = "convergence";
    pub const RADIUS_OR_BINS: &str = "radius_or_number_of_bins";

    // fixed registration settings
    pub const TRANSFORM: &str = "transform";
    pub const GRADIENT_STEP: &str = "gradient_step";
    pub const SAMPLING_STRATEGY: &str = "sampling_strategy";
    pub const SAMPLING_PERCENTAGE: &str = "sampling_percentage";
    pub const WINSORIZE_LOWER: &str = "winsorize_lower_quantile";
    pub const WINSORIZE_UPPER: &str = "winsorize_upper_quantile";
    pub const INTERPOLATION: &str = "interpolation";
    pub const DIMENSION: &str = "dimension";

    // fixed scoring settings
    pub const SIMILARITY_METRIC: &str = "similarity_metric";
    pub const SIMILARITY_BINS: &str = "similarity_bins";
    pub const SIMILARITY_SAMPLING: &str = "similarity_sampling_percentage";
}

/// The full registration search space.
pub fn registration_space() -> SearchSpace {
    SearchSpace::new()
        .add_categorical(params::METRIC, ["CC", "MI"])
        .add_int(params::RADIUS, 2, 8)
        .add_int(params::RESOLUTION_LEVELS, 2, 8)
        .add_int(params::MI_BINS, 16, 64)
        .add_bool(params::HISTOGRAM_MATCHING)
}

/// Known-good first trial for [`registration_space`].
pub fn registration_seed() -> ParameterVector {
    ParameterVector::from_pairs([
        (params::METRIC, ParameterValue::Text("MI".into())),
        (params::RADIUS, ParameterValue::Int(2)),
        (params::RESOLUTION_LEVELS, ParameterValue::Int(2)),
        (params::MI_BINS, ParameterValue::Int(16)),
        (params::HISTOGRAM_MATCHING, ParameterValue::Bool(false)),
    ])
}

/// Values used for any parameter the search space does not declare.
pub fn default_parameters() -> ParameterRecord {
    let mut record: ParameterRecord = registration_seed()
        .iter()
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect();
    let fixed = [
        (params::TRANSFORM, ParameterValue::Text("Rigid".into())),
        (params::GRADIENT_STEP, ParameterValue::Float(0.1)),
        (params::SAMPLING_STRATEGY, ParameterValue::Text("Random".into())),
        (params::SAMPLING_PERCENTAGE, ParameterValue::Float(0.05)),
        (params::WINSORIZE_LOWER, ParameterValue::Float(0.05)),
        (params::WINSORIZE_UPPER, ParameterValue::Float(0.95)),
        (params::INTERPOLATION, ParameterValue::Text("BSpline".into())),
        (params::DIMENSION, ParameterValue::Int(3)),
        (params::SIMILARITY_METRIC, ParameterValue::Text("MI".into())),
        (params::SIMILARITY_BINS, ParameterValue::Int(32)),
        (params::SIMILARITY_SAMPLING, ParameterValue::Float(1.0)),
    ];
    for (name, value) in fixed {
        record.insert(name.to_string(), value);
    }
    record
}

/// Builds one [`SubjectGraph`] per subject pair, all sharing the same
/// stage descriptors.
#[derive(Debug, Clone)]
pub struct PipelineBuilder {
    registration: Arc<StageSpec>,
    resample: Arc<StageSpec>,
    similarity: Arc<StageSpec>,
    defaults: ParameterRecord,
}

impl PipelineBuilder {
    pub fn new() -> Self {
        let registration = StageSpec::new(stages::REGISTRATION)
            .with_inputs(["fixed_image", "moving_image"])
            .with_parameters([
                params::DIMENSION,
                params::METRIC,
                params::RADIUS_OR_BINS,
                params::SHRINK_FACTORS,
                params::SMOOTHING_SIGMAS,
                params::CONVERGENCE,
                params::HISTOGRAM_MATCHING,
                params::TRANSFORM,
                params::GRADIENT_STEP,
                params::SAMPLING_STRATEGY,
                params::SAMPLING_PERCENTAGE,
                params::WINSORIZE_LOWER,
                params::WINSORIZE_UPPER,
                params::INTERPOLATION,
            ])
            .with_output(outputs::TRANSFORM, OutputKind::File);

        let resample = StageSpec::new(stages::RESAMPLE)
            .with_inputs(["reference_image", "input_image", "transform"])
            .with_parameters([params::DIMENSION, params::INTERPOLATION])
            .with_output(outputs::WARPED_IMAGE, OutputKind::File);

        let similarity = StageSpec::new(stages::SIMILARITY)
            .with_inputs(["fixed_image", "moving_image"])
            .with_parameters([
                params::DIMENSION,
                params::SIMILARITY_METRIC,
                params::SIMILARITY_BINS,
                params::SIMILARITY_SAMPLING,
            ])
            .with_output(outputs::SIMILARITY, OutputKind::Scalar);

        Self {
            registration: Arc::new(registration),
            resample: Arc::new(resample),
            similarity: Arc::new(similarity),
            defaults: default_parameters(),
        }
    }

    /// Override or add a default parameter value.
    pub fn with_default(mut self, name: impl Into<String>, value: ParameterValue) -> Self {
        self.defaults.insert(name.into(), value);
        self
    }

    pub fn stage_specs(&self) -> [&Arc<StageSpec>; 3] {
        [&self.registration, &self.resample, &self.similarity]
    }

    /// Build the graphs for every subject.
    pub fn build(
        &self,
        vector: &ParameterVector,
        subjects: &[SubjectPair],
    ) -> RtResult<Vec<SubjectGraph>> {
        let resolved = self.resolve(vector)?;
        subjects
            .iter()
            .map(|subject| self.build_one(&resolved, subject))
            .collect()
    }

    /// Searched values over defaults, plus the derived schedule and
    /// metric-dependent radius/bins.
    pub fn resolve(&self, vector: &ParameterVector) -> RtResult<ParameterRecord> {
        let mut record = self.defaults.clone();
        for (name, value) in vector.iter() {
            record.insert(name.clone(), value.clone());
        }

        let levels = record
            .get(params::RESOLUTION_LEVELS)
            .and_then(ParameterValue::as_int)
            .ok_or_else(|| validation_error!("'{}' must be an integer", params::RESOLUTION_LEVELS))?;
        let [shrink, smoothing, convergence] =
            MultiResolutionSchedule::from_levels(levels)?.to_values();
        record.insert(params::SHRINK_FACTORS.to_string(), shrink);
        record.insert(params::SMOOTHING_SIGMAS.to_string(), smoothing);
        record.insert(params::CONVERGENCE.to_string(), convergence);

        let metric = record
            .get(params::METRIC)
            .and_then(ParameterValue::as_str)
            .ok_or_else(|| validation_error!("'{}' must be a string", params::METRIC))?;
        let source = if metric == "MI" {
            params::MI_BINS
        } else {
            params::RADIUS
        };
        let radius_or_bins = record
            .get(source)
            .and_then(ParameterValue::as_int)
            .ok_or_else(|| validation_error!("'{}' must be an integer", source))?;
        record.insert(
            params::RADIUS_OR_BINS.to_string(),
            ParameterValue::Int(radius_or_bins),
        );

        Ok(record)
    }

    fn bind(&self, spec: &StageSpec, resolved: &ParameterRecord) -> RtResult<ParameterRecord> {
        spec.parameters
            .iter()
            .map(|name| {
                resolved
                    .get(name)
                    .map(|v| (name.clone(), v.clone()))
                    .ok_or_else(|| {
                        validation_error!("stage '{}' parameter '{}' has no value", spec.name, name)
                    })
            })
            .collect()
    }

    fn build_one(&self, resolved: &ParameterRecord, subject: &SubjectPair) -> RtResult<SubjectGraph> {
        let fixed = || InputSource::External(subject.fixed_image.clone());
        let moving = || InputSource::External(subject.moving_image.clone());

        let registration = StageNode {
            spec: Arc::clone(&self.registration),
            parameters: self.bind(&self.registration, resolved)?,
            bindings: [
                ("fixed_image".to_string(), fixed()),
                ("moving_image".to_string(), moving()),
            ]
            .into_iter()
            .collect(),
        };

        let resample = StageNode {
            spec: Arc::clone(&self.resample),
            parameters: self.bind(&self.resample, resolved)?,
            bindings: [
                ("reference_image".to_string(), fixed()),
                ("input_image".to_string(), moving()),
                (
                    "transform".to_string(),
                    InputSource::upstream(stages::REGISTRATION, outputs::TRANSFORM),
                ),
            ]
            .into_iter()
            .collect(),
        };

        let similarity = StageNode {
            spec: Arc::clone(&self.similarity),
            parameters: self.bind(&self.similarity, resolved)?,
            bindings: [
                ("fixed_image".to_string(), fixed()),
                (
                    "moving_image".to_string(),
                    InputSource::upstream(stages::RESAMPLE, outputs::WARPED_IMAGE),
                ),
            ]
            .into_iter()
            .collect(),
        };

        SubjectGraph::new(
            subject.clone(),
            vec![registration, resample, similarity],
            stages::SIMILARITY,
            outputs::SIMILARITY,
        )
    }
}

impl Default for PipelineBuilder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rt_types::ParameterKind;

    fn cohort() -> Vec<SubjectPair> {
        vec![
            SubjectPair::new("sub-01", "/d/01/T1w.nii.gz", "/d/01/T2w.nii.gz"),
            SubjectPair::new("sub-02", "/d/02/T1w.nii.gz", "/d/02/T2w.nii.gz"),
        ]
    }

    fn vector(metric: &str, levels: i64) -> ParameterVector {
        ParameterVector::from_pairs([
            (params::METRIC, ParameterValue::Text(metric.into())),
            (params::RESOLUTION_LEVELS, ParameterValue::Int(levels)),
        ])
    }

    #[test]
    fn builds_one_graph_per_subject_with_shared_specs() {
        let builder = PipelineBuilder::new();
        let graphs = builder.build(&vector("CC", 3), &cohort()).unwrap();
        assert_eq!(graphs.len(), 2);

        for g in &graphs {
            assert_eq!(g.stage_count(), 3);
            assert_eq!(g.node(g.objective_stage()).name(), stages::SIMILARITY);
            assert_eq!(g.objective_output(), outputs::SIMILARITY);
        }
        let a = graphs[0].stage(stages::REGISTRATION).unwrap();
        let b = graphs[1].stage(stages::REGISTRATION).unwrap();
        assert!(Arc::ptr_eq(&a.spec, &b.spec));
        assert_ne!(a.bindings, b.bindings);
    }

    #[test]
    fn derives_schedule_from_levels() {
        let builder = PipelineBuilder::new();
        let graphs = builder.build(&vector("CC", 3), &cohort()[..1]).unwrap();
        let reg = graphs[0].stage(stages::REGISTRATION).unwrap();

        assert_eq!(
            reg.parameters[params::SHRINK_FACTORS],
            ParameterValue::IntList(vec![4, 2, 1])
        );
        assert_eq!(
            reg.parameters[params::SMOOTHING_SIGMAS],
            ParameterValue::IntList(vec![2, 1, 0])
        );
        assert_eq!(
            reg.parameters[params::CONVERGENCE],
            ParameterValue::IntList(vec![104, 102, 101])
        );
    }

    #[test]
    fn radius_or_bins_follows_metric() {
        let builder = PipelineBuilder::new()
            .with_default(params::RADIUS, ParameterValue::Int(5))
            .with_default(params::MI_BINS, ParameterValue::Int(48));

        let cc = builder.resolve(&vector("CC", 2)).unwrap();
        assert_eq!(cc[params::RADIUS_OR_BINS], ParameterValue::Int(5));

        let mi = builder.resolve(&vector("MI", 2)).unwrap();
        assert_eq!(mi[params::RADIUS_OR_BINS], ParameterValue::Int(48));
    }

    #[test]
    fn resolution_is_pure() {
        let builder = PipelineBuilder::new();
        let v = registration_seed();
        assert_eq!(builder.resolve(&v).unwrap(), builder.resolve(&v).unwrap());
    }

    #[test]
    fn every_vector_in_the_space_builds_acyclic_graphs() {
        let builder = PipelineBuilder::new();
        let space = registration_space();
        let levels = match space.get(params::RESOLUTION_LEVELS).unwrap().kind {
            ParameterKind::IntRange { low, high } => low..=high,
            _ => unreachable!(),
        };
        for metric in ["CC", "MI"] {
            for n in levels.clone() {
                for hist in [true, false] {
                    let v = ParameterVector::from_pairs([
                        (params::METRIC, ParameterValue::Text(metric.into())),
                        (params::RADIUS, ParameterValue::Int(4)),
                        (params::RESOLUTION_LEVELS, ParameterValue::Int(n)),
                        (params::MI_BINS, ParameterValue::Int(32)),
                        (params::HISTOGRAM_MATCHING, ParameterValue::Bool(hist)),
                    ]);
                    space.validate(&v).unwrap();
                    let graphs = builder.build(&v, &cohort()).unwrap();
                    assert!(graphs.iter().all(|g| g.topological_order().len() == 3));
                }
            }
        }
    }

    #[test]
    fn seed_is_inside_the_space() {
        registration_space().validate(&registration_seed()).unwrap();
    }

    #[test]
    fn invalid_levels_fail_construction() {
        let builder = PipelineBuilder::new();
        assert!(builder.build(&vector("CC", 0), &cohort()).is_err());
    }
}

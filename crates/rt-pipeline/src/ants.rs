//! ANTs command-line tools as pipeline stages.
//!
//! Each stage turns its parameter record into an argument list, runs the
//! tool as a child process and checks that the declared output exists.

use async_trait::async_trait;
use rt_types::{ParameterValue, StageError};
use std::path::{Path, PathBuf};
use std::process::Output;
use std::sync::Arc;
use tokio::process::Command;
use tracing::debug;

use crate::builder::{outputs, params, stages};
use crate::stage::{Stage, StageInvocation, StageOutputs, StageRegistry};

/// Prefix passed to `antsRegistration --output`.
const TRANSFORM_PREFIX: &str = "output_";
/// Affine-family transforms are written as `<prefix>0GenericAffine.mat`.
const AFFINE_SUFFIX: &str = "0GenericAffine.mat";
const WARPED_FILE: &str = "warped.nii.gz";
/// Stderr kept in failure diagnostics.
const STDERR_TAIL: usize = 2000;

/// Locates the ANTs binaries.
#[derive(Debug, Clone, Default)]
pub struct AntsToolkit {
    /// Directory holding the binaries; `None` resolves through `PATH`.
    pub bin_dir: Option<PathBuf>,
}

impl AntsToolkit {
    pub fn new(bin_dir: Option<PathBuf>) -> Self {
        Self { bin_dir }
    }

    fn program(&self, name: &str) -> PathBuf {
        match &self.bin_dir {
            Some(dir) => dir.join(name),
            None => PathBuf::from(name),
        }
    }

    /// Registry with registration, resample and similarity stages.
    pub fn registry(&self) -> StageRegistry {
        StageRegistry::new()
            .register(
                stages::REGISTRATION,
                Arc::new(AntsRegistration {
                    program: self.program("antsRegistration"),
                }),
            )
            .register(
                stages::RESAMPLE,
                Arc::new(AntsApplyTransforms {
                    program: self.program("antsApplyTransforms"),
                }),
            )
            .register(
                stages::SIMILARITY,
                Arc::new(AntsMeasureSimilarity {
                    program: self.program("MeasureImageSimilarity"),
                }),
            )
    }
}

fn text<'a>(inv: &'a StageInvocation, name: &str) -> Result<&'a str, StageError> {
    inv.parameter(name)?.as_str().ok_or_else(|| type_error(inv, name, "a string"))
}

fn int(inv: &StageInvocation, name: &str) -> Result<i64, StageError> {
    inv.parameter(name)?.as_int().ok_or_else(|| type_error(inv, name, "an integer"))
}

fn float(inv: &StageInvocation, name: &str) -> Result<f64, StageError> {
    inv.parameter(name)?.as_float().ok_or_else(|| type_error(inv, name, "a number"))
}

fn flag(inv: &StageInvocation, name: &str) -> Result<bool, StageError> {
    inv.parameter(name)?.as_bool().ok_or_else(|| type_error(inv, name, "a boolean"))
}

fn levels(inv: &StageInvocation, name: &str) -> Result<String, StageError> {
    match inv.parameter(name)? {
        v @ ParameterValue::IntList(_) => Ok(v.to_string()),
        _ => Err(type_error(inv, name, "an integer list")),
    }
}

fn type_error(inv: &StageInvocation, name: &str, expected: &str) -> StageError {
    StageError::Parameter {
        stage: inv.stage.clone(),
        message: format!("'{name}' must be {expected}"),
    }
}

fn display(path: &Path) -> String {
    path.display().to_string()
}

async fn run_tool(stage: &str, program: &Path, args: &[String]) -> Result<Output, StageError> {
    debug!(stage, program = %program.display(), ?args, "Launching external tool");
    let output = Command::new(program)
        .args(args)
        .kill_on_drop(true)
        .output()
        .await
        .map_err(|e| StageError::LaunchFailed {
            stage: stage.to_string(),
            message: format!("{}: {}", program.display(), e),
        })?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        let start = stderr.len().saturating_sub(STDERR_TAIL);
        let tail = stderr
            .get(start..)
            .unwrap_or(&stderr[..])
            .trim()
            .to_string();
        return Err(StageError::NonZeroExit {
            stage: stage.to_string(),
            code: output.status.code(),
            stderr: tail,
        });
    }
    Ok(output)
}

fn require_file(stage: &str, output: &str, path: PathBuf) -> Result<PathBuf, StageError> {
    if path.exists() {
        Ok(path)
    } else {
        Err(StageError::MissingOutput {
            stage: stage.to_string(),
            output: output.to_string(),
        })
    }
}

/// Single-stage linear registration via `antsRegistration`.
#[derive(Debug, Clone)]
pub struct AntsRegistration {
    pub program: PathBuf,
}

impl AntsRegistration {
    pub fn arguments(inv: &StageInvocation) -> Result<Vec<String>, StageError> {
        let fixed = display(inv.input("fixed_image")?);
        let moving = display(inv.input("moving_image")?);
        let prefix = display(&inv.output_dir.join(TRANSFORM_PREFIX));

        Ok(vec![
            "--dimensionality".into(),
            int(inv, params::DIMENSION)?.to_string(),
            "--output".into(),
            format!("[{prefix}]"),
            "--interpolation".into(),
            text(inv, params::INTERPOLATION)?.to_string(),
            "--winsorize-image-intensities".into(),
            format!(
                "[{},{}]",
                float(inv, params::WINSORIZE_LOWER)?,
                float(inv, params::WINSORIZE_UPPER)?
            ),
            "--use-histogram-matching".into(),
            (if flag(inv, params::HISTOGRAM_MATCHING)? { "1" } else { "0" }).to_string(),
            "--transform".into(),
            format!(
                "{}[{}]",
                text(inv, params::TRANSFORM)?,
                float(inv, params::GRADIENT_STEP)?
            ),
            "--metric".into(),
            format!(
                "{}[{},{},1,{},{},{}]",
                text(inv, params::METRIC)?,
                fixed,
                moving,
                int(inv, params::RADIUS_OR_BINS)?,
                text(inv, params::SAMPLING_STRATEGY)?,
                float(inv, params::SAMPLING_PERCENTAGE)?
            ),
            "--convergence".into(),
            format!("[{},1e-6,10]", levels(inv, params::CONVERGENCE)?),
            "--shrink-factors".into(),
            levels(inv, params::SHRINK_FACTORS)?,
            "--smoothing-sigmas".into(),
            format!("{}vox", levels(inv, params::SMOOTHING_SIGMAS)?),
        ])
    }
}

#[async_trait]
impl Stage for AntsRegistration {
    async fn run(&self, inv: &StageInvocation) -> Result<StageOutputs, StageError> {
        let args = Self::arguments(inv)?;
        run_tool(&inv.stage, &self.program, &args).await?;
        let transform = inv
            .output_dir
            .join(format!("{TRANSFORM_PREFIX}{AFFINE_SUFFIX}"));
        let transform = require_file(&inv.stage, outputs::TRANSFORM, transform)?;
        Ok(StageOutputs::new().with_file(outputs::TRANSFORM, transform))
    }
}

/// Resamples the moving image into fixed space via `antsApplyTransforms`.
#[derive(Debug, Clone)]
pub struct AntsApplyTransforms {
    pub program: PathBuf,
}

impl AntsApplyTransforms {
    pub fn arguments(inv: &StageInvocation) -> Result<Vec<String>, StageError> {
        Ok(vec![
            "--dimensionality".into(),
            int(inv, params::DIMENSION)?.to_string(),
            "--input".into(),
            display(inv.input("input_image")?),
            "--reference-image".into(),
            display(inv.input("reference_image")?),
            "--output".into(),
            display(&inv.output_dir.join(WARPED_FILE)),
            "--interpolation".into(),
            text(inv, params::INTERPOLATION)?.to_string(),
            "--transform".into(),
            display(inv.input("transform")?),
        ])
    }
}

#[async_trait]
impl Stage for AntsApplyTransforms {
    async fn run(&self, inv: &StageInvocation) -> Result<StageOutputs, StageError> {
        let args = Self::arguments(inv)?;
        run_tool(&inv.stage, &self.program, &args).await?;
        let warped = require_file(&inv.stage, outputs::WARPED_IMAGE, inv.output_dir.join(WARPED_FILE))?;
        Ok(StageOutputs::new().with_file(outputs::WARPED_IMAGE, warped))
    }
}

/// Scores fixed vs. warped image via `MeasureImageSimilarity`.
#[derive(Debug, Clone)]
pub struct AntsMeasureSimilarity {
    pub program: PathBuf,
}

impl AntsMeasureSimilarity {
    pub fn arguments(inv: &StageInvocation) -> Result<Vec<String>, StageError> {
        Ok(vec![
            "--dimensionality".into(),
            int(inv, params::DIMENSION)?.to_string(),
            "--metric".into(),
            format!(
                "{}[{},{},1,{},Regular,{}]",
                text(inv, params::SIMILARITY_METRIC)?,
                display(inv.input("fixed_image")?),
                display(inv.input("moving_image")?),
                int(inv, params::SIMILARITY_BINS)?,
                float(inv, params::SIMILARITY_SAMPLING)?
            ),
        ])
    }

    /// The tool prints the metric value as the last number on stdout.
    pub fn parse_metric(stdout: &str) -> Option<f64> {
        stdout
            .split(|c: char| c.is_whitespace() || c == '>' || c == '=' || c == ':')
            .rev()
            .filter(|token| !token.is_empty())
            .find_map(|token| token.parse::<f64>().ok())
            .filter(|v| v.is_finite())
    }

    /// Similarity score, higher is better.
    ///
    /// ANTs reports MI and CC as costs to minimise (better alignment prints a
    /// more negative value), so the score emitted by this stage is the
    /// negated metric.
    pub fn parse_similarity(stdout: &str) -> Option<f64> {
        Self::parse_metric(stdout).map(|metric| -metric)
    }
}

#[async_trait]
impl Stage for AntsMeasureSimilarity {
    async fn run(&self, inv: &StageInvocation) -> Result<StageOutputs, StageError> {
        let args = Self::arguments(inv)?;
        let output = run_tool(&inv.stage, &self.program, &args).await?;
        let stdout = String::from_utf8_lossy(&output.stdout);
        let score = Self::parse_similarity(&stdout).ok_or_else(|| StageError::InvalidOutput {
            stage: inv.stage.clone(),
            message: format!("no similarity value in output: {}", stdout.trim()),
        })?;
        tokio::fs::write(inv.output_dir.join("similarity.txt"), score.to_string())
            .await
            .map_err(|e| StageError::Failed {
                stage: inv.stage.clone(),
                message: e.to_string(),
            })?;
        Ok(StageOutputs::new().with_scalar(outputs::SIMILARITY, score))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builder::{registration_seed, PipelineBuilder};
    use rt_types::{SubjectId, SubjectPair};
    use std::collections::BTreeMap;

    fn invocation(stage: &str, inputs: &[(&str, &str)]) -> StageInvocation {
        let builder = PipelineBuilder::new();
        let graphs = builder
            .build(
                &registration_seed(),
                &[SubjectPair::new("sub-01", "/d/T1w.nii.gz", "/d/T2w.nii.gz")],
            )
            .unwrap();
        StageInvocation {
            stage: stage.to_string(),
            subject: SubjectId::new("sub-01"),
            inputs: inputs
                .iter()
                .map(|(k, v)| (k.to_string(), PathBuf::from(v)))
                .collect::<BTreeMap<_, _>>(),
            parameters: graphs[0].stage(stage).unwrap().parameters.clone(),
            output_dir: PathBuf::from("/work/trial-0000/sub-01").join(stage),
        }
    }

    #[test]
    fn registration_arguments_follow_schedule() {
        let inv = invocation(
            stages::REGISTRATION,
            &[("fixed_image", "/d/T1w.nii.gz"), ("moving_image", "/d/T2w.nii.gz")],
        );
        let args = AntsRegistration::arguments(&inv).unwrap().join(" ");

        assert!(args.contains("--metric MI[/d/T1w.nii.gz,/d/T2w.nii.gz,1,16,Random,0.05]"));
        assert!(args.contains("--convergence [102x101,1e-6,10]"));
        assert!(args.contains("--shrink-factors 2x1"));
        assert!(args.contains("--smoothing-sigmas 1x0vox"));
        assert!(args.contains("--transform Rigid[0.1]"));
        assert!(args.contains("--use-histogram-matching 0"));
        assert!(args.contains("--output [/work/trial-0000/sub-01/registration/output_]"));
    }

    #[test]
    fn resample_arguments_reference_transform() {
        let inv = invocation(
            stages::RESAMPLE,
            &[
                ("reference_image", "/d/T1w.nii.gz"),
                ("input_image", "/d/T2w.nii.gz"),
                ("transform", "/w/output_0GenericAffine.mat"),
            ],
        );
        let args = AntsApplyTransforms::arguments(&inv).unwrap();
        let pos = args.iter().position(|a| a == "--transform").unwrap();
        assert_eq!(args[pos + 1], "/w/output_0GenericAffine.mat");
        assert!(args.contains(&"BSpline".to_string()));
    }

    #[test]
    fn similarity_arguments_use_fixed_scoring_settings() {
        let inv = invocation(
            stages::SIMILARITY,
            &[("fixed_image", "/d/T1w.nii.gz"), ("moving_image", "/w/warped.nii.gz")],
        );
        let args = AntsMeasureSimilarity::arguments(&inv).unwrap();
        assert_eq!(args[3], "MI[/d/T1w.nii.gz,/w/warped.nii.gz,1,32,Regular,1]");
    }

    #[test]
    fn missing_input_is_reported() {
        let inv = invocation(stages::REGISTRATION, &[("fixed_image", "/d/T1w.nii.gz")]);
        assert!(matches!(
            AntsRegistration::arguments(&inv),
            Err(StageError::UnboundInput { .. })
        ));
    }

    #[test]
    fn parses_metric_from_tool_output() {
        assert_eq!(AntsMeasureSimilarity::parse_metric("-0.4215\n"), Some(-0.4215));
        assert_eq!(
            AntsMeasureSimilarity::parse_metric("metric value => 0.75 \n"),
            Some(0.75)
        );
        assert_eq!(AntsMeasureSimilarity::parse_metric("nothing here"), None);
        assert_eq!(AntsMeasureSimilarity::parse_metric("nan"), None);
        assert_eq!(AntsMeasureSimilarity::parse_similarity("nan"), None);
    }

    #[test]
    fn better_alignment_scores_higher() {
        let good = AntsMeasureSimilarity::parse_similarity("-0.92\n").unwrap();
        let poor = AntsMeasureSimilarity::parse_similarity("-0.10\n").unwrap();
        assert_eq!(good, 0.92);
        assert!(good > poor);
    }

    #[tokio::test]
    async fn missing_program_is_a_launch_failure() {
        let err = run_tool("registration", Path::new("/nonexistent/antsRegistration"), &[])
            .await
            .unwrap_err();
        assert!(matches!(err, StageError::LaunchFailed { .. }));
    }
}

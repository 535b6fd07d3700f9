//! Parameter domains and the concrete vectors proposed for each trial.

use rand::Rng;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};

use crate::errors::{RtError, RtResult};
use crate::validation_error;

/// A single parameter dimension in the search space.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParameterDef {
    /// Parameter name (e.g. "resolution_levels").
    pub name: String,
    /// The declared domain.
    pub kind: ParameterKind,
}

/// Describes the domain a parameter is drawn from.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ParameterKind {
    /// Unordered named choices.
    Categorical { choices: Vec<String> },
    /// Integer range [low, high] inclusive.
    IntRange { low: i64, high: i64 },
    /// Continuous uniform range [low, high].
    RealRange { low: f64, high: f64 },
    /// Log-uniform range (sampled in log-space then exponentiated).
    LogUniform { low: f64, high: f64 },
    /// true / false.
    Boolean,
}

impl ParameterKind {
    /// Whether `value` lies inside this domain.
    pub fn contains(&self, value: &ParameterValue) -> bool {
        match (self, value) {
            (ParameterKind::Categorical { choices }, ParameterValue::Text(v)) => {
                choices.iter().any(|c| c == v)
            }
            (ParameterKind::IntRange { low, high }, ParameterValue::Int(v)) => {
                v >= low && v <= high
            }
            (ParameterKind::RealRange { low, high }, ParameterValue::Float(v))
            | (ParameterKind::LogUniform { low, high }, ParameterValue::Float(v)) => {
                v.is_finite() && v >= low && v <= high
            }
            (ParameterKind::Boolean, ParameterValue::Bool(_)) => true,
            _ => false,
        }
    }

    /// Number of distinct values, `None` for continuous domains.
    pub fn cardinality(&self) -> Option<usize> {
        match self {
            ParameterKind::Categorical { choices } => Some(choices.len()),
            ParameterKind::IntRange { low, high } => {
                let span = high.checked_sub(*low)?.checked_add(1)?;
                usize::try_from(span).ok()
            }
            ParameterKind::Boolean => Some(2),
            ParameterKind::RealRange { .. } | ParameterKind::LogUniform { .. } => None,
        }
    }

    fn sample<R: Rng + ?Sized>(&self, rng: &mut R) -> ParameterValue {
        match self {
            ParameterKind::Categorical { choices } => {
                let idx = rng.gen_range(0..choices.len());
                ParameterValue::Text(choices[idx].clone())
            }
            ParameterKind::IntRange { low, high } => ParameterValue::Int(rng.gen_range(*low..=*high)),
            ParameterKind::RealRange { low, high } => {
                ParameterValue::Float(rng.gen_range(*low..=*high))
            }
            ParameterKind::LogUniform { low, high } => {
                let log_val: f64 = rng.gen_range(low.ln()..=high.ln());
                ParameterValue::Float(log_val.exp().clamp(*low, *high))
            }
            ParameterKind::Boolean => ParameterValue::Bool(rng.gen_bool(0.5)),
        }
    }
}

/// A concrete parameter value, either proposed by the optimizer or derived
/// by the pipeline builder.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ParameterValue {
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
    IntList(Vec<i64>),
}

impl ParameterValue {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::Text(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            Self::Int(v) => Some(*v),
            _ => None,
        }
    }

    /// Numeric view; integers widen to `f64`.
    pub fn as_float(&self) -> Option<f64> {
        match self {
            Self::Float(v) => Some(*v),
            Self::Int(v) => Some(*v as f64),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Self::Bool(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_int_list(&self) -> Option<&[i64]> {
        match self {
            Self::IntList(v) => Some(v),
            _ => None,
        }
    }
}

impl std::fmt::Display for ParameterValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Bool(v) => write!(f, "{v}"),
            Self::Int(v) => write!(f, "{v}"),
            Self::Float(v) => write!(f, "{v}"),
            Self::Text(v) => write!(f, "{v}"),
            Self::IntList(v) => {
                let joined: Vec<String> = v.iter().map(|x| x.to_string()).collect();
                write!(f, "{}", joined.join("x"))
            }
        }
    }
}

/// One value per declared dimension.
///
/// Immutable once built; the only constructors are [`ParameterVector::from_pairs`]
/// (unchecked, validate with [`SearchSpace::validate`]) and
/// [`SearchSpace::sample`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ParameterVector {
    values: BTreeMap<String, ParameterValue>,
}

impl ParameterVector {
    pub fn from_pairs<I, K>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (K, ParameterValue)>,
        K: Into<String>,
    {
        Self {
            values: pairs.into_iter().map(|(k, v)| (k.into(), v)).collect(),
        }
    }

    pub fn get(&self, name: &str) -> Option<&ParameterValue> {
        self.values.get(name)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &ParameterValue)> {
        self.values.iter()
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

impl std::fmt::Display for ParameterVector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let parts: Vec<String> = self
            .values
            .iter()
            .map(|(k, v)| format!("{k}={v}"))
            .collect();
        write!(f, "{{{}}}", parts.join(", "))
    }
}

/// The full search space: an ordered list of parameter definitions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchSpace {
    pub parameters: Vec<ParameterDef>,
}

impl SearchSpace {
    pub fn new() -> Self {
        Self {
            parameters: Vec::new(),
        }
    }

    pub fn add_categorical<S: Into<String>>(
        mut self,
        name: impl Into<String>,
        choices: impl IntoIterator<Item = S>,
    ) -> Self {
        self.parameters.push(ParameterDef {
            name: name.into(),
            kind: ParameterKind::Categorical {
                choices: choices.into_iter().map(Into::into).collect(),
            },
        });
        self
    }

    pub fn add_int(mut self, name: impl Into<String>, low: i64, high: i64) -> Self {
        self.parameters.push(ParameterDef {
            name: name.into(),
            kind: ParameterKind::IntRange { low, high },
        });
        self
    }

    pub fn add_real(mut self, name: impl Into<String>, low: f64, high: f64) -> Self {
        self.parameters.push(ParameterDef {
            name: name.into(),
            kind: ParameterKind::RealRange { low, high },
        });
        self
    }

    pub fn add_log_uniform(mut self, name: impl Into<String>, low: f64, high: f64) -> Self {
        self.parameters.push(ParameterDef {
            name: name.into(),
            kind: ParameterKind::LogUniform { low, high },
        });
        self
    }

    pub fn add_bool(mut self, name: impl Into<String>) -> Self {
        self.parameters.push(ParameterDef {
            name: name.into(),
            kind: ParameterKind::Boolean,
        });
        self
    }

    pub fn get(&self, name: &str) -> Option<&ParameterDef> {
        self.parameters.iter().find(|p| p.name == name)
    }

    /// Check that every declared domain is well formed.
    pub fn check(&self) -> RtResult<()> {
        if self.parameters.is_empty() {
            return Err(validation_error!("search space declares no parameters"));
        }
        let mut seen = HashSet::new();
        for param in &self.parameters {
            if !seen.insert(param.name.as_str()) {
                return Err(validation_error!("duplicate parameter '{}'", param.name));
            }
            let ok = match &param.kind {
                ParameterKind::Categorical { choices } => !choices.is_empty(),
                ParameterKind::IntRange { low, high } => low <= high,
                ParameterKind::RealRange { low, high } => {
                    low.is_finite() && high.is_finite() && low <= high
                }
                ParameterKind::LogUniform { low, high } => {
                    *low > 0.0 && high.is_finite() && low <= high
                }
                ParameterKind::Boolean => true,
            };
            if !ok {
                return Err(validation_error!(
                    "parameter '{}' has an empty or malformed domain",
                    param.name
                ));
            }
        }
        Ok(())
    }

    /// Every declared dimension has a value inside its domain, and nothing
    /// undeclared is present.
    pub fn validate(&self, vector: &ParameterVector) -> RtResult<()> {
        for param in &self.parameters {
            match vector.get(&param.name) {
                None => {
                    return Err(validation_error!("parameter '{}' has no value", param.name));
                }
                Some(value) if !param.kind.contains(value) => {
                    return Err(validation_error!(
                        "parameter '{}' value {} lies outside its domain",
                        param.name,
                        value
                    ));
                }
                Some(_) => {}
            }
        }
        if let Some((name, _)) = vector.iter().find(|(name, _)| self.get(name).is_none()) {
            return Err(RtError::Validation(format!(
                "parameter '{name}' is not declared in the search space"
            )));
        }
        Ok(())
    }

    /// Draw one vector uniformly from the space.
    pub fn sample<R: Rng + ?Sized>(&self, rng: &mut R) -> ParameterVector {
        ParameterVector {
            values: self
                .parameters
                .iter()
                .map(|p| (p.name.clone(), p.kind.sample(rng)))
                .collect(),
        }
    }

    /// Total number of grid points (returns `None` if any parameter is
    /// continuous).
    pub fn grid_size(&self) -> Option<usize> {
        let mut total: usize = 1;
        for param in &self.parameters {
            total = total.checked_mul(param.kind.cardinality()?)?;
        }
        Some(total)
    }
}

impl Default for SearchSpace {
    fn default() -> Self {
        Self::new()
    }
}

//! Gaussian-process surrogate and the Expected Improvement acquisition.
//!
//! Parameter vectors are encoded onto the unit hypercube (categoricals
//! one-hot, log-uniform dimensions in log space) and modelled with a
//! zero-mean GP under an RBF kernel. Targets are costs, so lower is better.

use ndarray::{s, Array1, Array2, ArrayView1};
use rt_types::{ParameterKind, ParameterValue, ParameterVector, SearchSpace};

/// Map a vector onto the unit hypercube. Missing or mistyped values encode
/// as zero.
pub fn encode(space: &SearchSpace, vector: &ParameterVector) -> Array1<f64> {
    let mut out = Vec::new();
    for param in &space.parameters {
        let value = vector.get(&param.name);
        match &param.kind {
            ParameterKind::Categorical { choices } => {
                let chosen = value.and_then(ParameterValue::as_str);
                out.extend(
                    choices
                        .iter()
                        .map(|c| if Some(c.as_str()) == chosen { 1.0 } else { 0.0 }),
                );
            }
            ParameterKind::IntRange { low, high } => {
                let v = value.and_then(ParameterValue::as_int).unwrap_or(*low);
                out.push(unit(v as f64, *low as f64, *high as f64));
            }
            ParameterKind::RealRange { low, high } => {
                let v = value.and_then(ParameterValue::as_float).unwrap_or(*low);
                out.push(unit(v, *low, *high));
            }
            ParameterKind::LogUniform { low, high } => {
                let v = value.and_then(ParameterValue::as_float).unwrap_or(*low);
                out.push(unit(v.ln(), low.ln(), high.ln()));
            }
            ParameterKind::Boolean => {
                let v = value.and_then(ParameterValue::as_bool).unwrap_or(false);
                out.push(if v { 1.0 } else { 0.0 });
            }
        }
    }
    Array1::from(out)
}

/// One encoded row per vector.
pub fn encode_all<'a>(
    space: &SearchSpace,
    vectors: impl IntoIterator<Item = &'a ParameterVector>,
) -> Array2<f64> {
    let rows: Vec<Array1<f64>> = vectors.into_iter().map(|v| encode(space, v)).collect();
    let width = rows.first().map_or(0, |r| r.len());
    let mut out = Array2::zeros((rows.len(), width));
    for (mut dst, row) in out.outer_iter_mut().zip(&rows) {
        dst.assign(row);
    }
    out
}

fn unit(v: f64, low: f64, high: f64) -> f64 {
    if high > low {
        ((v - low) / (high - low)).clamp(0.0, 1.0)
    } else {
        0.0
    }
}

fn rbf(a: ArrayView1<f64>, b: ArrayView1<f64>, length_scale: f64) -> f64 {
    let d = &a - &b;
    (-d.dot(&d) / (2.0 * length_scale * length_scale)).exp()
}

fn kernel(a: &Array2<f64>, b: &Array2<f64>, length_scale: f64) -> Array2<f64> {
    Array2::from_shape_fn((a.nrows(), b.nrows()), |(i, j)| {
        rbf(a.row(i), b.row(j), length_scale)
    })
}

/// Lower-triangular `L` with `L Lᵀ = a`, or `None` if `a` is not positive
/// definite.
pub fn cholesky(a: &Array2<f64>) -> Option<Array2<f64>> {
    let n = a.nrows();
    if a.ncols() != n {
        return None;
    }
    let mut l = Array2::<f64>::zeros((n, n));
    for i in 0..n {
        for j in 0..=i {
            let dot = l.slice(s![i, ..j]).dot(&l.slice(s![j, ..j]));
            if i == j {
                let d = a[[i, i]] - dot;
                if d <= 0.0 || !d.is_finite() {
                    return None;
                }
                l[[i, j]] = d.sqrt();
            } else {
                l[[i, j]] = (a[[i, j]] - dot) / l[[j, j]];
            }
        }
    }
    Some(l)
}

/// Solve `L x = b` for lower-triangular `L`.
fn forward(l: &Array2<f64>, b: &Array1<f64>) -> Array1<f64> {
    let n = b.len();
    let mut x = Array1::<f64>::zeros(n);
    for i in 0..n {
        let acc = l.slice(s![i, ..i]).dot(&x.slice(s![..i]));
        x[i] = (b[i] - acc) / l[[i, i]];
    }
    x
}

/// Solve `Lᵀ x = b` for lower-triangular `L`.
fn backward(l: &Array2<f64>, b: &Array1<f64>) -> Array1<f64> {
    let n = b.len();
    let mut x = Array1::<f64>::zeros(n);
    for i in (0..n).rev() {
        let acc = l.slice(s![i + 1.., i]).dot(&x.slice(s![i + 1..]));
        x[i] = (b[i] - acc) / l[[i, i]];
    }
    x
}

const JITTER_ATTEMPTS: usize = 6;

/// Fitted Gaussian process over unit-encoded inputs.
#[derive(Debug, Clone)]
pub struct GaussianProcess {
    inputs: Array2<f64>,
    chol: Array2<f64>,
    alpha: Array1<f64>,
    y_mean: f64,
    y_scale: f64,
    length_scale: f64,
}

impl GaussianProcess {
    /// Fit on `(inputs, targets)`, one input row per target. Retries with
    /// growing diagonal jitter and gives up with `None` if the kernel matrix
    /// stays singular.
    pub fn fit(inputs: Array2<f64>, targets: &Array1<f64>, length_scale: f64, noise: f64) -> Option<Self> {
        let n = targets.len();
        if n == 0 || inputs.nrows() != n || length_scale <= 0.0 {
            return None;
        }
        let y_mean = targets.sum() / n as f64;
        let var = targets.mapv(|t| (t - y_mean).powi(2)).sum() / n as f64;
        let y_scale = if var.sqrt() > 1e-12 { var.sqrt() } else { 1.0 };
        let y = targets.mapv(|t| (t - y_mean) / y_scale);

        let base = kernel(&inputs, &inputs, length_scale);
        let mut jitter = noise.max(1e-10);
        for _ in 0..JITTER_ATTEMPTS {
            let mut k = base.clone();
            k.diag_mut().mapv_inplace(|v| v + jitter);
            if let Some(chol) = cholesky(&k) {
                let alpha = backward(&chol, &forward(&chol, &y));
                return Some(Self {
                    inputs,
                    chol,
                    alpha,
                    y_mean,
                    y_scale,
                    length_scale,
                });
            }
            jitter *= 10.0;
        }
        None
    }

    /// Posterior mean and standard deviation at `x`, in target units.
    pub fn predict(&self, x: &Array1<f64>) -> (f64, f64) {
        let k_star: Array1<f64> = self
            .inputs
            .outer_iter()
            .map(|xi| rbf(xi, x.view(), self.length_scale))
            .collect();
        let mean = k_star.dot(&self.alpha);
        let v = forward(&self.chol, &k_star);
        let var = (1.0 - v.dot(&v)).max(0.0);
        (
            mean * self.y_scale + self.y_mean,
            var.sqrt() * self.y_scale,
        )
    }
}

/// Expected reduction below `best` of a cost with posterior `(mean, std)`.
pub fn expected_improvement(mean: f64, std: f64, best: f64, xi: f64) -> f64 {
    let improvement = best - mean - xi;
    if std <= 1e-12 {
        return improvement.max(0.0);
    }
    let z = improvement / std;
    improvement * normal_cdf(z) + std * normal_pdf(z)
}

pub fn normal_pdf(z: f64) -> f64 {
    (-0.5 * z * z).exp() / (2.0 * std::f64::consts::PI).sqrt()
}

pub fn normal_cdf(z: f64) -> f64 {
    0.5 * (1.0 + erf(z / std::f64::consts::SQRT_2))
}

/// Abramowitz & Stegun 7.1.26, absolute error below 1.5e-7.
fn erf(x: f64) -> f64 {
    let sign = if x < 0.0 { -1.0 } else { 1.0 };
    let x = x.abs();
    let t = 1.0 / (1.0 + 0.327_591_1 * x);
    let poly = t
        * (0.254_829_592
            + t * (-0.284_496_736 + t * (1.421_413_741 + t * (-1.453_152_027 + t * 1.061_405_429))));
    sign * (1.0 - poly * (-x * x).exp())
}

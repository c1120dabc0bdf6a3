//! Support-vector classification with an L2 (squared-hinge) loss.
//!
//! The default RBF kernel is fitted in the primal over kernel expansion
//! coefficients: each Newton step solves the bordered system
//! `[K_sv + I/2C, 1; 1', 0] [beta; b] = [y_sv; 0]` on the current margin
//! violators until that set stops changing. The linear kernel keeps explicit
//! weights and takes Armijo-damped generalised Newton steps. Inputs are
//! standardised first, and probabilities come from a Platt sigmoid fitted to the
//! training decision values.

use super::{Classifier, ModelError, check_features, check_training_data, sigmoid};
use ndarray::{Array1, Array2, ArrayView1, ArrayView2, Axis, s};
use ndarray_linalg::Solve;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SvmKernel {
    /// `exp(-gamma * |a - b|^2)`; `gamma` defaults to `1 / (n_features * var(X))`.
    Rbf {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        gamma: Option<f64>,
    },
    Linear,
}

impl Default for SvmKernel {
    fn default() -> Self {
        SvmKernel::Rbf { gamma: None }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SvmConfig {
    /// Weight of the squared-hinge loss against the margin term.
    pub c: f64,
    pub max_iterations: usize,
    /// Linear kernel only: stop once the gradient norm falls below this value.
    pub tolerance: f64,
    pub kernel: SvmKernel,
}

impl Default for SvmConfig {
    fn default() -> Self {
        Self {
            c: 1.0,
            max_iterations: 50,
            tolerance: 1e-6,
            kernel: SvmKernel::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
enum DecisionModel {
    Linear {
        /// Slopes followed by the bias.
        weights: Array1<f64>,
    },
    Rbf {
        gamma: f64,
        /// Standardised training rows with a non-zero coefficient.
        support: Array2<f64>,
        coefficients: Array1<f64>,
        bias: f64,
    },
}

impl DecisionModel {
    fn decide(&self, z: ArrayView2<f64>) -> Array1<f64> {
        match self {
            DecisionModel::Linear { weights } => augmented(z.to_owned()).dot(weights),
            DecisionModel::Rbf {
                gamma,
                support,
                coefficients,
                bias,
            } => rbf_kernel(z, support.view(), *gamma).dot(coefficients) + *bias,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct FittedSvm {
    means: Array1<f64>,
    scales: Array1<f64>,
    model: DecisionModel,
    platt_a: f64,
    platt_b: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SupportVectorClassifier {
    config: SvmConfig,
    fitted: Option<FittedSvm>,
}

const ARMIJO: f64 = 1e-4;
const MAX_BACKTRACKS: usize = 40;

impl SupportVectorClassifier {
    pub fn new(config: SvmConfig) -> Self {
        Self {
            config,
            fitted: None,
        }
    }

    /// Signed distance-like score; positive means class 1.
    pub fn decision_function(&self, x: ArrayView2<f64>) -> Result<Array1<f64>, ModelError> {
        let fitted = self.fitted.as_ref().ok_or(ModelError::NotFitted)?;
        check_features(fitted.means.len(), x)?;
        let z = (&x - &fitted.means) / &fitted.scales;
        Ok(fitted.model.decide(z.view()))
    }

    /// Number of training rows the RBF expansion keeps; `None` for the linear kernel.
    pub fn support_vector_count(&self) -> Option<usize> {
        match &self.fitted.as_ref()?.model {
            DecisionModel::Rbf { support, .. } => Some(support.nrows()),
            DecisionModel::Linear { .. } => None,
        }
    }

    fn objective(&self, design: &Array2<f64>, signs: &Array1<f64>, w: &Array1<f64>) -> f64 {
        let margins = design.dot(w) * signs;
        let loss: f64 = margins.iter().map(|m| (1.0 - m).max(0.0).powi(2)).sum();
        0.5 * w.dot(w) + self.config.c * loss
    }

    fn fit_linear(&self, z: Array2<f64>, signs: &Array1<f64>) -> Result<DecisionModel, ModelError> {
        let design = augmented(z);
        let c = self.config.c;

        let mut w = Array1::<f64>::zeros(design.ncols());
        let mut value = self.objective(&design, signs, &w);
        for iteration in 0..self.config.max_iterations {
            let margins = design.dot(&w) * signs;
            let active: Vec<usize> = (0..design.nrows()).filter(|&i| margins[i] < 1.0).collect();
            let xa = design.select(Axis(0), &active);
            let ya = signs.select(Axis(0), &active);

            // grad = w + 2C Xa'(Xa w - ya), hessian = I + 2C Xa'Xa
            let residual = xa.dot(&w) - &ya;
            let gradient = &w + &(xa.t().dot(&residual) * (2.0 * c));
            let norm = gradient.dot(&gradient).sqrt();
            if norm < self.config.tolerance {
                log::debug!("Linear SVM converged after {iteration} iterations");
                break;
            }
            let hessian = Array2::<f64>::eye(w.len()) + xa.t().dot(&xa) * (2.0 * c);
            let direction = hessian.solve_into(gradient.mapv(|g| -g))?;

            let slope = gradient.dot(&direction);
            let mut step = 1.0;
            let mut accepted = false;
            for _ in 0..MAX_BACKTRACKS {
                let candidate = &w + &(&direction * step);
                let candidate_value = self.objective(&design, signs, &candidate);
                if candidate_value <= value + ARMIJO * step * slope {
                    w = candidate;
                    value = candidate_value;
                    accepted = true;
                    break;
                }
                step *= 0.5;
            }
            if !accepted {
                break;
            }
        }
        if w.iter().any(|v| !v.is_finite()) {
            return Err(ModelError::NonFinite);
        }
        Ok(DecisionModel::Linear { weights: w })
    }

    fn fit_rbf(
        &self,
        z: Array2<f64>,
        signs: &Array1<f64>,
        gamma: Option<f64>,
    ) -> Result<DecisionModel, ModelError> {
        let n = z.nrows();
        let gamma = gamma.unwrap_or_else(|| scale_gamma(z.view()));
        let gram = rbf_kernel(z.view(), z.view(), gamma);
        let ridge = 0.5 / self.config.c;

        let mut active: Vec<usize> = (0..n).collect();
        let mut coefficients = Array1::<f64>::zeros(n);
        let mut bias = 0.0;
        for iteration in 0..self.config.max_iterations {
            let m = active.len();
            let mut system = Array2::<f64>::zeros((m + 1, m + 1));
            let mut rhs = Array1::<f64>::zeros(m + 1);
            for (a, &i) in active.iter().enumerate() {
                for (b, &j) in active.iter().enumerate() {
                    system[[a, b]] = gram[[i, j]];
                }
                system[[a, a]] += ridge;
                system[[a, m]] = 1.0;
                system[[m, a]] = 1.0;
                rhs[a] = signs[i];
            }
            let solution = system.solve_into(rhs)?;
            coefficients.fill(0.0);
            for (a, &i) in active.iter().enumerate() {
                coefficients[i] = solution[a];
            }
            bias = solution[m];

            let margins = (gram.dot(&coefficients) + bias) * signs;
            let violators: Vec<usize> = (0..n).filter(|&i| margins[i] < 1.0).collect();
            if violators == active || violators.is_empty() {
                log::debug!("RBF SVM settled on {m} support vectors after {iteration} iterations");
                break;
            }
            active = violators;
        }
        if !bias.is_finite() || coefficients.iter().any(|v| !v.is_finite()) {
            return Err(ModelError::NonFinite);
        }

        let support: Vec<usize> = (0..n).filter(|&i| coefficients[i] != 0.0).collect();
        Ok(DecisionModel::Rbf {
            gamma,
            support: z.select(Axis(0), &support),
            coefficients: coefficients.select(Axis(0), &support),
            bias,
        })
    }
}

fn augmented(x: Array2<f64>) -> Array2<f64> {
    let mut design = Array2::ones((x.nrows(), x.ncols() + 1));
    design.slice_mut(s![.., ..x.ncols()]).assign(&x);
    design
}

fn standardise(x: ArrayView2<f64>) -> (Array1<f64>, Array1<f64>) {
    let n = x.nrows() as f64;
    let means = x.mean_axis(Axis(0)).unwrap_or_else(|| Array1::zeros(x.ncols()));
    let scales = x
        .axis_iter(Axis(1))
        .zip(means.iter())
        .map(|(column, &mean)| {
            let var = column.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / n;
            if var > f64::EPSILON { var.sqrt() } else { 1.0 }
        })
        .collect();
    (means, scales)
}

/// `1 / (n_features * var(z))` over every entry, or 1 when `z` is constant.
fn scale_gamma(z: ArrayView2<f64>) -> f64 {
    let var = z.var(0.0);
    if z.ncols() == 0 || var.is_nan() || var <= f64::EPSILON {
        1.0
    } else {
        1.0 / (z.ncols() as f64 * var)
    }
}

/// `K[i, j] = exp(-gamma * |a_i - b_j|^2)`.
fn rbf_kernel(a: ArrayView2<f64>, b: ArrayView2<f64>, gamma: f64) -> Array2<f64> {
    let a_norms = a.map_axis(Axis(1), |row| row.dot(&row));
    let b_norms = b.map_axis(Axis(1), |row| row.dot(&row));
    let mut kernel = a.dot(&b.t());
    for ((i, j), value) in kernel.indexed_iter_mut() {
        let distance = (a_norms[i] + b_norms[j] - 2.0 * *value).max(0.0);
        *value = (-gamma * distance).exp();
    }
    kernel
}

impl Classifier for SupportVectorClassifier {
    fn fit(&mut self, x: ArrayView2<f64>, y: ArrayView1<f64>) -> Result<(), ModelError> {
        check_training_data(x, y)?;
        let (means, scales) = standardise(x);
        let z = (&x - &means) / &scales;
        let signs = y.mapv(|v| if v == 1.0 { 1.0 } else { -1.0 });

        let model = match self.config.kernel {
            SvmKernel::Linear => self.fit_linear(z.clone(), &signs)?,
            SvmKernel::Rbf { gamma } => self.fit_rbf(z.clone(), &signs, gamma)?,
        };
        let decisions = model.decide(z.view());
        let (platt_a, platt_b) = fit_platt(decisions.view(), y);
        self.fitted = Some(FittedSvm {
            means,
            scales,
            model,
            platt_a,
            platt_b,
        });
        Ok(())
    }

    fn predict_proba(&self, x: ArrayView2<f64>) -> Result<Array1<f64>, ModelError> {
        let fitted = self.fitted.as_ref().ok_or(ModelError::NotFitted)?;
        Ok(self
            .decision_function(x)?
            .mapv(|f| sigmoid(fitted.platt_a * f + fitted.platt_b)))
    }

    fn predict(&self, x: ArrayView2<f64>) -> Result<Array1<f64>, ModelError> {
        Ok(self
            .decision_function(x)?
            .mapv(|f| if f > 0.0 { 1.0 } else { 0.0 }))
    }
}

/// Fits `p = sigmoid(a * f + b)` to decision values with Platt's smoothed targets.
fn fit_platt(decisions: ArrayView1<f64>, y: ArrayView1<f64>) -> (f64, f64) {
    let positives = y.iter().filter(|&&v| v == 1.0).count() as f64;
    let negatives = y.len() as f64 - positives;
    let hi = (positives + 1.0) / (positives + 2.0);
    let lo = 1.0 / (negatives + 2.0);
    let targets: Vec<f64> = y.iter().map(|&v| if v == 1.0 { hi } else { lo }).collect();

    let loss = |a: f64, b: f64| -> f64 {
        decisions
            .iter()
            .zip(&targets)
            .map(|(&f, &t)| {
                let p = sigmoid(a * f + b).clamp(1e-12, 1.0 - 1e-12);
                -(t * p.ln() + (1.0 - t) * (1.0 - p).ln())
            })
            .sum()
    };

    let (mut a, mut b) = (0.0, ((positives + 1.0) / (negatives + 1.0)).ln());
    let mut value = loss(a, b);
    for _ in 0..100 {
        let (mut ga, mut gb, mut haa, mut hab, mut hbb) = (0.0, 0.0, 1e-12, 0.0, 1e-12);
        for (&f, &t) in decisions.iter().zip(&targets) {
            let p = sigmoid(a * f + b);
            let d = p - t;
            let w = p * (1.0 - p);
            ga += d * f;
            gb += d;
            haa += w * f * f;
            hab += w * f;
            hbb += w;
        }
        if ga.abs() < 1e-10 && gb.abs() < 1e-10 {
            break;
        }
        let det = haa * hbb - hab * hab;
        if det.abs() < 1e-300 {
            break;
        }
        let da = -(hbb * ga - hab * gb) / det;
        let db = -(haa * gb - hab * ga) / det;

        let mut step = 1.0;
        let mut improved = false;
        while step > 1e-10 {
            let candidate = loss(a + step * da, b + step * db);
            if candidate < value + ARMIJO * step * (ga * da + gb * db) {
                a += step * da;
                b += step * db;
                value = candidate;
                improved = true;
                break;
            }
            step *= 0.5;
        }
        if !improved {
            break;
        }
    }
    (a, b)
}

use super::{Classifier, ModelError, check_features, check_training_data, sigmoid};
use ndarray::{Array1, Array2, ArrayView1, ArrayView2, Axis, s};
use ndarray_linalg::Solve;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LogisticConfig {
    /// Inverse L2 strength; the penalty on the slopes is `0.5 * |w|^2 / c`.
    pub c: f64,
    pub max_iterations: usize,
    /// Convergence threshold on the relative change in penalised deviance.
    pub tolerance: f64,
}

impl Default for LogisticConfig {
    fn default() -> Self {
        Self {
            c: 1.0,
            max_iterations: 100,
            tolerance: 1e-8,
        }
    }
}

/// L2-penalised logistic regression fitted by penalised IRLS. The intercept is
/// not penalised.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogisticRegression {
    config: LogisticConfig,
    intercept: f64,
    coefficients: Option<Array1<f64>>,
}

const PROB_EPS: f64 = 1e-8;
const MIN_WEIGHT: f64 = 1e-6;
const MAX_STEP_HALVINGS: usize = 30;

impl LogisticRegression {
    pub fn new(config: LogisticConfig) -> Self {
        Self {
            config,
            intercept: 0.0,
            coefficients: None,
        }
    }

    pub fn coefficients(&self) -> Option<(f64, ArrayView1<'_, f64>)> {
        self.coefficients.as_ref().map(|w| (self.intercept, w.view()))
    }

    fn penalised_deviance(&self, design: &Array2<f64>, y: ArrayView1<f64>, beta: &Array1<f64>) -> f64 {
        let eta = design.dot(beta);
        let deviance: f64 = eta
            .iter()
            .zip(y.iter())
            .map(|(&e, &yi)| {
                let mu = sigmoid(e).clamp(PROB_EPS, 1.0 - PROB_EPS);
                -2.0 * (yi * mu.ln() + (1.0 - yi) * (1.0 - mu).ln())
            })
            .sum();
        // Deviance is twice the log-loss, so the ridge term is doubled with it.
        let slopes = beta.slice(s![1..]);
        deviance + slopes.dot(&slopes) / self.config.c
    }
}

fn with_intercept(x: ArrayView2<f64>) -> Array2<f64> {
    let mut design = Array2::ones((x.nrows(), x.ncols() + 1));
    design.slice_mut(s![.., 1..]).assign(&x);
    design
}

impl Classifier for LogisticRegression {
    fn fit(&mut self, x: ArrayView2<f64>, y: ArrayView1<f64>) -> Result<(), ModelError> {
        check_training_data(x, y)?;
        let design = with_intercept(x);
        let p = design.ncols();
        let mut penalty = Array2::<f64>::eye(p) * (1.0 / self.config.c);
        penalty[[0, 0]] = 0.0;

        let mut beta = Array1::<f64>::zeros(p);
        let mut last = self.penalised_deviance(&design, y, &beta);

        for iteration in 0..self.config.max_iterations {
            let eta = design.dot(&beta).mapv(|e| e.clamp(-700.0, 700.0));
            let mu = eta.mapv(|e| sigmoid(e).clamp(PROB_EPS, 1.0 - PROB_EPS));
            let weights = mu.mapv(|m| (m * (1.0 - m)).max(MIN_WEIGHT));
            let z = &eta + &((&y - &mu) / &weights);

            let weighted = &design * &weights.view().insert_axis(Axis(1));
            let lhs = weighted.t().dot(&design) + &penalty;
            let rhs = weighted.t().dot(&z);
            let proposal = lhs.solve_into(rhs)?;

            // Step-halving keeps the penalised deviance monotone.
            let direction = &proposal - &beta;
            let mut step = 1.0;
            let mut candidate = proposal;
            let mut current = self.penalised_deviance(&design, y, &candidate);
            let mut halvings = 0;
            while (current > last || current.is_nan()) && halvings < MAX_STEP_HALVINGS {
                step *= 0.5;
                candidate = &beta + &(&direction * step);
                current = self.penalised_deviance(&design, y, &candidate);
                halvings += 1;
            }
            if !current.is_finite() || candidate.iter().any(|b| !b.is_finite()) {
                return Err(ModelError::NonFinite);
            }

            beta = candidate;
            let change = (last - current).abs() / (current.abs() + 0.1);
            last = current;
            if change < self.config.tolerance {
                log::debug!("Logistic regression converged after {} iterations", iteration + 1);
                break;
            }
        }

        self.intercept = beta[0];
        self.coefficients = Some(beta.slice(s![1..]).to_owned());
        Ok(())
    }

    fn predict_proba(&self, x: ArrayView2<f64>) -> Result<Array1<f64>, ModelError> {
        let w = self.coefficients.as_ref().ok_or(ModelError::NotFitted)?;
        check_features(w.len(), x)?;
        Ok(x.dot(w).mapv(|e| sigmoid(e + self.intercept)))
    }
}

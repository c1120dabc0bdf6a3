//! Regression-based imputation.
//!
//! Every column with missing training values gets a ridge model whose predictors
//! are drawn from the columns that are fully observed in training, ranked by
//! absolute correlation with the target column. When no column is fully
//! observed, every other partially observed column competes instead, with its
//! gaps filled by the training median both when fitting and when imputing.
//! Columns that cannot be modelled are dropped from this imputer's output
//! instead of failing the run, so the output may be narrower than the input.

use super::median::column_median;
use super::{FittedImputer, ImputeError};
use crate::types::ImputationKind;
use ndarray::{Array1, Array2, ArrayView1, ArrayView2, Axis};
use ndarray_linalg::Solve;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RegressionImputerConfig {
    /// Upper bound on predictors per imputed column.
    pub max_predictors: usize,
    /// Ridge penalty added to the centred Gram matrix.
    pub ridge_penalty: f64,
    /// Minimum number of observed training rows required to model a column.
    pub min_observed_rows: usize,
}

impl Default for RegressionImputerConfig {
    fn default() -> Self {
        Self {
            max_predictors: 10,
            ridge_penalty: 1e-3,
            min_observed_rows: 5,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct ColumnModel {
    column: usize,
    predictors: Vec<usize>,
    intercept: f64,
    coefficients: Array1<f64>,
}

impl ColumnModel {
    fn predict_row(&self, row: ArrayView1<f64>, medians: &Array1<f64>) -> f64 {
        self.predictors
            .iter()
            .zip(self.coefficients.iter())
            .fold(self.intercept, |acc, (&p, &beta)| {
                let x = if row[p].is_nan() { medians[p] } else { row[p] };
                acc + beta * x
            })
    }
}

/// Why a column was left out of the regression-imputed output.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Exclusion {
    NoObservations,
    NoPredictors,
    TooFewRows { observed: usize, required: usize },
    SolveFailed,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegressionImputer {
    input_columns: usize,
    kept: Vec<usize>,
    models: Vec<ColumnModel>,
    medians: Array1<f64>,
    excluded: Vec<(usize, Exclusion)>,
}

impl RegressionImputer {
    pub fn fit(
        train: ArrayView2<f64>,
        config: &RegressionImputerConfig,
    ) -> Result<Self, ImputeError> {
        let ncols = train.ncols();
        let medians: Vec<Option<f64>> = train.axis_iter(Axis(1)).map(column_median).collect();
        let complete: Vec<usize> = (0..ncols)
            .filter(|&c| train.column(c).iter().all(|v| !v.is_nan()))
            .collect();
        let candidates: Vec<usize> = if complete.is_empty() {
            log::warn!("No training column is fully observed; regression predictors are median-filled");
            (0..ncols).filter(|&c| medians[c].is_some()).collect()
        } else {
            complete.clone()
        };
        let filled = fill_with_medians(train, &medians);

        let mut kept = Vec::with_capacity(ncols);
        let mut models = Vec::new();
        let mut excluded = Vec::new();

        for column in 0..ncols {
            if complete.binary_search(&column).is_ok() {
                kept.push(column);
                continue;
            }
            if medians[column].is_none() {
                excluded.push((column, Exclusion::NoObservations));
                continue;
            }
            match fit_column(train, filled.view(), column, &candidates, config) {
                Ok(model) => {
                    kept.push(column);
                    models.push(model);
                }
                Err(reason) => {
                    log::warn!("Regression imputation excludes column {column}: {reason:?}");
                    excluded.push((column, reason));
                }
            }
        }

        log::info!(
            "Regression imputer: {} pass-through, {} modelled, {} excluded of {} columns",
            kept.len() - models.len(),
            models.len(),
            excluded.len(),
            ncols
        );

        Ok(Self {
            input_columns: ncols,
            kept,
            models,
            medians: Array1::from_iter(medians.into_iter().map(|m| m.unwrap_or(f64::NAN))),
            excluded,
        })
    }

    /// Input column indices present in the output, in output order.
    pub fn kept_columns(&self) -> &[usize] {
        &self.kept
    }

    pub fn excluded_columns(&self) -> &[(usize, Exclusion)] {
        &self.excluded
    }
}

impl FittedImputer for RegressionImputer {
    fn kind(&self) -> ImputationKind {
        ImputationKind::Regression
    }

    fn transform(&self, data: ArrayView2<f64>) -> Result<Array2<f64>, ImputeError> {
        if data.ncols() != self.input_columns {
            return Err(ImputeError::ColumnCountMismatch {
                expected: self.input_columns,
                found: data.ncols(),
            });
        }
        let mut out = data.select(Axis(1), &self.kept);
        let mut models = self.models.iter().peekable();
        for (out_idx, &column) in self.kept.iter().enumerate() {
            let model = models.next_if(|m| m.column == column);
            for (r, row) in data.axis_iter(Axis(0)).enumerate() {
                if !out[[r, out_idx]].is_nan() {
                    continue;
                }
                out[[r, out_idx]] = match model {
                    Some(model) => model.predict_row(row, &self.medians),
                    None => self.medians[column],
                };
            }
        }
        Ok(out)
    }

    fn transform_names(&self, names: &[String]) -> Vec<String> {
        self.kept
            .iter()
            .filter_map(|&c| names.get(c).cloned())
            .collect()
    }
}

/// Training data with every gap replaced by its column median, where one exists.
fn fill_with_medians(train: ArrayView2<f64>, medians: &[Option<f64>]) -> Array2<f64> {
    let mut filled = train.to_owned();
    for (mut values, median) in filled.axis_iter_mut(Axis(1)).zip(medians) {
        if let Some(m) = *median {
            values.mapv_inplace(|v| if v.is_nan() { m } else { v });
        }
    }
    filled
}

/// Fits the ridge model for `column`. Predictor values come from `filled`, the
/// target values from the raw `train` matrix.
fn fit_column(
    train: ArrayView2<f64>,
    filled: ArrayView2<f64>,
    column: usize,
    candidates: &[usize],
    config: &RegressionImputerConfig,
) -> Result<ColumnModel, Exclusion> {
    let target = train.column(column);
    let observed: Vec<usize> = (0..train.nrows())
        .filter(|&r| !target[r].is_nan())
        .collect();
    if observed.is_empty() {
        return Err(Exclusion::NoObservations);
    }
    let y = target.select(Axis(0), &observed);

    let mut ranked: Vec<(usize, f64)> = candidates
        .iter()
        .filter(|&&c| c != column)
        .filter_map(|&c| {
            let x = filled.column(c).select(Axis(0), &observed);
            pearson_correlation(x.view(), y.view()).map(|r| (c, r.abs()))
        })
        .collect();
    ranked.sort_by(|a, b| b.1.total_cmp(&a.1).then(a.0.cmp(&b.0)));
    ranked.truncate(config.max_predictors);
    if ranked.is_empty() {
        return Err(Exclusion::NoPredictors);
    }

    let mut predictors: Vec<usize> = ranked.into_iter().map(|(c, _)| c).collect();
    predictors.sort_unstable();
    let required = config.min_observed_rows.max(predictors.len() + 2);
    if observed.len() < required {
        return Err(Exclusion::TooFewRows {
            observed: observed.len(),
            required,
        });
    }

    let x = filled
        .select(Axis(0), &observed)
        .select(Axis(1), &predictors);
    let x_mean = x.mean_axis(Axis(0)).ok_or(Exclusion::NoObservations)?;
    let y_mean = y.mean().ok_or(Exclusion::NoObservations)?;
    let xc = &x - &x_mean;
    let yc = y.mapv(|v| v - y_mean);

    let mut gram = xc.t().dot(&xc);
    for i in 0..gram.nrows() {
        gram[[i, i]] += config.ridge_penalty;
    }
    let rhs = xc.t().dot(&yc);
    let coefficients = gram.solve_into(rhs).map_err(|_| Exclusion::SolveFailed)?;
    if coefficients.iter().any(|b| !b.is_finite()) {
        return Err(Exclusion::SolveFailed);
    }
    let intercept = y_mean - x_mean.dot(&coefficients);

    Ok(ColumnModel {
        column,
        predictors,
        intercept,
        coefficients,
    })
}

/// Pearson correlation of two equally long vectors; `None` when either is constant.
pub fn pearson_correlation(a: ArrayView1<f64>, b: ArrayView1<f64>) -> Option<f64> {
    let n = a.len();
    if n < 2 || b.len() != n {
        return None;
    }
    let mean_a = a.mean()?;
    let mean_b = b.mean()?;
    let (mut cov, mut var_a, mut var_b) = (0.0, 0.0, 0.0);
    for (&x, &y) in a.iter().zip(b.iter()) {
        let (dx, dy) = (x - mean_a, y - mean_b);
        cov += dx * dy;
        var_a += dx * dx;
        var_b += dy * dy;
    }
    if var_a <= f64::EPSILON || var_b <= f64::EPSILON {
        return None;
    }
    let r = cov / (var_a.sqrt() * var_b.sqrt());
    r.is_finite().then_some(r)
}

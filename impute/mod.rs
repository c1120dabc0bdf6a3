//! # Column Cleaning and Dual Imputation
//!
//! Takes the assembled training and evaluation matrices and:
//!
//! 1. removes degenerate columns, with the kept set learnt on training data and
//!    applied to both splits;
//! 2. runs the regression-based and the median-based imputer side by side, each
//!    fitted once on training data and replayed unchanged on evaluation data.
//!
//! The two imputation families are written as separate artifact families
//! (`<stem>_rImp*`, `<stem>_mImp*`) because the regression path may drop columns
//! and so their column sets can differ.

pub mod clean;
pub mod median;
pub mod regression;

use crate::shared::files::{self, FileError};
use crate::types::{ImputationKind, LabeledMatrix, ShapeMismatch};
use median::MedianImputer;
use ndarray::{Array2, ArrayView2};
use regression::{RegressionImputer, RegressionImputerConfig};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ImputeError {
    #[error(transparent)]
    File(#[from] FileError),
    #[error(transparent)]
    Names(#[from] ShapeMismatch),
    #[error("Column {0} has no observed training values and cannot be imputed")]
    EmptyColumn(usize),
    #[error("Imputer was fitted on {expected} columns but received {found}")]
    ColumnCountMismatch { expected: usize, found: usize },
    #[error(
        "Training and evaluation matrices disagree on their columns ({train_columns} vs {eval_columns}); first difference at position {position}"
    )]
    SplitColumnsDiffer {
        train_columns: usize,
        eval_columns: usize,
        position: usize,
    },
    #[error("Imputation left {count} missing values in the {kind} output")]
    ResidualMissing { kind: ImputationKind, count: usize },
}

/// A fitted imputer that can replay its transformation on new data.
pub trait FittedImputer {
    fn kind(&self) -> ImputationKind;

    /// Transforms `data`, which must have the column count seen during fitting.
    fn transform(&self, data: ArrayView2<f64>) -> Result<Array2<f64>, ImputeError>;

    /// The output column names for the given input names.
    fn transform_names(&self, names: &[String]) -> Vec<String>;

    fn transform_labeled(&self, matrix: &LabeledMatrix) -> Result<LabeledMatrix, ImputeError> {
        let data = self.transform(matrix.data())?;
        let names = self.transform_names(matrix.names());
        Ok(LabeledMatrix::new(data, names)?)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImputeConfig {
    /// Stem of the assembled training matrix.
    pub train_stem: PathBuf,
    /// Stem of the assembled evaluation matrix.
    pub eval_stem: PathBuf,
    /// Snapshot stem for the kept-column list.
    pub keep_columns_out: PathBuf,
    /// Snapshot stem for the fitted regression imputer.
    pub r_imputer_out: PathBuf,
    /// Snapshot stem for the fitted median imputer.
    pub m_imputer_out: PathBuf,
    #[serde(default)]
    pub regression: RegressionImputerConfig,
}

/// Train and evaluation outputs of one imputation strategy.
#[derive(Debug, Clone)]
pub struct ImputedPair {
    pub kind: ImputationKind,
    pub train: LabeledMatrix,
    pub eval: LabeledMatrix,
}

/// Shapes of everything produced by [`run_imputation`].
#[derive(Debug, Clone)]
pub struct ImputationSummary {
    pub kept_columns: Vec<usize>,
    pub regression: ImputedPair,
    pub median: ImputedPair,
}

/// Fits `imputer` on nothing but the training split and applies it to both splits.
pub fn impute_pair<I: FittedImputer>(
    imputer: &I,
    train: &LabeledMatrix,
    eval: &LabeledMatrix,
) -> Result<ImputedPair, ImputeError> {
    let train_out = imputer.transform_labeled(train)?;
    let eval_out = imputer.transform_labeled(eval)?;
    for out in [&train_out, &eval_out] {
        let count = out.data().iter().filter(|v| v.is_nan()).count();
        if count > 0 {
            return Err(ImputeError::ResidualMissing {
                kind: imputer.kind(),
                count,
            });
        }
    }
    Ok(ImputedPair {
        kind: imputer.kind(),
        train: train_out,
        eval: eval_out,
    })
}

/// Cleans and imputes in memory. Returns the fitted imputers alongside their outputs.
pub fn clean_and_impute(
    train: &LabeledMatrix,
    eval: &LabeledMatrix,
    regression_config: &RegressionImputerConfig,
) -> Result<(ImputationSummary, RegressionImputer, MedianImputer), ImputeError> {
    check_split_columns(train, eval)?;

    let kept_columns = clean::clean_columns(train.data());
    let (train, eval) = clean::apply_columns(train, eval, &kept_columns);
    log::info!("Train columns cleaned: {:?}", train.shape());
    log::info!("Eval columns cleaned: {:?}", eval.shape());

    let r_imputer = RegressionImputer::fit(train.data(), regression_config)?;
    let regression = impute_pair(&r_imputer, &train, &eval)?;
    log::info!(
        "Train rImp: {:?}, Eval rImp: {:?}",
        regression.train.shape(),
        regression.eval.shape()
    );

    let m_imputer = MedianImputer::fit(train.data())?;
    let median = impute_pair(&m_imputer, &train, &eval)?;
    log::info!(
        "Train mImp: {:?}, Eval mImp: {:?}",
        median.train.shape(),
        median.eval.shape()
    );

    Ok((
        ImputationSummary {
            kept_columns,
            regression,
            median,
        },
        r_imputer,
        m_imputer,
    ))
}

/// Loads the assembled pair, cleans, imputes both ways and persists every artifact.
pub fn run_imputation(config: &ImputeConfig) -> Result<ImputationSummary, ImputeError> {
    let train = files::load_matrix_artifact(&config.train_stem)?;
    let eval = files::load_matrix_artifact(&config.eval_stem)?;
    log::info!("Train data loaded: {:?}", train.shape());
    log::info!("Eval data loaded: {:?}", eval.shape());

    let (summary, r_imputer, m_imputer) = clean_and_impute(&train, &eval, &config.regression)?;

    files::save_snapshot(&files::artifact_path(&config.keep_columns_out), &summary.kept_columns)?;
    files::save_snapshot(&files::artifact_path(&config.r_imputer_out), &r_imputer)?;
    files::save_snapshot(&files::artifact_path(&config.m_imputer_out), &m_imputer)?;
    for pair in [&summary.regression, &summary.median] {
        save_pair(config, pair)?;
    }
    Ok(summary)
}

/// Artifact stem for one split under one imputation kind, e.g. `<stem>_rImp`.
pub fn imputed_stem(stem: &Path, kind: ImputationKind) -> PathBuf {
    files::with_suffix(stem, &format!("_{}", kind.artifact_tag()))
}

fn save_pair(config: &ImputeConfig, pair: &ImputedPair) -> Result<(), FileError> {
    files::save_matrix_artifact(&imputed_stem(&config.train_stem, pair.kind), &pair.train)?;
    files::save_matrix_artifact(&imputed_stem(&config.eval_stem, pair.kind), &pair.eval)
}

fn check_split_columns(train: &LabeledMatrix, eval: &LabeledMatrix) -> Result<(), ImputeError> {
    let mismatch = train
        .names()
        .iter()
        .zip(eval.names())
        .position(|(a, b)| a != b);
    if train.ncols() != eval.ncols() || mismatch.is_some() {
        return Err(ImputeError::SplitColumnsDiffer {
            train_columns: train.ncols(),
            eval_columns: eval.ncols(),
            position: mismatch.unwrap_or(train.ncols().min(eval.ncols())),
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::Array2;
    use tempfile::tempdir;

    fn labeled(rows: usize, values: Vec<f64>, names: &[&str]) -> LabeledMatrix {
        let data = Array2::from_shape_vec((rows, names.len()), values).unwrap();
        LabeledMatrix::new(data, names.iter().map(|s| s.to_string()).collect()).unwrap()
    }

    fn train_eval() -> (LabeledMatrix, LabeledMatrix) {
        let nan = f64::NAN;
        let names = ["age", "const", "lactate", "sparse"];
        let mut train = Vec::new();
        for i in 0..10 {
            let age = 40.0 + i as f64;
            let lactate = if i % 3 == 0 { nan } else { 0.1 * age };
            let sparse = if i == 4 { 1.0 } else { nan };
            train.extend_from_slice(&[age, 7.0, lactate, sparse]);
        }
        let eval = vec![55.0, 7.0, nan, nan, nan, 7.0, 2.0, nan];
        (labeled(10, train, &names), labeled(2, eval, &names))
    }

    #[test]
    fn both_paths_preserve_rows_and_share_cleaned_columns() {
        let (train, eval) = train_eval();
        let (summary, _, _) =
            clean_and_impute(&train, &eval, &RegressionImputerConfig::default()).unwrap();
        assert_eq!(summary.kept_columns, vec![0, 2]);

        assert_eq!(summary.median.train.shape(), (10, 2));
        assert_eq!(summary.median.eval.shape(), (2, 2));
        assert_eq!(summary.median.train.names(), &["age", "lactate"]);
        assert!(summary.regression.train.ncols() <= summary.median.train.ncols());
        assert_eq!(summary.regression.eval.nrows(), 2);
    }

    #[test]
    fn evaluation_is_transformed_with_training_parameters() {
        let (train, eval) = train_eval();
        let (summary, _, m_imputer) =
            clean_and_impute(&train, &eval, &RegressionImputerConfig::default()).unwrap();
        // The eval row with a missing age gets the training median, not an eval statistic.
        assert_eq!(summary.median.eval.data()[[1, 0]], m_imputer.medians()[0]);
        assert_eq!(summary.median.eval.data()[[1, 1]], 2.0);
    }

    #[test]
    fn mismatched_split_columns_are_rejected() {
        let (train, _) = train_eval();
        let eval = labeled(1, vec![1.0, 2.0, 3.0, 4.0], &["age", "const", "sodium", "sparse"]);
        match clean_and_impute(&train, &eval, &RegressionImputerConfig::default()) {
            Err(ImputeError::SplitColumnsDiffer { position, .. }) => assert_eq!(position, 2),
            other => panic!("expected SplitColumnsDiffer, got {other:?}"),
        }
    }

    #[test]
    fn run_imputation_writes_both_artifact_families() {
        let dir = tempdir().unwrap();
        let root = dir.path();
        let (train, eval) = train_eval();
        files::save_matrix_artifact(&root.join("full_labeling"), &train).unwrap();
        files::save_matrix_artifact(&root.join("full_evaluation"), &eval).unwrap();
        let config = ImputeConfig {
            train_stem: root.join("full_labeling"),
            eval_stem: root.join("full_evaluation"),
            keep_columns_out: root.join("imputers/keep_columns"),
            r_imputer_out: root.join("imputers/r_imputer"),
            m_imputer_out: root.join("imputers/m_imputer"),
            regression: RegressionImputerConfig::default(),
        };
        run_imputation(&config).unwrap();

        for stem in ["full_labeling", "full_evaluation"] {
            for tag in ["rImp", "mImp"] {
                assert!(root.join(format!("{stem}_{tag}.bin")).exists());
                assert!(root.join(format!("{stem}_{tag}_names.bin")).exists());
            }
        }
        // Every fitted snapshot shares the artifact extension.
        for name in ["keep_columns", "r_imputer", "m_imputer"] {
            assert!(root.join(format!("imputers/{name}.bin")).exists());
        }
        let keep: Vec<usize> =
            files::load_snapshot(&files::artifact_path(&config.keep_columns_out)).unwrap();
        assert_eq!(keep, vec![0, 2]);
        let m: MedianImputer =
            files::load_snapshot(&files::artifact_path(&config.m_imputer_out)).unwrap();
        assert_eq!(m.medians().len(), 2);
    }
}

//! # Per-Target Model Selection and Training
//!
//! For every target with a `full` sample record, the six
//! (model family × imputation) combinations are cross-validated on the target's
//! training slice, each restricted to its own feature selection. The best mean
//! score wins, with ties going to the earliest combination in
//! [`Combination::ENUMERATION`]. The winner is refitted on the whole slice and
//! scores the evaluation matrix imputed the same way.
//!
//! Each target walks `Selecting -> Refitting -> Scoring -> Done`. A failure is
//! tagged with the stage it happened in, logged, and does not stop the next
//! target. Three comma-delimited result files collect one row per target.

pub mod cv;
pub mod models;

use crate::impute::imputed_stem;
use crate::samples::io::load_sample_index;
use crate::samples::{self, SampleIndexError, SampleSlice};
use crate::select::{self, SelectionError};
use crate::shared::files::{self, FileError, io_error};
use crate::types::{Combination, ImputationKind, LabeledMatrix, SampleKey, TrainingMode};
use cv::Scoring;
use itertools::Itertools;
use models::{ClassifierConfig, ModelError, new_classifier};
use ndarray::{Array1, Array2, ArrayView2, Axis};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use thiserror::Error;

pub const MODEL_TYPES_FILE: &str = "model_types.txt";
pub const PREDICTIONS_FILE: &str = "predictions_out.txt";
pub const PROBABILITIES_FILE: &str = "probabilities_out.txt";

#[derive(Error, Debug)]
pub enum TrainError {
    #[error(transparent)]
    File(#[from] FileError),
    #[error(transparent)]
    Samples(#[from] SampleIndexError),
    #[error(transparent)]
    Selection(#[from] SelectionError),
    #[error(transparent)]
    Model(#[from] ModelError),
    #[error(
        "Labels are degenerate for cross-validation: {positives} positives, {negatives} negatives (need at least 2 of each)"
    )]
    DegenerateLabels { positives: usize, negatives: usize },
    #[error("Score is undefined on CV fold {fold} (single-class test set)")]
    UndefinedScore { fold: usize },
    #[error("Training and evaluation {kind} matrices disagree on their columns")]
    SplitColumnsDiffer { kind: ImputationKind },
    #[error("Target index {0} has no name in the target column list")]
    UnnamedTarget(usize),
    #[error("No combination produced a finite CV score")]
    NoScores,
}

/// Progress of one target through training.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TargetStage {
    Selecting,
    Refitting,
    Scoring,
    Done,
}

impl fmt::Display for TargetStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TargetStage::Selecting => "selecting",
            TargetStage::Refitting => "refitting",
            TargetStage::Scoring => "scoring",
            TargetStage::Done => "done",
        };
        f.write_str(name)
    }
}

/// A failure isolated to one target, tagged with the stage it happened in.
#[derive(Error, Debug)]
#[error("Target {key} failed while {stage}: {source}")]
pub struct TargetError {
    pub key: SampleKey,
    pub stage: TargetStage,
    #[source]
    pub source: TrainError,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrainingConfig {
    /// Stem of the training matrix; `_mImp` / `_rImp` are appended.
    pub train_stem: PathBuf,
    /// Stem of the evaluation matrix; `_mImp` / `_rImp` are appended.
    pub eval_stem: PathBuf,
    pub feature_samples: PathBuf,
    pub target_samples: PathBuf,
    pub target_matrix_file: PathBuf,
    pub target_feature_columns_file: PathBuf,
    /// Directory holding the per-key feature-selection files.
    pub selection_dir: PathBuf,
    /// Directory receiving the three result files.
    pub result_dir: PathBuf,
    #[serde(default)]
    pub mode: TrainingMode,
    #[serde(default)]
    pub scoring: Scoring,
    #[serde(default)]
    pub classifiers: ClassifierConfig,
}

/// One value per imputation kind.
#[derive(Debug, Clone)]
pub struct ByImputation<T> {
    pub median: T,
    pub regression: T,
}

impl<T> ByImputation<T> {
    pub fn get(&self, kind: ImputationKind) -> &T {
        match kind {
            ImputationKind::Median => &self.median,
            ImputationKind::Regression => &self.regression,
        }
    }

    pub fn try_map<U, E>(&self, mut f: impl FnMut(ImputationKind, &T) -> Result<U, E>) -> Result<ByImputation<U>, E> {
        Ok(ByImputation {
            median: f(ImputationKind::Median, &self.median)?,
            regression: f(ImputationKind::Regression, &self.regression)?,
        })
    }
}

/// Everything training reads, loaded once.
#[derive(Debug, Clone)]
pub struct TrainingData {
    pub train: ByImputation<LabeledMatrix>,
    pub eval: ByImputation<LabeledMatrix>,
    /// Target-order rows, one column per target.
    pub targets: Array2<f64>,
    pub target_names: Vec<String>,
}

impl TrainingData {
    pub fn load(config: &TrainingConfig) -> Result<Self, TrainError> {
        let load_pair = |stem: &Path| -> Result<ByImputation<LabeledMatrix>, FileError> {
            Ok(ByImputation {
                median: files::load_matrix_artifact(&imputed_stem(stem, ImputationKind::Median))?,
                regression: files::load_matrix_artifact(&imputed_stem(stem, ImputationKind::Regression))?,
            })
        };
        let data = Self {
            train: load_pair(&config.train_stem)?,
            eval: load_pair(&config.eval_stem)?,
            targets: files::read_numeric_table(&config.target_matrix_file, b',')?,
            target_names: files::load_list(&config.target_feature_columns_file)?,
        };
        for kind in ImputationKind::ALL {
            log::info!(
                "{kind}: train {:?}, eval {:?}",
                data.train.get(kind).shape(),
                data.eval.get(kind).shape()
            );
            if data.train.get(kind).names() != data.eval.get(kind).names() {
                return Err(TrainError::SplitColumnsDiffer { kind });
            }
        }
        log::info!("Target matrix: {:?}", data.targets.dim());
        Ok(data)
    }
}

/// The result of one successfully trained target.
#[derive(Debug, Clone)]
pub struct TargetOutcome {
    pub key: SampleKey,
    pub target_name: String,
    pub combination: Combination,
    pub score: f64,
    pub predictions: Array1<f64>,
    pub probabilities: Array1<f64>,
}

impl TargetOutcome {
    /// `3` for a full key, `3_0` for a fold key.
    pub fn model_id(&self) -> String {
        if self.key.fold_type.is_full() {
            self.key.target_index.to_string()
        } else {
            self.key.stem()
        }
    }

    pub fn prediction_label(&self) -> String {
        if self.key.fold_type.is_full() {
            self.target_name.clone()
        } else {
            format!("{}_{}", self.target_name, self.key.fold_type)
        }
    }
}

#[derive(Debug, Default)]
pub struct TrainingReport {
    pub succeeded: Vec<(SampleKey, Combination, f64)>,
    pub failed: Vec<TargetError>,
}

/// The earliest combination with the highest score. Non-finite scores never win.
pub fn select_best(scores: &[(Combination, f64)]) -> Option<(Combination, f64)> {
    let mut best: Option<(Combination, f64)> = None;
    for &(combination, score) in scores {
        if !score.is_finite() {
            continue;
        }
        if best.is_none_or(|(_, top)| score > top) {
            best = Some((combination, score));
        }
    }
    best
}

fn restrict_columns(x: ArrayView2<f64>, columns: &[usize]) -> Result<Array2<f64>, SelectionError> {
    if let Some(&column) = columns.iter().find(|&&c| c >= x.ncols()) {
        return Err(SelectionError::ColumnOutOfRange {
            column,
            ncols: x.ncols(),
        });
    }
    Ok(x.select(Axis(1), columns))
}

fn selection_for(
    selections: &HashMap<Combination, Vec<usize>>,
    combination: Combination,
    dir: &Path,
    key: &SampleKey,
) -> Result<Vec<usize>, SelectionError> {
    selections
        .get(&combination)
        .cloned()
        .ok_or_else(|| SelectionError::MissingSelection {
            combination,
            path: select::selection_file_path(dir, key, combination.imputation),
        })
}

/// Runs one target through the selection, refit and scoring stages.
pub fn train_target(
    slice: &SampleSlice,
    data: &TrainingData,
    config: &TrainingConfig,
) -> Result<TargetOutcome, TargetError> {
    let key = slice.key;
    let mut stage = TargetStage::Selecting;
    let fail = |stage: TargetStage| move |source: TrainError| TargetError { key, stage, source };

    let target_name = data
        .target_names
        .get(key.target_index)
        .cloned()
        .ok_or(TrainError::UnnamedTarget(key.target_index))
        .map_err(fail(stage))?;

    let selecting = || -> Result<_, TrainError> {
        let selections = select::load_selections(&config.selection_dir, &key)?;
        let x = data
            .train
            .try_map(|_, m| samples::gather_rows(m.data(), &slice.feature_rows))?;
        let y = samples::gather_labels(data.targets.view(), &slice.target_rows, key.target_index)?;
        let k = cv::fold_count(y.view())?;

        let mut scores = Vec::with_capacity(Combination::ENUMERATION.len());
        for combination in Combination::ENUMERATION {
            let imputed = x.get(combination.imputation);
            if imputed.ncols() == 0 {
                log::warn!("{key} {combination}: skipped, the {} matrix has no columns", combination.imputation);
                continue;
            }
            let columns = selection_for(&selections, combination, &config.selection_dir, &key)?;
            let xc = restrict_columns(imputed.view(), &columns)?;
            let fold_scores = cv::cross_val_score(
                combination.family,
                &config.classifiers,
                xc.view(),
                y.view(),
                k,
                config.scoring,
            )?;
            let mean = fold_scores.iter().sum::<f64>() / fold_scores.len() as f64;
            log::debug!("{key} {combination}: mean CV score {mean:.4} over {k} folds");
            scores.push((combination, mean));
        }
        let (best, score) = select_best(&scores).ok_or(TrainError::NoScores)?;
        Ok((selections, x, y, best, score))
    };
    let (selections, x, y, best, score) = selecting().map_err(fail(stage))?;

    stage = TargetStage::Refitting;
    let columns = selection_for(&selections, best, &config.selection_dir, &key)
        .map_err(TrainError::from)
        .map_err(fail(stage))?;
    let mut model = new_classifier(best.family, &config.classifiers);
    restrict_columns(x.get(best.imputation).view(), &columns)
        .map_err(TrainError::from)
        .and_then(|xc| Ok(model.fit(xc.view(), y.view())?))
        .map_err(fail(stage))?;

    stage = TargetStage::Scoring;
    let scoring = || -> Result<_, TrainError> {
        let scored = if key.fold_type.is_full() {
            data.eval.get(best.imputation).data().to_owned()
        } else {
            samples::gather_rows(data.train.get(best.imputation).data(), &slice.held_out_feature_rows)?
        };
        let xs = restrict_columns(scored.view(), &columns)?;
        Ok((model.predict(xs.view())?, model.predict_proba(xs.view())?))
    };
    let (predictions, probabilities) = scoring().map_err(fail(stage))?;

    stage = TargetStage::Done;
    log::info!(
        "{key} ('{target_name}'): {best} with CV score {score:.4}, {} rows scored ({stage})",
        predictions.len()
    );
    Ok(TargetOutcome {
        key,
        target_name,
        combination: best,
        score,
        predictions,
        probabilities,
    })
}

struct ResultWriters {
    model_types: BufWriter<File>,
    predictions: BufWriter<File>,
    probabilities: BufWriter<File>,
    dir: PathBuf,
}

impl ResultWriters {
    fn create(dir: &Path) -> Result<Self, FileError> {
        let mut writers = Self {
            model_types: files::create_text_file(&dir.join(MODEL_TYPES_FILE))?,
            predictions: files::create_text_file(&dir.join(PREDICTIONS_FILE))?,
            probabilities: files::create_text_file(&dir.join(PROBABILITIES_FILE))?,
            dir: dir.to_path_buf(),
        };
        writeln!(writers.model_types, "#model_id,model_type,max_train_auroc")
            .map_err(io_error(&dir.join(MODEL_TYPES_FILE)))?;
        Ok(writers)
    }

    fn append(&mut self, outcome: &TargetOutcome) -> Result<(), FileError> {
        let mut buffer = ryu::Buffer::new();
        let id = outcome.model_id();
        writeln!(
            self.model_types,
            "{},{},{}",
            id,
            outcome.combination,
            buffer.format(outcome.score)
        )
        .map_err(io_error(&self.dir.join(MODEL_TYPES_FILE)))?;
        writeln!(
            self.predictions,
            "{},{}",
            outcome.prediction_label(),
            join_floats(outcome.predictions.iter())
        )
        .map_err(io_error(&self.dir.join(PREDICTIONS_FILE)))?;
        writeln!(
            self.probabilities,
            "{},{}",
            id,
            join_floats(outcome.probabilities.iter())
        )
        .map_err(io_error(&self.dir.join(PROBABILITIES_FILE)))
    }

    fn finish(mut self) -> Result<(), FileError> {
        self.model_types
            .flush()
            .map_err(io_error(&self.dir.join(MODEL_TYPES_FILE)))?;
        self.predictions
            .flush()
            .map_err(io_error(&self.dir.join(PREDICTIONS_FILE)))?;
        self.probabilities
            .flush()
            .map_err(io_error(&self.dir.join(PROBABILITIES_FILE)))
    }
}

fn join_floats<'a>(values: impl Iterator<Item = &'a f64>) -> String {
    let mut buffer = ryu::Buffer::new();
    values.map(|&v| buffer.format(v).to_owned()).join(",")
}

/// Trains every planned target and writes the three result files.
pub fn run_training(config: &TrainingConfig) -> Result<TrainingReport, TrainError> {
    let data = TrainingData::load(config)?;
    let features = load_sample_index(&config.feature_samples)?;
    let targets = load_sample_index(&config.target_samples)?;
    let slices = samples::plan_slices(&features, &targets, config.mode)?;
    log::info!("Training {} sample keys ({:?} mode)", slices.len(), config.mode);

    let mut writers = ResultWriters::create(&config.result_dir)?;
    let mut report = TrainingReport::default();
    for slice in &slices {
        match train_target(slice, &data, config) {
            Ok(outcome) => {
                writers.append(&outcome)?;
                report
                    .succeeded
                    .push((outcome.key, outcome.combination, outcome.score));
            }
            Err(e) => {
                log::error!("{e}");
                report.failed.push(e);
            }
        }
    }
    writers.finish()?;
    log::info!(
        "Training finished: {} targets succeeded, {} failed",
        report.succeeded.len(),
        report.failed.len()
    );
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{FoldType, ImputationKind, ModelFamily};
    use ndarray::array;
    use std::fs;
    use tempfile::{TempDir, tempdir};

    fn matrix(data: Array2<f64>) -> LabeledMatrix {
        let names = (0..data.ncols()).map(|c| format!("f{c}")).collect();
        LabeledMatrix::new(data, names).unwrap()
    }

    /// Two positives and two negatives separated by column 0, with both
    /// imputation kinds given `regression` and every family selecting column 0.
    fn separable_target(regression: Array2<f64>) -> (TempDir, SampleSlice, TrainingData, TrainingConfig) {
        let dir = tempdir().unwrap();
        let median = array![[-2.0, 0.3], [-1.0, 0.9], [1.0, 0.1], [2.0, 0.5]];
        let selected = if regression.ncols() == 0 { "" } else { "0" };
        for (kind, columns) in [("mImp", "0"), ("rImp", selected)] {
            fs::write(
                dir.path().join(format!("0_full-{kind}.txt")),
                format!("lr:{columns}\nsv:{columns}\nrf:{columns}\n"),
            )
            .unwrap();
        }
        let data = TrainingData {
            train: ByImputation {
                median: matrix(median.clone()),
                regression: matrix(regression.clone()),
            },
            eval: ByImputation {
                median: matrix(median),
                regression: matrix(regression),
            },
            targets: array![[0.0], [0.0], [1.0], [1.0]],
            target_names: vec!["fever".into()],
        };
        let slice = SampleSlice {
            key: SampleKey::full(0),
            feature_rows: vec![0, 1, 2, 3],
            target_rows: vec![0, 1, 2, 3],
            held_out_feature_rows: vec![],
            held_out_target_rows: vec![],
        };
        let unused = PathBuf::from("unused");
        let config = TrainingConfig {
            train_stem: unused.clone(),
            eval_stem: unused.clone(),
            feature_samples: unused.clone(),
            target_samples: unused.clone(),
            target_matrix_file: unused.clone(),
            target_feature_columns_file: unused,
            selection_dir: dir.path().to_path_buf(),
            result_dir: dir.path().join("results"),
            mode: TrainingMode::default(),
            scoring: Scoring::default(),
            classifiers: ClassifierConfig::default(),
        };
        (dir, slice, data, config)
    }

    #[test]
    fn identical_imputations_tie_break_to_lr_m_every_time() {
        let same = array![[-2.0, 0.3], [-1.0, 0.9], [1.0, 0.1], [2.0, 0.5]];
        let (_dir, slice, data, config) = separable_target(same);
        let first = train_target(&slice, &data, &config).unwrap();
        assert_eq!(first.combination.to_string(), "lr-m");
        assert_eq!(first.score, 1.0);
        assert_eq!(first.predictions, array![0.0, 0.0, 1.0, 1.0]);
        for _ in 0..3 {
            let again = train_target(&slice, &data, &config).unwrap();
            assert_eq!(again.combination, first.combination);
            assert_eq!(again.score, first.score);
            assert_eq!(again.probabilities, first.probabilities);
        }
    }

    #[test]
    fn combinations_without_columns_are_skipped() {
        let (_dir, slice, data, config) = separable_target(Array2::zeros((4, 0)));
        let outcome = train_target(&slice, &data, &config).unwrap();
        assert_eq!(outcome.combination.imputation, ImputationKind::Median);
        assert_eq!(outcome.predictions.len(), 4);
    }

    #[test]
    fn ties_resolve_to_the_earliest_combination() {
        let scores: Vec<(Combination, f64)> = Combination::ENUMERATION
            .iter()
            .map(|&c| (c, 0.75))
            .collect();
        let (best, score) = select_best(&scores).unwrap();
        assert_eq!(best.to_string(), "lr-m");
        assert_eq!(score, 0.75);

        let mut scores = scores;
        scores[2].1 = 0.9;
        scores[4].1 = 0.9;
        scores[0].1 = f64::NAN;
        let (best, _) = select_best(&scores).unwrap();
        assert_eq!(
            best,
            Combination::new(ModelFamily::RandomForest, ImputationKind::Median)
        );
        assert!(select_best(&[]).is_none());
    }

    #[test]
    fn result_ids_distinguish_full_and_fold_keys() {
        let mut outcome = TargetOutcome {
            key: SampleKey::full(3),
            target_name: "fever".into(),
            combination: Combination::ENUMERATION[0],
            score: 1.0,
            predictions: array![1.0],
            probabilities: array![0.9],
        };
        assert_eq!(outcome.model_id(), "3");
        assert_eq!(outcome.prediction_label(), "fever");
        outcome.key.fold_type = FoldType::Fold(2);
        assert_eq!(outcome.model_id(), "3_2");
        assert_eq!(outcome.prediction_label(), "fever_2");
    }

    #[test]
    fn stage_names_read_naturally() {
        assert_eq!(TargetStage::Refitting.to_string(), "refitting");
        let err = TargetError {
            key: SampleKey::full(1),
            stage: TargetStage::Selecting,
            source: TrainError::DegenerateLabels {
                positives: 1,
                negatives: 9,
            },
        };
        assert!(err.to_string().starts_with("Target 1_full failed while selecting"));
    }

    #[test]
    fn floats_are_joined_with_commas() {
        let values = array![1.0, 0.0, 0.25];
        assert_eq!(join_floats(values.iter()), "1.0,0.0,0.25");
    }
}

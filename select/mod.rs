//! # Feature-Selection Fan-Out
//!
//! One task per `(sample key, imputation kind)`. Each task slices the imputed
//! training matrix to the key's rows, asks a [`FeatureSelector`] for a column
//! subset per model family and writes `<key>-<mImp|rImp>.txt`:
//!
//! ```text
//! lr:3,17,4
//! sv:3
//! rf:
//! ```
//!
//! An empty list reads back as `[0]`. Tasks share only read-only inputs and each
//! writes its own file, so they run on a rayon pool with failures collected per
//! task instead of aborting the whole fan-out.

use crate::impute::imputed_stem;
use crate::impute::regression::pearson_correlation;
use crate::samples::io::load_sample_index;
use crate::samples::{self, SampleIndexError, SampleSlice};
use crate::shared::files::{self, FileError, io_error};
use crate::types::{
    Combination, ImputationKind, LabeledMatrix, ModelFamily, SampleKey, TrainingMode,
};
use indicatif::{ProgressBar, ProgressDrawTarget, ProgressStyle};
use itertools::Itertools;
use ndarray::{Array2, ArrayView1, ArrayView2, Axis};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::io::{IsTerminal, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum SelectionError {
    #[error(transparent)]
    File(#[from] FileError),
    #[error(transparent)]
    Samples(#[from] SampleIndexError),
    #[error("Selection file '{}' line {line}: {message}", .path.display())]
    Malformed {
        path: PathBuf,
        line: usize,
        message: String,
    },
    #[error("No feature selection for '{combination}' in '{}'", .path.display())]
    MissingSelection {
        combination: Combination,
        path: PathBuf,
    },
    #[error("Selected column {column} is out of range for a matrix with {ncols} columns")]
    ColumnOutOfRange { column: usize, ncols: usize },
    #[error("Failed to build the selection thread pool: {0}")]
    Pool(#[from] rayon::ThreadPoolBuildError),
}

/// Picks a column subset for one model family.
pub trait FeatureSelector: Send + Sync {
    fn select(
        &self,
        data: ArrayView2<f64>,
        labels: ArrayView1<f64>,
        family: ModelFamily,
    ) -> Vec<usize>;
}

/// Keeps the columns most correlated (in absolute value) with the label.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CorrelationSelector {
    pub max_features: usize,
}

impl Default for CorrelationSelector {
    fn default() -> Self {
        Self { max_features: 10 }
    }
}

impl FeatureSelector for CorrelationSelector {
    fn select(
        &self,
        data: ArrayView2<f64>,
        labels: ArrayView1<f64>,
        _family: ModelFamily,
    ) -> Vec<usize> {
        let mut ranked: Vec<(usize, f64)> = data
            .axis_iter(Axis(1))
            .enumerate()
            .filter_map(|(c, column)| pearson_correlation(column, labels).map(|r| (c, r.abs())))
            .collect();
        ranked.sort_by(|a, b| b.1.total_cmp(&a.1).then(a.0.cmp(&b.0)));
        ranked
            .into_iter()
            .take(self.max_features)
            .map(|(c, _)| c)
            .collect()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SelectionConfig {
    /// Stem of the assembled training matrix; `_mImp` / `_rImp` are appended.
    pub train_stem: PathBuf,
    pub feature_samples: PathBuf,
    pub target_samples: PathBuf,
    /// Comma-delimited target matrix (target-order rows, one column per target).
    pub target_matrix_file: PathBuf,
    /// Directory receiving the per-key selection files.
    pub storage_dir: PathBuf,
    #[serde(default)]
    pub mode: TrainingMode,
    #[serde(default)]
    pub selector: CorrelationSelector,
    /// Worker threads; defaults to the processor count.
    #[serde(default)]
    pub threads: Option<usize>,
}

/// `<dir>/<t>_<fold>-<mImp|rImp>.txt`
pub fn selection_file_path(dir: &Path, key: &SampleKey, kind: ImputationKind) -> PathBuf {
    dir.join(format!("{}-{}.txt", key.stem(), kind.artifact_tag()))
}

pub fn write_selection_file(
    path: &Path,
    selections: &BTreeMap<ModelFamily, Vec<usize>>,
) -> Result<(), FileError> {
    let mut writer = files::create_text_file(path)?;
    let mut write = || -> std::io::Result<()> {
        for (family, columns) in selections {
            writeln!(writer, "{}:{}", family.code(), columns.iter().join(","))?;
        }
        writer.flush()
    };
    write().map_err(io_error(path))
}

/// Reads one selection file. Families listed with no columns fall back to `[0]`.
pub fn read_selection_file(path: &Path) -> Result<BTreeMap<ModelFamily, Vec<usize>>, SelectionError> {
    let malformed = |line: usize, message: String| SelectionError::Malformed {
        path: path.to_path_buf(),
        line,
        message,
    };
    let mut selections = BTreeMap::new();
    for (idx, row) in files::load_list(path)?.iter().enumerate() {
        let line = idx + 1;
        let (family, indices) = row
            .split_once(':')
            .ok_or_else(|| malformed(line, format!("expected 'model_type:indices', found '{row}'")))?;
        let family: ModelFamily = family
            .trim()
            .parse()
            .map_err(|e: crate::types::KeyParseError| malformed(line, e.to_string()))?;
        let indices = indices.trim();
        let columns = if indices.is_empty() {
            vec![0]
        } else {
            indices
                .split(',')
                .map(|v| {
                    v.trim()
                        .parse::<usize>()
                        .map_err(|_| malformed(line, format!("'{v}' is not a column index")))
                })
                .collect::<Result<Vec<_>, _>>()?
        };
        selections.insert(family, columns);
    }
    Ok(selections)
}

/// Loads both files for `key` into one map keyed by combination.
pub fn load_selections(
    dir: &Path,
    key: &SampleKey,
) -> Result<HashMap<Combination, Vec<usize>>, SelectionError> {
    let mut combined = HashMap::with_capacity(Combination::ENUMERATION.len());
    for kind in ImputationKind::ALL {
        for (family, columns) in read_selection_file(&selection_file_path(dir, key, kind))? {
            combined.insert(Combination::new(family, kind), columns);
        }
    }
    Ok(combined)
}

/// One unit of the fan-out.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SelectionTask {
    pub key: SampleKey,
    pub imputation: ImputationKind,
}

impl fmt::Display for SelectionTask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.key, self.imputation)
    }
}

/// Per-task outcomes of a fan-out; one failure never hides the others.
#[derive(Debug, Default)]
pub struct FanOutReport {
    pub succeeded: Vec<(SelectionTask, PathBuf)>,
    pub failed: Vec<(SelectionTask, SelectionError)>,
}

impl FanOutReport {
    pub fn is_complete(&self) -> bool {
        self.failed.is_empty()
    }
}

/// The read-only inputs every task shares.
pub struct SelectionInputs<'a> {
    pub slices: &'a [SampleSlice],
    pub imputed: &'a HashMap<ImputationKind, LabeledMatrix>,
    pub targets: ArrayView2<'a, f64>,
}

fn select_for_task(
    task: &SelectionTask,
    slice: &SampleSlice,
    inputs: &SelectionInputs<'_>,
    selector: &dyn FeatureSelector,
    storage_dir: &Path,
) -> Result<PathBuf, SelectionError> {
    let matrix = inputs
        .imputed
        .get(&task.imputation)
        .ok_or_else(|| FileError::Decode {
            path: storage_dir.to_path_buf(),
            message: format!("no {} training matrix loaded", task.imputation),
        })?;
    let data: Array2<f64> = samples::gather_rows(matrix.data(), &slice.feature_rows)?;
    let labels = samples::gather_labels(inputs.targets, &slice.target_rows, task.key.target_index)?;

    let selections: BTreeMap<ModelFamily, Vec<usize>> = ModelFamily::ALL
        .iter()
        .map(|&family| (family, selector.select(data.view(), labels.view(), family)))
        .collect();
    let path = selection_file_path(storage_dir, &task.key, task.imputation);
    write_selection_file(&path, &selections)?;
    Ok(path)
}

/// Runs every task on a dedicated pool and collects the outcomes.
pub fn fan_out(
    inputs: &SelectionInputs<'_>,
    selector: &dyn FeatureSelector,
    storage_dir: &Path,
    threads: usize,
) -> Result<FanOutReport, SelectionError> {
    let tasks: Vec<(SelectionTask, &SampleSlice)> = inputs
        .slices
        .iter()
        .flat_map(|slice| {
            ImputationKind::ALL.into_iter().map(move |imputation| {
                (
                    SelectionTask {
                        key: slice.key,
                        imputation,
                    },
                    slice,
                )
            })
        })
        .collect();

    let pool = rayon::ThreadPoolBuilder::new()
        .num_threads(threads.max(1))
        .build()?;
    let progress = FanOutProgress::new(tasks.len());

    let outcomes: Vec<(SelectionTask, Result<PathBuf, SelectionError>)> = pool.install(|| {
        tasks
            .par_iter()
            .map(|(task, slice)| {
                let outcome = select_for_task(task, slice, inputs, selector, storage_dir);
                progress.record(&outcome);
                (*task, outcome)
            })
            .collect()
    });
    progress.bar.finish_and_clear();

    let mut report = FanOutReport::default();
    for (task, outcome) in outcomes {
        match outcome {
            Ok(path) => report.succeeded.push((task, path)),
            Err(e) => {
                log::error!("Feature selection for {task} failed: {e}");
                report.failed.push((task, e));
            }
        }
    }
    log::info!(
        "Feature selection: {} tasks succeeded, {} failed",
        report.succeeded.len(),
        report.failed.len()
    );
    Ok(report)
}

/// Loads the imputed training matrices and sample indices, then fans out.
pub fn run_feature_selection(
    config: &SelectionConfig,
    selector: &dyn FeatureSelector,
) -> Result<FanOutReport, SelectionError> {
    let mut imputed = HashMap::new();
    for kind in ImputationKind::ALL {
        let matrix = files::load_matrix_artifact(&imputed_stem(&config.train_stem, kind))?;
        log::info!("{kind} training data loaded: {:?}", matrix.shape());
        imputed.insert(kind, matrix);
    }
    let targets = files::read_numeric_table(&config.target_matrix_file, b',')?;
    let features = load_sample_index(&config.feature_samples)?;
    let target_rows = load_sample_index(&config.target_samples)?;
    let slices = samples::plan_slices(&features, &target_rows, config.mode)?;
    log::info!(
        "Selecting features for {} sample keys ({:?} mode)",
        slices.len(),
        config.mode
    );

    let inputs = SelectionInputs {
        slices: &slices,
        imputed: &imputed,
        targets: targets.view(),
    };
    let threads = config.threads.unwrap_or_else(num_cpus::get);
    fan_out(&inputs, selector, &config.storage_dir, threads)
}

/// Tasks finished out of the total, with a running count of failed tasks.
struct FanOutProgress {
    bar: ProgressBar,
    failed: AtomicUsize,
}

impl FanOutProgress {
    fn new(tasks: usize) -> Self {
        let draw_target = if std::io::stderr().is_terminal() {
            ProgressDrawTarget::stderr_with_hz(4)
        } else {
            ProgressDrawTarget::hidden()
        };
        let bar = ProgressBar::with_draw_target(Some(tasks as u64), draw_target);
        if let Ok(style) =
            ProgressStyle::with_template("Feature selection {wide_bar} {pos}/{len} tasks ({msg})")
        {
            bar.set_style(style.progress_chars("=> "));
        }
        bar.set_message("0 failed");
        Self {
            bar,
            failed: AtomicUsize::new(0),
        }
    }

    fn record<T, E>(&self, outcome: &Result<T, E>) {
        if outcome.is_err() {
            let failed = self.failed.fetch_add(1, Ordering::Relaxed) + 1;
            self.bar.set_message(format!("{failed} failed"));
        }
        self.bar.inc(1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::FoldType;
    use ndarray::{Array1, array};
    use std::fs;
    use tempfile::tempdir;

    #[test]
    fn selection_files_parse_with_empty_fallback() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("3_full-mImp.txt");
        fs::write(&path, "lr:3,17,4\nsv:\nrf:0\n").unwrap();
        let selections = read_selection_file(&path).unwrap();
        assert_eq!(selections[&ModelFamily::LogisticRegression], vec![3, 17, 4]);
        assert_eq!(selections[&ModelFamily::SupportVector], vec![0]);
        assert_eq!(selections[&ModelFamily::RandomForest], vec![0]);
    }

    #[test]
    fn unknown_model_types_are_rejected() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("bad.txt");
        fs::write(&path, "lr:1\nknn:2\n").unwrap();
        match read_selection_file(&path) {
            Err(SelectionError::Malformed { line, .. }) => assert_eq!(line, 2),
            other => panic!("expected Malformed, got {other:?}"),
        }
    }

    #[test]
    fn both_imputation_files_merge_into_combinations() {
        let dir = tempdir().unwrap();
        let key = SampleKey {
            target_index: 2,
            fold_type: FoldType::Fold(3),
        };
        let mut m = BTreeMap::new();
        m.insert(ModelFamily::LogisticRegression, vec![1, 2]);
        let mut r = BTreeMap::new();
        r.insert(ModelFamily::RandomForest, vec![]);
        write_selection_file(&selection_file_path(dir.path(), &key, ImputationKind::Median), &m).unwrap();
        write_selection_file(&selection_file_path(dir.path(), &key, ImputationKind::Regression), &r).unwrap();
        assert!(dir.path().join("2_3-mImp.txt").exists());

        let combined = load_selections(dir.path(), &key).unwrap();
        assert_eq!(combined[&"lr-m".parse::<Combination>().unwrap()], vec![1, 2]);
        assert_eq!(combined[&"rf-r".parse::<Combination>().unwrap()], vec![0]);
        assert_eq!(combined.len(), 2);
    }

    #[test]
    fn correlation_selector_ranks_by_absolute_correlation() {
        let labels = array![0.0, 1.0, 0.0, 1.0, 1.0, 0.0];
        let data = array![
            [5.0, 0.1, 9.0, 1.0],
            [5.0, 0.9, 1.0, 2.0],
            [5.0, 0.2, 8.0, 1.0],
            [5.0, 0.8, 2.0, 1.0],
            [5.0, 0.7, 1.5, 2.0],
            [5.0, 0.3, 9.5, 2.0],
        ];
        let selector = CorrelationSelector { max_features: 2 };
        let picked = selector.select(data.view(), labels.view(), ModelFamily::SupportVector);
        // The constant column 0 has no defined correlation and is never picked.
        assert_eq!(picked.len(), 2);
        assert!(picked.contains(&1) && picked.contains(&2));
    }

    struct FailingOnTarget(usize);

    impl FeatureSelector for FailingOnTarget {
        fn select(&self, data: ArrayView2<f64>, _: ArrayView1<f64>, _: ModelFamily) -> Vec<usize> {
            (0..data.ncols().min(self.0)).collect()
        }
    }

    #[test]
    fn progress_counts_tasks_and_failures() {
        let progress = FanOutProgress::new(3);
        assert_eq!(progress.bar.length(), Some(3));
        assert_eq!(progress.bar.message(), "0 failed");
        progress.record::<(), ()>(&Ok(()));
        progress.record::<(), ()>(&Err(()));
        progress.record::<(), ()>(&Err(()));
        assert_eq!(progress.bar.position(), 3);
        assert_eq!(progress.bar.message(), "2 failed");
    }

    #[test]
    fn fan_out_collects_failures_per_task() {
        let dir = tempdir().unwrap();
        let matrix = LabeledMatrix::new(
            array![[1.0, 2.0], [2.0, 1.0], [3.0, 5.0], [4.0, 3.0]],
            vec!["a".into(), "b".into()],
        )
        .unwrap();
        let mut imputed = HashMap::new();
        imputed.insert(ImputationKind::Median, matrix.clone());
        imputed.insert(ImputationKind::Regression, matrix);
        let targets = Array1::from(vec![0.0, 1.0, 0.0, 1.0]).insert_axis(Axis(1));

        let good = SampleSlice {
            key: SampleKey::full(0),
            feature_rows: vec![0, 1, 2, 3],
            target_rows: vec![0, 1, 2, 3],
            held_out_feature_rows: vec![],
            held_out_target_rows: vec![],
        };
        let bad = SampleSlice {
            key: SampleKey::full(1),
            ..good.clone()
        };
        let slices = vec![good, bad];
        let inputs = SelectionInputs {
            slices: &slices,
            imputed: &imputed,
            targets: targets.view(),
        };
        let report = fan_out(&inputs, &FailingOnTarget(1), dir.path(), 2).unwrap();

        // Target 1 has no column in the target matrix, so both of its tasks fail.
        assert_eq!(report.succeeded.len(), 2);
        assert_eq!(report.failed.len(), 2);
        assert!(!report.is_complete());
        assert!(report.failed.iter().all(|(task, _)| task.key.target_index == 1));
        let written = read_selection_file(&dir.path().join("0_full-rImp.txt")).unwrap();
        assert_eq!(written.len(), 3);
        assert_eq!(written[&ModelFamily::RandomForest], vec![0]);
    }
}

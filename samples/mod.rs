//! # Sample Indexing
//!
//! The feature matrix, the target matrix and the item-presence table each order
//! cases independently. This stage decides, per target, which cases carry a
//! label and records where each of them lives in all three spaces:
//!
//! - the row in the feature matrix (case-order space),
//! - the row in the target matrix (target-order space),
//! - the case id itself.
//!
//! Every target gets a `full` record and five fold records. The `i`-th entry of
//! each list refers to the same case in all three output files.

pub mod io;

use crate::shared::files::{self, FileError};
use crate::types::{FoldType, NUM_FOLDS, SampleKey, TrainingMode};
use ndarray::{Array1, Array2, ArrayView2, Axis};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum SampleIndexError {
    #[error(transparent)]
    File(#[from] FileError),
    #[error("Failed to read item-presence table '{}': {source}", .path.display())]
    Csv {
        path: PathBuf,
        #[source]
        source: csv::Error,
    },
    #[error("Item-presence table '{}' has no header row.", .0.display())]
    EmptyPresenceTable(PathBuf),
    #[error("Target '{0}' does not appear in the item-presence header.")]
    MissingTarget(String),
    #[error("Item-presence line {line}: '{value}' is not an integer presence flag.")]
    InvalidPresenceFlag { line: u64, value: String },
    #[error("Item-presence line {line} has {found} fields; at least {required} are needed.")]
    ShortPresenceRow {
        line: u64,
        found: usize,
        required: usize,
    },
    #[error("Case '{0}' is present in the feature case order but not in the target case order.")]
    CaseNotInTargetOrder(String),
    #[error("Stratified folds need the target matrix, but none was configured.")]
    MissingLabels,
    #[error("Target matrix has no entry at row {row}, column {column}.")]
    LabelOutOfRange { row: usize, column: usize },
    #[error("Sample index '{}' line {line}: {message}", .path.display())]
    Malformed {
        path: PathBuf,
        line: usize,
        message: String,
    },
    #[error("Fold records for target {0} have no matching 'full' record.")]
    MissingFullRecord(usize),
    #[error("Feature-row and target-row indices disagree for key {0}.")]
    IndexMismatch(SampleKey),
    #[error("Row index {row} is out of range for a matrix with {nrows} rows.")]
    RowOutOfRange { row: usize, nrows: usize },
}

/// How present cases are dealt into the five folds.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FoldAssignment {
    /// Arrival order modulo five, regardless of label.
    #[default]
    RoundRobin,
    /// One arrival counter per label class, so each fold sees every class.
    Stratified,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SampleIndexConfig {
    /// Case ids in feature-matrix row order.
    pub case_order_rows_file: PathBuf,
    /// Case ids in target-matrix row order.
    pub target_case_rows_file: PathBuf,
    /// Target names in target-matrix column order.
    pub target_feature_columns_file: PathBuf,
    pub item_present_file: PathBuf,
    pub feature_samples_out: PathBuf,
    pub target_samples_out: PathBuf,
    pub feat_targ_samples_out: PathBuf,
    /// Written into the first field of feature-row records.
    pub feature_matrix_name: String,
    /// Written into the first field of target-row and case-id records.
    pub target_matrix_name: String,
    #[serde(default)]
    pub fold_assignment: FoldAssignment,
    /// Comma-delimited target matrix; required for stratified folds.
    #[serde(default)]
    pub target_matrix_file: Option<PathBuf>,
}

/// The item-presence table: a header naming target columns, then one row per case.
#[derive(Debug, Clone)]
pub struct ItemPresence {
    columns: HashMap<String, usize>,
    rows: Vec<(u64, Vec<String>)>,
}

/// Zero-based column holding the case id in every data row.
pub const CASE_ID_COLUMN: usize = 1;

impl ItemPresence {
    pub fn load(path: &Path) -> Result<Self, SampleIndexError> {
        let csv_error = |source| SampleIndexError::Csv {
            path: path.to_path_buf(),
            source,
        };
        let mut reader = csv::ReaderBuilder::new()
            .has_headers(false)
            .flexible(true)
            .from_path(path)
            .map_err(csv_error)?;
        let mut records = reader.records();
        let header = records
            .next()
            .ok_or_else(|| SampleIndexError::EmptyPresenceTable(path.to_path_buf()))?
            .map_err(csv_error)?;
        let header: Vec<String> = header.iter().map(|f| f.trim().to_string()).collect();

        let mut rows = Vec::new();
        for record in records {
            let record = record.map_err(csv_error)?;
            let line = record.position().map_or(0, |p| p.line());
            rows.push((line, record.iter().map(|f| f.trim().to_string()).collect()));
        }
        Ok(Self::from_parts(header, rows))
    }

    /// Builds a table from an already-split header and `(line, fields)` rows.
    pub fn from_parts(header: Vec<String>, rows: Vec<(u64, Vec<String>)>) -> Self {
        let mut columns = HashMap::with_capacity(header.len());
        for (idx, name) in header.into_iter().enumerate() {
            columns.entry(name).or_insert(idx);
        }
        Self { columns, rows }
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Case ids whose flag for `target` is a non-zero integer.
    pub fn present_cases(&self, target: &str) -> Result<HashSet<&str>, SampleIndexError> {
        let column = *self
            .columns
            .get(target)
            .ok_or_else(|| SampleIndexError::MissingTarget(target.to_string()))?;
        let required = column.max(CASE_ID_COLUMN) + 1;

        let mut present = HashSet::new();
        for (line, fields) in &self.rows {
            if fields.len() < required {
                return Err(SampleIndexError::ShortPresenceRow {
                    line: *line,
                    found: fields.len(),
                    required,
                });
            }
            let flag: i64 =
                fields[column]
                    .parse()
                    .map_err(|_| SampleIndexError::InvalidPresenceFlag {
                        line: *line,
                        value: fields[column].clone(),
                    })?;
            if flag != 0 {
                present.insert(fields[CASE_ID_COLUMN].as_str());
            }
        }
        Ok(present)
    }
}

/// One record of the three parallel index files.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SampleRecord {
    pub key: SampleKey,
    pub target_name: String,
    pub feature_rows: Vec<usize>,
    pub target_rows: Vec<usize>,
    pub case_ids: Vec<String>,
}

impl SampleRecord {
    fn empty(key: SampleKey, target_name: &str) -> Self {
        Self {
            key,
            target_name: target_name.to_string(),
            feature_rows: Vec::new(),
            target_rows: Vec::new(),
            case_ids: Vec::new(),
        }
    }

    fn push(&mut self, feature_row: usize, target_row: usize, case_id: &str) {
        self.feature_rows.push(feature_row);
        self.target_rows.push(target_row);
        self.case_ids.push(case_id.to_string());
    }
}

/// Everything the indexer reads, already loaded.
#[derive(Debug, Clone)]
pub struct SampleIndexInputs {
    pub case_order: Vec<String>,
    pub target_case_order: Vec<String>,
    pub target_names: Vec<String>,
    pub presence: ItemPresence,
}

/// Computes the `full` and fold records for every target, in target order.
///
/// `labels` is the target matrix in target-order rows; it is only read for
/// [`FoldAssignment::Stratified`].
pub fn build_sample_index(
    inputs: &SampleIndexInputs,
    assignment: FoldAssignment,
    labels: Option<ArrayView2<f64>>,
) -> Result<Vec<SampleRecord>, SampleIndexError> {
    if assignment == FoldAssignment::Stratified && labels.is_none() {
        return Err(SampleIndexError::MissingLabels);
    }

    let mut target_row_of: HashMap<&str, usize> =
        HashMap::with_capacity(inputs.target_case_order.len());
    for (row, case_id) in inputs.target_case_order.iter().enumerate() {
        target_row_of.entry(case_id.as_str()).or_insert(row);
    }

    let mut records = Vec::with_capacity(inputs.target_names.len() * (NUM_FOLDS + 1));
    for (target_index, target_name) in inputs.target_names.iter().enumerate() {
        let present = inputs.presence.present_cases(target_name)?;

        let mut full = SampleRecord::empty(SampleKey::full(target_index), target_name);
        let mut folds: Vec<SampleRecord> = (0..NUM_FOLDS as u8)
            .map(|f| {
                let key = SampleKey {
                    target_index,
                    fold_type: FoldType::Fold(f),
                };
                SampleRecord::empty(key, target_name)
            })
            .collect();
        let mut counters: HashMap<u64, usize> = HashMap::new();
        let mut arrival = 0usize;

        for (feature_row, case_id) in inputs.case_order.iter().enumerate() {
            if !present.contains(case_id.as_str()) {
                continue;
            }
            let target_row = *target_row_of
                .get(case_id.as_str())
                .ok_or_else(|| SampleIndexError::CaseNotInTargetOrder(case_id.clone()))?;

            full.push(feature_row, target_row, case_id);

            let slot = match (assignment, labels) {
                (FoldAssignment::Stratified, Some(labels)) => {
                    let label = labels.get((target_row, target_index)).ok_or(
                        SampleIndexError::LabelOutOfRange {
                            row: target_row,
                            column: target_index,
                        },
                    )?;
                    let counter = counters.entry(label.to_bits()).or_insert(0);
                    let slot = *counter;
                    *counter += 1;
                    slot
                }
                _ => {
                    let slot = arrival;
                    arrival += 1;
                    slot
                }
            };
            folds[slot % NUM_FOLDS].push(feature_row, target_row, case_id);
        }

        log::debug!(
            "Target {target_index} ('{target_name}'): {} present cases, fold sizes {:?}",
            full.feature_rows.len(),
            folds.iter().map(|f| f.feature_rows.len()).collect::<Vec<_>>()
        );
        records.push(full);
        records.extend(folds);
    }
    Ok(records)
}

/// Loads the inputs named by `config`, builds the index and writes all three files.
pub fn run_sample_indexing(
    config: &SampleIndexConfig,
) -> Result<Vec<SampleRecord>, SampleIndexError> {
    let inputs = SampleIndexInputs {
        case_order: files::load_list(&config.case_order_rows_file)?,
        target_case_order: files::load_list(&config.target_case_rows_file)?,
        target_names: files::load_list(&config.target_feature_columns_file)?,
        presence: ItemPresence::load(&config.item_present_file)?,
    };
    log::info!(
        "Indexing {} targets over {} feature cases, {} target cases, {} presence rows",
        inputs.target_names.len(),
        inputs.case_order.len(),
        inputs.target_case_order.len(),
        inputs.presence.len()
    );

    let labels: Option<Array2<f64>> = match config.fold_assignment {
        FoldAssignment::Stratified => {
            let path = config
                .target_matrix_file
                .as_ref()
                .ok_or(SampleIndexError::MissingLabels)?;
            Some(files::read_numeric_table(path, b',')?)
        }
        FoldAssignment::RoundRobin => None,
    };

    let records = build_sample_index(
        &inputs,
        config.fold_assignment,
        labels.as_ref().map(|l| l.view()),
    )?;
    io::write_sample_files(config, &records)?;
    log::info!(
        "Wrote {} sample records to '{}'",
        records.len(),
        config.feature_samples_out.display()
    );
    Ok(records)
}

/// The rows one selection or training task works on, in both index spaces.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SampleSlice {
    pub key: SampleKey,
    pub feature_rows: Vec<usize>,
    pub target_rows: Vec<usize>,
    /// Rows held out for scoring; empty for `full` keys.
    pub held_out_feature_rows: Vec<usize>,
    pub held_out_target_rows: Vec<usize>,
}

/// Turns the loaded feature-row and target-row indices into per-key slices.
///
/// A `full` key trains on its own rows. A fold key trains on the full rows minus
/// the fold and holds the fold out.
pub fn plan_slices(
    features: &BTreeMap<SampleKey, Vec<usize>>,
    targets: &BTreeMap<SampleKey, Vec<usize>>,
    mode: TrainingMode,
) -> Result<Vec<SampleSlice>, SampleIndexError> {
    let inverse = io::inverse_samples(features)?;
    let mut slices = Vec::new();
    for (key, fold_rows) in features.iter().filter(|(k, _)| mode.includes(k)) {
        let full_key = SampleKey::full(key.target_index);
        let full_features = features
            .get(&full_key)
            .ok_or(SampleIndexError::MissingFullRecord(key.target_index))?;
        let full_targets = targets
            .get(&full_key)
            .ok_or(SampleIndexError::MissingFullRecord(key.target_index))?;
        let aligned = targets.get(key).map(Vec::len) == Some(fold_rows.len());
        if !aligned || full_features.len() != full_targets.len() {
            return Err(SampleIndexError::IndexMismatch(*key));
        }
        let target_of: HashMap<usize, usize> = full_features
            .iter()
            .copied()
            .zip(full_targets.iter().copied())
            .collect();
        let to_target = |rows: &[usize]| -> Result<Vec<usize>, SampleIndexError> {
            rows.iter()
                .map(|r| {
                    target_of
                        .get(r)
                        .copied()
                        .ok_or(SampleIndexError::IndexMismatch(*key))
                })
                .collect()
        };

        let feature_rows = inverse
            .get(key)
            .cloned()
            .ok_or(SampleIndexError::IndexMismatch(*key))?;
        let target_rows = to_target(&feature_rows)?;
        let (held_out_feature_rows, held_out_target_rows) = if key.fold_type.is_full() {
            (Vec::new(), Vec::new())
        } else {
            (fold_rows.clone(), to_target(fold_rows)?)
        };
        slices.push(SampleSlice {
            key: *key,
            feature_rows,
            target_rows,
            held_out_feature_rows,
            held_out_target_rows,
        });
    }
    Ok(slices)
}

/// Copies the given rows out of `data`, checking every index first.
pub fn gather_rows(data: ArrayView2<f64>, rows: &[usize]) -> Result<Array2<f64>, SampleIndexError> {
    if let Some(&row) = rows.iter().find(|&&r| r >= data.nrows()) {
        return Err(SampleIndexError::RowOutOfRange {
            row,
            nrows: data.nrows(),
        });
    }
    Ok(data.select(Axis(0), rows))
}

/// Reads one target column at the given target-matrix rows.
pub fn gather_labels(
    targets: ArrayView2<f64>,
    rows: &[usize],
    column: usize,
) -> Result<Array1<f64>, SampleIndexError> {
    rows.iter()
        .map(|&row| {
            targets
                .get((row, column))
                .copied()
                .ok_or(SampleIndexError::LabelOutOfRange { row, column })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    fn strings(items: &[&str]) -> Vec<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    fn presence(header: &[&str], rows: &[&[&str]]) -> ItemPresence {
        ItemPresence::from_parts(
            strings(header),
            rows.iter()
                .enumerate()
                .map(|(i, r)| (i as u64 + 2, strings(r)))
                .collect(),
        )
    }

    fn fever_inputs() -> SampleIndexInputs {
        SampleIndexInputs {
            case_order: strings(&["A", "B", "C", "D"]),
            target_case_order: strings(&["D", "C", "B", "A"]),
            target_names: strings(&["fever"]),
            presence: presence(
                &["row", "case_id", "fever"],
                &[
                    &["0", "A", "1"],
                    &["1", "B", "0"],
                    &["2", "C", "1"],
                    &["3", "D", "2"],
                ],
            ),
        }
    }

    #[test]
    fn full_record_follows_feature_case_order() {
        let records =
            build_sample_index(&fever_inputs(), FoldAssignment::RoundRobin, None).unwrap();
        assert_eq!(records.len(), NUM_FOLDS + 1);
        let full = &records[0];
        assert_eq!(full.key, SampleKey::full(0));
        assert_eq!(full.feature_rows, vec![0, 2, 3]);
        assert_eq!(full.target_rows, vec![3, 1, 0]);
        assert_eq!(full.case_ids, strings(&["A", "C", "D"]));
    }

    #[test]
    fn round_robin_folds_partition_the_full_record() {
        let case_order: Vec<String> = (0..13).map(|i| format!("c{i}")).collect();
        let rows: Vec<Vec<String>> = case_order
            .iter()
            .enumerate()
            .map(|(i, c)| vec![i.to_string(), c.clone(), ((i % 3 != 0) as u8).to_string()])
            .collect();
        let inputs = SampleIndexInputs {
            target_case_order: case_order.iter().rev().cloned().collect(),
            case_order,
            target_names: strings(&["t"]),
            presence: ItemPresence::from_parts(
                strings(&["row", "case_id", "t"]),
                rows.into_iter().enumerate().map(|(i, r)| (i as u64, r)).collect(),
            ),
        };
        let records = build_sample_index(&inputs, FoldAssignment::RoundRobin, None).unwrap();
        let full = &records[0];

        let mut union: Vec<usize> = records[1..]
            .iter()
            .flat_map(|r| r.feature_rows.iter().copied())
            .collect();
        union.sort_unstable();
        assert_eq!(union, full.feature_rows);

        // The second present case lands in fold 1, the sixth wraps back to fold 0.
        assert_eq!(records[2].feature_rows[0], full.feature_rows[1]);
        assert_eq!(records[1].feature_rows[1], full.feature_rows[5]);

        for record in &records {
            assert_eq!(record.feature_rows.len(), record.target_rows.len());
            assert_eq!(record.feature_rows.len(), record.case_ids.len());
            for (row, case_id) in record.feature_rows.iter().zip(&record.case_ids) {
                assert_eq!(&inputs.case_order[*row], case_id);
            }
            for (row, case_id) in record.target_rows.iter().zip(&record.case_ids) {
                assert_eq!(&inputs.target_case_order[*row], case_id);
            }
        }
    }

    #[test]
    fn stratified_folds_deal_each_class_separately() {
        let case_order: Vec<String> = (0..10).map(|i| format!("c{i}")).collect();
        let rows: Vec<Vec<String>> = case_order
            .iter()
            .enumerate()
            .map(|(i, c)| vec![i.to_string(), c.clone(), "1".to_string()])
            .collect();
        let inputs = SampleIndexInputs {
            target_case_order: case_order.clone(),
            case_order,
            target_names: strings(&["t"]),
            presence: ItemPresence::from_parts(
                strings(&["row", "case_id", "t"]),
                rows.into_iter().enumerate().map(|(i, r)| (i as u64, r)).collect(),
            ),
        };
        // Five positives first, then five negatives.
        let labels = array![[1.0], [1.0], [1.0], [1.0], [1.0], [0.0], [0.0], [0.0], [0.0], [0.0]];
        let records =
            build_sample_index(&inputs, FoldAssignment::Stratified, Some(labels.view())).unwrap();
        for fold in &records[1..] {
            let classes: Vec<f64> = fold.target_rows.iter().map(|&r| labels[[r, 0]]).collect();
            assert_eq!(classes.len(), 2);
            assert!(classes.contains(&1.0) && classes.contains(&0.0));
        }

        assert!(matches!(
            build_sample_index(&inputs, FoldAssignment::Stratified, None),
            Err(SampleIndexError::MissingLabels)
        ));
    }

    #[test]
    fn lookup_failures_are_fatal() {
        let mut inputs = fever_inputs();
        inputs.target_names = strings(&["sepsis"]);
        assert!(matches!(
            build_sample_index(&inputs, FoldAssignment::RoundRobin, None),
            Err(SampleIndexError::MissingTarget(name)) if name == "sepsis"
        ));

        let mut inputs = fever_inputs();
        inputs.target_case_order = strings(&["A", "B", "C"]);
        assert!(matches!(
            build_sample_index(&inputs, FoldAssignment::RoundRobin, None),
            Err(SampleIndexError::CaseNotInTargetOrder(case)) if case == "D"
        ));
    }

    #[test]
    fn cross_fold_slices_hold_out_each_fold() {
        let records = build_sample_index(&fever_inputs(), FoldAssignment::RoundRobin, None).unwrap();
        let features: BTreeMap<SampleKey, Vec<usize>> =
            records.iter().map(|r| (r.key, r.feature_rows.clone())).collect();
        let targets: BTreeMap<SampleKey, Vec<usize>> =
            records.iter().map(|r| (r.key, r.target_rows.clone())).collect();

        let eval_only = plan_slices(&features, &targets, TrainingMode::EvaluationSet).unwrap();
        assert_eq!(eval_only.len(), 1);
        assert!(eval_only[0].held_out_feature_rows.is_empty());

        let slices = plan_slices(&features, &targets, TrainingMode::CrossFold).unwrap();
        assert_eq!(slices.len(), NUM_FOLDS + 1);
        // Fold 1 holds case C (feature row 2, target row 1).
        let fold1 = &slices[2];
        assert_eq!(fold1.key.fold_type, FoldType::Fold(1));
        assert_eq!(fold1.held_out_feature_rows, vec![2]);
        assert_eq!(fold1.held_out_target_rows, vec![1]);
        assert_eq!(fold1.feature_rows, vec![0, 3]);
        assert_eq!(fold1.target_rows, vec![3, 0]);
    }

    #[test]
    fn gathering_checks_bounds() {
        let data = array![[1.0, 2.0], [3.0, 4.0]];
        assert_eq!(gather_rows(data.view(), &[1, 0]).unwrap(), array![[3.0, 4.0], [1.0, 2.0]]);
        assert!(matches!(
            gather_rows(data.view(), &[2]),
            Err(SampleIndexError::RowOutOfRange { row: 2, nrows: 2 })
        ));
        assert_eq!(gather_labels(data.view(), &[1, 0], 1).unwrap(), array![4.0, 2.0]);
        assert!(gather_labels(data.view(), &[0], 2).is_err());
    }

    #[test]
    fn presence_flags_must_be_integers() {
        let table = presence(&["row", "case_id", "fever"], &[&["0", "A", "yes"]]);
        assert!(matches!(
            table.present_cases("fever"),
            Err(SampleIndexError::InvalidPresenceFlag { line: 2, .. })
        ));
    }
}

//! # Matrix Assembly
//!
//! Merges the per-feature-type directories written by the feature-vector generator
//! into one dense matrix with a parallel name vector.
//!
//! Layout of a feature directory:
//!
//! ```text
//! <dir>/<type>_feature_files/*.csv      row-aligned numeric blocks
//! <dir>/<type>_feature_columns.txt      one column name per line
//! <dir>/<name>_features.txt             optional standalone feature
//! <dir>/<name>_feature_columns.txt
//! ```
//!
//! Each block is tagged with a [`PayloadKind`] that states how it joins the
//! matrix built so far: as extra columns for the same cases, or as a new block of
//! cases with the same columns. The tag is configured per feature type rather than
//! inferred from the array's shape.

use crate::shared::files::{self, FileError};
use crate::types::{LabeledMatrix, ShapeMismatch};
use ndarray::{Axis, concatenate};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// How a loaded block joins the matrix assembled so far.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PayloadKind {
    /// More columns for the same cases. Row counts must agree.
    #[default]
    SameCaseMoreColumns,
    /// A separate block of cases over the same columns. Column counts must agree.
    NewCaseBlock,
}

/// A loaded block together with its concatenation intent.
#[derive(Debug, Clone)]
pub struct Payload {
    pub kind: PayloadKind,
    pub block: LabeledMatrix,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeatureTypeSpec {
    pub name: String,
    #[serde(default)]
    pub layout: PayloadKind,
}

impl FeatureTypeSpec {
    pub fn columns(name: &str) -> Self {
        Self {
            name: name.to_string(),
            layout: PayloadKind::SameCaseMoreColumns,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AssembleConfig {
    pub feature_directory: PathBuf,
    /// Stem of the output artifact pair (`<stem>.bin`, `<stem>_names.bin`).
    pub output_stem: PathBuf,
    pub feature_types: Vec<FeatureTypeSpec>,
    #[serde(default)]
    pub additional_features: Vec<String>,
    /// Optional newline-delimited list of column names to subset and reorder onto.
    #[serde(default)]
    pub columns_to_match: Option<PathBuf>,
}

#[derive(Error, Debug)]
pub enum AssembleError {
    #[error(transparent)]
    File(#[from] FileError),
    #[error("No feature types were requested; at least one is required to fix the case set.")]
    NoFeatureTypes,
    #[error("Feature directory '{}' contains no files", .0.display())]
    EmptyFeatureDirectory(PathBuf),
    #[error(transparent)]
    Names(#[from] ShapeMismatch),
    #[error(
        "Cannot join '{source_name}' as {kind:?}: block has shape {found:?} but the matrix so far has shape {current:?}"
    )]
    IncompatibleBlock {
        source_name: String,
        kind: PayloadKind,
        found: (usize, usize),
        current: (usize, usize),
    },
    #[error("Requested column '{0}' does not exist in the assembled matrix")]
    UnmatchedColumn(String),
}

/// Builds the feature matrix described by `config` without writing anything.
pub fn assemble(config: &AssembleConfig) -> Result<LabeledMatrix, AssembleError> {
    if config.feature_types.is_empty() {
        return Err(AssembleError::NoFeatureTypes);
    }
    let dir = &config.feature_directory;

    let mut full: Option<LabeledMatrix> = None;
    for spec in &config.feature_types {
        log::info!("====== {} ======", spec.name);
        let loaded = load_feature_type(dir, spec)?;
        log::info!("loaded: {:?}", loaded.block.shape());
        full = Some(concat(full, loaded, &spec.name)?);
        if let Some(current) = &full {
            log::info!("concatenated: {:?}", current.shape());
        }
    }

    let mut full = full.ok_or(AssembleError::NoFeatureTypes)?;

    for name in &config.additional_features {
        log::info!("------ {name} ------");
        let payload = load_additional_feature(dir, name)?;
        log::info!("loaded: {:?}", payload.block.shape());
        full = concat(Some(full), payload, name)?;
        log::info!("concatenated: {:?}", full.shape());
    }
    if !config.additional_features.is_empty() {
        log::info!("additional features added: {:?}", full.shape());
    }

    if let Some(match_path) = &config.columns_to_match {
        let requested = files::load_list(match_path)?;
        full = match_columns(&full, &requested)?;
        log::info!("columns are matched: {:?}", full.shape());
    }

    log::info!("full: {:?}", full.shape());
    Ok(full)
}

/// Assembles and persists the matrix as `<output_stem>` / `<output_stem>_names`.
pub fn assemble_and_save(config: &AssembleConfig) -> Result<LabeledMatrix, AssembleError> {
    let matrix = assemble(config)?;
    files::save_matrix_artifact(&config.output_stem, &matrix)?;
    log::info!(
        "Saved assembled matrix {:?} to '{}'",
        matrix.shape(),
        config.output_stem.display()
    );
    Ok(matrix)
}

/// Reorders `matrix` onto `requested`. The first column carrying a name wins.
pub fn match_columns(
    matrix: &LabeledMatrix,
    requested: &[String],
) -> Result<LabeledMatrix, AssembleError> {
    let mut first_position: HashMap<&str, usize> = HashMap::with_capacity(matrix.ncols());
    for (idx, name) in matrix.names().iter().enumerate() {
        first_position.entry(name.as_str()).or_insert(idx);
    }
    let positions = requested
        .iter()
        .map(|name| {
            first_position
                .get(name.as_str())
                .copied()
                .ok_or_else(|| AssembleError::UnmatchedColumn(name.clone()))
        })
        .collect::<Result<Vec<_>, _>>()?;
    Ok(matrix.select_columns(&positions))
}

/// Joins `payload` onto the matrix assembled so far according to its tag.
fn concat(
    current: Option<LabeledMatrix>,
    payload: Payload,
    source_name: &str,
) -> Result<LabeledMatrix, AssembleError> {
    let Some(current) = current else {
        return Ok(payload.block);
    };
    let incompatible = |current: &LabeledMatrix, block: &LabeledMatrix| {
        AssembleError::IncompatibleBlock {
            source_name: source_name.to_string(),
            kind: payload.kind,
            found: block.shape(),
            current: current.shape(),
        }
    };

    match payload.kind {
        PayloadKind::SameCaseMoreColumns => {
            if current.nrows() != payload.block.nrows() {
                return Err(incompatible(&current, &payload.block));
            }
            let data = concatenate(Axis(1), &[current.data(), payload.block.data()])
                .map_err(|_| incompatible(&current, &payload.block))?;
            let (_, mut names) = current.into_parts();
            names.extend(payload.block.names().iter().cloned());
            Ok(LabeledMatrix::new(data, names)?)
        }
        PayloadKind::NewCaseBlock => {
            if current.ncols() != payload.block.ncols() {
                return Err(incompatible(&current, &payload.block));
            }
            let data = concatenate(Axis(0), &[current.data(), payload.block.data()])
                .map_err(|_| incompatible(&current, &payload.block))?;
            let (_, names) = current.into_parts();
            Ok(LabeledMatrix::new(data, names)?)
        }
    }
}

/// Loads every file of one feature type and joins them in natural file order.
fn load_feature_type(dir: &Path, spec: &FeatureTypeSpec) -> Result<Payload, AssembleError> {
    let files_dir = dir.join(format!("{}_feature_files", spec.name));
    let var_names = files::load_list(&dir.join(format!("{}_feature_columns.txt", spec.name)))?;
    let file_list = files::list_files(&files_dir)?;
    if file_list.is_empty() {
        return Err(AssembleError::EmptyFeatureDirectory(files_dir));
    }

    let mut all: Option<LabeledMatrix> = None;
    for path in &file_list {
        let data = files::read_numeric_table(path, b',')?;
        let suffix = match spec.layout {
            PayloadKind::SameCaseMoreColumns => files::file_stem_string(path),
            PayloadKind::NewCaseBlock => spec.name.clone(),
        };
        let names = var_names.iter().map(|n| format!("{n}_{suffix}")).collect();
        let block = LabeledMatrix::new(data, names).map_err(|mut e| {
            e.context = path.display().to_string();
            e
        })?;
        let payload = Payload {
            kind: spec.layout,
            block,
        };
        all = Some(concat(all, payload, &files::file_stem_string(path))?);
    }

    let block = all.ok_or_else(|| AssembleError::EmptyFeatureDirectory(files_dir.clone()))?;
    Ok(Payload {
        kind: spec.layout,
        block,
    })
}

/// Loads `<name>_features.txt` as extra columns for the existing cases.
fn load_additional_feature(dir: &Path, name: &str) -> Result<Payload, AssembleError> {
    let var_names = files::load_list(&dir.join(format!("{name}_feature_columns.txt")))?;
    let data = files::read_numeric_table(&dir.join(format!("{name}_features.txt")), b',')?;
    let names = var_names.iter().map(|n| format!("{n}_{name}")).collect();
    Ok(Payload {
        kind: PayloadKind::SameCaseMoreColumns,
        block: LabeledMatrix::new(data, names)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::{TempDir, tempdir};

    fn write(path: &Path, content: &str) {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).unwrap();
        }
        fs::write(path, content).unwrap();
    }

    /// Two cases per file; `demo` has two single-column files, `labs` one two-column file.
    fn fixture() -> TempDir {
        let dir = tempdir().unwrap();
        let root = dir.path();
        write(&root.join("demo_feature_columns.txt"), "age\n");
        write(&root.join("demo_feature_files/a.csv"), "61\n47\n");
        write(&root.join("demo_feature_files/b.csv"), "1\n0\n");
        write(&root.join("labs_feature_columns.txt"), "na\nk\n");
        write(&root.join("labs_feature_files/last.csv"), "140,4.1\n,3.9\n");
        dir
    }

    fn config(root: &Path, types: &[&str]) -> AssembleConfig {
        AssembleConfig {
            feature_directory: root.to_path_buf(),
            output_stem: root.join("out/full"),
            feature_types: types.iter().map(|t| FeatureTypeSpec::columns(t)).collect(),
            additional_features: Vec::new(),
            columns_to_match: None,
        }
    }

    #[test]
    fn columns_are_labeled_by_name_and_file() {
        let dir = fixture();
        let matrix = assemble(&config(dir.path(), &["demo", "labs"])).unwrap();
        assert_eq!(matrix.shape(), (2, 4));
        assert_eq!(matrix.names(), &["age_a", "age_b", "na_last", "k_last"]);
        assert_eq!(matrix.data()[[0, 2]], 140.0);
        assert!(matrix.data()[[1, 2]].is_nan());
    }

    #[test]
    fn additional_features_append_columns() {
        let dir = fixture();
        write(&dir.path().join("sofa_feature_columns.txt"), "score\n");
        write(&dir.path().join("sofa_features.txt"), "3\n7\n");
        let mut cfg = config(dir.path(), &["demo"]);
        cfg.additional_features = vec!["sofa".to_string()];
        let matrix = assemble(&cfg).unwrap();
        assert_eq!(matrix.names().last().unwrap(), "score_sofa");
        assert_eq!(matrix.data()[[1, 2]], 7.0);
    }

    #[test]
    fn case_blocks_stack_rows() {
        let dir = tempdir().unwrap();
        let root = dir.path();
        write(&root.join("site_feature_columns.txt"), "hr\nrr\n");
        write(&root.join("site_feature_files/s1.csv"), "80,12\n");
        write(&root.join("site_feature_files/s2.csv"), "90,14\n95,16\n");
        let mut cfg = config(root, &[]);
        cfg.feature_types = vec![FeatureTypeSpec {
            name: "site".to_string(),
            layout: PayloadKind::NewCaseBlock,
        }];
        let matrix = assemble(&cfg).unwrap();
        assert_eq!(matrix.shape(), (3, 2));
        assert_eq!(matrix.names(), &["hr_site", "rr_site"]);
        assert_eq!(matrix.data()[[2, 1]], 16.0);
    }

    #[test]
    fn mismatched_case_counts_are_rejected() {
        let dir = fixture();
        write(&dir.path().join("demo_feature_files/c.csv"), "1\n2\n3\n");
        let err = assemble(&config(dir.path(), &["demo"])).unwrap_err();
        assert!(matches!(err, AssembleError::IncompatibleBlock { .. }));
    }

    #[test]
    fn name_file_must_cover_every_column() {
        let dir = fixture();
        write(&dir.path().join("labs_feature_columns.txt"), "na\n");
        let err = assemble(&config(dir.path(), &["labs"])).unwrap_err();
        assert!(matches!(err, AssembleError::Names(_)));
    }

    #[test]
    fn column_matching_reorders_and_fails_fast() {
        let dir = fixture();
        let matrix = assemble(&config(dir.path(), &["demo", "labs"])).unwrap();
        let requested = vec!["k_last".to_string(), "age_a".to_string()];
        let matched = match_columns(&matrix, &requested).unwrap();
        assert_eq!(matched.names(), &["k_last", "age_a"]);
        assert_eq!(matched.data()[[1, 0]], 3.9);

        let missing = vec!["age_a".to_string(), "lactate_last".to_string()];
        match match_columns(&matrix, &missing) {
            Err(AssembleError::UnmatchedColumn(name)) => assert_eq!(name, "lactate_last"),
            other => panic!("expected UnmatchedColumn, got {other:?}"),
        }
    }

    #[test]
    fn assemble_and_save_writes_artifact_pair() {
        let dir = fixture();
        let cfg = config(dir.path(), &["demo", "labs"]);
        let matrix = assemble_and_save(&cfg).unwrap();
        let loaded = files::load_matrix_artifact(&cfg.output_stem).unwrap();
        assert_eq!(loaded.names(), matrix.names());
        assert_eq!(loaded.shape(), matrix.shape());
    }

    #[test]
    fn no_feature_types_is_an_error() {
        let dir = fixture();
        assert!(matches!(
            assemble(&config(dir.path(), &[])),
            Err(AssembleError::NoFeatureTypes)
        ));
    }
}

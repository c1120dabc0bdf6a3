//! Keys and containers shared by every pipeline stage.
//!
//! The string keys that used to identify experiments (`"3_full"`, `"lr-m"`) are
//! modelled here as small `Copy` enums so that lookups never re-parse text.
//! Parsing and formatting only happen at the file boundary.

use ndarray::{Array2, ArrayView2, Axis};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// The number of round-robin folds emitted per target.
pub const NUM_FOLDS: usize = 5;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum KeyParseError {
    #[error("'{0}' is not a fold type (expected 'full' or 0..4)")]
    FoldType(String),
    #[error("'{0}' is not a model family (expected lr, sv or rf)")]
    ModelFamily(String),
    #[error("'{0}' is not an imputation kind (expected m or r)")]
    ImputationKind(String),
    #[error("'{0}' is not a model/imputation combination (expected e.g. 'lr-m')")]
    Combination(String),
}

/// Which slice of a target's samples a record describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum FoldType {
    Full,
    Fold(u8),
}

impl FoldType {
    /// `Full` followed by every fold, in file order.
    pub fn all() -> impl Iterator<Item = FoldType> {
        std::iter::once(FoldType::Full).chain((0..NUM_FOLDS as u8).map(FoldType::Fold))
    }

    pub fn is_full(self) -> bool {
        matches!(self, FoldType::Full)
    }
}

impl fmt::Display for FoldType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FoldType::Full => f.write_str("full"),
            FoldType::Fold(idx) => write!(f, "{idx}"),
        }
    }
}

impl FromStr for FoldType {
    type Err = KeyParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s == "full" {
            return Ok(FoldType::Full);
        }
        match s.parse::<u8>() {
            Ok(idx) if (idx as usize) < NUM_FOLDS => Ok(FoldType::Fold(idx)),
            _ => Err(KeyParseError::FoldType(s.to_string())),
        }
    }
}

/// Identifies one sample-index record: a target column and a fold.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SampleKey {
    pub target_index: usize,
    pub fold_type: FoldType,
}

impl SampleKey {
    pub fn full(target_index: usize) -> Self {
        Self {
            target_index,
            fold_type: FoldType::Full,
        }
    }

    /// The file-name stem used for artifacts derived from this key, e.g. `3_full`.
    pub fn stem(&self) -> String {
        format!("{}_{}", self.target_index, self.fold_type)
    }
}

impl fmt::Display for SampleKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}_{}", self.target_index, self.fold_type)
    }
}

/// The three classifier families compared for every target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum ModelFamily {
    LogisticRegression,
    SupportVector,
    RandomForest,
}

impl ModelFamily {
    pub const ALL: [ModelFamily; 3] = [
        ModelFamily::LogisticRegression,
        ModelFamily::SupportVector,
        ModelFamily::RandomForest,
    ];

    pub fn code(self) -> &'static str {
        match self {
            ModelFamily::LogisticRegression => "lr",
            ModelFamily::SupportVector => "sv",
            ModelFamily::RandomForest => "rf",
        }
    }
}

impl fmt::Display for ModelFamily {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.code())
    }
}

impl FromStr for ModelFamily {
    type Err = KeyParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "lr" => Ok(ModelFamily::LogisticRegression),
            "sv" => Ok(ModelFamily::SupportVector),
            "rf" => Ok(ModelFamily::RandomForest),
            _ => Err(KeyParseError::ModelFamily(s.to_string())),
        }
    }
}

/// The two imputation strategies carried side by side through the pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum ImputationKind {
    Median,
    Regression,
}

impl ImputationKind {
    pub const ALL: [ImputationKind; 2] = [ImputationKind::Median, ImputationKind::Regression];

    /// Single-letter suffix used in combination codes (`lr-m`).
    pub fn code(self) -> &'static str {
        match self {
            ImputationKind::Median => "m",
            ImputationKind::Regression => "r",
        }
    }

    /// Tag appended to artifact stems (`<stem>_mImp`).
    pub fn artifact_tag(self) -> &'static str {
        match self {
            ImputationKind::Median => "mImp",
            ImputationKind::Regression => "rImp",
        }
    }
}

impl fmt::Display for ImputationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.artifact_tag())
    }
}

impl FromStr for ImputationKind {
    type Err = KeyParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "m" | "mImp" => Ok(ImputationKind::Median),
            "r" | "rImp" => Ok(ImputationKind::Regression),
            _ => Err(KeyParseError::ImputationKind(s.to_string())),
        }
    }
}

/// A model family paired with the imputation its inputs came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Combination {
    pub family: ModelFamily,
    pub imputation: ImputationKind,
}

impl Combination {
    /// Fixed enumeration order. Ties in cross-validation resolve to the earliest entry.
    pub const ENUMERATION: [Combination; 6] = [
        Combination::new(ModelFamily::LogisticRegression, ImputationKind::Median),
        Combination::new(ModelFamily::SupportVector, ImputationKind::Median),
        Combination::new(ModelFamily::RandomForest, ImputationKind::Median),
        Combination::new(ModelFamily::LogisticRegression, ImputationKind::Regression),
        Combination::new(ModelFamily::SupportVector, ImputationKind::Regression),
        Combination::new(ModelFamily::RandomForest, ImputationKind::Regression),
    ];

    pub const fn new(family: ModelFamily, imputation: ImputationKind) -> Self {
        Self { family, imputation }
    }
}

impl fmt::Display for Combination {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.family.code(), self.imputation.code())
    }
}

impl FromStr for Combination {
    type Err = KeyParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (family, imputation) = s
            .split_once('-')
            .ok_or_else(|| KeyParseError::Combination(s.to_string()))?;
        Ok(Combination::new(family.parse()?, imputation.parse()?))
    }
}

/// Which sample keys the selection and training stages process.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrainingMode {
    /// Only `full` keys: fit on every labelled case, score the evaluation matrix.
    #[default]
    EvaluationSet,
    /// Additionally every fold key: fit on the other folds, score the held-out fold.
    CrossFold,
}

impl TrainingMode {
    pub fn includes(self, key: &SampleKey) -> bool {
        match self {
            TrainingMode::EvaluationSet => key.fold_type.is_full(),
            TrainingMode::CrossFold => true,
        }
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{context}: matrix has {columns} columns but {names} names")]
pub struct ShapeMismatch {
    pub context: String,
    pub columns: usize,
    pub names: usize,
}

/// A dense matrix travelling together with its column labels.
///
/// The constructor is the only way in, so `names.len() == data.ncols()` holds for
/// every value of this type.
#[derive(Debug, Clone, PartialEq)]
pub struct LabeledMatrix {
    data: Array2<f64>,
    names: Vec<String>,
}

impl LabeledMatrix {
    pub fn new(data: Array2<f64>, names: Vec<String>) -> Result<Self, ShapeMismatch> {
        if data.ncols() != names.len() {
            return Err(ShapeMismatch {
                context: "labeled matrix".to_string(),
                columns: data.ncols(),
                names: names.len(),
            });
        }
        Ok(Self { data, names })
    }

    pub fn data(&self) -> ArrayView2<'_, f64> {
        self.data.view()
    }

    pub fn names(&self) -> &[String] {
        &self.names
    }

    pub fn nrows(&self) -> usize {
        self.data.nrows()
    }

    pub fn ncols(&self) -> usize {
        self.data.ncols()
    }

    pub fn shape(&self) -> (usize, usize) {
        (self.data.nrows(), self.data.ncols())
    }

    /// Keeps the given columns, in the given order.
    pub fn select_columns(&self, columns: &[usize]) -> Self {
        Self {
            data: self.data.select(Axis(1), columns),
            names: columns.iter().map(|&c| self.names[c].clone()).collect(),
        }
    }

    pub fn into_parts(self) -> (Array2<f64>, Vec<String>) {
        (self.data, self.names)
    }
}

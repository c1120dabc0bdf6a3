//! Pipeline configuration, read from a single TOML file.
//!
//! Every stage has its own section and every section is optional, so a file may
//! describe only the stages it intends to run. [`PipelineConfig::for_experiment`]
//! fills all sections with the standard directory layout under one base
//! directory.

use crate::assemble::{AssembleConfig, FeatureTypeSpec};
use crate::impute::ImputeConfig;
use crate::samples::SampleIndexConfig;
use crate::select::SelectionConfig;
use crate::train::TrainingConfig;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Feature types assembled when none are configured.
pub const DEFAULT_FEATURE_TYPES: [&str; 6] = ["demo", "io", "med", "micro", "procedure", "root"];

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read configuration file '{}': {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("Failed to parse TOML configuration '{}': {source}", path.display())]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
    #[error("Failed to serialize configuration to TOML: {0}")]
    Serialize(#[from] toml::ser::Error),
    #[error("Configuration has no [{0}] section")]
    MissingSection(&'static str),
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PipelineConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub assemble: Option<AssembleConfig>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub evaluation_assemble: Option<AssembleConfig>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub impute: Option<ImputeConfig>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub samples: Option<SampleIndexConfig>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub selection: Option<SelectionConfig>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub training: Option<TrainingConfig>,
}

fn section<'a, T>(value: &'a Option<T>, name: &'static str) -> Result<&'a T, ConfigError> {
    value.as_ref().ok_or(ConfigError::MissingSection(name))
}

impl PipelineConfig {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        toml::from_str(&text).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    pub fn to_toml(&self) -> Result<String, ConfigError> {
        Ok(toml::to_string_pretty(self)?)
    }

    pub fn assemble(&self) -> Result<&AssembleConfig, ConfigError> {
        section(&self.assemble, "assemble")
    }

    pub fn impute(&self) -> Result<&ImputeConfig, ConfigError> {
        section(&self.impute, "impute")
    }

    pub fn samples(&self) -> Result<&SampleIndexConfig, ConfigError> {
        section(&self.samples, "samples")
    }

    pub fn selection(&self) -> Result<&SelectionConfig, ConfigError> {
        section(&self.selection, "selection")
    }

    pub fn training(&self) -> Result<&TrainingConfig, ConfigError> {
        section(&self.training, "training")
    }

    /// The standard experiment layout rooted at `base_dir`.
    ///
    /// ```text
    /// complete_feature_files_{labeling,evaluation}_cases/   generator output
    /// feature_matrix_storage_labeling_cases/                training artifacts, indices
    /// feature_matrix_storage_evaluation_cases/              evaluation artifacts
    /// imputer_storage/                                      fitted imputers
    /// evaluation_study_models/                              result files
    /// ```
    pub fn for_experiment(base_dir: &Path) -> Self {
        let labeling_cases = base_dir.join("complete_feature_files_labeling_cases");
        let evaluation_cases = base_dir.join("complete_feature_files_evaluation_cases");
        let labeling_store = base_dir.join("feature_matrix_storage_labeling_cases");
        let evaluation_store = base_dir.join("feature_matrix_storage_evaluation_cases");
        let imputer_store = base_dir.join("imputer_storage");

        let train_stem = labeling_store.join("full_labeling");
        let eval_stem = evaluation_store.join("full_evaluation");
        let feature_samples = labeling_store.join("feature_samples_out.txt");
        let target_samples = labeling_store.join("target_samples_out.txt");
        let target_matrix_file = labeling_cases.join("target_full_matrix.txt");
        let target_feature_columns_file = labeling_cases.join("target_feature_columns.txt");
        let selection_dir = labeling_store.join("feature_selection_storage");

        let feature_types: Vec<FeatureTypeSpec> = DEFAULT_FEATURE_TYPES
            .iter()
            .map(|name| FeatureTypeSpec::columns(name))
            .collect();
        let assemble_from = |feature_directory: PathBuf, output_stem: PathBuf| AssembleConfig {
            feature_directory,
            output_stem,
            feature_types: feature_types.clone(),
            additional_features: Vec::new(),
            columns_to_match: None,
        };

        Self {
            assemble: Some(assemble_from(labeling_cases.clone(), train_stem.clone())),
            evaluation_assemble: Some(assemble_from(evaluation_cases, eval_stem.clone())),
            impute: Some(ImputeConfig {
                train_stem: train_stem.clone(),
                eval_stem: eval_stem.clone(),
                keep_columns_out: imputer_store.join("keep_col_imputer-full_labeling"),
                r_imputer_out: imputer_store.join("r_imputer-full_labeling"),
                m_imputer_out: imputer_store.join("m_imputer-full_labeling"),
                regression: Default::default(),
            }),
            samples: Some(SampleIndexConfig {
                case_order_rows_file: labeling_cases.join("case_order_rows.txt"),
                target_case_rows_file: labeling_cases.join("target_case_rows.txt"),
                target_feature_columns_file: target_feature_columns_file.clone(),
                item_present_file: labeling_cases.join("items_present-labeling.txt"),
                feature_samples_out: feature_samples.clone(),
                target_samples_out: target_samples.clone(),
                feat_targ_samples_out: labeling_store.join("feat_targ_samples_out.txt"),
                feature_matrix_name: labeling_store.join("full_labeling_").display().to_string(),
                target_matrix_name: labeling_cases.join("target_full_matrix").display().to_string(),
                fold_assignment: Default::default(),
                target_matrix_file: None,
            }),
            selection: Some(SelectionConfig {
                train_stem: train_stem.clone(),
                feature_samples: feature_samples.clone(),
                target_samples: target_samples.clone(),
                target_matrix_file: target_matrix_file.clone(),
                storage_dir: selection_dir.clone(),
                mode: Default::default(),
                selector: Default::default(),
                threads: None,
            }),
            training: Some(TrainingConfig {
                train_stem,
                eval_stem,
                feature_samples,
                target_samples,
                target_matrix_file,
                target_feature_columns_file,
                selection_dir,
                result_dir: base_dir.join("evaluation_study_models"),
                mode: Default::default(),
                scoring: Default::default(),
                classifiers: Default::default(),
            }),
        }
    }
}

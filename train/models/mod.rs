//! The three classifier families compared for every target.
//!
//! All of them are binary classifiers over dense `f64` inputs with labels in
//! `{0, 1}` and expose the same [`Classifier`] interface, so cross-validation and
//! refitting never need to know which family they hold.

pub mod forest;
pub mod logistic;
pub mod svm;

use crate::types::ModelFamily;
use forest::{ForestConfig, RandomForest};
use logistic::{LogisticConfig, LogisticRegression};
use ndarray::{Array1, ArrayView1, ArrayView2};
use serde::{Deserialize, Serialize};
use svm::{SupportVectorClassifier, SvmConfig};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ModelError {
    #[error("Cannot fit a classifier on zero rows")]
    EmptyTrainingSet,
    #[error("Training data has {rows} rows but {labels} labels")]
    RowMismatch { rows: usize, labels: usize },
    #[error("Label {0} is not binary; labels must be 0 or 1")]
    NonBinaryLabel(f64),
    #[error("Training labels contain a single class")]
    SingleClass,
    #[error("Classifier was used before being fitted")]
    NotFitted,
    #[error("Classifier was fitted on {expected} features but received {found}")]
    FeatureMismatch { expected: usize, found: usize },
    #[error("Linear algebra failure while fitting: {0}")]
    LinearAlgebra(#[from] ndarray_linalg::error::LinalgError),
    #[error("Fitting diverged and produced non-finite coefficients")]
    NonFinite,
}

/// A binary classifier. Probabilities refer to the positive class.
pub trait Classifier: Send + Sync {
    fn fit(&mut self, x: ArrayView2<f64>, y: ArrayView1<f64>) -> Result<(), ModelError>;

    fn predict_proba(&self, x: ArrayView2<f64>) -> Result<Array1<f64>, ModelError>;

    /// Hard 0/1 predictions; by default the probability thresholded at one half.
    fn predict(&self, x: ArrayView2<f64>) -> Result<Array1<f64>, ModelError> {
        Ok(self
            .predict_proba(x)?
            .mapv(|p| if p >= 0.5 { 1.0 } else { 0.0 }))
    }
}

/// Hyperparameters for every family, shared by CV and refit.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClassifierConfig {
    pub logistic: LogisticConfig,
    pub svm: SvmConfig,
    pub forest: ForestConfig,
}

/// Builds an unfitted classifier of the requested family.
pub fn new_classifier(family: ModelFamily, config: &ClassifierConfig) -> Box<dyn Classifier> {
    match family {
        ModelFamily::LogisticRegression => Box::new(LogisticRegression::new(config.logistic.clone())),
        ModelFamily::SupportVector => Box::new(SupportVectorClassifier::new(config.svm.clone())),
        ModelFamily::RandomForest => Box::new(RandomForest::new(config.forest.clone())),
    }
}

/// Shared preconditions for fitting: aligned rows, 0/1 labels, both classes present.
pub(crate) fn check_training_data(
    x: ArrayView2<f64>,
    y: ArrayView1<f64>,
) -> Result<(), ModelError> {
    if x.nrows() == 0 {
        return Err(ModelError::EmptyTrainingSet);
    }
    if x.nrows() != y.len() {
        return Err(ModelError::RowMismatch {
            rows: x.nrows(),
            labels: y.len(),
        });
    }
    if let Some(&bad) = y.iter().find(|&&v| v != 0.0 && v != 1.0) {
        return Err(ModelError::NonBinaryLabel(bad));
    }
    let positives = y.iter().filter(|&&v| v == 1.0).count();
    if positives == 0 || positives == y.len() {
        return Err(ModelError::SingleClass);
    }
    Ok(())
}

pub(crate) fn check_features(expected: usize, x: ArrayView2<f64>) -> Result<(), ModelError> {
    if x.ncols() != expected {
        return Err(ModelError::FeatureMismatch {
            expected,
            found: x.ncols(),
        });
    }
    Ok(())
}

/// Numerically safe logistic function.
pub(crate) fn sigmoid(eta: f64) -> f64 {
    let eta = eta.clamp(-700.0, 700.0);
    1.0 / (1.0 + (-eta).exp())
}

#[cfg(test)]
pub(crate) mod test_data {
    use ndarray::{Array1, Array2};

    /// Two noisy, mostly separable clusters along the first feature; the second is noise.
    pub fn clusters(n_per_class: usize) -> (Array2<f64>, Array1<f64>) {
        let n = 2 * n_per_class;
        let mut x = Array2::zeros((n, 2));
        let mut y = Array1::zeros(n);
        for i in 0..n {
            let positive = i % 2 == 1;
            let jitter = ((i * 37) % 11) as f64 / 11.0 - 0.5;
            x[[i, 0]] = if positive { 2.0 } else { -2.0 } + jitter;
            x[[i, 1]] = ((i * 13) % 7) as f64 / 7.0;
            y[i] = if positive { 1.0 } else { 0.0 };
        }
        (x, y)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    #[test]
    fn training_data_checks() {
        let x = array![[1.0], [2.0], [3.0]];
        assert!(matches!(
            check_training_data(x.view(), array![0.0, 1.0].view()),
            Err(ModelError::RowMismatch { rows: 3, labels: 2 })
        ));
        assert!(matches!(
            check_training_data(x.view(), array![0.0, 2.0, 1.0].view()),
            Err(ModelError::NonBinaryLabel(v)) if v == 2.0
        ));
        assert!(matches!(
            check_training_data(x.view(), array![1.0, 1.0, 1.0].view()),
            Err(ModelError::SingleClass)
        ));
        assert!(check_training_data(x.view(), array![1.0, 0.0, 1.0].view()).is_ok());
    }

    #[test]
    fn every_family_separates_clusters() {
        let (x, y) = test_data::clusters(20);
        for family in ModelFamily::ALL {
            let mut model = new_classifier(family, &ClassifierConfig::default());
            model.fit(x.view(), y.view()).unwrap();
            let predictions = model.predict(x.view()).unwrap();
            let correct = predictions
                .iter()
                .zip(y.iter())
                .filter(|(p, t)| p == t)
                .count();
            assert!(correct >= 38, "{family} got {correct}/40");
            let proba = model.predict_proba(x.view()).unwrap();
            assert!(proba.iter().all(|p| (0.0..=1.0).contains(p)));
        }
    }

    #[test]
    fn unfitted_models_refuse_to_predict() {
        for family in ModelFamily::ALL {
            let model = new_classifier(family, &ClassifierConfig::default());
            assert!(matches!(
                model.predict_proba(array![[1.0, 2.0]].view()),
                Err(ModelError::NotFitted)
            ));
        }
    }
}

//! Stratified k-fold cross-validation and the two CV scores.

use super::TrainError;
use super::models::{ClassifierConfig, ModelError, new_classifier};
use crate::types::ModelFamily;
use ndarray::{ArrayView1, ArrayView2, Axis};
use serde::{Deserialize, Serialize};

/// Score averaged across CV folds to rank the six combinations.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Scoring {
    #[default]
    Accuracy,
    RocAuc,
}

/// `k = min(#positives, #negatives)`; fewer than two folds cannot be cross-validated.
/// Labels other than 0 and 1, NaN included, are rejected before counting.
pub fn fold_count(labels: ArrayView1<f64>) -> Result<usize, TrainError> {
    if let Some(&bad) = labels.iter().find(|&&v| v != 0.0 && v != 1.0) {
        return Err(ModelError::NonBinaryLabel(bad).into());
    }
    let positives = labels.iter().filter(|&&v| v == 1.0).count();
    let negatives = labels.len() - positives;
    let k = positives.min(negatives);
    if k < 2 {
        return Err(TrainError::DegenerateLabels {
            positives,
            negatives,
        });
    }
    Ok(k)
}

/// Test-index sets for `k` stratified folds, without shuffling.
///
/// Labels are sorted and dealt round-robin to decide how many samples of each
/// class every fold receives; each class then fills the folds in order with
/// contiguous runs of its samples.
pub fn stratified_folds(labels: ArrayView1<f64>, k: usize) -> Vec<Vec<usize>> {
    let positives: Vec<usize> = (0..labels.len()).filter(|&i| labels[i] != 0.0).collect();
    let negatives: Vec<usize> = (0..labels.len()).filter(|&i| labels[i] == 0.0).collect();

    // Sorted order is all negatives then all positives; fold f takes positions f, f+k, ...
    let n = labels.len();
    let mut allocation = vec![[0usize; 2]; k];
    for position in 0..n {
        let class = usize::from(position >= negatives.len());
        allocation[position % k][class] += 1;
    }

    let mut folds = vec![Vec::new(); k];
    for (class, members) in [negatives, positives].into_iter().enumerate() {
        let mut cursor = 0;
        for (fold, counts) in folds.iter_mut().zip(&allocation) {
            let take = counts[class];
            fold.extend_from_slice(&members[cursor..cursor + take]);
            cursor += take;
        }
    }
    for fold in &mut folds {
        fold.sort_unstable();
    }
    folds
}

pub fn accuracy(predictions: ArrayView1<f64>, truth: ArrayView1<f64>) -> f64 {
    if truth.is_empty() {
        return f64::NAN;
    }
    let correct = predictions
        .iter()
        .zip(truth.iter())
        .filter(|(p, t)| p == t)
        .count();
    correct as f64 / truth.len() as f64
}

/// Area under the ROC curve via the rank-sum statistic, with tied scores
/// sharing their average rank. `None` when only one class is present.
pub fn roc_auc(scores: ArrayView1<f64>, truth: ArrayView1<f64>) -> Option<f64> {
    let n = scores.len();
    let positives = truth.iter().filter(|&&v| v != 0.0).count();
    let negatives = n - positives;
    if positives == 0 || negatives == 0 {
        return None;
    }
    let mut order: Vec<usize> = (0..n).collect();
    order.sort_by(|&a, &b| scores[a].total_cmp(&scores[b]));

    let mut positive_rank_sum = 0.0;
    let mut start = 0;
    while start < n {
        let mut end = start + 1;
        while end < n && scores[order[end]] == scores[order[start]] {
            end += 1;
        }
        // Ranks are one-based; a tie block shares the mean of its ranks.
        let average_rank = (start + end + 1) as f64 / 2.0;
        for &i in &order[start..end] {
            if truth[i] != 0.0 {
                positive_rank_sum += average_rank;
            }
        }
        start = end;
    }
    let p = positives as f64;
    Some((positive_rank_sum - p * (p + 1.0) / 2.0) / (p * negatives as f64))
}

/// Per-fold scores of a freshly fitted `family` model under stratified k-fold CV.
pub fn cross_val_score(
    family: ModelFamily,
    config: &ClassifierConfig,
    x: ArrayView2<f64>,
    y: ArrayView1<f64>,
    k: usize,
    scoring: Scoring,
) -> Result<Vec<f64>, TrainError> {
    let folds = stratified_folds(y, k);
    let mut scores = Vec::with_capacity(k);
    for (fold_index, test) in folds.iter().enumerate() {
        let train: Vec<usize> = (0..y.len()).filter(|i| test.binary_search(i).is_err()).collect();
        let x_train = x.select(Axis(0), &train);
        let y_train = y.select(Axis(0), &train);
        let x_test = x.select(Axis(0), test);
        let y_test = y.select(Axis(0), test);

        let mut model = new_classifier(family, config);
        model.fit(x_train.view(), y_train.view())?;
        let score = match scoring {
            Scoring::Accuracy => accuracy(model.predict(x_test.view())?.view(), y_test.view()),
            Scoring::RocAuc => roc_auc(model.predict_proba(x_test.view())?.view(), y_test.view())
                .ok_or(TrainError::UndefinedScore { fold: fold_index })?,
        };
        log::debug!("{family} fold {fold_index}/{k}: {score:.4}");
        scores.push(score);
    }
    Ok(scores)
}

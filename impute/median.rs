use super::{FittedImputer, ImputeError};
use crate::types::ImputationKind;
use ndarray::{Array1, Array2, ArrayView1, ArrayView2, Axis, Zip};
use serde::{Deserialize, Serialize};

/// Fills each missing value with its column's training median.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MedianImputer {
    medians: Array1<f64>,
}

impl MedianImputer {
    /// Learns one median per column from training data only.
    pub fn fit(train: ArrayView2<f64>) -> Result<Self, ImputeError> {
        let medians = train
            .axis_iter(Axis(1))
            .enumerate()
            .map(|(idx, column)| column_median(column).ok_or(ImputeError::EmptyColumn(idx)))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self {
            medians: Array1::from_vec(medians),
        })
    }

    pub fn medians(&self) -> ArrayView1<'_, f64> {
        self.medians.view()
    }
}

impl FittedImputer for MedianImputer {
    fn kind(&self) -> ImputationKind {
        ImputationKind::Median
    }

    fn transform(&self, data: ArrayView2<f64>) -> Result<Array2<f64>, ImputeError> {
        if data.ncols() != self.medians.len() {
            return Err(ImputeError::ColumnCountMismatch {
                expected: self.medians.len(),
                found: data.ncols(),
            });
        }
        let mut out = data.to_owned();
        for mut row in out.axis_iter_mut(Axis(0)) {
            Zip::from(&mut row).and(&self.medians).for_each(|v, &median| {
                if v.is_nan() {
                    *v = median;
                }
            });
        }
        Ok(out)
    }

    fn transform_names(&self, names: &[String]) -> Vec<String> {
        names.to_vec()
    }
}

/// Median of the non-missing values; the mean of the two middle values for even counts.
pub(crate) fn column_median(column: ArrayView1<f64>) -> Option<f64> {
    let mut observed: Vec<f64> = column.iter().copied().filter(|v| !v.is_nan()).collect();
    if observed.is_empty() {
        return None;
    }
    observed.sort_by(|a, b| a.total_cmp(b));
    let n = observed.len();
    Some(if n % 2 == 0 {
        (observed[n / 2 - 1] + observed[n / 2]) / 2.0
    } else {
        observed[n / 2]
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use ndarray::array;

    #[test]
    fn fills_with_training_medians_only() {
        let nan = f64::NAN;
        let train = array![[1.0, 10.0], [nan, 20.0], [3.0, nan], [5.0, 40.0]];
        let imputer = MedianImputer::fit(train.view()).unwrap();
        assert_abs_diff_eq!(imputer.medians()[0], 3.0);
        assert_abs_diff_eq!(imputer.medians()[1], 20.0);

        let eval = array![[nan, nan], [100.0, 200.0]];
        let filled = imputer.transform(eval.view()).unwrap();
        assert_eq!(filled, array![[3.0, 20.0], [100.0, 200.0]]);
    }

    #[test]
    fn even_counts_average_the_middle_pair() {
        let column = array![4.0, 1.0, 3.0, 2.0];
        assert_abs_diff_eq!(column_median(column.view()).unwrap(), 2.5);
    }

    #[test]
    fn refitting_is_deterministic() {
        let nan = f64::NAN;
        let train = array![[2.0, nan], [nan, 1.0], [8.0, 3.0], [4.0, 9.0]];
        let a = MedianImputer::fit(train.view()).unwrap();
        let b = MedianImputer::fit(train.view()).unwrap();
        assert_eq!(a, b);
        assert_eq!(
            a.transform(train.view()).unwrap(),
            b.transform(train.view()).unwrap()
        );
    }

    #[test]
    fn rejects_all_missing_columns_and_wrong_widths() {
        let nan = f64::NAN;
        let train = array![[1.0, nan], [2.0, nan]];
        assert!(matches!(
            MedianImputer::fit(train.view()),
            Err(ImputeError::EmptyColumn(1))
        ));

        let imputer = MedianImputer::fit(array![[1.0], [2.0]].view()).unwrap();
        assert!(matches!(
            imputer.transform(array![[1.0, 2.0]].view()),
            Err(ImputeError::ColumnCountMismatch { expected: 1, found: 2 })
        ));
    }
}

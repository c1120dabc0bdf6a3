use crate::types::LabeledMatrix;
use ndarray::{ArrayView1, ArrayView2, Axis};

/// Returns, in ascending order, the columns that carry information.
///
/// A column survives when it holds at least two distinct non-missing values; this
/// drops all-missing columns, columns with a single observation and constants.
pub fn clean_columns(train: ArrayView2<f64>) -> Vec<usize> {
    train
        .axis_iter(Axis(1))
        .enumerate()
        .filter(|(_, column)| has_two_distinct_values(*column))
        .map(|(idx, _)| idx)
        .collect()
}

fn has_two_distinct_values(column: ArrayView1<f64>) -> bool {
    let mut observed = column.iter().filter(|v| !v.is_nan());
    match observed.next() {
        Some(&first) => observed.any(|&v| v != first),
        None => false,
    }
}

/// Applies one kept-column set to a train/eval pair so both keep identical semantics.
pub fn apply_columns(
    train: &LabeledMatrix,
    eval: &LabeledMatrix,
    keep: &[usize],
) -> (LabeledMatrix, LabeledMatrix) {
    (train.select_columns(keep), eval.select_columns(keep))
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    #[test]
    fn drops_degenerate_columns() {
        let nan = f64::NAN;
        let train = array![
            [1.0, nan, 5.0, nan, 0.0],
            [2.0, nan, 5.0, 3.0, nan],
            [3.0, nan, 5.0, nan, 1.0],
        ];
        // col 1: all missing, col 2: constant, col 3: single observation.
        assert_eq!(clean_columns(train.view()), vec![0, 4]);
    }

    #[test]
    fn cleaning_is_idempotent() {
        let nan = f64::NAN;
        let train = array![[1.0, nan, 2.0, 7.0], [1.0, 4.0, nan, 8.0], [1.0, 5.0, 3.0, nan]];
        let keep = clean_columns(train.view());
        let cleaned = train.select(Axis(1), &keep);
        let again = clean_columns(cleaned.view());
        assert_eq!(again, (0..cleaned.ncols()).collect::<Vec<_>>());
    }

    #[test]
    fn same_columns_are_applied_to_both_splits() {
        let train = LabeledMatrix::new(
            array![[1.0, 9.0, 3.0], [2.0, 9.0, 4.0]],
            vec!["a".into(), "b".into(), "c".into()],
        )
        .unwrap();
        let eval = LabeledMatrix::new(
            array![[5.0, 1.0, 6.0]],
            vec!["a".into(), "b".into(), "c".into()],
        )
        .unwrap();
        let keep = clean_columns(train.data());
        let (t, e) = apply_columns(&train, &eval, &keep);
        assert_eq!(t.names(), e.names());
        assert_eq!(e.data(), array![[5.0, 6.0]]);
    }
}

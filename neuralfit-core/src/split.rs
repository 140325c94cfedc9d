//! Train/validation splitting and label encoding.

use crate::batch::{Targets, n_samples, select_rows};
use crate::error::NetError;
use ndarray::{Array1, ArrayD, Axis, Slice};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Sample indices of one train/validation split, each in ascending order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Split {
    pub train: Vec<usize>,
    pub valid: Vec<usize>,
}

impl Split {
    fn from_valid(n: usize, valid: Vec<usize>) -> Self {
        let mut is_valid = vec![false; n];
        for &i in &valid {
            is_valid[i] = true;
        }
        let train = (0..n).filter(|&i| !is_valid[i]).collect();
        Self { train, valid }
    }
}

/// Number of folds for a validation fraction: `round(1 / eval_size)`.
pub fn folds_for(eval_size: f64) -> usize {
    (1.0 / eval_size).round() as usize
}

fn check_folds(n: usize, k: usize) -> Result<(), NetError> {
    if k < 2 {
        return Err(NetError::invalid_input(format!(
            "k-fold cross validation requires at least 2 folds, got {k}"
        )));
    }
    if n < k {
        return Err(NetError::invalid_input(format!(
            "cannot have more folds ({k}) than samples ({n})"
        )));
    }
    Ok(())
}

/// First fold of an unshuffled k-fold split. The first `n % k` folds get one
/// extra sample.
pub fn kfold_first(n: usize, k: usize) -> Result<Split, NetError> {
    check_folds(n, k)?;
    let size = n / k + usize::from(n % k > 0);
    Ok(Split::from_valid(n, (0..size).collect()))
}

/// First fold of a stratified k-fold split.
///
/// Each class is split on its own as if it had `max(count, k)` members, and
/// the first fold's share of every class goes to validation. Class
/// proportions are preserved up to rounding.
pub fn stratified_first(labels: &[i64], k: usize) -> Result<Split, NetError> {
    check_folds(labels.len(), k)?;

    let mut positions: BTreeMap<i64, Vec<usize>> = BTreeMap::new();
    for (i, &label) in labels.iter().enumerate() {
        positions.entry(label).or_default().push(i);
    }

    let mut valid = Vec::new();
    for members in positions.values() {
        let m = members.len().max(k);
        let first_fold = m / k + usize::from(m % k > 0);
        valid.extend(members.iter().take(first_fold));
    }
    valid.sort_unstable();
    Ok(Split::from_valid(labels.len(), valid))
}

/// Train/validation data.
#[derive(Debug, Clone)]
pub struct SplitData {
    pub x_train: ArrayD<f32>,
    pub y_train: Targets,
    pub x_valid: ArrayD<f32>,
    pub y_valid: Targets,
}

/// Split `x`/`y` for training. With `eval_size == 0` everything is training
/// data and the validation set is empty. Regression targets use a plain
/// k-fold, class labels a stratified one.
pub fn train_test_split(
    x: &ArrayD<f32>,
    y: &Targets,
    eval_size: f64,
    regression: bool,
) -> Result<SplitData, NetError> {
    let n = n_samples(x);
    if n != y.len() {
        return Err(NetError::shape(format!(
            "x has {n} samples but y has {}",
            y.len()
        )));
    }

    if eval_size <= 0.0 {
        return Ok(SplitData {
            x_train: x.clone(),
            y_train: y.clone(),
            x_valid: x.slice_axis(Axis(0), Slice::from(n..)).to_owned(),
            y_valid: y.slice(n..n),
        });
    }

    let k = folds_for(eval_size);
    let split = match (regression, y) {
        (false, Targets::Classes(labels)) => stratified_first(&labels.to_vec(), k)?,
        _ => kfold_first(n, k)?,
    };
    Ok(SplitData {
        x_train: select_rows(x, &split.train),
        y_train: y.select(&split.train),
        x_valid: select_rows(x, &split.valid),
        y_valid: y.select(&split.valid),
    })
}

/// Maps arbitrary integer labels to `0..n_classes` in sorted order.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LabelEncoder {
    classes: Vec<i64>,
}

impl LabelEncoder {
    /// Learn the sorted unique labels of `labels`.
    pub fn fit(labels: &[i64]) -> Self {
        let mut classes = labels.to_vec();
        classes.sort_unstable();
        classes.dedup();
        Self { classes }
    }

    pub fn classes(&self) -> &[i64] {
        &self.classes
    }

    pub fn transform(&self, labels: &Array1<i64>) -> Result<Array1<i64>, NetError> {
        labels
            .iter()
            .map(|label| {
                self.classes
                    .binary_search(label)
                    .map(|i| i as i64)
                    .map_err(|_| NetError::invalid_input(format!("unseen label {label}")))
            })
            .collect::<Result<Vec<_>, _>>()
            .map(Array1::from)
    }

    pub fn inverse_transform(&self, encoded: &Array1<i64>) -> Result<Array1<i64>, NetError> {
        encoded
            .iter()
            .map(|&code| {
                usize::try_from(code)
                    .ok()
                    .and_then(|i| self.classes.get(i).copied())
                    .ok_or_else(|| NetError::invalid_input(format!("no class with code {code}")))
            })
            .collect::<Result<Vec<_>, _>>()
            .map(Array1::from)
    }
}

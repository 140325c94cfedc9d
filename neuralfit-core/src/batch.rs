//! Samples, targets and mini-batch iteration.

use ndarray::{Array1, Array2, ArrayD, Axis, Slice};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::ops::Range;
use std::sync::Arc;

/// Training targets, one entry per sample along the leading axis.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "data", rename_all = "snake_case")]
pub enum Targets {
    /// Integer class labels.
    Classes(Array1<i64>),
    /// Real-valued targets, one row per sample.
    Values(Array2<f32>),
}

impl Targets {
    pub fn len(&self) -> usize {
        match self {
            Self::Classes(labels) => labels.len(),
            Self::Values(values) => values.nrows(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn as_classes(&self) -> Option<&Array1<i64>> {
        match self {
            Self::Classes(labels) => Some(labels),
            Self::Values(_) => None,
        }
    }

    pub fn as_values(&self) -> Option<&Array2<f32>> {
        match self {
            Self::Values(values) => Some(values),
            Self::Classes(_) => None,
        }
    }

    /// Rows at `indices`, in that order.
    pub fn select(&self, indices: &[usize]) -> Self {
        match self {
            Self::Classes(labels) => Self::Classes(labels.select(Axis(0), indices)),
            Self::Values(values) => Self::Values(values.select(Axis(0), indices)),
        }
    }

    pub fn slice(&self, range: Range<usize>) -> Self {
        match self {
            Self::Classes(labels) => {
                Self::Classes(labels.slice_axis(Axis(0), Slice::from(range)).to_owned())
            }
            Self::Values(values) => {
                Self::Values(values.slice_axis(Axis(0), Slice::from(range)).to_owned())
            }
        }
    }
}

/// Number of samples in `x` (length of the leading axis).
pub fn n_samples(x: &ArrayD<f32>) -> usize {
    x.shape().first().copied().unwrap_or(0)
}

/// Rows of `x` at `indices`.
pub fn select_rows(x: &ArrayD<f32>, indices: &[usize]) -> ArrayD<f32> {
    x.select(Axis(0), indices)
}

/// One mini-batch. `y` is absent when predicting.
#[derive(Debug, Clone)]
pub struct Batch {
    pub x: ArrayD<f32>,
    pub y: Option<Targets>,
}

impl Batch {
    pub fn new(x: ArrayD<f32>, y: Option<Targets>) -> Self {
        Self { x, y }
    }

    pub fn size(&self) -> usize {
        n_samples(&self.x)
    }
}

/// Per-batch hook applied to every batch before it is handed out, e.g. for
/// data augmentation.
pub type BatchTransform = Arc<dyn Fn(Batch) -> Batch + Send + Sync>;

/// Splits samples into consecutive batches of `batch_size` along the leading
/// axis. The last batch may be smaller.
#[derive(Clone)]
pub struct BatchIterator {
    batch_size: usize,
    transform: Option<BatchTransform>,
}

impl BatchIterator {
    pub fn new(batch_size: usize) -> Self {
        Self {
            batch_size: batch_size.max(1),
            transform: None,
        }
    }

    pub fn with_transform(mut self, transform: BatchTransform) -> Self {
        self.transform = Some(transform);
        self
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    /// Number of batches for `n` samples.
    pub fn num_batches(&self, n: usize) -> usize {
        n.div_ceil(self.batch_size)
    }

    /// Iterate over `x` (and `y`, if given). Calling this again restarts
    /// from the first sample.
    pub fn iter<'a>(&'a self, x: &'a ArrayD<f32>, y: Option<&'a Targets>) -> Batches<'a> {
        Batches {
            source: self,
            x,
            y,
            index: 0,
            total: self.num_batches(n_samples(x)),
        }
    }
}

impl fmt::Debug for BatchIterator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BatchIterator")
            .field("batch_size", &self.batch_size)
            .field("transform", &self.transform.is_some())
            .finish()
    }
}

/// Iterator returned by [`BatchIterator::iter`].
pub struct Batches<'a> {
    source: &'a BatchIterator,
    x: &'a ArrayD<f32>,
    y: Option<&'a Targets>,
    index: usize,
    total: usize,
}

impl Iterator for Batches<'_> {
    type Item = Batch;

    fn next(&mut self) -> Option<Batch> {
        if self.index >= self.total {
            return None;
        }
        let bs = self.source.batch_size;
        let start = self.index * bs;
        let end = (start + bs).min(n_samples(self.x));
        self.index += 1;

        let xb = self
            .x
            .slice_axis(Axis(0), Slice::from(start..end))
            .to_owned();
        let yb = self.y.map(|y| y.slice(start..end));
        let batch = Batch::new(xb, yb);
        Some(match &self.source.transform {
            Some(transform) => transform(batch),
            None => batch,
        })
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let left = self.total - self.index;
        (left, Some(left))
    }
}

impl ExactSizeIterator for Batches<'_> {}

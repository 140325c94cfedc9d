//! Occlusion sensitivity maps (Zeiler & Fergus, 2013).
//!
//! A square of the image is zeroed across all channels and the model is
//! asked for the probability of the true class. Regions whose occlusion
//! barely moves that probability are not what the model relies on.

use crate::error::NetError;
use ndarray::{Array2, Array4, ArrayD, Axis, Ix4, s};

/// Anything that turns a batch of inputs into class probabilities.
pub trait ProbabilisticModel {
    fn predict_proba(&mut self, x: &ArrayD<f32>) -> Result<Array2<f32>, NetError>;
}

/// Side length of the occluding square used by default.
pub const DEFAULT_SQUARE_LENGTH: usize = 7;

/// Heat map for one image.
///
/// `x` must have shape `(1, c, h, w)`. Entry `(i, j)` of the `(h, w)` result
/// is the predicted probability of class `y` when the square centred on
/// `(i, j)` is occluded. All `h * w` occluded images go to the model in one
/// call.
pub fn occlusion_heatmap<M: ProbabilisticModel + ?Sized>(
    net: &mut M,
    x: &ArrayD<f32>,
    y: usize,
    square_length: usize,
) -> Result<Array2<f32>, NetError> {
    if x.ndim() != 4 || x.shape()[0] != 1 {
        return Err(NetError::invalid_input(format!(
            "This function requires the input data to be of shape (1, c, x, y), instead got {:?}",
            x.shape()
        )));
    }
    let img = x
        .view()
        .into_dimensionality::<Ix4>()
        .map_err(|e| NetError::shape(e.to_string()))?
        .index_axis_move(Axis(0), 0);
    let (c, h, w) = img.dim();
    let pad = square_length / 2;

    let mut occluded = Array4::<f32>::zeros((h * w, c, h, w));
    for i in 0..h {
        for j in 0..w {
            let mut sample = occluded.index_axis_mut(Axis(0), i * w + j);
            sample.assign(&img);
            let rows = span(i, pad, square_length, h);
            let cols = span(j, pad, square_length, w);
            sample
                .slice_mut(s![.., rows.0..rows.1, cols.0..cols.1])
                .fill(0.0);
        }
    }

    let probs = net.predict_proba(&occluded.into_dyn())?;
    if probs.nrows() != h * w {
        return Err(NetError::shape(format!(
            "model returned {} rows for {} occluded images",
            probs.nrows(),
            h * w
        )));
    }
    if y >= probs.ncols() {
        return Err(NetError::invalid_input(format!(
            "class {y} out of range for {} outputs",
            probs.ncols()
        )));
    }
    Ok(Array2::from_shape_fn((h, w), |(i, j)| probs[[i * w + j, y]]))
}

/// Occluded index range `[start, end)` along one axis for a square of
/// `length` centred on `center`, clipped to `0..size`.
fn span(center: usize, pad: usize, length: usize, size: usize) -> (usize, usize) {
    let start = center.saturating_sub(pad);
    let end = (center + length).saturating_sub(pad).min(size);
    (start.min(end), end)
}

/// One heat map per image of a `(n, c, h, w)` batch; `ys` holds the true
/// class of each image.
pub fn occlusion_heatmaps<M: ProbabilisticModel + ?Sized>(
    net: &mut M,
    xs: &ArrayD<f32>,
    ys: &[usize],
    square_length: usize,
) -> Result<Vec<Array2<f32>>, NetError> {
    if xs.ndim() != 4 {
        return Err(NetError::invalid_input(format!(
            "This function requires the input data to be of shape (n, c, x, y), instead got {:?}",
            xs.shape()
        )));
    }
    if xs.shape()[0] != ys.len() {
        return Err(NetError::shape(format!(
            "{} images but {} labels",
            xs.shape()[0],
            ys.len()
        )));
    }
    ys.iter()
        .enumerate()
        .map(|(n, &y)| {
            let x = xs.slice_axis(Axis(0), (n..n + 1).into()).to_owned();
            occlusion_heatmap(net, &x, y, square_length)
        })
        .collect()
}

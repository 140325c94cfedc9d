//! Weight files and shape-aligned weight transplant.

use crate::alignment::{Shape, align};
use crate::backend::LayerGraph;
use crate::error::NetError;
use crate::persistence::{atomic_write_bincode, load_bincode};
use ndarray::{ArrayD, IxDyn};
use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::{debug, info};

const FORMAT_VERSION: u32 = 1;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct StoredTensor {
    shape: Vec<usize>,
    data: Vec<f32>,
}

/// On-disk layout: the flattened parameter list in traversal order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct WeightsFile {
    format_version: u32,
    tensors: Vec<StoredTensor>,
}

/// Write `tensors` to `path`; returns the SHA-256 of the file.
pub fn save_weights(path: &Path, tensors: &[ArrayD<f32>]) -> Result<String, NetError> {
    let file = WeightsFile {
        format_version: FORMAT_VERSION,
        tensors: tensors
            .iter()
            .map(|t| StoredTensor {
                shape: t.shape().to_vec(),
                data: t.iter().copied().collect(),
            })
            .collect(),
    };
    let digest = atomic_write_bincode(path, &file)?;
    info!(path = %path.display(), tensors = tensors.len(), sha256 = %digest, "Weights saved");
    Ok(digest)
}

/// Read a file written by [`save_weights`].
pub fn load_weights(path: &Path) -> Result<Vec<ArrayD<f32>>, NetError> {
    let file: WeightsFile = load_bincode(path)?;
    if file.format_version != FORMAT_VERSION {
        return Err(NetError::invalid_input(format!(
            "unsupported weights format version {}",
            file.format_version
        )));
    }
    file.tensors
        .into_iter()
        .map(|t| {
            ArrayD::from_shape_vec(IxDyn(&t.shape), t.data)
                .map_err(|e| NetError::shape(format!("corrupt tensor in weights file: {e}")))
        })
        .collect()
}

/// Copies of every parameter value in traversal order.
pub fn collect(graph: &LayerGraph) -> Vec<ArrayD<f32>> {
    graph.params().map(|p| p.value.clone()).collect()
}

/// One parameter copied by [`transplant`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoadedParam {
    pub source_index: usize,
    pub target_index: usize,
    /// Index of the receiving layer in the graph, the input layer being 0.
    pub target_layer: usize,
    pub target_layer_name: String,
    pub shape: Shape,
}

impl std::fmt::Display for LoadedParam {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "* Loaded parameter {} to layer {} ({}) (shape: {})",
            self.source_index,
            self.target_layer,
            self.target_layer_name,
            self.shape.to_x_string()
        )
    }
}

/// Copy `source` tensors into `graph` wherever [`align`] pairs their shapes.
/// Parameters without a partner keep their current values.
pub fn transplant(
    source: &[ArrayD<f32>],
    graph: &mut LayerGraph,
) -> Result<Vec<LoadedParam>, NetError> {
    let source_shapes: Vec<Shape> = source.iter().map(|t| Shape::from(t.shape())).collect();
    let target_shapes = graph.param_shapes();
    let pairs = align(&source_shapes, &target_shapes);

    let mut loaded = Vec::with_capacity(pairs.len());
    for &(i, j) in &pairs {
        let (layer_index, layer) = graph
            .owner_of(j)
            .ok_or_else(|| NetError::shape(format!("no parameter at index {j}")))?;
        loaded.push(LoadedParam {
            source_index: i,
            target_index: j,
            target_layer: layer_index,
            target_layer_name: layer.name.clone(),
            shape: source_shapes[i].clone(),
        });
    }

    let mut targets: Vec<_> = graph.params_mut().collect();
    for entry in &loaded {
        let target = &mut targets[entry.target_index];
        target.value.assign(&source[entry.source_index]);
        debug!(
            source = entry.source_index,
            target = entry.target_index,
            layer = %entry.target_layer_name,
            shape = %entry.shape,
            "Parameter loaded"
        );
    }

    info!(
        loaded = loaded.len(),
        source = source.len(),
        target = target_shapes.len(),
        "Weights aligned"
    );
    Ok(loaded)
}

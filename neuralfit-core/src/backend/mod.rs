//! Boundary to the numerical framework that builds layers and runs the
//! forward/backward computation.
//!
//! The estimator only ever sees a [`Backend`] (which turns layer specs into a
//! [`LayerGraph`] and compiles it) and the resulting [`CompiledNetwork`]
//! (train / eval / predict over one batch). Parameters live in the graph so
//! that they survive recompilation and persistence.

pub mod graph;
pub mod reference;

pub use graph::{LayerGraph, LayerKind, LayerNode, Nonlinearity, Parameter};
pub use reference::ReferenceBackend;

use crate::batch::Targets;
use crate::error::NetError;
use ndarray::{Array2, ArrayD};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Free-form keyword parameters, keyed without their prefix.
pub type ParamMap = BTreeMap<String, serde_json::Value>;

/// Declarative description of one layer: its name and the factory that
/// builds it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LayerSpec {
    pub name: String,
    pub factory: String,
}

impl LayerSpec {
    pub fn new(name: impl Into<String>, factory: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            factory: factory.into(),
        }
    }
}

/// Everything a backend needs to compile the training functions.
#[derive(Debug, Clone, PartialEq)]
pub struct CompileSetup {
    pub objective_loss: String,
    pub objective_params: ParamMap,
    pub update: String,
    pub update_params: ParamMap,
    pub regression: bool,
}

/// Builds layers and compiles networks.
pub trait Backend: Send {
    fn name(&self) -> &str;

    /// Build the layer described by `spec`. `incoming` holds the already built
    /// layers feeding it and is empty for the input layer.
    fn build_layer(
        &mut self,
        spec: &LayerSpec,
        incoming: &[&LayerNode],
        params: &ParamMap,
    ) -> Result<LayerNode, NetError>;

    /// Compile train / eval / predict functions for `graph`.
    fn compile(
        &mut self,
        graph: &LayerGraph,
        setup: &CompileSetup,
    ) -> Result<Box<dyn CompiledNetwork>, NetError>;
}

/// Compiled per-batch functions. Parameter updates are written back into the
/// graph passed to [`CompiledNetwork::train_batch`].
pub trait CompiledNetwork: Send {
    /// One update step; returns the training loss of the batch.
    fn train_batch(
        &mut self,
        graph: &mut LayerGraph,
        x: &ArrayD<f32>,
        y: &Targets,
    ) -> Result<f64, NetError>;

    /// Deterministic loss and accuracy of the batch.
    fn eval_batch(
        &mut self,
        graph: &LayerGraph,
        x: &ArrayD<f32>,
        y: &Targets,
    ) -> Result<(f64, f64), NetError>;

    /// Class probabilities (classification) or predicted values (regression),
    /// one row per sample.
    fn predict_batch(&mut self, graph: &LayerGraph, x: &ArrayD<f32>)
    -> Result<Array2<f32>, NetError>;
}

/// Read an integer parameter.
pub fn param_usize(params: &ParamMap, key: &str) -> Result<Option<usize>, NetError> {
    match params.get(key) {
        None => Ok(None),
        Some(value) => value
            .as_u64()
            .map(|v| Some(v as usize))
            .ok_or_else(|| NetError::config(format!("'{key}' must be a non-negative integer"))),
    }
}

/// Read a float parameter.
pub fn param_f64(params: &ParamMap, key: &str) -> Result<Option<f64>, NetError> {
    match params.get(key) {
        None => Ok(None),
        Some(value) => value
            .as_f64()
            .map(Some)
            .ok_or_else(|| NetError::config(format!("'{key}' must be a number"))),
    }
}

/// Read a string parameter.
pub fn param_str<'p>(params: &'p ParamMap, key: &str) -> Result<Option<&'p str>, NetError> {
    match params.get(key) {
        None => Ok(None),
        Some(value) => value
            .as_str()
            .map(Some)
            .ok_or_else(|| NetError::config(format!("'{key}' must be a string"))),
    }
}

/// Read a list of dimensions. `null` entries (an unspecified batch size)
/// read as 0.
pub fn param_dims(params: &ParamMap, key: &str) -> Result<Option<Vec<usize>>, NetError> {
    let Some(value) = params.get(key) else {
        return Ok(None);
    };
    let items = value
        .as_array()
        .ok_or_else(|| NetError::config(format!("'{key}' must be a list of dimensions")))?;
    items
        .iter()
        .map(|item| {
            if item.is_null() {
                Ok(0)
            } else {
                item.as_u64()
                    .map(|d| d as usize)
                    .ok_or_else(|| NetError::config(format!("'{key}' holds a non-integer entry")))
            }
        })
        .collect::<Result<Vec<_>, _>>()
        .map(Some)
}

/// Read a `(height, width)` pair given either as one integer or a list of two.
pub fn param_pair(params: &ParamMap, key: &str) -> Result<Option<(usize, usize)>, NetError> {
    match params.get(key) {
        None => Ok(None),
        Some(value) if value.is_u64() => {
            let side = value.as_u64().unwrap_or_default() as usize;
            Ok(Some((side, side)))
        }
        Some(_) => match param_dims(params, key)?.as_deref() {
            Some([h, w]) => Ok(Some((*h, *w))),
            _ => Err(NetError::config(format!("'{key}' must have two entries"))),
        },
    }
}

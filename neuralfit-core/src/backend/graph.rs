//! Materialized layer graph: layers in build order with their parameters.

use crate::alignment::Shape;
use ndarray::ArrayD;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Activation applied by a layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Nonlinearity {
    Rectify,
    Sigmoid,
    Tanh,
    Softmax,
    Linear,
}

impl Nonlinearity {
    pub fn parse(name: &str) -> Option<Self> {
        match name {
            "rectify" | "relu" => Some(Self::Rectify),
            "sigmoid" => Some(Self::Sigmoid),
            "tanh" => Some(Self::Tanh),
            "softmax" => Some(Self::Softmax),
            "linear" | "identity" => Some(Self::Linear),
            _ => None,
        }
    }
}

/// What a layer computes, as far as introspection cares.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum LayerKind {
    Input,
    Dense {
        num_units: usize,
        nonlinearity: Nonlinearity,
    },
    Conv2d {
        num_filters: usize,
        filter_size: (usize, usize),
    },
    MaxPool2d {
        pool_size: (usize, usize),
    },
    /// Any layer the inspection code treats as opaque.
    Other {
        factory: String,
    },
}

impl LayerKind {
    pub fn is_conv(&self) -> bool {
        matches!(self, Self::Conv2d { .. })
    }

    /// Short type name used when a layer has no name of its own.
    pub fn type_name(&self) -> &str {
        match self {
            Self::Input => "InputLayer",
            Self::Dense { .. } => "DenseLayer",
            Self::Conv2d { .. } => "Conv2DLayer",
            Self::MaxPool2d { .. } => "MaxPool2DLayer",
            Self::Other { factory } => factory,
        }
    }
}

/// A learnable tensor owned by a layer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Parameter {
    pub name: String,
    pub value: ArrayD<f32>,
}

impl Parameter {
    pub fn new(name: impl Into<String>, value: ArrayD<f32>) -> Self {
        Self {
            name: name.into(),
            value,
        }
    }

    pub fn shape(&self) -> Shape {
        Shape::from(self.value.shape())
    }
}

/// One built layer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LayerNode {
    pub name: String,
    pub kind: LayerKind,
    /// Names of the layers feeding this one.
    #[serde(default)]
    pub incoming: Vec<String>,
    /// Output shape without the batch axis.
    pub output_shape: Vec<usize>,
    #[serde(default)]
    pub params: Vec<Parameter>,
}

impl LayerNode {
    pub fn new(name: impl Into<String>, kind: LayerKind, output_shape: Vec<usize>) -> Self {
        Self {
            name: name.into(),
            kind,
            incoming: Vec::new(),
            output_shape,
            params: Vec::new(),
        }
    }

    pub fn with_params(mut self, params: Vec<Parameter>) -> Self {
        self.params = params;
        self
    }

    pub fn with_incoming(mut self, incoming: Vec<String>) -> Self {
        self.incoming = incoming;
        self
    }

    /// Flattened output size.
    pub fn output_size(&self) -> usize {
        self.output_shape.iter().product()
    }
}

/// Ordered layers of a network, input first.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LayerGraph {
    layers: Vec<LayerNode>,
}

impl LayerGraph {
    pub fn new() -> Self {
        Self { layers: Vec::new() }
    }

    pub fn push(&mut self, layer: LayerNode) {
        self.layers.push(layer);
    }

    pub fn layers(&self) -> &[LayerNode] {
        &self.layers
    }

    pub fn layers_mut(&mut self) -> &mut [LayerNode] {
        &mut self.layers
    }

    pub fn len(&self) -> usize {
        self.layers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.layers.is_empty()
    }

    pub fn get(&self, name: &str) -> Option<&LayerNode> {
        self.layers.iter().find(|l| l.name == name)
    }

    pub fn input(&self) -> Option<&LayerNode> {
        self.layers.first()
    }

    pub fn output(&self) -> Option<&LayerNode> {
        self.get("output").or_else(|| self.layers.last())
    }

    /// All parameters in traversal order.
    pub fn params(&self) -> impl Iterator<Item = &Parameter> {
        self.layers.iter().flat_map(|l| l.params.iter())
    }

    pub fn params_mut(&mut self) -> impl Iterator<Item = &mut Parameter> {
        self.layers.iter_mut().flat_map(|l| l.params.iter_mut())
    }

    pub fn param_shapes(&self) -> Vec<Shape> {
        self.params().map(Parameter::shape).collect()
    }

    /// Layer index and name owning the flat parameter at `index`.
    pub fn owner_of(&self, index: usize) -> Option<(usize, &LayerNode)> {
        let mut seen = 0;
        for (i, layer) in self.layers.iter().enumerate() {
            if index < seen + layer.params.len() {
                return Some((i, layer));
            }
            seen += layer.params.len();
        }
        None
    }

    /// Total number of learnable scalars.
    pub fn count_params(&self) -> usize {
        self.params().map(|p| p.value.len()).sum()
    }

    pub fn has_conv(&self) -> bool {
        self.layers.iter().any(|l| l.kind.is_conv())
    }
}

impl fmt::Display for LayerGraph {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names: Vec<&str> = self.layers.iter().map(|l| l.name.as_str()).collect();
        write!(f, "LayerGraph[{}]", names.join(" -> "))
    }
}

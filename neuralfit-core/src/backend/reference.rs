//! Pure-Rust backend for small dense networks.
//!
//! Supports `input` and `dense` layers for training. `conv2d` and `maxpool2d`
//! layers can be built (shapes and parameters are allocated so they can be
//! inspected, saved and transplanted) but are rejected at compile time.

use super::{
    Backend, CompileSetup, CompiledNetwork, LayerGraph, LayerKind, LayerNode, LayerSpec,
    Nonlinearity, ParamMap, Parameter, param_dims, param_f64, param_pair, param_str, param_usize,
};
use crate::batch::{Targets, n_samples};
use crate::error::NetError;
use ndarray::{Array1, Array2, ArrayD, ArrayView1, ArrayView2, Axis, Ix1, Ix2, IxDyn, Zip};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

const PROB_EPSILON: f32 = 1e-7;

/// Dense-network backend seeded for reproducible initialisation.
pub struct ReferenceBackend {
    rng: StdRng,
}

impl ReferenceBackend {
    pub fn new(seed: u64) -> Self {
        Self {
            rng: StdRng::seed_from_u64(seed),
        }
    }

    /// Glorot/Xavier uniform initialisation.
    fn glorot_uniform(&mut self, shape: &[usize], fan_in: usize, fan_out: usize) -> ArrayD<f32> {
        let limit = (6.0 / (fan_in + fan_out).max(1) as f64).sqrt() as f32;
        let rng = &mut self.rng;
        ArrayD::from_shape_simple_fn(IxDyn(shape), || rng.gen_range(-limit..=limit))
    }
}

impl Default for ReferenceBackend {
    fn default() -> Self {
        Self::new(42)
    }
}

fn single_incoming<'a>(
    spec: &LayerSpec,
    incoming: &[&'a LayerNode],
) -> Result<&'a LayerNode, NetError> {
    match incoming {
        [one] => Ok(*one),
        [] => Err(NetError::config(format!(
            "layer '{}' has no incoming layer",
            spec.name
        ))),
        _ => Err(NetError::config(format!(
            "layer '{}' ({}) takes exactly one incoming layer, got {}",
            spec.name,
            spec.factory,
            incoming.len()
        ))),
    }
}

fn image_shape(spec: &LayerSpec, prev: &LayerNode) -> Result<(usize, usize, usize), NetError> {
    match prev.output_shape.as_slice() {
        [c, h, w] => Ok((*c, *h, *w)),
        other => Err(NetError::config(format!(
            "layer '{}' needs a (channels, height, width) input, got {:?}",
            spec.name, other
        ))),
    }
}

impl Backend for ReferenceBackend {
    fn name(&self) -> &str {
        "reference"
    }

    fn build_layer(
        &mut self,
        spec: &LayerSpec,
        incoming: &[&LayerNode],
        params: &ParamMap,
    ) -> Result<LayerNode, NetError> {
        match spec.factory.as_str() {
            "input" => {
                if !incoming.is_empty() {
                    return Err(NetError::config(format!(
                        "input layer '{}' cannot have incoming layers",
                        spec.name
                    )));
                }
                let shape = param_dims(params, "shape")?.ok_or_else(|| {
                    NetError::config(format!("input layer '{}' needs a 'shape'", spec.name))
                })?;
                if shape.len() < 2 {
                    return Err(NetError::config(format!(
                        "input shape of '{}' must include the batch axis, got {:?}",
                        spec.name, shape
                    )));
                }
                Ok(LayerNode::new(&spec.name, LayerKind::Input, shape[1..].to_vec()))
            }
            "dense" => {
                let prev = single_incoming(spec, incoming)?;
                let num_units = param_usize(params, "num_units")?
                    .filter(|n| *n > 0)
                    .ok_or_else(|| {
                        NetError::config(format!(
                            "dense layer '{}' needs a positive 'num_units'",
                            spec.name
                        ))
                    })?;
                let nonlinearity = match param_str(params, "nonlinearity")? {
                    None => Nonlinearity::Rectify,
                    Some(name) => Nonlinearity::parse(name).ok_or_else(|| {
                        NetError::config(format!("unknown nonlinearity '{name}'"))
                    })?,
                };
                let n_in = prev.output_size();
                let w = self.glorot_uniform(&[n_in, num_units], n_in, num_units);
                let b = ArrayD::zeros(IxDyn(&[num_units]));
                Ok(LayerNode::new(
                    &spec.name,
                    LayerKind::Dense {
                        num_units,
                        nonlinearity,
                    },
                    vec![num_units],
                )
                .with_incoming(vec![prev.name.clone()])
                .with_params(vec![Parameter::new("W", w), Parameter::new("b", b)]))
            }
            "conv2d" => {
                let prev = single_incoming(spec, incoming)?;
                let (c, h, w) = image_shape(spec, prev)?;
                let num_filters = param_usize(params, "num_filters")?
                    .filter(|n| *n > 0)
                    .ok_or_else(|| {
                        NetError::config(format!(
                            "conv layer '{}' needs a positive 'num_filters'",
                            spec.name
                        ))
                    })?;
                let (fh, fw) = param_pair(params, "filter_size")?.ok_or_else(|| {
                    NetError::config(format!("conv layer '{}' needs a 'filter_size'", spec.name))
                })?;
                if fh == 0 || fw == 0 || fh > h || fw > w {
                    return Err(NetError::config(format!(
                        "filter {fh}x{fw} of '{}' does not fit a {h}x{w} input",
                        spec.name
                    )));
                }
                let field = fh * fw;
                let weights =
                    self.glorot_uniform(&[num_filters, c, fh, fw], c * field, num_filters * field);
                let bias = ArrayD::zeros(IxDyn(&[num_filters]));
                Ok(LayerNode::new(
                    &spec.name,
                    LayerKind::Conv2d {
                        num_filters,
                        filter_size: (fh, fw),
                    },
                    vec![num_filters, h - fh + 1, w - fw + 1],
                )
                .with_incoming(vec![prev.name.clone()])
                .with_params(vec![Parameter::new("W", weights), Parameter::new("b", bias)]))
            }
            "maxpool2d" => {
                let prev = single_incoming(spec, incoming)?;
                let (c, h, w) = image_shape(spec, prev)?;
                let (ph, pw) = param_pair(params, "pool_size")?
                    .or(param_pair(params, "ds")?)
                    .filter(|(ph, pw)| *ph > 0 && *pw > 0)
                    .ok_or_else(|| {
                        NetError::config(format!("pool layer '{}' needs a 'pool_size'", spec.name))
                    })?;
                Ok(LayerNode::new(
                    &spec.name,
                    LayerKind::MaxPool2d {
                        pool_size: (ph, pw),
                    },
                    vec![c, h / ph, w / pw],
                )
                .with_incoming(vec![prev.name.clone()]))
            }
            other => Err(NetError::config(format!(
                "unknown layer factory '{other}' for layer '{}'",
                spec.name
            ))),
        }
    }

    fn compile(
        &mut self,
        graph: &LayerGraph,
        setup: &CompileSetup,
    ) -> Result<Box<dyn CompiledNetwork>, NetError> {
        match graph.input() {
            Some(layer) if layer.kind == LayerKind::Input => {}
            _ => return Err(NetError::backend("graph must start with an input layer")),
        }
        if graph.len() < 2 {
            return Err(NetError::backend("graph has no trainable layers"));
        }
        if let Some(layer) = graph.layers()[1..]
            .iter()
            .find(|l| !matches!(l.kind, LayerKind::Dense { .. }))
        {
            return Err(NetError::backend(format!(
                "reference backend cannot compile layer '{}' ({})",
                layer.name,
                layer.kind.type_name()
            )));
        }

        for pair in graph.layers().windows(2) {
            if pair[1].incoming != [pair[0].name.clone()] {
                return Err(NetError::backend(format!(
                    "reference backend only compiles layer chains; '{}' does not follow '{}'",
                    pair[1].name, pair[0].name
                )));
            }
        }

        let objective = Objective::from_setup(setup)?;
        let update = Update::from_setup(setup)?;
        tracing::debug!(
            backend = self.name(),
            objective = %setup.objective_loss,
            update = %setup.update,
            layers = graph.len(),
            "Compiled network"
        );
        Ok(Box::new(DenseNetwork {
            objective,
            update,
            regression: setup.regression,
            velocities: Vec::new(),
        }))
    }
}

/// Fails on the first key not in `allowed`, reported with its prefix.
fn reject_unknown(params: &ParamMap, allowed: &[&str], prefix: &str) -> Result<(), NetError> {
    match params.keys().find(|key| !allowed.contains(&key.as_str())) {
        Some(key) => Err(NetError::config(format!(
            "unknown {prefix} parameter '{prefix}_{key}'"
        ))),
        None => Ok(()),
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum Loss {
    CategoricalCrossentropy,
    Mse,
}

impl Loss {
    fn parse(name: &str) -> Result<Self, NetError> {
        match name {
            "categorical_crossentropy" => Ok(Self::CategoricalCrossentropy),
            "mse" | "squared_error" => Ok(Self::Mse),
            other => Err(NetError::config(format!("unknown objective loss '{other}'"))),
        }
    }
}

/// Loss plus how it is aggregated over the batch (`objective_aggregate`).
#[derive(Debug, Clone, Copy, PartialEq)]
struct Objective {
    loss: Loss,
    sum: bool,
}

impl Objective {
    fn from_setup(setup: &CompileSetup) -> Result<Self, NetError> {
        let params = &setup.objective_params;
        reject_unknown(params, &["aggregate"], "objective")?;
        let sum = match param_str(params, "aggregate")?.unwrap_or("mean") {
            "mean" => false,
            "sum" => true,
            other => {
                return Err(NetError::config(format!(
                    "objective_aggregate must be 'mean' or 'sum', got '{other}'"
                )));
            }
        };
        Ok(Self {
            loss: Loss::parse(&setup.objective_loss)?,
            sum,
        })
    }

    /// Aggregated loss and its gradient with respect to the network output.
    fn loss_and_grad(&self, out: &Array2<f32>, target: &Array2<f32>) -> (f64, Array2<f32>) {
        let (count, loss, grad) = match self.loss {
            Loss::CategoricalCrossentropy => {
                let n = out.nrows().max(1) as f32;
                let clipped = out.mapv(|p| p.clamp(PROB_EPSILON, 1.0 - PROB_EPSILON));
                let loss = -(target * &clipped.mapv(f32::ln)).sum() / n;
                let grad = -(target / &clipped) / n;
                (n, loss, grad)
            }
            Loss::Mse => {
                let diff = out - target;
                let count = (diff.len().max(1)) as f32;
                let loss = diff.mapv(|d| d * d).sum() / count;
                (count, loss, diff * (2.0 / count))
            }
        };
        if self.sum {
            ((loss * count) as f64, grad * count)
        } else {
            (loss as f64, grad)
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum Update {
    Sgd { learning_rate: f32 },
    Momentum { learning_rate: f32, momentum: f32 },
    Nesterov { learning_rate: f32, momentum: f32 },
}

impl Update {
    fn from_setup(setup: &CompileSetup) -> Result<Self, NetError> {
        let params = &setup.update_params;
        let allowed: &[&str] = match setup.update.as_str() {
            "sgd" => &["learning_rate"],
            _ => &["learning_rate", "momentum"],
        };
        reject_unknown(params, allowed, "update")?;
        let learning_rate = param_f64(params, "learning_rate")?.unwrap_or(0.01) as f32;
        let momentum = param_f64(params, "momentum")?.unwrap_or(0.9) as f32;
        match setup.update.as_str() {
            "sgd" => Ok(Self::Sgd { learning_rate }),
            "momentum" => Ok(Self::Momentum {
                learning_rate,
                momentum,
            }),
            "nesterov_momentum" => Ok(Self::Nesterov {
                learning_rate,
                momentum,
            }),
            other => Err(NetError::config(format!("unknown update rule '{other}'"))),
        }
    }

    fn apply(&self, param: &mut ArrayD<f32>, grad: &ArrayD<f32>, velocity: &mut ArrayD<f32>) {
        match *self {
            Self::Sgd { learning_rate } => param.scaled_add(-learning_rate, grad),
            Self::Momentum {
                learning_rate,
                momentum,
            } => {
                Zip::from(param)
                    .and(grad)
                    .and(velocity)
                    .for_each(|p, &g, v| {
                        *v = momentum * *v - learning_rate * g;
                        *p += *v;
                    });
            }
            Self::Nesterov {
                learning_rate,
                momentum,
            } => {
                Zip::from(param)
                    .and(grad)
                    .and(velocity)
                    .for_each(|p, &g, v| {
                        *v = momentum * *v - learning_rate * g;
                        *p += momentum * *v - learning_rate * g;
                    });
            }
        }
    }
}

struct DenseNetwork {
    objective: Objective,
    update: Update,
    regression: bool,
    /// One velocity buffer per parameter, allocated on the first update.
    velocities: Vec<ArrayD<f32>>,
}

type DenseParts<'a> = (ArrayView2<'a, f32>, ArrayView1<'a, f32>, Nonlinearity);

fn dense_parts(layer: &LayerNode) -> Result<DenseParts<'_>, NetError> {
    let LayerKind::Dense { nonlinearity, .. } = layer.kind else {
        return Err(NetError::backend(format!(
            "layer '{}' is not a dense layer",
            layer.name
        )));
    };
    let [w, b] = layer.params.as_slice() else {
        return Err(NetError::backend(format!(
            "dense layer '{}' must hold exactly W and b",
            layer.name
        )));
    };
    let w = w
        .value
        .view()
        .into_dimensionality::<Ix2>()
        .map_err(|e| NetError::shape(format!("{}.W: {e}", layer.name)))?;
    let b = b
        .value
        .view()
        .into_dimensionality::<Ix1>()
        .map_err(|e| NetError::shape(format!("{}.b: {e}", layer.name)))?;
    Ok((w, b, nonlinearity))
}

fn activate(z: Array2<f32>, nonlinearity: Nonlinearity) -> Array2<f32> {
    match nonlinearity {
        Nonlinearity::Rectify => z.mapv(|v| v.max(0.0)),
        Nonlinearity::Sigmoid => z.mapv(|v| 1.0 / (1.0 + (-v).exp())),
        Nonlinearity::Tanh => z.mapv(f32::tanh),
        Nonlinearity::Linear => z,
        Nonlinearity::Softmax => {
            let mut out = z;
            for mut row in out.rows_mut() {
                let max = row.fold(f32::NEG_INFINITY, |m, &v| m.max(v));
                row.mapv_inplace(|v| (v - max).exp());
                let sum = row.sum();
                row.mapv_inplace(|v| v / sum);
            }
            out
        }
    }
}

/// Gradient with respect to the pre-activation, given the activation output
/// `a` and the gradient `g` with respect to it.
fn activation_grad(a: &Array2<f32>, g: &Array2<f32>, nonlinearity: Nonlinearity) -> Array2<f32> {
    match nonlinearity {
        Nonlinearity::Rectify => {
            let mut dz = g.clone();
            Zip::from(&mut dz).and(a).for_each(|d, &v| {
                if v <= 0.0 {
                    *d = 0.0;
                }
            });
            dz
        }
        Nonlinearity::Sigmoid => g * &a.mapv(|v| v * (1.0 - v)),
        Nonlinearity::Tanh => g * &a.mapv(|v| 1.0 - v * v),
        Nonlinearity::Linear => g.clone(),
        Nonlinearity::Softmax => {
            let dot = (g * a).sum_axis(Axis(1)).insert_axis(Axis(1));
            a * &(g - &dot)
        }
    }
}

fn argmax_rows(m: &Array2<f32>) -> Array1<usize> {
    m.rows()
        .into_iter()
        .map(|row| {
            row.iter()
                .enumerate()
                .fold((0, f32::NEG_INFINITY), |best, (i, &v)| {
                    if v > best.1 { (i, v) } else { best }
                })
                .0
        })
        .collect()
}

/// Targets as a dense matrix matching the network output.
fn target_matrix(y: &Targets, n: usize, n_out: usize) -> Result<Array2<f32>, NetError> {
    if y.len() != n {
        return Err(NetError::shape(format!(
            "got {} targets for {n} samples",
            y.len()
        )));
    }
    match y {
        Targets::Classes(labels) => {
            let mut onehot = Array2::zeros((n, n_out));
            for (row, &label) in labels.iter().enumerate() {
                if label < 0 || label as usize >= n_out {
                    return Err(NetError::invalid_input(format!(
                        "label {label} is outside 0..{n_out}"
                    )));
                }
                onehot[[row, label as usize]] = 1.0;
            }
            Ok(onehot)
        }
        Targets::Values(values) => {
            if values.ncols() != n_out {
                return Err(NetError::shape(format!(
                    "targets have {} columns, network outputs {n_out}",
                    values.ncols()
                )));
            }
            Ok(values.clone())
        }
    }
}

impl DenseNetwork {
    /// Activations of every layer, the flattened input first.
    fn forward(&self, graph: &LayerGraph, x: &ArrayD<f32>) -> Result<Vec<Array2<f32>>, NetError> {
        let input = graph
            .input()
            .ok_or_else(|| NetError::backend("graph has no input layer"))?;
        let n = n_samples(x);
        let features = input.output_size();
        let given: usize = x.shape().iter().skip(1).product();
        if x.ndim() < 2 || given != features {
            return Err(NetError::shape(format!(
                "input layer '{}' expects {:?} per sample, got {:?}",
                input.name,
                input.output_shape,
                x.shape().get(1..).unwrap_or(&[])
            )));
        }
        let flat = x
            .to_owned()
            .into_shape_with_order((n, features))
            .map_err(|e| NetError::shape(e.to_string()))?;

        let mut activations = vec![flat];
        for layer in &graph.layers()[1..] {
            let (w, b, nonlinearity) = dense_parts(layer)?;
            let prev = &activations[activations.len() - 1];
            if prev.ncols() != w.nrows() {
                return Err(NetError::shape(format!(
                    "layer '{}' expects {} inputs, got {}",
                    layer.name,
                    w.nrows(),
                    prev.ncols()
                )));
            }
            let z = prev.dot(&w) + &b;
            activations.push(activate(z, nonlinearity));
        }
        Ok(activations)
    }

    fn accuracy(&self, out: &Array2<f32>, target: &Array2<f32>) -> f64 {
        if out.nrows() == 0 {
            return f64::NAN;
        }
        let predicted = argmax_rows(out);
        let expected = argmax_rows(target);
        let hits = predicted
            .iter()
            .zip(expected.iter())
            .filter(|(p, e)| p == e)
            .count();
        hits as f64 / out.nrows() as f64
    }
}

impl CompiledNetwork for DenseNetwork {
    fn train_batch(
        &mut self,
        graph: &mut LayerGraph,
        x: &ArrayD<f32>,
        y: &Targets,
    ) -> Result<f64, NetError> {
        let activations = self.forward(graph, x)?;
        let out = &activations[activations.len() - 1];
        let target = target_matrix(y, out.nrows(), out.ncols())?;
        let (loss, mut grad) = self.objective.loss_and_grad(out, &target);

        let layers = &graph.layers()[1..];
        let mut grads = Vec::with_capacity(layers.len() * 2);
        for k in (0..layers.len()).rev() {
            let (w, _, nonlinearity) = dense_parts(&layers[k])?;
            let dz = activation_grad(&activations[k + 1], &grad, nonlinearity);
            let dw = activations[k].t().dot(&dz);
            let db = dz.sum_axis(Axis(0));
            if k > 0 {
                grad = dz.dot(&w.t());
            }
            grads.push(db.into_dyn());
            grads.push(dw.into_dyn());
        }
        grads.reverse();

        let shapes_match = self.velocities.len() == grads.len()
            && self
                .velocities
                .iter()
                .zip(&grads)
                .all(|(v, g)| v.shape() == g.shape());
        if !shapes_match {
            self.velocities = grads.iter().map(|g| ArrayD::zeros(g.raw_dim())).collect();
        }

        let update = self.update;
        for ((param, g), v) in graph.layers_mut()[1..]
            .iter_mut()
            .flat_map(|l| l.params.iter_mut())
            .zip(&grads)
            .zip(self.velocities.iter_mut())
        {
            update.apply(&mut param.value, g, v);
        }
        Ok(loss)
    }

    fn eval_batch(
        &mut self,
        graph: &LayerGraph,
        x: &ArrayD<f32>,
        y: &Targets,
    ) -> Result<(f64, f64), NetError> {
        let activations = self.forward(graph, x)?;
        let out = &activations[activations.len() - 1];
        let target = target_matrix(y, out.nrows(), out.ncols())?;
        let (loss, _) = self.objective.loss_and_grad(out, &target);
        let accuracy = if self.regression {
            loss
        } else {
            self.accuracy(out, &target)
        };
        Ok((loss, accuracy))
    }

    fn predict_batch(
        &mut self,
        graph: &LayerGraph,
        x: &ArrayD<f32>,
    ) -> Result<Array2<f32>, NetError> {
        let mut activations = self.forward(graph, x)?;
        activations
            .pop()
            .ok_or_else(|| NetError::backend("forward pass produced no output"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;
    use serde_json::json;

    fn params(value: serde_json::Value) -> ParamMap {
        serde_json::from_value(value).unwrap()
    }

    fn build_mlp(backend: &mut ReferenceBackend, hidden: usize, out_nl: &str) -> LayerGraph {
        let mut graph = LayerGraph::new();
        let input = backend
            .build_layer(
                &LayerSpec::new("input", "input"),
                &[],
                &params(json!({"shape": [null, 2]})),
            )
            .unwrap();
        let hidden_layer = backend
            .build_layer(
                &LayerSpec::new("hidden", "dense"),
                &[&input],
                &params(json!({"num_units": hidden, "nonlinearity": "tanh"})),
            )
            .unwrap();
        let output = backend
            .build_layer(
                &LayerSpec::new("output", "dense"),
                &[&hidden_layer],
                &params(json!({"num_units": 2, "nonlinearity": out_nl})),
            )
            .unwrap();
        graph.push(input);
        graph.push(hidden_layer);
        graph.push(output);
        graph
    }

    fn setup(loss: &str, update: &str, regression: bool) -> CompileSetup {
        let update_params = if update == "sgd" {
            json!({"learning_rate": 0.1})
        } else {
            json!({"learning_rate": 0.1, "momentum": 0.9})
        };
        CompileSetup {
            objective_loss: loss.to_string(),
            objective_params: ParamMap::new(),
            update: update.to_string(),
            update_params: params(update_params),
            regression,
        }
    }

    #[test]
    fn test_build_shapes() {
        let mut backend = ReferenceBackend::new(1);
        let graph = build_mlp(&mut backend, 5, "softmax");
        let shapes: Vec<String> = graph.param_shapes().iter().map(|s| s.to_string()).collect();
        assert_eq!(shapes, vec!["(2, 5)", "(5,)", "(5, 2)", "(2,)"]);
        assert_eq!(graph.layers()[2].incoming, vec!["hidden".to_string()]);
    }

    #[test]
    fn test_same_seed_same_weights() {
        let a = build_mlp(&mut ReferenceBackend::new(7), 4, "softmax");
        let b = build_mlp(&mut ReferenceBackend::new(7), 4, "softmax");
        assert_eq!(a, b);
    }

    #[test]
    fn test_conv_and_pool_shapes() {
        let mut backend = ReferenceBackend::new(1);
        let input = backend
            .build_layer(
                &LayerSpec::new("input", "input"),
                &[],
                &params(json!({"shape": [null, 1, 28, 28]})),
            )
            .unwrap();
        let conv = backend
            .build_layer(
                &LayerSpec::new("conv1", "conv2d"),
                &[&input],
                &params(json!({"num_filters": 32, "filter_size": [5, 5]})),
            )
            .unwrap();
        assert_eq!(conv.output_shape, vec![32, 24, 24]);
        assert_eq!(conv.params[0].value.shape(), &[32, 1, 5, 5]);
        let pool = backend
            .build_layer(
                &LayerSpec::new("pool1", "maxpool2d"),
                &[&conv],
                &params(json!({"pool_size": 2})),
            )
            .unwrap();
        assert_eq!(pool.output_shape, vec![32, 12, 12]);
        assert!(pool.params.is_empty());
    }

    #[test]
    fn test_compile_rejects_conv() {
        let mut backend = ReferenceBackend::new(1);
        let mut graph = LayerGraph::new();
        let input = backend
            .build_layer(
                &LayerSpec::new("input", "input"),
                &[],
                &params(json!({"shape": [null, 1, 8, 8]})),
            )
            .unwrap();
        let conv = backend
            .build_layer(
                &LayerSpec::new("output", "conv2d"),
                &[&input],
                &params(json!({"num_filters": 2, "filter_size": 3})),
            )
            .unwrap();
        graph.push(input);
        graph.push(conv);
        let err = backend
            .compile(&graph, &setup("mse", "sgd", true))
            .err()
            .unwrap();
        assert!(matches!(err, NetError::Backend(_)));
    }

    #[test]
    fn test_compile_rejects_unknown_objective_param() {
        let mut backend = ReferenceBackend::new(1);
        let graph = build_mlp(&mut backend, 3, "softmax");
        let mut bad = setup("categorical_crossentropy", "nesterov_momentum", false);
        bad.objective_params = params(json!({"agregate": "sum"}));
        let err = backend.compile(&graph, &bad).err().unwrap();
        assert!(matches!(err, NetError::Config(_)));
        assert!(err.to_string().contains("objective_agregate"));

        bad.objective_params = params(json!({"aggregate": "median"}));
        assert!(backend.compile(&graph, &bad).is_err());
    }

    #[test]
    fn test_compile_rejects_unknown_update_param() {
        let mut backend = ReferenceBackend::new(1);
        let graph = build_mlp(&mut backend, 3, "softmax");
        let mut bad = setup("categorical_crossentropy", "sgd", false);
        bad.update_params = params(json!({"learning_rate": 0.1, "momentum": 0.9}));
        let err = backend.compile(&graph, &bad).err().unwrap();
        assert!(err.to_string().contains("update_momentum"));
    }

    #[test]
    fn test_sum_aggregate_scales_loss_by_batch() {
        let mut backend = ReferenceBackend::new(3);
        let graph = build_mlp(&mut backend, 3, "softmax");
        let x = ArrayD::from_shape_vec(IxDyn(&[4, 2]), vec![0.0, 1.0, 1.0, 0.0, 0.5, 0.5, 1.0, 1.0])
            .unwrap();
        let y = Targets::Classes(Array1::from(vec![0, 1, 0, 1]));

        let mut mean_net = backend
            .compile(&graph, &setup("categorical_crossentropy", "sgd", false))
            .unwrap();
        let mut sum_setup = setup("categorical_crossentropy", "sgd", false);
        sum_setup.objective_params = params(json!({"aggregate": "sum"}));
        let mut sum_net = backend.compile(&graph, &sum_setup).unwrap();

        let (mean_loss, _) = mean_net.eval_batch(&graph, &x, &y).unwrap();
        let (sum_loss, _) = sum_net.eval_batch(&graph, &x, &y).unwrap();
        assert!((sum_loss - 4.0 * mean_loss).abs() < 1e-4);
    }

    #[test]
    fn test_unknown_factory_is_config_error() {
        let mut backend = ReferenceBackend::new(1);
        let err = backend
            .build_layer(&LayerSpec::new("x", "lstm"), &[], &ParamMap::new())
            .unwrap_err();
        assert!(matches!(err, NetError::Config(_)));
    }

    #[test]
    fn test_softmax_rows_sum_to_one() {
        let out = activate(array![[1.0, 2.0, 3.0], [0.0, 0.0, 0.0]], Nonlinearity::Softmax);
        for row in out.rows() {
            assert!((row.sum() - 1.0).abs() < 1e-6);
        }
    }

    #[test]
    fn test_training_reduces_loss() {
        let mut backend = ReferenceBackend::new(3);
        let mut graph = build_mlp(&mut backend, 8, "softmax");
        let mut net = backend
            .compile(
                &graph,
                &setup("categorical_crossentropy", "nesterov_momentum", false),
            )
            .unwrap();

        let x = array![[0.0f32, 0.0], [0.0, 1.0], [1.0, 0.0], [1.0, 1.0]].into_dyn();
        let y = Targets::Classes(array![0, 1, 1, 0]);
        let (before, _) = net.eval_batch(&graph, &x, &y).unwrap();
        for _ in 0..500 {
            net.train_batch(&mut graph, &x, &y).unwrap();
        }
        let (after, accuracy) = net.eval_batch(&graph, &x, &y).unwrap();
        assert!(after < before, "loss {before} -> {after}");
        assert!(accuracy >= 0.75);
    }

    #[test]
    fn test_label_out_of_range() {
        let mut backend = ReferenceBackend::new(3);
        let mut graph = build_mlp(&mut backend, 3, "softmax");
        let mut net = backend
            .compile(&graph, &setup("categorical_crossentropy", "sgd", false))
            .unwrap();
        let x = array![[0.0f32, 1.0]].into_dyn();
        let err = net
            .train_batch(&mut graph, &x, &Targets::Classes(array![5]))
            .unwrap_err();
        assert!(matches!(err, NetError::InvalidInput(_)));
    }

    #[test]
    fn test_regression_accuracy_is_loss() {
        let mut backend = ReferenceBackend::new(3);
        let graph = build_mlp(&mut backend, 3, "linear");
        let mut net = backend.compile(&graph, &setup("mse", "sgd", true)).unwrap();
        let x = array![[0.5f32, -0.5], [1.0, 2.0]].into_dyn();
        let y = Targets::Values(array![[1.0, 0.0], [0.0, 1.0]]);
        let (loss, accuracy) = net.eval_batch(&graph, &x, &y).unwrap();
        assert_eq!(loss, accuracy);
        let out = net.predict_batch(&graph, &x).unwrap();
        assert_eq!(out.dim(), (2, 2));
    }

    #[test]
    fn test_wrong_input_width_is_shape_error() {
        let mut backend = ReferenceBackend::new(3);
        let graph = build_mlp(&mut backend, 3, "softmax");
        let mut net = backend
            .compile(&graph, &setup("categorical_crossentropy", "sgd", false))
            .unwrap();
        let x = array![[0.0f32, 1.0, 2.0]].into_dyn();
        assert!(matches!(
            net.predict_batch(&graph, &x),
            Err(NetError::Shape(_))
        ));
    }
}

//! Scikit-learn style estimator on top of a [`Backend`].
//!
//! `NeuralNet` builds the layer graph from its [`NetConfig`], compiles it on
//! first use and keeps the training history across `fit` calls. Compiled
//! functions are never persisted; they are rebuilt lazily after a state is
//! loaded or the layers change.

use crate::backend::{
    Backend, CompileSetup, CompiledNetwork, LayerGraph, LayerNode, LayerSpec, Parameter,
};
use crate::batch::{Batch, BatchIterator, BatchTransform, Targets, n_samples};
use crate::config::NetConfig;
use crate::error::NetError;
use crate::inspect::LayerReport;
use crate::occlusion::ProbabilisticModel;
use crate::persistence::{atomic_write_json, load_json};
use crate::split::{LabelEncoder, train_test_split};
use crate::training::{
    CustomScore, EpochFunctions, InterruptFlag, LoopData, LoopState, RunSummary, TrainController,
    TrainHistory, TrainingCallback,
};
use crate::weights::{self, LoadedParam};
use chrono::{DateTime, Utc};
use ndarray::{Array1, Array2, ArrayD, Axis, concatenate};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// Where [`NeuralNet::load_weights_from`] takes its tensors from.
#[derive(Debug, Clone)]
pub enum WeightSource {
    /// A file written by [`NeuralNet::save_weights_to`].
    File(PathBuf),
    /// Tensors in parameter traversal order.
    Tensors(Vec<ArrayD<f32>>),
}

impl From<&Path> for WeightSource {
    fn from(path: &Path) -> Self {
        Self::File(path.to_path_buf())
    }
}

impl From<Vec<ArrayD<f32>>> for WeightSource {
    fn from(tensors: Vec<ArrayD<f32>>) -> Self {
        Self::Tensors(tensors)
    }
}

/// Everything persisted by [`NeuralNet::save_state`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetState {
    pub config: NetConfig,
    #[serde(default)]
    pub layers: Option<LayerGraph>,
    #[serde(default)]
    pub history: TrainHistory,
    #[serde(default)]
    pub encoder: Option<LabelEncoder>,
    pub saved_at: DateTime<Utc>,
}

impl NetState {
    /// Read a state written by [`NeuralNet::save_state`].
    pub fn load(path: &Path) -> Result<Self, NetError> {
        let state: NetState = load_json(path)?
            .ok_or_else(|| NetError::not_found(format!("state file {}", path.display())))?;
        info!(path = %path.display(), saved_at = %state.saved_at, "State loaded");
        Ok(state)
    }
}

/// Estimator with `fit` / `predict` / `predict_proba` / `score`.
pub struct NeuralNet<B: Backend> {
    config: NetConfig,
    backend: B,
    layers: Option<LayerGraph>,
    compiled: Option<Box<dyn CompiledNetwork>>,
    history: TrainHistory,
    encoder: Option<LabelEncoder>,
    callbacks: Vec<Box<dyn TrainingCallback>>,
    custom_score: Option<CustomScore>,
    train_iter: BatchIterator,
    test_iter: BatchIterator,
    interrupt: InterruptFlag,
    state: LoopState,
    log: String,
    layer_infos: String,
}

impl<B: Backend> NeuralNet<B> {
    /// Validate `config` and create an uninitialized estimator.
    pub fn new(config: NetConfig, backend: B) -> Result<Self, NetError> {
        config.validate()?;
        Ok(Self {
            train_iter: BatchIterator::new(config.batch_size_train),
            test_iter: BatchIterator::new(config.batch_size_test),
            config,
            backend,
            layers: None,
            compiled: None,
            history: TrainHistory::new(),
            encoder: None,
            callbacks: Vec::new(),
            custom_score: None,
            interrupt: InterruptFlag::new(),
            state: LoopState::Uninitialized,
            log: String::new(),
            layer_infos: String::new(),
        })
    }

    /// Register a callback; callbacks run in registration order.
    pub fn with_callback(mut self, callback: impl TrainingCallback + 'static) -> Self {
        self.callbacks.push(Box::new(callback));
        self
    }

    pub fn add_callback(&mut self, callback: Box<dyn TrainingCallback>) {
        self.callbacks.push(callback);
    }

    pub fn with_custom_score(mut self, score: CustomScore) -> Self {
        self.custom_score = Some(score);
        self
    }

    /// Per-batch transform applied to training batches only.
    pub fn with_train_transform(mut self, transform: BatchTransform) -> Self {
        self.train_iter = BatchIterator::new(self.config.batch_size_train).with_transform(transform);
        self
    }

    /// Share an interrupt flag, e.g. one raised by a Ctrl-C handler.
    pub fn with_interrupt(mut self, interrupt: InterruptFlag) -> Self {
        self.interrupt = interrupt;
        self
    }

    pub fn config(&self) -> &NetConfig {
        &self.config
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    pub fn state(&self) -> LoopState {
        self.state
    }

    pub fn interrupt(&self) -> &InterruptFlag {
        &self.interrupt
    }

    pub fn is_initialized(&self) -> bool {
        self.compiled.is_some()
    }

    pub fn layers(&self) -> Option<&LayerGraph> {
        self.layers.as_ref()
    }

    pub fn train_history(&self) -> &TrainHistory {
        &self.history
    }

    /// The rendered history table of the last epoch.
    pub fn log(&self) -> &str {
        &self.log
    }

    /// The layer table rendered by the last initialize.
    pub fn layer_infos(&self) -> &str {
        &self.layer_infos
    }

    pub fn classes(&self) -> Option<&[i64]> {
        self.encoder.as_ref().map(LabelEncoder::classes)
    }

    /// `prefix_*` keyword parameters with the prefix stripped.
    pub fn get_params_for(&self, prefix: &str) -> crate::backend::ParamMap {
        self.config.params_for(prefix)
    }

    /// Build the graph if needed and compile the network functions. Calling
    /// it again is a no-op until the layers change.
    pub fn initialize(&mut self) -> Result<(), NetError> {
        if self.compiled.is_some() {
            return Ok(());
        }
        if self.layers.is_none() {
            self.initialize_layers(None)?;
        }
        let graph = self
            .layers
            .as_ref()
            .ok_or_else(|| NetError::usage("layer graph missing after initialization"))?;

        let setup = CompileSetup {
            objective_loss: self.config.objective_loss().to_string(),
            objective_params: self.config.params_for("objective"),
            update: self.config.update.clone(),
            update_params: self.config.params_for("update"),
            regression: self.config.regression,
        };
        self.compiled = Some(self.backend.compile(graph, &setup)?);
        if self.state == LoopState::Uninitialized {
            self.state = LoopState::Initialized;
        }
        info!(
            backend = self.backend.name(),
            layers = graph.len(),
            params = graph.count_params(),
            "Network initialized"
        );

        if self.config.verbose > 0 {
            let report = LayerReport::build(graph, self.config.verbose)?;
            println!("{report}");
            self.layer_infos = report.table;
        }
        Ok(())
    }

    /// (Re)build the layer graph, optionally replacing the layer specs first.
    ///
    /// Every layer receives the keyword parameters collected for its name. An
    /// `incoming` parameter (a name or a list of names) selects the layers
    /// feeding it; otherwise the previously built layer does. Rebuilding
    /// discards the compiled functions. Returns the output layer.
    pub fn initialize_layers(
        &mut self,
        layers: Option<Vec<LayerSpec>>,
    ) -> Result<&LayerNode, NetError> {
        if let Some(layers) = layers {
            let mut config = self.config.clone();
            config.layers = layers;
            config.validate()?;
            self.config = config;
        }

        let mut graph = LayerGraph::new();
        for (i, spec) in self.config.layers.iter().enumerate() {
            let mut params = self.config.params_for(&spec.name);
            let incoming_names = match params.remove("incoming") {
                Some(value) => incoming_names(&spec.name, &value)?,
                None if i == 0 => Vec::new(),
                None => vec![self.config.layers[i - 1].name.clone()],
            };
            let incoming = incoming_names
                .iter()
                .map(|name| {
                    graph.get(name).ok_or_else(|| {
                        NetError::config(format!(
                            "layer '{}' takes input from unknown layer '{name}'",
                            spec.name
                        ))
                    })
                })
                .collect::<Result<Vec<_>, _>>()?;
            let node = self.backend.build_layer(spec, &incoming, &params)?;
            debug!(layer = %node.name, shape = ?node.output_shape, "Layer built");
            graph.push(node);
        }

        self.compiled = None;
        self.state = LoopState::Uninitialized;
        let graph = self.layers.insert(graph);
        graph
            .output()
            .ok_or_else(|| NetError::config("the network has no output layer"))
    }

    /// Train on `x` / `y`, continuing any existing history. An interrupt
    /// ends training early without an error.
    pub fn fit(&mut self, x: &ArrayD<f32>, y: &Targets) -> Result<RunSummary, NetError> {
        let y = if self.config.use_label_encoder {
            let labels = y.as_classes().ok_or_else(|| {
                NetError::invalid_input("label encoding requires integer class labels")
            })?;
            let encoder = LabelEncoder::fit(&labels.to_vec());
            let encoded = encoder.transform(labels)?;
            self.encoder = Some(encoder);
            Targets::Classes(encoded)
        } else {
            y.clone()
        };
        self.initialize()?;
        self.train_loop(x, &y)
    }

    /// Run the epoch loop on already encoded targets.
    pub fn train_loop(&mut self, x: &ArrayD<f32>, y: &Targets) -> Result<RunSummary, NetError> {
        self.initialize()?;
        let split = train_test_split(x, y, self.config.eval_size, self.config.regression)?;

        let mut controller = TrainController::new(self.config.max_epochs)
            .with_verbose(self.config.verbose)
            .with_custom_score(self.custom_score.clone())
            .with_interrupt(self.interrupt.clone());

        let (Some(graph), Some(network)) = (self.layers.as_mut(), self.compiled.as_mut()) else {
            return Err(NetError::usage("the net is not initialized"));
        };
        let mut funcs = BoundNetwork {
            network: &mut **network,
            graph,
        };
        let data = LoopData {
            x_train: &split.x_train,
            y_train: &split.y_train,
            x_valid: &split.x_valid,
            y_valid: &split.y_valid,
            train_iter: &self.train_iter,
            valid_iter: &self.test_iter,
        };

        let result = controller.run(data, &mut funcs, &mut self.history, &mut self.callbacks);
        self.state = controller.state();
        self.log = self.history.to_table();
        result
    }

    /// Network outputs for `x`, batched with the test batch size.
    pub fn predict_proba(&mut self, x: &ArrayD<f32>) -> Result<Array2<f32>, NetError> {
        self.initialize()?;
        let (Some(graph), Some(network)) = (self.layers.as_ref(), self.compiled.as_mut()) else {
            return Err(NetError::usage("the net is not initialized"));
        };

        let outputs = self
            .test_iter
            .iter(x, None)
            .map(|batch| network.predict_batch(graph, &batch.x))
            .collect::<Result<Vec<_>, _>>()?;
        if outputs.is_empty() {
            let width = graph.output().map(LayerNode::output_size).unwrap_or(0);
            return Ok(Array2::zeros((0, width)));
        }
        let views: Vec<_> = outputs.iter().map(|o| o.view()).collect();
        concatenate(Axis(0), &views).map_err(|e| NetError::shape(e.to_string()))
    }

    /// Predicted values (regression) or predicted class labels, mapped back
    /// through the label encoder when one is in use.
    pub fn predict(&mut self, x: &ArrayD<f32>) -> Result<Targets, NetError> {
        let proba = self.predict_proba(x)?;
        if self.config.regression {
            return Ok(Targets::Values(proba));
        }
        let classes = Array1::from(
            proba
                .outer_iter()
                .map(|row| argmax(row.iter().copied()) as i64)
                .collect::<Vec<_>>(),
        );
        match (&self.encoder, self.config.use_label_encoder) {
            (Some(encoder), true) => Ok(Targets::Classes(encoder.inverse_transform(&classes)?)),
            _ => Ok(Targets::Classes(classes)),
        }
    }

    /// Accuracy for classification, mean squared error for regression.
    pub fn score(&mut self, x: &ArrayD<f32>, y: &Targets) -> Result<f64, NetError> {
        if n_samples(x) != y.len() {
            return Err(NetError::shape(format!(
                "x has {} samples but y has {}",
                n_samples(x),
                y.len()
            )));
        }
        match (self.predict(x)?, y) {
            (Targets::Classes(predicted), Targets::Classes(expected)) => {
                if expected.is_empty() {
                    return Ok(f64::NAN);
                }
                let hits = predicted
                    .iter()
                    .zip(expected.iter())
                    .filter(|(p, e)| p == e)
                    .count();
                Ok(hits as f64 / expected.len() as f64)
            }
            (Targets::Values(predicted), Targets::Values(expected)) => {
                if predicted.dim() != expected.dim() {
                    return Err(NetError::shape(format!(
                        "predictions have shape {:?}, targets {:?}",
                        predicted.dim(),
                        expected.dim()
                    )));
                }
                let diff = &predicted - expected;
                Ok(diff.mapv(|d| f64::from(d) * f64::from(d)).mean().unwrap_or(f64::NAN))
            }
            _ => Err(NetError::invalid_input(
                "targets do not match the estimator's task (classification vs regression)",
            )),
        }
    }

    /// All parameters in traversal order; empty before the layers are built.
    pub fn get_all_params(&self) -> Vec<&Parameter> {
        self.layers
            .as_ref()
            .map(|g| g.params().collect())
            .unwrap_or_default()
    }

    pub fn count_params(&self) -> usize {
        self.layers.as_ref().map_or(0, LayerGraph::count_params)
    }

    /// Write all parameter values to `path`; returns the file's SHA-256.
    pub fn save_weights_to(&self, path: &Path) -> Result<String, NetError> {
        let graph = self
            .layers
            .as_ref()
            .ok_or_else(|| NetError::usage("the net has no parameters to save yet"))?;
        weights::save_weights(path, &weights::collect(graph))
    }

    /// Copy weights into this net wherever parameter shapes align. The
    /// architectures need not match.
    pub fn load_weights_from(
        &mut self,
        source: impl Into<WeightSource>,
    ) -> Result<Vec<LoadedParam>, NetError> {
        let graph = self
            .layers
            .as_mut()
            .ok_or_else(|| NetError::usage("Please initialize the net before loading weights."))?;
        let tensors = match source.into() {
            WeightSource::File(path) => weights::load_weights(&path)?,
            WeightSource::Tensors(tensors) => tensors,
        };
        let loaded = weights::transplant(&tensors, graph)?;
        if self.config.verbose > 0 {
            for entry in &loaded {
                println!("{entry}");
            }
        }
        Ok(loaded)
    }

    /// Copy weights from another estimator.
    pub fn load_weights_from_net<C: Backend>(
        &mut self,
        other: &NeuralNet<C>,
    ) -> Result<Vec<LoadedParam>, NetError> {
        let source = other
            .layers
            .as_ref()
            .ok_or_else(|| NetError::usage("the source net has no parameters yet"))?;
        self.load_weights_from(weights::collect(source))
    }

    /// Snapshot of everything that survives a save / load cycle.
    pub fn to_state(&self) -> NetState {
        NetState {
            config: self.config.clone(),
            layers: self.layers.clone(),
            history: self.history.clone(),
            encoder: self.encoder.clone(),
            saved_at: Utc::now(),
        }
    }

    /// Persist config, layers, history and label encoder as JSON.
    pub fn save_state(&self, path: &Path) -> Result<(), NetError> {
        atomic_write_json(path, &self.to_state())?;
        info!(path = %path.display(), epochs = self.history.len(), "State saved");
        Ok(())
    }

    /// Rebuild an estimator from a state. The network is compiled on first
    /// use.
    pub fn from_state(state: NetState, backend: B) -> Result<Self, NetError> {
        let mut net = Self::new(state.config, backend)?;
        net.layers = state.layers;
        net.history = state.history;
        net.encoder = state.encoder;
        net.log = if net.history.is_empty() {
            String::new()
        } else {
            net.history.to_table()
        };
        Ok(net)
    }

    pub fn load_state(path: &Path, backend: B) -> Result<Self, NetError> {
        Self::from_state(NetState::load(path)?, backend)
    }
}

impl<B: Backend> ProbabilisticModel for NeuralNet<B> {
    fn predict_proba(&mut self, x: &ArrayD<f32>) -> Result<Array2<f32>, NetError> {
        NeuralNet::predict_proba(self, x)
    }
}

impl<B: Backend> std::fmt::Debug for NeuralNet<B> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NeuralNet")
            .field("backend", &self.backend.name())
            .field("layers", &self.config.layers)
            .field("state", &self.state)
            .field("epochs", &self.history.len())
            .finish()
    }
}

/// Compiled functions bound to the graph they update.
struct BoundNetwork<'a> {
    network: &'a mut dyn CompiledNetwork,
    graph: &'a mut LayerGraph,
}

fn batch_targets(batch: &Batch) -> Result<&Targets, NetError> {
    batch
        .y
        .as_ref()
        .ok_or_else(|| NetError::invalid_input("batch has no targets"))
}

impl EpochFunctions for BoundNetwork<'_> {
    fn train(&mut self, batch: &Batch) -> Result<f64, NetError> {
        self.network
            .train_batch(self.graph, &batch.x, batch_targets(batch)?)
    }

    fn eval(&mut self, batch: &Batch) -> Result<(f64, f64), NetError> {
        self.network
            .eval_batch(self.graph, &batch.x, batch_targets(batch)?)
    }

    fn predict(&mut self, batch: &Batch) -> Result<Array2<f32>, NetError> {
        self.network.predict_batch(self.graph, &batch.x)
    }
}

fn incoming_names(layer: &str, value: &serde_json::Value) -> Result<Vec<String>, NetError> {
    let invalid = || {
        NetError::config(format!(
            "'{layer}_incoming' must be a layer name or a list of names"
        ))
    };
    match value {
        serde_json::Value::String(name) => Ok(vec![name.clone()]),
        serde_json::Value::Array(items) => items
            .iter()
            .map(|item| item.as_str().map(str::to_string).ok_or_else(invalid))
            .collect(),
        _ => Err(invalid()),
    }
}

/// Index of the largest value; the first one wins ties.
fn argmax(values: impl Iterator<Item = f32>) -> usize {
    let mut best = 0;
    let mut best_value = f32::NEG_INFINITY;
    for (i, v) in values.enumerate() {
        if v > best_value {
            best = i;
            best_value = v;
        }
    }
    best
}

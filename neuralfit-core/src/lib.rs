//! # neuralfit-core: estimator-style neural network training
//!
//! A `fit` / `predict` / `score` estimator over a pluggable numerical
//! [`backend::Backend`], with:
//!
//! 1. **Training loop**: epoch bookkeeping, best-loss tracking, callbacks,
//!    resumable history and cooperative interrupts ([`training`]).
//! 2. **Weight transplant**: shape-aligned parameter copying between
//!    networks of different architectures ([`alignment`], [`weights`]).
//! 3. **Diagnostics**: layer tables, conv capacity and occlusion maps
//!    ([`inspect`], [`occlusion`]).

// Foundation
pub mod config;
pub mod error;
pub mod persistence;

// Data
pub mod batch;
pub mod split;

// Network boundary
pub mod backend;

// Training
pub mod estimator;
pub mod training;

// Weights
pub mod alignment;
pub mod weights;

// Diagnostics
pub mod inspect;
pub mod occlusion;

pub use alignment::{Shape, align};
pub use backend::{Backend, CompiledNetwork, LayerGraph, LayerSpec, ReferenceBackend};
pub use batch::{Batch, BatchIterator, Targets};
pub use config::{NetConfig, extract_config, load_config};
pub use error::NetError;
pub use estimator::{NetState, NeuralNet, WeightSource};
pub use training::{
    CallbackAction, CustomScore, EarlyStopping, InterruptFlag, LoopState, TrainHistory,
    TrainingCallback,
};

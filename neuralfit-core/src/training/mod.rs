//! Training loop: controller, history, callbacks and interrupts.

pub mod callbacks;
pub mod controller;
pub mod history;
pub mod interrupt;

pub use callbacks::{CallbackAction, EarlyStopping, FnCallback, SaveHistory, TrainingCallback};
pub use controller::{
    CustomScore, EpochFunctions, LoopData, LoopState, RunSummary, ScoreFn, StopReason,
    TrainController,
};
pub use history::{EpochRecord, NamedScore, TrainHistory};
pub use interrupt::InterruptFlag;

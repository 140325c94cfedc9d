//! Training callbacks: early stopping and history snapshots.

use crate::error::NetError;
use crate::persistence::atomic_write_json;
use crate::training::controller::TrainController;
use crate::training::history::TrainHistory;
use std::path::PathBuf;
use tracing::{debug, warn};

/// Action a callback can request after an epoch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallbackAction {
    Continue,
    Stop,
}

/// Hook invoked by the training loop.
///
/// `on_epoch_finished` runs after every epoch with the full history, the last
/// record being the epoch just finished. `on_training_finished` runs exactly
/// once per `run`, however the loop ended.
pub trait TrainingCallback: Send {
    fn name(&self) -> &str;

    fn on_epoch_finished(
        &mut self,
        controller: &TrainController,
        history: &TrainHistory,
    ) -> Result<CallbackAction, NetError>;

    fn on_training_finished(
        &mut self,
        _controller: &TrainController,
        _history: &TrainHistory,
    ) -> Result<(), NetError> {
        Ok(())
    }
}

/// Stops when the validation loss has not improved for `patience` epochs.
#[derive(Debug, Clone)]
pub struct EarlyStopping {
    pub patience: usize,
    best_valid: f64,
    best_epoch: usize,
}

impl EarlyStopping {
    pub fn new(patience: usize) -> Self {
        Self {
            patience,
            best_valid: f64::INFINITY,
            best_epoch: 0,
        }
    }

    pub fn best_epoch(&self) -> usize {
        self.best_epoch
    }

    fn observe(&mut self, epoch: usize, valid_loss: f64) -> CallbackAction {
        if valid_loss < self.best_valid {
            self.best_valid = valid_loss;
            self.best_epoch = epoch;
            return CallbackAction::Continue;
        }
        if epoch >= self.best_epoch + self.patience {
            CallbackAction::Stop
        } else {
            CallbackAction::Continue
        }
    }
}

impl TrainingCallback for EarlyStopping {
    fn name(&self) -> &str {
        "early_stopping"
    }

    fn on_epoch_finished(
        &mut self,
        _controller: &TrainController,
        history: &TrainHistory,
    ) -> Result<CallbackAction, NetError> {
        let Some(last) = history.last() else {
            return Ok(CallbackAction::Continue);
        };
        let action = self.observe(last.epoch, last.valid_loss);
        if action == CallbackAction::Stop {
            warn!(
                best_valid = self.best_valid,
                best_epoch = self.best_epoch,
                "Early stopping"
            );
        }
        Ok(action)
    }
}

/// Writes the history as JSON after every epoch and once more at the end.
#[derive(Debug, Clone)]
pub struct SaveHistory {
    path: PathBuf,
}

impl SaveHistory {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl TrainingCallback for SaveHistory {
    fn name(&self) -> &str {
        "save_history"
    }

    fn on_epoch_finished(
        &mut self,
        _controller: &TrainController,
        history: &TrainHistory,
    ) -> Result<CallbackAction, NetError> {
        atomic_write_json(&self.path, history)?;
        debug!(path = %self.path.display(), epochs = history.len(), "History saved");
        Ok(CallbackAction::Continue)
    }

    fn on_training_finished(
        &mut self,
        _controller: &TrainController,
        history: &TrainHistory,
    ) -> Result<(), NetError> {
        atomic_write_json(&self.path, history)
    }
}

type EpochFn = Box<dyn FnMut(&TrainController, &TrainHistory) -> CallbackAction + Send>;
type FinishedFn = Box<dyn FnMut(&TrainController, &TrainHistory) + Send>;

/// Callback built from closures.
pub struct FnCallback {
    name: String,
    on_epoch: Option<EpochFn>,
    on_finished: Option<FinishedFn>,
}

impl FnCallback {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            on_epoch: None,
            on_finished: None,
        }
    }

    pub fn on_epoch(
        mut self,
        f: impl FnMut(&TrainController, &TrainHistory) -> CallbackAction + Send + 'static,
    ) -> Self {
        self.on_epoch = Some(Box::new(f));
        self
    }

    pub fn on_finished(
        mut self,
        f: impl FnMut(&TrainController, &TrainHistory) + Send + 'static,
    ) -> Self {
        self.on_finished = Some(Box::new(f));
        self
    }
}

impl std::fmt::Debug for FnCallback {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FnCallback").field("name", &self.name).finish()
    }
}

impl TrainingCallback for FnCallback {
    fn name(&self) -> &str {
        &self.name
    }

    fn on_epoch_finished(
        &mut self,
        controller: &TrainController,
        history: &TrainHistory,
    ) -> Result<CallbackAction, NetError> {
        Ok(match self.on_epoch.as_mut() {
            Some(f) => f(controller, history),
            None => CallbackAction::Continue,
        })
    }

    fn on_training_finished(
        &mut self,
        controller: &TrainController,
        history: &TrainHistory,
    ) -> Result<(), NetError> {
        if let Some(f) = self.on_finished.as_mut() {
            f(controller, history);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::training::history::EpochRecord;
    use tempfile::TempDir;

    fn history_with(valid_losses: &[f64]) -> TrainHistory {
        let mut history = TrainHistory::new();
        for (i, &valid) in valid_losses.iter().enumerate() {
            history.push(EpochRecord {
                epoch: i + 1,
                train_loss: valid,
                valid_loss: valid,
                valid_best: None,
                train_val_ratio: 1.0,
                valid_accuracy: 0.0,
                custom_score: None,
                duration: 0.0,
            });
        }
        history
    }

    #[test]
    fn test_early_stopping() {
        let mut cb = EarlyStopping::new(2);
        assert_eq!(cb.observe(1, 0.5), CallbackAction::Continue);
        assert_eq!(cb.observe(2, 0.4), CallbackAction::Continue);
        assert_eq!(cb.observe(3, 0.45), CallbackAction::Continue);
        assert_eq!(cb.observe(4, 0.4), CallbackAction::Stop);
        assert_eq!(cb.best_epoch(), 2);
    }

    #[test]
    fn test_early_stopping_reads_last_record() {
        let controller = TrainController::new(10);
        let mut cb = EarlyStopping::new(1);
        let action = cb
            .on_epoch_finished(&controller, &history_with(&[0.3]))
            .unwrap();
        assert_eq!(action, CallbackAction::Continue);
        let action = cb
            .on_epoch_finished(&controller, &history_with(&[0.3, 0.4]))
            .unwrap();
        assert_eq!(action, CallbackAction::Stop);
    }

    #[test]
    fn test_save_history_writes_json() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("history.json");
        let controller = TrainController::new(10);
        let mut cb = SaveHistory::new(&path);
        cb.on_epoch_finished(&controller, &history_with(&[0.5, 0.4]))
            .unwrap();

        let loaded: TrainHistory = crate::persistence::load_json(&path).unwrap().unwrap();
        assert_eq!(loaded.len(), 2);
    }

    #[test]
    fn test_fn_callback() {
        let controller = TrainController::new(10);
        let mut cb = FnCallback::new("stop_at_two").on_epoch(|_, history| {
            if history.len() >= 2 {
                CallbackAction::Stop
            } else {
                CallbackAction::Continue
            }
        });
        assert_eq!(cb.name(), "stop_at_two");
        assert_eq!(
            cb.on_epoch_finished(&controller, &history_with(&[0.5]))
                .unwrap(),
            CallbackAction::Continue
        );
        assert_eq!(
            cb.on_epoch_finished(&controller, &history_with(&[0.5, 0.4]))
                .unwrap(),
            CallbackAction::Stop
        );
    }
}

//! Epoch loop: drives train / eval batches, aggregates per-epoch metrics,
//! tracks the best losses and dispatches callbacks.

use crate::batch::{Batch, BatchIterator, Targets};
use crate::error::NetError;
use crate::training::callbacks::{CallbackAction, TrainingCallback};
use crate::training::history::{EpochRecord, NamedScore, TrainHistory, mean};
use crate::training::interrupt::InterruptFlag;
use ndarray::{Array2, ArrayD};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, warn};

/// Lifecycle of an estimator and its training loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LoopState {
    /// No layer graph yet.
    Uninitialized,
    /// Graph built and functions compiled, never trained.
    Initialized,
    Training,
    /// The last run ended by exhausting its epochs or by an interrupt.
    Idle,
    /// The last run ended because a callback asked it to.
    Stopped,
}

/// Why a run ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StopReason {
    MaxEpochs,
    /// Name of the callback that requested the stop.
    Callback(String),
    Interrupted,
}

/// Outcome of one [`TrainController::run`].
#[derive(Debug, Clone, PartialEq)]
pub struct RunSummary {
    pub state: LoopState,
    pub epochs_run: usize,
    pub stop: StopReason,
}

/// Scorer called on every validation batch with the true targets and the
/// predicted probabilities; the batch scores are averaged per epoch.
pub type ScoreFn = Arc<dyn Fn(&Targets, &Array2<f32>) -> f64 + Send + Sync>;

/// Named custom validation score.
#[derive(Clone)]
pub struct CustomScore {
    pub name: String,
    pub scorer: ScoreFn,
}

impl CustomScore {
    pub fn new(
        name: impl Into<String>,
        scorer: impl Fn(&Targets, &Array2<f32>) -> f64 + Send + Sync + 'static,
    ) -> Self {
        Self {
            name: name.into(),
            scorer: Arc::new(scorer),
        }
    }
}

impl fmt::Debug for CustomScore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CustomScore")
            .field("name", &self.name)
            .finish()
    }
}

/// The per-batch network functions the loop calls.
pub trait EpochFunctions {
    /// One update step; returns the batch training loss.
    fn train(&mut self, batch: &Batch) -> Result<f64, NetError>;

    /// Deterministic loss and accuracy of a batch.
    fn eval(&mut self, batch: &Batch) -> Result<(f64, f64), NetError>;

    /// Probabilities for a batch.
    fn predict(&mut self, batch: &Batch) -> Result<Array2<f32>, NetError>;
}

/// Train and validation data with the iterators that batch them.
#[derive(Debug, Clone, Copy)]
pub struct LoopData<'a> {
    pub x_train: &'a ArrayD<f32>,
    pub y_train: &'a Targets,
    pub x_valid: &'a ArrayD<f32>,
    pub y_valid: &'a Targets,
    pub train_iter: &'a BatchIterator,
    pub valid_iter: &'a BatchIterator,
}

/// Drives the epoch loop. Owns no network or data; those are lent per run.
#[derive(Debug, Clone)]
pub struct TrainController {
    max_epochs: usize,
    verbose: u8,
    custom_score: Option<CustomScore>,
    interrupt: InterruptFlag,
    state: LoopState,
    header_printed: bool,
}

impl TrainController {
    pub fn new(max_epochs: usize) -> Self {
        Self {
            max_epochs,
            verbose: 0,
            custom_score: None,
            interrupt: InterruptFlag::new(),
            state: LoopState::Initialized,
            header_printed: false,
        }
    }

    pub fn with_verbose(mut self, verbose: u8) -> Self {
        self.verbose = verbose;
        self
    }

    pub fn with_custom_score(mut self, score: Option<CustomScore>) -> Self {
        self.custom_score = score;
        self
    }

    pub fn with_interrupt(mut self, interrupt: InterruptFlag) -> Self {
        self.interrupt = interrupt;
        self
    }

    pub fn max_epochs(&self) -> usize {
        self.max_epochs
    }

    pub fn verbose(&self) -> u8 {
        self.verbose
    }

    pub fn state(&self) -> LoopState {
        self.state
    }

    pub fn interrupt(&self) -> &InterruptFlag {
        &self.interrupt
    }

    pub fn custom_score_name(&self) -> Option<&str> {
        self.custom_score.as_ref().map(|s| s.name.as_str())
    }

    /// Run up to `max_epochs` epochs, appending one record per finished epoch
    /// to `history`.
    ///
    /// Epoch numbering and the best-loss minima continue from whatever
    /// `history` already holds. An interrupt ends the run cleanly; any other
    /// error from `funcs` or a callback is returned after the state is reset.
    pub fn run(
        &mut self,
        data: LoopData<'_>,
        funcs: &mut dyn EpochFunctions,
        history: &mut TrainHistory,
        callbacks: &mut [Box<dyn TrainingCallback>],
    ) -> Result<RunSummary, NetError> {
        let first_epoch = history.len();
        let mut best_train = history.best_train_loss().unwrap_or(f64::INFINITY);
        let mut best_valid = history.best_valid_loss().unwrap_or(f64::INFINITY);
        let mut epochs_run = 0;
        let mut stop = StopReason::MaxEpochs;

        info!(
            max_epochs = self.max_epochs,
            train_samples = data.y_train.len(),
            valid_samples = data.y_valid.len(),
            resume_from = first_epoch,
            "Training started"
        );
        self.state = LoopState::Training;

        for offset in 0..self.max_epochs {
            let epoch = first_epoch + offset + 1;
            let record = match self.run_epoch(epoch, &data, funcs, &mut best_train, &mut best_valid)
            {
                Ok(record) => record,
                Err(err) if err.is_interrupt() => {
                    warn!(epoch, "Training interrupted");
                    stop = StopReason::Interrupted;
                    break;
                }
                Err(err) => {
                    self.state = LoopState::Idle;
                    return Err(err);
                }
            };

            debug!(
                epoch,
                train_loss = record.train_loss,
                valid_loss = record.valid_loss,
                valid_accuracy = record.valid_accuracy,
                "Epoch finished"
            );
            history.push(record);
            epochs_run += 1;
            if self.verbose > 0 {
                self.print_progress(history);
            }

            match self.dispatch_epoch_finished(history, callbacks) {
                Ok(Some(name)) => {
                    warn!(epoch, callback = %name, "Stop requested");
                    stop = StopReason::Callback(name);
                    break;
                }
                Ok(None) => {}
                Err(err) => {
                    self.state = LoopState::Idle;
                    return Err(err);
                }
            }
        }

        for callback in callbacks.iter_mut() {
            if let Err(err) = callback.on_training_finished(self, history) {
                self.state = LoopState::Idle;
                return Err(err);
            }
        }

        self.state = match stop {
            StopReason::Callback(_) => LoopState::Stopped,
            _ => LoopState::Idle,
        };
        info!(epochs_run, total_epochs = history.len(), stop = ?stop, "Training finished");
        Ok(RunSummary {
            state: self.state,
            epochs_run,
            stop,
        })
    }

    fn run_epoch(
        &mut self,
        epoch: usize,
        data: &LoopData<'_>,
        funcs: &mut dyn EpochFunctions,
        best_train: &mut f64,
        best_valid: &mut f64,
    ) -> Result<EpochRecord, NetError> {
        let started = Instant::now();

        let mut train_losses = Vec::new();
        for batch in data.train_iter.iter(data.x_train, Some(data.y_train)) {
            self.check_interrupt()?;
            train_losses.push(funcs.train(&batch)?);
        }

        let mut valid_losses = Vec::new();
        let mut valid_accuracies = Vec::new();
        let mut custom_scores = Vec::new();
        for batch in data.valid_iter.iter(data.x_valid, Some(data.y_valid)) {
            self.check_interrupt()?;
            let (loss, accuracy) = funcs.eval(&batch)?;
            valid_losses.push(loss);
            valid_accuracies.push(accuracy);

            if let (Some(score), Some(y)) = (&self.custom_score, &batch.y) {
                let probabilities = funcs.predict(&batch)?;
                custom_scores.push((score.scorer)(y, &probabilities));
            }
        }

        let avg_train = mean(&train_losses);
        let avg_valid = mean(&valid_losses);
        let avg_accuracy = mean(&valid_accuracies);

        *best_train = best_train.min(avg_train);
        *best_valid = best_valid.min(avg_valid);

        Ok(EpochRecord {
            epoch,
            train_loss: avg_train,
            valid_loss: avg_valid,
            valid_best: (*best_valid == avg_valid).then_some(avg_valid),
            train_val_ratio: avg_train / avg_valid,
            valid_accuracy: avg_accuracy,
            custom_score: self.custom_score.as_ref().map(|s| NamedScore {
                name: s.name.clone(),
                value: mean(&custom_scores),
            }),
            duration: started.elapsed().as_secs_f64(),
        })
    }

    /// Returns the name of the first callback that asked to stop. Later
    /// callbacks of the same epoch are not called.
    fn dispatch_epoch_finished(
        &self,
        history: &TrainHistory,
        callbacks: &mut [Box<dyn TrainingCallback>],
    ) -> Result<Option<String>, NetError> {
        for callback in callbacks.iter_mut() {
            if callback.on_epoch_finished(self, history)? == CallbackAction::Stop {
                return Ok(Some(callback.name().to_string()));
            }
        }
        Ok(None)
    }

    fn check_interrupt(&self) -> Result<(), NetError> {
        if self.interrupt.take() {
            Err(NetError::Interrupted)
        } else {
            Ok(())
        }
    }

    fn print_progress(&mut self, history: &TrainHistory) {
        let table = history.to_table();
        let lines: Vec<&str> = table.lines().collect();
        if !self.header_printed {
            for line in lines.iter().take(2) {
                println!("{line}");
            }
            self.header_printed = true;
        }
        if let Some(line) = lines.last() {
            println!("{line}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::training::callbacks::FnCallback;
    use ndarray::{Array1, IxDyn};
    use std::sync::Mutex;

    /// Scripted network: the train loss of epoch `e` is `losses[e]`, the
    /// valid loss is `valid[e]`.
    struct Scripted {
        train: Vec<f64>,
        valid: Vec<f64>,
        epoch: usize,
        train_calls: usize,
        fail_on_train: Option<usize>,
        interrupt_on_train: Option<(usize, InterruptFlag)>,
    }

    impl Scripted {
        fn new(train: Vec<f64>, valid: Vec<f64>) -> Self {
            Self {
                train,
                valid,
                epoch: 0,
                train_calls: 0,
                fail_on_train: None,
                interrupt_on_train: None,
            }
        }
    }

    impl EpochFunctions for Scripted {
        fn train(&mut self, _batch: &Batch) -> Result<f64, NetError> {
            self.train_calls += 1;
            if self.fail_on_train == Some(self.train_calls) {
                return Err(NetError::backend("boom"));
            }
            if let Some((at, flag)) = &self.interrupt_on_train {
                if *at == self.train_calls {
                    flag.raise();
                }
            }
            Ok(self.train[self.epoch % self.train.len()])
        }

        fn eval(&mut self, _batch: &Batch) -> Result<(f64, f64), NetError> {
            let loss = self.valid[self.epoch % self.valid.len()];
            self.epoch += 1;
            Ok((loss, 0.5))
        }

        fn predict(&mut self, batch: &Batch) -> Result<Array2<f32>, NetError> {
            Ok(Array2::from_elem((batch.size(), 2), 0.5))
        }
    }

    struct Fixture {
        x: ArrayD<f32>,
        y: Targets,
        iter: BatchIterator,
    }

    impl Fixture {
        /// Four samples in one batch, so every epoch has exactly one train
        /// and one valid batch.
        fn new() -> Self {
            Self {
                x: ArrayD::zeros(IxDyn(&[4, 2])),
                y: Targets::Classes(Array1::from(vec![0, 1, 0, 1])),
                iter: BatchIterator::new(4),
            }
        }

        fn data(&self) -> LoopData<'_> {
            LoopData {
                x_train: &self.x,
                y_train: &self.y,
                x_valid: &self.x,
                y_valid: &self.y,
                train_iter: &self.iter,
                valid_iter: &self.iter,
            }
        }
    }

    #[test]
    fn test_runs_max_epochs() {
        let fixture = Fixture::new();
        let mut funcs = Scripted::new(vec![1.0, 0.8, 0.6], vec![0.9, 0.7, 0.8]);
        let mut history = TrainHistory::new();
        let mut controller = TrainController::new(3);

        let summary = controller
            .run(fixture.data(), &mut funcs, &mut history, &mut [])
            .unwrap();

        assert_eq!(summary.epochs_run, 3);
        assert_eq!(summary.stop, StopReason::MaxEpochs);
        assert_eq!(summary.state, LoopState::Idle);
        let records = history.records();
        assert_eq!(records[0].valid_best, Some(0.9));
        assert_eq!(records[1].valid_best, Some(0.7));
        assert_eq!(records[2].valid_best, None);
        assert!((records[0].train_val_ratio - 1.0 / 0.9).abs() < 1e-12);
    }

    #[test]
    fn test_resume_continues_numbering() {
        let fixture = Fixture::new();
        let mut funcs = Scripted::new(vec![1.0], vec![0.5, 0.6, 0.4, 0.7, 0.3]);
        let mut history = TrainHistory::new();

        TrainController::new(2)
            .run(fixture.data(), &mut funcs, &mut history, &mut [])
            .unwrap();
        TrainController::new(3)
            .run(fixture.data(), &mut funcs, &mut history, &mut [])
            .unwrap();

        let epochs: Vec<usize> = history.records().iter().map(|r| r.epoch).collect();
        assert_eq!(epochs, vec![1, 2, 3, 4, 5]);
        // Minima are seeded from the earlier run: 0.4 only counts as best
        // because it beats 0.5 from the first run.
        let best: Vec<Option<f64>> = history.records().iter().map(|r| r.valid_best).collect();
        assert_eq!(best, vec![Some(0.5), None, Some(0.4), None, Some(0.3)]);
    }

    #[test]
    fn test_tie_counts_as_best() {
        let fixture = Fixture::new();
        let mut funcs = Scripted::new(vec![1.0], vec![0.5, 0.5]);
        let mut history = TrainHistory::new();
        TrainController::new(2)
            .run(fixture.data(), &mut funcs, &mut history, &mut [])
            .unwrap();
        assert_eq!(history.records()[1].valid_best, Some(0.5));
    }

    #[test]
    fn test_callback_stop_after_second_epoch() {
        let fixture = Fixture::new();
        let mut funcs = Scripted::new(vec![1.0], vec![0.5]);
        let mut history = TrainHistory::new();
        let finished = Arc::new(Mutex::new(0usize));
        let later_calls = Arc::new(Mutex::new(0usize));

        let finished_count = finished.clone();
        let later_count = later_calls.clone();
        let mut callbacks: Vec<Box<dyn TrainingCallback>> = vec![
            Box::new(
                FnCallback::new("stopper")
                    .on_epoch(|_, history| {
                        if history.len() == 2 {
                            CallbackAction::Stop
                        } else {
                            CallbackAction::Continue
                        }
                    })
                    .on_finished(move |_, _| *finished_count.lock().unwrap() += 1),
            ),
            Box::new(FnCallback::new("after").on_epoch(move |_, _| {
                *later_count.lock().unwrap() += 1;
                CallbackAction::Continue
            })),
        ];

        let mut controller = TrainController::new(3);
        let summary = controller
            .run(fixture.data(), &mut funcs, &mut history, &mut callbacks)
            .unwrap();

        assert_eq!(history.len(), 2);
        assert_eq!(*finished.lock().unwrap(), 1);
        assert_eq!(*later_calls.lock().unwrap(), 1);
        assert_eq!(summary.stop, StopReason::Callback("stopper".into()));
        assert_eq!(controller.state(), LoopState::Stopped);
    }

    #[test]
    fn test_interrupt_is_clean_stop() {
        let fixture = Fixture::new();
        let flag = InterruptFlag::new();
        let mut funcs = Scripted::new(vec![1.0], vec![0.5]);
        // Raised during the second epoch's train batch; noticed before the
        // valid batch of that epoch.
        funcs.interrupt_on_train = Some((2, flag.clone()));
        let finished = Arc::new(Mutex::new(0usize));
        let finished_count = finished.clone();
        let mut callbacks: Vec<Box<dyn TrainingCallback>> = vec![Box::new(
            FnCallback::new("count").on_finished(move |_, _| *finished_count.lock().unwrap() += 1),
        )];

        let mut history = TrainHistory::new();
        let summary = TrainController::new(5)
            .with_interrupt(flag.clone())
            .run(fixture.data(), &mut funcs, &mut history, &mut callbacks)
            .unwrap();

        assert_eq!(summary.stop, StopReason::Interrupted);
        assert_eq!(summary.state, LoopState::Idle);
        assert_eq!(history.len(), 1);
        assert_eq!(*finished.lock().unwrap(), 1);
        assert!(!flag.is_raised());
    }

    #[test]
    fn test_backend_error_propagates() {
        let fixture = Fixture::new();
        let mut funcs = Scripted::new(vec![1.0], vec![0.5]);
        funcs.fail_on_train = Some(2);
        let mut history = TrainHistory::new();
        let mut controller = TrainController::new(5);

        let result = controller.run(fixture.data(), &mut funcs, &mut history, &mut []);
        assert!(matches!(result, Err(NetError::Backend(_))));
        assert_eq!(history.len(), 1);
        assert_eq!(controller.state(), LoopState::Idle);
    }

    #[test]
    fn test_custom_score_is_recorded() {
        let fixture = Fixture::new();
        let mut funcs = Scripted::new(vec![1.0], vec![0.5]);
        let mut history = TrainHistory::new();
        let score = CustomScore::new("mean_proba", |_, proba| {
            proba.iter().map(|&p| p as f64).sum::<f64>() / proba.len() as f64
        });

        TrainController::new(1)
            .with_custom_score(Some(score))
            .run(fixture.data(), &mut funcs, &mut history, &mut [])
            .unwrap();

        let custom = history.records()[0].custom_score.clone().unwrap();
        assert_eq!(custom.name, "mean_proba");
        assert_eq!(custom.value, 0.5);
    }

    #[test]
    fn test_empty_validation_set() {
        let x = ArrayD::zeros(IxDyn(&[4, 2]));
        let y = Targets::Classes(Array1::from(vec![0, 1, 0, 1]));
        let x_valid = ArrayD::zeros(IxDyn(&[0, 2]));
        let y_valid = Targets::Classes(Array1::from(Vec::<i64>::new()));
        let iter = BatchIterator::new(4);
        let data = LoopData {
            x_train: &x,
            y_train: &y,
            x_valid: &x_valid,
            y_valid: &y_valid,
            train_iter: &iter,
            valid_iter: &iter,
        };
        let mut funcs = Scripted::new(vec![1.0], vec![0.5]);
        let mut history = TrainHistory::new();

        TrainController::new(1)
            .run(data, &mut funcs, &mut history, &mut [])
            .unwrap();

        let record = &history.records()[0];
        assert_eq!(record.train_loss, 1.0);
        assert!(record.valid_loss.is_nan());
        assert_eq!(record.valid_best, None);
    }
}

//! End-to-end tests of the estimator on the reference backend.

use std::sync::{Arc, Mutex};

use ndarray::{Array1, ArrayD, IxDyn};
use neuralfit_core::training::{FnCallback, SaveHistory, StopReason};
use neuralfit_core::{
    CallbackAction, EarlyStopping, InterruptFlag, LayerSpec, LoopState, NetConfig, NeuralNet,
    ReferenceBackend, Targets, TrainHistory,
};
use serde_json::json;
use tempfile::TempDir;

/// Two Gaussian-ish blobs, linearly separable.
fn blobs(n: usize) -> (ArrayD<f32>, Targets) {
    let x = ArrayD::from_shape_fn(IxDyn(&[n, 2]), |ix| {
        let class = (ix[0] % 2) as f32;
        let jitter = ((ix[0] * 7 + ix[1] * 3) % 5) as f32 / 10.0;
        class * 2.0 - 1.0 + jitter
    });
    let y = Targets::Classes(Array1::from_shape_fn(n, |i| (i % 2) as i64));
    (x, y)
}

fn config(max_epochs: usize) -> NetConfig {
    let mut config = NetConfig::new(vec![
        LayerSpec::new("input", "input"),
        LayerSpec::new("hidden", "dense"),
        LayerSpec::new("output", "dense"),
    ])
    .with_param("input_shape", json!([null, 2]))
    .with_param("hidden_num_units", 4)
    .with_param("output_num_units", 2)
    .with_param("output_nonlinearity", "softmax")
    .with_param("update_learning_rate", 0.05);
    config.max_epochs = max_epochs;
    config.batch_size_train = 8;
    config.batch_size_test = 8;
    config
}

#[test]
fn stop_after_second_epoch_runs_finished_once() {
    let (x, y) = blobs(40);
    let finished = Arc::new(Mutex::new(0usize));
    let counter = finished.clone();
    let mut net = NeuralNet::new(config(3), ReferenceBackend::new(1))
        .unwrap()
        .with_callback(
            FnCallback::new("stop_at_two")
                .on_epoch(|_, history| {
                    if history.len() == 2 {
                        CallbackAction::Stop
                    } else {
                        CallbackAction::Continue
                    }
                })
                .on_finished(move |_, _| *counter.lock().unwrap() += 1),
        );

    let summary = net.fit(&x, &y).unwrap();
    assert_eq!(net.train_history().len(), 2);
    assert_eq!(*finished.lock().unwrap(), 1);
    assert_eq!(summary.stop, StopReason::Callback("stop_at_two".into()));
    assert_eq!(net.state(), LoopState::Stopped);
}

#[test]
fn train_save_resume_and_transplant() {
    let dir = TempDir::new().unwrap();
    let state_path = dir.path().join("net.json");
    let weights_path = dir.path().join("net.bin");
    let history_path = dir.path().join("history.json");
    let (x, y) = blobs(40);

    let mut net = NeuralNet::new(config(4), ReferenceBackend::new(2))
        .unwrap()
        .with_callback(SaveHistory::new(&history_path));
    net.fit(&x, &y).unwrap();
    net.save_state(&state_path).unwrap();
    net.save_weights_to(&weights_path).unwrap();

    let saved: TrainHistory = serde_json::from_str(&std::fs::read_to_string(&history_path).unwrap())
        .unwrap();
    assert_eq!(saved.len(), 4);

    // Resume from the saved state: numbering continues.
    let mut resumed = NeuralNet::load_state(&state_path, ReferenceBackend::default()).unwrap();
    resumed.fit(&x, &y).unwrap();
    let epochs: Vec<usize> = resumed
        .train_history()
        .records()
        .iter()
        .map(|r| r.epoch)
        .collect();
    assert_eq!(epochs, (1..=8).collect::<Vec<_>>());
    let running = resumed.train_history().running_best_valid();
    assert!(running.windows(2).all(|w| w[1] <= w[0]));

    // A deeper net picks up the input-side layer from the file.
    let deeper = NetConfig::new(vec![
        LayerSpec::new("input", "input"),
        LayerSpec::new("hidden", "dense"),
        LayerSpec::new("hidden2", "dense"),
        LayerSpec::new("output", "dense"),
    ])
    .with_param("input_shape", json!([null, 2]))
    .with_param("hidden_num_units", 4)
    .with_param("hidden2_num_units", 6)
    .with_param("output_num_units", 2)
    .with_param("output_nonlinearity", "softmax");
    let mut target = NeuralNet::new(deeper, ReferenceBackend::new(9)).unwrap();
    target.initialize().unwrap();
    let loaded = target.load_weights_from(weights_path.as_path()).unwrap();
    let pairs: Vec<(usize, usize)> = loaded
        .iter()
        .map(|l| (l.source_index, l.target_index))
        .collect();
    assert_eq!(pairs, vec![(0, 0), (1, 1), (3, 5)]);
    assert_eq!(
        net.get_all_params()[0].value,
        target.get_all_params()[0].value
    );
}

#[test]
fn early_stopping_ends_training() {
    let (x, y) = blobs(40);
    let mut cfg = config(50);
    // Learning rate 0 keeps the valid loss flat, so patience runs out.
    cfg.params
        .insert("update_learning_rate".into(), json!(0.0));
    let mut net = NeuralNet::new(cfg, ReferenceBackend::new(4))
        .unwrap()
        .with_callback(EarlyStopping::new(3));
    let summary = net.fit(&x, &y).unwrap();
    assert_eq!(summary.stop, StopReason::Callback("early_stopping".into()));
    assert_eq!(net.train_history().len(), 4);
}

#[test]
fn interrupt_before_fit_is_swallowed() {
    let (x, y) = blobs(16);
    let flag = InterruptFlag::new();
    let mut net = NeuralNet::new(config(5), ReferenceBackend::new(5))
        .unwrap()
        .with_interrupt(flag.clone());
    flag.raise();

    let summary = net.fit(&x, &y).unwrap();
    assert_eq!(summary.stop, StopReason::Interrupted);
    assert!(net.train_history().is_empty());
    assert_eq!(net.state(), LoopState::Idle);

    // The flag was consumed; the next fit trains normally.
    net.fit(&x, &y).unwrap();
    assert_eq!(net.train_history().len(), 5);
}

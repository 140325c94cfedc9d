//! CLI subcommand handlers.

use crate::dataset::{Dataset, matrix_to_json, targets_to_json};
use crate::{Commands, ConfigAction};
use anyhow::{Context, bail};
use neuralfit_core::training::StopReason;
use neuralfit_core::{
    EarlyStopping, NetState, NeuralNet, ReferenceBackend, Shape, align, extract_config,
    inspect::LayerReport, load_config, weights,
};
use std::path::{Path, PathBuf};
use tracing::{info, warn};

/// Handle a CLI subcommand.
pub async fn handle_command(command: Commands) -> anyhow::Result<()> {
    match command {
        Commands::Train {
            config,
            data,
            state,
            resume,
            weights_out,
            weights_in,
            patience,
        } => {
            handle_train(TrainArgs {
                config,
                data,
                state,
                resume,
                weights_out,
                weights_in,
                patience,
            })
            .await
        }
        Commands::Predict { state, data, proba } => handle_predict(&state, &data, proba),
        Commands::History { state } => handle_history(&state),
        Commands::Layers { state, detailed } => handle_layers(&state, detailed),
        Commands::Align {
            source,
            target,
            source_shapes,
            target_shapes,
        } => handle_align(
            shapes_from(source.as_deref(), source_shapes.as_deref(), "source")?,
            shapes_from(target.as_deref(), target_shapes.as_deref(), "target")?,
        ),
        Commands::Config { action } => handle_config(action),
    }
}

struct TrainArgs {
    config: Option<PathBuf>,
    data: PathBuf,
    state: Option<PathBuf>,
    resume: bool,
    weights_out: Option<PathBuf>,
    weights_in: Option<PathBuf>,
    patience: Option<usize>,
}

/// A resumed network keeps its saved configuration; otherwise `--config`
/// builds a fresh one.
fn build_net(args: &TrainArgs) -> anyhow::Result<NeuralNet<ReferenceBackend>> {
    if let (Some(state), true) = (&args.state, args.resume) {
        if let Some(config) = &args.config {
            warn!(
                config = %config.display(),
                "--config is ignored with --resume; using the saved configuration"
            );
        }
        return load_net(state);
    }
    let path = args
        .config
        .as_deref()
        .context("--config is required unless --resume is given")?;
    let config = load_config(Some(path), None)
        .map_err(|e| anyhow::anyhow!("Configuration error: {}", e))?;
    let backend = ReferenceBackend::new(config.seed);
    NeuralNet::new(config, backend).map_err(|e| anyhow::anyhow!("{}", e))
}

async fn handle_train(args: TrainArgs) -> anyhow::Result<()> {
    let mut net = build_net(&args)?;

    let dataset = Dataset::load(&args.data)?;
    let x = dataset.inputs()?;
    let y = dataset.targets(net.config().regression)?;

    if let Some(path) = &args.weights_in {
        net.initialize().map_err(|e| anyhow::anyhow!("{}", e))?;
        let loaded = net
            .load_weights_from(path.as_path())
            .map_err(|e| anyhow::anyhow!("Failed to load weights: {}", e))?;
        if loaded.is_empty() {
            warn!(path = %path.display(), "No parameters matched the weights file");
        }
        println!("Transplanted {} parameter(s) from {}", loaded.len(), path.display());
    }
    if let Some(patience) = args.patience {
        net.add_callback(Box::new(EarlyStopping::new(patience)));
    }

    // Ctrl-C stops training after the current batch; the history is kept.
    let interrupt = net.interrupt().clone();
    let watcher = tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupt received, stopping after the current batch");
            interrupt.raise();
        }
    });

    let (net, summary) = tokio::task::spawn_blocking(move || {
        let summary = net.fit(&x, &y)?;
        Ok::<_, neuralfit_core::NetError>((net, summary))
    })
    .await?
    .map_err(|e| anyhow::anyhow!("Training failed: {}", e))?;
    watcher.abort();

    let reason = match &summary.stop {
        StopReason::MaxEpochs => "max epochs reached".to_string(),
        StopReason::Callback(name) => format!("stopped by {name}"),
        StopReason::Interrupted => "interrupted".to_string(),
    };
    println!(
        "Trained {} epoch(s), {} ({} in history)",
        summary.epochs_run,
        reason,
        net.train_history().len()
    );
    if let Some(best) = net.train_history().best_valid_loss() {
        println!("Best validation loss: {best:.6}");
    }

    if let Some(path) = &args.state {
        net.save_state(path)
            .map_err(|e| anyhow::anyhow!("Failed to save state: {}", e))?;
        info!(path = %path.display(), "State saved");
    }
    if let Some(path) = &args.weights_out {
        let digest = net
            .save_weights_to(path)
            .map_err(|e| anyhow::anyhow!("Failed to save weights: {}", e))?;
        println!("Weights written to {} (sha256 {digest})", path.display());
    }
    Ok(())
}

fn handle_predict(state: &Path, data: &Path, proba: bool) -> anyhow::Result<()> {
    let mut net = load_net(state)?;
    let x = Dataset::load(data)?.inputs()?;
    let output = if proba {
        matrix_to_json(&net.predict_proba(&x).map_err(|e| anyhow::anyhow!("{}", e))?)
    } else {
        targets_to_json(&net.predict(&x).map_err(|e| anyhow::anyhow!("{}", e))?)
    };
    println!("{}", serde_json::to_string_pretty(&output)?);
    Ok(())
}

fn handle_history(state: &Path) -> anyhow::Result<()> {
    let net = load_net(state)?;
    let history = net.train_history();
    if history.is_empty() {
        println!("No epochs recorded.");
        return Ok(());
    }
    println!("{}", history.to_table());
    Ok(())
}

fn handle_layers(state: &Path, detailed: bool) -> anyhow::Result<()> {
    let mut net = load_net(state)?;
    if net.layers().is_none() {
        net.initialize_layers(None)
            .map_err(|e| anyhow::anyhow!("{}", e))?;
    }
    let graph = net.layers().context("network has no layers")?;
    let report = LayerReport::build(graph, if detailed { 2 } else { 1 })
        .map_err(|e| anyhow::anyhow!("{}", e))?;
    print!("{report}");
    Ok(())
}

fn handle_align(source: Vec<Shape>, target: Vec<Shape>) -> anyhow::Result<()> {
    let pairs = align(&source, &target);
    if pairs.is_empty() {
        println!("No matching parameters.");
        return Ok(());
    }
    for (i, j) in &pairs {
        println!("{i} -> {j}  {}", source[*i].to_x_string());
    }
    println!(
        "{} of {} target parameter(s) matched",
        pairs.len(),
        target.len()
    );
    Ok(())
}

fn handle_config(action: ConfigAction) -> anyhow::Result<()> {
    match action {
        ConfigAction::Show { config, json } => {
            println!("{}", render_config(config.as_deref(), json)?);
            Ok(())
        }
    }
}

/// The merged configuration as TOML (or JSON). Not validated, so a partial
/// config without layers can still be inspected.
fn render_config(file: Option<&Path>, json: bool) -> anyhow::Result<String> {
    let config = extract_config(file, None)
        .map_err(|e| anyhow::anyhow!("Failed to load config: {}", e))?;
    if let Err(e) = config.validate() {
        warn!(error = %e, "Configuration is not valid for training");
    }
    if json {
        return Ok(serde_json::to_string_pretty(&config)?);
    }
    match toml::to_string_pretty(&config) {
        Ok(text) => Ok(text),
        Err(e) => {
            // TOML has no null, which `[null, 28, 28]` style shapes need.
            warn!(error = %e, "Config is not representable as TOML, printing JSON");
            Ok(serde_json::to_string_pretty(&config)?)
        }
    }
}

/// Load a saved network with a backend seeded from its own configuration.
fn load_net(path: &Path) -> anyhow::Result<NeuralNet<ReferenceBackend>> {
    let state = NetState::load(path)
        .map_err(|e| anyhow::anyhow!("Failed to load state {}: {}", path.display(), e))?;
    let backend = ReferenceBackend::new(state.config.seed);
    NeuralNet::from_state(state, backend)
        .map_err(|e| anyhow::anyhow!("Failed to restore state {}: {}", path.display(), e))
}

fn shapes_from(
    file: Option<&Path>,
    spec: Option<&str>,
    side: &str,
) -> anyhow::Result<Vec<Shape>> {
    match (file, spec) {
        (Some(path), _) => {
            let tensors = weights::load_weights(path)
                .map_err(|e| anyhow::anyhow!("Failed to load {}: {}", path.display(), e))?;
            Ok(tensors.iter().map(|t| Shape::from(t.shape())).collect())
        }
        (None, Some(spec)) => parse_shapes(spec),
        (None, None) => bail!("give --{side} or --{side}-shapes"),
    }
}

/// Parse `3x3,64,10` into three shapes. An empty string is no shapes.
fn parse_shapes(spec: &str) -> anyhow::Result<Vec<Shape>> {
    spec.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|item| {
            let dims = item
                .split('x')
                .map(|d| {
                    d.trim()
                        .parse::<usize>()
                        .with_context(|| format!("invalid dimension '{d}' in '{item}'"))
                })
                .collect::<anyhow::Result<Vec<_>>>()?;
            Ok(Shape::new(dims))
        })
        .collect()
}

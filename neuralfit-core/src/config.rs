//! Estimator hyperparameters.
//!
//! Uses `figment` for layered configuration: defaults -> user config file ->
//! explicit config file -> environment -> overrides. Layer and optimizer
//! settings are free-form keyword parameters addressed by prefix
//! (`hidden_num_units`, `update_learning_rate`, `objective_...`).

use crate::backend::{LayerSpec, ParamMap, param_dims};
use crate::error::NetError;
use figment::Figment;
use figment::providers::{Env, Format, Serialized, Toml};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};

/// Keys that used to be accepted and now have replacements.
const REMOVED_KEYS: &[(&str, &str)] = &[
    (
        "loss",
        "The 'loss' parameter was removed, please use 'objective_loss_function' instead.",
    ),
    (
        "batch_iterator",
        "The 'batch_iterator' argument has been replaced. \
         Use 'batch_size_train' and 'batch_size_test' instead.",
    ),
];

/// Hyperparameters of a [`crate::estimator::NeuralNet`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NetConfig {
    /// Layer specs in build order; the first is the input layer and the last
    /// must be named `output`.
    #[serde(default)]
    pub layers: Vec<LayerSpec>,
    #[serde(default = "default_update")]
    pub update: String,
    /// Defaults to `mse` for regression and `categorical_crossentropy`
    /// otherwise.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub objective_loss_function: Option<String>,
    #[serde(default = "default_batch_size")]
    pub batch_size_train: usize,
    #[serde(default = "default_batch_size")]
    pub batch_size_test: usize,
    #[serde(default)]
    pub regression: bool,
    #[serde(default = "default_max_epochs")]
    pub max_epochs: usize,
    /// Fraction of samples held out for validation; 0 disables validation.
    #[serde(default = "default_eval_size")]
    pub eval_size: f64,
    #[serde(default)]
    pub use_label_encoder: bool,
    #[serde(default)]
    pub verbose: u8,
    /// Seed for weight initialization.
    #[serde(default = "default_seed")]
    pub seed: u64,
    /// Keyword parameters, each prefixed by a layer name, `update_` or
    /// `objective_`.
    #[serde(default)]
    pub params: ParamMap,
    /// Extra parameters looked up by prefix but never checked for use.
    #[serde(default)]
    pub more_params: ParamMap,
}

impl Default for NetConfig {
    fn default() -> Self {
        Self {
            layers: Vec::new(),
            update: default_update(),
            objective_loss_function: None,
            batch_size_train: default_batch_size(),
            batch_size_test: default_batch_size(),
            regression: false,
            max_epochs: default_max_epochs(),
            eval_size: default_eval_size(),
            use_label_encoder: false,
            verbose: 0,
            seed: default_seed(),
            params: ParamMap::new(),
            more_params: ParamMap::new(),
        }
    }
}

fn default_update() -> String {
    "nesterov_momentum".to_string()
}

fn default_batch_size() -> usize {
    128
}

fn default_max_epochs() -> usize {
    100
}

fn default_eval_size() -> f64 {
    0.2
}

fn default_seed() -> u64 {
    42
}

impl NetConfig {
    pub fn new(layers: Vec<LayerSpec>) -> Self {
        Self {
            layers,
            ..Self::default()
        }
    }

    /// Set a keyword parameter.
    pub fn with_param(mut self, key: impl Into<String>, value: impl Into<serde_json::Value>) -> Self {
        self.params.insert(key.into(), value.into());
        self
    }

    /// The objective loss in effect.
    pub fn objective_loss(&self) -> &str {
        match &self.objective_loss_function {
            Some(name) => name,
            None if self.regression => "mse",
            None => "categorical_crossentropy",
        }
    }

    /// Name of the input layer, if any layers are configured.
    pub fn input_name(&self) -> Option<&str> {
        self.layers.first().map(|l| l.name.as_str())
    }

    /// Collect `prefix_*` entries from `params` and `more_params`, with the
    /// prefix stripped. `more_params` wins on collision.
    pub fn params_for(&self, prefix: &str) -> ParamMap {
        let prefix = format!("{prefix}_");
        self.params
            .iter()
            .chain(self.more_params.iter())
            .filter_map(|(key, value)| {
                key.strip_prefix(&prefix)
                    .map(|rest| (rest.to_string(), value.clone()))
            })
            .collect()
    }

    /// Check the configuration the way the estimator constructor does.
    pub fn validate(&self) -> Result<(), NetError> {
        for (key, message) in REMOVED_KEYS {
            if self.params.contains_key(*key) {
                return Err(NetError::config(*message));
            }
        }

        if self.layers.is_empty() {
            return Err(NetError::config("at least one layer is required"));
        }
        let mut seen = HashSet::new();
        for layer in &self.layers {
            if layer.name.is_empty() {
                return Err(NetError::config("layer names must not be empty"));
            }
            if !seen.insert(layer.name.as_str()) {
                return Err(NetError::config(format!(
                    "duplicate layer name '{}'",
                    layer.name
                )));
            }
        }
        if self.layers.last().map(|l| l.name.as_str()) != Some("output") {
            return Err(NetError::config("the last layer must be named 'output'"));
        }

        self.check_unused_params()?;
        self.check_input_shape()?;

        if self.batch_size_train == 0 || self.batch_size_test == 0 {
            return Err(NetError::config("batch sizes must be positive"));
        }
        if !(0.0..1.0).contains(&self.eval_size) {
            return Err(NetError::config(format!(
                "eval_size must be in [0, 1), got {}",
                self.eval_size
            )));
        }
        Ok(())
    }

    fn check_unused_params(&self) -> Result<(), NetError> {
        let prefixes: Vec<String> = self
            .layers
            .iter()
            .map(|l| l.name.as_str())
            .chain(["update", "objective"])
            .map(|name| format!("{name}_"))
            .collect();
        for key in self.params.keys() {
            if !prefixes.iter().any(|p| key.starts_with(p.as_str())) {
                return Err(NetError::config(format!("Unused kwarg: {key}")));
            }
        }
        Ok(())
    }

    fn check_input_shape(&self) -> Result<(), NetError> {
        let Some(input) = self.input_name() else {
            return Ok(());
        };
        let key = format!("{input}_shape");
        let merged = self.params_for(input);
        match param_dims(&merged, "shape")? {
            None => Err(NetError::config(format!("missing '{key}'"))),
            Some(dims) if !(2..=4).contains(&dims.len()) => Err(NetError::config(format!(
                "'{key}' must have 2 to 4 dimensions including the batch axis, got {}",
                dims.len()
            ))),
            Some(_) => Ok(()),
        }
    }
}

/// Directory holding the user-level `config.toml`.
pub fn user_config_dir() -> Option<PathBuf> {
    directories::ProjectDirs::from("dev", "neuralfit", "neuralfit")
        .map(|dirs| dirs.config_dir().to_path_buf())
}

/// Load configuration from layered sources.
///
/// Priority (highest to lowest):
/// 1. Explicit overrides (any serializable map, e.g. parsed CLI flags)
/// 2. Environment variables (`NEURALFIT_MAX_EPOCHS`, `NEURALFIT_PARAMS__HIDDEN_NUM_UNITS`)
/// 3. The given config file
/// 4. User config (`~/.config/neuralfit/config.toml`)
/// 5. Built-in defaults
///
/// The result is validated before it is returned.
pub fn load_config(
    file: Option<&Path>,
    overrides: Option<&serde_json::Value>,
) -> Result<NetConfig, NetError> {
    let config = extract_config(file, overrides)?;
    config.validate()?;
    Ok(config)
}

/// Merge the sources of [`load_config`] without validating the result.
pub fn extract_config(
    file: Option<&Path>,
    overrides: Option<&serde_json::Value>,
) -> Result<NetConfig, NetError> {
    let mut figment = Figment::from(Serialized::defaults(NetConfig::default()));

    if let Some(dir) = user_config_dir() {
        let user_config = dir.join("config.toml");
        if user_config.exists() {
            figment = figment.merge(Toml::file(&user_config));
        }
    }

    if let Some(path) = file {
        if !path.exists() {
            return Err(NetError::not_found(format!(
                "config file {}",
                path.display()
            )));
        }
        figment = figment.merge(Toml::file(path));
    }

    figment = figment.merge(Env::prefixed("NEURALFIT_").split("__"));

    if let Some(overrides) = overrides {
        figment = figment.merge(Serialized::defaults(overrides));
    }

    Ok(figment.extract().map_err(Box::new)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;

    fn mlp_config() -> NetConfig {
        NetConfig::new(vec![
            LayerSpec::new("input", "input"),
            LayerSpec::new("hidden", "dense"),
            LayerSpec::new("output", "dense"),
        ])
        .with_param("input_shape", json!([null, 4]))
        .with_param("hidden_num_units", 8)
        .with_param("output_num_units", 3)
        .with_param("output_nonlinearity", "softmax")
        .with_param("update_learning_rate", 0.1)
    }

    #[test]
    fn test_defaults() {
        let config = NetConfig::default();
        assert_eq!(config.batch_size_train, 128);
        assert_eq!(config.batch_size_test, 128);
        assert_eq!(config.max_epochs, 100);
        assert_eq!(config.eval_size, 0.2);
        assert_eq!(config.update, "nesterov_momentum");
        assert_eq!(config.objective_loss(), "categorical_crossentropy");
        let regression = NetConfig {
            regression: true,
            ..NetConfig::default()
        };
        assert_eq!(regression.objective_loss(), "mse");
    }

    #[test]
    fn test_valid_config_passes() {
        mlp_config().validate().unwrap();
    }

    #[test]
    fn test_unused_kwarg_rejected() {
        let config = mlp_config().with_param("hiden_num_units", 8);
        let err = config.validate().unwrap_err();
        assert_eq!(err.to_string(), "Configuration error: Unused kwarg: hiden_num_units");
    }

    #[test]
    fn test_removed_parameters() {
        let err = mlp_config().with_param("loss", "mse").validate().unwrap_err();
        assert!(err.to_string().contains("objective_loss_function"));
        let err = mlp_config()
            .with_param("batch_iterator", 64)
            .validate()
            .unwrap_err();
        assert!(err.to_string().contains("has been replaced"));
    }

    #[test]
    fn test_input_shape_rank() {
        let mut config = mlp_config();
        config.params.remove("input_shape");
        assert!(config.validate().unwrap_err().to_string().contains("missing"));

        let config = mlp_config().with_param("input_shape", json!([null, 1, 2, 3, 4]));
        assert!(matches!(config.validate(), Err(NetError::Config(_))));
    }

    #[test]
    fn test_output_layer_required() {
        let mut config = mlp_config();
        config.layers[2].name = "out".into();
        config.params.retain(|k, _| !k.starts_with("output_"));
        assert!(config.validate().unwrap_err().to_string().contains("'output'"));
    }

    #[test]
    fn test_eval_size_range() {
        let mut config = mlp_config();
        config.eval_size = 1.0;
        assert!(config.validate().is_err());
        config.eval_size = 0.0;
        config.validate().unwrap();
    }

    #[test]
    fn test_params_for_prefix() {
        let mut config = mlp_config();
        config
            .more_params
            .insert("hidden_nonlinearity".into(), json!("tanh"));
        let hidden = config.params_for("hidden");
        assert_eq!(hidden.len(), 2);
        assert_eq!(hidden["num_units"], json!(8));
        assert_eq!(hidden["nonlinearity"], json!("tanh"));
        assert_eq!(config.params_for("update")["learning_rate"], json!(0.1));
    }

    #[test]
    fn test_load_config_from_toml_with_overrides() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("net.toml");
        std::fs::write(
            &path,
            r#"
max_epochs = 7
eval_size = 0.25

[[layers]]
name = "input"
factory = "input"

[[layers]]
name = "output"
factory = "dense"

[params]
input_shape = [0, 2]
output_num_units = 2
output_nonlinearity = "softmax"
"#,
        )
        .unwrap();

        let overrides = json!({"batch_size_train": 16});
        let config = load_config(Some(&path), Some(&overrides)).unwrap();
        assert_eq!(config.max_epochs, 7);
        assert_eq!(config.eval_size, 0.25);
        assert_eq!(config.batch_size_train, 16);
        assert_eq!(config.batch_size_test, 128);
        assert_eq!(config.layers.len(), 2);
        assert_eq!(config.params["output_num_units"], json!(2));
    }

    #[test]
    fn test_extract_config_skips_validation() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("partial.toml");
        std::fs::write(&path, "max_epochs = 7\n").unwrap();

        let config = extract_config(Some(&path), None).unwrap();
        assert_eq!(config.max_epochs, 7);
        assert!(config.layers.is_empty());
        assert!(load_config(Some(&path), None).is_err());
    }

    #[test]
    fn test_load_config_missing_file() {
        let result = load_config(Some(Path::new("/nonexistent/net.toml")), None);
        assert!(matches!(result, Err(NetError::NotFound(_))));
    }
}

//! Per-epoch training history.

use serde::{Deserialize, Deserializer, Serialize};
use tabled::builder::Builder;
use tabled::settings::Style;

/// Score produced by a user-supplied scoring function.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NamedScore {
    pub name: String,
    #[serde(deserialize_with = "nan_from_null")]
    pub value: f64,
}

/// One row of the training history, written once per finished epoch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EpochRecord {
    /// 1-based, counted across all runs.
    pub epoch: usize,
    #[serde(deserialize_with = "nan_from_null")]
    pub train_loss: f64,
    #[serde(deserialize_with = "nan_from_null")]
    pub valid_loss: f64,
    /// The validation loss when it is the best seen so far.
    pub valid_best: Option<f64>,
    #[serde(deserialize_with = "nan_from_null")]
    pub train_val_ratio: f64,
    #[serde(deserialize_with = "nan_from_null")]
    pub valid_accuracy: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub custom_score: Option<NamedScore>,
    /// Wall time of the epoch in seconds.
    pub duration: f64,
}

/// Append-only sequence of epoch records.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TrainHistory {
    records: Vec<EpochRecord>,
}

impl TrainHistory {
    pub fn new() -> Self {
        Self {
            records: Vec::new(),
        }
    }

    pub fn push(&mut self, record: EpochRecord) {
        self.records.push(record);
    }

    pub fn records(&self) -> &[EpochRecord] {
        &self.records
    }

    pub fn last(&self) -> Option<&EpochRecord> {
        self.records.last()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Lowest train loss recorded, ignoring NaN.
    pub fn best_train_loss(&self) -> Option<f64> {
        min_of(self.records.iter().map(|r| r.train_loss))
    }

    /// Lowest validation loss recorded, ignoring NaN.
    pub fn best_valid_loss(&self) -> Option<f64> {
        min_of(self.records.iter().map(|r| r.valid_loss))
    }

    /// Running minimum of the validation loss, one entry per epoch.
    pub fn running_best_valid(&self) -> Vec<f64> {
        let mut best = f64::INFINITY;
        self.records
            .iter()
            .map(|r| {
                best = best.min(r.valid_loss);
                best
            })
            .collect()
    }

    pub fn train_losses(&self) -> Vec<f64> {
        self.records.iter().map(|r| r.train_loss).collect()
    }

    pub fn valid_losses(&self) -> Vec<f64> {
        self.records.iter().map(|r| r.valid_loss).collect()
    }

    /// Render the history as a pipe table with four decimals.
    pub fn to_table(&self) -> String {
        let custom_name = self
            .records
            .iter()
            .find_map(|r| r.custom_score.as_ref().map(|s| s.name.clone()));

        let mut header = vec![
            "epoch".to_string(),
            "train loss".to_string(),
            "valid loss".to_string(),
            "valid best".to_string(),
            "train/val".to_string(),
            "valid acc".to_string(),
        ];
        if let Some(name) = &custom_name {
            header.push(name.clone());
        }
        header.push("dur".to_string());

        let mut builder = Builder::default();
        builder.push_record(header);
        for r in &self.records {
            let mut row = vec![
                r.epoch.to_string(),
                fmt4(r.train_loss),
                fmt4(r.valid_loss),
                r.valid_best.map(fmt4).unwrap_or_default(),
                fmt4(r.train_val_ratio),
                fmt4(r.valid_accuracy),
            ];
            if custom_name.is_some() {
                row.push(
                    r.custom_score
                        .as_ref()
                        .map(|s| fmt4(s.value))
                        .unwrap_or_default(),
                );
            }
            row.push(fmt4(r.duration));
            builder.push_record(row);
        }
        builder.build().with(Style::markdown()).to_string()
    }
}

/// JSON has no NaN; non-finite values are written as `null`.
fn nan_from_null<'de, D: Deserializer<'de>>(deserializer: D) -> Result<f64, D::Error> {
    Ok(Option::<f64>::deserialize(deserializer)?.unwrap_or(f64::NAN))
}

fn fmt4(value: f64) -> String {
    format!("{value:.4}")
}

fn min_of(values: impl Iterator<Item = f64>) -> Option<f64> {
    values.filter(|v| !v.is_nan()).reduce(f64::min)
}

/// Arithmetic mean; NaN for an empty slice.
pub fn mean(values: &[f64]) -> f64 {
    if values.is_empty() {
        f64::NAN
    } else {
        values.iter().sum::<f64>() / values.len() as f64
    }
}

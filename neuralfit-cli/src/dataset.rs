//! JSON datasets: `{"x": [[...], ...], "y": [...]}` with nested arrays.

use anyhow::{Context, bail};
use ndarray::{Array1, Array2, ArrayD, Axis, Ix2, IxDyn};
use neuralfit_core::Targets;
use serde::Deserialize;
use serde_json::Value;
use std::path::Path;

#[derive(Debug, Deserialize)]
pub struct Dataset {
    pub x: Value,
    #[serde(default)]
    pub y: Option<Value>,
}

impl Dataset {
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read dataset {}", path.display()))?;
        serde_json::from_str(&text)
            .with_context(|| format!("Failed to parse dataset {}", path.display()))
    }

    pub fn inputs(&self) -> anyhow::Result<ArrayD<f32>> {
        to_array(&self.x).context("invalid `x`")
    }

    /// Integer class labels, or a value matrix when `regression` is set.
    pub fn targets(&self, regression: bool) -> anyhow::Result<Targets> {
        let Some(y) = &self.y else {
            bail!("dataset has no `y`");
        };
        if regression {
            let values = to_array(y).context("invalid `y`")?;
            let values = match values.ndim() {
                1 => values.insert_axis(Axis(1)),
                2 => values,
                n => bail!("regression targets must have rank 1 or 2, got {n}"),
            };
            return Ok(Targets::Values(values.into_dimensionality::<Ix2>()?));
        }
        let Value::Array(items) = y else {
            bail!("class labels must be a flat array");
        };
        let labels = items
            .iter()
            .map(|v| {
                v.as_i64()
                    .with_context(|| format!("class label must be an integer, found {v}"))
            })
            .collect::<anyhow::Result<Vec<_>>>()?;
        Ok(Targets::Classes(Array1::from(labels)))
    }
}

/// Convert a nested JSON array of numbers into a dense array. Ragged input is
/// rejected.
pub fn to_array(value: &Value) -> anyhow::Result<ArrayD<f32>> {
    let mut shape = Vec::new();
    let mut cursor = value;
    while let Value::Array(items) = cursor {
        shape.push(items.len());
        match items.first() {
            Some(first) => cursor = first,
            None => break,
        }
    }

    let mut data = Vec::with_capacity(shape.iter().product());
    flatten(value, 0, &shape, &mut data)?;
    Ok(ArrayD::from_shape_vec(IxDyn(&shape), data)?)
}

fn flatten(
    value: &Value,
    depth: usize,
    shape: &[usize],
    out: &mut Vec<f32>,
) -> anyhow::Result<()> {
    match value {
        Value::Array(items) => {
            if shape.get(depth) != Some(&items.len()) {
                bail!("ragged array at depth {depth}");
            }
            for item in items {
                flatten(item, depth + 1, shape, out)?;
            }
        }
        Value::Number(n) => {
            if depth != shape.len() {
                bail!("ragged array at depth {depth}");
            }
            let v = n
                .as_f64()
                .with_context(|| format!("{n} is not representable as a float"))?;
            out.push(v as f32);
        }
        other => bail!("expected a number, found {other}"),
    }
    Ok(())
}

/// JSON rendering of predictions.
pub fn targets_to_json(targets: &Targets) -> Value {
    match targets {
        Targets::Classes(labels) => Value::from(labels.to_vec()),
        Targets::Values(values) => matrix_to_json(values),
    }
}

pub fn matrix_to_json(values: &Array2<f32>) -> Value {
    Value::Array(
        values
            .rows()
            .into_iter()
            .map(|row| Value::from(row.to_vec()))
            .collect(),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    #[test]
    fn nested_arrays_become_dense() {
        let x = to_array(&json!([[1, 2, 3], [4, 5, 6]])).unwrap();
        assert_eq!(x.shape(), &[2, 3]);
        assert_eq!(x[[1, 2]], 6.0);
    }

    #[test]
    fn ragged_arrays_are_rejected() {
        assert!(to_array(&json!([[1, 2], [3]])).is_err());
        assert!(to_array(&json!([[1, 2], 3])).is_err());
        assert!(to_array(&json!([["a"]])).is_err());
    }

    #[test]
    fn classification_targets_are_integers() {
        let data = Dataset {
            x: json!([[0.0], [1.0]]),
            y: Some(json!([0, 1])),
        };
        let y = data.targets(false).unwrap();
        assert_eq!(y.as_classes().unwrap().to_vec(), vec![0, 1]);

        let bad = Dataset {
            x: json!([[0.0]]),
            y: Some(json!([0.5])),
        };
        assert!(bad.targets(false).is_err());
    }

    #[test]
    fn regression_vector_becomes_column() {
        let data = Dataset {
            x: json!([[0.0], [1.0]]),
            y: Some(json!([0.5, 1.5])),
        };
        let y = data.targets(true).unwrap();
        assert_eq!(y.as_values().unwrap().shape(), &[2, 1]);
    }

    #[test]
    fn predictions_render_as_json() {
        let labels = Targets::Classes(Array1::from(vec![3, 1]));
        assert_eq!(targets_to_json(&labels), json!([3, 1]));
        let proba = Array2::from_shape_vec((1, 2), vec![0.25f32, 0.75]).unwrap();
        assert_eq!(matrix_to_json(&proba), json!([[0.25, 0.75]]));
    }
}

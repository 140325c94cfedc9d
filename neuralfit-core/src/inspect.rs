//! Layer tables and convolutional capacity diagnostics.
//!
//! The filter and receptive-field estimates ignore padding, striding and
//! feature pooling.

use crate::alignment::Shape;
use crate::backend::{LayerGraph, LayerKind};
use crate::error::NetError;
use std::fmt;
use tabled::builder::Builder;
use tabled::settings::Style;

/// Default minimum learning capacity, in percent.
pub const MIN_CAPACITY: f64 = 100.0 / 6.0;

pub mod ansi {
    pub const CYAN: &str = "\x1b[36m";
    pub const MAGENTA: &str = "\x1b[35m";
    pub const RED: &str = "\x1b[31m";
    pub const END: &str = "\x1b[0m";
}

/// Effective filter size of every layer in image pixels, row 0 being the
/// input. Pooling multiplies the scale of later filters; the first layer that
/// is neither conv nor pool, and every layer after it, gets the image size.
pub fn real_filters(graph: &LayerGraph, img_size: [f64; 2]) -> Vec<[f64; 2]> {
    conv_walk(graph, img_size, |filter, _prev, expon, _first| {
        [filter[0] * expon[0], filter[1] * expon[1]]
    })
}

/// Receptive field of every layer in image pixels, row 0 being the input.
pub fn receptive_fields(graph: &LayerGraph, img_size: [f64; 2]) -> Vec<[f64; 2]> {
    conv_walk(graph, img_size, |filter, prev, expon, first| {
        if first {
            filter
        } else {
            [
                prev[0] + expon[0] * (filter[0] - 1.0),
                prev[1] + expon[1] * (filter[1] - 1.0),
            ]
        }
    })
}

/// Shared walk over the graph. `conv` computes a conv layer's row from its
/// filter size, the previous row, the pooling exponent and whether it is the
/// first conv layer.
fn conv_walk(
    graph: &LayerGraph,
    img_size: [f64; 2],
    conv: impl Fn([f64; 2], [f64; 2], [f64; 2], bool) -> [f64; 2],
) -> Vec<[f64; 2]> {
    let n = graph.len();
    let mut rows = vec![[0.0; 2]; n];
    let mut conv_mode = true;
    let mut first_conv = true;
    let mut expon = [1.0, 1.0];

    for (j, layer) in graph.layers().iter().enumerate().skip(1) {
        if !conv_mode {
            rows[j] = img_size;
            continue;
        }
        match &layer.kind {
            LayerKind::Conv2d { filter_size, .. } => {
                let filter = [filter_size.0 as f64, filter_size.1 as f64];
                rows[j] = conv(filter, rows[j - 1], expon, first_conv);
                first_conv = false;
            }
            LayerKind::MaxPool2d { pool_size } => {
                rows[j] = rows[j - 1];
                expon[0] *= pool_size.0 as f64;
                expon[1] *= pool_size.1 as f64;
            }
            _ => {
                conv_mode = false;
                rows[j] = img_size;
            }
        }
    }
    if n > 0 {
        rows[0] = img_size;
    }
    rows
}

fn display_name(graph: &LayerGraph, index: usize) -> String {
    let layer = &graph.layers()[index];
    if layer.name.is_empty() {
        layer.kind.type_name().to_string()
    } else {
        layer.name.clone()
    }
}

/// Height and width of the input images; needs an input shape of
/// `(channels, height, width)`.
fn image_size(graph: &LayerGraph) -> Result<[f64; 2], NetError> {
    let input = graph
        .input()
        .ok_or_else(|| NetError::usage("the network has no layers"))?;
    match input.output_shape.as_slice() {
        [_, h, w] => Ok([*h as f64, *w as f64]),
        other => Err(NetError::shape(format!(
            "conv diagnostics need (channels, height, width) input, got {:?}",
            other
        ))),
    }
}

/// Conv capacity table: output size, learning capacity (real filter over
/// receptive field) and image coverage per layer. Layer names are coloured
/// red when coverage exceeds 100% and capacity is below `min_capacity`,
/// cyan for too much coverage alone and magenta for too little capacity
/// alone. `detailed` adds the raw filter and field sizes.
pub fn conv_infos(
    graph: &LayerGraph,
    min_capacity: f64,
    detailed: bool,
) -> Result<String, NetError> {
    let img = image_size(graph)?;
    let filters = real_filters(graph, img);
    let fields = receptive_fields(graph, img);

    let mut header = vec![
        "name",
        "size",
        "total",
        "cap. Y [%]",
        "cap. X [%]",
        "cov. Y [%]",
        "cov. X [%]",
    ];
    if detailed {
        header.extend(["filter Y", "filter X", "field Y", "field X"]);
    }

    let mut builder = Builder::default();
    builder.push_record(header);
    for (i, layer) in graph.layers().iter().enumerate() {
        let capacity = [0, 1].map(|d| {
            let c = 100.0 * filters[i][d] / fields[i][d];
            if c.is_finite() { c } else { 1.0 }
        });
        let coverage = [0, 1].map(|d| 100.0 * fields[i][d] / img[d]);

        let name = display_name(graph, i);
        let too_wide = coverage.iter().any(|&c| c > 100.0);
        let too_weak = capacity.iter().any(|&c| c < min_capacity);
        let name = match (too_wide, too_weak) {
            (true, true) => format!("{}{name}{}", ansi::RED, ansi::END),
            (true, false) => format!("{}{name}{}", ansi::CYAN, ansi::END),
            (false, true) => format!("{}{name}{}", ansi::MAGENTA, ansi::END),
            (false, false) => name,
        };

        let mut row = vec![
            name,
            Shape::new(layer.output_shape.clone()).to_x_string(),
            layer.output_size().to_string(),
            format!("{:.2}", capacity[0]),
            format!("{:.2}", capacity[1]),
            format!("{:.2}", coverage[0]),
            format!("{:.2}", coverage[1]),
        ];
        if detailed {
            row.extend(
                [filters[i], fields[i]]
                    .iter()
                    .flat_map(|pair| pair.iter().map(|v| (*v as i64).to_string())),
            );
        }
        builder.push_record(row);
    }

    let mut table = builder.build();
    if detailed {
        table.with(Style::psql());
    } else {
        table.with(Style::markdown());
    }
    Ok(table.to_string())
}

/// `#`, `name`, `size` table for networks without conv layers.
pub fn layer_table(graph: &LayerGraph) -> String {
    let mut builder = Builder::default();
    builder.push_record(["#", "name", "size"]);
    for (i, layer) in graph.layers().iter().enumerate() {
        builder.push_record([
            i.to_string(),
            display_name(graph, i),
            Shape::new(layer.output_shape.clone()).to_x_string(),
        ]);
    }
    builder.build().with(Style::markdown()).to_string()
}

/// Layer summary printed when a verbose estimator is initialized.
#[derive(Debug, Clone, PartialEq)]
pub struct LayerReport {
    pub param_count: usize,
    pub table: String,
    pub has_conv: bool,
}

impl LayerReport {
    /// Conv networks get the capacity table (detailed from verbosity 2),
    /// other networks the plain table.
    pub fn build(graph: &LayerGraph, verbose: u8) -> Result<Self, NetError> {
        let has_conv = graph.has_conv();
        let table = if has_conv {
            conv_infos(graph, MIN_CAPACITY, verbose > 1)?
        } else {
            layer_table(graph)
        };
        Ok(Self {
            param_count: graph.count_params(),
            table,
            has_conv,
        })
    }
}

impl fmt::Display for LayerReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "# Neural Network with {} learnable parameters\n",
            self.param_count
        )?;
        writeln!(f, "## Layer information\n")?;
        writeln!(f, "{}", self.table)?;
        if self.has_conv {
            writeln!(f, "\nExplanation")?;
            writeln!(f, "    X, Y:    image dimensions")?;
            writeln!(f, "    cap.:    learning capacity")?;
            writeln!(f, "    cov.:    coverage of image")?;
            writeln!(
                f,
                "    {}magenta{}: capacity too low (<1/6)",
                ansi::MAGENTA,
                ansi::END
            )?;
            writeln!(
                f,
                "    {}cyan{}:    image coverage too high (>100%)",
                ansi::CYAN,
                ansi::END
            )?;
            writeln!(
                f,
                "    {}red{}:     capacity too low and coverage too high",
                ansi::RED,
                ansi::END
            )?;
        }
        Ok(())
    }
}

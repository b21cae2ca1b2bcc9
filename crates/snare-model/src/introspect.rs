//! Layer inspection helpers: names, intermediate outputs, parameter summary.

use ndarray::{Array2, Array4};
use snare_core::Result;
use tracing::info;

use crate::network::{Layer, Network};

/// Layer names in forward order. With `depth > 0` names are truncated to
/// their first `depth` dot-separated components and deduplicated, so
/// `depth = 1` collapses `features.0`, `features.1` into `features`.
pub fn layer_names(net: &Network, depth: usize) -> Vec<String> {
    let mut out: Vec<String> = Vec::new();
    for (name, _) in net.layers() {
        let truncated = if depth == 0 {
            name.clone()
        } else {
            name.split('.').take(depth).collect::<Vec<_>>().join(".")
        };
        if out.last() != Some(&truncated) {
            out.push(truncated);
        }
    }
    out
}

/// Forward pass that captures the output of every layer, in order.
pub fn all_layer_outputs(
    net: &Network,
    images: &Array4<f32>,
) -> Result<Vec<(String, Array2<f32>)>> {
    let mut x = Network::flatten(images);
    let mut captured = Vec::with_capacity(net.layers().len());
    for (name, layer) in net.layers() {
        x = match layer {
            Layer::Linear(lin) => lin.forward(&x)?,
            Layer::ReLU => x.mapv(|v| v.max(0.0)),
        };
        captured.push((name.clone(), x.clone()));
    }
    Ok(captured)
}

/// Log one line per layer with its parameter count, then the total.
pub fn summary(net: &Network) {
    let mut total = 0usize;
    for (name, layer) in net.layers() {
        let params = match layer {
            Layer::Linear(lin) => lin.weight.len() + lin.bias.len(),
            Layer::ReLU => 0,
        };
        total += params;
        info!(layer = %name, params, "layer");
    }
    info!(total_params = total, layers = net.layers().len(), "model summary");
}

//! Import of NAS-bench (NATS-Bench topology search space) PyTorch
//! checkpoints.
//!
//! Upstream `.pth` files are zip-wrapped pickles; `candle`'s pickle
//! reader handles the container and we only remap parameter names into
//! this toolkit's `features.*` / `classifier.fc.*` layout.

use std::path::Path;

use candle_core::pickle::PthTensors;
use candle_core::{DType, Tensor};
use ndarray::{ArrayD, IxDyn};
use snare_core::{Result, SnareError};
use tracing::{debug, info};

use crate::weights::WeightStore;

fn model_err(e: impl std::fmt::Display) -> SnareError {
    SnareError::ModelLoad(e.to_string())
}

/// Copy a candle tensor into an f32 ndarray, converting the dtype when
/// the checkpoint stores something else (f64, f16, bf16).
pub fn candle_to_ndarray(tensor: &Tensor) -> Result<ArrayD<f32>> {
    let tensor = match tensor.dtype() {
        DType::F32 => tensor.clone(),
        _ => tensor.to_dtype(DType::F32).map_err(model_err)?,
    };
    let dims = tensor.dims().to_vec();
    let data = tensor
        .flatten_all()
        .map_err(model_err)?
        .to_vec1::<f32>()
        .map_err(model_err)?;
    ArrayD::from_shape_vec(IxDyn(&dims), data).map_err(model_err)
}

/// Read every tensor from a PyTorch `.pth` checkpoint.
pub fn load_pth(path: &Path) -> Result<WeightStore> {
    let pth = PthTensors::new(path, None).map_err(model_err)?;
    let names: Vec<String> = pth.tensor_infos().keys().cloned().collect();
    let mut store = WeightStore::new();
    for name in names {
        let tensor = pth.get(&name).map_err(model_err)?.ok_or_else(|| {
            SnareError::ModelLoad(format!("tensor {name} listed but not readable"))
        })?;
        store.insert(name, candle_to_ndarray(&tensor)?);
    }
    Ok(store)
}

/// Translate a NAS-bench parameter name into this toolkit's layout.
///
/// The backbone blocks (`stem*`, `cells*`, `lastact*`) move under
/// `features.`, and the head (`classifier*`) becomes `classifier.fc*`.
/// Anything else (optimizer state, epoch counters) maps to `None` and is
/// dropped by the importer.
pub fn remap_key(key: &str) -> Option<String> {
    if key.starts_with("stem") || key.starts_with("cells") || key.starts_with("lastact") {
        Some(format!("features.{key}"))
    } else if let Some(rest) = key.strip_prefix("classifier") {
        Some(format!("classifier.fc{rest}"))
    } else {
        None
    }
}

/// Load a NAS-bench checkpoint and remap its keys; unmapped entries are
/// logged and dropped.
pub fn import_natsbench(path: &Path) -> Result<WeightStore> {
    let raw = load_pth(path)?;
    let mut store = WeightStore::new();
    let mut dropped = 0usize;
    for (key, value) in raw.iter() {
        match remap_key(key) {
            Some(mapped) => store.insert(mapped, value.clone()),
            None => {
                debug!(key = %key, "dropping unmapped checkpoint key");
                dropped += 1;
            }
        }
    }
    info!(
        kept = store.len(),
        dropped,
        path = %path.display(),
        "imported NAS-bench checkpoint"
    );
    Ok(store)
}

//! Trigger confidence: how sure the model is when the backdoor fires.

use ndarray::{Array1, Array2, Axis};
use rand::rngs::StdRng;
use snare_core::{AverageMeter, Result};
use snare_model::{Batch, Network};
use tracing::info;

use crate::mark::Watermark;

/// Indices of examples whose true label is not the target class.
pub fn non_target_indices(labels: &Array1<usize>, target: usize) -> Vec<usize> {
    labels
        .iter()
        .enumerate()
        .filter(|(_, &l)| l != target)
        .map(|(i, _)| i)
        .collect()
}

/// Mean probability the model assigns to `target` over the rows it
/// actually predicted as `target`, with the survivor count. `None` when
/// no row survived.
pub fn target_probability(
    probs: &Array2<f32>,
    predictions: &Array1<usize>,
    target: usize,
) -> Option<(f32, usize)> {
    let mut meter = AverageMeter::new();
    for (row, &pred) in probs.rows().into_iter().zip(predictions.iter()) {
        if pred == target {
            meter.update(row[target], 1);
        }
    }
    if meter.count() == 0 {
        None
    } else {
        Some((meter.avg(), meter.count()))
    }
}

/// Mean confidence of successful trigger activations over the validation
/// split.
///
/// Two masking stages mirror the attack-success definition: examples
/// already labeled as the target class are excluded up front, and after
/// stamping only examples the model flips to the target class count.
/// When no example anywhere flips, the result is NaN; callers decide how
/// to render an undefined confidence.
pub fn validate_confidence(
    net: &Network,
    batches: &[Batch],
    mark: &Watermark,
    target_class: usize,
    rng: &mut StdRng,
) -> Result<f32> {
    let mut meter = AverageMeter::new();
    for batch in batches {
        let keep = non_target_indices(&batch.labels, target_class);
        if keep.is_empty() {
            continue;
        }
        let images = batch.images.select(Axis(0), &keep);
        let poisoned = mark.apply(&images, rng)?;
        let predictions = net.get_class(&poisoned)?;
        let probs = net.get_prob(&poisoned)?;
        if let Some((mean, n)) = target_probability(&probs, &predictions, target_class) {
            meter.update(mean, n);
        }
    }
    let confidence = meter.avg();
    info!(confidence, samples = meter.count(), "trigger confidence");
    Ok(confidence)
}

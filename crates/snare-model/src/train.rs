//! Generic training and validation loop.
//!
//! The loop itself knows nothing about poisoning. Callers inject behavior
//! through two seams: a [`DataTransform`] rewrites each batch before the
//! gradient step, and a [`LossObjective`] replaces the default
//! cross-entropy gradient. Both receive the run's RNG so stochastic
//! policies stay reproducible under a fixed seed.

use ndarray::{Array1, Array2};
use rand::rngs::StdRng;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use snare_core::{AverageMeter, Result};

use crate::data::Batch;
use crate::network::{Network, NetworkGrads};

/// SGD hyper-parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrainConfig {
    pub learning_rate: f32,
    pub momentum: f32,
    pub seed: u64,
}

impl Default for TrainConfig {
    fn default() -> Self {
        Self {
            learning_rate: 0.1,
            momentum: 0.9,
            seed: 0,
        }
    }
}

impl TrainConfig {
    /// Aggressive preset for small smoke-test models.
    pub fn fast() -> Self {
        Self {
            learning_rate: 0.5,
            momentum: 0.0,
            seed: 0,
        }
    }
}

/// Rewrites a batch before it reaches the loss. Implementations must not
/// change the batch handed in; they return a new one.
pub trait DataTransform {
    fn transform(&self, batch: &Batch, rng: &mut StdRng) -> Result<Batch>;
}

/// Produces the loss value and parameter gradients for one batch.
pub trait LossObjective {
    fn loss_and_grad(
        &self,
        net: &Network,
        batch: &Batch,
        rng: &mut StdRng,
    ) -> Result<(f32, NetworkGrads)>;
}

/// Default objective: plain mean cross-entropy on the batch as given.
#[derive(Debug, Clone, Copy, Default)]
pub struct CrossEntropy;

impl LossObjective for CrossEntropy {
    fn loss_and_grad(
        &self,
        net: &Network,
        batch: &Batch,
        _rng: &mut StdRng,
    ) -> Result<(f32, NetworkGrads)> {
        net.loss_and_grad(batch)
    }
}

/// Top-k accuracy in percent, one value per requested k.
pub fn accuracy(logits: &Array2<f32>, labels: &Array1<usize>, topk: &[usize]) -> Vec<f32> {
    let n = labels.len();
    if n == 0 {
        return topk.iter().map(|_| f32::NAN).collect();
    }
    let maxk = topk.iter().copied().max().unwrap_or(1);
    let mut hits = vec![0usize; topk.len()];
    for (i, &label) in labels.iter().enumerate() {
        let row = logits.row(i);
        let mut order: Vec<usize> = (0..row.len()).collect();
        order.sort_by(|&a, &b| {
            row[b]
                .partial_cmp(&row[a])
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        if let Some(rank) = order.iter().take(maxk).position(|&j| j == label) {
            for (hit, &k) in hits.iter_mut().zip(topk) {
                if rank < k {
                    *hit += 1;
                }
            }
        }
    }
    hits.iter().map(|&h| 100.0 * h as f32 / n as f32).collect()
}

/// One evaluation pass: mean loss and top-1 accuracy (percent) over all
/// batches, with the optional transform applied first.
///
/// `prefix` labels the pass in the log stream.
pub fn validate(
    net: &Network,
    batches: &[Batch],
    transform: Option<&dyn DataTransform>,
    rng: &mut StdRng,
    prefix: &str,
) -> Result<(f32, f32)> {
    let mut loss_meter = AverageMeter::new();
    let mut acc_meter = AverageMeter::new();
    for batch in batches {
        let batch = match transform {
            Some(t) => t.transform(batch, rng)?,
            None => batch.clone(),
        };
        if batch.is_empty() {
            continue;
        }
        let logits = net.forward(&batch.images)?;
        let loss = net.loss(&batch)?;
        let top1 = accuracy(&logits, &batch.labels, &[1])[0];
        loss_meter.update(loss, batch.len());
        acc_meter.update(top1, batch.len());
    }
    info!(
        loss = loss_meter.avg(),
        top1 = acc_meter.avg(),
        "{prefix}"
    );
    Ok((loss_meter.avg(), acc_meter.avg()))
}

/// SGD-with-momentum driver over a fixed batch list.
#[derive(Debug, Clone, Default)]
pub struct Trainer {
    pub config: TrainConfig,
}

impl Trainer {
    pub fn new(config: TrainConfig) -> Self {
        Self { config }
    }

    /// Run `epochs` passes over `batches`, calling `on_epoch` after each
    /// full pass. An error from the callback aborts training.
    pub fn train(
        &self,
        net: &mut Network,
        batches: &[Batch],
        epochs: usize,
        transform: Option<&dyn DataTransform>,
        objective: Option<&dyn LossObjective>,
        rng: &mut StdRng,
        mut on_epoch: impl FnMut(&Network, usize) -> Result<()>,
    ) -> Result<()> {
        let mut velocity: Vec<Option<(Array2<f32>, Array1<f32>)>> = Vec::new();
        for epoch in 0..epochs {
            let mut meter = AverageMeter::new();
            for batch in batches {
                let batch = match transform {
                    Some(t) => t.transform(batch, rng)?,
                    None => batch.clone(),
                };
                if batch.is_empty() {
                    continue;
                }
                let (loss, grads) = match objective {
                    Some(o) => o.loss_and_grad(net, &batch, rng)?,
                    None => net.loss_and_grad(&batch)?,
                };
                if velocity.is_empty() {
                    velocity = grads
                        .layers
                        .iter()
                        .map(|g| {
                            g.as_ref().map(|(w, b)| {
                                (Array2::zeros(w.raw_dim()), Array1::zeros(b.raw_dim()))
                            })
                        })
                        .collect();
                }
                let mut update = Vec::with_capacity(grads.layers.len());
                for (vel, grad) in velocity.iter_mut().zip(&grads.layers) {
                    match (vel, grad) {
                        (Some((vw, vb)), Some((gw, gb))) => {
                            *vw = &*vw * self.config.momentum + gw;
                            *vb = &*vb * self.config.momentum + gb;
                            update.push(Some((
                                &*vw * self.config.learning_rate,
                                &*vb * self.config.learning_rate,
                            )));
                        }
                        _ => update.push(None),
                    }
                }
                net.apply_update(&NetworkGrads { layers: update });
                meter.update(loss, batch.len());
            }
            debug!(epoch, loss = meter.avg(), "epoch complete");
            on_epoch(net, epoch)?;
        }
        Ok(())
    }
}

//! Exponential moving average of model parameters.

use snare_core::{Result, SnareError};

use crate::weights::WeightStore;

/// Maintains `avg = decay * avg + (1 - decay) * param` per parameter.
///
/// The first update copies the parameters verbatim so the average never
/// starts from zeros.
#[derive(Debug, Clone)]
pub struct ExponentialMovingAverage {
    decay: f32,
    n_averaged: usize,
    averaged: WeightStore,
}

impl ExponentialMovingAverage {
    pub fn new(decay: f32) -> Result<Self> {
        if !(0.0..1.0).contains(&decay) {
            return Err(SnareError::InvalidConfig(format!(
                "EMA decay must be in [0, 1), got {decay}"
            )));
        }
        Ok(Self {
            decay,
            n_averaged: 0,
            averaged: WeightStore::new(),
        })
    }

    pub fn n_averaged(&self) -> usize {
        self.n_averaged
    }

    /// Current averaged parameters. Empty until the first update.
    pub fn averaged(&self) -> &WeightStore {
        &self.averaged
    }

    /// Fold in one snapshot of the live parameters. All updates after the
    /// first must carry the same keys and shapes as the first.
    pub fn update(&mut self, params: &WeightStore) -> Result<()> {
        if self.n_averaged == 0 {
            self.averaged = params.clone();
        } else {
            let decay = self.decay;
            for (name, avg) in self.averaged.iter_mut() {
                let param = params.get(name).ok_or_else(|| {
                    SnareError::InvalidConfig(format!("EMA update missing parameter {name}"))
                })?;
                if param.shape() != avg.shape() {
                    return Err(SnareError::ShapeMismatch {
                        expected: avg.shape().to_vec(),
                        got: param.shape().to_vec(),
                    });
                }
                avg.zip_mut_with(param, |a, &p| *a = decay * *a + (1.0 - decay) * p);
            }
        }
        self.n_averaged += 1;
        Ok(())
    }
}

//! Batch and dataset containers.
//!
//! Dataset *loading* is out of scope for this toolkit; callers hand over
//! already-batched tensors and this module only carries them around.

use ndarray::{Array1, Array4, Axis};

/// One mini-batch: images laid out (batch, channel, height, width) and
/// one integer label per image.
///
/// `images.len_of(Axis(0)) == labels.len()` is a precondition owned by the
/// producer; it is debug-asserted here and otherwise trusted.
#[derive(Debug, Clone, PartialEq)]
pub struct Batch {
    pub images: Array4<f32>,
    pub labels: Array1<usize>,
}

impl Batch {
    pub fn new(images: Array4<f32>, labels: Array1<usize>) -> Self {
        debug_assert_eq!(
            images.len_of(Axis(0)),
            labels.len(),
            "image/label count mismatch"
        );
        Self { images, labels }
    }

    /// Number of examples in the batch.
    pub fn len(&self) -> usize {
        self.labels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.labels.is_empty()
    }

    /// (channels, height, width) of a single image.
    pub fn image_shape(&self) -> (usize, usize, usize) {
        let s = self.images.shape();
        (s[1], s[2], s[3])
    }
}

/// Pre-batched training and validation splits.
#[derive(Debug, Clone, Default)]
pub struct DataSet {
    pub train: Vec<Batch>,
    pub valid: Vec<Batch>,
    /// Nominal batch size of the training loader. Poison counts are derived
    /// from this, not from individual batch lengths, so a short final batch
    /// does not change the sampling policy.
    pub batch_size: usize,
}

impl DataSet {
    pub fn new(train: Vec<Batch>, valid: Vec<Batch>, batch_size: usize) -> Self {
        Self {
            train,
            valid,
            batch_size,
        }
    }
}

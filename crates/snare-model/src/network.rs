//! Feed-forward image classifiers over ndarray tensors.
//!
//! A [`Network`] is an ordered list of named layers. Names are structural
//! paths (`features.0`, `classifier.fc`) and double as the keys of the
//! weight dictionary, so checkpoints written by [`Network::state_dict`]
//! and weights imported from NAS-bench checkpoints address parameters the
//! same way.
//!
//! Inference and the loss gradient are both batched: images enter as
//! (batch, channel, height, width) and are flattened once at the input.

use ndarray::{Array1, Array2, Array4, Axis, Ix1, Ix2};
use snare_core::{Result, SnareError};

use crate::data::Batch;
use crate::weights::WeightStore;

/// Fully-connected layer, PyTorch weight convention: weight is
/// (out_features, in_features).
#[derive(Debug, Clone, PartialEq)]
pub struct LinearLayer {
    pub weight: Array2<f32>,
    pub bias: Array1<f32>,
}

impl LinearLayer {
    pub fn new(weight: Array2<f32>, bias: Option<Array1<f32>>) -> Result<Self> {
        let out_features = weight.nrows();
        let bias = bias.unwrap_or_else(|| Array1::zeros(out_features));
        if bias.len() != out_features {
            return Err(SnareError::ShapeMismatch {
                expected: vec![out_features],
                got: vec![bias.len()],
            });
        }
        Ok(Self { weight, bias })
    }

    /// Small uniform initialization for freshly trained models.
    pub fn init(in_features: usize, out_features: usize, rng: &mut impl rand::Rng) -> Self {
        let weight =
            Array2::from_shape_fn((out_features, in_features), |_| rng.random_range(-0.1..0.1));
        Self {
            weight,
            bias: Array1::zeros(out_features),
        }
    }

    pub fn forward(&self, x: &Array2<f32>) -> Result<Array2<f32>> {
        if x.ncols() != self.weight.ncols() {
            return Err(SnareError::ShapeMismatch {
                expected: vec![x.nrows(), self.weight.ncols()],
                got: vec![x.nrows(), x.ncols()],
            });
        }
        Ok(x.dot(&self.weight.t()) + &self.bias)
    }
}

/// Layer types supported by snare classifiers.
#[derive(Debug, Clone, PartialEq)]
pub enum Layer {
    Linear(LinearLayer),
    ReLU,
}

/// Per-layer parameter gradients, aligned with the network's layer list.
/// Parameter-free layers hold `None`.
#[derive(Debug, Clone)]
pub struct NetworkGrads {
    pub layers: Vec<Option<(Array2<f32>, Array1<f32>)>>,
}

impl NetworkGrads {
    /// Convex combination `(1 - t) * a + t * b`.
    ///
    /// Both gradients must come from the same network structure.
    pub fn blend(a: &NetworkGrads, b: &NetworkGrads, t: f32) -> NetworkGrads {
        debug_assert_eq!(a.layers.len(), b.layers.len());
        let layers = a
            .layers
            .iter()
            .zip(&b.layers)
            .map(|(ga, gb)| match (ga, gb) {
                (Some((wa, ba)), Some((wb, bb))) => {
                    Some((wa * (1.0 - t) + wb * t, ba * (1.0 - t) + bb * t))
                }
                _ => None,
            })
            .collect();
        NetworkGrads { layers }
    }
}

/// Row-wise numerically stable softmax.
pub fn softmax(logits: &Array2<f32>) -> Array2<f32> {
    let mut out = logits.clone();
    for mut row in out.rows_mut() {
        let max = row.iter().copied().fold(f32::NEG_INFINITY, f32::max);
        row.mapv_inplace(|v| (v - max).exp());
        let sum: f32 = row.sum();
        row.mapv_inplace(|v| v / sum);
    }
    out
}

/// A named stack of layers with the capability set the attack layer
/// consumes: `loss`, `get_class`, `get_prob`, gradients.
#[derive(Debug, Clone, Default)]
pub struct Network {
    layers: Vec<(String, Layer)>,
}

impl Network {
    pub fn new() -> Self {
        Self { layers: Vec::new() }
    }

    pub fn add_layer(&mut self, name: impl Into<String>, layer: Layer) {
        self.layers.push((name.into(), layer));
    }

    pub fn layers(&self) -> &[(String, Layer)] {
        &self.layers
    }

    /// Output dimension of the final linear layer, if any.
    pub fn num_classes(&self) -> Option<usize> {
        self.layers.iter().rev().find_map(|(_, l)| match l {
            Layer::Linear(lin) => Some(lin.weight.nrows()),
            Layer::ReLU => None,
        })
    }

    /// Flatten (n, c, h, w) images into (n, c*h*w) feature rows, channel
    /// varying slowest within a row.
    pub fn flatten(images: &Array4<f32>) -> Array2<f32> {
        let s = images.shape();
        let (h, w) = (s[2], s[3]);
        Array2::from_shape_fn((s[0], s[1] * h * w), |(i, j)| {
            images[[i, j / (h * w), j / w % h, j % w]]
        })
    }

    /// Forward pass on already-flattened features.
    pub fn forward_flat(&self, x: &Array2<f32>) -> Result<Array2<f32>> {
        let mut x = x.clone();
        for (_, layer) in &self.layers {
            x = match layer {
                Layer::Linear(lin) => lin.forward(&x)?,
                Layer::ReLU => x.mapv(|v| v.max(0.0)),
            };
        }
        Ok(x)
    }

    /// Logits for a batch of images.
    pub fn forward(&self, images: &Array4<f32>) -> Result<Array2<f32>> {
        self.forward_flat(&Self::flatten(images))
    }

    /// Per-class probabilities (softmax rows).
    pub fn get_prob(&self, images: &Array4<f32>) -> Result<Array2<f32>> {
        Ok(softmax(&self.forward(images)?))
    }

    /// Predicted class per image (argmax of logits).
    pub fn get_class(&self, images: &Array4<f32>) -> Result<Array1<usize>> {
        let logits = self.forward(images)?;
        Ok(logits
            .rows()
            .into_iter()
            .map(|row| {
                row.iter()
                    .enumerate()
                    .fold((0, f32::NEG_INFINITY), |(bi, bv), (i, &v)| {
                        if v > bv {
                            (i, v)
                        } else {
                            (bi, bv)
                        }
                    })
                    .0
            })
            .collect())
    }

    /// Mean cross-entropy loss over a batch.
    pub fn loss(&self, batch: &Batch) -> Result<f32> {
        let probs = softmax(&self.forward(&batch.images)?);
        Ok(cross_entropy(&probs, &batch.labels))
    }

    /// Mean cross-entropy loss plus gradients w.r.t. every parameter.
    ///
    /// One forward pass with cached activations, one backward pass.
    pub fn loss_and_grad(&self, batch: &Batch) -> Result<(f32, NetworkGrads)> {
        let n = batch.len();
        // Cached inputs to each layer: acts[i] feeds layers[i].
        let mut acts: Vec<Array2<f32>> = Vec::with_capacity(self.layers.len() + 1);
        acts.push(Self::flatten(&batch.images));
        for (_, layer) in &self.layers {
            let x = acts.last().expect("non-empty activation stack");
            let y = match layer {
                Layer::Linear(lin) => lin.forward(x)?,
                Layer::ReLU => x.mapv(|v| v.max(0.0)),
            };
            acts.push(y);
        }

        let logits = acts.last().expect("non-empty activation stack");
        let probs = softmax(logits);
        let loss = cross_entropy(&probs, &batch.labels);

        // d loss / d logits for mean cross-entropy: (softmax - onehot) / n.
        let mut dout = probs;
        for (i, &label) in batch.labels.iter().enumerate() {
            dout[[i, label]] -= 1.0;
        }
        dout.mapv_inplace(|v| v / n as f32);

        let mut grads: Vec<Option<(Array2<f32>, Array1<f32>)>> =
            Vec::with_capacity(self.layers.len());
        for (idx, (_, layer)) in self.layers.iter().enumerate().rev() {
            match layer {
                Layer::Linear(lin) => {
                    let dw = dout.t().dot(&acts[idx]);
                    let db = dout.sum_axis(Axis(0));
                    dout = dout.dot(&lin.weight);
                    grads.push(Some((dw, db)));
                }
                Layer::ReLU => {
                    // Gradient passes only where the pre-activation was positive.
                    dout.zip_mut_with(&acts[idx], |g, &x| {
                        if x <= 0.0 {
                            *g = 0.0;
                        }
                    });
                    grads.push(None);
                }
            }
        }
        grads.reverse();

        Ok((loss, NetworkGrads { layers: grads }))
    }

    /// In-place parameter update: `p -= step` for every gradient entry in
    /// `update`, which must be structurally aligned with the layer list.
    pub fn apply_update(&mut self, update: &NetworkGrads) {
        debug_assert_eq!(update.layers.len(), self.layers.len());
        for ((_, layer), grad) in self.layers.iter_mut().zip(&update.layers) {
            if let (Layer::Linear(lin), Some((dw, db))) = (layer, grad) {
                lin.weight -= dw;
                lin.bias -= db;
            }
        }
    }

    /// Snapshot of all parameters keyed by structural path
    /// (`{layer}.weight`, `{layer}.bias`).
    pub fn state_dict(&self) -> WeightStore {
        let mut store = WeightStore::new();
        for (name, layer) in &self.layers {
            if let Layer::Linear(lin) = layer {
                store.insert(format!("{name}.weight"), lin.weight.clone().into_dyn());
                store.insert(format!("{name}.bias"), lin.bias.clone().into_dyn());
            }
        }
        store
    }

    /// Load parameters from a weight dictionary. Every linear layer must be
    /// present with matching shapes; extra keys in the store are ignored.
    pub fn load_state_dict(&mut self, store: &WeightStore) -> Result<()> {
        for (name, layer) in &mut self.layers {
            if let Layer::Linear(lin) = layer {
                let weight = store.get(&format!("{name}.weight")).ok_or_else(|| {
                    SnareError::ModelLoad(format!("missing key: {name}.weight"))
                })?;
                let bias = store
                    .get(&format!("{name}.bias"))
                    .ok_or_else(|| SnareError::ModelLoad(format!("missing key: {name}.bias")))?;

                let weight = weight
                    .clone()
                    .into_dimensionality::<Ix2>()
                    .map_err(|_| SnareError::ShapeMismatch {
                        expected: lin.weight.shape().to_vec(),
                        got: weight.shape().to_vec(),
                    })?;
                let bias = bias
                    .clone()
                    .into_dimensionality::<Ix1>()
                    .map_err(|_| SnareError::ShapeMismatch {
                        expected: lin.bias.shape().to_vec(),
                        got: bias.shape().to_vec(),
                    })?;
                if weight.shape() != lin.weight.shape() || bias.len() != lin.bias.len() {
                    return Err(SnareError::ShapeMismatch {
                        expected: lin.weight.shape().to_vec(),
                        got: weight.shape().to_vec(),
                    });
                }
                lin.weight = weight;
                lin.bias = bias;
            }
        }
        Ok(())
    }
}

fn cross_entropy(probs: &Array2<f32>, labels: &Array1<usize>) -> f32 {
    let n = labels.len();
    let mut total = 0.0f32;
    for (i, &label) in labels.iter().enumerate() {
        total -= probs[[i, label]].max(1e-12).ln();
    }
    total / n as f32
}

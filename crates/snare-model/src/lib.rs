//! Classifier models and the generic training/validation harness.
//!
//! The [`network::Network`] type is a small feed-forward image classifier
//! over `ndarray` tensors, exposing exactly the capability set the attack
//! crate needs: `loss`, `get_class`, `get_prob` and gradient computation.
//! [`train::Trainer`] is the generic loop that is polymorphic over a
//! pluggable per-batch data transform and loss objective, so attacks can
//! inject poisoned batches without owning the loop.
//!
//! Checkpoint IO uses a NumPy `.npy`/`.npz` container ([`npy`]) for
//! artifacts written by this toolkit, and candle's pickle reader
//! ([`natsbench`]) for importing upstream PyTorch checkpoints.

pub mod data;
pub mod ema;
pub mod introspect;
pub mod natsbench;
pub mod network;
pub mod npy;
pub mod train;
pub mod weights;

pub use data::{Batch, DataSet};
pub use ema::ExponentialMovingAverage;
pub use introspect::{all_layer_outputs, layer_names, summary};
pub use natsbench::{import_natsbench, load_pth, remap_key};
pub use network::{softmax, Layer, LinearLayer, Network, NetworkGrads};
pub use train::{accuracy, validate, CrossEntropy, DataTransform, LossObjective, TrainConfig, Trainer};
pub use weights::WeightStore;

pub use snare_core::{Result, SnareError};

//! Backdoor (BadNet-style) poisoning attacks on image classifiers.
//!
//! The pipeline is: a [`mark::Watermark`] defines the trigger, a
//! [`sampler::PoisonSampler`] decides which examples of each batch get
//! stamped and relabeled, [`badnet::BadnetAttack`] drives poisoned
//! training and artifact persistence, and [`protocol`] /
//! [`confidence`] score the resulting model.

pub mod badnet;
pub mod confidence;
pub mod mark;
pub mod protocol;
pub mod sampler;

pub use badnet::{
    artifact_filename, load_weights, save_artifacts, AttackConfig, BadnetAttack, BlendedLoss,
};
pub use confidence::validate_confidence;
pub use mark::{PositionPolicy, Watermark};
pub use protocol::{evaluate, regression_guard, ValidationOutcome};
pub use sampler::{PoisonSampler, PoisonTransform};

pub use snare_core::{Result, SnareError};

//! BadNet attack driver: poisoned training plus artifact persistence.

use std::path::{Path, PathBuf};

use rand::rngs::StdRng;
use rand::SeedableRng;
use serde::{Deserialize, Serialize};
use snare_core::{Result, SnareError};
use snare_model::{
    validate, Batch, DataSet, LossObjective, Network, NetworkGrads, TrainConfig, Trainer,
    WeightStore,
};
use tracing::{debug, info};

use crate::confidence::validate_confidence;
use crate::mark::{PositionPolicy, Watermark};
use crate::protocol::{evaluate, ValidationOutcome};
use crate::sampler::{PoisonSampler, PoisonTransform};

/// Attack hyper-parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AttackConfig {
    /// Class every poisoned example is relabeled to.
    pub target_class: usize,
    /// Fraction of each training batch to poison, in `[0, 0.5]`.
    pub poison_rate: f32,
    pub seed: u64,
    /// Directory artifacts are written into.
    pub folder: PathBuf,
    pub train: TrainConfig,
}

impl Default for AttackConfig {
    fn default() -> Self {
        Self {
            target_class: 0,
            poison_rate: 0.01,
            seed: 0,
            folder: PathBuf::from("artifacts"),
            train: TrainConfig::default(),
        }
    }
}

/// Objective mixing clean and fully-poisoned gradients:
/// `(1 - w) * clean + w * poisoned`, where the poisoned term stamps and
/// relabels the whole batch.
#[derive(Debug, Clone, Copy)]
pub struct BlendedLoss<'a> {
    pub sampler: &'a PoisonSampler,
    pub mark: &'a Watermark,
    pub weight: f32,
}

impl LossObjective for BlendedLoss<'_> {
    fn loss_and_grad(
        &self,
        net: &Network,
        batch: &Batch,
        rng: &mut StdRng,
    ) -> Result<(f32, NetworkGrads)> {
        let (clean_loss, clean_grads) = net.loss_and_grad(batch)?;
        let poisoned = self.sampler.sample(batch, self.mark, false, true, rng)?;
        let (poison_loss, poison_grads) = net.loss_and_grad(&poisoned)?;
        let w = self.weight;
        Ok((
            (1.0 - w) * clean_loss + w * poison_loss,
            NetworkGrads::blend(&clean_grads, &poison_grads, w),
        ))
    }
}

/// Artifact basename for a mark/target combination, e.g.
/// `square_white_tar0_alpha0.50_mark(3,3)` with a `random_pos_` or
/// `distributed_` prefix for the non-fixed placement policies.
pub fn artifact_filename(mark: &Watermark, target_class: usize) -> String {
    let (h, w) = mark.mark_shape();
    let base = format!(
        "{}_tar{}_alpha{:.2}_mark({},{})",
        mark.stem(),
        target_class,
        mark.alpha(),
        h,
        w
    );
    match mark.policy() {
        PositionPolicy::Fixed { .. } => base,
        PositionPolicy::Random => format!("random_pos_{base}"),
        PositionPolicy::Distributed => format!("distributed_{base}"),
    }
}

/// Write the artifact triplet under `folder`, all three files sharing
/// `filename` as their stem: `{filename}.npz` (trigger tensor),
/// `{filename}.png` (trigger preview) and `{filename}.pth` (weights, a
/// zip of `.npy` members keyed by parameter path).
pub fn save_artifacts(
    folder: &Path,
    filename: &str,
    net: &Network,
    mark: &Watermark,
) -> Result<()> {
    std::fs::create_dir_all(folder).map_err(|e| SnareError::ArtifactIo(e.to_string()))?;
    net.state_dict().save(&folder.join(format!("{filename}.pth")))?;
    mark.save_npz(&folder.join(format!("{filename}.npz")))?;
    mark.save_png(&folder.join(format!("{filename}.png")))?;
    info!(folder = %folder.display(), filename, "saved attack artifacts");
    Ok(())
}

/// Read weights previously written by [`save_artifacts`].
pub fn load_weights(folder: &Path, filename: &str) -> Result<WeightStore> {
    WeightStore::load(&folder.join(format!("{filename}.pth")))
}

/// The classic BadNet data-poisoning attack.
///
/// Construction measures the victim's baseline clean accuracy so the
/// validation protocol can guard against utility regressions; [`run`]
/// then trains with poisoned batches, re-validating after every epoch
/// and persisting the artifact triplet at the end.
///
/// [`run`]: BadnetAttack::run
pub struct BadnetAttack {
    net: Network,
    dataset: DataSet,
    mark: Watermark,
    config: AttackConfig,
    sampler: PoisonSampler,
    baseline_clean_acc: f32,
    rng: StdRng,
}

impl BadnetAttack {
    pub fn new(
        net: Network,
        dataset: DataSet,
        mark: Watermark,
        config: AttackConfig,
    ) -> Result<Self> {
        let sampler =
            PoisonSampler::new(config.poison_rate, dataset.batch_size, config.target_class)?;
        let mut rng = StdRng::seed_from_u64(config.seed);
        let (_, baseline_clean_acc) =
            validate(&net, &dataset.valid, None, &mut rng, "baseline clean")?;
        info!(
            baseline_clean_acc,
            target_class = config.target_class,
            poison_rate = config.poison_rate,
            "attack initialized"
        );
        Ok(Self {
            net,
            dataset,
            mark,
            config,
            sampler,
            baseline_clean_acc,
            rng,
        })
    }

    pub fn net(&self) -> &Network {
        &self.net
    }

    pub fn mark(&self) -> &Watermark {
        &self.mark
    }

    pub fn config(&self) -> &AttackConfig {
        &self.config
    }

    pub fn baseline_clean_acc(&self) -> f32 {
        self.baseline_clean_acc
    }

    /// Artifact basename for this attack's mark and target.
    pub fn filename(&self) -> String {
        artifact_filename(&self.mark, self.config.target_class)
    }

    /// Train for `epochs` with poisoned batches under the blended
    /// objective, re-validating after every epoch, then persist the
    /// artifact triplet and return the final protocol outcome.
    pub fn run(&mut self, epochs: usize) -> Result<ValidationOutcome> {
        let filename = self.filename();
        let trainer = Trainer::new(self.config.train.clone());
        let sampler = &self.sampler;
        let mark = &self.mark;
        let dataset = &self.dataset;
        let config = &self.config;
        let baseline = self.baseline_clean_acc;
        let net = &mut self.net;
        let rng = &mut self.rng;

        let transform = PoisonTransform {
            sampler,
            mark,
            keep_original: true,
            relabel: true,
        };
        let objective = BlendedLoss {
            sampler,
            mark,
            weight: config.poison_rate,
        };
        // Training consumes the run RNG; validation gets its own stream so
        // per-epoch evaluation does not perturb the poisoning draws.
        let mut eval_rng = StdRng::seed_from_u64(config.seed.wrapping_add(1));
        trainer.train(
            net,
            &dataset.train,
            epochs,
            Some(&transform),
            Some(&objective),
            rng,
            |net, epoch| {
                let outcome =
                    evaluate(net, &dataset.valid, sampler, mark, baseline, &mut eval_rng)?;
                debug!(
                    epoch,
                    attack_success = outcome.attack_success,
                    clean_acc = outcome.clean_acc,
                    "epoch validation"
                );
                Ok(())
            },
        )?;

        save_artifacts(&config.folder, &filename, net, mark)?;
        let mut final_rng = StdRng::seed_from_u64(config.seed.wrapping_add(2));
        evaluate(net, &dataset.valid, sampler, mark, baseline, &mut final_rng)
    }

    /// Restore the trigger and model weights previously persisted under
    /// this attack's schemed filename in the configured folder.
    ///
    /// Reads `{filename}.npz` into the watermark (placement policy and
    /// scatter are kept) and `{filename}.pth` into the network. A missing
    /// file surfaces as [`SnareError::ArtifactIo`] with no fallback.
    pub fn load(&mut self) -> Result<()> {
        let filename = self.filename();
        let folder = &self.config.folder;
        self.mark
            .restore_npz(&folder.join(format!("{filename}.npz")))?;
        let weights = WeightStore::load(&folder.join(format!("{filename}.pth")))?;
        self.net.load_state_dict(&weights)?;
        info!(folder = %folder.display(), filename, "loaded attack artifacts");
        Ok(())
    }

    /// Run the three-pass validation protocol on the current model.
    pub fn validate(&mut self) -> Result<ValidationOutcome> {
        evaluate(
            &self.net,
            &self.dataset.valid,
            &self.sampler,
            &self.mark,
            self.baseline_clean_acc,
            &mut self.rng,
        )
    }

    /// Mean confidence of successful trigger activations.
    pub fn confidence(&mut self) -> Result<f32> {
        validate_confidence(
            &self.net,
            &self.dataset.valid,
            &self.mark,
            self.config.target_class,
            &mut self.rng,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::{arr1, Array2, Array4};
    use snare_model::{Layer, LinearLayer};

    fn mark(policy: PositionPolicy) -> Watermark {
        Watermark::new(
            "square_white",
            Watermark::square_pattern(1, 5),
            0.5,
            policy,
            (1, 8, 8),
            0,
        )
        .unwrap()
    }

    #[test]
    fn test_artifact_filename_schemes() {
        assert_eq!(
            artifact_filename(&mark(PositionPolicy::Fixed { x: 0, y: 0 }), 3),
            "square_white_tar3_alpha0.50_mark(5,5)"
        );
        assert_eq!(
            artifact_filename(&mark(PositionPolicy::Random), 0),
            "random_pos_square_white_tar0_alpha0.50_mark(5,5)"
        );
        assert_eq!(
            artifact_filename(&mark(PositionPolicy::Distributed), 0),
            "distributed_square_white_tar0_alpha0.50_mark(5,5)"
        );
    }

    #[test]
    fn test_attack_config_serde_round_trip() {
        let config = AttackConfig {
            target_class: 2,
            poison_rate: 0.1,
            ..AttackConfig::default()
        };
        let json = serde_json::to_string(&config).unwrap();
        let back: AttackConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(back.target_class, 2);
        assert!((back.poison_rate - 0.1).abs() < 1e-9);
    }

    #[test]
    fn test_save_and_load_artifacts() {
        let dir = tempfile::tempdir().unwrap();
        let mut net = Network::new();
        net.add_layer(
            "classifier.fc",
            Layer::Linear(
                LinearLayer::new(Array2::from_elem((2, 64), 0.5), Some(arr1(&[1.0, -1.0])))
                    .unwrap(),
            ),
        );
        let wm = mark(PositionPolicy::Fixed { x: 0, y: 0 });
        let filename = artifact_filename(&wm, 0);
        save_artifacts(dir.path(), &filename, &net, &wm).unwrap();

        assert!(dir.path().join(format!("{filename}.pth")).exists());
        assert!(dir.path().join(format!("{filename}.npz")).exists());
        assert!(dir.path().join(format!("{filename}.png")).exists());

        let weights = load_weights(dir.path(), &filename).unwrap();
        assert_eq!(weights, net.state_dict());
    }

    #[test]
    fn test_load_restores_trigger_and_weights_through_driver() {
        let dir = tempfile::tempdir().unwrap();
        let mut net = Network::new();
        net.add_layer(
            "classifier.fc",
            Layer::Linear(
                LinearLayer::new(Array2::from_elem((2, 64), 0.25), Some(arr1(&[0.5, -0.5])))
                    .unwrap(),
            ),
        );
        let wm = mark(PositionPolicy::Fixed { x: 0, y: 0 });
        let config = AttackConfig {
            folder: dir.path().to_path_buf(),
            ..AttackConfig::default()
        };
        let filename = artifact_filename(&wm, config.target_class);
        save_artifacts(dir.path(), &filename, &net, &wm).unwrap();

        // fresh attack over zeroed weights and a blank trigger of the same
        // shape and alpha (same schemed filename)
        let mut blank_net = Network::new();
        blank_net.add_layer(
            "classifier.fc",
            Layer::Linear(LinearLayer::new(Array2::zeros((2, 64)), None).unwrap()),
        );
        let blank_mark = Watermark::new(
            "square_white",
            ndarray::Array3::zeros((1, 5, 5)),
            0.5,
            PositionPolicy::Fixed { x: 0, y: 0 },
            (1, 8, 8),
            0,
        )
        .unwrap();
        let mut attack = BadnetAttack::new(
            blank_net,
            DataSet::new(vec![], vec![], 8),
            blank_mark,
            config,
        )
        .unwrap();

        attack.load().unwrap();
        assert_eq!(attack.net().state_dict(), net.state_dict());
        assert_eq!(attack.mark().pattern(), wm.pattern());
        assert!((attack.mark().alpha() - wm.alpha()).abs() < 1e-6);
    }

    #[test]
    fn test_load_missing_artifacts_is_error() {
        let dir = tempfile::tempdir().unwrap();
        let mut net = Network::new();
        net.add_layer(
            "classifier.fc",
            Layer::Linear(LinearLayer::new(Array2::zeros((2, 64)), None).unwrap()),
        );
        let config = AttackConfig {
            folder: dir.path().to_path_buf(),
            ..AttackConfig::default()
        };
        let mut attack = BadnetAttack::new(
            net,
            DataSet::new(vec![], vec![], 8),
            mark(PositionPolicy::Fixed { x: 0, y: 0 }),
            config,
        )
        .unwrap();
        let err = attack.load().unwrap_err();
        assert!(err.to_string().contains("Artifact IO failed"));
    }

    #[test]
    fn test_new_rejects_bad_poison_rate() {
        let net = Network::new();
        let dataset = DataSet::new(vec![], vec![], 8);
        let wm = mark(PositionPolicy::Fixed { x: 0, y: 0 });
        let config = AttackConfig {
            poison_rate: 0.9,
            ..AttackConfig::default()
        };
        assert!(BadnetAttack::new(net, dataset, wm, config).is_err());
    }

    #[test]
    fn test_blended_loss_matches_manual_mix() {
        let mut w = Array2::zeros((2, 64));
        w[[1, 5]] = 1.0;
        let mut net = Network::new();
        net.add_layer("classifier.fc", Layer::Linear(LinearLayer::new(w, None).unwrap()));

        let batch = Batch::new(Array4::from_elem((2, 1, 8, 8), 0.5), arr1(&[0usize, 1]));
        let sampler = PoisonSampler::new(0.25, 2, 1).unwrap();
        let wm = mark(PositionPolicy::Fixed { x: 0, y: 0 });
        let objective = BlendedLoss {
            sampler: &sampler,
            mark: &wm,
            weight: 0.25,
        };

        let mut rng = rand::rngs::StdRng::seed_from_u64(0);
        let (loss, _) = objective.loss_and_grad(&net, &batch, &mut rng).unwrap();

        let clean = net.loss(&batch).unwrap();
        let mut rng2 = rand::rngs::StdRng::seed_from_u64(0);
        let poisoned = sampler.sample(&batch, &wm, false, true, &mut rng2).unwrap();
        let poison = net.loss(&poisoned).unwrap();
        assert!((loss - (0.75 * clean + 0.25 * poison)).abs() < 1e-6);
    }
}

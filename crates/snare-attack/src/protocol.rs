//! Three-pass backdoor validation protocol.
//!
//! A backdoored model is scored on three axes over the same validation
//! split:
//!
//! 1. clean pass: untouched images against true labels,
//! 2. trigger/target pass: every image stamped, labels rewritten to the
//!    target class (attack success rate),
//! 3. trigger/original pass: every image stamped, true labels kept
//!    (how much the trigger disturbs normal predictions).
//!
//! A regression guard then zeroes the reported attack success when clean
//! accuracy regressed materially below the pre-attack baseline, so a run
//! that trades away the model's utility cannot score as a success.

use rand::rngs::StdRng;
use serde::{Deserialize, Serialize};
use snare_core::Result;
use snare_model::{validate, Batch, Network};
use tracing::info;

use crate::confidence::validate_confidence;
use crate::mark::Watermark;
use crate::sampler::{PoisonSampler, PoisonTransform};

/// Clean accuracy may drop this many percentage points before the guard
/// fires.
const GUARD_DROP_POINTS: f32 = 3.0;
/// The guard only applies when the baseline model was at least this
/// accurate; below that there is no utility left to protect.
const GUARD_MIN_BASELINE: f32 = 40.0;

/// Scores from one full validation protocol run.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct ValidationOutcome {
    /// Clean loss plus trigger/target loss, the scalar a scheduler or
    /// early-stopper tracks.
    pub combined_loss: f32,
    /// Attack success rate in percent, after the regression guard.
    pub attack_success: f32,
    /// Clean top-1 accuracy in percent.
    pub clean_acc: f32,
}

/// Zero out a reported attack success when clean accuracy regressed more
/// than [`GUARD_DROP_POINTS`] below a usable baseline.
pub fn regression_guard(baseline_clean_acc: f32, clean_acc: f32, raw_attack_success: f32) -> f32 {
    if baseline_clean_acc - clean_acc > GUARD_DROP_POINTS && baseline_clean_acc > GUARD_MIN_BASELINE
    {
        0.0
    } else {
        raw_attack_success
    }
}

/// Run the three validation passes and apply the regression guard.
pub fn evaluate(
    net: &Network,
    batches: &[Batch],
    sampler: &PoisonSampler,
    mark: &Watermark,
    baseline_clean_acc: f32,
    rng: &mut StdRng,
) -> Result<ValidationOutcome> {
    let (clean_loss, clean_acc) = validate(net, batches, None, rng, "validate clean")?;

    let target_pass = PoisonTransform {
        sampler,
        mark,
        keep_original: false,
        relabel: true,
    };
    let (target_loss, raw_attack) =
        validate(net, batches, Some(&target_pass), rng, "validate trigger target")?;

    let original_pass = PoisonTransform {
        sampler,
        mark,
        keep_original: false,
        relabel: false,
    };
    let (_, trigger_org_acc) =
        validate(net, batches, Some(&original_pass), rng, "validate trigger original")?;

    let confidence =
        validate_confidence(net, batches, mark, sampler.target_class(), rng)?;

    let attack_success = regression_guard(baseline_clean_acc, clean_acc, raw_attack);
    if attack_success != raw_attack {
        info!(
            baseline = baseline_clean_acc,
            clean_acc, "clean accuracy regressed, zeroing attack success"
        );
    }
    info!(
        baseline = baseline_clean_acc,
        clean_acc, attack_success, trigger_org_acc, confidence, "validation protocol complete"
    );
    Ok(ValidationOutcome {
        combined_loss: clean_loss + target_loss,
        attack_success,
        clean_acc,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mark::PositionPolicy;
    use ndarray::{Array1, Array2, Array4};
    use rand::SeedableRng;
    use snare_model::{Layer, LinearLayer};

    #[test]
    fn test_regression_guard_cases() {
        // healthy run: no drop
        assert_eq!(regression_guard(95.0, 94.0, 99.0), 99.0);
        // material drop from a usable baseline
        assert_eq!(regression_guard(95.0, 90.0, 99.0), 0.0);
        // big drop but the baseline was already unusable
        assert_eq!(regression_guard(30.0, 10.0, 99.0), 99.0);
        // drop exactly at the threshold is allowed
        assert_eq!(regression_guard(95.0, 92.0, 99.0), 99.0);
    }

    /// 1x4x4 grayscale, 2 classes. Pixel 5 carries the true class signal,
    /// pixel 0 is the trigger location with an overwhelming weight toward
    /// class 1.
    fn rigged_net() -> Network {
        let mut w = Array2::zeros((2, 16));
        w[[1, 5]] = 10.0;
        w[[1, 0]] = 100.0;
        let mut net = Network::new();
        net.add_layer(
            "classifier.fc",
            Layer::Linear(LinearLayer::new(w, Some(Array1::from_vec(vec![5.0, 0.0]))).unwrap()),
        );
        net
    }

    fn valid_batch(labels_correct: bool) -> Batch {
        // image 0: class 0 (pixel5 = 0), image 1: class 1 (pixel5 = 1)
        let mut images = Array4::zeros((2, 1, 4, 4));
        images[[1, 0, 1, 1]] = 1.0; // flat index 5
        let labels = if labels_correct {
            Array1::from_vec(vec![0usize, 1])
        } else {
            Array1::from_vec(vec![1usize, 0])
        };
        Batch::new(images, labels)
    }

    fn trigger() -> Watermark {
        Watermark::new(
            "square_white",
            Watermark::square_pattern(1, 1),
            1.0,
            PositionPolicy::Fixed { x: 0, y: 0 },
            (1, 4, 4),
            0,
        )
        .unwrap()
    }

    #[test]
    fn test_evaluate_on_backdoored_net() {
        let net = rigged_net();
        let sampler = PoisonSampler::new(0.1, 2, 1).unwrap();
        let batches = vec![valid_batch(true)];
        let mut rng = StdRng::seed_from_u64(0);
        let outcome =
            evaluate(&net, &batches, &sampler, &trigger(), 100.0, &mut rng).unwrap();
        assert!((outcome.clean_acc - 100.0).abs() < 1e-4);
        assert!((outcome.attack_success - 100.0).abs() < 1e-4);
        assert!(outcome.combined_loss.is_finite());
    }

    #[test]
    fn test_evaluate_guard_zeroes_attack_success() {
        // Wrong labels make the clean pass score 0%, far below baseline,
        // so the perfect raw trigger accuracy must be reported as 0.
        let net = rigged_net();
        let sampler = PoisonSampler::new(0.1, 2, 1).unwrap();
        let batches = vec![valid_batch(false)];
        let mut rng = StdRng::seed_from_u64(0);
        let outcome =
            evaluate(&net, &batches, &sampler, &trigger(), 50.0, &mut rng).unwrap();
        assert_eq!(outcome.clean_acc, 0.0);
        assert_eq!(outcome.attack_success, 0.0);
    }

    #[test]
    fn test_outcome_serde_round_trip() {
        let outcome = ValidationOutcome {
            combined_loss: 1.25,
            attack_success: 97.5,
            clean_acc: 88.0,
        };
        let json = serde_json::to_string(&outcome).unwrap();
        let back: ValidationOutcome = serde_json::from_str(&json).unwrap();
        assert!((back.attack_success - 97.5).abs() < 1e-6);
    }
}

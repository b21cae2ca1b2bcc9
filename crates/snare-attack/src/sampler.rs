//! Batch poisoning: select, stamp and relabel a slice of each batch.

use ndarray::{concatenate, s, Array1, Axis};
use rand::rngs::StdRng;
use rand::Rng;
use snare_core::{check_poison_rate, Result, SnareError};
use snare_model::{Batch, DataTransform};

use crate::mark::Watermark;

/// Draws poisoned variants out of clean batches.
///
/// The expected number of poisoned examples per batch is
/// `rate * batch_size`, where `batch_size` is the loader's nominal batch
/// size. A fractional expectation is honored exactly in distribution by
/// stochastic rounding: the fractional part becomes the probability of
/// one extra poisoned example.
#[derive(Debug, Clone)]
pub struct PoisonSampler {
    poison_num: f32,
    target_class: usize,
}

impl PoisonSampler {
    pub fn new(rate: f32, batch_size: usize, target_class: usize) -> Result<Self> {
        check_poison_rate(rate)?;
        Ok(Self {
            poison_num: rate * batch_size as f32,
            target_class,
        })
    }

    /// Expected poisoned examples per batch (possibly fractional).
    pub fn poison_num(&self) -> f32 {
        self.poison_num
    }

    pub fn target_class(&self) -> usize {
        self.target_class
    }

    fn draw_count(&self, rng: &mut StdRng) -> usize {
        let integer = self.poison_num.trunc() as usize;
        let fraction = self.poison_num.fract();
        if rng.random::<f32>() < fraction {
            integer + 1
        } else {
            integer
        }
    }

    /// Produce a training or evaluation batch from a clean one.
    ///
    /// With `keep_original`, the first `draw_count` examples are copied,
    /// stamped and prepended to the untouched originals, so the batch
    /// grows. Without it, every example is stamped in place of the
    /// original batch. `relabel` rewrites poisoned labels to the target
    /// class; leaving it off evaluates the trigger against true labels.
    pub fn sample(
        &self,
        batch: &Batch,
        mark: &Watermark,
        keep_original: bool,
        relabel: bool,
        rng: &mut StdRng,
    ) -> Result<Batch> {
        let count = if keep_original {
            self.draw_count(rng).min(batch.len())
        } else {
            batch.len()
        };
        if keep_original && count == 0 {
            return Ok(batch.clone());
        }

        let selected = batch.images.slice(s![..count, .., .., ..]).to_owned();
        let marked = mark.apply(&selected, rng)?;
        let labels = if relabel {
            Array1::from_elem(count, self.target_class)
        } else {
            batch.labels.slice(s![..count]).to_owned()
        };

        if keep_original {
            let images = concatenate(Axis(0), &[marked.view(), batch.images.view()])
                .map_err(|_| SnareError::ShapeMismatch {
                    expected: batch.images.shape().to_vec(),
                    got: marked.shape().to_vec(),
                })?;
            let labels = concatenate(Axis(0), &[labels.view(), batch.labels.view()])
                .map_err(|_| SnareError::ShapeMismatch {
                    expected: vec![batch.labels.len()],
                    got: vec![labels.len()],
                })?;
            Ok(Batch::new(images, labels))
        } else {
            Ok(Batch::new(marked, labels))
        }
    }
}

/// Adapter plugging a sampler into the training loop's transform seam.
#[derive(Debug, Clone, Copy)]
pub struct PoisonTransform<'a> {
    pub sampler: &'a PoisonSampler,
    pub mark: &'a Watermark,
    pub keep_original: bool,
    pub relabel: bool,
}

impl DataTransform for PoisonTransform<'_> {
    fn transform(&self, batch: &Batch, rng: &mut StdRng) -> Result<Batch> {
        self.sampler
            .sample(batch, self.mark, self.keep_original, self.relabel, rng)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mark::PositionPolicy;
    use ndarray::Array4;
    use rand::SeedableRng;

    fn mark() -> Watermark {
        Watermark::new(
            "square_white",
            Watermark::square_pattern(1, 2),
            1.0,
            PositionPolicy::Fixed { x: 0, y: 0 },
            (1, 4, 4),
            0,
        )
        .unwrap()
    }

    fn clean_batch(n: usize) -> Batch {
        Batch::new(
            Array4::zeros((n, 1, 4, 4)),
            Array1::from_iter((0..n).map(|i| i % 3)),
        )
    }

    #[test]
    fn test_zero_rate_returns_batch_unchanged() {
        let sampler = PoisonSampler::new(0.0, 8, 0).unwrap();
        let batch = clean_batch(8);
        let mut rng = StdRng::seed_from_u64(0);
        let out = sampler.sample(&batch, &mark(), true, true, &mut rng).unwrap();
        assert_eq!(out, batch);
    }

    #[test]
    fn test_invalid_rate_rejected() {
        assert!(PoisonSampler::new(0.6, 8, 0).is_err());
        assert!(PoisonSampler::new(-0.1, 8, 0).is_err());
    }

    #[test]
    fn test_full_poison_replaces_batch() {
        let sampler = PoisonSampler::new(0.1, 8, 2).unwrap();
        let batch = clean_batch(5);
        let mut rng = StdRng::seed_from_u64(0);
        let out = sampler
            .sample(&batch, &mark(), false, true, &mut rng)
            .unwrap();
        assert_eq!(out.len(), 5);
        assert!(out.labels.iter().all(|&l| l == 2));
        // every image carries the opaque 2x2 stamp
        for n in 0..5 {
            assert_eq!(out.images[[n, 0, 0, 0]], 1.0);
        }
    }

    #[test]
    fn test_keep_original_prepends_poisoned_copies() {
        // rate 0.25 of batch size 8 -> exactly 2, no stochastic part
        let sampler = PoisonSampler::new(0.25, 8, 1).unwrap();
        let batch = clean_batch(8);
        let mut rng = StdRng::seed_from_u64(0);
        let out = sampler.sample(&batch, &mark(), true, true, &mut rng).unwrap();
        assert_eq!(out.len(), 10);
        // poisoned head
        assert_eq!(out.labels[0], 1);
        assert_eq!(out.labels[1], 1);
        assert_eq!(out.images[[0, 0, 0, 0]], 1.0);
        // untouched tail
        for i in 0..8 {
            assert_eq!(out.labels[i + 2], batch.labels[i]);
        }
        assert_eq!(out.images[[2, 0, 0, 0]], 0.0);
    }

    #[test]
    fn test_relabel_off_keeps_true_labels() {
        let sampler = PoisonSampler::new(0.25, 8, 1).unwrap();
        let batch = clean_batch(8);
        let mut rng = StdRng::seed_from_u64(0);
        let out = sampler
            .sample(&batch, &mark(), false, false, &mut rng)
            .unwrap();
        assert_eq!(out.labels, batch.labels);
    }

    #[test]
    fn test_stochastic_rounding_matches_expectation() {
        // poison_num = 0.5: each draw yields 0 or 1 extra example.
        let sampler = PoisonSampler::new(0.25, 2, 0).unwrap();
        let batch = clean_batch(2);
        let mut rng = StdRng::seed_from_u64(123);
        let trials = 1000;
        let mut extra = 0usize;
        for _ in 0..trials {
            let out = sampler.sample(&batch, &mark(), true, true, &mut rng).unwrap();
            let added = out.len() - batch.len();
            assert!(added <= 1);
            extra += added;
        }
        let mean = extra as f32 / trials as f32;
        assert!((mean - 0.5).abs() < 0.1, "mean extra {mean}");
    }

    #[test]
    fn test_fractional_count_rounds_to_neighbors_of_expectation() {
        // rate 0.1 of batch size 32 -> 3.2 expected poisoned examples:
        // every draw is 3 or 4 and the long-run mean converges to 3.2.
        let sampler = PoisonSampler::new(0.1, 32, 0).unwrap();
        let mut rng = StdRng::seed_from_u64(17);
        let trials = 10_000;
        let mut total = 0usize;
        for _ in 0..trials {
            let count = sampler.draw_count(&mut rng);
            assert!(count == 3 || count == 4, "count {count}");
            total += count;
        }
        let mean = total as f64 / trials as f64;
        assert!((mean - 3.2).abs() < 0.05, "mean {mean}");
    }

    #[test]
    fn test_short_final_batch_is_clamped() {
        // nominal batch 8 -> poison_num 2, but only 1 example available
        let sampler = PoisonSampler::new(0.25, 8, 0).unwrap();
        let batch = clean_batch(1);
        let mut rng = StdRng::seed_from_u64(0);
        let out = sampler.sample(&batch, &mark(), true, true, &mut rng).unwrap();
        assert_eq!(out.len(), 2);
    }

    proptest::proptest! {
        #[test]
        fn prop_sample_preserves_originals(
            len in 1usize..12,
            rate in 0.0f32..0.5,
            seed in 0u64..64,
        ) {
            let sampler = PoisonSampler::new(rate, 8, 0).unwrap();
            let batch = clean_batch(len);
            let mut rng = StdRng::seed_from_u64(seed);
            let out = sampler.sample(&batch, &mark(), true, true, &mut rng).unwrap();
            let added = out.len() - len;
            proptest::prop_assert!(added <= (rate * 8.0).ceil() as usize);
            // original examples survive verbatim at the tail
            for i in 0..len {
                proptest::prop_assert_eq!(out.labels[added + i], batch.labels[i]);
            }
        }
    }
}

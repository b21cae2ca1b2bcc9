//! Trigger watermark: a small pattern alpha-blended into images.

use std::path::Path;

use ndarray::{arr1, Array3, Array4};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use snare_core::{Result, SnareError};
use snare_model::npy;

/// Where the trigger lands in each image.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PositionPolicy {
    /// Stamp at a fixed (column, row) offset for every image.
    Fixed { x: usize, y: usize },
    /// Draw a fresh offset per image at apply time.
    Random,
    /// Scatter the trigger pixels over the whole image at positions fixed
    /// once at construction.
    Distributed,
}

/// A trigger pattern plus the policy for placing it.
///
/// `pattern` is (channels, height, width) with values in `[0, 1]`;
/// blending writes `(1 - alpha) * pixel + alpha * pattern` at the chosen
/// positions and leaves everything else untouched.
#[derive(Debug, Clone, PartialEq)]
pub struct Watermark {
    stem: String,
    pattern: Array3<f32>,
    alpha: f32,
    policy: PositionPolicy,
    image_shape: (usize, usize, usize),
    scatter: Vec<(usize, usize)>,
}

impl Watermark {
    /// Build a watermark for images of `image_shape` (channels, height,
    /// width). `seed` only matters for [`PositionPolicy::Distributed`],
    /// which freezes its scatter positions here.
    pub fn new(
        stem: impl Into<String>,
        pattern: Array3<f32>,
        alpha: f32,
        policy: PositionPolicy,
        image_shape: (usize, usize, usize),
        seed: u64,
    ) -> Result<Self> {
        if !(0.0..=1.0).contains(&alpha) || !alpha.is_finite() {
            return Err(SnareError::InvalidConfig(format!(
                "watermark alpha must be in [0, 1], got {alpha}"
            )));
        }
        let (c, h, w) = image_shape;
        let ps = pattern.shape();
        let (pc, ph, pw) = (ps[0], ps[1], ps[2]);
        if pc != c || ph > h || pw > w {
            return Err(SnareError::ShapeMismatch {
                expected: vec![c, h, w],
                got: vec![pc, ph, pw],
            });
        }
        if let PositionPolicy::Fixed { x, y } = policy {
            if x + pw > w || y + ph > h {
                return Err(SnareError::InvalidConfig(format!(
                    "fixed position ({x}, {y}) puts a {ph}x{pw} trigger outside a {h}x{w} image"
                )));
            }
        }
        let scatter = match policy {
            PositionPolicy::Distributed => {
                let mut rng = StdRng::seed_from_u64(seed);
                (0..ph * pw)
                    .map(|_| (rng.random_range(0..h), rng.random_range(0..w)))
                    .collect()
            }
            _ => Vec::new(),
        };
        Ok(Self {
            stem: stem.into(),
            pattern,
            alpha,
            policy,
            image_shape,
            scatter,
        })
    }

    /// All-ones square pattern, the classic BadNet trigger.
    pub fn square_pattern(channels: usize, size: usize) -> Array3<f32> {
        Array3::ones((channels, size, size))
    }

    pub fn stem(&self) -> &str {
        &self.stem
    }

    pub fn alpha(&self) -> f32 {
        self.alpha
    }

    pub fn policy(&self) -> PositionPolicy {
        self.policy
    }

    pub fn pattern(&self) -> &Array3<f32> {
        &self.pattern
    }

    /// (height, width) of the trigger pattern.
    pub fn mark_shape(&self) -> (usize, usize) {
        let s = self.pattern.shape();
        (s[1], s[2])
    }

    /// Stamp the trigger into every image of the batch, returning a new
    /// tensor. `rng` drives per-image offsets under
    /// [`PositionPolicy::Random`] and is untouched otherwise.
    pub fn apply(&self, images: &Array4<f32>, rng: &mut StdRng) -> Result<Array4<f32>> {
        let s = images.shape();
        let (c, h, w) = self.image_shape;
        if s[1] != c || s[2] != h || s[3] != w {
            return Err(SnareError::ShapeMismatch {
                expected: vec![c, h, w],
                got: vec![s[1], s[2], s[3]],
            });
        }
        let (ph, pw) = self.mark_shape();
        let alpha = self.alpha;
        let mut out = images.clone();
        for n in 0..s[0] {
            match self.policy {
                PositionPolicy::Fixed { x, y } => {
                    self.stamp(&mut out, n, y, x);
                }
                PositionPolicy::Random => {
                    let y = rng.random_range(0..=h - ph);
                    let x = rng.random_range(0..=w - pw);
                    self.stamp(&mut out, n, y, x);
                }
                PositionPolicy::Distributed => {
                    for (k, &(row, col)) in self.scatter.iter().enumerate() {
                        let (i, j) = (k / pw, k % pw);
                        for ch in 0..c {
                            let p = self.pattern[[ch, i, j]];
                            let v = &mut out[[n, ch, row, col]];
                            *v = (1.0 - alpha) * *v + alpha * p;
                        }
                    }
                }
            }
        }
        Ok(out)
    }

    fn stamp(&self, out: &mut Array4<f32>, n: usize, y: usize, x: usize) {
        let (ph, pw) = self.mark_shape();
        let c = self.image_shape.0;
        for ch in 0..c {
            for i in 0..ph {
                for j in 0..pw {
                    let p = self.pattern[[ch, i, j]];
                    let v = &mut out[[n, ch, y + i, x + j]];
                    *v = (1.0 - self.alpha) * *v + self.alpha * p;
                }
            }
        }
    }

    /// Persist pattern and alpha as an `.npz` with members `mark` and
    /// `alpha`.
    pub fn save_npz(&self, path: &Path) -> Result<()> {
        let mut entries = std::collections::BTreeMap::new();
        entries.insert("mark".to_string(), self.pattern.clone().into_dyn());
        entries.insert("alpha".to_string(), arr1(&[self.alpha]).into_dyn());
        npy::write_npz(path, &entries)
    }

    fn read_npz(path: &Path) -> Result<(Array3<f32>, f32)> {
        let entries = npy::read_npz(path)?;
        let pattern = entries
            .get("mark")
            .ok_or_else(|| SnareError::ArtifactIo("npz missing member: mark".to_string()))?
            .clone()
            .into_dimensionality::<ndarray::Ix3>()
            .map_err(|e| SnareError::ArtifactIo(e.to_string()))?;
        let alpha = entries
            .get("alpha")
            .and_then(|a| a.iter().next().copied())
            .ok_or_else(|| SnareError::ArtifactIo("npz missing member: alpha".to_string()))?;
        Ok((pattern, alpha))
    }

    /// Rebuild a watermark from an `.npz` written by [`Watermark::save_npz`].
    pub fn load_npz(
        path: &Path,
        stem: impl Into<String>,
        policy: PositionPolicy,
        image_shape: (usize, usize, usize),
        seed: u64,
    ) -> Result<Self> {
        let (pattern, alpha) = Self::read_npz(path)?;
        Self::new(stem, pattern, alpha, policy, image_shape, seed)
    }

    /// Reload pattern and alpha from an `.npz` written by
    /// [`Watermark::save_npz`], keeping the placement policy and any frozen
    /// scatter positions. The stored pattern must match the current
    /// pattern's shape.
    pub fn restore_npz(&mut self, path: &Path) -> Result<()> {
        let (pattern, alpha) = Self::read_npz(path)?;
        if pattern.shape() != self.pattern.shape() {
            return Err(SnareError::ShapeMismatch {
                expected: self.pattern.shape().to_vec(),
                got: pattern.shape().to_vec(),
            });
        }
        if !(0.0..=1.0).contains(&alpha) || !alpha.is_finite() {
            return Err(SnareError::ArtifactIo(format!(
                "stored alpha out of range: {alpha}"
            )));
        }
        self.pattern = pattern;
        self.alpha = alpha;
        Ok(())
    }

    /// Render the pattern as a PNG preview. Supports 1-channel (grayscale)
    /// and 3-channel (RGB) patterns.
    pub fn save_png(&self, path: &Path) -> Result<()> {
        let s = self.pattern.shape();
        let (c, h, w) = (s[0], s[1], s[2]);
        let to_u8 = |v: f32| (v.clamp(0.0, 1.0) * 255.0).round() as u8;
        let err = |e: image::ImageError| SnareError::ArtifactIo(e.to_string());
        match c {
            1 => {
                let mut bytes = Vec::with_capacity(h * w);
                for i in 0..h {
                    for j in 0..w {
                        bytes.push(to_u8(self.pattern[[0, i, j]]));
                    }
                }
                image::GrayImage::from_raw(w as u32, h as u32, bytes)
                    .ok_or_else(|| SnareError::ArtifactIo("png buffer size mismatch".to_string()))?
                    .save(path)
                    .map_err(err)
            }
            3 => {
                let mut bytes = Vec::with_capacity(3 * h * w);
                for i in 0..h {
                    for j in 0..w {
                        for ch in 0..3 {
                            bytes.push(to_u8(self.pattern[[ch, i, j]]));
                        }
                    }
                }
                image::RgbImage::from_raw(w as u32, h as u32, bytes)
                    .ok_or_else(|| SnareError::ArtifactIo("png buffer size mismatch".to_string()))?
                    .save(path)
                    .map_err(err)
            }
            other => Err(SnareError::ArtifactIo(format!(
                "cannot render {other}-channel pattern as png"
            ))),
        }
    }
}

//! Core types for the snare backdoor-attack research toolkit.
//!
//! This crate provides the shared error type and the small metric
//! utilities every other crate in the workspace builds on.

use serde::{Deserialize, Serialize};

/// Error types for snare operations.
#[derive(Debug)]
pub enum SnareError {
    ShapeMismatch {
        expected: Vec<usize>,
        got: Vec<usize>,
    },

    InvalidConfig(String),

    ModelLoad(String),

    ArtifactIo(String),

    UnsupportedLayer(String),
}

impl std::fmt::Display for SnareError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SnareError::ShapeMismatch { expected, got } => {
                write!(f, "Shape mismatch: expected {:?}, got {:?}", expected, got)
            }
            SnareError::InvalidConfig(s) => write!(f, "Invalid configuration: {}", s),
            SnareError::ModelLoad(s) => write!(f, "Model loading failed: {}", s),
            SnareError::ArtifactIo(s) => write!(f, "Artifact IO failed: {}", s),
            SnareError::UnsupportedLayer(s) => write!(f, "Unsupported layer type: {}", s),
        }
    }
}

impl std::error::Error for SnareError {}

pub type Result<T> = std::result::Result<T, SnareError>;

/// Running average weighted by per-update sample counts.
///
/// Used for validation loss/accuracy aggregation and for the trigger
/// confidence metric. `avg` of a meter that never received a non-empty
/// update is `NaN`; callers that cannot tolerate NaN must check
/// [`AverageMeter::count`] first.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AverageMeter {
    sum: f64,
    count: usize,
}

impl AverageMeter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fold in `value`, weighted by `n` samples. `n == 0` is a no-op.
    pub fn update(&mut self, value: f32, n: usize) {
        self.sum += f64::from(value) * n as f64;
        self.count += n;
    }

    pub fn count(&self) -> usize {
        self.count
    }

    /// Weighted mean of all updates so far. NaN when no samples were seen.
    pub fn avg(&self) -> f32 {
        (self.sum / self.count as f64) as f32
    }
}

/// Validate a poisoning rate at configuration time.
///
/// Rates above 0.5 would make poisoned examples the majority of every
/// training batch, which is outside the regime the attack is defined for.
pub fn check_poison_rate(rate: f32) -> Result<()> {
    if !(0.0..=0.5).contains(&rate) || !rate.is_finite() {
        return Err(SnareError::InvalidConfig(format!(
            "poison rate must be in [0, 0.5], got {}",
            rate
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_average_meter_weighted_mean() {
        let mut meter = AverageMeter::new();
        meter.update(1.0, 2);
        meter.update(4.0, 1);
        // (1*2 + 4*1) / 3 = 2.0
        assert!((meter.avg() - 2.0).abs() < 1e-6);
        assert_eq!(meter.count(), 3);
    }

    #[test]
    fn test_average_meter_zero_weight_update_is_noop() {
        let mut meter = AverageMeter::new();
        meter.update(1.0, 4);
        meter.update(999.0, 0);
        assert!((meter.avg() - 1.0).abs() < 1e-6);
        assert_eq!(meter.count(), 4);
    }

    #[test]
    fn test_average_meter_empty_is_nan() {
        let meter = AverageMeter::new();
        assert!(meter.avg().is_nan());
        assert_eq!(meter.count(), 0);
    }

    #[test]
    fn test_check_poison_rate_bounds() {
        assert!(check_poison_rate(0.0).is_ok());
        assert!(check_poison_rate(0.1).is_ok());
        assert!(check_poison_rate(0.5).is_ok());
        assert!(check_poison_rate(0.51).is_err());
        assert!(check_poison_rate(-0.01).is_err());
        assert!(check_poison_rate(f32::NAN).is_err());
    }

    #[test]
    fn test_error_display() {
        let err = SnareError::ShapeMismatch {
            expected: vec![2, 3],
            got: vec![2, 4],
        };
        let msg = format!("{}", err);
        assert!(msg.contains("Shape mismatch"));
        assert!(msg.contains("[2, 3]"));
        assert!(msg.contains("[2, 4]"));

        let err = SnareError::InvalidConfig("bad rate".to_string());
        assert!(format!("{}", err).contains("bad rate"));

        let err = SnareError::ModelLoad("file not found".to_string());
        assert!(format!("{}", err).contains("Model loading failed"));

        let err = SnareError::ArtifactIo("missing npz".to_string());
        assert!(format!("{}", err).contains("Artifact IO failed"));
    }

    #[test]
    fn test_average_meter_serde_round_trip() {
        let mut meter = AverageMeter::new();
        meter.update(0.5, 10);
        let json = serde_json::to_string(&meter).unwrap();
        let back: AverageMeter = serde_json::from_str(&json).unwrap();
        assert_eq!(back.count(), 10);
        assert!((back.avg() - 0.5).abs() < 1e-6);
    }
}

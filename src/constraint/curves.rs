//! Injected response curves.
//!
//! How strongly a tight budget or a crowded resource slows execution is a
//! calibration input that differs between deployments. Constraints take
//! the mapping as a strategy object; no threshold or multiplier lives in
//! constraint code.

use crate::error::{SimError, SimResult};

/// Maps an availability ratio in [0, 1] to a duration multiplier >= 1.
pub trait ResponseCurve: Send + Sync + std::fmt::Debug {
    /// Multiplier applied to durations at the given availability ratio.
    fn multiplier(&self, ratio: f64) -> f64;
}

/// Linear slowdown: durations stretch by `1 / ratio`, with the effective
/// speed floored at `min_speed_ratio` so the multiplier never exceeds
/// `1 / min_speed_ratio`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LinearResponseCurve {
    min_speed_ratio: f64,
}

impl LinearResponseCurve {
    /// Build a curve; `min_speed_ratio` must lie in (0, 1].
    ///
    /// # Errors
    ///
    /// Returns `InvalidParameter` for a floor outside (0, 1].
    pub fn new(min_speed_ratio: f64) -> SimResult<Self> {
        if !min_speed_ratio.is_finite() || min_speed_ratio <= 0.0 || min_speed_ratio > 1.0 {
            return Err(SimError::invalid_parameter(
                "linear_response_curve",
                format!("min_speed_ratio must be in (0, 1], got {min_speed_ratio}"),
            ));
        }
        Ok(Self { min_speed_ratio })
    }

    /// The configured speed floor.
    #[must_use]
    pub const fn min_speed_ratio(&self) -> f64 {
        self.min_speed_ratio
    }
}

impl ResponseCurve for LinearResponseCurve {
    fn multiplier(&self, ratio: f64) -> f64 {
        1.0 / ratio.clamp(self.min_speed_ratio, 1.0)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_linear_curve_exact_values() {
        let curve = LinearResponseCurve::new(0.5).unwrap();
        assert!((curve.multiplier(1.0) - 1.0).abs() < 1e-12);
        assert!((curve.multiplier(0.8) - 1.25).abs() < 1e-12);
        // At ratio 0.5 the multiplier is exactly 2.0.
        assert!((curve.multiplier(0.5) - 2.0).abs() < 1e-12);
        // Below the floor it clamps to 2.0, not 3.33.
        assert!((curve.multiplier(0.3) - 2.0).abs() < 1e-12);
        assert!((curve.multiplier(0.0) - 2.0).abs() < 1e-12);
    }

    #[test]
    fn test_ratio_above_one_never_speeds_up() {
        let curve = LinearResponseCurve::new(0.25).unwrap();
        assert!((curve.multiplier(1.7) - 1.0).abs() < 1e-12);
    }

    #[test]
    fn test_floor_validation() {
        assert!(LinearResponseCurve::new(0.0).is_err());
        assert!(LinearResponseCurve::new(-0.5).is_err());
        assert!(LinearResponseCurve::new(1.5).is_err());
        assert!(LinearResponseCurve::new(f64::NAN).is_err());
        assert!(LinearResponseCurve::new(1.0).is_ok());
    }
}

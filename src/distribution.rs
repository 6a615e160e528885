//! Seeded probability distributions.
//!
//! Every sampling call seeds an independent PCG generator, so there is no
//! shared mutable RNG state and call order never affects results. Analytic
//! forms are precomputed at construction; construction is also where every
//! parameter invariant is enforced.
//!
//! `sample` is `pub(crate)`: entities hold `Distribution` references but
//! only the engine may draw from them. Outside this crate, misuse is a
//! compile error rather than a convention.

use rand::distributions::Distribution as Draw;
use rand::SeedableRng;
use rand_pcg::Pcg64;
use serde::{Deserialize, Serialize};
use statrs::distribution::ContinuousCDF;

use crate::error::{SimError, SimResult};

/// Cap on rejection-sampling attempts for bounded distributions.
/// Exhausting it is a hard `BoundsInfeasible` failure, never a loop.
pub const MAX_REJECTION_ATTEMPTS: u32 = 1_000;

/// Family-specific parameters.
///
/// Serialized with a `family` tag so a reader can identify the assumption
/// behind any sampled quantity from the JSON alone.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "family", rename_all = "snake_case")]
pub enum Params {
    /// Triangular(low, mode, high), low < mode < high.
    Triangular {
        /// Minimum value.
        low: f64,
        /// Most likely value.
        mode: f64,
        /// Maximum value.
        high: f64,
    },
    /// Log-normal parameterized by arithmetic mean and coefficient of
    /// variation, both strictly positive.
    LogNormal {
        /// Arithmetic mean of the distribution.
        mean: f64,
        /// Coefficient of variation (std / mean).
        cv: f64,
    },
    /// Gamma(shape, scale), both strictly positive.
    Gamma {
        /// Shape parameter k.
        shape: f64,
        /// Scale parameter θ.
        scale: f64,
    },
    /// Bernoulli(p), p in [0, 1]. Codomain is {0, 1}; bounds are rejected.
    Bernoulli {
        /// Success probability.
        p: f64,
    },
}

impl Params {
    /// Family name as used in errors and flattened output summaries.
    #[must_use]
    pub const fn family_name(&self) -> &'static str {
        match self {
            Self::Triangular { .. } => "triangular",
            Self::LogNormal { .. } => "log_normal",
            Self::Gamma { .. } => "gamma",
            Self::Bernoulli { .. } => "bernoulli",
        }
    }

    /// Parameter names and values, flattened for audit output.
    #[must_use]
    pub fn to_map(&self) -> std::collections::BTreeMap<&'static str, f64> {
        let mut map = std::collections::BTreeMap::new();
        match *self {
            Self::Triangular { low, mode, high } => {
                map.insert("low", low);
                map.insert("mode", mode);
                map.insert("high", high);
            }
            Self::LogNormal { mean, cv } => {
                map.insert("mean", mean);
                map.insert("cv", cv);
            }
            Self::Gamma { shape, scale } => {
                map.insert("shape", shape);
                map.insert("scale", scale);
            }
            Self::Bernoulli { p } => {
                map.insert("p", p);
            }
        }
        map
    }

    /// Return a copy with the named parameter overwritten, leaving the
    /// others intact. Unknown names for the family are rejected.
    ///
    /// # Errors
    ///
    /// Returns `UnsupportedOverride` if the family has no such parameter.
    pub fn with_named(&self, name: &str, value: f64) -> SimResult<Self> {
        let mut out = *self;
        let known = match (&mut out, name) {
            (Self::Triangular { low, .. }, "low") => {
                *low = value;
                true
            }
            (Self::Triangular { mode, .. }, "mode") => {
                *mode = value;
                true
            }
            (Self::Triangular { high, .. }, "high") => {
                *high = value;
                true
            }
            (Self::LogNormal { mean, .. }, "mean") => {
                *mean = value;
                true
            }
            (Self::LogNormal { cv, .. }, "cv") => {
                *cv = value;
                true
            }
            (Self::Gamma { shape, .. }, "shape") => {
                *shape = value;
                true
            }
            (Self::Gamma { scale, .. }, "scale") => {
                *scale = value;
                true
            }
            (Self::Bernoulli { p }, "p") => {
                *p = value;
                true
            }
            _ => false,
        };
        if known {
            Ok(out)
        } else {
            Err(SimError::UnsupportedOverride {
                op: "distribution_param",
                family: self.family_name(),
                message: format!("no parameter named '{name}'"),
            })
        }
    }
}

/// Inclusive sampling bounds.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Bounds {
    /// Lower bound (inclusive).
    pub min: f64,
    /// Upper bound (inclusive).
    pub max: f64,
}

/// Precomputed statrs form. Rebuilt from `Params` on deserialization.
#[derive(Debug, Clone)]
enum Form {
    Triangular(statrs::distribution::Triangular),
    LogNormal(statrs::distribution::LogNormal),
    Gamma(statrs::distribution::Gamma),
    Bernoulli(statrs::distribution::Bernoulli),
}

/// A validated, immutable probability distribution.
///
/// # Example
///
/// ```rust
/// use trialsim::distribution::Distribution;
///
/// let activation = Distribution::triangular(30.0, 45.0, 90.0).unwrap();
/// assert!((activation.mean() - 55.0).abs() < 1e-9);
/// assert!(activation.percentile(50.0).unwrap() < activation.percentile(90.0).unwrap());
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(try_from = "DistributionSpec", into = "DistributionSpec")]
pub struct Distribution {
    params: Params,
    bounds: Option<Bounds>,
    form: Form,
}

impl PartialEq for Distribution {
    fn eq(&self, other: &Self) -> bool {
        self.params == other.params && self.bounds == other.bounds
    }
}

impl Distribution {
    /// Triangular distribution; requires `low < mode < high`.
    ///
    /// # Errors
    ///
    /// Returns `InvalidParameter` on non-finite or misordered parameters.
    pub fn triangular(low: f64, mode: f64, high: f64) -> SimResult<Self> {
        Self::from_parts(Params::Triangular { low, mode, high }, None)
    }

    /// Log-normal distribution from arithmetic mean and coefficient of
    /// variation; both must be strictly positive.
    ///
    /// # Errors
    ///
    /// Returns `InvalidParameter` on non-finite or non-positive parameters.
    pub fn log_normal(mean: f64, cv: f64) -> SimResult<Self> {
        Self::from_parts(Params::LogNormal { mean, cv }, None)
    }

    /// Gamma distribution; shape and scale must be strictly positive.
    ///
    /// # Errors
    ///
    /// Returns `InvalidParameter` on non-finite or non-positive parameters.
    pub fn gamma(shape: f64, scale: f64) -> SimResult<Self> {
        Self::from_parts(Params::Gamma { shape, scale }, None)
    }

    /// Bernoulli distribution; `p` must lie in [0, 1].
    ///
    /// # Errors
    ///
    /// Returns `InvalidParameter` on non-finite `p` or `p` outside [0, 1].
    pub fn bernoulli(p: f64) -> SimResult<Self> {
        Self::from_parts(Params::Bernoulli { p }, None)
    }

    /// Attach sampling bounds, consuming `self`.
    ///
    /// # Errors
    ///
    /// Returns `InvalidBounds` if `min >= max`, the bounds are non-finite,
    /// the family is Bernoulli, or the interval lies entirely outside the
    /// family's support.
    pub fn with_bounds(self, min: f64, max: f64) -> SimResult<Self> {
        Self::from_parts(self.params, Some(Bounds { min, max }))
    }

    /// Build a distribution from raw parts, enforcing every invariant.
    ///
    /// This is the single construction path: public constructors, scenario
    /// rebuilds, and deserialization all funnel through it.
    ///
    /// # Errors
    ///
    /// Returns `InvalidParameter` or `InvalidBounds` per violated invariant.
    pub fn from_parts(params: Params, bounds: Option<Bounds>) -> SimResult<Self> {
        let family = params.family_name();
        for (name, value) in params.to_map() {
            if !value.is_finite() {
                return Err(SimError::invalid_parameter(
                    family,
                    format!("{name} must be finite, got {value}"),
                ));
            }
        }

        let form = match params {
            Params::Triangular { low, mode, high } => {
                if !(low < mode && mode < high) {
                    return Err(SimError::invalid_parameter(
                        family,
                        format!("requires low < mode < high, got ({low}, {mode}, {high})"),
                    ));
                }
                let inner = statrs::distribution::Triangular::new(low, high, mode)
                    .map_err(|e| SimError::invalid_parameter(family, e.to_string()))?;
                Form::Triangular(inner)
            }
            Params::LogNormal { mean, cv } => {
                if mean <= 0.0 {
                    return Err(SimError::invalid_parameter(
                        family,
                        format!("mean must be > 0, got {mean}"),
                    ));
                }
                if cv <= 0.0 {
                    return Err(SimError::invalid_parameter(
                        family,
                        format!("cv must be > 0, got {cv}"),
                    ));
                }
                // Underlying normal: sigma^2 = ln(1 + cv^2), mu chosen so the
                // arithmetic mean equals the given mean.
                let sigma2 = (1.0 + cv * cv).ln();
                let mu = mean.ln() - sigma2 / 2.0;
                let inner = statrs::distribution::LogNormal::new(mu, sigma2.sqrt())
                    .map_err(|e| SimError::invalid_parameter(family, e.to_string()))?;
                Form::LogNormal(inner)
            }
            Params::Gamma { shape, scale } => {
                if shape <= 0.0 {
                    return Err(SimError::invalid_parameter(
                        family,
                        format!("shape must be > 0, got {shape}"),
                    ));
                }
                if scale <= 0.0 {
                    return Err(SimError::invalid_parameter(
                        family,
                        format!("scale must be > 0, got {scale}"),
                    ));
                }
                let inner = statrs::distribution::Gamma::new(shape, 1.0 / scale)
                    .map_err(|e| SimError::invalid_parameter(family, e.to_string()))?;
                Form::Gamma(inner)
            }
            Params::Bernoulli { p } => {
                if !(0.0..=1.0).contains(&p) {
                    return Err(SimError::invalid_parameter(
                        family,
                        format!("p must be in [0, 1], got {p}"),
                    ));
                }
                let inner = statrs::distribution::Bernoulli::new(p)
                    .map_err(|e| SimError::invalid_parameter(family, e.to_string()))?;
                Form::Bernoulli(inner)
            }
        };

        if let Some(b) = bounds {
            if matches!(params, Params::Bernoulli { .. }) {
                return Err(SimError::invalid_bounds(
                    family,
                    "bernoulli codomain is already {0, 1}; bounds are not accepted",
                ));
            }
            if !b.min.is_finite() || !b.max.is_finite() {
                return Err(SimError::invalid_bounds(family, "bounds must be finite"));
            }
            if b.min >= b.max {
                return Err(SimError::invalid_bounds(
                    family,
                    format!("requires min < max, got ({}, {})", b.min, b.max),
                ));
            }
            // Obviously disjoint support is a construction defect; low-mass
            // intervals are still caught by the rejection cap at sample time.
            let disjoint = match params {
                Params::Triangular { low, high, .. } => b.max < low || b.min > high,
                Params::LogNormal { .. } | Params::Gamma { .. } => b.max <= 0.0,
                Params::Bernoulli { .. } => false,
            };
            if disjoint {
                return Err(SimError::invalid_bounds(
                    family,
                    format!("[{}, {}] lies outside the support", b.min, b.max),
                ));
            }
        }

        Ok(Self {
            params,
            bounds,
            form,
        })
    }

    /// Family parameters.
    #[must_use]
    pub const fn params(&self) -> Params {
        self.params
    }

    /// Declared sampling bounds, if any.
    #[must_use]
    pub const fn bounds(&self) -> Option<Bounds> {
        self.bounds
    }

    /// Family name ("triangular", "log_normal", "gamma", "bernoulli").
    #[must_use]
    pub const fn family_name(&self) -> &'static str {
        self.params.family_name()
    }

    /// Analytic mean, ignoring bounds.
    #[must_use]
    pub fn mean(&self) -> f64 {
        match self.params {
            Params::Triangular { low, mode, high } => (low + mode + high) / 3.0,
            Params::LogNormal { mean, .. } => mean,
            Params::Gamma { shape, scale } => shape * scale,
            Params::Bernoulli { p } => p,
        }
    }

    /// Percentile via the family's inverse CDF, clamped into bounds when
    /// bounds are declared.
    ///
    /// # Errors
    ///
    /// Returns `PercentileOutOfRange` unless `p` lies in [0, 100].
    pub fn percentile(&self, p: f64) -> SimResult<f64> {
        if !p.is_finite() || !(0.0..=100.0).contains(&p) {
            return Err(SimError::PercentileOutOfRange { p });
        }
        let q = p / 100.0;
        let raw = match &self.form {
            Form::Triangular(d) => d.inverse_cdf(q),
            Form::LogNormal(d) => d.inverse_cdf(q),
            Form::Gamma(d) => d.inverse_cdf(q),
            Form::Bernoulli(d) => {
                if q <= 1.0 - d.p() {
                    0.0
                } else {
                    1.0
                }
            }
        };
        Ok(match self.bounds {
            Some(b) => raw.clamp(b.min, b.max),
            None => raw,
        })
    }

    /// Draw one value with a fresh generator seeded from `seed`.
    ///
    /// Sampling is the engine's exclusive privilege; this is deliberately
    /// not visible outside the crate.
    ///
    /// # Errors
    ///
    /// Returns `BoundsInfeasible` if bounded rejection sampling exhausts
    /// its attempt cap.
    pub(crate) fn sample(&self, seed: u64) -> SimResult<f64> {
        let mut rng = Pcg64::seed_from_u64(seed);
        match self.bounds {
            None => Ok(self.draw_once(&mut rng)),
            Some(b) => {
                for _ in 0..MAX_REJECTION_ATTEMPTS {
                    let x = self.draw_once(&mut rng);
                    if x >= b.min && x <= b.max {
                        return Ok(x);
                    }
                }
                Err(SimError::BoundsInfeasible {
                    family: self.family_name(),
                    min: b.min,
                    max: b.max,
                    attempts: MAX_REJECTION_ATTEMPTS,
                })
            }
        }
    }

    fn draw_once(&self, rng: &mut Pcg64) -> f64 {
        match &self.form {
            Form::Triangular(d) => d.sample(rng),
            Form::LogNormal(d) => d.sample(rng),
            Form::Gamma(d) => d.sample(rng),
            Form::Bernoulli(d) => d.sample(rng),
        }
    }
}

/// Wire shape for serde: parameters plus optional bounds. Deserialization
/// re-validates through `from_parts`, so a hand-edited JSON file cannot
/// smuggle an invalid distribution into a trial.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct DistributionSpec {
    #[serde(flatten)]
    params: Params,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    bounds: Option<Bounds>,
}

impl TryFrom<DistributionSpec> for Distribution {
    type Error = SimError;

    fn try_from(spec: DistributionSpec) -> SimResult<Self> {
        Self::from_parts(spec.params, spec.bounds)
    }
}

impl From<Distribution> for DistributionSpec {
    fn from(d: Distribution) -> Self {
        Self {
            params: d.params,
            bounds: d.bounds,
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_sample_deterministic() {
        let d = Distribution::triangular(30.0, 45.0, 90.0).unwrap();
        let a = d.sample(1234).unwrap();
        let b = d.sample(1234).unwrap();
        assert_eq!(a.to_bits(), b.to_bits(), "same seed must be bit-identical");
    }

    #[test]
    fn test_sample_seed_independence() {
        let d = Distribution::log_normal(10.0, 0.4).unwrap();
        let a = d.sample(1).unwrap();
        let b = d.sample(2).unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn test_sample_order_does_not_matter() {
        let d = Distribution::gamma(2.0, 3.0).unwrap();
        let forward: Vec<f64> = (0..10).map(|s| d.sample(s).unwrap()).collect();
        let backward: Vec<f64> = (0..10).rev().map(|s| d.sample(s).unwrap()).collect();
        let mut backward = backward;
        backward.reverse();
        assert_eq!(forward, backward);
    }

    #[test]
    fn test_triangular_validation() {
        assert!(Distribution::triangular(30.0, 30.0, 60.0).is_err());
        assert!(Distribution::triangular(30.0, 60.0, 60.0).is_err());
        assert!(Distribution::triangular(60.0, 45.0, 30.0).is_err());
        assert!(Distribution::triangular(f64::NAN, 45.0, 90.0).is_err());
        assert!(Distribution::triangular(30.0, 45.0, 90.0).is_ok());
    }

    #[test]
    fn test_log_normal_validation() {
        assert!(Distribution::log_normal(-1.0, 0.1).is_err());
        assert!(Distribution::log_normal(0.0, 0.1).is_err());
        assert!(Distribution::log_normal(10.0, 0.0).is_err());
        assert!(Distribution::log_normal(10.0, 0.1).is_ok());
    }

    #[test]
    fn test_gamma_validation() {
        assert!(Distribution::gamma(0.0, 1.0).is_err());
        assert!(Distribution::gamma(1.0, -2.0).is_err());
        assert!(Distribution::gamma(2.0, 0.5).is_ok());
    }

    #[test]
    fn test_bernoulli_validation() {
        assert!(Distribution::bernoulli(1.5).is_err());
        assert!(Distribution::bernoulli(-0.1).is_err());
        assert!(Distribution::bernoulli(0.0).is_ok());
        assert!(Distribution::bernoulli(1.0).is_ok());
    }

    #[test]
    fn test_bernoulli_rejects_bounds() {
        let err = Distribution::bernoulli(0.5)
            .unwrap()
            .with_bounds(0.0, 1.0)
            .unwrap_err();
        assert!(matches!(err, SimError::InvalidBounds { .. }));
    }

    #[test]
    fn test_bounds_validation() {
        let d = Distribution::triangular(30.0, 45.0, 90.0).unwrap();
        assert!(d.clone().with_bounds(50.0, 40.0).is_err());
        assert!(d.clone().with_bounds(100.0, 200.0).is_err());
        assert!(d.with_bounds(40.0, 80.0).is_ok());

        let g = Distribution::gamma(2.0, 1.0).unwrap();
        assert!(g.with_bounds(-5.0, -1.0).is_err());
    }

    #[test]
    fn test_bounded_samples_stay_in_bounds() {
        let d = Distribution::triangular(30.0, 45.0, 90.0)
            .unwrap()
            .with_bounds(40.0, 60.0)
            .unwrap();
        for seed in 0..10_000u64 {
            let x = d.sample(seed).unwrap();
            assert!((40.0..=60.0).contains(&x), "sample {x} escaped bounds");
        }
    }

    #[test]
    fn test_infeasible_bounds_fail_at_sample() {
        // Support-overlapping but astronomically low-mass interval.
        let d = Distribution::log_normal(10.0, 0.2)
            .unwrap()
            .with_bounds(1.0e12, 1.0e12 + 1.0)
            .unwrap();
        let err = d.sample(7).unwrap_err();
        assert!(matches!(err, SimError::BoundsInfeasible { .. }));
    }

    #[test]
    fn test_means() {
        let t = Distribution::triangular(30.0, 45.0, 90.0).unwrap();
        assert!((t.mean() - 55.0).abs() < 1e-12);

        let l = Distribution::log_normal(12.0, 0.3).unwrap();
        assert!((l.mean() - 12.0).abs() < 1e-12);

        let g = Distribution::gamma(2.0, 3.0).unwrap();
        assert!((g.mean() - 6.0).abs() < 1e-12);

        let b = Distribution::bernoulli(0.25).unwrap();
        assert!((b.mean() - 0.25).abs() < 1e-12);
    }

    #[test]
    fn test_log_normal_sample_mean_matches_param() {
        // The (mean, cv) parameterization is of the arithmetic mean, not
        // the underlying normal's location.
        let d = Distribution::log_normal(20.0, 0.5).unwrap();
        let n = 20_000u64;
        let sum: f64 = (0..n).map(|s| d.sample(s).unwrap()).sum();
        let empirical = sum / n as f64;
        assert!(
            (empirical - 20.0).abs() < 0.5,
            "empirical mean {empirical} too far from 20"
        );
    }

    #[test]
    fn test_percentile_validation() {
        let d = Distribution::triangular(30.0, 45.0, 90.0).unwrap();
        assert!(d.percentile(-1.0).is_err());
        assert!(d.percentile(100.1).is_err());
        assert!(d.percentile(f64::NAN).is_err());
        assert!(d.percentile(0.0).is_ok());
        assert!(d.percentile(100.0).is_ok());
    }

    #[test]
    fn test_percentile_monotonic() {
        for d in [
            Distribution::triangular(30.0, 45.0, 90.0).unwrap(),
            Distribution::log_normal(10.0, 0.4).unwrap(),
            Distribution::gamma(2.0, 3.0).unwrap(),
        ] {
            let ps = [10.0, 25.0, 50.0, 75.0, 90.0, 95.0];
            let values: Vec<f64> = ps.iter().map(|&p| d.percentile(p).unwrap()).collect();
            for w in values.windows(2) {
                assert!(w[0] <= w[1], "{:?} not monotonic: {values:?}", d.family_name());
            }
        }
    }

    #[test]
    fn test_bernoulli_percentile_case_split() {
        let d = Distribution::bernoulli(0.3).unwrap();
        assert_eq!(d.percentile(50.0).unwrap(), 0.0);
        assert_eq!(d.percentile(80.0).unwrap(), 1.0);
    }

    #[test]
    fn test_bounded_percentile_clamped() {
        let d = Distribution::triangular(30.0, 45.0, 90.0)
            .unwrap()
            .with_bounds(40.0, 60.0)
            .unwrap();
        assert_eq!(d.percentile(0.0).unwrap(), 40.0);
        assert_eq!(d.percentile(100.0).unwrap(), 60.0);
    }

    #[test]
    fn test_serde_round_trip_preserves_sampling() {
        let originals = [
            Distribution::triangular(30.0, 45.0, 90.0).unwrap(),
            Distribution::log_normal(10.0, 0.4).unwrap(),
            Distribution::gamma(2.0, 3.0).unwrap(),
            Distribution::bernoulli(0.7).unwrap(),
            Distribution::triangular(1.0, 2.0, 4.0)
                .unwrap()
                .with_bounds(1.5, 3.5)
                .unwrap(),
        ];
        for d in originals {
            let json = serde_json::to_string(&d).unwrap();
            let back: Distribution = serde_json::from_str(&json).unwrap();
            assert_eq!(d, back);
            for seed in [0u64, 42, 99_999] {
                let a = d.sample(seed).unwrap();
                let b = back.sample(seed).unwrap();
                assert_eq!(a.to_bits(), b.to_bits(), "{json}");
            }
        }
    }

    #[test]
    fn test_serde_rejects_invalid() {
        let json = r#"{"family":"triangular","low":30.0,"mode":30.0,"high":60.0}"#;
        assert!(serde_json::from_str::<Distribution>(json).is_err());

        let json = r#"{"family":"bernoulli","p":0.5,"bounds":{"min":0.0,"max":1.0}}"#;
        assert!(serde_json::from_str::<Distribution>(json).is_err());
    }

    #[test]
    fn test_with_named_param() {
        let p = Params::Gamma {
            shape: 2.0,
            scale: 3.0,
        };
        let q = p.with_named("scale", 5.0).unwrap();
        assert_eq!(
            q,
            Params::Gamma {
                shape: 2.0,
                scale: 5.0
            }
        );
        assert!(p.with_named("mode", 1.0).is_err());
    }
}

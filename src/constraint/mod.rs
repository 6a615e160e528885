//! Composable constraint evaluation.
//!
//! A constraint is a pure evaluator of (state, event) into a structured
//! effect. Two philosophies share one result shape:
//!
//! - **Validity** (hard gate): "can this occur at all at time T?" Failure
//!   reports `is_valid = false` and the absolute time the gate opens.
//! - **Feasibility** (soft modifier): "how efficiently can it occur?"
//!   Stays valid but adds a relative delay and/or parameter overrides.
//!
//! Composition across constraints is an explicit, tested algebra: validity
//! is AND with MAX over gate times, delays take the MAX (the single most
//! binding constraint dominates; delays never sum), override maps merge
//! last-writer-wins, and explanations concatenate for audit.

pub mod builtin;
pub mod curves;

use std::collections::BTreeMap;

use crate::engine::state::{SimEvent, SimulationState};
use crate::engine::SimTime;

pub use builtin::{BudgetConstraint, DependencyConstraint, ResourceCapacityConstraint};
pub use curves::{LinearResponseCurve, ResponseCurve};

/// Structured effect of evaluating one constraint against one event.
#[derive(Debug, Clone, PartialEq)]
pub struct ConstraintResult {
    /// Whether the event may occur at all at its proposed time.
    pub is_valid: bool,
    /// Absolute time the gate opens, when `is_valid` is false (or when a
    /// feasibility constraint knows an exact admission time).
    pub earliest_valid_time: Option<SimTime>,
    /// Relative delay in days imposed on the event.
    pub delay: f64,
    /// Parameter overrides to apply before execution.
    pub parameter_overrides: BTreeMap<String, f64>,
    /// Human-readable reason, concatenated across constraints for audit.
    pub explanation: Option<String>,
}

impl ConstraintResult {
    /// The composition identity: valid, no gate, zero delay, no overrides.
    #[must_use]
    pub fn identity() -> Self {
        Self {
            is_valid: true,
            earliest_valid_time: None,
            delay: 0.0,
            parameter_overrides: BTreeMap::new(),
            explanation: None,
        }
    }

    /// A validity failure with the absolute time the gate opens.
    #[must_use]
    pub fn invalid_until(time: SimTime, explanation: impl Into<String>) -> Self {
        Self {
            is_valid: false,
            earliest_valid_time: Some(time),
            delay: 0.0,
            parameter_overrides: BTreeMap::new(),
            explanation: Some(explanation.into()),
        }
    }

    /// A feasibility delay in days.
    #[must_use]
    pub fn delayed(days: f64, explanation: impl Into<String>) -> Self {
        Self {
            is_valid: true,
            earliest_valid_time: None,
            delay: days,
            parameter_overrides: BTreeMap::new(),
            explanation: Some(explanation.into()),
        }
    }

    /// A feasibility parameter override.
    #[must_use]
    pub fn with_override(
        key: impl Into<String>,
        value: f64,
        explanation: impl Into<String>,
    ) -> Self {
        let mut overrides = BTreeMap::new();
        overrides.insert(key.into(), value);
        Self {
            is_valid: true,
            earliest_valid_time: None,
            delay: 0.0,
            parameter_overrides: overrides,
            explanation: Some(explanation.into()),
        }
    }

    /// Compose with another result.
    ///
    /// MAX and AND are commutative; the override merge is not — `other`
    /// wins on key collision (last-writer-wins, by design), and a detected
    /// collision with a differing value emits a configuration warning.
    #[must_use]
    pub fn compose(mut self, other: Self) -> Self {
        self.is_valid = self.is_valid && other.is_valid;
        self.earliest_valid_time = match (self.earliest_valid_time, other.earliest_valid_time) {
            (Some(a), Some(b)) => Some(a.max(b)),
            (a, b) => a.or(b),
        };
        self.delay = self.delay.max(other.delay);
        for (key, value) in other.parameter_overrides {
            if let Some(&previous) = self.parameter_overrides.get(&key) {
                if (previous - value).abs() > f64::EPSILON {
                    tracing::warn!(
                        key = %key,
                        previous,
                        replacement = value,
                        "override collision between constraints; last writer wins"
                    );
                }
            }
            self.parameter_overrides.insert(key, value);
        }
        self.explanation = match (self.explanation.take(), other.explanation) {
            (Some(a), Some(b)) => Some(format!("{a}; {b}")),
            (a, b) => a.or(b),
        };
        self
    }
}

impl Default for ConstraintResult {
    fn default() -> Self {
        Self::identity()
    }
}

/// Compose any number of results, folding from the identity.
#[must_use]
pub fn compose_all(results: impl IntoIterator<Item = ConstraintResult>) -> ConstraintResult {
    results
        .into_iter()
        .fold(ConstraintResult::identity(), ConstraintResult::compose)
}

/// A pure evaluator of (state, event) into a `ConstraintResult`.
///
/// Implementations read engine state and trial entities; they never mutate
/// anything and never sample a distribution.
pub trait Constraint: Send + Sync + std::fmt::Debug {
    /// Short type name, recorded in output provenance.
    fn name(&self) -> &str;

    /// Evaluate the constraint against a proposed event.
    fn evaluate(&self, state: &SimulationState<'_>, event: &SimEvent) -> ConstraintResult;
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_identity_is_neutral() {
        let r = ConstraintResult::delayed(5.0, "throttle");
        let composed = ConstraintResult::identity().compose(r.clone());
        assert_eq!(composed, r);
        let composed = r.clone().compose(ConstraintResult::identity());
        assert_eq!(composed.delay, 5.0);
        assert!(composed.is_valid);
    }

    #[test]
    fn test_delays_take_max_never_sum() {
        let composed = compose_all([
            ConstraintResult::delayed(5.0, "a"),
            ConstraintResult::delayed(10.0, "b"),
        ]);
        assert!((composed.delay - 10.0).abs() < 1e-12);
        assert_eq!(composed.explanation.as_deref(), Some("a; b"));
    }

    #[test]
    fn test_validity_is_and_with_max_gate() {
        let composed = compose_all([
            ConstraintResult::invalid_until(SimTime::from_days(50.0), "gate"),
            ConstraintResult::identity(),
        ]);
        assert!(!composed.is_valid);
        assert_eq!(composed.earliest_valid_time, Some(SimTime::from_days(50.0)));

        let composed = compose_all([
            ConstraintResult::invalid_until(SimTime::from_days(50.0), "early"),
            ConstraintResult::invalid_until(SimTime::from_days(80.0), "late"),
        ]);
        assert_eq!(composed.earliest_valid_time, Some(SimTime::from_days(80.0)));
    }

    #[test]
    fn test_override_merge_last_writer_wins() {
        let composed = ConstraintResult::with_override("duration_multiplier", 1.5, "first")
            .compose(ConstraintResult::with_override(
                "duration_multiplier",
                2.0,
                "second",
            ));
        assert!(
            (composed.parameter_overrides["duration_multiplier"] - 2.0).abs() < 1e-12,
            "last writer must win"
        );

        // Reversed composition order flips the winner: the merge is
        // deliberately not commutative.
        let composed = ConstraintResult::with_override("duration_multiplier", 2.0, "second")
            .compose(ConstraintResult::with_override(
                "duration_multiplier",
                1.5,
                "first",
            ));
        assert!((composed.parameter_overrides["duration_multiplier"] - 1.5).abs() < 1e-12);
    }

    #[test]
    fn test_disjoint_overrides_merge() {
        let composed = ConstraintResult::with_override("a", 1.0, "x")
            .compose(ConstraintResult::with_override("b", 2.0, "y"));
        assert_eq!(composed.parameter_overrides.len(), 2);
    }

    #[test]
    fn test_compose_all_empty_is_identity() {
        let composed = compose_all([]);
        assert_eq!(composed, ConstraintResult::identity());
    }
}

//! Error types for trialsim.
//!
//! Construction-time validation is the only expected failure surface for
//! specification objects: every violated invariant maps to a named variant,
//! and nothing is ever silently coerced or defaulted. Inside the simulation
//! loop a constraint violation is data (a counter, a reschedule, a timeline
//! entry), never an error; the loop's single fatal condition is the safety
//! time ceiling.

use thiserror::Error;

/// Result type alias for trialsim operations.
pub type SimResult<T> = Result<T, SimError>;

/// Unified error type for all trialsim operations.
#[derive(Debug, Error)]
pub enum SimError {
    // ===== Distribution construction =====
    /// A distribution parameter violates its family's invariant.
    #[error("invalid {family} parameter: {message}")]
    InvalidParameter {
        /// Distribution family name.
        family: &'static str,
        /// Description of the violated invariant.
        message: String,
    },

    /// Declared bounds are malformed or unsupported by the family.
    #[error("invalid bounds on {family}: {message}")]
    InvalidBounds {
        /// Distribution family name.
        family: &'static str,
        /// Description of the violated invariant.
        message: String,
    },

    /// Rejection sampling exhausted its attempt budget without landing
    /// inside the declared bounds. Signals a configuration defect.
    #[error(
        "bounds [{min}, {max}] infeasible for {family}: no sample after {attempts} attempts"
    )]
    BoundsInfeasible {
        /// Distribution family name.
        family: &'static str,
        /// Lower bound.
        min: f64,
        /// Upper bound.
        max: f64,
        /// Attempts made before giving up.
        attempts: u32,
    },

    /// Percentile argument outside [0, 100].
    #[error("percentile {p} outside [0, 100]")]
    PercentileOutOfRange {
        /// Offending percentile.
        p: f64,
    },

    // ===== Entity construction =====
    /// An entity id is empty.
    #[error("{kind} id must be non-empty")]
    EmptyId {
        /// Entity kind ("site", "activity", ...).
        kind: &'static str,
    },

    /// Two entities of the same kind share an id within one trial.
    #[error("duplicate {kind} id '{id}'")]
    DuplicateId {
        /// Entity kind.
        kind: &'static str,
        /// The repeated id.
        id: String,
    },

    /// A cross-reference does not resolve to an entity in the same trial.
    #[error("{referrer} references unknown {kind} '{id}'")]
    DanglingReference {
        /// Entity doing the referencing.
        referrer: String,
        /// Kind of the missing entity.
        kind: &'static str,
        /// The unresolved id.
        id: String,
    },

    /// Activity dependency graph contains a cycle.
    #[error("activity dependency cycle involving '{id}'")]
    DependencyCycle {
        /// An activity on the cycle.
        id: String,
    },

    /// Patient flow graph violates a structural invariant.
    #[error("invalid patient flow '{id}': {message}")]
    InvalidFlow {
        /// Flow id.
        id: String,
        /// Description of the violated invariant.
        message: String,
    },

    /// Trial-level invariant violation not tied to a single entity.
    #[error("invalid trial '{id}': {message}")]
    InvalidTrial {
        /// Trial id.
        id: String,
        /// Description of the violated invariant.
        message: String,
    },

    /// Field-shape validation failure on a deserialized specification.
    #[error("validation error: {0}")]
    Validation(#[from] validator::ValidationErrors),

    // ===== Scenario application =====
    /// Override kind not supported by the target distribution family.
    #[error("{op} override unsupported for {family}: {message}")]
    UnsupportedOverride {
        /// Override kind name.
        op: &'static str,
        /// Distribution family name.
        family: &'static str,
        /// Explanation.
        message: String,
    },

    /// Override addressed to an entity or field the trial does not have.
    #[error("override target not found: {target}")]
    UnknownOverrideTarget {
        /// Dotted path of the missing target.
        target: String,
    },

    /// Override payload has the wrong kind for the target field.
    #[error("invalid override for {target}: {message}")]
    InvalidOverride {
        /// Dotted path of the target field.
        target: String,
        /// Explanation.
        message: String,
    },

    // ===== Engine =====
    /// `run()` called with zero repetitions.
    #[error("num_runs must be at least 1")]
    NoRuns,

    /// An event landed beyond the safety time ceiling. The ceiling bounds
    /// reschedule storms from misconfigured constraints; reaching it is an
    /// explicit failure, never a silent truncation.
    #[error(
        "simulation exceeded safety time ceiling: event at day {event_day:.3} > ceiling day {ceiling_day:.3} (run {run_index})"
    )]
    TimeCeilingExceeded {
        /// Run that hit the ceiling.
        run_index: u64,
        /// Offending event time, in days.
        event_day: f64,
        /// Configured ceiling, in days.
        ceiling_day: f64,
    },

    // ===== I/O =====
    /// File I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl SimError {
    /// Create an invalid-parameter error.
    #[must_use]
    pub fn invalid_parameter(family: &'static str, message: impl Into<String>) -> Self {
        Self::InvalidParameter {
            family,
            message: message.into(),
        }
    }

    /// Create an invalid-bounds error.
    #[must_use]
    pub fn invalid_bounds(family: &'static str, message: impl Into<String>) -> Self {
        Self::InvalidBounds {
            family,
            message: message.into(),
        }
    }

    /// Create an invalid-flow error.
    #[must_use]
    pub fn invalid_flow(id: impl Into<String>, message: impl Into<String>) -> Self {
        Self::InvalidFlow {
            id: id.into(),
            message: message.into(),
        }
    }

    /// Create an invalid-override error.
    #[must_use]
    pub fn invalid_override(target: impl Into<String>, message: impl Into<String>) -> Self {
        Self::InvalidOverride {
            target: target.into(),
            message: message.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_bounds_infeasible() {
        let err = SimError::BoundsInfeasible {
            family: "triangular",
            min: 5.0,
            max: 6.0,
            attempts: 1000,
        };
        let msg = err.to_string();
        assert!(msg.contains("infeasible"));
        assert!(msg.contains("1000"));
    }

    #[test]
    fn test_display_dangling_reference() {
        let err = SimError::DanglingReference {
            referrer: "activity 'dosing'".to_string(),
            kind: "resource",
            id: "cro-team".to_string(),
        };
        let msg = err.to_string();
        assert!(msg.contains("dosing"));
        assert!(msg.contains("unknown resource"));
        assert!(msg.contains("cro-team"));
    }

    #[test]
    fn test_display_time_ceiling() {
        let err = SimError::TimeCeilingExceeded {
            run_index: 3,
            event_day: 10_001.5,
            ceiling_day: 10_000.0,
        };
        let msg = err.to_string();
        assert!(msg.contains("ceiling"));
        assert!(msg.contains("run 3"));
    }

    #[test]
    fn test_helper_constructors() {
        let err = SimError::invalid_parameter("gamma", "shape must be positive");
        assert!(err.to_string().contains("gamma"));

        let err = SimError::invalid_flow("flow-1", "no terminal state");
        assert!(err.to_string().contains("flow-1"));

        let err = SimError::invalid_override("site/s1/enrollment_rate", "wrong kind");
        assert!(err.to_string().contains("s1"));
    }
}

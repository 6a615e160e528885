//! # trialsim
//!
//! Deterministic Monte Carlo discrete-event simulation engine for planning
//! resource-constrained, multi-stage processes — here, clinical-trial
//! execution.
//!
//! The crate is layered leaves-first:
//! - [`distribution`]: stateless, per-call-seeded probability distributions
//! - [`entities`]: immutable trial specification objects
//! - [`constraint`]: pure (state, event) evaluators with a composition algebra
//! - [`scenario`]: pure override profiles producing new trials from a base
//! - [`engine`]: the N-run event loop; the only place sampling happens
//! - [`output`]: provenance-preserving persisted schema
//!
//! ## Example
//!
//! ```rust
//! use std::sync::Arc;
//! use trialsim::prelude::*;
//!
//! let flow = PatientFlow::new(
//!     "flow",
//!     ["screening".to_string(), "done".to_string()],
//!     "screening",
//!     ["done".to_string()],
//!     vec![FlowEdge::new(
//!         "screening",
//!         "done",
//!         Distribution::triangular(7.0, 14.0, 28.0).unwrap(),
//!         Distribution::bernoulli(1.0).unwrap(),
//!     )
//!     .unwrap()],
//! )
//! .unwrap();
//!
//! let site = Site::new(
//!     "site-1",
//!     Distribution::triangular(30.0, 45.0, 90.0).unwrap(),
//!     Distribution::gamma(4.0, 0.05).unwrap(),
//!     Distribution::bernoulli(0.02).unwrap(),
//!     None,
//! )
//! .unwrap();
//!
//! let trial = Trial::new(
//!     "demo",
//!     10,
//!     vec![Arc::new(site)],
//!     Arc::new(flow),
//!     vec![],
//!     vec![],
//! )
//! .unwrap();
//!
//! let results = SimulationEngine::new(42).run(&trial, 25, 0.0).unwrap();
//! assert!(results.completion_time.p10 <= results.completion_time.p90);
//! ```

#![forbid(unsafe_code)]
#![deny(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
#![warn(clippy::pedantic, clippy::nursery)]
#![allow(
    clippy::module_name_repetitions,
    clippy::similar_names,
    clippy::cast_precision_loss,
    clippy::cast_possible_truncation,
    clippy::cast_sign_loss,
    clippy::must_use_candidate,
    clippy::missing_const_for_fn,
    clippy::return_self_not_must_use,
    clippy::too_many_lines
)]

pub mod constraint;
pub mod distribution;
pub mod engine;
pub mod entities;
pub mod error;
pub mod output;
pub mod scenario;
pub mod stats;

/// Prelude for convenient imports.
pub mod prelude {
    pub use crate::constraint::{
        compose_all, BudgetConstraint, Constraint, ConstraintResult, DependencyConstraint,
        LinearResponseCurve, ResourceCapacityConstraint, ResponseCurve,
    };
    pub use crate::distribution::Distribution;
    pub use crate::engine::state::{EventType, MetricCounters, TimelineKind};
    pub use crate::engine::{
        CostModel, RunResult, SimTime, SimulationEngine, SimulationResults,
    };
    pub use crate::entities::{Activity, FlowEdge, PatientFlow, Resource, Site, Trial};
    pub use crate::error::{SimError, SimResult};
    pub use crate::output::{
        EnhancedSimulationOutput, InputSpecification, PercentileSummary, ProvenanceRecord,
    };
    pub use crate::scenario::{
        apply_scenario, compose_scenarios, diff_scenarios, OverrideOp, ScenarioProfile,
    };
}

pub use error::{SimError, SimResult};

//! Built-in constraints.
//!
//! One validity constraint (event ordering against the completion table)
//! and two feasibility constraints (resource capacity, budget throttling).
//! Numeric response behavior is always an injected `ResponseCurve` or
//! construction parameter, never a literal in constraint code.

use crate::constraint::curves::ResponseCurve;
use crate::constraint::{Constraint, ConstraintResult};
use crate::engine::state::{EventType, SimEvent, SimulationState};
use crate::error::{SimError, SimResult};

/// Validity gate: a dependent event type may not occur before a named
/// predecessor event type has completed.
///
/// The predecessor is looked up in the engine's completion-time table,
/// either for the same entity as the evaluated event or for an explicitly
/// named one. While the gate is closed the constraint reports an absolute
/// reopen time of `event.time + recheck_interval`; the interval is a
/// construction parameter because any polling cadence is a calibration
/// choice, not an engine fact.
#[derive(Debug)]
pub struct DependencyConstraint {
    name: String,
    dependent_event: EventType,
    predecessor_event: EventType,
    predecessor_entity: Option<String>,
    recheck_interval: f64,
}

impl DependencyConstraint {
    /// Build a dependency gate.
    ///
    /// `predecessor_entity = None` gates on the same entity as the
    /// evaluated event.
    ///
    /// # Errors
    ///
    /// Returns `InvalidParameter` for a non-positive recheck interval.
    pub fn new(
        dependent_event: EventType,
        predecessor_event: EventType,
        predecessor_entity: Option<String>,
        recheck_interval: f64,
    ) -> SimResult<Self> {
        if !recheck_interval.is_finite() || recheck_interval <= 0.0 {
            return Err(SimError::invalid_parameter(
                "dependency_constraint",
                format!("recheck_interval must be > 0 days, got {recheck_interval}"),
            ));
        }
        let target = predecessor_entity
            .as_deref()
            .unwrap_or("same-entity")
            .to_string();
        Ok(Self {
            name: format!(
                "dependency({} after {}:{target})",
                dependent_event.key(),
                predecessor_event.key()
            ),
            dependent_event,
            predecessor_event,
            predecessor_entity,
            recheck_interval,
        })
    }
}

impl Constraint for DependencyConstraint {
    fn name(&self) -> &str {
        &self.name
    }

    fn evaluate(&self, state: &SimulationState<'_>, event: &SimEvent) -> ConstraintResult {
        if event.event_type != self.dependent_event {
            return ConstraintResult::identity();
        }
        let entity = self
            .predecessor_entity
            .as_deref()
            .unwrap_or(&event.entity_id);
        match state.completion(self.predecessor_event, entity) {
            Some(done) if done <= event.time => ConstraintResult::identity(),
            Some(done) => ConstraintResult::invalid_until(
                done,
                format!(
                    "{} for '{entity}' completes at day {:.3}",
                    self.predecessor_event.key(),
                    done.as_days()
                ),
            ),
            None => ConstraintResult::invalid_until(
                event.time.add_days(self.recheck_interval),
                format!(
                    "{} for '{entity}' has not completed",
                    self.predecessor_event.key()
                ),
            ),
        }
    }
}

/// Feasibility: throttle or delay activity starts against resource
/// capacity.
///
/// A saturated resource delays the start until its earliest release; a
/// partially free one stretches the duration through the injected curve.
/// Across several required resources the most binding one dominates via
/// the usual MAX composition.
#[derive(Debug)]
pub struct ResourceCapacityConstraint {
    name: String,
    curve: Box<dyn ResponseCurve>,
}

impl ResourceCapacityConstraint {
    /// Build with an injected response curve.
    #[must_use]
    pub fn new(curve: Box<dyn ResponseCurve>) -> Self {
        Self {
            name: "resource_capacity".to_string(),
            curve,
        }
    }
}

impl Constraint for ResourceCapacityConstraint {
    fn name(&self) -> &str {
        &self.name
    }

    fn evaluate(&self, state: &SimulationState<'_>, event: &SimEvent) -> ConstraintResult {
        if event.event_type != EventType::ActivityStart {
            return ConstraintResult::identity();
        }
        let Some(activity) = state.trial().activity(&event.entity_id) else {
            return ConstraintResult::identity();
        };

        let mut result = ConstraintResult::identity();
        for resource_id in activity.required_resources() {
            let Some(resource) = state.trial().resource(resource_id) else {
                continue;
            };
            let Some(capacity) = resource.capacity() else {
                continue;
            };
            let active = state.active_allocations(resource_id, event.time);
            let free = capacity.saturating_sub(active);

            if free == 0 {
                if let Some(release) = state.earliest_release(resource_id, event.time) {
                    let wait = (release - event.time).as_days();
                    result = result.compose(ConstraintResult::delayed(
                        wait,
                        format!("resource '{resource_id}' saturated until day {:.3}", release.as_days()),
                    ));
                } else {
                    // Zero-capacity resource: nothing will ever release, so
                    // throttle at the curve's maximum instead of blocking.
                    result = result.compose(ConstraintResult::with_override(
                        "duration_multiplier",
                        self.curve.multiplier(0.0),
                        format!("resource '{resource_id}' has no usable capacity"),
                    ));
                }
            } else if free < capacity {
                let ratio = f64::from(free) / f64::from(capacity);
                let multiplier = self.curve.multiplier(ratio);
                if multiplier > 1.0 {
                    result = result.compose(ConstraintResult::with_override(
                        "duration_multiplier",
                        multiplier,
                        format!(
                            "resource '{resource_id}' at {free}/{capacity} free, multiplier {multiplier:.3}"
                        ),
                    ));
                }
            }
        }
        result
    }
}

/// Feasibility: stretch activity durations as the budget runs down.
#[derive(Debug)]
pub struct BudgetConstraint {
    name: String,
    curve: Box<dyn ResponseCurve>,
}

impl BudgetConstraint {
    /// Build with an injected response curve.
    #[must_use]
    pub fn new(curve: Box<dyn ResponseCurve>) -> Self {
        Self {
            name: "budget_throttle".to_string(),
            curve,
        }
    }
}

impl Constraint for BudgetConstraint {
    fn name(&self) -> &str {
        &self.name
    }

    fn evaluate(&self, state: &SimulationState<'_>, event: &SimEvent) -> ConstraintResult {
        if event.event_type != EventType::ActivityStart {
            return ConstraintResult::identity();
        }
        let ratio = state.budget_ratio();
        let multiplier = self.curve.multiplier(ratio);
        if multiplier > 1.0 {
            ConstraintResult::with_override(
                "duration_multiplier",
                multiplier,
                format!("budget ratio {ratio:.3}, multiplier {multiplier:.3}"),
            )
        } else {
            ConstraintResult::identity()
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::constraint::curves::LinearResponseCurve;
    use crate::engine::SimTime;
    use crate::entities::tests::simple_trial;

    fn start_event(activity: &str, day: f64) -> SimEvent {
        SimEvent::new(EventType::ActivityStart, activity, SimTime::from_days(day))
    }

    #[test]
    fn test_dependency_gate_closed_then_open() {
        let trial = simple_trial();
        let mut state = SimulationState::new(&trial, 42, 0.0);
        let gate = DependencyConstraint::new(
            EventType::ActivityStart,
            EventType::ActivityCompletion,
            Some("irb-approval".to_string()),
            7.0,
        )
        .unwrap();

        let event = start_event("site-initiation", 10.0);
        let result = gate.evaluate(&state, &event);
        assert!(!result.is_valid);
        assert_eq!(
            result.earliest_valid_time,
            Some(SimTime::from_days(17.0)),
            "closed gate reopens one recheck interval later"
        );

        // Predecessor completes in the future relative to the event.
        let done = SimEvent::new(
            EventType::ActivityCompletion,
            "irb-approval",
            SimTime::from_days(30.0),
        );
        state.record_completion(&done, "done");
        let result = gate.evaluate(&state, &event);
        assert!(!result.is_valid);
        assert_eq!(result.earliest_valid_time, Some(SimTime::from_days(30.0)));

        // At or after the completion the gate is open.
        let event = start_event("site-initiation", 30.0);
        assert!(gate.evaluate(&state, &event).is_valid);
    }

    #[test]
    fn test_dependency_ignores_other_event_types() {
        let trial = simple_trial();
        let state = SimulationState::new(&trial, 42, 0.0);
        let gate = DependencyConstraint::new(
            EventType::ActivityStart,
            EventType::ActivityCompletion,
            None,
            7.0,
        )
        .unwrap();
        let event = SimEvent::new(
            EventType::EnrollmentArrival,
            "site-a",
            SimTime::from_days(1.0),
        );
        assert_eq!(gate.evaluate(&state, &event), ConstraintResult::identity());
    }

    #[test]
    fn test_dependency_recheck_validation() {
        assert!(DependencyConstraint::new(
            EventType::ActivityStart,
            EventType::ActivityCompletion,
            None,
            0.0,
        )
        .is_err());
    }

    #[test]
    fn test_resource_capacity_free() {
        let trial = simple_trial();
        let state = SimulationState::new(&trial, 42, 0.0);
        let constraint = ResourceCapacityConstraint::new(Box::new(
            LinearResponseCurve::new(0.5).unwrap(),
        ));
        let result = constraint.evaluate(&state, &start_event("site-initiation", 5.0));
        assert_eq!(result, ConstraintResult::identity());
    }

    #[test]
    fn test_resource_capacity_partial_throttle() {
        let trial = simple_trial();
        let mut state = SimulationState::new(&trial, 42, 0.0);
        // cra-team capacity 2; one slot taken.
        state.allocate("cra-team", SimTime::ZERO, SimTime::from_days(20.0));

        let constraint = ResourceCapacityConstraint::new(Box::new(
            LinearResponseCurve::new(0.25).unwrap(),
        ));
        let result = constraint.evaluate(&state, &start_event("site-initiation", 5.0));
        assert!(result.is_valid);
        assert!((result.delay - 0.0).abs() < 1e-12);
        assert!(
            (result.parameter_overrides["duration_multiplier"] - 2.0).abs() < 1e-12,
            "1/0.5 free ratio"
        );
    }

    #[test]
    fn test_resource_capacity_saturated_delays() {
        let trial = simple_trial();
        let mut state = SimulationState::new(&trial, 42, 0.0);
        state.allocate("cra-team", SimTime::ZERO, SimTime::from_days(12.0));
        state.allocate("cra-team", SimTime::ZERO, SimTime::from_days(20.0));

        let constraint = ResourceCapacityConstraint::new(Box::new(
            LinearResponseCurve::new(0.5).unwrap(),
        ));
        let result = constraint.evaluate(&state, &start_event("site-initiation", 5.0));
        assert!(result.is_valid, "feasibility never invalidates");
        assert!(
            (result.delay - 7.0).abs() < 1e-6,
            "delay until earliest release at day 12"
        );
    }

    #[test]
    fn test_budget_throttle_values() {
        let trial = simple_trial();
        let mut state = SimulationState::new(&trial, 42, 100.0);
        let constraint =
            BudgetConstraint::new(Box::new(LinearResponseCurve::new(0.5).unwrap()));

        // Full budget: no override.
        let result = constraint.evaluate(&state, &start_event("irb-approval", 1.0));
        assert!(result.parameter_overrides.is_empty());

        // Half budget: multiplier exactly 2.0.
        state.spend(50.0);
        let result = constraint.evaluate(&state, &start_event("irb-approval", 1.0));
        assert!((result.parameter_overrides["duration_multiplier"] - 2.0).abs() < 1e-12);

        // 30% budget: clamps to 2.0, not 3.33.
        state.spend(20.0);
        let result = constraint.evaluate(&state, &start_event("irb-approval", 1.0));
        assert!((result.parameter_overrides["duration_multiplier"] - 2.0).abs() < 1e-12);
    }

    #[test]
    fn test_budget_ignores_non_start_events() {
        let trial = simple_trial();
        let state = SimulationState::new(&trial, 42, 100.0);
        let constraint =
            BudgetConstraint::new(Box::new(LinearResponseCurve::new(0.5).unwrap()));
        let event = SimEvent::new(
            EventType::PatientTransition,
            "patient-0",
            SimTime::from_days(1.0),
        );
        assert_eq!(
            constraint.evaluate(&state, &event),
            ConstraintResult::identity()
        );
    }
}

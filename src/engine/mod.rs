//! Deterministic Monte Carlo simulation engine.
//!
//! `run()` executes N independent repetitions of one trial; run *i* uses
//! `master_seed + i`. Within a run, a time-ordered queue drives a strictly
//! sequential loop: pop the earliest event, compose the configured
//! constraints, then either reschedule the event unexecuted or apply its
//! overrides and execute it. Every sample is drawn with a seed derived
//! from `(run_seed, stable_event_key)`, so results are bit-reproducible
//! regardless of execution order or thread count.

pub mod queue;
pub mod seed;
pub mod state;

use std::sync::Arc;

use rand::{Rng, SeedableRng};
use rand_pcg::Pcg64;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use crate::constraint::{compose_all, Constraint};
use crate::entities::Trial;
use crate::error::{SimError, SimResult};
use crate::stats::PercentileSummary;

use queue::EventQueue;
use seed::event_seed;
use state::{EventType, MetricCounters, SimEvent, SimulationState, TimelineEntry};

/// Default safety ceiling, in days. Bounds reschedule storms from
/// misconfigured constraints; hitting it is always an explicit error.
pub const DEFAULT_TIME_CEILING_DAYS: f64 = 36_500.0;

const MICROS_PER_DAY: f64 = 86_400_000_000.0;

/// Simulation time in days, held as fixed-point integer microseconds so
/// queue ordering is exact and identical across platforms.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
pub struct SimTime {
    micros: u64,
}

impl SimTime {
    /// Day zero.
    pub const ZERO: Self = Self { micros: 0 };

    /// Latest representable time.
    pub const MAX: Self = Self { micros: u64::MAX };

    /// Create a time from days. Negative and NaN inputs saturate to zero;
    /// positive infinity saturates to `MAX` so a runaway sample surfaces
    /// through the safety ceiling instead of wrapping.
    #[must_use]
    pub fn from_days(days: f64) -> Self {
        if days.is_nan() || days <= 0.0 {
            return Self::ZERO;
        }
        let micros = days * MICROS_PER_DAY;
        if micros >= u64::MAX as f64 {
            Self::MAX
        } else {
            Self {
                micros: micros as u64,
            }
        }
    }

    /// Time as fractional days.
    #[must_use]
    pub fn as_days(&self) -> f64 {
        self.micros as f64 / MICROS_PER_DAY
    }

    /// Add a day offset, saturating like `from_days`.
    #[must_use]
    pub fn add_days(self, days: f64) -> Self {
        let offset = Self::from_days(days);
        Self {
            micros: self.micros.saturating_add(offset.micros),
        }
    }
}

impl std::ops::Sub for SimTime {
    type Output = Self;

    fn sub(self, rhs: Self) -> Self::Output {
        Self {
            micros: self.micros.saturating_sub(rhs.micros),
        }
    }
}

impl std::fmt::Display for SimTime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "day {:.3}", self.as_days())
    }
}

/// Caller-supplied cost rates.
///
/// Every rate is a calibration input; `zero()` is the explicit neutral
/// when cost is not being modeled.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CostModel {
    /// Cost of enrolling one patient.
    pub enrollment_cost: f64,
    /// Cost per day of activity work.
    pub activity_cost_per_day: f64,
    /// Cost of one patient transition.
    pub transition_cost: f64,
}

impl CostModel {
    /// A cost model that accrues nothing.
    #[must_use]
    pub const fn zero() -> Self {
        Self {
            enrollment_cost: 0.0,
            activity_cost_per_day: 0.0,
            transition_cost: 0.0,
        }
    }

    /// Build from explicit rates.
    #[must_use]
    pub const fn new(
        enrollment_cost: f64,
        activity_cost_per_day: f64,
        transition_cost: f64,
    ) -> Self {
        Self {
            enrollment_cost,
            activity_cost_per_day,
            transition_cost,
        }
    }
}

impl Default for CostModel {
    fn default() -> Self {
        Self::zero()
    }
}

/// Full detail of a single run: the "microscope" view.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunResult {
    /// Index of this run within the batch.
    pub run_index: u64,
    /// Seed the run used (`master_seed + run_index`).
    pub seed: u64,
    /// Day the last event executed.
    pub completion_day: f64,
    /// Budget spent over the run.
    pub total_cost: f64,
    /// Budget left (may be negative if the run overspent).
    pub budget_remaining: f64,
    /// Patients enrolled.
    pub patients_enrolled: u32,
    /// Patients that reached a terminal flow state.
    pub patients_completed: u32,
    /// Patients that dropped out.
    pub patients_dropped: u32,
    /// Activities that completed successfully.
    pub activities_completed: u32,
    /// Ordered causal timeline.
    pub timeline: Vec<TimelineEntry>,
    /// Loop counters.
    pub metrics: MetricCounters,
}

/// Counter means across all runs.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MeanMetrics {
    /// Mean events executed per run.
    pub events_processed: f64,
    /// Mean reschedules per run.
    pub events_rescheduled: f64,
    /// Mean validity violations per run.
    pub constraint_violations: f64,
    /// Mean patients enrolled per run.
    pub patients_enrolled: f64,
    /// Mean patients completing the flow per run.
    pub patients_completed: f64,
    /// Mean dropouts per run.
    pub patients_dropped: f64,
}

/// Aggregated batch output: the "telescope" view plus full per-run detail.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SimulationResults {
    /// Master seed the batch derived its run seeds from.
    pub master_seed: u64,
    /// Number of runs executed.
    pub num_runs: u32,
    /// Budget each run started with.
    pub initial_budget: f64,
    /// Wall-clock duration of the batch, in seconds.
    pub elapsed_seconds: f64,
    /// Completion-time distribution across runs, in days.
    pub completion_time: PercentileSummary,
    /// Cost distribution across runs.
    pub total_cost: PercentileSummary,
    /// Counter means across runs.
    pub mean_metrics: MeanMetrics,
    /// Per-run detail, in run order.
    pub runs: Vec<RunResult>,
}

/// The simulation engine: master seed, constraints, and execution policy.
pub struct SimulationEngine {
    master_seed: u64,
    constraints: Vec<Arc<dyn Constraint>>,
    cost_model: CostModel,
    time_ceiling: SimTime,
    parallel: bool,
}

impl SimulationEngine {
    /// Create an engine with no constraints, zero cost rates, the default
    /// safety ceiling, and parallel execution.
    #[must_use]
    pub fn new(master_seed: u64) -> Self {
        Self {
            master_seed,
            constraints: Vec::new(),
            cost_model: CostModel::zero(),
            time_ceiling: SimTime::from_days(DEFAULT_TIME_CEILING_DAYS),
            parallel: true,
        }
    }

    /// Attach constraints, consuming `self`.
    #[must_use]
    pub fn with_constraints(mut self, constraints: Vec<Arc<dyn Constraint>>) -> Self {
        self.constraints = constraints;
        self
    }

    /// Set cost rates, consuming `self`.
    #[must_use]
    pub fn with_cost_model(mut self, cost_model: CostModel) -> Self {
        self.cost_model = cost_model;
        self
    }

    /// Override the safety ceiling, consuming `self`.
    #[must_use]
    pub fn with_time_ceiling_days(mut self, days: f64) -> Self {
        self.time_ceiling = SimTime::from_days(days);
        self
    }

    /// Toggle parallel run execution, consuming `self`. Results are
    /// identical either way.
    #[must_use]
    pub fn with_parallel(mut self, parallel: bool) -> Self {
        self.parallel = parallel;
        self
    }

    /// Master seed.
    #[must_use]
    pub const fn master_seed(&self) -> u64 {
        self.master_seed
    }

    /// Names of the configured constraints, for output provenance.
    #[must_use]
    pub fn constraint_names(&self) -> Vec<String> {
        self.constraints
            .iter()
            .map(|c| c.name().to_string())
            .collect()
    }

    /// Execute `num_runs` independent repetitions and aggregate.
    ///
    /// # Errors
    ///
    /// Returns `NoRuns` for zero runs, `TimeCeilingExceeded` if any run
    /// passes the safety ceiling, and sampling errors for infeasible
    /// bounds.
    pub fn run(
        &self,
        trial: &Trial,
        num_runs: u32,
        initial_budget: f64,
    ) -> SimResult<SimulationResults> {
        if num_runs == 0 {
            return Err(SimError::NoRuns);
        }
        let started = std::time::Instant::now();
        tracing::info!(
            master_seed = self.master_seed,
            num_runs,
            trial = trial.id(),
            "starting simulation batch"
        );

        let indices: Vec<u64> = (0..u64::from(num_runs)).collect();
        let collected: SimResult<Vec<RunResult>> = if self.parallel {
            indices
                .into_par_iter()
                .map(|i| self.run_single(trial, i, initial_budget))
                .collect()
        } else {
            indices
                .into_iter()
                .map(|i| self.run_single(trial, i, initial_budget))
                .collect()
        };
        let mut runs = collected?;
        // Seeds are index-derived, so ordering is cosmetic; sorting keeps
        // aggregation independent of execution order by construction.
        runs.sort_by_key(|r| r.run_index);

        let completion: Vec<f64> = runs.iter().map(|r| r.completion_day).collect();
        let cost: Vec<f64> = runs.iter().map(|r| r.total_cost).collect();
        let completion_time =
            PercentileSummary::from_values(&completion).ok_or(SimError::NoRuns)?;
        let total_cost = PercentileSummary::from_values(&cost).ok_or(SimError::NoRuns)?;

        let n = runs.len() as f64;
        let mean = |f: &dyn Fn(&RunResult) -> f64| runs.iter().map(|r| f(r)).sum::<f64>() / n;
        let mean_metrics = MeanMetrics {
            events_processed: mean(&|r| r.metrics.events_processed as f64),
            events_rescheduled: mean(&|r| r.metrics.events_rescheduled as f64),
            constraint_violations: mean(&|r| r.metrics.constraint_violations as f64),
            patients_enrolled: mean(&|r| f64::from(r.patients_enrolled)),
            patients_completed: mean(&|r| f64::from(r.patients_completed)),
            patients_dropped: mean(&|r| f64::from(r.patients_dropped)),
        };

        let elapsed_seconds = started.elapsed().as_secs_f64();
        tracing::info!(
            elapsed_seconds,
            p50_completion = completion_time.p50,
            "simulation batch finished"
        );

        Ok(SimulationResults {
            master_seed: self.master_seed,
            num_runs,
            initial_budget,
            elapsed_seconds,
            completion_time,
            total_cost,
            mean_metrics,
            runs,
        })
    }

    /// One independent repetition with a fresh, exclusively owned state.
    fn run_single(
        &self,
        trial: &Trial,
        run_index: u64,
        initial_budget: f64,
    ) -> SimResult<RunResult> {
        let run_seed = self.master_seed.wrapping_add(run_index);
        let mut state = SimulationState::new(trial, run_seed, initial_budget);
        let mut queue = EventQueue::new();

        for site in trial.sites() {
            let key = format!("site_activation:{}", site.id());
            let day = site.activation_time().sample(event_seed(run_seed, &key))?;
            queue.push(SimEvent::new(
                EventType::SiteActivation,
                site.id(),
                SimTime::from_days(day),
            ));
        }
        for activity in trial.activities() {
            if activity.dependencies().is_empty() {
                state.note_activity_scheduled(activity.id());
                queue.push(SimEvent::new(
                    EventType::ActivityStart,
                    activity.id(),
                    SimTime::ZERO,
                ));
            }
        }

        while let Some(queued) = queue.pop() {
            let mut event = queued.event;
            if event.time > self.time_ceiling {
                return Err(SimError::TimeCeilingExceeded {
                    run_index,
                    event_day: event.time.as_days(),
                    ceiling_day: self.time_ceiling.as_days(),
                });
            }
            state.advance_to(event.time);

            if !self.constraints.is_empty() {
                let composed = compose_all(
                    self.constraints.iter().map(|c| c.evaluate(&state, &event)),
                );
                let gate = composed.earliest_valid_time.unwrap_or(event.time);
                let new_time = gate.max(event.time.add_days(composed.delay));

                if new_time > event.time {
                    let explanation = composed
                        .explanation
                        .unwrap_or_else(|| "constraint reschedule".to_string());
                    tracing::debug!(
                        key = %event.seed_key(),
                        from = %event.time,
                        to = %new_time,
                        %explanation,
                        "event rescheduled"
                    );
                    state.record_reschedule(&event, new_time, !composed.is_valid, explanation);
                    event.time = new_time;
                    queue.push(event);
                    continue;
                }

                if !composed.parameter_overrides.is_empty() {
                    let detail = composed
                        .parameter_overrides
                        .iter()
                        .map(|(k, v)| format!("{k}={v:.4}"))
                        .collect::<Vec<_>>()
                        .join(", ");
                    // Idempotent merge: re-inserting an already-effective
                    // value changes nothing.
                    for (key, value) in &composed.parameter_overrides {
                        event.overrides.insert(key.clone(), *value);
                    }
                    state.record_modified(&event, detail);
                }
            }

            self.execute(trial, &mut state, &mut queue, &event)?;
        }

        let completion_day = state.current_time().as_days();
        let total_cost = state.budget_spent();
        let budget_remaining = state.budget_available();
        let patients_enrolled = state.enrolled_total();
        let patients_completed = state.patients_completed();
        let patients_dropped = state.patients_dropped();
        let activities_completed = state.activities_completed().len() as u32;
        let (timeline, metrics) = state.into_parts();

        Ok(RunResult {
            run_index,
            seed: run_seed,
            completion_day,
            total_cost,
            budget_remaining,
            patients_enrolled,
            patients_completed,
            patients_dropped,
            activities_completed,
            timeline,
            metrics,
        })
    }

    /// Execute one admitted event and generate its downstream events.
    fn execute(
        &self,
        trial: &Trial,
        state: &mut SimulationState<'_>,
        queue: &mut EventQueue,
        event: &SimEvent,
    ) -> SimResult<()> {
        match event.event_type {
            EventType::SiteActivation => {
                state.record_completion(event, "site active");
                self.schedule_arrival(trial, state, queue, &event.entity_id, 0, event.time)?;
            }
            EventType::EnrollmentArrival => self.execute_arrival(trial, state, queue, event)?,
            EventType::PatientTransition => {
                self.execute_transition(trial, state, queue, event)?;
            }
            EventType::ActivityStart => self.execute_activity_start(trial, state, queue, event)?,
            EventType::ActivityCompletion => {
                self.execute_activity_completion(trial, state, queue, event)?;
            }
        }
        Ok(())
    }

    /// Sample the next inter-arrival gap and schedule the arrival, unless
    /// enrollment is already closed for the site.
    fn schedule_arrival(
        &self,
        trial: &Trial,
        state: &mut SimulationState<'_>,
        queue: &mut EventQueue,
        site_id: &str,
        arrival_index: u32,
        now: SimTime,
    ) -> SimResult<()> {
        let Some(site) = trial.site(site_id) else {
            return Ok(());
        };
        if state.enrolled_total() >= trial.target_enrollment() {
            return Ok(());
        }
        if let Some(cap) = site.max_capacity() {
            if state.enrolled_at(site_id) >= cap {
                return Ok(());
            }
        }
        let key = format!("enrollment_gap:{site_id}:{arrival_index}");
        let rate = site
            .enrollment_rate()
            .sample(event_seed(state.run_seed(), &key))?;
        if rate <= 0.0 {
            tracing::warn!(site = site_id, rate, "non-positive enrollment rate; site stalls");
            return Ok(());
        }
        queue.push(
            SimEvent::new(
                EventType::EnrollmentArrival,
                site_id,
                now.add_days(1.0 / rate),
            )
            .with_attempt(arrival_index),
        );
        Ok(())
    }

    fn execute_arrival(
        &self,
        trial: &Trial,
        state: &mut SimulationState<'_>,
        queue: &mut EventQueue,
        event: &SimEvent,
    ) -> SimResult<()> {
        let Some(site) = trial.site(&event.entity_id) else {
            state.record_completion(event, "unknown site; arrival ignored");
            return Ok(());
        };
        let closed = state.enrolled_total() >= trial.target_enrollment()
            || site
                .max_capacity()
                .is_some_and(|cap| state.enrolled_at(site.id()) >= cap);
        if closed {
            state.record_completion(event, "enrollment closed; arrival ignored");
            return Ok(());
        }

        let initial = trial.patient_flow().initial_state();
        let patient = state.enroll_patient(site.id(), initial);
        state.spend(self.cost_model.enrollment_cost);
        state.record_completion(event, format!("enrolled patient {patient}"));

        queue.push(
            SimEvent::new(
                EventType::PatientTransition,
                format!("patient-{patient}"),
                event.time,
            )
            .with_patient(patient, initial),
        );
        self.schedule_arrival(trial, state, queue, site.id(), event.attempt + 1, event.time)
    }

    fn execute_transition(
        &self,
        trial: &Trial,
        state: &mut SimulationState<'_>,
        queue: &mut EventQueue,
        event: &SimEvent,
    ) -> SimResult<()> {
        let (Some(patient), Some(flow_state)) = (event.patient_id, event.flow_state.as_deref())
        else {
            state.record_completion(event, "malformed transition; ignored");
            return Ok(());
        };
        let flow = trial.patient_flow();
        let run_seed = state.run_seed();
        let base = event.seed_key();

        state.spend(self.cost_model.transition_cost);
        state.move_patient(patient, flow_state);

        if flow.is_terminal(flow_state) {
            state.record_completion(event, format!("reached terminal state '{flow_state}'"));
            state.note_patient_completed();
            return Ok(());
        }

        // Dropout check before anything downstream is scheduled.
        let site_id = state.patient_site(patient).map(str::to_string);
        if let Some(site) = site_id.as_deref().and_then(|id| trial.site(id)) {
            let prob = site
                .dropout_rate()
                .sample(event_seed(run_seed, &format!("{base}:dropout-prob")))?
                .clamp(0.0, 1.0);
            let draw = uniform(event_seed(run_seed, &format!("{base}:dropout-draw")));
            if draw < prob {
                state.record_dropout(
                    event,
                    format!("patient {patient} dropped out in '{flow_state}'"),
                );
                return Ok(());
            }
        }

        state.record_completion(event, format!("in state '{flow_state}'"));

        // Edge choice by normalized sampled weights.
        let edges: Vec<_> = flow.edges_from(flow_state).collect();
        let mut weights = Vec::with_capacity(edges.len());
        for edge in &edges {
            let w = edge
                .transition_probability()
                .sample(event_seed(run_seed, &format!("{base}:weight:{}", edge.key())))?
                .max(0.0);
            weights.push(w);
        }
        let total: f64 = weights.iter().sum();
        let chosen = if total > 0.0 {
            let r = uniform(event_seed(run_seed, &format!("{base}:choice"))) * total;
            let mut acc = 0.0;
            let mut index = edges.len() - 1;
            for (i, w) in weights.iter().enumerate() {
                acc += w;
                if r < acc {
                    index = i;
                    break;
                }
            }
            edges[index]
        } else {
            tracing::warn!(
                state = flow_state,
                "all transition weights sampled to zero; choosing uniformly"
            );
            let r = uniform(event_seed(run_seed, &format!("{base}:choice")));
            let index = ((r * edges.len() as f64) as usize).min(edges.len() - 1);
            edges[index]
        };

        let gap = chosen
            .transition_time()
            .sample(event_seed(run_seed, &format!("{base}:time:{}", chosen.key())))?;
        queue.push(
            SimEvent::new(
                EventType::PatientTransition,
                event.entity_id.clone(),
                event.time.add_days(gap.max(0.0)),
            )
            .with_patient(patient, chosen.to())
            // Attempt counts the patient's transitions so a revisited state
            // draws fresh samples instead of repeating a cycle forever.
            .with_attempt(event.attempt + 1),
        );
        Ok(())
    }

    fn execute_activity_start(
        &self,
        trial: &Trial,
        state: &mut SimulationState<'_>,
        queue: &mut EventQueue,
        event: &SimEvent,
    ) -> SimResult<()> {
        let Some(activity) = trial.activity(&event.entity_id) else {
            state.record_completion(event, "unknown activity; ignored");
            return Ok(());
        };
        let base = event.seed_key();
        let raw = activity
            .duration()
            .sample(event_seed(state.run_seed(), &format!("{base}:duration")))?
            .max(0.0);
        let multiplier = event
            .overrides
            .get("duration_multiplier")
            .copied()
            .unwrap_or(1.0);
        let duration = raw * multiplier;

        state.record_completion(event, format!("started, duration {duration:.3} days"));
        state.spend(self.cost_model.activity_cost_per_day * duration);

        let end = event.time.add_days(duration);
        for resource in activity.required_resources() {
            state.allocate(resource, event.time, end);
        }
        queue.push(
            SimEvent::new(EventType::ActivityCompletion, event.entity_id.clone(), end)
                .with_attempt(event.attempt),
        );
        Ok(())
    }

    fn execute_activity_completion(
        &self,
        trial: &Trial,
        state: &mut SimulationState<'_>,
        queue: &mut EventQueue,
        event: &SimEvent,
    ) -> SimResult<()> {
        let Some(activity) = trial.activity(&event.entity_id) else {
            state.record_completion(event, "unknown activity; ignored");
            return Ok(());
        };

        // Structural branch: a failed attempt is retried with resampled
        // durations (attempt-salted seeds), the way a rejected submission
        // gets resubmitted.
        if let Some(success) = activity.success_probability() {
            let base = event.seed_key();
            let prob = success
                .sample(event_seed(state.run_seed(), &format!("{base}:success-prob")))?
                .clamp(0.0, 1.0);
            let draw = uniform(event_seed(
                state.run_seed(),
                &format!("{base}:success-draw"),
            ));
            if draw >= prob {
                state.record_failed(
                    event,
                    format!("attempt {} failed; retrying", event.attempt),
                );
                queue.push(
                    SimEvent::new(
                        EventType::ActivityStart,
                        event.entity_id.clone(),
                        event.time,
                    )
                    .with_attempt(event.attempt + 1),
                );
                return Ok(());
            }
        }

        state.record_completion(event, "completed");
        state.note_activity_completed(&event.entity_id);

        for candidate in trial.activities() {
            if state.activity_scheduled(candidate.id()) {
                continue;
            }
            if candidate
                .dependencies()
                .iter()
                .all(|dep| state.activities_completed().contains(dep))
            {
                state.note_activity_scheduled(candidate.id());
                queue.push(SimEvent::new(
                    EventType::ActivityStart,
                    candidate.id(),
                    event.time,
                ));
            }
        }
        Ok(())
    }
}

/// One uniform draw in [0, 1) from a fresh seeded generator.
fn uniform(seed: u64) -> f64 {
    Pcg64::seed_from_u64(seed).gen::<f64>()
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::constraint::{
        BudgetConstraint, DependencyConstraint, LinearResponseCurve, ResourceCapacityConstraint,
    };
    use crate::entities::tests::simple_trial;

    fn fingerprint(results: &SimulationResults) -> Vec<(f64, f64, usize, MetricCounters)> {
        results
            .runs
            .iter()
            .map(|r| (r.completion_day, r.total_cost, r.timeline.len(), r.metrics))
            .collect()
    }

    #[test]
    fn test_zero_runs_rejected() {
        let trial = simple_trial();
        let engine = SimulationEngine::new(42);
        assert!(matches!(engine.run(&trial, 0, 0.0), Err(SimError::NoRuns)));
    }

    #[test]
    fn test_same_master_seed_reproduces_exactly() {
        let trial = simple_trial();
        let engine = SimulationEngine::new(42);
        let a = engine.run(&trial, 20, 1000.0).unwrap();
        let b = engine.run(&trial, 20, 1000.0).unwrap();
        assert_eq!(fingerprint(&a), fingerprint(&b));
        assert_eq!(a.completion_time, b.completion_time);
    }

    #[test]
    fn test_run_seeds_are_master_plus_index() {
        let trial = simple_trial();
        let results = SimulationEngine::new(42).run(&trial, 5, 0.0).unwrap();
        for (i, run) in results.runs.iter().enumerate() {
            assert_eq!(run.seed, 42 + i as u64);
            assert_eq!(run.run_index, i as u64);
        }
    }

    #[test]
    fn test_parallel_equals_sequential() {
        let trial = simple_trial();
        let par = SimulationEngine::new(7).run(&trial, 16, 500.0).unwrap();
        let seq = SimulationEngine::new(7)
            .with_parallel(false)
            .run(&trial, 16, 500.0)
            .unwrap();
        assert_eq!(fingerprint(&par), fingerprint(&seq));
    }

    #[test]
    fn test_different_master_seed_differs() {
        let trial = simple_trial();
        let a = SimulationEngine::new(42).run(&trial, 10, 0.0).unwrap();
        let b = SimulationEngine::new(99).run(&trial, 10, 0.0).unwrap();
        assert_ne!(fingerprint(&a), fingerprint(&b));
    }

    #[test]
    fn test_enrollment_reaches_target() {
        let trial = simple_trial();
        let results = SimulationEngine::new(3).run(&trial, 5, 0.0).unwrap();
        for run in &results.runs {
            assert_eq!(run.patients_enrolled, 50, "target enrollment must be hit");
            assert_eq!(
                run.patients_completed + run.patients_dropped,
                run.patients_enrolled,
                "every patient ends terminal or dropped"
            );
        }
    }

    #[test]
    fn test_activity_chain_completes() {
        let trial = simple_trial();
        let results = SimulationEngine::new(11).run(&trial, 3, 0.0).unwrap();
        for run in &results.runs {
            assert_eq!(run.activities_completed, 2);
        }
    }

    #[test]
    fn test_cost_model_accrues() {
        let trial = simple_trial();
        let engine = SimulationEngine::new(5).with_cost_model(CostModel::new(100.0, 0.0, 0.0));
        let results = engine.run(&trial, 2, 100_000.0).unwrap();
        for run in &results.runs {
            assert!((run.total_cost - f64::from(run.patients_enrolled) * 100.0).abs() < 1e-6);
            assert!((run.budget_remaining - (100_000.0 - run.total_cost)).abs() < 1e-6);
        }
    }

    /// Trial whose first enrollment arrival always lands before the gating
    /// activity can complete: activation <= 90 and the bounded rate keeps
    /// the first gap <= 10, while the approval alone takes >= 150 days.
    fn gated_trial() -> crate::entities::Trial {
        use crate::distribution::Distribution;
        use crate::entities::{tests::simple_flow, Activity, Site, Trial};

        let site = Site::new(
            "site-a",
            Distribution::triangular(30.0, 45.0, 90.0).unwrap(),
            Distribution::gamma(4.0, 0.05)
                .unwrap()
                .with_bounds(0.1, 1.0)
                .unwrap(),
            Distribution::bernoulli(0.05).unwrap(),
            None,
        )
        .unwrap();
        let approval = Activity::new(
            "protocol-approval",
            Distribution::triangular(150.0, 200.0, 300.0).unwrap(),
            [],
            [],
            None,
        )
        .unwrap();
        Trial::new(
            "nct-gated",
            10,
            vec![Arc::new(site)],
            Arc::new(simple_flow()),
            vec![Arc::new(approval)],
            vec![],
        )
        .unwrap()
    }

    #[test]
    fn test_dependency_constraint_reschedules() {
        let trial = gated_trial();
        let gate: Arc<dyn Constraint> = Arc::new(
            DependencyConstraint::new(
                EventType::EnrollmentArrival,
                EventType::ActivityCompletion,
                Some("protocol-approval".to_string()),
                5.0,
            )
            .unwrap(),
        );
        let unconstrained = SimulationEngine::new(42).run(&trial, 5, 0.0).unwrap();
        let constrained = SimulationEngine::new(42)
            .with_constraints(vec![gate])
            .run(&trial, 5, 0.0)
            .unwrap();

        for (free, gated) in unconstrained.runs.iter().zip(&constrained.runs) {
            assert!(gated.metrics.events_rescheduled > 0);
            assert!(gated.metrics.constraint_violations > 0);
            assert!(
                gated.completion_day >= free.completion_day,
                "gating can only slow a run down"
            );
        }
        // Violations are data: the run still completes its enrollment.
        for run in &constrained.runs {
            assert_eq!(run.patients_enrolled, 10);
        }
    }

    #[test]
    fn test_feasibility_constraints_do_not_count_violations() {
        let trial = simple_trial();
        let throttle: Arc<dyn Constraint> = Arc::new(BudgetConstraint::new(Box::new(
            LinearResponseCurve::new(0.5).unwrap(),
        )));
        let engine = SimulationEngine::new(42)
            .with_constraints(vec![throttle])
            .with_cost_model(CostModel::new(10.0, 1.0, 0.5));
        let results = engine.run(&trial, 5, 50.0).unwrap();
        for run in &results.runs {
            assert_eq!(
                run.metrics.constraint_violations, 0,
                "feasibility effects are not validity violations"
            );
        }
    }

    #[test]
    fn test_resource_capacity_constraint_runs_clean() {
        let trial = simple_trial();
        let capacity: Arc<dyn Constraint> = Arc::new(ResourceCapacityConstraint::new(Box::new(
            LinearResponseCurve::new(0.5).unwrap(),
        )));
        let results = SimulationEngine::new(42)
            .with_constraints(vec![capacity])
            .run(&trial, 5, 0.0)
            .unwrap();
        for run in &results.runs {
            assert_eq!(run.patients_enrolled, 50);
        }
    }

    #[test]
    fn test_time_ceiling_is_a_hard_error() {
        let trial = simple_trial();
        // A gate on a predecessor that never completes forces a reschedule
        // storm; the ceiling must surface as an explicit error.
        let gate: Arc<dyn Constraint> = Arc::new(
            DependencyConstraint::new(
                EventType::EnrollmentArrival,
                EventType::ActivityCompletion,
                Some("never-happens".to_string()),
                30.0,
            )
            .unwrap(),
        );
        let engine = SimulationEngine::new(42)
            .with_constraints(vec![gate])
            .with_time_ceiling_days(500.0);
        let err = engine.run(&trial, 1, 0.0).unwrap_err();
        assert!(matches!(err, SimError::TimeCeilingExceeded { .. }));
    }

    #[test]
    fn test_aggregate_percentiles_ordered() {
        let trial = simple_trial();
        let results = SimulationEngine::new(42).run(&trial, 50, 0.0).unwrap();
        let c = &results.completion_time;
        assert!(c.p10 <= c.p50 && c.p50 <= c.p90);
        assert!(c.min <= c.p10 && c.p95 <= c.max);
    }

    #[test]
    fn test_sim_time_fixed_point() {
        let t = SimTime::from_days(1.5);
        assert!((t.as_days() - 1.5).abs() < 1e-9);
        assert_eq!(SimTime::from_days(-3.0), SimTime::ZERO);
        assert_eq!(SimTime::from_days(f64::NAN), SimTime::ZERO);
        assert_eq!(SimTime::from_days(f64::INFINITY), SimTime::MAX);

        let later = t.add_days(0.5);
        assert!((later.as_days() - 2.0).abs() < 1e-9);
        assert!(later > t);
        assert_eq!((t - later), SimTime::ZERO, "subtraction saturates");
        assert_eq!(format!("{t}"), "day 1.500");
    }
}

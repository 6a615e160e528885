//! Per-run simulation state.
//!
//! Each run exclusively owns one `SimulationState`: clock, budget, the
//! completion-time table, resource-allocation intervals, the ordered
//! timeline log, and write-only metrics counters. Constraints get shared
//! read access during evaluation; only the engine mutates.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use crate::engine::SimTime;
use crate::entities::Trial;

/// Kind of simulated event.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    /// A site opens for enrollment.
    SiteActivation,
    /// A prospective patient arrives at a site.
    EnrollmentArrival,
    /// A patient arrives in a flow state.
    PatientTransition,
    /// An activity begins work.
    ActivityStart,
    /// An activity finishes work.
    ActivityCompletion,
}

impl EventType {
    /// Stable key used in completion-table lookups and seed derivation.
    #[must_use]
    pub const fn key(self) -> &'static str {
        match self {
            Self::SiteActivation => "site_activation",
            Self::EnrollmentArrival => "enrollment_arrival",
            Self::PatientTransition => "patient_transition",
            Self::ActivityStart => "activity_start",
            Self::ActivityCompletion => "activity_completion",
        }
    }
}

/// A proposed occurrence in the event queue.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SimEvent {
    /// What kind of event this is.
    pub event_type: EventType,
    /// Site id, activity id, or patient key, depending on the kind.
    pub entity_id: String,
    /// Proposed execution time.
    pub time: SimTime,
    /// Retry / arrival counter; salts the event's sampling seeds.
    pub attempt: u32,
    /// Patient involved, for flow events.
    pub patient_id: Option<u64>,
    /// Flow state the patient is arriving in, for transition events.
    pub flow_state: Option<String>,
    /// Feasibility parameter overrides already applied to this event.
    pub overrides: BTreeMap<String, f64>,
}

impl SimEvent {
    /// Create a bare event.
    #[must_use]
    pub fn new(event_type: EventType, entity_id: impl Into<String>, time: SimTime) -> Self {
        Self {
            event_type,
            entity_id: entity_id.into(),
            time,
            attempt: 0,
            patient_id: None,
            flow_state: None,
            overrides: BTreeMap::new(),
        }
    }

    /// Set the attempt counter, consuming `self`.
    #[must_use]
    pub fn with_attempt(mut self, attempt: u32) -> Self {
        self.attempt = attempt;
        self
    }

    /// Attach a patient and flow state, consuming `self`.
    #[must_use]
    pub fn with_patient(mut self, patient_id: u64, flow_state: impl Into<String>) -> Self {
        self.patient_id = Some(patient_id);
        self.flow_state = Some(flow_state.into());
        self
    }

    /// Stable key identifying this event for seed derivation.
    ///
    /// Includes everything that distinguishes the event except its time, so
    /// a rescheduled copy draws the same samples once its gate opens.
    #[must_use]
    pub fn seed_key(&self) -> String {
        let patient = self
            .patient_id
            .map_or_else(|| "-".to_string(), |p| p.to_string());
        let state = self.flow_state.as_deref().unwrap_or("-");
        format!(
            "{}:{}:{}:{}:{}",
            self.event_type.key(),
            self.entity_id,
            self.attempt,
            patient,
            state
        )
    }
}

/// Kind of timeline entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TimelineKind {
    /// Event executed and its completion was recorded.
    Completed,
    /// Event was pushed to a later time by constraint composition.
    Rescheduled,
    /// Feasibility overrides were applied before execution.
    Modified,
    /// A structural success branch came up negative.
    Failed,
    /// A patient left the trial before reaching a terminal state.
    Dropped,
}

/// One entry of a run's causal timeline.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimelineEntry {
    /// Simulation time of the entry.
    pub time: SimTime,
    /// Entry kind.
    pub kind: TimelineKind,
    /// Event type involved.
    pub event_type: EventType,
    /// Entity involved.
    pub entity_id: String,
    /// Human-readable detail (constraint explanations, outcomes).
    pub detail: String,
}

/// Write-only loop counters.
///
/// No engine branch reads these to alter control flow; they exist purely
/// for reporting, which keeps runs bit-reproducible.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetricCounters {
    /// Events executed to completion.
    pub events_processed: u64,
    /// Events pushed to a later time by constraints.
    pub events_rescheduled: u64,
    /// Reschedules caused by a validity failure.
    pub constraint_violations: u64,
}

/// A resource held over a half-open time interval.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AllocationInterval {
    /// Allocation start (inclusive).
    pub start: SimTime,
    /// Allocation end (exclusive).
    pub end: SimTime,
}

/// A patient's position in the flow.
#[derive(Debug, Clone)]
struct PatientRecord {
    site_id: String,
    current_state: String,
}

/// State exclusively owned by one simulation run.
#[derive(Debug)]
pub struct SimulationState<'a> {
    trial: &'a Trial,
    run_seed: u64,
    current_time: SimTime,
    budget_initial: f64,
    budget_spent: f64,
    completions: BTreeMap<(EventType, String), SimTime>,
    allocations: BTreeMap<String, Vec<AllocationInterval>>,
    timeline: Vec<TimelineEntry>,
    metrics: MetricCounters,
    patients: BTreeMap<u64, PatientRecord>,
    enrolled_by_site: BTreeMap<String, u32>,
    enrolled_total: u32,
    patients_completed: u32,
    patients_dropped: u32,
    activities_completed: BTreeSet<String>,
    activities_scheduled: BTreeSet<String>,
    next_patient: u64,
}

impl<'a> SimulationState<'a> {
    /// Fresh state for one run.
    #[must_use]
    pub fn new(trial: &'a Trial, run_seed: u64, initial_budget: f64) -> Self {
        Self {
            trial,
            run_seed,
            current_time: SimTime::ZERO,
            budget_initial: initial_budget,
            budget_spent: 0.0,
            completions: BTreeMap::new(),
            allocations: BTreeMap::new(),
            timeline: Vec::new(),
            metrics: MetricCounters::default(),
            patients: BTreeMap::new(),
            enrolled_by_site: BTreeMap::new(),
            enrolled_total: 0,
            patients_completed: 0,
            patients_dropped: 0,
            activities_completed: BTreeSet::new(),
            activities_scheduled: BTreeSet::new(),
            next_patient: 0,
        }
    }

    // ===== read surface (constraints and engine) =====

    /// The immutable trial specification this run interprets.
    #[must_use]
    pub const fn trial(&self) -> &'a Trial {
        self.trial
    }

    /// Seed of this run.
    #[must_use]
    pub const fn run_seed(&self) -> u64 {
        self.run_seed
    }

    /// Current simulation time.
    #[must_use]
    pub const fn current_time(&self) -> SimTime {
        self.current_time
    }

    /// Budget available at this point of the run.
    #[must_use]
    pub fn budget_available(&self) -> f64 {
        self.budget_initial - self.budget_spent
    }

    /// Budget spent so far.
    #[must_use]
    pub const fn budget_spent(&self) -> f64 {
        self.budget_spent
    }

    /// Remaining-budget ratio in [0, 1]; 1 when no budget was configured.
    #[must_use]
    pub fn budget_ratio(&self) -> f64 {
        if self.budget_initial <= 0.0 {
            return 1.0;
        }
        (self.budget_available() / self.budget_initial).clamp(0.0, 1.0)
    }

    /// Completion time of `(event_type, entity_id)`, if recorded.
    #[must_use]
    pub fn completion(&self, event_type: EventType, entity_id: &str) -> Option<SimTime> {
        self.completions
            .get(&(event_type, entity_id.to_string()))
            .copied()
    }

    /// Number of allocations of `resource_id` live at time `at`.
    #[must_use]
    pub fn active_allocations(&self, resource_id: &str, at: SimTime) -> u32 {
        self.allocations.get(resource_id).map_or(0, |intervals| {
            intervals
                .iter()
                .filter(|iv| iv.start <= at && at < iv.end)
                .count() as u32
        })
    }

    /// Earliest release among allocations of `resource_id` live at `at`.
    #[must_use]
    pub fn earliest_release(&self, resource_id: &str, at: SimTime) -> Option<SimTime> {
        self.allocations.get(resource_id).and_then(|intervals| {
            intervals
                .iter()
                .filter(|iv| iv.start <= at && at < iv.end)
                .map(|iv| iv.end)
                .min()
        })
    }

    /// Patients enrolled across all sites.
    #[must_use]
    pub const fn enrolled_total(&self) -> u32 {
        self.enrolled_total
    }

    /// Patients enrolled at one site.
    #[must_use]
    pub fn enrolled_at(&self, site_id: &str) -> u32 {
        self.enrolled_by_site.get(site_id).copied().unwrap_or(0)
    }

    /// Patients that reached a terminal flow state.
    #[must_use]
    pub const fn patients_completed(&self) -> u32 {
        self.patients_completed
    }

    /// Patients that dropped out before a terminal state.
    #[must_use]
    pub const fn patients_dropped(&self) -> u32 {
        self.patients_dropped
    }

    /// Ids of activities that completed successfully.
    #[must_use]
    pub const fn activities_completed(&self) -> &BTreeSet<String> {
        &self.activities_completed
    }

    /// Whether an activity start has already been scheduled this run.
    #[must_use]
    pub fn activity_scheduled(&self, id: &str) -> bool {
        self.activities_scheduled.contains(id)
    }

    /// The run's causal timeline so far.
    #[must_use]
    pub fn timeline(&self) -> &[TimelineEntry] {
        &self.timeline
    }

    /// Loop counters.
    #[must_use]
    pub const fn metrics(&self) -> MetricCounters {
        self.metrics
    }

    // ===== engine-only mutation =====

    /// Advance the clock; time never moves backwards.
    pub(crate) fn advance_to(&mut self, time: SimTime) {
        if time > self.current_time {
            self.current_time = time;
        }
    }

    /// Spend budget. Negative available is allowed; the ratio clamps.
    pub(crate) fn spend(&mut self, amount: f64) {
        if amount > 0.0 {
            self.budget_spent += amount;
        }
    }

    /// Record an executed event: completion-table entry, timeline entry,
    /// processed counter.
    pub(crate) fn record_completion(&mut self, event: &SimEvent, detail: impl Into<String>) {
        self.completions
            .insert((event.event_type, event.entity_id.clone()), event.time);
        self.timeline.push(TimelineEntry {
            time: event.time,
            kind: TimelineKind::Completed,
            event_type: event.event_type,
            entity_id: event.entity_id.clone(),
            detail: detail.into(),
        });
        self.metrics.events_processed += 1;
    }

    /// Record an executed event that must not update the completion table
    /// (a failed structural branch).
    pub(crate) fn record_failed(&mut self, event: &SimEvent, detail: impl Into<String>) {
        self.timeline.push(TimelineEntry {
            time: event.time,
            kind: TimelineKind::Failed,
            event_type: event.event_type,
            entity_id: event.entity_id.clone(),
            detail: detail.into(),
        });
        self.metrics.events_processed += 1;
    }

    /// Record a constraint-driven reschedule.
    pub(crate) fn record_reschedule(
        &mut self,
        event: &SimEvent,
        new_time: SimTime,
        validity_failure: bool,
        explanation: impl Into<String>,
    ) {
        self.metrics.events_rescheduled += 1;
        if validity_failure {
            self.metrics.constraint_violations += 1;
        }
        self.timeline.push(TimelineEntry {
            time: event.time,
            kind: TimelineKind::Rescheduled,
            event_type: event.event_type,
            entity_id: event.entity_id.clone(),
            detail: format!(
                "moved to day {:.3}: {}",
                new_time.as_days(),
                explanation.into()
            ),
        });
    }

    /// Record applied feasibility overrides.
    pub(crate) fn record_modified(&mut self, event: &SimEvent, detail: impl Into<String>) {
        self.timeline.push(TimelineEntry {
            time: event.time,
            kind: TimelineKind::Modified,
            event_type: event.event_type,
            entity_id: event.entity_id.clone(),
            detail: detail.into(),
        });
    }

    /// Record a patient dropout.
    pub(crate) fn record_dropout(&mut self, event: &SimEvent, detail: impl Into<String>) {
        self.patients_dropped += 1;
        self.timeline.push(TimelineEntry {
            time: event.time,
            kind: TimelineKind::Dropped,
            event_type: event.event_type,
            entity_id: event.entity_id.clone(),
            detail: detail.into(),
        });
        self.metrics.events_processed += 1;
    }

    /// Enroll a new patient at a site; returns the patient id.
    pub(crate) fn enroll_patient(&mut self, site_id: &str, initial_state: &str) -> u64 {
        let id = self.next_patient;
        self.next_patient += 1;
        self.enrolled_total += 1;
        *self
            .enrolled_by_site
            .entry(site_id.to_string())
            .or_insert(0) += 1;
        self.patients.insert(
            id,
            PatientRecord {
                site_id: site_id.to_string(),
                current_state: initial_state.to_string(),
            },
        );
        id
    }

    /// Site a patient enrolled at.
    #[must_use]
    pub fn patient_site(&self, patient_id: u64) -> Option<&str> {
        self.patients.get(&patient_id).map(|p| p.site_id.as_str())
    }

    /// Move a patient to a new flow state.
    pub(crate) fn move_patient(&mut self, patient_id: u64, state: &str) {
        if let Some(p) = self.patients.get_mut(&patient_id) {
            p.current_state = state.to_string();
        }
    }

    /// Count a patient as having reached a terminal state.
    pub(crate) fn note_patient_completed(&mut self) {
        self.patients_completed += 1;
    }

    /// Reserve a resource over an interval.
    pub(crate) fn allocate(&mut self, resource_id: &str, start: SimTime, end: SimTime) {
        self.allocations
            .entry(resource_id.to_string())
            .or_default()
            .push(AllocationInterval { start, end });
    }

    /// Mark an activity's start as scheduled.
    pub(crate) fn note_activity_scheduled(&mut self, id: &str) {
        self.activities_scheduled.insert(id.to_string());
    }

    /// Mark an activity as successfully completed.
    pub(crate) fn note_activity_completed(&mut self, id: &str) {
        self.activities_completed.insert(id.to_string());
    }

    /// Consume the state into its reportable parts.
    pub(crate) fn into_parts(self) -> (Vec<TimelineEntry>, MetricCounters) {
        (self.timeline, self.metrics)
    }
}

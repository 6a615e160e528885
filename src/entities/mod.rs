//! Immutable trial specification entities.
//!
//! Pure value objects: construction validates every invariant, fields are
//! private, and the only behavior beyond validation is serialization. No
//! accessor derives statistics, advances state, or samples a distribution —
//! entities hold `Arc<Distribution>` references and sampling stays the
//! engine's exclusive privilege.
//!
//! Once built, an entity is immutable for its entire lifetime and is safely
//! shared, unsynchronized, across concurrent simulation runs.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use validator::Validate;

use crate::distribution::Distribution;
use crate::error::{SimError, SimResult};

/// A clinical site: where and how fast patients arrive.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "SiteSpec", into = "SiteSpec")]
pub struct Site {
    id: String,
    activation_time: Arc<Distribution>,
    enrollment_rate: Arc<Distribution>,
    dropout_rate: Arc<Distribution>,
    max_capacity: Option<u32>,
}

impl Site {
    /// Build a validated site.
    ///
    /// # Errors
    ///
    /// Returns `EmptyId` if `id` is empty.
    pub fn new(
        id: impl Into<String>,
        activation_time: impl Into<Arc<Distribution>>,
        enrollment_rate: impl Into<Arc<Distribution>>,
        dropout_rate: impl Into<Arc<Distribution>>,
        max_capacity: Option<u32>,
    ) -> SimResult<Self> {
        let id = id.into();
        if id.is_empty() {
            return Err(SimError::EmptyId { kind: "site" });
        }
        Ok(Self {
            id,
            activation_time: activation_time.into(),
            enrollment_rate: enrollment_rate.into(),
            dropout_rate: dropout_rate.into(),
            max_capacity,
        })
    }

    /// Site id.
    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Days until the site opens for enrollment.
    #[must_use]
    pub const fn activation_time(&self) -> &Arc<Distribution> {
        &self.activation_time
    }

    /// Patients enrolled per day once active.
    #[must_use]
    pub const fn enrollment_rate(&self) -> &Arc<Distribution> {
        &self.enrollment_rate
    }

    /// Per-transition probability that a patient leaves the trial.
    #[must_use]
    pub const fn dropout_rate(&self) -> &Arc<Distribution> {
        &self.dropout_rate
    }

    /// Maximum patients this site may enroll, if capped.
    #[must_use]
    pub const fn max_capacity(&self) -> Option<u32> {
        self.max_capacity
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
struct SiteSpec {
    #[validate(length(min = 1))]
    id: String,
    activation_time: Distribution,
    enrollment_rate: Distribution,
    dropout_rate: Distribution,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    max_capacity: Option<u32>,
}

impl TryFrom<SiteSpec> for Site {
    type Error = SimError;

    fn try_from(spec: SiteSpec) -> SimResult<Self> {
        spec.validate()?;
        Self::new(
            spec.id,
            spec.activation_time,
            spec.enrollment_rate,
            spec.dropout_rate,
            spec.max_capacity,
        )
    }
}

impl From<Site> for SiteSpec {
    fn from(site: Site) -> Self {
        Self {
            id: site.id,
            activation_time: (*site.activation_time).clone(),
            enrollment_rate: (*site.enrollment_rate).clone(),
            dropout_rate: (*site.dropout_rate).clone(),
            max_capacity: site.max_capacity,
        }
    }
}

/// A unit of trial work with dependencies and resource needs.
///
/// `success_probability` models structural branching (an IRB approval
/// passes or fails), never operational-quality noise.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "ActivitySpec", into = "ActivitySpec")]
pub struct Activity {
    id: String,
    duration: Arc<Distribution>,
    dependencies: BTreeSet<String>,
    required_resources: BTreeSet<String>,
    success_probability: Option<Arc<Distribution>>,
}

impl Activity {
    /// Build a validated activity.
    ///
    /// # Errors
    ///
    /// Returns `EmptyId` for an empty id, `DependencyCycle` for a
    /// self-dependency (longer cycles are caught at `Trial` construction).
    pub fn new(
        id: impl Into<String>,
        duration: impl Into<Arc<Distribution>>,
        dependencies: impl IntoIterator<Item = String>,
        required_resources: impl IntoIterator<Item = String>,
        success_probability: Option<Distribution>,
    ) -> SimResult<Self> {
        let id = id.into();
        if id.is_empty() {
            return Err(SimError::EmptyId { kind: "activity" });
        }
        let dependencies: BTreeSet<String> = dependencies.into_iter().collect();
        if dependencies.contains(&id) {
            return Err(SimError::DependencyCycle { id });
        }
        Ok(Self {
            id,
            duration: duration.into(),
            dependencies,
            required_resources: required_resources.into_iter().collect(),
            success_probability: success_probability.map(Arc::new),
        })
    }

    /// Activity id.
    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Working duration in days.
    #[must_use]
    pub const fn duration(&self) -> &Arc<Distribution> {
        &self.duration
    }

    /// Ids of activities that must complete first.
    #[must_use]
    pub const fn dependencies(&self) -> &BTreeSet<String> {
        &self.dependencies
    }

    /// Ids of resources this activity occupies while running.
    #[must_use]
    pub const fn required_resources(&self) -> &BTreeSet<String> {
        &self.required_resources
    }

    /// Structural pass/fail branch, if the activity has one.
    #[must_use]
    pub const fn success_probability(&self) -> Option<&Arc<Distribution>> {
        self.success_probability.as_ref()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
struct ActivitySpec {
    #[validate(length(min = 1))]
    id: String,
    duration: Distribution,
    #[serde(default)]
    dependencies: BTreeSet<String>,
    #[serde(default)]
    required_resources: BTreeSet<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    success_probability: Option<Distribution>,
}

impl TryFrom<ActivitySpec> for Activity {
    type Error = SimError;

    fn try_from(spec: ActivitySpec) -> SimResult<Self> {
        spec.validate()?;
        Self::new(
            spec.id,
            spec.duration,
            spec.dependencies,
            spec.required_resources,
            spec.success_probability,
        )
    }
}

impl From<Activity> for ActivitySpec {
    fn from(a: Activity) -> Self {
        Self {
            id: a.id,
            duration: (*a.duration).clone(),
            dependencies: a.dependencies,
            required_resources: a.required_resources,
            success_probability: a.success_probability.map(|d| (*d).clone()),
        }
    }
}

/// A capacity-limited resource (CRO team, lab slot, drug supply line).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "ResourceSpec", into = "ResourceSpec")]
pub struct Resource {
    id: String,
    kind: String,
    capacity: Option<u32>,
    availability: Option<Arc<Distribution>>,
    utilization: Option<Arc<Distribution>>,
}

impl Resource {
    /// Build a validated resource.
    ///
    /// # Errors
    ///
    /// Returns `EmptyId` if id or kind is empty.
    pub fn new(
        id: impl Into<String>,
        kind: impl Into<String>,
        capacity: Option<u32>,
        availability: Option<Distribution>,
        utilization: Option<Distribution>,
    ) -> SimResult<Self> {
        let id = id.into();
        if id.is_empty() {
            return Err(SimError::EmptyId { kind: "resource" });
        }
        let kind = kind.into();
        if kind.is_empty() {
            return Err(SimError::EmptyId {
                kind: "resource type",
            });
        }
        Ok(Self {
            id,
            kind,
            capacity,
            availability: availability.map(Arc::new),
            utilization: utilization.map(Arc::new),
        })
    }

    /// Resource id.
    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Resource type label.
    #[must_use]
    pub fn kind(&self) -> &str {
        &self.kind
    }

    /// Concurrent-use capacity; `None` means unlimited.
    #[must_use]
    pub const fn capacity(&self) -> Option<u32> {
        self.capacity
    }

    /// Fraction of time the resource is available, if modeled.
    #[must_use]
    pub const fn availability(&self) -> Option<&Arc<Distribution>> {
        self.availability.as_ref()
    }

    /// Baseline utilization by work outside this trial, if modeled.
    #[must_use]
    pub const fn utilization(&self) -> Option<&Arc<Distribution>> {
        self.utilization.as_ref()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
struct ResourceSpec {
    #[validate(length(min = 1))]
    id: String,
    #[validate(length(min = 1))]
    kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    capacity: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    availability: Option<Distribution>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    utilization: Option<Distribution>,
}

impl TryFrom<ResourceSpec> for Resource {
    type Error = SimError;

    fn try_from(spec: ResourceSpec) -> SimResult<Self> {
        spec.validate()?;
        Self::new(
            spec.id,
            spec.kind,
            spec.capacity,
            spec.availability,
            spec.utilization,
        )
    }
}

impl From<Resource> for ResourceSpec {
    fn from(r: Resource) -> Self {
        Self {
            id: r.id,
            kind: r.kind,
            capacity: r.capacity,
            availability: r.availability.map(|d| (*d).clone()),
            utilization: r.utilization.map(|d| (*d).clone()),
        }
    }
}

/// One directed edge of a patient flow.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FlowEdge {
    from: String,
    to: String,
    transition_time: Arc<Distribution>,
    transition_probability: Arc<Distribution>,
}

impl FlowEdge {
    /// Build a flow edge; state membership is checked by `PatientFlow`.
    ///
    /// # Errors
    ///
    /// Returns `EmptyId` if either endpoint is empty.
    pub fn new(
        from: impl Into<String>,
        to: impl Into<String>,
        transition_time: impl Into<Arc<Distribution>>,
        transition_probability: impl Into<Arc<Distribution>>,
    ) -> SimResult<Self> {
        let from = from.into();
        let to = to.into();
        if from.is_empty() || to.is_empty() {
            return Err(SimError::EmptyId { kind: "flow state" });
        }
        Ok(Self {
            from,
            to,
            transition_time: transition_time.into(),
            transition_probability: transition_probability.into(),
        })
    }

    /// Source state.
    #[must_use]
    pub fn from(&self) -> &str {
        &self.from
    }

    /// Destination state.
    #[must_use]
    pub fn to(&self) -> &str {
        &self.to
    }

    /// Days spent making this transition.
    #[must_use]
    pub const fn transition_time(&self) -> &Arc<Distribution> {
        &self.transition_time
    }

    /// Relative likelihood of taking this edge.
    #[must_use]
    pub const fn transition_probability(&self) -> &Arc<Distribution> {
        &self.transition_probability
    }

    /// Stable key for override addressing and logs.
    #[must_use]
    pub fn key(&self) -> String {
        format!("{}->{}", self.from, self.to)
    }
}

/// A purely declarative patient-state graph; interpretation is the
/// engine's job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "PatientFlowSpec", into = "PatientFlowSpec")]
pub struct PatientFlow {
    id: String,
    states: BTreeSet<String>,
    initial_state: String,
    terminal_states: BTreeSet<String>,
    edges: Vec<FlowEdge>,
}

impl PatientFlow {
    /// Build a validated flow graph.
    ///
    /// # Errors
    ///
    /// Returns `InvalidFlow` when the graph shape is defective: unknown
    /// initial/terminal/edge states, no terminal state, an edge leaving a
    /// terminal state, a duplicate edge, or a non-terminal state with no
    /// way out.
    pub fn new(
        id: impl Into<String>,
        states: impl IntoIterator<Item = String>,
        initial_state: impl Into<String>,
        terminal_states: impl IntoIterator<Item = String>,
        edges: Vec<FlowEdge>,
    ) -> SimResult<Self> {
        let id = id.into();
        if id.is_empty() {
            return Err(SimError::EmptyId { kind: "flow" });
        }
        let states: BTreeSet<String> = states.into_iter().collect();
        if states.is_empty() {
            return Err(SimError::invalid_flow(&id, "state set is empty"));
        }
        let initial_state = initial_state.into();
        if !states.contains(&initial_state) {
            return Err(SimError::invalid_flow(
                &id,
                format!("initial state '{initial_state}' not in state set"),
            ));
        }
        let terminal_states: BTreeSet<String> = terminal_states.into_iter().collect();
        if terminal_states.is_empty() {
            return Err(SimError::invalid_flow(&id, "no terminal state"));
        }
        for t in &terminal_states {
            if !states.contains(t) {
                return Err(SimError::invalid_flow(
                    &id,
                    format!("terminal state '{t}' not in state set"),
                ));
            }
        }

        let mut seen_edges = BTreeSet::new();
        for edge in &edges {
            for endpoint in [edge.from(), edge.to()] {
                if !states.contains(endpoint) {
                    return Err(SimError::invalid_flow(
                        &id,
                        format!("edge endpoint '{endpoint}' not in state set"),
                    ));
                }
            }
            if terminal_states.contains(edge.from()) {
                return Err(SimError::invalid_flow(
                    &id,
                    format!("edge leaves terminal state '{}'", edge.from()),
                ));
            }
            if !seen_edges.insert(edge.key()) {
                return Err(SimError::invalid_flow(
                    &id,
                    format!("duplicate edge '{}'", edge.key()),
                ));
            }
        }
        for state in &states {
            if terminal_states.contains(state) {
                continue;
            }
            if !edges.iter().any(|e| e.from() == state) {
                return Err(SimError::invalid_flow(
                    &id,
                    format!("non-terminal state '{state}' has no outgoing edge"),
                ));
            }
        }

        Ok(Self {
            id,
            states,
            initial_state,
            terminal_states,
            edges,
        })
    }

    /// Flow id.
    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    /// All states.
    #[must_use]
    pub const fn states(&self) -> &BTreeSet<String> {
        &self.states
    }

    /// Entry state for newly enrolled patients.
    #[must_use]
    pub fn initial_state(&self) -> &str {
        &self.initial_state
    }

    /// States where a patient's journey ends.
    #[must_use]
    pub const fn terminal_states(&self) -> &BTreeSet<String> {
        &self.terminal_states
    }

    /// All edges, in declaration order.
    #[must_use]
    pub fn edges(&self) -> &[FlowEdge] {
        &self.edges
    }

    /// Edges leaving `state`, in declaration order.
    pub fn edges_from<'a>(&'a self, state: &'a str) -> impl Iterator<Item = &'a FlowEdge> {
        self.edges.iter().filter(move |e| e.from() == state)
    }

    /// Whether `state` is terminal.
    #[must_use]
    pub fn is_terminal(&self, state: &str) -> bool {
        self.terminal_states.contains(state)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
struct PatientFlowSpec {
    #[validate(length(min = 1))]
    id: String,
    states: BTreeSet<String>,
    initial_state: String,
    terminal_states: BTreeSet<String>,
    #[serde(default)]
    edges: Vec<FlowEdge>,
}

impl TryFrom<PatientFlowSpec> for PatientFlow {
    type Error = SimError;

    fn try_from(spec: PatientFlowSpec) -> SimResult<Self> {
        spec.validate()?;
        Self::new(
            spec.id,
            spec.states,
            spec.initial_state,
            spec.terminal_states,
            spec.edges,
        )
    }
}

impl From<PatientFlow> for PatientFlowSpec {
    fn from(f: PatientFlow) -> Self {
        Self {
            id: f.id,
            states: f.states,
            initial_state: f.initial_state,
            terminal_states: f.terminal_states,
            edges: f.edges,
        }
    }
}

/// The complete trial specification: the immutable input to every run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "TrialSpec", into = "TrialSpec")]
pub struct Trial {
    id: String,
    target_enrollment: u32,
    sites: Vec<Arc<Site>>,
    patient_flow: Arc<PatientFlow>,
    activities: Vec<Arc<Activity>>,
    resources: Vec<Arc<Resource>>,
}

impl Trial {
    /// Build a validated trial.
    ///
    /// Every cross-reference must resolve to an entity in this trial, ids
    /// must be unique per kind, and the activity dependency graph must be
    /// acyclic.
    ///
    /// # Errors
    ///
    /// Returns one named error per violated invariant (§ error.rs).
    pub fn new(
        id: impl Into<String>,
        target_enrollment: u32,
        sites: Vec<Arc<Site>>,
        patient_flow: Arc<PatientFlow>,
        activities: Vec<Arc<Activity>>,
        resources: Vec<Arc<Resource>>,
    ) -> SimResult<Self> {
        let id = id.into();
        if id.is_empty() {
            return Err(SimError::EmptyId { kind: "trial" });
        }
        if target_enrollment == 0 {
            return Err(SimError::InvalidTrial {
                id,
                message: "target_enrollment must be > 0".to_string(),
            });
        }
        if sites.is_empty() {
            return Err(SimError::InvalidTrial {
                id,
                message: "at least one site is required".to_string(),
            });
        }

        let mut site_ids = BTreeSet::new();
        for site in &sites {
            if !site_ids.insert(site.id().to_string()) {
                return Err(SimError::DuplicateId {
                    kind: "site",
                    id: site.id().to_string(),
                });
            }
        }
        let mut resource_ids = BTreeSet::new();
        for resource in &resources {
            if !resource_ids.insert(resource.id().to_string()) {
                return Err(SimError::DuplicateId {
                    kind: "resource",
                    id: resource.id().to_string(),
                });
            }
        }
        let mut activity_ids = BTreeSet::new();
        for activity in &activities {
            if !activity_ids.insert(activity.id().to_string()) {
                return Err(SimError::DuplicateId {
                    kind: "activity",
                    id: activity.id().to_string(),
                });
            }
        }
        for activity in &activities {
            for dep in activity.dependencies() {
                if !activity_ids.contains(dep) {
                    return Err(SimError::DanglingReference {
                        referrer: format!("activity '{}'", activity.id()),
                        kind: "activity",
                        id: dep.clone(),
                    });
                }
            }
            for res in activity.required_resources() {
                if !resource_ids.contains(res) {
                    return Err(SimError::DanglingReference {
                        referrer: format!("activity '{}'", activity.id()),
                        kind: "resource",
                        id: res.clone(),
                    });
                }
            }
        }
        check_acyclic(&activities)?;

        Ok(Self {
            id,
            target_enrollment,
            sites,
            patient_flow,
            activities,
            resources,
        })
    }

    /// Trial id.
    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Total patients to enroll across all sites.
    #[must_use]
    pub const fn target_enrollment(&self) -> u32 {
        self.target_enrollment
    }

    /// All sites.
    #[must_use]
    pub fn sites(&self) -> &[Arc<Site>] {
        &self.sites
    }

    /// The patient-state graph.
    #[must_use]
    pub const fn patient_flow(&self) -> &Arc<PatientFlow> {
        &self.patient_flow
    }

    /// All activities.
    #[must_use]
    pub fn activities(&self) -> &[Arc<Activity>] {
        &self.activities
    }

    /// All resources.
    #[must_use]
    pub fn resources(&self) -> &[Arc<Resource>] {
        &self.resources
    }

    /// Look up an activity by id.
    #[must_use]
    pub fn activity(&self, id: &str) -> Option<&Arc<Activity>> {
        self.activities.iter().find(|a| a.id() == id)
    }

    /// Look up a site by id.
    #[must_use]
    pub fn site(&self, id: &str) -> Option<&Arc<Site>> {
        self.sites.iter().find(|s| s.id() == id)
    }

    /// Look up a resource by id.
    #[must_use]
    pub fn resource(&self, id: &str) -> Option<&Arc<Resource>> {
        self.resources.iter().find(|r| r.id() == id)
    }
}

/// Kahn walk over the activity dependency graph.
fn check_acyclic(activities: &[Arc<Activity>]) -> SimResult<()> {
    let mut indegree: BTreeMap<&str, usize> = activities
        .iter()
        .map(|a| (a.id(), a.dependencies().len()))
        .collect();
    let mut ready: Vec<&str> = indegree
        .iter()
        .filter(|(_, &d)| d == 0)
        .map(|(&id, _)| id)
        .collect();
    let mut removed = 0usize;

    while let Some(done) = ready.pop() {
        removed += 1;
        for activity in activities {
            if activity.dependencies().contains(done) {
                if let Some(d) = indegree.get_mut(activity.id()) {
                    *d -= 1;
                    if *d == 0 {
                        ready.push(activity.id());
                    }
                }
            }
        }
    }

    if removed == activities.len() {
        Ok(())
    } else {
        let stuck = indegree
            .iter()
            .filter(|(_, &d)| d > 0)
            .map(|(&id, _)| id)
            .min()
            .unwrap_or("?");
        Err(SimError::DependencyCycle {
            id: stuck.to_string(),
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
struct TrialSpec {
    #[validate(length(min = 1))]
    id: String,
    #[validate(range(min = 1))]
    target_enrollment: u32,
    sites: Vec<Site>,
    patient_flow: PatientFlow,
    #[serde(default)]
    activities: Vec<Activity>,
    #[serde(default)]
    resources: Vec<Resource>,
}

impl TryFrom<TrialSpec> for Trial {
    type Error = SimError;

    fn try_from(spec: TrialSpec) -> SimResult<Self> {
        spec.validate()?;
        Self::new(
            spec.id,
            spec.target_enrollment,
            spec.sites.into_iter().map(Arc::new).collect(),
            Arc::new(spec.patient_flow),
            spec.activities.into_iter().map(Arc::new).collect(),
            spec.resources.into_iter().map(Arc::new).collect(),
        )
    }
}

impl From<Trial> for TrialSpec {
    fn from(t: Trial) -> Self {
        Self {
            id: t.id,
            target_enrollment: t.target_enrollment,
            sites: t.sites.iter().map(|s| (**s).clone()).collect(),
            patient_flow: (*t.patient_flow).clone(),
            activities: t.activities.iter().map(|a| (**a).clone()).collect(),
            resources: t.resources.iter().map(|r| (**r).clone()).collect(),
        }
    }
}

//! Scenario overrides.
//!
//! A `ScenarioProfile` is an explicit, serializable set of field-level
//! overrides. `apply_scenario` is a pure function from (base trial,
//! profile) to a new trial: the base is never mutated, entities untouched
//! by any override are reused by reference (safe because entities are
//! immutable), and touched entities are rebuilt through their validating
//! constructors.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::distribution::{Bounds, Distribution, Params};
use crate::entities::{Activity, FlowEdge, PatientFlow, Resource, Site, Trial};
use crate::error::{SimError, SimResult};

/// One override operation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum OverrideOp {
    /// Replace a scalar field.
    DirectValue {
        /// New value; must match the field's kind.
        value: serde_json::Value,
    },
    /// Swap the whole distribution.
    DistributionReplace {
        /// Replacement, validated on construction.
        distribution: Distribution,
    },
    /// Multiply numeric parameters, family-specific: Triangular scales
    /// low/mode/high, LogNormal scales mean only, Gamma scales scale only,
    /// Bernoulli rejects scaling.
    DistributionScale {
        /// Strictly positive factor.
        factor: f64,
    },
    /// Additive shift; unsupported for Gamma and Bernoulli.
    DistributionShift {
        /// Offset in the distribution's own units.
        offset: f64,
    },
    /// Overwrite named parameters, leaving the others intact.
    DistributionParam {
        /// Parameter name to new value.
        params: BTreeMap<String, f64>,
    },
}

impl OverrideOp {
    const fn kind_name(&self) -> &'static str {
        match self {
            Self::DirectValue { .. } => "direct_value",
            Self::DistributionReplace { .. } => "distribution_replace",
            Self::DistributionScale { .. } => "distribution_scale",
            Self::DistributionShift { .. } => "distribution_shift",
            Self::DistributionParam { .. } => "distribution_param",
        }
    }
}

/// Field name to operation.
pub type FieldOverrides = BTreeMap<String, OverrideOp>;
/// Entity id (or flow edge key) to field overrides.
pub type EntityOverrides = BTreeMap<String, FieldOverrides>;

/// An immutable, serializable set of overrides over a base trial.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ScenarioProfile {
    id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    description: Option<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    site_overrides: EntityOverrides,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    activity_overrides: EntityOverrides,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    resource_overrides: EntityOverrides,
    /// Keyed by edge ("from->to"), then field.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    flow_overrides: EntityOverrides,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    trial_overrides: FieldOverrides,
}

impl ScenarioProfile {
    /// Create an empty profile.
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            ..Self::default()
        }
    }

    /// Profile id.
    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Optional free-text description.
    #[must_use]
    pub fn description(&self) -> Option<&str> {
        self.description.as_deref()
    }

    /// Set the description, consuming `self`.
    #[must_use]
    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    /// Add a site override, consuming `self`.
    #[must_use]
    pub fn with_site_override(
        mut self,
        site_id: impl Into<String>,
        field: impl Into<String>,
        op: OverrideOp,
    ) -> Self {
        self.site_overrides
            .entry(site_id.into())
            .or_default()
            .insert(field.into(), op);
        self
    }

    /// Add an activity override, consuming `self`.
    #[must_use]
    pub fn with_activity_override(
        mut self,
        activity_id: impl Into<String>,
        field: impl Into<String>,
        op: OverrideOp,
    ) -> Self {
        self.activity_overrides
            .entry(activity_id.into())
            .or_default()
            .insert(field.into(), op);
        self
    }

    /// Add a resource override, consuming `self`.
    #[must_use]
    pub fn with_resource_override(
        mut self,
        resource_id: impl Into<String>,
        field: impl Into<String>,
        op: OverrideOp,
    ) -> Self {
        self.resource_overrides
            .entry(resource_id.into())
            .or_default()
            .insert(field.into(), op);
        self
    }

    /// Add a flow-edge override ("from->to"), consuming `self`.
    #[must_use]
    pub fn with_flow_override(
        mut self,
        edge_key: impl Into<String>,
        field: impl Into<String>,
        op: OverrideOp,
    ) -> Self {
        self.flow_overrides
            .entry(edge_key.into())
            .or_default()
            .insert(field.into(), op);
        self
    }

    /// Add a trial-level override, consuming `self`.
    #[must_use]
    pub fn with_trial_override(mut self, field: impl Into<String>, op: OverrideOp) -> Self {
        self.trial_overrides.insert(field.into(), op);
        self
    }

    /// Whether the profile contains no overrides at all.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.site_overrides.is_empty()
            && self.activity_overrides.is_empty()
            && self.resource_overrides.is_empty()
            && self.flow_overrides.is_empty()
            && self.trial_overrides.is_empty()
    }

    /// Flatten to "section/entity/field" keys for diffing and audit.
    fn flat(&self) -> BTreeMap<String, &OverrideOp> {
        let mut out = BTreeMap::new();
        for (section, overrides) in [
            ("site", &self.site_overrides),
            ("activity", &self.activity_overrides),
            ("resource", &self.resource_overrides),
            ("flow", &self.flow_overrides),
        ] {
            for (entity, fields) in overrides {
                for (field, op) in fields {
                    out.insert(format!("{section}/{entity}/{field}"), op);
                }
            }
        }
        for (field, op) in &self.trial_overrides {
            out.insert(format!("trial/{field}"), op);
        }
        out
    }
}

/// Merge two profiles; `b` wins on key collision, and the result's id
/// records lineage as `a+b`.
#[must_use]
pub fn compose_scenarios(a: &ScenarioProfile, b: &ScenarioProfile) -> ScenarioProfile {
    fn merge(into: &mut EntityOverrides, from: &EntityOverrides) {
        for (entity, fields) in from {
            let slot = into.entry(entity.clone()).or_default();
            for (field, op) in fields {
                slot.insert(field.clone(), op.clone());
            }
        }
    }

    let mut out = a.clone();
    out.id = format!("{}+{}", a.id, b.id);
    out.description = b.description.clone().or_else(|| a.description.clone());
    merge(&mut out.site_overrides, &b.site_overrides);
    merge(&mut out.activity_overrides, &b.activity_overrides);
    merge(&mut out.resource_overrides, &b.resource_overrides);
    merge(&mut out.flow_overrides, &b.flow_overrides);
    for (field, op) in &b.trial_overrides {
        out.trial_overrides.insert(field.clone(), op.clone());
    }
    out
}

/// Audit report of where two profiles differ.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ScenarioDiff {
    /// Override keys present only in the first profile.
    pub only_in_a: Vec<String>,
    /// Override keys present only in the second profile.
    pub only_in_b: Vec<String>,
    /// Keys present in both with different operations.
    pub conflicting: Vec<String>,
}

/// Symmetric difference of two profiles' override maps.
#[must_use]
pub fn diff_scenarios(a: &ScenarioProfile, b: &ScenarioProfile) -> ScenarioDiff {
    let flat_a = a.flat();
    let flat_b = b.flat();
    let mut diff = ScenarioDiff::default();
    for (key, op) in &flat_a {
        match flat_b.get(key) {
            None => diff.only_in_a.push(key.clone()),
            Some(other) if *other != *op => diff.conflicting.push(key.clone()),
            Some(_) => {}
        }
    }
    for key in flat_b.keys() {
        if !flat_a.contains_key(key) {
            diff.only_in_b.push(key.clone());
        }
    }
    diff
}

/// Apply a profile to a base trial, producing a new validated trial.
///
/// Pure: `base` is untouched, unoverridden entities are shared by
/// reference, touched entities are rebuilt with validation reapplied.
///
/// # Errors
///
/// Returns `UnknownOverrideTarget` for entities or fields the trial does
/// not have, `UnsupportedOverride` for family-incompatible operations,
/// `InvalidOverride` for wrong-kind payloads, and any construction error
/// the rebuilt entities raise.
pub fn apply_scenario(base: &Trial, scenario: &ScenarioProfile) -> SimResult<Trial> {
    for section in [
        (&scenario.site_overrides, "site", base.sites().iter().map(|s| s.id().to_string()).collect::<Vec<_>>()),
        (&scenario.activity_overrides, "activity", base.activities().iter().map(|a| a.id().to_string()).collect()),
        (&scenario.resource_overrides, "resource", base.resources().iter().map(|r| r.id().to_string()).collect()),
    ] {
        let (overrides, kind, known) = section;
        for entity in overrides.keys() {
            if !known.contains(entity) {
                return Err(SimError::UnknownOverrideTarget {
                    target: format!("{kind}/{entity}"),
                });
            }
        }
    }

    let target_enrollment = apply_trial_overrides(base, &scenario.trial_overrides)?;

    let sites = base
        .sites()
        .iter()
        .map(|site| match scenario.site_overrides.get(site.id()) {
            None => Ok(Arc::clone(site)),
            Some(fields) => rebuild_site(site, fields).map(Arc::new),
        })
        .collect::<SimResult<Vec<_>>>()?;

    let activities = base
        .activities()
        .iter()
        .map(|activity| match scenario.activity_overrides.get(activity.id()) {
            None => Ok(Arc::clone(activity)),
            Some(fields) => rebuild_activity(activity, fields).map(Arc::new),
        })
        .collect::<SimResult<Vec<_>>>()?;

    let resources = base
        .resources()
        .iter()
        .map(|resource| match scenario.resource_overrides.get(resource.id()) {
            None => Ok(Arc::clone(resource)),
            Some(fields) => rebuild_resource(resource, fields).map(Arc::new),
        })
        .collect::<SimResult<Vec<_>>>()?;

    let patient_flow = if scenario.flow_overrides.is_empty() {
        Arc::clone(base.patient_flow())
    } else {
        Arc::new(rebuild_flow(base.patient_flow(), &scenario.flow_overrides)?)
    };

    Trial::new(
        base.id(),
        target_enrollment,
        sites,
        patient_flow,
        activities,
        resources,
    )
}

fn apply_trial_overrides(base: &Trial, overrides: &FieldOverrides) -> SimResult<u32> {
    let mut target_enrollment = base.target_enrollment();
    for (field, op) in overrides {
        match field.as_str() {
            "target_enrollment" => {
                target_enrollment = direct_u32(op, "trial/target_enrollment")?;
            }
            other => {
                return Err(SimError::UnknownOverrideTarget {
                    target: format!("trial/{other}"),
                })
            }
        }
    }
    Ok(target_enrollment)
}

fn rebuild_site(site: &Site, fields: &FieldOverrides) -> SimResult<Site> {
    let mut activation_time = Arc::clone(site.activation_time());
    let mut enrollment_rate = Arc::clone(site.enrollment_rate());
    let mut dropout_rate = Arc::clone(site.dropout_rate());
    let mut max_capacity = site.max_capacity();

    for (field, op) in fields {
        let target = format!("site/{}/{field}", site.id());
        match field.as_str() {
            "activation_time" => activation_time = apply_distribution_op(&activation_time, op, &target)?,
            "enrollment_rate" => enrollment_rate = apply_distribution_op(&enrollment_rate, op, &target)?,
            "dropout_rate" => dropout_rate = apply_distribution_op(&dropout_rate, op, &target)?,
            "max_capacity" => max_capacity = direct_opt_u32(op, &target)?,
            _ => return Err(SimError::UnknownOverrideTarget { target }),
        }
    }
    Site::new(
        site.id(),
        activation_time,
        enrollment_rate,
        dropout_rate,
        max_capacity,
    )
}

fn rebuild_activity(activity: &Activity, fields: &FieldOverrides) -> SimResult<Activity> {
    let mut duration = Arc::clone(activity.duration());
    let mut success_probability = activity.success_probability().cloned();

    for (field, op) in fields {
        let target = format!("activity/{}/{field}", activity.id());
        match field.as_str() {
            "duration" => duration = apply_distribution_op(&duration, op, &target)?,
            "success_probability" => {
                success_probability = match (&success_probability, op) {
                    (_, OverrideOp::DistributionReplace { distribution }) => {
                        Some(Arc::new(distribution.clone()))
                    }
                    (Some(existing), _) => Some(apply_distribution_op(existing, op, &target)?),
                    (None, _) => {
                        return Err(SimError::invalid_override(
                            target,
                            "activity has no success_probability to modify; use distribution_replace",
                        ))
                    }
                };
            }
            _ => return Err(SimError::UnknownOverrideTarget { target }),
        }
    }
    Activity::new(
        activity.id(),
        duration,
        activity.dependencies().iter().cloned(),
        activity.required_resources().iter().cloned(),
        success_probability.map(|d| (*d).clone()),
    )
}

fn rebuild_resource(resource: &Resource, fields: &FieldOverrides) -> SimResult<Resource> {
    let mut capacity = resource.capacity();
    let mut availability = resource.availability().cloned();
    let mut utilization = resource.utilization().cloned();

    for (field, op) in fields {
        let target = format!("resource/{}/{field}", resource.id());
        match field.as_str() {
            "capacity" => capacity = direct_opt_u32(op, &target)?,
            "availability" => {
                availability = apply_optional_distribution_op(availability.as_ref(), op, &target)?;
            }
            "utilization" => {
                utilization = apply_optional_distribution_op(utilization.as_ref(), op, &target)?;
            }
            _ => return Err(SimError::UnknownOverrideTarget { target }),
        }
    }
    Resource::new(
        resource.id(),
        resource.kind(),
        capacity,
        availability.map(|d| (*d).clone()),
        utilization.map(|d| (*d).clone()),
    )
}

fn rebuild_flow(flow: &PatientFlow, overrides: &EntityOverrides) -> SimResult<PatientFlow> {
    let known: Vec<String> = flow.edges().iter().map(FlowEdge::key).collect();
    for edge_key in overrides.keys() {
        if !known.contains(edge_key) {
            return Err(SimError::UnknownOverrideTarget {
                target: format!("flow/{edge_key}"),
            });
        }
    }

    let edges = flow
        .edges()
        .iter()
        .map(|edge| match overrides.get(&edge.key()) {
            None => Ok(edge.clone()),
            Some(fields) => {
                let mut transition_time = Arc::clone(edge.transition_time());
                let mut transition_probability = Arc::clone(edge.transition_probability());
                for (field, op) in fields {
                    let target = format!("flow/{}/{field}", edge.key());
                    match field.as_str() {
                        "transition_time" => {
                            transition_time = apply_distribution_op(&transition_time, op, &target)?;
                        }
                        "transition_probability" => {
                            transition_probability =
                                apply_distribution_op(&transition_probability, op, &target)?;
                        }
                        _ => return Err(SimError::UnknownOverrideTarget { target }),
                    }
                }
                FlowEdge::new(edge.from(), edge.to(), transition_time, transition_probability)
            }
        })
        .collect::<SimResult<Vec<_>>>()?;

    PatientFlow::new(
        flow.id(),
        flow.states().iter().cloned(),
        flow.initial_state(),
        flow.terminal_states().iter().cloned(),
        edges,
    )
}

fn apply_optional_distribution_op(
    current: Option<&Arc<Distribution>>,
    op: &OverrideOp,
    target: &str,
) -> SimResult<Option<Arc<Distribution>>> {
    match (current, op) {
        (_, OverrideOp::DistributionReplace { distribution }) => {
            Ok(Some(Arc::new(distribution.clone())))
        }
        (Some(existing), _) => apply_distribution_op(existing, op, target).map(Some),
        (None, _) => Err(SimError::invalid_override(
            target,
            "field has no distribution to modify; use distribution_replace",
        )),
    }
}

/// Apply one distribution operation, returning a freshly validated value.
fn apply_distribution_op(
    current: &Arc<Distribution>,
    op: &OverrideOp,
    target: &str,
) -> SimResult<Arc<Distribution>> {
    let family = current.family_name();
    match op {
        OverrideOp::DirectValue { .. } => Err(SimError::invalid_override(
            target,
            "a raw value is never accepted where a distribution is required",
        )),
        OverrideOp::DistributionReplace { distribution } => Ok(Arc::new(distribution.clone())),
        OverrideOp::DistributionScale { factor } => {
            if !factor.is_finite() || *factor <= 0.0 {
                return Err(SimError::invalid_override(
                    target,
                    format!("scale factor must be > 0, got {factor}"),
                ));
            }
            let params = match current.params() {
                Params::Triangular { low, mode, high } => Params::Triangular {
                    low: low * factor,
                    mode: mode * factor,
                    high: high * factor,
                },
                Params::LogNormal { mean, cv } => Params::LogNormal {
                    mean: mean * factor,
                    cv,
                },
                Params::Gamma { shape, scale } => Params::Gamma {
                    shape,
                    scale: scale * factor,
                },
                Params::Bernoulli { .. } => {
                    return Err(SimError::UnsupportedOverride {
                        op: op.kind_name(),
                        family,
                        message: "bernoulli parameters are probabilities; scaling is undefined"
                            .to_string(),
                    })
                }
            };
            let bounds = current.bounds().map(|b| Bounds {
                min: b.min * factor,
                max: b.max * factor,
            });
            Distribution::from_parts(params, bounds).map(Arc::new)
        }
        OverrideOp::DistributionShift { offset } => {
            if !offset.is_finite() {
                return Err(SimError::invalid_override(
                    target,
                    format!("shift offset must be finite, got {offset}"),
                ));
            }
            let params = match current.params() {
                Params::Triangular { low, mode, high } => Params::Triangular {
                    low: low + offset,
                    mode: mode + offset,
                    high: high + offset,
                },
                Params::LogNormal { mean, cv } => Params::LogNormal {
                    mean: mean + offset,
                    cv,
                },
                Params::Gamma { .. } | Params::Bernoulli { .. } => {
                    return Err(SimError::UnsupportedOverride {
                        op: op.kind_name(),
                        family,
                        message: format!("additive shift is undefined for {family}"),
                    })
                }
            };
            let bounds = current.bounds().map(|b| Bounds {
                min: b.min + offset,
                max: b.max + offset,
            });
            Distribution::from_parts(params, bounds).map(Arc::new)
        }
        OverrideOp::DistributionParam { params } => {
            let mut next = current.params();
            for (name, value) in params {
                next = next.with_named(name, *value)?;
            }
            Distribution::from_parts(next, current.bounds()).map(Arc::new)
        }
    }
}

fn direct_u32(op: &OverrideOp, target: &str) -> SimResult<u32> {
    let OverrideOp::DirectValue { value } = op else {
        return Err(SimError::invalid_override(
            target,
            "field is a scalar; use direct_value",
        ));
    };
    value
        .as_u64()
        .and_then(|v| u32::try_from(v).ok())
        .ok_or_else(|| {
            SimError::invalid_override(target, format!("expected an unsigned integer, got {value}"))
        })
}

fn direct_opt_u32(op: &OverrideOp, target: &str) -> SimResult<Option<u32>> {
    let OverrideOp::DirectValue { value } = op else {
        return Err(SimError::invalid_override(
            target,
            "field is a scalar; use direct_value",
        ));
    };
    if value.is_null() {
        return Ok(None);
    }
    value
        .as_u64()
        .and_then(|v| u32::try_from(v).ok())
        .map(Some)
        .ok_or_else(|| {
            SimError::invalid_override(
                target,
                format!("expected an unsigned integer or null, got {value}"),
            )
        })
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::entities::tests::simple_trial;

    fn scale(factor: f64) -> OverrideOp {
        OverrideOp::DistributionScale { factor }
    }

    fn shift(offset: f64) -> OverrideOp {
        OverrideOp::DistributionShift { offset }
    }

    #[test]
    fn test_apply_is_pure_and_reuses_untouched_entities() {
        let base = simple_trial();
        let before = serde_json::to_string(&base).unwrap();

        let scenario = ScenarioProfile::new("slow-site-a")
            .with_site_override("site-a", "activation_time", scale(2.0));
        let derived = apply_scenario(&base, &scenario).unwrap();

        assert_eq!(serde_json::to_string(&base).unwrap(), before, "base untouched");
        // Touched site is a fresh entity; the other is shared by reference.
        assert!(!Arc::ptr_eq(
            base.site("site-a").unwrap(),
            derived.site("site-a").unwrap()
        ));
        assert!(Arc::ptr_eq(
            base.site("site-b").unwrap(),
            derived.site("site-b").unwrap()
        ));
        assert!(Arc::ptr_eq(base.patient_flow(), derived.patient_flow()));
    }

    #[test]
    fn test_scale_rules_per_family() {
        let base = simple_trial();
        let scenario = ScenarioProfile::new("s")
            .with_site_override("site-a", "activation_time", scale(2.0))
            .with_site_override("site-a", "enrollment_rate", scale(0.5));
        let derived = apply_scenario(&base, &scenario).unwrap();
        let site = derived.site("site-a").unwrap();

        // Triangular(30,45,90) scaled by 2 -> (60,90,180).
        assert_eq!(
            site.activation_time().params(),
            Params::Triangular {
                low: 60.0,
                mode: 90.0,
                high: 180.0
            }
        );
        // Gamma(4, 0.05) scales scale only.
        assert_eq!(
            site.enrollment_rate().params(),
            Params::Gamma {
                shape: 4.0,
                scale: 0.025
            }
        );
    }

    #[test]
    fn test_log_normal_scale_and_shift_touch_mean_only() {
        let base = Distribution::log_normal(10.0, 0.4).unwrap();
        let arc = Arc::new(base);
        let scaled = apply_distribution_op(&arc, &scale(3.0), "t").unwrap();
        assert_eq!(
            scaled.params(),
            Params::LogNormal {
                mean: 30.0,
                cv: 0.4
            }
        );
        let shifted = apply_distribution_op(&arc, &shift(5.0), "t").unwrap();
        assert_eq!(
            shifted.params(),
            Params::LogNormal {
                mean: 15.0,
                cv: 0.4
            }
        );
    }

    #[test]
    fn test_unsupported_overrides_fail_fast() {
        let bernoulli = Arc::new(Distribution::bernoulli(0.5).unwrap());
        let gamma = Arc::new(Distribution::gamma(2.0, 3.0).unwrap());

        assert!(matches!(
            apply_distribution_op(&bernoulli, &scale(2.0), "t"),
            Err(SimError::UnsupportedOverride { .. })
        ));
        assert!(matches!(
            apply_distribution_op(&bernoulli, &shift(0.1), "t"),
            Err(SimError::UnsupportedOverride { .. })
        ));
        assert!(matches!(
            apply_distribution_op(&gamma, &shift(1.0), "t"),
            Err(SimError::UnsupportedOverride { .. })
        ));
    }

    #[test]
    fn test_direct_value_on_distribution_field_rejected() {
        let base = simple_trial();
        let scenario = ScenarioProfile::new("bad").with_site_override(
            "site-a",
            "enrollment_rate",
            OverrideOp::DirectValue {
                value: serde_json::json!(0.3),
            },
        );
        assert!(matches!(
            apply_scenario(&base, &scenario),
            Err(SimError::InvalidOverride { .. })
        ));
    }

    #[test]
    fn test_unknown_targets_rejected() {
        let base = simple_trial();

        let scenario =
            ScenarioProfile::new("ghost-site").with_site_override("ghost", "dropout_rate", scale(2.0));
        assert!(matches!(
            apply_scenario(&base, &scenario),
            Err(SimError::UnknownOverrideTarget { .. })
        ));

        let scenario = ScenarioProfile::new("ghost-field").with_site_override(
            "site-a",
            "retention_rate",
            scale(2.0),
        );
        assert!(matches!(
            apply_scenario(&base, &scenario),
            Err(SimError::UnknownOverrideTarget { .. })
        ));

        let scenario = ScenarioProfile::new("ghost-trial-field").with_trial_override(
            "enrollment_target",
            OverrideOp::DirectValue {
                value: serde_json::json!(10),
            },
        );
        assert!(matches!(
            apply_scenario(&base, &scenario),
            Err(SimError::UnknownOverrideTarget { .. })
        ));
    }

    #[test]
    fn test_trial_and_scalar_overrides() {
        let base = simple_trial();
        let scenario = ScenarioProfile::new("bigger")
            .with_trial_override(
                "target_enrollment",
                OverrideOp::DirectValue {
                    value: serde_json::json!(120),
                },
            )
            .with_site_override(
                "site-a",
                "max_capacity",
                OverrideOp::DirectValue {
                    value: serde_json::Value::Null,
                },
            )
            .with_resource_override(
                "cra-team",
                "capacity",
                OverrideOp::DirectValue {
                    value: serde_json::json!(5),
                },
            );
        let derived = apply_scenario(&base, &scenario).unwrap();
        assert_eq!(derived.target_enrollment(), 120);
        assert_eq!(derived.site("site-a").unwrap().max_capacity(), None);
        assert_eq!(derived.resource("cra-team").unwrap().capacity(), Some(5));
    }

    #[test]
    fn test_distribution_param_override() {
        let base = simple_trial();
        let mut params = BTreeMap::new();
        params.insert("mode".to_string(), 60.0);
        let scenario = ScenarioProfile::new("late-mode").with_site_override(
            "site-a",
            "activation_time",
            OverrideOp::DistributionParam { params },
        );
        let derived = apply_scenario(&base, &scenario).unwrap();
        assert_eq!(
            derived.site("site-a").unwrap().activation_time().params(),
            Params::Triangular {
                low: 30.0,
                mode: 60.0,
                high: 90.0
            }
        );
    }

    #[test]
    fn test_invalid_rebuild_is_rejected() {
        let base = simple_trial();
        // Shifting activation_time down by 100 makes low negative but still
        // ordered, which is fine; shifting mode above high via param is not.
        let mut params = BTreeMap::new();
        params.insert("mode".to_string(), 500.0);
        let scenario = ScenarioProfile::new("broken").with_site_override(
            "site-a",
            "activation_time",
            OverrideOp::DistributionParam { params },
        );
        assert!(matches!(
            apply_scenario(&base, &scenario),
            Err(SimError::InvalidParameter { .. })
        ));
    }

    #[test]
    fn test_flow_override() {
        let base = simple_trial();
        let scenario = ScenarioProfile::new("slow-screening").with_flow_override(
            "screening->treatment",
            "transition_time",
            scale(2.0),
        );
        let derived = apply_scenario(&base, &scenario).unwrap();
        assert!(!Arc::ptr_eq(base.patient_flow(), derived.patient_flow()));

        let scenario = ScenarioProfile::new("ghost-edge").with_flow_override(
            "screening->void",
            "transition_time",
            scale(2.0),
        );
        assert!(matches!(
            apply_scenario(&base, &scenario),
            Err(SimError::UnknownOverrideTarget { .. })
        ));
    }

    #[test]
    fn test_compose_b_wins_and_records_lineage() {
        let a = ScenarioProfile::new("a")
            .with_site_override("site-a", "activation_time", scale(2.0))
            .with_site_override("site-b", "dropout_rate", scale(1.5));
        let b = ScenarioProfile::new("b").with_site_override("site-a", "activation_time", scale(3.0));

        let composed = compose_scenarios(&a, &b);
        assert_eq!(composed.id(), "a+b");
        assert_eq!(
            composed.site_overrides["site-a"]["activation_time"],
            scale(3.0),
            "b wins on collision"
        );
        assert!(composed.site_overrides.contains_key("site-b"));
    }

    #[test]
    fn test_diff_symmetric_difference() {
        let a = ScenarioProfile::new("a")
            .with_site_override("site-a", "activation_time", scale(2.0))
            .with_trial_override(
                "target_enrollment",
                OverrideOp::DirectValue {
                    value: serde_json::json!(10),
                },
            );
        let b = ScenarioProfile::new("b")
            .with_site_override("site-a", "activation_time", scale(3.0))
            .with_site_override("site-b", "dropout_rate", shift(1.0));

        let diff = diff_scenarios(&a, &b);
        assert_eq!(diff.only_in_a, vec!["trial/target_enrollment"]);
        assert_eq!(diff.only_in_b, vec!["site/site-b/dropout_rate"]);
        assert_eq!(diff.conflicting, vec!["site/site-a/activation_time"]);
    }

    #[test]
    fn test_profile_serde_round_trip() {
        let profile = ScenarioProfile::new("round-trip")
            .with_description("doubled activation, bigger target")
            .with_site_override("site-a", "activation_time", scale(2.0))
            .with_activity_override("irb-approval", "duration", shift(5.0))
            .with_flow_override("screening->treatment", "transition_time", scale(1.2))
            .with_trial_override(
                "target_enrollment",
                OverrideOp::DirectValue {
                    value: serde_json::json!(80),
                },
            );
        let json = serde_json::to_string_pretty(&profile).unwrap();
        let back: ScenarioProfile = serde_json::from_str(&json).unwrap();
        assert_eq!(profile, back);
    }

    #[test]
    fn test_repeated_application_is_identical() {
        let base = simple_trial();
        let scenario = ScenarioProfile::new("s")
            .with_site_override("site-a", "activation_time", scale(2.0));
        let once = apply_scenario(&base, &scenario).unwrap();
        let twice = apply_scenario(&base, &scenario).unwrap();
        assert_eq!(once, twice);
    }
}

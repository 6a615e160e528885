//! Provenance-preserving output schema.
//!
//! `EnhancedSimulationOutput` bundles everything needed to audit and
//! reproduce a batch: who ran it (provenance), exactly what went in (full
//! serialized trial, applied scenario, active constraints, and a flattened
//! per-entity distribution summary so "why this assumption?" is a single
//! lookup), and what came out (aggregates plus optional per-run detail).

use std::collections::BTreeMap;
use std::fs::File;
use std::io::{BufReader, BufWriter};
use std::path::Path;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::distribution::{Bounds, Distribution};
use crate::engine::{SimulationEngine, SimulationResults};
use crate::entities::Trial;
use crate::error::SimResult;
use crate::scenario::ScenarioProfile;

pub use crate::stats::PercentileSummary;

/// Metadata describing exactly how an output was produced.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProvenanceRecord {
    /// Unique id of this simulation batch.
    pub simulation_id: Uuid,
    /// Wall-clock time the output was assembled (UTC).
    pub timestamp: DateTime<Utc>,
    /// Version of this crate.
    pub software_version: String,
    /// Toolchain that built the binary.
    pub runtime_version: String,
    /// Git commit of the build, when known.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub git_hash: Option<String>,
    /// Number of runs executed.
    pub num_runs: u32,
    /// Master seed of the batch.
    pub master_seed: u64,
    /// Budget each run started with.
    pub initial_budget: f64,
    /// Wall-clock duration of the batch, in seconds.
    pub wall_clock_seconds: f64,
    /// Host the batch ran on, when known.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub host: Option<String>,
    /// User that ran the batch, when known.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user: Option<String>,
}

impl ProvenanceRecord {
    /// Capture provenance for a finished batch.
    #[must_use]
    pub fn capture(results: &SimulationResults) -> Self {
        Self {
            simulation_id: Uuid::new_v4(),
            timestamp: Utc::now(),
            software_version: env!("CARGO_PKG_VERSION").to_string(),
            runtime_version: option_env!("TRIALSIM_RUSTC_VERSION")
                .unwrap_or("unknown")
                .to_string(),
            git_hash: option_env!("TRIALSIM_GIT_HASH").map(str::to_string),
            num_runs: results.num_runs,
            master_seed: results.master_seed,
            initial_budget: results.initial_budget,
            wall_clock_seconds: results.elapsed_seconds,
            host: std::env::var("HOSTNAME").ok(),
            user: std::env::var("USER").ok(),
        }
    }
}

/// One flattened row of the distribution summary: the stochastic
/// assumption behind one entity field, promoted to the top level.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DistributionSummaryRow {
    /// Entity kind ("site", "activity", "resource", "flow_edge").
    pub entity_kind: String,
    /// Entity id or flow-edge key.
    pub entity_id: String,
    /// Field the distribution governs.
    pub field: String,
    /// Distribution family.
    pub family: String,
    /// Family parameters by name.
    pub parameters: BTreeMap<String, f64>,
    /// Declared sampling bounds, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bounds: Option<Bounds>,
}

impl DistributionSummaryRow {
    fn new(entity_kind: &str, entity_id: &str, field: &str, d: &Distribution) -> Self {
        Self {
            entity_kind: entity_kind.to_string(),
            entity_id: entity_id.to_string(),
            field: field.to_string(),
            family: d.family_name().to_string(),
            parameters: d
                .params()
                .to_map()
                .into_iter()
                .map(|(k, v)| (k.to_string(), v))
                .collect(),
            bounds: d.bounds(),
        }
    }
}

/// Everything that went into a batch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InputSpecification {
    /// The full trial specification, as simulated.
    pub trial: Trial,
    /// The scenario applied to produce that trial, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scenario: Option<ScenarioProfile>,
    /// Names of the active constraints.
    pub constraint_names: Vec<String>,
    /// Flattened per-entity distribution summary.
    pub distribution_summary: Vec<DistributionSummaryRow>,
    /// Deterministic (non-stochastic) inputs by dotted path.
    pub deterministic_fields: BTreeMap<String, serde_json::Value>,
}

impl InputSpecification {
    /// Assemble the input snapshot.
    #[must_use]
    pub fn build(
        trial: &Trial,
        scenario: Option<&ScenarioProfile>,
        constraint_names: Vec<String>,
    ) -> Self {
        let mut summary = Vec::new();
        for site in trial.sites() {
            let id = site.id();
            summary.push(DistributionSummaryRow::new(
                "site",
                id,
                "activation_time",
                site.activation_time(),
            ));
            summary.push(DistributionSummaryRow::new(
                "site",
                id,
                "enrollment_rate",
                site.enrollment_rate(),
            ));
            summary.push(DistributionSummaryRow::new(
                "site",
                id,
                "dropout_rate",
                site.dropout_rate(),
            ));
        }
        for activity in trial.activities() {
            summary.push(DistributionSummaryRow::new(
                "activity",
                activity.id(),
                "duration",
                activity.duration(),
            ));
            if let Some(success) = activity.success_probability() {
                summary.push(DistributionSummaryRow::new(
                    "activity",
                    activity.id(),
                    "success_probability",
                    success,
                ));
            }
        }
        for resource in trial.resources() {
            if let Some(availability) = resource.availability() {
                summary.push(DistributionSummaryRow::new(
                    "resource",
                    resource.id(),
                    "availability",
                    availability,
                ));
            }
            if let Some(utilization) = resource.utilization() {
                summary.push(DistributionSummaryRow::new(
                    "resource",
                    resource.id(),
                    "utilization",
                    utilization,
                ));
            }
        }
        for edge in trial.patient_flow().edges() {
            summary.push(DistributionSummaryRow::new(
                "flow_edge",
                &edge.key(),
                "transition_time",
                edge.transition_time(),
            ));
            summary.push(DistributionSummaryRow::new(
                "flow_edge",
                &edge.key(),
                "transition_probability",
                edge.transition_probability(),
            ));
        }

        let mut deterministic = BTreeMap::new();
        deterministic.insert(
            "trial/target_enrollment".to_string(),
            serde_json::json!(trial.target_enrollment()),
        );
        for site in trial.sites() {
            deterministic.insert(
                format!("site/{}/max_capacity", site.id()),
                serde_json::json!(site.max_capacity()),
            );
        }
        for resource in trial.resources() {
            deterministic.insert(
                format!("resource/{}/capacity", resource.id()),
                serde_json::json!(resource.capacity()),
            );
        }
        deterministic.insert(
            "flow/initial_state".to_string(),
            serde_json::json!(trial.patient_flow().initial_state()),
        );
        deterministic.insert(
            "flow/terminal_states".to_string(),
            serde_json::json!(trial.patient_flow().terminal_states()),
        );

        Self {
            trial: trial.clone(),
            scenario: scenario.cloned(),
            constraint_names,
            distribution_summary: summary,
            deterministic_fields: deterministic,
        }
    }
}

/// The complete persisted artifact: provenance + inputs + results.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnhancedSimulationOutput {
    /// How this output was produced.
    pub provenance: ProvenanceRecord,
    /// What went in.
    pub input_specification: InputSpecification,
    /// What came out; `runs` may be emptied on export to bound file size.
    pub results: SimulationResults,
}

impl EnhancedSimulationOutput {
    /// Bundle a finished batch with its inputs and fresh provenance.
    #[must_use]
    pub fn build(
        engine: &SimulationEngine,
        trial: &Trial,
        scenario: Option<&ScenarioProfile>,
        results: SimulationResults,
    ) -> Self {
        Self {
            provenance: ProvenanceRecord::capture(&results),
            input_specification: InputSpecification::build(
                trial,
                scenario,
                engine.constraint_names(),
            ),
            results,
        }
    }

    /// Write the output as JSON. With `include_single_runs = false` the
    /// per-run detail is omitted; everything else round-trips losslessly.
    ///
    /// # Errors
    ///
    /// Returns I/O or serialization errors.
    pub fn to_json<P: AsRef<Path>>(&self, path: P, include_single_runs: bool) -> SimResult<()> {
        let writer = BufWriter::new(File::create(path)?);
        if include_single_runs {
            serde_json::to_writer_pretty(writer, self)?;
        } else {
            let mut trimmed = self.clone();
            trimmed.results.runs = Vec::new();
            serde_json::to_writer_pretty(writer, &trimmed)?;
        }
        Ok(())
    }

    /// Read an output back from JSON.
    ///
    /// # Errors
    ///
    /// Returns I/O or deserialization errors (including re-validation
    /// failures in the embedded trial).
    pub fn from_json<P: AsRef<Path>>(path: P) -> SimResult<Self> {
        let reader = BufReader::new(File::open(path)?);
        Ok(serde_json::from_reader(reader)?)
    }
}

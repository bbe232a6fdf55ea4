//! Execution Log types (spec.md §3): append-only per-flow record.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepOutcome {
    pub index: usize,
    pub step_type: String,
    pub success: bool,
    pub skipped: bool,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct RepairRecord {
    pub sensor_id: String,
    pub old_bounds: String,
    pub new_bounds: String,
    pub drift_px: i32,
}

/// Result reported by a flow execution, whether run in-process (C6) or
/// relayed back from the Android companion app over MQTT (C7 Execution
/// Router's `android` path — the companion serializes this same shape).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionResult {
    pub execution_id: String,
    pub flow_id: String,
    pub started_at: String,
    pub finished_at: String,
    pub success: bool,
    pub steps: Vec<StepOutcome>,
    pub repairs: Vec<RepairRecord>,
    pub navigation_failures: Vec<String>,
    pub sensors_captured: usize,
    pub sensors_skipped: usize,
    /// True when the Execution Router's `auto` policy tried its preferred
    /// method first and fell back to the other one after a failure (spec.md
    /// §4.7.4).
    #[serde(default)]
    pub used_fallback: bool,
}

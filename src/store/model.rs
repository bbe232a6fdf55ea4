//! Persisted data model (spec.md §3): Sensor, Action, Flow/Flow Step, and
//! the template catalogs.

use crate::ui::Bounds;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Sensor {
    pub id: String,
    pub name: String,
    pub device_class: Option<String>,
    pub unit_of_measurement: Option<String>,
    /// How to locate and read the value: a Finder query plus an extraction
    /// rule (text/content-desc/attribute), matching spec.md's Sensor model.
    pub extraction: ExtractionRule,
    #[serde(default)]
    pub is_binary: bool,
    /// Bounds recorded the last time this sensor was successfully extracted
    /// by a non-stored-bounds method. Repair Mode compares against this to
    /// decide whether the stored location has drifted (spec.md §4.6.4).
    #[serde(default)]
    pub last_known_bounds: Option<Bounds>,
    /// Minimum time between captures; `None` means capture every time the
    /// containing flow step runs (spec.md §4.6.2 pre-analysis skip rule).
    #[serde(default)]
    pub interval_secs: Option<u64>,
    #[serde(default)]
    pub current_value: Option<String>,
    #[serde(default)]
    pub last_updated: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExtractionRule {
    pub resource_id: Option<String>,
    pub text_contains: Option<String>,
    pub class: Option<String>,
    /// Regex with one capture group applied to the matched element's text.
    pub pattern: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Action {
    pub id: String,
    pub name: String,
    pub resource_id: Option<String>,
    pub text: Option<String>,
    pub class: Option<String>,
}

/// Full step vocabulary (spec.md §4.6.1). Fields default-absent where the
/// original schema makes them optional so a minimal declarative flow JSON
/// stays terse.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum FlowStep {
    LaunchApp { package: String, expected_activity: Option<String> },
    RestartApp { package: String, expected_activity: Option<String> },
    Wait { ms: u64, poll_activity: Option<String>, timestamp_element: Option<String> },
    Tap {
        query_resource_id: Option<String>,
        query_text: Option<String>,
        x: Option<i32>,
        y: Option<i32>,
        navigation_intent: bool,
        expected_activity: Option<String>,
        #[serde(default)]
        retry_on_failure: bool,
        #[serde(default)]
        max_retries: u32,
    },
    Swipe {
        x1: i32,
        y1: i32,
        x2: i32,
        y2: i32,
        duration_ms: u64,
        #[serde(default)]
        retry_on_failure: bool,
        #[serde(default)]
        max_retries: u32,
    },
    Text {
        resource_id: Option<String>,
        text: String,
        #[serde(default)]
        retry_on_failure: bool,
        #[serde(default)]
        max_retries: u32,
    },
    Keyevent { key: String },
    GoHome,
    GoBack,
    PullRefresh {
        validate_timestamp: Option<String>,
        #[serde(default)]
        retry_on_failure: bool,
        #[serde(default)]
        max_retries: u32,
    },
    Screenshot,
    StitchCapture,
    CaptureSensors {
        sensor_ids: Vec<String>,
        screen_activity: Option<String>,
        #[serde(default)]
        retry_on_failure: bool,
        #[serde(default)]
        max_retries: u32,
    },
    ValidateScreen {
        expected_ui_elements: Vec<String>,
        ui_elements_required: usize,
        expected_activity: Option<String>,
        recovery_action: RecoveryAction,
        /// Overrides `Flow`-level screenshot-similarity acceptance threshold
        /// (spec.md §4.6.4a method 3) for this step only; `None` defers to
        /// `FlowConfig::state_match_threshold`.
        #[serde(default)]
        state_match_threshold: Option<f64>,
        #[serde(default)]
        expected_screenshot: Option<String>,
        #[serde(default)]
        retry_on_failure: bool,
        #[serde(default)]
        max_retries: u32,
    },
    ExecuteAction {
        action_id: String,
        #[serde(default)]
        retry_on_failure: bool,
        #[serde(default)]
        max_retries: u32,
    },
    Conditional { condition: String, then_steps: Vec<FlowStep>, #[serde(default)] false_steps: Vec<FlowStep> },
    Loop { loop_variable: String, iterations: u32, loop_steps: Vec<FlowStep> },
    SetVariable { variable_name: String, variable_value: String },
    Increment { variable_name: String, increment_by: f64 },
    BreakLoop,
    ContinueLoop,
    WakeScreen,
    SleepScreen,
    EnsureScreenOn,
}

impl FlowStep {
    /// Retry envelope (spec.md §4.6.4b): a step runs up to `max_retries`
    /// times in total when `retry_on_failure` is set; steps with no failure
    /// mode of their own report no retry budget.
    pub fn retry_budget(&self) -> (bool, u32) {
        match self {
            FlowStep::Tap { retry_on_failure, max_retries, .. }
            | FlowStep::Swipe { retry_on_failure, max_retries, .. }
            | FlowStep::Text { retry_on_failure, max_retries, .. }
            | FlowStep::PullRefresh { retry_on_failure, max_retries, .. }
            | FlowStep::CaptureSensors { retry_on_failure, max_retries, .. }
            | FlowStep::ValidateScreen { retry_on_failure, max_retries, .. }
            | FlowStep::ExecuteAction { retry_on_failure, max_retries, .. } => (*retry_on_failure, *max_retries),
            _ => (false, 0),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecoveryAction {
    ForceRestartApp,
    SkipStep,
    Fail,
}

fn default_enabled() -> bool {
    true
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Flow {
    pub id: String,
    pub name: String,
    pub package: Option<String>,
    pub steps: Vec<FlowStep>,
    #[serde(default)]
    pub aliases: Vec<String>,
    #[serde(default)]
    pub priority_band: u32,
    #[serde(default)]
    pub variables: HashMap<String, String>,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    /// `None` means on-demand only; `Some(n)` re-enqueues this flow every
    /// `n` seconds via the Flow Scheduler's periodic loop (spec.md §4.7.2).
    #[serde(default)]
    pub interval_secs: Option<u64>,
    /// Preferred Execution Router method; `None` defers to the scheduler's
    /// `auto` policy (spec.md §4.7.4).
    #[serde(default)]
    pub execution_method: Option<ExecutionMethod>,
    /// Whether the first failing step stops the flow (spec.md §7
    /// propagation policy). Defaults to the historical behavior.
    #[serde(default = "default_true")]
    pub stop_on_error: bool,
    /// Whole-flow retry budget on top of any per-step retry envelope;
    /// `None`/`0` means the flow runs once regardless of outcome.
    #[serde(default)]
    pub max_flow_retries: u32,
    /// Wake the screen before running (spec.md §4.6.3). Defaults on since
    /// most flows expect an awake screen.
    #[serde(default = "default_true")]
    pub auto_wake_before: bool,
    /// Exempts this flow's completion from the scheduler's "safe to lock"
    /// check (spec.md §4.6.3) — set false when a flow expects the screen
    /// to stay awake for a following companion-app interaction.
    #[serde(default = "default_true")]
    pub auto_sleep_after: bool,
    /// If true and `auto_wake_before` fails to bring the screen on, abort
    /// the flow immediately instead of attempting any step.
    #[serde(default)]
    pub verify_screen_on: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionMethod {
    Server,
    Android,
    Auto,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FlowTemplate {
    pub id: String,
    pub name: String,
    pub package: String,
    pub steps: Vec<FlowStep>,
}

/// Reusable sensor shape (e.g. "battery percentage text view") that a flow
/// author can instantiate per app without re-deriving the extraction rule.
/// Supplemented from the Python original's template catalog (SPEC_FULL A6).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SensorTemplate {
    pub id: String,
    pub name: String,
    pub device_class: Option<String>,
    pub unit_of_measurement: Option<String>,
    pub extraction: ExtractionRule,
}

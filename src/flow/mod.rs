//! C6 — Flow Executor.
//!
//! Interprets a flow's step list against a device connection: pre-analysis,
//! state validation/recovery, per-step-type dispatch, sensor capture, and
//! the unlock/navigation orchestration in spec.md §4.6. Grounded on the
//! teacher's `ActionExecutor::do_action` dispatch-by-string-tag shape
//! (`action/mod.rs`), generalized from a flat action vocabulary into a
//! step tree with loops/conditionals/variable substitution the teacher
//! never needed.

mod condition;
mod context;
mod result;

pub use context::{SessionSensorCache, VariableContext};
pub use result::{ExecutionResult, RepairRecord, StepOutcome};

use crate::config::FlowConfig;
use crate::device::{DeviceConnection, LockState};
use crate::error::{EngineError, LoopSignal, Result};
use crate::mqtt::{DiscoveryPayload, MqttBridge};
use crate::navigation::{screen_id, NavigationGraphs, Transition, TransitionAction};
use crate::store::{Flow, FlowStep, RecoveryAction, Sensor, Store};
use crate::ui::{compare_bounds, find_element, FindQuery};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

const WAIT_FOR_ACTIVITY_POLL_MS: u64 = 500;
const WAIT_FOR_ACTIVITY_MAX_POLLS: u32 = 16;
const UNLOCK_RETRY_DELAYS_SECS: [u64; 3] = [2, 3, 4];

pub struct FlowExecutor {
    device: Arc<DeviceConnection>,
    store: Arc<Store>,
    mqtt: Option<Arc<MqttBridge>>,
    navigation: Arc<NavigationGraphs>,
    config: FlowConfig,
    sdid: String,
    auto_unlock_pin: Option<String>,
}

struct RunState {
    ctx: VariableContext,
    sensor_cache: SessionSensorCache,
    steps: Vec<StepOutcome>,
    repairs: Vec<RepairRecord>,
    navigation_failures: Vec<String>,
    navigation_depth: u32,
    sensors_captured: usize,
    sensors_skipped: usize,
    pending_batch: Vec<(DiscoveryPayload, bool, String, String)>,
    package: String,
}

impl FlowExecutor {
    pub fn new(
        device: Arc<DeviceConnection>,
        store: Arc<Store>,
        mqtt: Option<Arc<MqttBridge>>,
        navigation: Arc<NavigationGraphs>,
        config: FlowConfig,
        sdid: String,
        auto_unlock_pin: Option<String>,
    ) -> Self {
        Self { device, store, mqtt, navigation, config, sdid, auto_unlock_pin }
    }

    /// `skip_navigation`: true when called from the Scheduler (the flow is
    /// assumed to have already navigated); false for a standalone
    /// `flow run ... --once` CLI invocation, which must perform full
    /// start-of-flow device preparation (Open Question decision, SPEC_FULL).
    pub async fn execute(&self, flow: &Flow, skip_navigation: bool) -> Result<ExecutionResult> {
        let execution_id = uuid::Uuid::new_v4().to_string();
        let started_at = chrono::Utc::now().to_rfc3339();
        info!(execution_id = %execution_id, flow_id = %flow.id, "starting flow execution");

        let mut state = RunState {
            ctx: VariableContext::default(),
            sensor_cache: SessionSensorCache::default(),
            steps: Vec::new(),
            repairs: Vec::new(),
            navigation_failures: Vec::new(),
            navigation_depth: 0,
            sensors_captured: 0,
            sensors_skipped: 0,
            pending_batch: Vec::new(),
            package: flow.package.clone().unwrap_or_default(),
        };

        if !skip_navigation {
            if let Err(e) = self.prepare_device(flow).await {
                warn!(error = %e, "start-of-flow preparation failed");
                return Ok(self.finish(&execution_id, &flow.id, &started_at, false, state));
            }
        }

        let skip_flags = compute_skippable(&flow.steps, &self.store_sensor_intervals(flow));
        let timeout_duration = dynamic_timeout(&flow.steps, self.config.default_flow_timeout_secs);
        let mut overall_success = true;

        let run_steps = async {
            for (idx, step) in flow.steps.iter().enumerate() {
                if skip_flags.get(idx).copied().unwrap_or(false) {
                    state.steps.push(StepOutcome { index: idx, step_type: step_name(step), success: true, skipped: true, error: None });
                    continue;
                }

                let (retry_on_failure, max_retries) = step.retry_budget();
                let mut attempt = 0u32;
                let outcome = loop {
                    match self.run_step(step, &mut state).await {
                        // A Break/Continue that escapes every enclosing `loop` step
                        // reaches here — malformed flow, not a step failure (spec.md
                        // §7). Treat it as a no-op and move on to the next step.
                        Err(EngineError::LoopControl(_)) => break Ok(()),
                        Ok(()) => break Ok(()),
                        Err(e) if retry_on_failure && attempt < max_retries => {
                            attempt += 1;
                            debug!(step = idx, attempt, max_retries, error = %e, "step failed, retrying");
                            continue;
                        }
                        Err(e) => break Err(e),
                    }
                };

                match outcome {
                    Ok(()) => {
                        state.steps.push(StepOutcome { index: idx, step_type: step_name(step), success: true, skipped: false, error: None });
                    }
                    Err(e) => {
                        warn!(step = idx, error = %e, "step failed");
                        state.steps.push(StepOutcome { index: idx, step_type: step_name(step), success: false, skipped: false, error: Some(e.to_string()) });
                        overall_success = false;
                        if flow.stop_on_error {
                            break;
                        }
                    }
                }
            }
        };

        if tokio::time::timeout(timeout_duration, run_steps).await.is_err() {
            warn!(execution_id = %execution_id, timeout_secs = timeout_duration.as_secs(), "flow execution exceeded its dynamic timeout");
            overall_success = false;
        }

        // Restore starting activity per backtrack-after navigation tracking.
        for _ in 0..state.navigation_depth {
            let _ = self.device.shell(&["input", "keyevent", "KEYCODE_BACK"]).await;
        }

        let finished = self.finish(&execution_id, &flow.id, &started_at, overall_success, state);
        Ok(finished)
    }

    fn finish(&self, execution_id: &str, flow_id: &str, started_at: &str, success: bool, state: RunState) -> ExecutionResult {
        ExecutionResult {
            execution_id: execution_id.to_string(),
            flow_id: flow_id.to_string(),
            started_at: started_at.to_string(),
            finished_at: chrono::Utc::now().to_rfc3339(),
            success,
            steps: state.steps,
            repairs: state.repairs,
            navigation_failures: state.navigation_failures,
            sensors_captured: state.sensors_captured,
            sensors_skipped: state.sensors_skipped,
            used_fallback: false,
        }
    }

    /// For each `capture_sensors` step, whether every one of its sensors has
    /// an interval that hasn't elapsed yet (spec.md §4.6.2). Sensors with no
    /// configured interval, or never captured before, are always due.
    fn store_sensor_intervals(&self, flow: &Flow) -> Vec<(Vec<String>, bool)> {
        let sensors = self.store.sensors(&self.sdid);
        let now = chrono::Utc::now();
        flow.steps
            .iter()
            .map(|step| match step {
                FlowStep::CaptureSensors { sensor_ids, .. } => {
                    let all_not_due = !sensor_ids.is_empty()
                        && sensor_ids.iter().all(|id| {
                            sensors.iter().find(|s| &s.id == id).is_some_and(|sensor| match (sensor.interval_secs, &sensor.last_updated) {
                                (Some(interval), Some(last)) => chrono::DateTime::parse_from_rfc3339(last)
                                    .map(|t| (now - t.with_timezone(&chrono::Utc)).num_seconds() < interval as i64)
                                    .unwrap_or(false),
                                _ => false,
                            })
                        });
                    (sensor_ids.clone(), all_not_due)
                }
                _ => (Vec::new(), false),
            })
            .collect()
    }

    // ---------------------------------------------------------------
    // §4.6.3 start-of-flow device preparation
    // ---------------------------------------------------------------

    async fn prepare_device(&self, flow: &Flow) -> Result<()> {
        if flow.auto_wake_before && !self.device.is_screen_on().await {
            self.wake_screen().await?;
        }
        if flow.verify_screen_on && !self.device.is_screen_on().await {
            return Err(EngineError::device_locked(&self.device.serial, "screen_not_on"));
        }
        self.auto_unlock_if_needed().await?;
        Ok(())
    }

    async fn wake_screen(&self) -> Result<()> {
        self.device.shell(&["input", "keyevent", "KEYCODE_WAKEUP"]).await?;
        tokio::time::sleep(Duration::from_millis(self.config.wake_timeout_ms.min(3000))).await;
        Ok(())
    }

    /// Public wrapper so the Scheduler can unlock a device ahead of a
    /// `server`-routed execution without re-running full device prep.
    pub async fn ensure_unlocked(&self) -> Result<()> {
        self.auto_unlock_if_needed().await
    }

    /// §4.6.6 unified unlock flow.
    async fn auto_unlock_if_needed(&self) -> Result<()> {
        let state = self.device.lock_state().await?;
        if state == LockState::Unlocked {
            return Ok(());
        }

        for (attempt, delay) in UNLOCK_RETRY_DELAYS_SECS.iter().enumerate() {
            let result = if let Some(pin) = &self.auto_unlock_pin {
                self.device.unlock_with_pin(pin).await
            } else {
                self.device.unlock_swipe(1080, 2400).await
            };
            if result.is_ok() {
                if self.device.lock_state().await? == LockState::Unlocked {
                    return Ok(());
                }
                // Samsung notification-shade intercept: first swipe only opened
                // the shade, try once more immediately.
                let _ = self.device.unlock_swipe(1080, 2400).await;
                if self.device.lock_state().await? == LockState::Unlocked {
                    return Ok(());
                }
            }
            debug!(attempt, "unlock attempt failed, retrying after delay");
            tokio::time::sleep(Duration::from_secs(*delay)).await;
        }
        Err(EngineError::device_locked(&self.device.serial, "unlock_failed"))
    }

    // ---------------------------------------------------------------
    // step dispatch
    // ---------------------------------------------------------------

    async fn run_step(&self, step: &FlowStep, state: &mut RunState) -> Result<()> {
        match step {
            FlowStep::LaunchApp { package, expected_activity } => self.step_launch_app(package, expected_activity.as_deref()).await,
            FlowStep::RestartApp { package, expected_activity } => {
                self.device.force_stop(package).await?;
                self.device.launch_app(package).await?;
                self.step_wait_for_activity(expected_activity.as_deref()).await
            }
            FlowStep::Wait { ms, poll_activity, timestamp_element } => {
                if let Some(activity) = poll_activity {
                    self.step_wait_for_activity(Some(activity)).await
                } else if let Some(elem) = timestamp_element {
                    self.step_wait_for_timestamp_change(elem, *ms).await
                } else {
                    tokio::time::sleep(Duration::from_millis(*ms)).await;
                    Ok(())
                }
            }
            FlowStep::Tap { query_resource_id, query_text, x, y, navigation_intent, expected_activity, .. } => {
                self.step_tap(query_resource_id.as_deref(), query_text.as_deref(), *x, *y, *navigation_intent, expected_activity.as_deref(), state)
                    .await
            }
            FlowStep::Swipe { x1, y1, x2, y2, duration_ms, .. } => self.device.swipe(*x1, *y1, *x2, *y2, *duration_ms).await,
            FlowStep::Text { resource_id: _, text, .. } => {
                let substituted = state.ctx.substitute(text, &state.sensor_cache);
                self.device.shell(&["input", "text", &substituted.replace(' ', "%s")]).await.map(|_| ())
            }
            FlowStep::Keyevent { key } => self.device.shell(&["input", "keyevent", key]).await.map(|_| ()),
            FlowStep::GoHome => self.device.shell(&["input", "keyevent", "KEYCODE_HOME"]).await.map(|_| ()),
            FlowStep::GoBack => self.device.shell(&["input", "keyevent", "KEYCODE_BACK"]).await.map(|_| ()),
            FlowStep::PullRefresh { validate_timestamp, .. } => {
                self.device.swipe(540, 600, 540, 1400, 300).await?;
                if let Some(elem) = validate_timestamp {
                    self.step_wait_for_timestamp_change(elem, 3000).await
                } else {
                    Ok(())
                }
            }
            FlowStep::Screenshot => self.device.screenshot(true).await.map(|_| ()),
            FlowStep::StitchCapture => self.device.screenshot(true).await.map(|_| ()),
            FlowStep::CaptureSensors { sensor_ids, screen_activity, .. } => self.step_capture_sensors(sensor_ids, screen_activity.as_deref(), state).await,
            FlowStep::ValidateScreen { expected_ui_elements, ui_elements_required, expected_activity, recovery_action, state_match_threshold, expected_screenshot, .. } => {
                self.step_validate_screen(
                    expected_ui_elements,
                    *ui_elements_required,
                    expected_activity.as_deref(),
                    recovery_action,
                    &state.package,
                    *state_match_threshold,
                    expected_screenshot.as_deref(),
                )
                .await
            }
            FlowStep::ExecuteAction { action_id, .. } => self.step_execute_action(action_id).await,
            FlowStep::Conditional { condition, then_steps, false_steps } => {
                let tree = self.device.ui_hierarchy(false).await?;
                let activity = self.current_activity().await?;
                let branch = if condition::evaluate(condition, &tree, &activity, &state.ctx) { then_steps } else { false_steps };
                for inner in branch {
                    // LoopSignal::Break/Continue raised anywhere in this branch —
                    // including nested inside a further conditional/loop — surfaces
                    // here as an `Err` and is propagated by `?` rather than caught,
                    // so it keeps bubbling until the nearest enclosing `Loop` arm.
                    Box::pin(self.run_step(inner, state)).await?;
                }
                Ok(())
            }
            FlowStep::Loop { loop_variable, iterations, loop_steps } => {
                'outer: for i in 0..(*iterations).min(100) {
                    state.ctx.set(loop_variable.clone(), i.to_string());
                    for inner in loop_steps {
                        match Box::pin(self.run_step(inner, state)).await {
                            Ok(()) => {}
                            Err(EngineError::LoopControl(LoopSignal::Break)) => break 'outer,
                            Err(EngineError::LoopControl(LoopSignal::Continue)) => continue 'outer,
                            Err(e) => return Err(e),
                        }
                    }
                }
                Ok(())
            }
            FlowStep::SetVariable { variable_name, variable_value } => {
                let substituted = state.ctx.substitute(variable_value, &state.sensor_cache);
                state.ctx.set(variable_name.clone(), substituted);
                Ok(())
            }
            FlowStep::Increment { variable_name, increment_by } => {
                let current: f64 = state.ctx.get(variable_name).and_then(|v| v.parse().ok()).unwrap_or(0.0);
                state.ctx.set(variable_name.clone(), (current + increment_by).to_string());
                Ok(())
            }
            FlowStep::BreakLoop => Err(EngineError::LoopControl(LoopSignal::Break)),
            FlowStep::ContinueLoop => Err(EngineError::LoopControl(LoopSignal::Continue)),
            FlowStep::WakeScreen => self.wake_screen().await,
            FlowStep::SleepScreen => self.device.shell(&["input", "keyevent", "KEYCODE_SLEEP"]).await.map(|_| ()),
            FlowStep::EnsureScreenOn => {
                if !self.device.is_screen_on().await {
                    self.wake_screen().await
                } else {
                    Ok(())
                }
            }
        }
    }

    async fn step_launch_app(&self, package: &str, expected_activity: Option<&str>) -> Result<()> {
        let current = self.current_activity().await.unwrap_or_default();
        if let Some(expected) = expected_activity {
            if current.contains(expected) {
                return Ok(()); // smart-check: already there
            }
        }
        self.device.force_stop(package).await?;
        self.device.launch_app(package).await?;
        self.step_wait_for_activity(expected_activity).await
    }

    async fn step_wait_for_activity(&self, expected: Option<&str>) -> Result<()> {
        let Some(expected) = expected else {
            tokio::time::sleep(Duration::from_millis(WAIT_FOR_ACTIVITY_POLL_MS)).await;
            return Ok(());
        };
        for _ in 0..WAIT_FOR_ACTIVITY_MAX_POLLS {
            if self.current_activity().await.unwrap_or_default().contains(expected) {
                return Ok(());
            }
            tokio::time::sleep(Duration::from_millis(WAIT_FOR_ACTIVITY_POLL_MS)).await;
        }
        Err(EngineError::StateMismatch { expected: expected.to_string(), actual: "activity never matched".into() })
    }

    async fn step_wait_for_timestamp_change(&self, element_query: &str, max_ms: u64) -> Result<()> {
        let before = self.read_text_by_resource_id(element_query).await.unwrap_or_default();
        let start = Instant::now();
        while start.elapsed() < Duration::from_millis(max_ms) {
            tokio::time::sleep(Duration::from_millis(300)).await;
            let after = self.read_text_by_resource_id(element_query).await.unwrap_or_default();
            if after != before && !after.is_empty() {
                return Ok(());
            }
        }
        Ok(()) // timestamp staleness is informational, not fatal
    }

    async fn read_text_by_resource_id(&self, resource_id: &str) -> Option<String> {
        let tree = self.device.ui_hierarchy(false).await.ok()?;
        let m = find_element(&tree, &FindQuery { resource_id: Some(resource_id.to_string()), ..Default::default() });
        m.element.map(|e| e.text)
    }

    async fn step_tap(
        &self,
        resource_id: Option<&str>,
        text: Option<&str>,
        x: Option<i32>,
        y: Option<i32>,
        navigation_intent: bool,
        expected_activity: Option<&str>,
        state: &mut RunState,
    ) -> Result<()> {
        let before_activity = self.current_activity().await.unwrap_or_default();

        if resource_id.is_some() || text.is_some() {
            let tree = self.device.ui_hierarchy(false).await?;
            let query = FindQuery { resource_id: resource_id.map(String::from), text: text.map(String::from), ..Default::default() };
            let m = find_element(&tree, &query);
            match m.element {
                Some(el) => {
                    let (cx, cy) = el.bounds.center();
                    self.device.tap(cx, cy).await?;
                }
                None => return Err(EngineError::element_not_found(m.message)),
            }
        } else if let (Some(x), Some(y)) = (x, y) {
            self.device.tap(x, y).await?;
        } else {
            return Err(EngineError::element_not_found("tap step has neither a query nor coordinates"));
        }

        if navigation_intent || expected_activity.is_some() {
            tokio::time::sleep(Duration::from_millis(400)).await;
            let after = self.current_activity().await.unwrap_or_default();
            if after == before_activity {
                // one re-tap attempt
                if let (Some(x), Some(y)) = (x, y) {
                    self.device.tap(x, y).await?;
                    tokio::time::sleep(Duration::from_millis(400)).await;
                }
                let after2 = self.current_activity().await.unwrap_or_default();
                if after2 == before_activity {
                    state.navigation_failures.push(format!("tap did not change activity from {}", before_activity));
                } else {
                    state.navigation_depth += 1;
                }
            } else {
                state.navigation_depth += 1;
            }
        }
        Ok(())
    }

    async fn step_validate_screen(
        &self,
        expected_ui_elements: &[String],
        ui_elements_required: usize,
        expected_activity: Option<&str>,
        recovery: &RecoveryAction,
        package: &str,
        state_match_threshold: Option<f64>,
        expected_screenshot: Option<&str>,
    ) -> Result<()> {
        let tree = self.device.ui_hierarchy(false).await?;
        let matches = expected_ui_elements.iter().filter(|want| tree.elements.iter().any(|e| &e.text == *want || &e.resource_id == *want)).count();
        if matches >= ui_elements_required {
            return Ok(());
        }

        if let Some(expected) = expected_activity {
            for _ in 0..3 {
                if self.current_activity().await.unwrap_or_default().contains(expected) {
                    return Ok(());
                }
                tokio::time::sleep(Duration::from_millis(300)).await;
            }
        }

        if let Some(reference_b64) = expected_screenshot {
            if self.step_validate_screenshot_similarity(reference_b64, state_match_threshold).await {
                return Ok(());
            }
        }

        match recovery {
            RecoveryAction::SkipStep => Ok(()),
            RecoveryAction::Fail => Err(EngineError::StateMismatch { expected: expected_activity.unwrap_or("").into(), actual: "validation failed".into() }),
            RecoveryAction::ForceRestartApp => {
                if let Some(expected) = expected_activity {
                    let current = screen_id(&self.current_activity().await.unwrap_or_default(), &[]);
                    let target = screen_id(expected, &[]);
                    if let Some(path) = self.navigation.route_or_via_home(package, &current, &target) {
                        for t in path {
                            self.apply_transition(&t).await?;
                        }
                        return Ok(());
                    }
                }
                Err(EngineError::StateMismatch { expected: "recovered".into(), actual: "no navigation path".into() })
            }
        }
    }

    /// Method 3 of the hybrid state-validation strategy (spec.md §4.6.4a):
    /// histogram-correlation screenshot similarity, RMS fallback when the
    /// reference can't be decoded. Accepted when the score is at least
    /// `state_match_threshold` (per-step override, else the flow config
    /// default).
    async fn step_validate_screenshot_similarity(&self, reference_b64: &str, threshold_override: Option<f64>) -> bool {
        use base64::{engine::general_purpose::STANDARD, Engine as _};

        let Ok(reference_bytes) = STANDARD.decode(reference_b64) else {
            return false;
        };
        let Ok(current_bytes) = self.device.screenshot(true).await else {
            return false;
        };
        let Some(score) = crate::ui::screenshot_similarity(&current_bytes, &reference_bytes) else {
            return false;
        };
        let threshold = threshold_override.unwrap_or(self.config.state_match_threshold as f64);
        debug!(score, threshold, "screenshot similarity validation");
        score >= threshold
    }

    async fn apply_transition(&self, t: &Transition) -> Result<()> {
        match t.action {
            TransitionAction::Tap { x, y } => self.device.tap(x, y).await,
            TransitionAction::Swipe { x1, y1, x2, y2 } => self.device.swipe(x1, y1, x2, y2, 300).await,
            TransitionAction::Keyevent => self.device.shell(&["input", "keyevent", "KEYCODE_BACK"]).await.map(|_| ()),
        }?;
        tokio::time::sleep(Duration::from_millis(500)).await;
        Ok(())
    }

    async fn step_execute_action(&self, action_id: &str) -> Result<()> {
        let actions = self.store.actions(&self.sdid);
        let action = actions
            .iter()
            .find(|a| a.id == action_id)
            .ok_or_else(|| EngineError::element_not_found(format!("action {} not found", action_id)))?;
        let tree = self.device.ui_hierarchy(false).await?;
        let query = FindQuery {
            resource_id: action.resource_id.clone(),
            text: action.text.clone(),
            class: action.class.clone(),
            ..Default::default()
        };
        let m = find_element(&tree, &query);
        match m.element {
            Some(el) => {
                let (cx, cy) = el.bounds.center();
                self.device.tap(cx, cy).await
            }
            None => Err(EngineError::element_not_found(format!("action {} target not found: {}", action_id, m.message))),
        }
    }

    // ---------------------------------------------------------------
    // §4.6.5 capture_sensors
    // ---------------------------------------------------------------

    async fn step_capture_sensors(&self, sensor_ids: &[String], screen_activity: Option<&str>, state: &mut RunState) -> Result<()> {
        if let Ok(LockState::NotificationShade) = self.device.lock_state().await {
            self.device.shell(&["input", "keyevent", "KEYCODE_BACK"]).await?;
        }

        if let Some(expected) = screen_activity {
            let mut matched = false;
            for _ in 0..16 {
                if self.current_activity().await.unwrap_or_default().contains(expected) {
                    matched = true;
                    break;
                }
                tokio::time::sleep(Duration::from_millis(500)).await;
            }
            if !matched {
                let current = self.current_activity().await.unwrap_or_default();
                return Err(EngineError::StateMismatch {
                    expected: expected.to_string(),
                    actual: format!("{} (possible causes: missing navigation step, or wait too short)", current),
                });
            }
        }

        let tree = self.device.ui_hierarchy(false).await?;
        let mut all_sensors = self.store.sensors(&self.sdid);
        let mut sensors_changed = false;

        let mut captured_ids = Vec::new();
        for sensor_id in sensor_ids {
            let Some(sensor_idx) = all_sensors.iter().position(|s| &s.id == sensor_id) else {
                debug!(sensor_id, "sensor not found in store, skipping");
                continue;
            };

            if let Some(cached) = state.sensor_cache.get(sensor_id) {
                state.pending_batch.push(discovery_for(&self.sdid, &state.package, &all_sensors[sensor_idx], cached.to_string()));
                continue;
            }

            let query = {
                let sensor = &all_sensors[sensor_idx];
                FindQuery {
                    resource_id: sensor.extraction.resource_id.clone(),
                    text: sensor.extraction.text_contains.clone(),
                    class: sensor.extraction.class.clone(),
                    bounds_near: sensor.last_known_bounds,
                    ..Default::default()
                }
            };
            let m = find_element(&tree, &query);
            let Some(el) = m.element else {
                debug!(sensor_id, "sensor element not found, skipping");
                continue;
            };

            let raw = extract_value(&el.text, all_sensors[sensor_idx].extraction.pattern.as_deref());
            state.sensor_cache.insert(sensor_id.clone(), raw.clone());
            state.ctx.set_last_extracted(raw.clone());
            all_sensors[sensor_idx].current_value = Some(raw.clone());
            all_sensors[sensor_idx].last_updated = Some(chrono::Utc::now().to_rfc3339());
            sensors_changed = true;

            // Repair Mode: only meaningful when we had a previously stored
            // location to drift against and this extraction didn't come from
            // a direct stored-path hit.
            if m.method != crate::ui::Method::PathMatch {
                if let Some(old_bounds) = all_sensors[sensor_idx].last_known_bounds {
                    let (similar, drift) = compare_bounds(&old_bounds, &el.bounds);
                    if !similar {
                        state.repairs.push(RepairRecord {
                            sensor_id: sensor_id.clone(),
                            old_bounds: format!("{:?}", old_bounds),
                            new_bounds: format!("{:?}", el.bounds),
                            drift_px: drift,
                        });
                        all_sensors[sensor_idx].last_known_bounds = Some(el.bounds);
                        sensors_changed = true;
                    }
                } else {
                    all_sensors[sensor_idx].last_known_bounds = Some(el.bounds);
                    sensors_changed = true;
                }
            }

            state.pending_batch.push(discovery_for(&self.sdid, &state.package, &all_sensors[sensor_idx], raw));
            captured_ids.push(sensor_id.clone());
        }

        if sensors_changed {
            if let Err(e) = self.store.save_sensors(&self.sdid, all_sensors) {
                warn!(error = %e, "failed to persist repaired sensor bounds");
            }
        }

        let skipped = sensor_ids.len() - captured_ids.len();
        state.sensors_captured += captured_ids.len();
        state.sensors_skipped += skipped;

        if let Some(mqtt) = &self.mqtt {
            if !state.pending_batch.is_empty() {
                mqtt.publish_batch(&self.sdid, &state.pending_batch).await.ok();
                state.pending_batch.clear();
            }
        }

        if captured_ids.is_empty() && skipped == sensor_ids.len() && !sensor_ids.is_empty() {
            // all interval-skipped counts as success per spec.md §4.6.5 step 8
            return Ok(());
        }
        if captured_ids.is_empty() && !sensor_ids.is_empty() {
            return Err(EngineError::Extraction { sensor_id: sensor_ids.join(","), message: "zero sensors captured".into() });
        }
        Ok(())
    }

    async fn current_activity(&self) -> Result<String> {
        let dump = self.device.shell(&["dumpsys", "activity", "activities"]).await?;
        for needle in ["mResumedActivity:", "topResumedActivity:"] {
            if let Some(line) = dump.lines().find(|l| l.contains(needle)) {
                return Ok(line.trim().to_string());
            }
        }
        Ok(String::new())
    }
}

fn discovery_for(sdid: &str, package: &str, sensor: &Sensor, value: String) -> (DiscoveryPayload, bool, String, String) {
    let state_class = if sensor.is_binary { None } else { Some("measurement".to_string()) };
    let payload = DiscoveryPayload::for_sensor(
        sdid,
        &sensor.id,
        &sensor.name,
        package,
        sensor.device_class.clone(),
        sensor.unit_of_measurement.clone(),
        state_class,
        None,
        None,
        None,
    );
    (payload, sensor.is_binary, value, chrono::Utc::now().to_rfc3339())
}

fn extract_value(text: &str, pattern: Option<&str>) -> String {
    let Some(pattern) = pattern else { return text.to_string() };
    regex::Regex::new(pattern)
        .ok()
        .and_then(|re| re.captures(text))
        .and_then(|c| c.get(1).map(|m| m.as_str().to_string()))
        .unwrap_or_else(|| text.to_string())
}

fn step_name(step: &FlowStep) -> String {
    format!("{:?}", step).split(|c| c == ' ' || c == '{').next().unwrap_or("unknown").to_string()
}

/// §4.6.2 pre-analysis: marks `capture_sensors` steps skippable when none of
/// their sensors are due, then walks backward marking `tap/swipe/wait`
/// steps skippable until a boundary step is reached.
fn compute_skippable(steps: &[FlowStep], interval_hints: &[(Vec<String>, bool)]) -> Vec<bool> {
    let mut skip = vec![false; steps.len()];
    for (idx, step) in steps.iter().enumerate() {
        if let FlowStep::CaptureSensors { .. } = step {
            let all_not_due = interval_hints.get(idx).map(|(_, b)| *b).unwrap_or(false);
            if all_not_due {
                skip[idx] = true;
                let mut j = idx;
                while j > 0 {
                    j -= 1;
                    match &steps[j] {
                        FlowStep::Tap { .. } | FlowStep::Swipe { .. } | FlowStep::Wait { .. } => skip[j] = true,
                        FlowStep::CaptureSensors { .. } | FlowStep::LaunchApp { .. } | FlowStep::RestartApp { .. } | FlowStep::GoHome => break,
                        _ => break,
                    }
                }
            }
        }
    }
    skip
}

/// §4.6.2 dynamic timeout: 30s base + 2s/navigation step + 5s/capture step +
/// 1s/sensor in capture steps + 5s/launch.
pub fn dynamic_timeout(steps: &[FlowStep], configured_timeout_secs: u64) -> Duration {
    let mut total = 30u64;
    for step in steps {
        match step {
            FlowStep::Tap { navigation_intent: true, .. } => total += 2,
            FlowStep::CaptureSensors { sensor_ids, .. } => total += 5 + sensor_ids.len() as u64,
            FlowStep::LaunchApp { .. } | FlowStep::RestartApp { .. } => total += 5,
            _ => {}
        }
    }
    Duration::from_secs(total.max(configured_timeout_secs))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dynamic_timeout_accounts_for_capture_and_launch_steps() {
        let steps = vec![
            FlowStep::LaunchApp { package: "com.x".into(), expected_activity: None },
            FlowStep::CaptureSensors { sensor_ids: vec!["a".into(), "b".into()], screen_activity: None, retry_on_failure: false, max_retries: 0 },
        ];
        let timeout = dynamic_timeout(&steps, 30);
        assert_eq!(timeout.as_secs(), 30 + 5 + 5 + 2);
    }

    #[test]
    fn skippable_walks_backward_to_boundary() {
        let steps = vec![
            FlowStep::LaunchApp { package: "com.x".into(), expected_activity: None },
            FlowStep::Tap {
                query_resource_id: None,
                query_text: None,
                x: Some(1),
                y: Some(1),
                navigation_intent: false,
                expected_activity: None,
                retry_on_failure: false,
                max_retries: 0,
            },
            FlowStep::Wait { ms: 500, poll_activity: None, timestamp_element: None },
            FlowStep::CaptureSensors { sensor_ids: vec!["a".into()], screen_activity: None, retry_on_failure: false, max_retries: 0 },
        ];
        let hints = vec![(vec![], false), (vec![], false), (vec![], false), (vec!["a".into()], true)];
        let skip = compute_skippable(&steps, &hints);
        assert_eq!(skip, vec![false, true, true, true]);
    }

    #[test]
    fn zero_step_flow_has_nothing_skippable() {
        let skip = compute_skippable(&[], &[]);
        assert!(skip.is_empty());
    }
}

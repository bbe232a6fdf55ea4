//! C4 — Sensor/Action/Flow Store.
//!
//! Per-device JSON persistence keyed by Stable Device ID. Grounded on the
//! teacher's `soul::Soul::write_file` (write-whole-file-to-disk) and
//! `workflow::save_goal_as_workflow`/`list_workflows` (JSON-on-disk
//! catalogs), generalized with atomic tmp+rename writes and an in-memory
//! cache-through layer (neither of which the teacher needed).

mod model;

pub use model::{Action, ExecutionMethod, Flow, FlowStep, FlowTemplate, Sensor, SensorTemplate};

use crate::identity::sanitize_for_filename;
use dashmap::DashMap;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// One JSON-backed collection, e.g. all sensors for one device, or the
/// shared flow-template catalog. `T` must round-trip through `serde_json`.
struct JsonFile<T> {
    path: PathBuf,
    cache: parking_lot::RwLock<Option<T>>,
}

impl<T> JsonFile<T>
where
    T: Clone + Default + serde::Serialize + serde::de::DeserializeOwned,
{
    fn new(path: PathBuf) -> Self {
        Self { path, cache: parking_lot::RwLock::new(None) }
    }

    fn read(&self) -> T {
        if let Some(cached) = self.cache.read().clone() {
            return cached;
        }
        let value = std::fs::read_to_string(&self.path)
            .ok()
            .and_then(|raw| serde_json::from_str(&raw).ok())
            .unwrap_or_default();
        *self.cache.write() = Some(value.clone());
        value
    }

    /// Writes via a same-directory temp file + rename so a crash mid-write
    /// never leaves a truncated/corrupt file in place (spec.md §6).
    fn write(&self, value: &T) -> anyhow::Result<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let json = serde_json::to_string_pretty(value)?;
        let tmp = self.path.with_extension("json.tmp");
        std::fs::write(&tmp, json)?;
        std::fs::rename(&tmp, &self.path)?;
        *self.cache.write() = Some(value.clone());
        Ok(())
    }
}

/// Top-level store. One `sensors_{sdid}.json` / `actions_{sdid}.json` /
/// `flows_{sdid}.json` per device, plus shared `flow_templates.json`,
/// `bundled_app_flows.json`, and `sensor_templates.json` catalogs
/// (spec.md §6 persisted file layout).
pub struct Store {
    data_dir: PathBuf,
    sensors: DashMap<String, JsonFile<Vec<Sensor>>>,
    actions: DashMap<String, JsonFile<Vec<Action>>>,
    flows: DashMap<String, JsonFile<Vec<Flow>>>,
    flow_templates: JsonFile<Vec<FlowTemplate>>,
    bundled_app_flows: JsonFile<Vec<FlowTemplate>>,
    sensor_templates: JsonFile<Vec<SensorTemplate>>,
}

impl Store {
    pub fn new(data_dir: impl AsRef<Path>) -> Self {
        let data_dir = data_dir.as_ref().to_path_buf();
        Self {
            flow_templates: JsonFile::new(data_dir.join("flow_templates.json")),
            bundled_app_flows: JsonFile::new(data_dir.join("bundled_app_flows.json")),
            sensor_templates: JsonFile::new(data_dir.join("sensor_templates.json")),
            data_dir,
            sensors: DashMap::new(),
            actions: DashMap::new(),
            flows: DashMap::new(),
        }
    }

    fn device_path(&self, kind: &str, sdid: &str) -> PathBuf {
        self.data_dir.join(format!("{}_{}.json", kind, sanitize_for_filename(sdid)))
    }

    pub fn sensors(&self, sdid: &str) -> Vec<Sensor> {
        self.sensors
            .entry(sdid.to_string())
            .or_insert_with(|| JsonFile::new(self.device_path("sensors", sdid)))
            .read()
    }

    pub fn save_sensors(&self, sdid: &str, sensors: Vec<Sensor>) -> anyhow::Result<()> {
        self.sensors
            .entry(sdid.to_string())
            .or_insert_with(|| JsonFile::new(self.device_path("sensors", sdid)))
            .write(&sensors)
    }

    pub fn actions(&self, sdid: &str) -> Vec<Action> {
        self.actions
            .entry(sdid.to_string())
            .or_insert_with(|| JsonFile::new(self.device_path("actions", sdid)))
            .read()
    }

    pub fn save_actions(&self, sdid: &str, actions: Vec<Action>) -> anyhow::Result<()> {
        self.actions
            .entry(sdid.to_string())
            .or_insert_with(|| JsonFile::new(self.device_path("actions", sdid)))
            .write(&actions)
    }

    pub fn flows(&self, sdid: &str) -> Vec<Flow> {
        self.flows
            .entry(sdid.to_string())
            .or_insert_with(|| JsonFile::new(self.device_path("flows", sdid)))
            .read()
    }

    pub fn save_flows(&self, sdid: &str, flows: Vec<Flow>) -> anyhow::Result<()> {
        self.flows
            .entry(sdid.to_string())
            .or_insert_with(|| JsonFile::new(self.device_path("flows", sdid)))
            .write(&flows)
    }

    pub fn flow(&self, sdid: &str, flow_id: &str) -> Option<Flow> {
        self.flows(sdid).into_iter().find(|f| f.id == flow_id)
    }

    pub fn flow_templates(&self) -> Vec<FlowTemplate> {
        self.flow_templates.read()
    }

    pub fn bundled_app_flows(&self) -> Vec<FlowTemplate> {
        self.bundled_app_flows.read()
    }

    pub fn sensor_templates(&self) -> Vec<SensorTemplate> {
        self.sensor_templates.read()
    }

    /// Deep-copies a catalog flow (user template or bundled app flow) into a
    /// new per-device flow with a fresh id, the device's defaults for the
    /// fields the catalog doesn't carry (spec.md §4.4 template instantiation).
    /// Looks in `flow_templates` first, then `bundled_app_flows`.
    pub fn install_flow_template(&self, sdid: &str, template_id: &str) -> anyhow::Result<Flow> {
        let template = self
            .flow_templates()
            .into_iter()
            .chain(self.bundled_app_flows())
            .find(|t| t.id == template_id)
            .ok_or_else(|| anyhow::anyhow!("no flow template with id {template_id}"))?;

        let flow = Flow {
            id: uuid::Uuid::new_v4().to_string(),
            name: template.name,
            package: Some(template.package),
            steps: template.steps,
            aliases: Vec::new(),
            priority_band: 0,
            variables: Default::default(),
            enabled: true,
            interval_secs: None,
            execution_method: None,
            stop_on_error: true,
            max_flow_retries: 0,
            auto_wake_before: true,
            auto_sleep_after: true,
            verify_screen_on: false,
        };

        let mut flows = self.flows(sdid);
        flows.push(flow.clone());
        self.save_flows(sdid, flows)?;
        Ok(flow)
    }

    /// Deep-copies a sensor template into a new per-device sensor, unbound
    /// from any stored UI location until the next capture resolves it
    /// (spec.md §4.4).
    pub fn install_sensor_template(&self, sdid: &str, template_id: &str) -> anyhow::Result<Sensor> {
        let template = self
            .sensor_templates()
            .into_iter()
            .find(|t| t.id == template_id)
            .ok_or_else(|| anyhow::anyhow!("no sensor template with id {template_id}"))?;

        let sensor = Sensor {
            id: uuid::Uuid::new_v4().to_string(),
            name: template.name,
            device_class: template.device_class,
            unit_of_measurement: template.unit_of_measurement,
            is_binary: false,
            extraction: template.extraction,
            last_known_bounds: None,
            current_value: None,
            last_updated: None,
            interval_secs: None,
        };

        let mut sensors = self.sensors(sdid);
        sensors.push(sensor.clone());
        self.save_sensors(sdid, sensors)?;
        Ok(sensor)
    }

    /// Merges flows sharing an identical step sequence into one flow with
    /// multiple trigger ids, behind `scheduler.consolidate_flows` (SPEC_FULL
    /// supplemented feature, carried over from the Python original's flow
    /// dedup pass that the distilled spec dropped). Returns the number of
    /// flows removed.
    pub fn consolidate_flows(&self, sdid: &str) -> anyhow::Result<usize> {
        let flows = self.flows(sdid);
        let mut kept: Vec<Flow> = Vec::new();
        let mut removed = 0usize;
        'outer: for flow in flows {
            for existing in kept.iter_mut() {
                if existing.steps == flow.steps {
                    existing.aliases.push(flow.id.clone());
                    removed += 1;
                    continue 'outer;
                }
            }
            kept.push(flow);
        }
        if removed > 0 {
            debug!(sdid, removed, "consolidated duplicate flows");
            self.save_flows(sdid, kept)?;
        } else {
            warn!(sdid, "consolidate_flows found nothing to merge");
        }
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::model::ExtractionRule;

    fn sample_flow(id: &str, steps: Vec<FlowStep>) -> Flow {
        Flow {
            id: id.to_string(),
            name: id.to_string(),
            package: None,
            steps,
            aliases: Vec::new(),
            priority_band: 0,
            variables: HashMap::new(),
            enabled: true,
            interval_secs: None,
            execution_method: None,
            stop_on_error: true,
            max_flow_retries: 0,
            auto_wake_before: true,
            auto_sleep_after: true,
            verify_screen_on: false,
        }
    }

    #[test]
    fn save_then_read_round_trips_and_survives_a_fresh_store_instance() {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::new(dir.path());
        let flow = sample_flow("f1", vec![FlowStep::GoHome]);
        store.save_flows("dev-1", vec![flow.clone()]).unwrap();

        // a brand new Store has no in-memory cache, so this only passes if
        // the write actually landed on disk under the expected filename.
        let reloaded = Store::new(dir.path());
        assert_eq!(reloaded.flows("dev-1"), vec![flow]);
    }

    #[test]
    fn write_leaves_no_tmp_file_behind_on_success() {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::new(dir.path());
        store.save_sensors("dev-1", Vec::new()).unwrap();
        let tmp = dir.path().join(format!("sensors_{}.json.tmp", sanitize_for_filename("dev-1")));
        assert!(!tmp.exists());
    }

    #[test]
    fn consolidate_flows_merges_identical_step_sequences_into_aliases() {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::new(dir.path());
        let steps = vec![FlowStep::GoHome, FlowStep::GoBack];
        store
            .save_flows("dev-1", vec![sample_flow("a", steps.clone()), sample_flow("b", steps.clone()), sample_flow("c", vec![FlowStep::GoHome])])
            .unwrap();

        let removed = store.consolidate_flows("dev-1").unwrap();
        assert_eq!(removed, 1);

        let flows = store.flows("dev-1");
        assert_eq!(flows.len(), 2);
        let merged = flows.iter().find(|f| f.id == "a").unwrap();
        assert_eq!(merged.aliases, vec!["b".to_string()]);
    }

    #[test]
    fn consolidate_flows_is_a_noop_when_nothing_matches() {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::new(dir.path());
        store
            .save_flows("dev-1", vec![sample_flow("a", vec![FlowStep::GoHome]), sample_flow("b", vec![FlowStep::GoBack])])
            .unwrap();

        assert_eq!(store.consolidate_flows("dev-1").unwrap(), 0);
        assert_eq!(store.flows("dev-1").len(), 2);
    }

    #[test]
    fn flow_lookup_finds_by_id_and_is_none_for_unknown_id() {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::new(dir.path());
        store.save_flows("dev-1", vec![sample_flow("a", vec![FlowStep::GoHome])]).unwrap();

        assert!(store.flow("dev-1", "a").is_some());
        assert!(store.flow("dev-1", "missing").is_none());
    }

    #[test]
    fn sensor_round_trips_extraction_rule_and_repair_fields() {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::new(dir.path());
        let sensor = Sensor {
            id: "s1".into(),
            name: "Battery".into(),
            device_class: Some("battery".into()),
            unit_of_measurement: Some("%".into()),
            extraction: ExtractionRule { resource_id: Some("battery_text".into()), text_contains: None, class: None, pattern: Some(r"(\d+)%".into()) },
            is_binary: false,
            last_known_bounds: None,
            interval_secs: Some(60),
            current_value: Some("42".into()),
            last_updated: Some("2026-07-28T00:00:00Z".into()),
        };
        store.save_sensors("dev-1", vec![sensor.clone()]).unwrap();
        assert_eq!(store.sensors("dev-1"), vec![sensor]);
    }

    #[test]
    fn unknown_device_returns_empty_collections_rather_than_erroring() {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::new(dir.path());
        assert!(store.sensors("never-seen").is_empty());
        assert!(store.actions("never-seen").is_empty());
        assert!(store.flows("never-seen").is_empty());
    }

    #[test]
    fn execution_method_round_trips_through_json() {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::new(dir.path());
        let mut flow = sample_flow("a", vec![FlowStep::GoHome]);
        flow.execution_method = Some(ExecutionMethod::Android);
        store.save_flows("dev-1", vec![flow]).unwrap();

        let reloaded = Store::new(dir.path());
        assert_eq!(reloaded.flows("dev-1")[0].execution_method, Some(ExecutionMethod::Android));
    }
}

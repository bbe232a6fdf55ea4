use serde::Deserialize;
use std::collections::HashMap;
use std::path::Path;

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub agent: AgentConfig,
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub mqtt: MqttConfig,
    #[serde(default)]
    pub adb: AdbConfig,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub flow: FlowConfig,
    #[serde(default)]
    pub devices: HashMap<String, DeviceAlias>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AgentConfig {
    #[serde(default = "default_name")]
    pub name: String,
    #[serde(default = "default_data_dir")]
    pub data_dir: String,
}

fn default_name() -> String { "sensorbridge".into() }
fn default_data_dir() -> String { "./data".into() }

impl Default for AgentConfig {
    fn default() -> Self {
        Self { name: default_name(), data_dir: default_data_dir() }
    }
}

/// Status-endpoint placeholder is deliberately absent here — no HTTP API
/// surface per spec.md §1 Non-goals. This section only configures the
/// on-disk PID file the `status` CLI subcommand reads.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_pid_file")]
    pub pid_file: String,
}

fn default_pid_file() -> String { "./data/sensorbridge.pid".into() }

impl Default for ServerConfig {
    fn default() -> Self {
        Self { pid_file: default_pid_file() }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct MqttConfig {
    #[serde(default = "default_broker")]
    pub broker: String,
    #[serde(default = "default_mqtt_port")]
    pub port: u16,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
    #[serde(default = "default_discovery_prefix")]
    pub discovery_prefix: String,
    #[serde(default)]
    pub use_ssl: bool,
    #[serde(default)]
    pub tls_insecure: bool,
    #[serde(default)]
    pub ca_cert: Option<String>,
    #[serde(default = "default_client_id")]
    pub client_id: String,
}

fn default_broker() -> String { "localhost".into() }
fn default_mqtt_port() -> u16 { 1883 }
fn default_discovery_prefix() -> String { "homeassistant".into() }
fn default_client_id() -> String { "sensorbridge".into() }

impl Default for MqttConfig {
    fn default() -> Self {
        Self {
            broker: default_broker(),
            port: default_mqtt_port(),
            username: None,
            password: None,
            discovery_prefix: default_discovery_prefix(),
            use_ssl: false,
            tls_insecure: false,
            ca_cert: None,
            client_id: default_client_id(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct AdbConfig {
    #[serde(default = "default_true")]
    pub persistent_shell: bool,
    #[serde(default)]
    pub native_backend: bool,
    #[serde(default = "default_screenshot_ttl_ms")]
    pub screenshot_cache_ttl_ms: u64,
    #[serde(default = "default_ui_ttl_ms")]
    pub ui_dump_cache_ttl_ms: u64,
    #[serde(default = "default_probe_interval")]
    pub backend_probe_interval_ops: u32,
    #[serde(default = "default_max_unlock_attempts")]
    pub max_unlock_attempts: u32,
    #[serde(default = "default_unlock_cooldown_secs")]
    pub unlock_cooldown_secs: u64,
}

fn default_true() -> bool { true }
fn default_screenshot_ttl_ms() -> u64 { 250 }
fn default_ui_ttl_ms() -> u64 { 1000 }
fn default_probe_interval() -> u32 { 50 }
fn default_max_unlock_attempts() -> u32 { 3 }
fn default_unlock_cooldown_secs() -> u64 { 300 }

impl Default for AdbConfig {
    fn default() -> Self {
        Self {
            persistent_shell: true,
            native_backend: false,
            screenshot_cache_ttl_ms: default_screenshot_ttl_ms(),
            ui_dump_cache_ttl_ms: default_ui_ttl_ms(),
            backend_probe_interval_ops: default_probe_interval(),
            max_unlock_attempts: default_max_unlock_attempts(),
            unlock_cooldown_secs: default_unlock_cooldown_secs(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct SchedulerConfig {
    #[serde(default = "default_sleep_grace_secs")]
    pub sleep_grace_period_secs: u64,
    #[serde(default)]
    pub consolidate_flows: bool,
    #[serde(default = "default_unlock_debounce_secs")]
    pub unlock_debounce_secs: u64,
    #[serde(default = "default_activity_ring_size")]
    pub activity_ring_size: usize,
}

fn default_sleep_grace_secs() -> u64 { 300 }
fn default_unlock_debounce_secs() -> u64 { 5 }
fn default_activity_ring_size() -> usize { 100 }

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            sleep_grace_period_secs: default_sleep_grace_secs(),
            consolidate_flows: false,
            unlock_debounce_secs: default_unlock_debounce_secs(),
            activity_ring_size: default_activity_ring_size(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct FlowConfig {
    #[serde(default = "default_state_match_threshold")]
    pub state_match_threshold: f32,
    #[serde(default = "default_flow_timeout_secs")]
    pub default_flow_timeout_secs: u64,
    #[serde(default = "default_wake_timeout_ms")]
    pub wake_timeout_ms: u64,
}

fn default_state_match_threshold() -> f32 { 0.80 }
fn default_flow_timeout_secs() -> u64 { 30 }
fn default_wake_timeout_ms() -> u64 { 3000 }

impl Default for FlowConfig {
    fn default() -> Self {
        Self {
            state_match_threshold: default_state_match_threshold(),
            default_flow_timeout_secs: default_flow_timeout_secs(),
            wake_timeout_ms: default_wake_timeout_ms(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct DeviceAlias {
    /// Connection-ID hint (host:port or serial) used at startup to seed the
    /// identity registry before the device has ever been seen.
    pub cid_hint: String,
    #[serde(default)]
    pub auto_unlock_pin: Option<String>,
}

impl Config {
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let mut config: Config = toml::from_str(&content)?;
        config.apply_env_overrides();
        Ok(config)
    }

    /// Environment variables always win over file values (spec.md §6).
    fn apply_env_overrides(&mut self) {
        if let Ok(v) = std::env::var("DATA_DIR") {
            self.agent.data_dir = v;
        }
        if let Ok(v) = std::env::var("MQTT_BROKER") {
            self.mqtt.broker = v;
        }
        if let Ok(v) = std::env::var("MQTT_PORT") {
            if let Ok(p) = v.parse() {
                self.mqtt.port = p;
            }
        }
        if let Ok(v) = std::env::var("MQTT_USERNAME") {
            self.mqtt.username = Some(v);
        }
        if let Ok(v) = std::env::var("MQTT_PASSWORD") {
            self.mqtt.password = Some(v);
        }
        if let Ok(v) = std::env::var("MQTT_DISCOVERY_PREFIX") {
            self.mqtt.discovery_prefix = v;
        }
        if let Ok(v) = std::env::var("MQTT_USE_SSL") {
            self.mqtt.use_ssl = v == "1" || v.eq_ignore_ascii_case("true");
        }
        if let Ok(v) = std::env::var("MQTT_TLS_INSECURE") {
            self.mqtt.tls_insecure = v == "1" || v.eq_ignore_ascii_case("true");
        }
        if let Ok(v) = std::env::var("MQTT_CA_CERT") {
            self.mqtt.ca_cert = Some(v);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_toml_document_fills_in_every_section_default() {
        let config: Config = toml::from_str("").unwrap();
        assert_eq!(config.agent.name, "sensorbridge");
        assert_eq!(config.mqtt.broker, "localhost");
        assert_eq!(config.mqtt.port, 1883);
        assert_eq!(config.adb.max_unlock_attempts, 3);
        assert_eq!(config.scheduler.sleep_grace_period_secs, 300);
        assert_eq!(config.flow.state_match_threshold, 0.80);
        assert!(config.devices.is_empty());
    }

    #[test]
    fn partial_toml_only_overrides_the_fields_it_names() {
        let config: Config = toml::from_str(
            r#"
            [mqtt]
            broker = "mqtt.example.lan"

            [devices.living_room]
            cid_hint = "192.168.1.50:5555"
            auto_unlock_pin = "1234"
            "#,
        )
        .unwrap();
        assert_eq!(config.mqtt.broker, "mqtt.example.lan");
        assert_eq!(config.mqtt.port, 1883); // untouched default
        let alias = config.devices.get("living_room").unwrap();
        assert_eq!(alias.cid_hint, "192.168.1.50:5555");
        assert_eq!(alias.auto_unlock_pin.as_deref(), Some("1234"));
    }

    #[test]
    fn load_reads_toml_from_disk_and_applies_env_overrides() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "[mqtt]\nbroker = \"from-file\"\n").unwrap();

        std::env::set_var("MQTT_BROKER", "from-env-sensorbridge-test");
        let config = Config::load(&path).unwrap();
        std::env::remove_var("MQTT_BROKER");

        assert_eq!(config.mqtt.broker, "from-env-sensorbridge-test");
    }
}

mod config;
mod device;
mod error;
mod flow;
mod identity;
mod mqtt;
mod navigation;
mod scheduler;
mod store;
mod ui;

use crate::config::Config;
use crate::device::DeviceManager;
use crate::flow::FlowExecutor;
use crate::identity::{DeviceProbe, IdentityResolver};
use crate::mqtt::{InboundKind, MqttBridge};
use crate::navigation::NavigationGraphs;
use crate::scheduler::FlowScheduler;
use crate::store::Store;
use clap::Parser;
use std::path::Path;
use std::sync::Arc;
use tracing::{error, info, warn};

#[derive(Parser)]
#[command(name = "sensorbridge", version, about = "Android sensor/action automation bridge")]
struct Cli {
    #[arg(short, long, default_value_t = default_config_path())]
    config: String,
    #[arg(long, help = "Skip ADB mutation; log the action and return synthetic success")]
    dry_run: bool,
    #[command(subcommand)]
    command: Option<SubCommand>,
}

#[derive(Parser)]
enum SubCommand {
    /// Start the scheduler, MQTT bridge, and device workers (default)
    Gateway,
    /// Read the scheduler's on-disk activity state
    Status,
    /// Check ADB, workspace, MQTT broker, and config health
    Doctor,
    /// Device Connection Manager operations
    Device {
        #[command(subcommand)]
        action: DeviceAction,
    },
    /// Execute a single flow outside the scheduler
    Flow {
        #[command(subcommand)]
        action: FlowAction,
    },
    /// Install/uninstall as a background service (systemd --user)
    Service {
        #[command(subcommand)]
        action: ServiceAction,
    },
}

#[derive(Parser)]
enum DeviceAction {
    /// List connected ADB connections
    List,
    /// Resolve and print the Stable Device ID for a connection
    Identify {
        /// Connection ID (host:port or USB serial)
        cid: String,
    },
    /// Flow/sensor template catalog operations (spec.md §4.4)
    Template {
        #[command(subcommand)]
        action: TemplateAction,
    },
}

#[derive(Parser)]
enum TemplateAction {
    /// List available flow templates, bundled app flows, and sensor templates
    List,
    /// Deep-copy a flow template (or bundled app flow) into a device's flow list
    Install {
        /// Stable Device ID (or any known connection id)
        device: String,
        /// Template id from `device template list`
        template_id: String,
    },
    /// Deep-copy a sensor template into a device's sensor list
    InstallSensor {
        /// Stable Device ID (or any known connection id)
        device: String,
        /// Template id from `device template list`
        template_id: String,
    },
}

#[derive(Parser)]
enum FlowAction {
    /// Run one flow once, outside the scheduler
    Run {
        /// Stable Device ID (or any known connection id)
        device: String,
        /// Flow id to execute
        flow_id: String,
        #[arg(long, help = "Accepted for parity with the scheduled path; flow run is always one-shot")]
        once: bool,
    },
}

#[derive(Parser)]
enum ServiceAction {
    Install,
    Uninstall,
    Status,
}

/// `./config.toml`, then `~/.sensorbridge/config.toml` (spec.md §6 / SPEC_FULL A1).
fn default_config_path() -> String {
    if Path::new("config.toml").exists() {
        return "config.toml".to_string();
    }
    if let Ok(home) = std::env::var("HOME") {
        return format!("{}/.sensorbridge/config.toml", home);
    }
    "config.toml".to_string()
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "sensorbridge=info".into()))
        .init();

    let cli = Cli::parse();
    let config_path = Path::new(&cli.config);
    let config = match Config::load(config_path) {
        Ok(c) => c,
        Err(e) => {
            warn!(path = %cli.config, error = %e, "failed to load config, using defaults");
            toml::from_str("").expect("empty toml parses to all-default Config")
        }
    };

    match cli.command.unwrap_or(SubCommand::Gateway) {
        SubCommand::Gateway => run_gateway(config, cli.dry_run).await,
        SubCommand::Status => run_status(&config),
        SubCommand::Doctor => run_doctor(&config).await,
        SubCommand::Device { action } => run_device(&config, action).await,
        SubCommand::Flow { action } => run_flow(&config, action, cli.dry_run).await,
        SubCommand::Service { action } => handle_service(&action),
    }
}

struct Runtime {
    identity: Arc<IdentityResolver>,
    device_manager: Arc<DeviceManager>,
    store: Arc<Store>,
    mqtt: Option<Arc<MqttBridge>>,
    inbound: Option<tokio::sync::mpsc::Receiver<crate::mqtt::InboundCommand>>,
    navigation: Arc<NavigationGraphs>,
}

async fn build_runtime(config: &Config) -> anyhow::Result<Runtime> {
    std::fs::create_dir_all(&config.agent.data_dir)?;

    let registry_path = Path::new(&config.agent.data_dir).join("identity_registry.json");
    let entries = std::fs::read_to_string(&registry_path)
        .ok()
        .and_then(|raw| serde_json::from_str(&raw).ok())
        .unwrap_or_default();
    let identity = IdentityResolver::load_from(entries);

    for (alias, device) in &config.devices {
        let probe = DeviceProbe::default();
        let sdid = identity.resolve_serial(&device.cid_hint, &probe, false);
        info!(alias, cid = %device.cid_hint, sdid, "seeded device alias into identity registry");
    }

    let device_manager = Arc::new(DeviceManager::new(
        config.adb.backend_probe_interval_ops,
        config.adb.screenshot_cache_ttl_ms,
        config.adb.ui_dump_cache_ttl_ms,
        config.adb.max_unlock_attempts,
        config.adb.unlock_cooldown_secs,
    ));

    let store = Arc::new(Store::new(&config.agent.data_dir));
    let navigation = Arc::new(NavigationGraphs::new());

    let (mqtt, inbound) = match MqttBridge::connect(&config.mqtt).await {
        Ok((bridge, inbound_rx)) => (Some(bridge), Some(inbound_rx)),
        Err(e) => {
            warn!(error = %e, "mqtt broker unreachable at startup, continuing without MQTT");
            (None, None)
        }
    };

    Ok(Runtime { identity, device_manager, store, mqtt, inbound, navigation })
}

async fn run_gateway(config: Config, dry_run: bool) -> anyhow::Result<()> {
    if dry_run {
        warn!("--dry-run is not honored by the gateway scheduler path; pass it to `flow run` instead");
    }
    let mut runtime = build_runtime(&config).await?;

    if config.scheduler.consolidate_flows {
        for entry in runtime.identity.snapshot() {
            match runtime.store.consolidate_flows(&entry.sdid) {
                Ok(n) if n > 0 => info!(sdid = %entry.sdid, removed = n, "consolidated duplicate flows at startup"),
                Ok(_) => {}
                Err(e) => warn!(sdid = %entry.sdid, error = %e, "flow consolidation failed"),
            }
        }
    }

    let scheduler = FlowScheduler::new(
        runtime.device_manager.clone(),
        runtime.identity.clone(),
        runtime.store.clone(),
        runtime.mqtt.clone(),
        runtime.navigation.clone(),
        config.flow.clone(),
        config.scheduler.clone(),
    );

    for (alias, device) in &config.devices {
        if let Some(pin) = &device.auto_unlock_pin {
            if let Some(sdid) = runtime.identity.sdid_for_cid(&device.cid_hint) {
                scheduler.set_auto_unlock_pin(&sdid, Some(pin.clone()));
            }
        }
        let sdid = runtime.identity.sdid_for_cid(&device.cid_hint).unwrap_or_else(|| alias.clone());
        scheduler.spawn_worker(sdid.clone());
        for flow in runtime.store.flows(&sdid) {
            if flow.enabled && flow.interval_secs.is_some() {
                scheduler.spawn_periodic_loop(sdid.clone(), flow.id.clone());
            }
        }
    }

    if let Some(mut inbound_rx) = runtime.inbound.take() {
        let scheduler_for_inbound = scheduler.clone();
        tokio::spawn(async move {
            while let Some(cmd) = inbound_rx.recv().await {
                if let InboundKind::DeviceAnnouncement = cmd.kind {
                    info!(payload = %cmd.payload, "companion device announcement received");
                    continue;
                }
                scheduler_for_inbound.handle_inbound(cmd);
            }
        });
    }

    info!("gateway running; press Ctrl+C to stop");
    tokio::signal::ctrl_c().await?;
    info!("shutdown requested");
    persist_identity_registry(&config, &runtime.identity)?;
    Ok(())
}

fn persist_identity_registry(config: &Config, identity: &IdentityResolver) -> anyhow::Result<()> {
    let path = Path::new(&config.agent.data_dir).join("identity_registry.json");
    let json = serde_json::to_string_pretty(&identity.snapshot())?;
    std::fs::write(path, json)?;
    Ok(())
}

fn run_status(config: &Config) -> anyhow::Result<()> {
    let pid_path = Path::new(&config.server.pid_file);
    if pid_path.exists() {
        let pid = std::fs::read_to_string(pid_path).unwrap_or_default();
        println!("sensorbridge running (pid file present: {})", pid.trim());
    } else {
        println!("sensorbridge not running (no pid file at {})", config.server.pid_file);
    }

    let registry_path = Path::new(&config.agent.data_dir).join("identity_registry.json");
    match std::fs::read_to_string(&registry_path) {
        Ok(raw) => {
            let entries: Vec<crate::identity::RegistryEntry> = serde_json::from_str(&raw).unwrap_or_default();
            println!("known devices: {}", entries.len());
            for e in entries {
                println!("  {} -> {} ({})", e.sdid, e.cid, e.model.unwrap_or_else(|| "unknown model".into()));
            }
        }
        Err(_) => println!("known devices: 0 (no identity registry yet)"),
    }
    Ok(())
}

async fn run_doctor(config: &Config) -> anyhow::Result<()> {
    println!("sensorbridge doctor\n");

    let data_dir = Path::new(&config.agent.data_dir);
    if data_dir.exists() {
        println!("[ok] data dir: {}", config.agent.data_dir);
    } else {
        println!("[warn] data dir missing, will be created on first run: {}", config.agent.data_dir);
    }

    match std::process::Command::new("adb").args(["devices"]).output() {
        Ok(out) => {
            let text = String::from_utf8_lossy(&out.stdout);
            let connected = text.lines().skip(1).filter(|l| l.contains("\tdevice")).count();
            if connected > 0 {
                println!("[ok] adb: {} device(s) connected", connected);
            } else {
                println!("[warn] adb: no devices connected");
            }
        }
        Err(_) => println!("[fail] adb: not found in PATH"),
    }

    match MqttBridge::connect(&config.mqtt).await {
        Ok(_) => println!("[ok] mqtt: connected to {}:{}", config.mqtt.broker, config.mqtt.port),
        Err(e) => println!("[fail] mqtt: {} ({}:{})", e, config.mqtt.broker, config.mqtt.port),
    }

    println!("[info] devices configured: {}", config.devices.len());
    println!("[info] flow timeout default: {}s", config.flow.default_flow_timeout_secs);
    println!("[info] sleep grace period: {}s", config.scheduler.sleep_grace_period_secs);

    println!("\ndoctor complete");
    Ok(())
}

async fn run_device(config: &Config, action: DeviceAction) -> anyhow::Result<()> {
    match action {
        DeviceAction::List => {
            let cids = device::list_connected().await?;
            if cids.is_empty() {
                println!("no devices connected");
            }
            for cid in cids {
                println!("{}", cid);
            }
        }
        DeviceAction::Identify { cid } => {
            let probe = device::probe_device(&cid).await;
            let identity = IdentityResolver::new();
            let sdid = identity.resolve_serial(&cid, &probe, true);
            println!("cid:    {}", cid);
            println!("sdid:   {}", sdid);
            println!("model:  {}", probe.model.unwrap_or_else(|| "unknown".into()));
            println!("manuf:  {}", probe.manufacturer.unwrap_or_else(|| "unknown".into()));
        }
        DeviceAction::Template { action } => run_template(config, action)?,
    }
    Ok(())
}

fn run_template(config: &Config, action: TemplateAction) -> anyhow::Result<()> {
    let store = Store::new(&config.agent.data_dir);
    match action {
        TemplateAction::List => {
            println!("flow templates:");
            for t in store.flow_templates() {
                println!("  {} - {} ({})", t.id, t.name, t.package);
            }
            println!("bundled app flows:");
            for t in store.bundled_app_flows() {
                println!("  {} - {} ({})", t.id, t.name, t.package);
            }
            println!("sensor templates:");
            for t in store.sensor_templates() {
                println!("  {} - {}", t.id, t.name);
            }
        }
        TemplateAction::Install { device, template_id } => {
            let flow = store.install_flow_template(&device, &template_id)?;
            println!("installed flow {} ({}) for device {}", flow.id, flow.name, device);
        }
        TemplateAction::InstallSensor { device, template_id } => {
            let sensor = store.install_sensor_template(&device, &template_id)?;
            println!("installed sensor {} ({}) for device {}", sensor.id, sensor.name, device);
        }
    }
    Ok(())
}

async fn run_flow(config: &Config, action: FlowAction, dry_run: bool) -> anyhow::Result<()> {
    let FlowAction::Run { device, flow_id, once: _ } = action;
    let runtime = build_runtime(config).await?;

    let sdid = runtime.identity.sdid_for_cid(&device).unwrap_or(device);
    let flow = runtime
        .store
        .flow(&sdid, &flow_id)
        .ok_or_else(|| anyhow::anyhow!("flow {flow_id} not found for device {sdid}"))?;

    let Some(serial) = runtime.identity.resolve_to_connection(&sdid) else {
        anyhow::bail!("no live connection bound to device {sdid}; connect it first");
    };

    if dry_run {
        info!(sdid, flow_id = %flow.id, "dry-run: flow would execute {} step(s)", flow.steps.len());
        return Ok(());
    }

    let connection = runtime.device_manager.connection_for(&sdid, &serial);
    let executor = FlowExecutor::new(
        connection,
        runtime.store.clone(),
        runtime.mqtt.clone(),
        runtime.navigation.clone(),
        config.flow.clone(),
        sdid.clone(),
        config.devices.values().find(|d| d.cid_hint == serial).and_then(|d| d.auto_unlock_pin.clone()),
    );

    let result = executor.execute(&flow, false).await?;
    println!("execution {} finished: success={}", result.execution_id, result.success);
    println!("  steps: {} ({} repaired)", result.steps.len(), result.repairs.len());
    println!("  sensors: {} captured, {} skipped", result.sensors_captured, result.sensors_skipped);
    if !result.navigation_failures.is_empty() {
        println!("  navigation failures: {:?}", result.navigation_failures);
    }
    if !result.success {
        error!(sdid, flow_id = %flow.id, "flow execution reported failure");
        std::process::exit(1);
    }
    Ok(())
}

fn handle_service(action: &ServiceAction) -> anyhow::Result<()> {
    let home = std::env::var("HOME").unwrap_or_else(|_| "/root".into());
    let service_dir = format!("{}/.config/systemd/user", home);
    let service_file = format!("{}/sensorbridge.service", service_dir);
    let binary = format!("{}/.local/bin/sensorbridge", home);
    let work_dir = format!("{}/.sensorbridge", home);

    match action {
        ServiceAction::Install => {
            std::fs::create_dir_all(&service_dir)?;

            let adb_path = std::process::Command::new("which")
                .arg("adb")
                .output()
                .ok()
                .and_then(|o| String::from_utf8(o.stdout).ok())
                .map(|s| s.trim().to_string())
                .unwrap_or_default();
            let adb_dir = if !adb_path.is_empty() {
                Path::new(&adb_path).parent().map(|p| p.to_string_lossy().to_string()).unwrap_or_default()
            } else {
                String::new()
            };
            let extra_path = format!(
                "{}/.cargo/bin:{}/.local/bin:{}",
                home,
                home,
                if adb_dir.is_empty() { "/usr/bin".to_string() } else { format!("{}:/usr/bin:/usr/local/bin", adb_dir) }
            );

            let unit = format!(
                r#"[Unit]
Description=sensorbridge — Android sensor/action automation bridge
After=network.target

[Service]
Type=simple
WorkingDirectory={work_dir}
ExecStart={binary} --config {work_dir}/config.toml
Restart=on-failure
RestartSec=5
Environment="PATH={extra_path}"
Environment="HOME={home}"

[Install]
WantedBy=default.target
"#
            );

            std::fs::write(&service_file, &unit)?;
            let _ = std::process::Command::new("systemctl").args(["--user", "daemon-reload"]).status();
            let _ = std::process::Command::new("systemctl").args(["--user", "enable", "sensorbridge"]).status();
            let user = std::env::var("USER").unwrap_or_else(|_| "root".into());
            let _ = std::process::Command::new("loginctl").args(["enable-linger", &user]).status();

            println!("service installed: {}", service_file);
            println!("  start:  systemctl --user start sensorbridge");
            println!("  stop:   systemctl --user stop sensorbridge");
            println!("  status: systemctl --user status sensorbridge");
            println!("  logs:   journalctl --user -u sensorbridge -f");
        }
        ServiceAction::Uninstall => {
            let _ = std::process::Command::new("systemctl").args(["--user", "stop", "sensorbridge"]).status();
            let _ = std::process::Command::new("systemctl").args(["--user", "disable", "sensorbridge"]).status();
            if Path::new(&service_file).exists() {
                std::fs::remove_file(&service_file)?;
                let _ = std::process::Command::new("systemctl").args(["--user", "daemon-reload"]).status();
                println!("service removed");
            } else {
                println!("service file not found");
            }
        }
        ServiceAction::Status => {
            let _ = std::process::Command::new("systemctl").args(["--user", "status", "sensorbridge"]).status();
        }
    }
    Ok(())
}

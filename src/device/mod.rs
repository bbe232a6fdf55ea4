//! C2 — Device Connection Manager.

mod backend;
mod connection;

pub use backend::{AdaptiveSelector, AdbTransport, BackendKind};
pub use connection::{DeviceConnection, LockState};

use crate::identity::{Cid, DeviceProbe};
use dashmap::DashMap;
use std::sync::Arc;
use tokio::process::Command;
use tracing::debug;

/// Lists currently-attached device connection IDs via `adb devices`,
/// skipping offline/unauthorized entries.
pub async fn list_connected() -> crate::error::Result<Vec<Cid>> {
    let out = Command::new("adb")
        .arg("devices")
        .output()
        .await
        .map_err(|e| crate::error::EngineError::transport("adb", e.to_string()))?;
    let text = String::from_utf8_lossy(&out.stdout);
    Ok(text
        .lines()
        .skip(1)
        .filter_map(|line| {
            let mut parts = line.split_whitespace();
            let cid = parts.next()?;
            let state = parts.next()?;
            (state == "device").then(|| cid.to_string())
        })
        .collect())
}

/// Gathers the raw properties the Identity Resolver's fallback chain needs.
pub async fn probe_device(serial: &str) -> DeviceProbe {
    let get = |prop: &'static str| {
        let serial = serial.to_string();
        async move {
            Command::new("adb")
                .args(["-s", &serial, "shell", "getprop", prop])
                .output()
                .await
                .ok()
                .map(|o| String::from_utf8_lossy(&o.stdout).trim().to_string())
                .filter(|s| !s.is_empty())
        }
    };

    let hardware_serial = get("ro.serialno").await;
    let boot_serial = get("ro.boot.serialno").await;
    let build_fingerprint = get("ro.build.fingerprint").await;
    let manufacturer = get("ro.product.manufacturer").await;
    let model = get("ro.product.model").await;
    let android_id = Command::new("adb")
        .args(["-s", serial, "shell", "settings", "get", "secure", "android_id"])
        .output()
        .await
        .ok()
        .map(|o| String::from_utf8_lossy(&o.stdout).trim().to_string())
        .filter(|s| !s.is_empty() && s != "null");

    debug!(serial, ?manufacturer, ?model, "probed device properties");

    DeviceProbe {
        hardware_serial,
        boot_serial,
        adb_serialno: Some(serial.to_string()),
        android_id,
        build_fingerprint,
        manufacturer,
        model,
    }
}

/// Pool of live [`DeviceConnection`]s keyed by Stable Device ID, created
/// lazily the first time a CID resolves.
pub struct DeviceManager {
    connections: DashMap<String, Arc<DeviceConnection>>,
    probe_interval_ops: u32,
    screenshot_ttl_ms: u64,
    ui_dump_ttl_ms: u64,
    max_unlock_attempts: u32,
    unlock_cooldown_secs: u64,
}

impl DeviceManager {
    pub fn new(
        probe_interval_ops: u32,
        screenshot_ttl_ms: u64,
        ui_dump_ttl_ms: u64,
        max_unlock_attempts: u32,
        unlock_cooldown_secs: u64,
    ) -> Self {
        Self {
            connections: DashMap::new(),
            probe_interval_ops,
            screenshot_ttl_ms,
            ui_dump_ttl_ms,
            max_unlock_attempts,
            unlock_cooldown_secs,
        }
    }

    /// Returns the live connection for `sdid`, creating one on first use.
    /// When an existing connection's serial has gone stale (spec.md §8
    /// Scenario 2 — the CID's port changed after a reconnect), the cache
    /// entry is replaced with a fresh connection bound to the new serial
    /// rather than silently keeping the old one, so every subsequent ADB
    /// call after a rebind targets the device that's actually reachable.
    pub fn connection_for(&self, sdid: &str, serial: &str) -> Arc<DeviceConnection> {
        if let Some(existing) = self.connections.get(sdid) {
            if existing.serial == serial {
                return existing.clone();
            }
            debug!(sdid, old_serial = %existing.serial, new_serial = serial, "connection id changed, rebinding");
        }
        let backend = Arc::new(AdaptiveSelector::new(self.probe_interval_ops));
        let conn = Arc::new(DeviceConnection::new(
            serial.to_string(),
            backend,
            self.screenshot_ttl_ms,
            self.ui_dump_ttl_ms,
            self.max_unlock_attempts,
            self.unlock_cooldown_secs,
        ));
        self.connections.insert(sdid.to_string(), conn.clone());
        conn
    }

    pub fn drop_connection(&self, sdid: &str) {
        self.connections.remove(sdid);
    }
}

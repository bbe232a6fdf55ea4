//! C1 — Identity Resolver.
//!
//! Maps transient Connection IDs (`host:port` / USB serial) to a Stable
//! Device ID that survives wireless-debugging reconnects, port changes, and
//! reboots. Grounded on the teacher's `Arc<Mutex<...>>`-wrapped-state idiom
//! (`perception/mod.rs::Perception`, `session/mod.rs::SessionManager`).

use dashmap::DashMap;
use regex::Regex;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::sync::Arc;
use tracing::{debug, info};

/// Connection ID: the transport address currently bound to a physical
/// device. Never used as a persistence key for user data (spec.md §3).
pub type Cid = String;
/// Stable Device ID: content-addressed, stable across reboots/reconnects.
pub type Sdid = String;

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct RegistryEntry {
    pub sdid: Sdid,
    pub cid: Cid,
    pub model: Option<String>,
    pub manufacturer: Option<String>,
}

/// Raw device properties used by the fallback chain. The Device Connection
/// Manager (C2) gathers these via `getprop`/`get-serialno`/`settings get
/// secure android_id` and hands them here; the resolver itself performs no
/// ADB I/O so it stays independently testable.
#[derive(Debug, Clone, Default)]
pub struct DeviceProbe {
    pub hardware_serial: Option<String>,
    pub boot_serial: Option<String>,
    pub adb_serialno: Option<String>,
    pub android_id: Option<String>,
    pub build_fingerprint: Option<String>,
    pub manufacturer: Option<String>,
    pub model: Option<String>,
}

/// In-memory + persisted CID <-> SDID registry. Writer-last-wins (spec.md §5):
/// the most recent `register` call for a given SDID or CID wins.
#[derive(Debug, Default)]
pub struct IdentityResolver {
    by_cid: DashMap<Cid, Sdid>,
    by_sdid: DashMap<Sdid, RegistryEntry>,
}

impl IdentityResolver {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn load_from(entries: Vec<RegistryEntry>) -> Arc<Self> {
        let resolver = Self::default();
        for e in entries {
            resolver.by_cid.insert(e.cid.clone(), e.sdid.clone());
            resolver.by_sdid.insert(e.sdid.clone(), e);
        }
        Arc::new(resolver)
    }

    pub fn snapshot(&self) -> Vec<RegistryEntry> {
        self.by_sdid.iter().map(|kv| kv.value().clone()).collect()
    }

    /// Resolve (or compute) the SDID for a connection, given whatever probe
    /// data C2 was able to gather. Never errors: the final fallback is a
    /// deterministic sanitization of the CID itself.
    pub fn resolve_serial(&self, cid: &Cid, probe: &DeviceProbe, force: bool) -> Sdid {
        if !force {
            if let Some(existing) = self.by_cid.get(cid) {
                return existing.clone();
            }
        }

        let sdid = compute_fallback_chain(probe, cid);

        let old_cid = self
            .by_sdid
            .get(&sdid)
            .map(|e| e.cid.clone())
            .filter(|c| c != cid);
        if let Some(old) = old_cid {
            info!(sdid = %sdid, old_cid = %old, new_cid = %cid, "device migration: CID rebound");
            self.by_cid.remove(&old);
        }

        self.by_cid.insert(cid.clone(), sdid.clone());
        self.by_sdid
            .entry(sdid.clone())
            .and_modify(|e| e.cid = cid.clone())
            .or_insert_with(|| RegistryEntry {
                sdid: sdid.clone(),
                cid: cid.clone(),
                model: probe.model.clone(),
                manufacturer: probe.manufacturer.clone(),
            });

        sdid
    }

    pub fn register(&self, cid: &Cid, sdid: &Sdid, model: Option<String>, manufacturer: Option<String>) {
        self.by_cid.insert(cid.clone(), sdid.clone());
        self.by_sdid
            .entry(sdid.clone())
            .and_modify(|e| {
                e.cid = cid.clone();
                if model.is_some() {
                    e.model = model.clone();
                }
                if manufacturer.is_some() {
                    e.manufacturer = manufacturer.clone();
                }
            })
            .or_insert(RegistryEntry {
                sdid: sdid.clone(),
                cid: cid.clone(),
                model,
                manufacturer,
            });
    }

    /// Accepts either a CID or SDID; returns the currently-bound CID if the
    /// device is known.
    pub fn resolve_to_connection(&self, any_id: &str) -> Option<Cid> {
        if self.by_cid.contains_key(any_id) {
            return Some(any_id.to_string());
        }
        self.by_sdid.get(any_id).map(|e| e.cid.clone())
    }

    pub fn sdid_for_cid(&self, cid: &Cid) -> Option<Sdid> {
        self.by_cid.get(cid).map(|v| v.clone())
    }
}

/// SDID fallback chain, priority order per spec.md §3. Pure function of the
/// probe data, so every step is independently testable without ADB.
fn compute_fallback_chain(probe: &DeviceProbe, cid: &Cid) -> Sdid {
    if let Some(s) = non_empty(&probe.hardware_serial) {
        return s;
    }
    if let Some(s) = non_empty(&probe.boot_serial) {
        return s;
    }
    if let Some(s) = &probe.adb_serialno {
        if !s.is_empty() && !looks_like_ip_port(s) {
            return s.clone();
        }
    }
    if let Some(s) = non_empty(&probe.android_id) {
        return sha256_hex(&s)[..16].to_string();
    }
    if let Some(s) = non_empty(&probe.build_fingerprint) {
        return sha256_hex(&s)[..16].to_string();
    }
    if probe.manufacturer.is_some() || probe.model.is_some() {
        let combo = format!(
            "{}_{}",
            probe.manufacturer.clone().unwrap_or_default(),
            probe.model.clone().unwrap_or_default()
        );
        if combo != "_" {
            return sha256_hex(&combo)[..16].to_string();
        }
    }
    debug!(cid = %cid, "falling back to sanitized CID as SDID");
    sanitize_for_filename(cid)
}

fn non_empty(s: &Option<String>) -> Option<String> {
    s.as_ref().filter(|v| !v.is_empty()).cloned()
}

fn looks_like_ip_port(s: &str) -> bool {
    static IP_PORT_RE: once_cell::sync::Lazy<Regex> =
        once_cell::sync::Lazy::new(|| Regex::new(r"^\d{1,3}(\.\d{1,3}){3}:\d+$").unwrap());
    IP_PORT_RE.is_match(s)
}

/// Replaces every non-alphanumeric character with `_`. Pure, idempotent.
pub fn sanitize_for_filename(id: &str) -> String {
    id.chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
        .collect()
}

/// MQTT discovery node-ids accept only `[A-Za-z0-9_-]`; same alphabet as
/// filenames plus `-`.
pub fn sanitize_for_topic(id: &str) -> String {
    id.chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' { c } else { '_' })
        .collect()
}

fn sha256_hex(input: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(input.as_bytes());
    format!("{:x}", hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sanitize_is_idempotent_and_restricted_alphabet() {
        let raw = "192.168.1.5:40000";
        let once = sanitize_for_filename(raw);
        let twice = sanitize_for_filename(&once);
        assert_eq!(once, twice);
        assert!(once.chars().all(|c| c.is_ascii_alphanumeric() || c == '_'));

        let topic_once = sanitize_for_topic(raw);
        let topic_twice = sanitize_for_topic(&topic_once);
        assert_eq!(topic_once, topic_twice);
        assert!(topic_once.chars().all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-'));
    }

    #[test]
    fn prefers_hardware_serial_over_everything() {
        let probe = DeviceProbe {
            hardware_serial: Some("ABC123".into()),
            android_id: Some("deadbeef".into()),
            ..Default::default()
        };
        let sdid = compute_fallback_chain(&probe, &"1.2.3.4:5555".to_string());
        assert_eq!(sdid, "ABC123");
    }

    #[test]
    fn rejects_ip_port_looking_adb_serialno() {
        let probe = DeviceProbe {
            adb_serialno: Some("192.168.1.5:40000".into()),
            android_id: Some("deadbeef".into()),
            ..Default::default()
        };
        let sdid = compute_fallback_chain(&probe, &"192.168.1.5:40000".to_string());
        // adb_serialno looked like ip:port so it's skipped; falls to android_id hash
        assert_ne!(sdid, "192.168.1.5:40000");
        assert_eq!(sdid.len(), 32);
    }

    #[test]
    fn stable_across_simulated_reconnects_with_changing_ports() {
        let resolver = IdentityResolver::new();
        let probe = DeviceProbe { hardware_serial: Some("SERIAL1".into()), ..Default::default() };

        let cids = ["192.168.1.5:40000", "192.168.1.5:51111", "192.168.1.5:60999"];
        let mut sdids = Vec::new();
        for cid in cids {
            sdids.push(resolver.resolve_serial(&cid.to_string(), &probe, false));
        }
        assert!(sdids.iter().all(|s| s == &sdids[0]));
    }

    #[test]
    fn migration_rebinds_old_cid_away() {
        let resolver = IdentityResolver::new();
        let probe = DeviceProbe { hardware_serial: Some("SERIALX".into()), ..Default::default() };

        let sdid1 = resolver.resolve_serial(&"10.0.0.1:1111".to_string(), &probe, false);
        let sdid2 = resolver.resolve_serial(&"10.0.0.1:2222".to_string(), &probe, false);
        assert_eq!(sdid1, sdid2);
        assert!(resolver.resolve_to_connection(&"10.0.0.1:1111".to_string()).is_none());
        assert_eq!(
            resolver.resolve_to_connection(&sdid1),
            Some("10.0.0.1:2222".to_string())
        );
    }

    #[test]
    fn never_errors_falls_back_to_sanitized_cid() {
        let resolver = IdentityResolver::new();
        let probe = DeviceProbe::default();
        let sdid = resolver.resolve_serial(&"weird/cid:99".to_string(), &probe, false);
        assert!(!sdid.is_empty());
    }
}

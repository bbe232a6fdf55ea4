//! C5 — MQTT Bridge.
//!
//! Grounded on the teacher's (absent) MQTT layer substituted with the
//! `rumqttc` event-loop idiom from `dank0i-pc-bridge::mqtt` (last-will
//! availability, discovery-payload builder, inbound-command router by
//! topic suffix) and `alsuren-mijia-homie`'s publish-batch style, adapted to
//! the exact topic scheme in spec.md §4.5.

mod discovery;

pub use discovery::{DiscoveryPayload, HaDevice};

use crate::config::MqttConfig;
use crate::identity::sanitize_for_topic;
use dashmap::DashMap;
use rumqttc::{AsyncClient, Event, LastWill, MqttOptions, Packet, QoS};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, info, warn};

const FALSY: [&str; 7] = ["0", "false", "off", "no", "null", "None", ""];

/// Normalizes a raw extracted value to HA's `ON`/`OFF` binary-sensor
/// vocabulary against the fixed falsy set (spec.md §4.5).
pub fn normalize_binary(raw: &str) -> &'static str {
    if FALSY.contains(&raw.trim()) {
        "OFF"
    } else {
        "ON"
    }
}

#[derive(Debug, Clone)]
pub struct InboundCommand {
    pub kind: InboundKind,
    pub sdid: String,
    pub payload: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InboundKind {
    ActionExecute { action_id: String },
    FlowResult { flow_id: String },
    GestureResult,
    NavigationLearn,
    DeviceAnnouncement,
    UiTreeResponse,
}

pub struct MqttBridge {
    client: AsyncClient,
    prefix: String,
    capabilities: DashMap<String, HashSet<String>>,
    inbound_tx: mpsc::Sender<InboundCommand>,
}

impl MqttBridge {
    pub async fn connect(cfg: &MqttConfig) -> anyhow::Result<(Arc<Self>, mpsc::Receiver<InboundCommand>)> {
        let mut opts = MqttOptions::new(cfg.client_id.clone(), cfg.broker.clone(), cfg.port);
        opts.set_keep_alive(Duration::from_secs(30));
        opts.set_clean_session(false);
        if let (Some(user), Some(pass)) = (&cfg.username, &cfg.password) {
            opts.set_credentials(user, pass);
        }

        let availability_topic = "visual_mapper/+/status".to_string();
        opts.set_last_will(LastWill::new(&availability_topic, b"offline".to_vec(), QoS::AtMostOnce, true));

        let (client, mut eventloop) = AsyncClient::new(opts, 200);
        let (inbound_tx, inbound_rx) = mpsc::channel(200);

        client.subscribe("visual_mapper/+/action/+/execute", QoS::AtMostOnce).await?;
        client.subscribe("visual_mapper/+/flow/+/result", QoS::AtMostOnce).await?;
        client.subscribe("visual_mapper/+/gesture/result", QoS::AtMostOnce).await?;
        client.subscribe("visual_mapper/+/navigation/learn", QoS::AtMostOnce).await?;
        client.subscribe("visual_mapper/+/ui/response", QoS::AtMostOnce).await?;
        client.subscribe("visualmapper/devices/announce", QoS::AtMostOnce).await?;

        let tx = inbound_tx.clone();
        tokio::spawn(async move {
            loop {
                match eventloop.poll().await {
                    Ok(Event::Incoming(Packet::Publish(p))) => {
                        let topic = p.topic.clone();
                        let payload = String::from_utf8_lossy(&p.payload).to_string();
                        if let Some(cmd) = route_inbound(&topic, payload) {
                            let _ = tx.send(cmd).await;
                        }
                    }
                    Ok(Event::Incoming(Packet::ConnAck(_))) => {
                        info!("mqtt connected");
                    }
                    Ok(_) => {}
                    Err(e) => {
                        warn!(error = %e, "mqtt event loop error, retrying");
                        tokio::time::sleep(Duration::from_secs(5)).await;
                    }
                }
            }
        });

        Ok((
            Arc::new(Self { client, prefix: cfg.discovery_prefix.clone(), capabilities: DashMap::new(), inbound_tx }),
            inbound_rx,
        ))
    }

    pub fn topic_sensor_config(&self, d: &str, sensor_id: &str, binary: bool) -> String {
        let kind = if binary { "binary_sensor" } else { "sensor" };
        format!("{}/{}/{}/{}/config", self.prefix, kind, d, sensor_id)
    }

    pub fn topic_button_config(&self, d: &str, action_id: &str) -> String {
        format!("{}/button/{}/{}/config", self.prefix, d, action_id)
    }

    pub fn topic_state(&self, d: &str, sensor_id: &str) -> String {
        format!("visual_mapper/{}/{}/state", d, sensor_id)
    }

    pub fn topic_attributes(&self, d: &str, sensor_id: &str) -> String {
        format!("visual_mapper/{}/{}/attributes", d, sensor_id)
    }

    pub fn topic_availability(&self, d: &str) -> String {
        format!("visual_mapper/{}/status", d)
    }

    pub async fn publish_discovery(&self, sdid: &str, payload: &DiscoveryPayload, binary: bool) -> anyhow::Result<()> {
        let d = sanitize_for_topic(sdid);
        let topic = self.topic_sensor_config(&d, &payload.object_id, binary);
        let body = serde_json::to_vec(payload)?;
        self.client.publish(topic, QoS::AtMostOnce, true, body).await?;
        Ok(())
    }

    pub async fn publish_availability(&self, sdid: &str, online: bool) -> anyhow::Result<()> {
        let d = sanitize_for_topic(sdid);
        let body = if online { "online" } else { "offline" };
        self.client.publish(self.topic_availability(&d), QoS::AtMostOnce, true, body).await?;
        Ok(())
    }

    /// Publishes discovery (idempotent) then state+attributes for a batch of
    /// sensor readings, pausing 10ms after the burst (spec.md §4.5). Binary
    /// sensor values are normalized to `ON`/`OFF` before publish.
    pub async fn publish_batch(&self, sdid: &str, readings: &[(DiscoveryPayload, bool, String, String)]) -> anyhow::Result<()> {
        let d = sanitize_for_topic(sdid);
        for (discovery, is_binary, value, last_updated) in readings {
            self.publish_discovery(sdid, discovery, *is_binary).await?;
            let state = if *is_binary { normalize_binary(value).to_string() } else { value.clone() };
            self.client.publish(self.topic_state(&d, &discovery.object_id), QoS::AtMostOnce, true, state).await?;
            let attrs = serde_json::json!({ "last_updated": last_updated });
            self.client
                .publish(self.topic_attributes(&d, &discovery.object_id), QoS::AtMostOnce, true, attrs.to_string())
                .await?;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
        Ok(())
    }

    pub fn record_capabilities(&self, sdid: &str, caps: HashSet<String>) {
        debug!(sdid, count = caps.len(), "recorded companion capabilities");
        self.capabilities.insert(sdid.to_string(), caps);
    }

    pub fn has_capability(&self, sdid: &str, cap: &str) -> bool {
        self.capabilities.get(sdid).map(|set| set.contains(cap)).unwrap_or(false)
    }

    pub fn inbound_sender(&self) -> mpsc::Sender<InboundCommand> {
        self.inbound_tx.clone()
    }

    /// Tells the companion app on `sdid` to run `flow_id` itself (Execution
    /// Router `android` path, spec.md §4.7.4). The companion is expected to
    /// publish its result back on `visual_mapper/{d}/flow/{flow_id}/result`.
    pub async fn dispatch_flow(&self, sdid: &str, flow_id: &str) -> anyhow::Result<()> {
        let d = sanitize_for_topic(sdid);
        let topic = format!("visual_mapper/{}/flow/{}/execute", d, flow_id);
        self.client.publish(topic, QoS::AtLeastOnce, false, b"EXECUTE".to_vec()).await?;
        Ok(())
    }
}

fn route_inbound(topic: &str, payload: String) -> Option<InboundCommand> {
    let parts: Vec<&str> = topic.split('/').collect();
    // visual_mapper/{d}/...
    if parts.first() == Some(&"visual_mapper") && parts.len() >= 3 {
        let sdid = parts[1].to_string();
        match parts.get(2) {
            Some(&"action") if parts.len() == 5 && parts[4] == "execute" => {
                return Some(InboundCommand { kind: InboundKind::ActionExecute { action_id: parts[3].to_string() }, sdid, payload });
            }
            Some(&"flow") if parts.len() == 5 && parts[4] == "result" => {
                return Some(InboundCommand { kind: InboundKind::FlowResult { flow_id: parts[3].to_string() }, sdid, payload });
            }
            Some(&"gesture") if parts.get(3) == Some(&"result") => {
                return Some(InboundCommand { kind: InboundKind::GestureResult, sdid, payload });
            }
            Some(&"navigation") if parts.get(3) == Some(&"learn") => {
                return Some(InboundCommand { kind: InboundKind::NavigationLearn, sdid, payload });
            }
            Some(&"ui") if parts.get(3) == Some(&"response") => {
                return Some(InboundCommand { kind: InboundKind::UiTreeResponse, sdid, payload });
            }
            _ => {}
        }
    }
    if topic == "visualmapper/devices/announce" {
        return Some(InboundCommand { kind: InboundKind::DeviceAnnouncement, sdid: String::new(), payload });
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn binary_normalization_matches_fixed_falsy_set() {
        for f in FALSY {
            assert_eq!(normalize_binary(f), "OFF");
        }
        assert_eq!(normalize_binary("1"), "ON");
        assert_eq!(normalize_binary("true"), "ON");
        assert_eq!(normalize_binary("anything else"), "ON");
    }

    #[test]
    fn routes_action_execute_topic() {
        let cmd = route_inbound("visual_mapper/abc123/action/turn_on/execute", "EXECUTE".into()).unwrap();
        assert_eq!(cmd.sdid, "abc123");
        assert_eq!(cmd.kind, InboundKind::ActionExecute { action_id: "turn_on".into() });
    }

    #[test]
    fn routes_device_announcement_topic() {
        let cmd = route_inbound("visualmapper/devices/announce", "{}".into()).unwrap();
        assert_eq!(cmd.kind, InboundKind::DeviceAnnouncement);
    }

    #[test]
    fn ignores_unrelated_topics() {
        assert!(route_inbound("some/other/topic", "x".into()).is_none());
    }
}

//! Home Assistant MQTT discovery payload (spec.md §4.5). Grounded on
//! `dank0i-pc-bridge::mqtt::HADiscoveryPayload`/`HADevice`, with the
//! `unique_id`/`device` grouping spec.md requires instead of the teacher's
//! single-PC-per-bridge assumption.

use serde::Serialize;

#[derive(Debug, Clone, Serialize)]
pub struct HaDevice {
    pub identifiers: Vec<String>,
    pub name: String,
    pub model: Option<String>,
    pub manufacturer: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct DiscoveryPayload {
    pub name: String,
    pub unique_id: String,
    /// Also used as the MQTT topic segment identifying this sensor.
    #[serde(skip)]
    pub object_id: String,
    pub state_topic: String,
    pub json_attributes_topic: String,
    pub availability_topic: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub device_class: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub unit_of_measurement: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub state_class: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub icon: Option<String>,
    pub device: HaDevice,
}

impl DiscoveryPayload {
    /// `(SDID, app package)` groups entities into one logical HA device per
    /// app per physical device (spec.md §4.5).
    pub fn for_sensor(
        sdid: &str,
        sensor_id: &str,
        friendly_name: &str,
        package: &str,
        device_class: Option<String>,
        unit_of_measurement: Option<String>,
        state_class: Option<String>,
        icon: Option<String>,
        model: Option<String>,
        manufacturer: Option<String>,
    ) -> Self {
        let d = crate::identity::sanitize_for_topic(sdid);
        let unique_id = format!("visual_mapper_{}_{}", sdid, sensor_id);
        let device_identifier = format!("{}_{}", sdid, package);
        let reconciled = reconcile_ha_fields(device_class, unit_of_measurement, state_class);
        Self {
            name: friendly_name.to_string(),
            unique_id,
            object_id: sensor_id.to_string(),
            state_topic: format!("visual_mapper/{}/{}/state", d, sensor_id),
            json_attributes_topic: format!("visual_mapper/{}/{}/attributes", d, sensor_id),
            availability_topic: format!("visual_mapper/{}/status", d),
            device_class: reconciled.0,
            unit_of_measurement: reconciled.1,
            state_class: reconciled.2,
            icon,
            device: HaDevice {
                identifiers: vec![device_identifier],
                name: format!("{} ({})", package, sdid),
                model,
                manufacturer,
            },
        }
    }
}

/// Home Assistant rejects some `device_class`/`unit_of_measurement`
/// combinations outright (e.g. `device_class=temperature` with no unit);
/// omitting an invalid pairing beats publishing a payload HA refuses
/// (spec.md: "omitted when they would produce invalid combinations"). A
/// dropped `device_class` takes `state_class` down with it too — HA's
/// `measurement`/`total`/`total_increasing` aggregation only makes sense
/// once the value has been classified.
fn reconcile_ha_fields(
    device_class: Option<String>,
    unit: Option<String>,
    state_class: Option<String>,
) -> (Option<String>, Option<String>, Option<String>) {
    let requires_unit = matches!(device_class.as_deref(), Some("temperature") | Some("humidity") | Some("battery") | Some("illuminance"));
    if requires_unit && unit.is_none() {
        return (None, unit, None);
    }
    (device_class, unit, state_class)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unique_id_is_deterministic() {
        let p = DiscoveryPayload::for_sensor(
            "abc123",
            "battery",
            "Battery",
            "com.x",
            Some("battery".into()),
            Some("%".into()),
            Some("measurement".into()),
            None,
            None,
            None,
        );
        assert_eq!(p.unique_id, "visual_mapper_abc123_battery");
    }

    #[test]
    fn drops_device_class_missing_required_unit() {
        let p = DiscoveryPayload::for_sensor(
            "abc123", "battery", "Battery", "com.x", Some("battery".into()), None, None, None, None, None,
        );
        assert!(p.device_class.is_none());
    }

    #[test]
    fn drops_state_class_along_with_an_invalid_device_class() {
        let p = DiscoveryPayload::for_sensor(
            "abc123",
            "battery",
            "Battery",
            "com.x",
            Some("battery".into()),
            None,
            Some("measurement".into()),
            None,
            None,
            None,
        );
        assert!(p.device_class.is_none());
        assert!(p.state_class.is_none());
    }

    #[test]
    fn keeps_state_class_when_device_class_and_unit_are_both_present() {
        let p = DiscoveryPayload::for_sensor(
            "abc123",
            "battery",
            "Battery",
            "com.x",
            Some("battery".into()),
            Some("%".into()),
            Some("measurement".into()),
            None,
            None,
            None,
        );
        assert_eq!(p.device_class.as_deref(), Some("battery"));
        assert_eq!(p.state_class.as_deref(), Some("measurement"));
    }
}

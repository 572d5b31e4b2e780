//! Home Assistant MQTT discovery announcements.

use crate::catalog::Catalog;
use crate::mqtt::Topics;

#[derive(clap::Parser, Clone, Debug)]
#[group(id = "discovery::Args")]
pub struct Args {
    /// Announce the published values to Home Assistant via MQTT discovery.
    #[arg(long, env = "MTEC_MQTT_HASS")]
    pub hass: bool,

    #[arg(long, env = "MTEC_MQTT_HASS_BASE_TOPIC", default_value = "homeassistant")]
    pub hass_base_topic: String,

    /// How long to wait after Home Assistant comes online before announcing again.
    ///
    /// Home Assistant ignores discovery messages that arrive right after its birth message.
    #[arg(long, env = "MTEC_MQTT_HASS_BIRTH_GRACE", default_value = "15s")]
    pub hass_birth_grace: humantime::Duration,
}

impl Args {
    pub fn status_topic(&self) -> Option<String> {
        self.hass
            .then(|| format!("{}/status", self.hass_base_topic))
    }
}

#[derive(
    Clone, Copy, Debug, PartialEq, Eq, serde::Serialize, serde::Deserialize, strum::Display,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum Component {
    Sensor,
    BinarySensor,
    Select,
    Switch,
}

/// Opt-in discovery settings of a register.
#[derive(Clone, Debug, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct Discovery {
    pub component: Component,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device_class: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state_class: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value_template: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload_on: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload_off: Option<String>,
}

impl Discovery {
    pub fn new(component: Component) -> Self {
        Self {
            component,
            device_class: None,
            state_class: None,
            value_template: None,
            payload_on: None,
            payload_off: None,
        }
    }
}

/// What the inverter reported about itself during startup.
#[derive(Clone, Debug, PartialEq, Eq, serde::Serialize)]
pub struct Identity {
    pub serial_number: String,
    pub firmware_version: String,
    pub model: String,
}

#[derive(serde::Serialize)]
struct Device<'a> {
    identifiers: [&'a str; 1],
    name: &'static str,
    manufacturer: &'static str,
    model: &'a str,
    serial_number: &'a str,
    sw_version: &'a str,
    via_device: &'static str,
}

#[derive(serde::Serialize)]
struct Announcement<'a> {
    name: &'a str,
    unique_id: String,
    state_topic: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    command_topic: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    unit_of_measurement: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    device_class: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    state_class: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    value_template: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    payload_on: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    payload_off: Option<&'a str>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    options: Vec<&'a str>,
    device: &'a Device<'a>,
}

/// Build the retained `(topic, payload)` config messages for every register that opted in.
pub fn announcements(
    catalog: &Catalog,
    topics: &Topics,
    hass_base_topic: &str,
    identity: &Identity,
) -> Result<Vec<(String, String)>, serde_json::Error> {
    let device = Device {
        identifiers: [&identity.serial_number],
        name: "MTEC Energybutler",
        manufacturer: "MTEC",
        model: &identity.model,
        serial_number: &identity.serial_number,
        sw_version: &identity.firmware_version,
        via_device: "MTECmqtt",
    };
    let mut result = Vec::new();
    for entry in catalog.entries() {
        let descriptor = &entry.descriptor;
        let (Some(discovery), Some(group), Some(param)) =
            (&descriptor.discovery, descriptor.group, &descriptor.param)
        else {
            continue;
        };
        let commandable = matches!(discovery.component, Component::Select | Component::Switch);
        let announcement = Announcement {
            name: &descriptor.name,
            unique_id: format!("MTEC_{param}"),
            state_topic: topics.state(group, param),
            command_topic: (commandable && descriptor.writable).then(|| topics.set(group, param)),
            unit_of_measurement: Some(descriptor.unit.as_str()).filter(|u| !u.is_empty()),
            device_class: discovery.device_class.as_deref(),
            state_class: discovery.state_class.as_deref(),
            value_template: discovery.value_template.as_deref(),
            payload_on: discovery.payload_on.as_deref(),
            payload_off: discovery.payload_off.as_deref(),
            options: match discovery.component {
                Component::Select => descriptor.value_items.values().map(String::as_str).collect(),
                _ => Vec::new(),
            },
            device: &device,
        };
        let topic = format!("{hass_base_topic}/{}/MTEC_{param}/config", discovery.component);
        result.push((topic, serde_json::to_string(&announcement)?));
    }
    Ok(result)
}

//! Topic layout of the device protocol and classification of inbound topics.

pub const REGISTER_TOPIC: &str = "device/register";

/// Filters the gateway subscribes to on every (re)connect.
pub const SUBSCRIPTIONS: &[&str] = &[
    REGISTER_TOPIC,
    "device/+/lwt",
    "iot/device/+/data",
    "device/+/sensor/+/data",
    "device/+/data",
    "device/+/status",
    "iot/device/+/status",
];

/// What an inbound message is, decided from its topic alone.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MessageKind {
    Register,
    Lwt { device_id: String },
    /// `iot/device/{id}/data`
    LegacyDeviceData { device_id: String },
    /// `device/{id}/sensor/{sensor_id}/data`
    SensorData { device_id: String, sensor_id: String },
    /// `device/{id}/data`
    DeviceData { device_id: String },
    /// `device/{id}/status` and `iot/device/{id}/status`; advisory only.
    Status { device_id: String },
    Unknown,
}

impl MessageKind {
    /// Classifies a topic. Checks run in priority order; anything that does
    /// not match exactly (including empty id segments) is `Unknown`.
    pub fn parse(topic: &str) -> Self {
        let parts: Vec<&str> = topic.split('/').collect();
        if parts.iter().any(|p| p.is_empty()) {
            return MessageKind::Unknown;
        }

        match parts.as_slice() {
            ["device", "register"] => MessageKind::Register,
            ["device", id, "lwt"] => MessageKind::Lwt {
                device_id: id.to_string(),
            },
            ["iot", "device", id, "data"] => MessageKind::LegacyDeviceData {
                device_id: id.to_string(),
            },
            ["device", id, "sensor", sensor, "data"] => MessageKind::SensorData {
                device_id: id.to_string(),
                sensor_id: sensor.to_string(),
            },
            ["device", id, "data"] => MessageKind::DeviceData {
                device_id: id.to_string(),
            },
            ["device", id, "status"] | ["iot", "device", id, "status"] => MessageKind::Status {
                device_id: id.to_string(),
            },
            _ => MessageKind::Unknown,
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            MessageKind::Register => "register",
            MessageKind::Lwt { .. } => "lwt",
            MessageKind::LegacyDeviceData { .. } => "legacy_device_data",
            MessageKind::SensorData { .. } => "sensor_data",
            MessageKind::DeviceData { .. } => "device_data",
            MessageKind::Status { .. } => "status",
            MessageKind::Unknown => "unknown",
        }
    }
}

pub fn register_response_topic(device_id: &str) -> String {
    format!("device/{}/register/response", device_id)
}

pub fn command_topic(device_id: &str) -> String {
    format!("device/{}/command", device_id)
}

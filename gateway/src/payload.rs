//! Wire payloads for every supported topic, and normalization of the three
//! telemetry layouts into a single [`TelemetryBatch`].

use crate::errors::{Error, Result};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, Deserialize)]
pub struct RegistrationRequest {
    pub device_id: Option<String>,
    pub name: Option<String>,
    #[serde(rename = "type")]
    pub device_type: Option<String>,
    pub ip: Option<String>,
    #[serde(default)]
    pub sensors: Vec<DeclaredSensor>,
    #[serde(default)]
    pub actuators: Vec<DeclaredActuator>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DeclaredSensor {
    pub sensor_id: String,
    #[serde(rename = "type")]
    pub sensor_type: Option<String>,
    pub name: Option<String>,
    pub unit: Option<String>,
    #[serde(default, deserialize_with = "lenient_pin")]
    pub pin: Option<i32>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DeclaredActuator {
    pub actuator_id: String,
    #[serde(rename = "type")]
    pub actuator_type: Option<String>,
    pub name: Option<String>,
    #[serde(default, deserialize_with = "lenient_pin")]
    pub pin: Option<i32>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegistrationResponse {
    pub status: String,
    pub device_id: String,
    pub message: String,
}

impl RegistrationResponse {
    pub fn success(device_id: &str, message: impl Into<String>) -> Self {
        Self {
            status: "success".to_string(),
            device_id: device_id.to_string(),
            message: message.into(),
        }
    }

    pub fn error(device_id: &str, message: impl Into<String>) -> Self {
        Self {
            status: "error".to_string(),
            device_id: device_id.to_string(),
            message: message.into(),
        }
    }
}

/// Boards label pins as `4`, `"4"`, `"D4"` or `"GPIO4"`. Anything without a
/// usable number is treated as no pin rather than failing the registration.
fn lenient_pin<'de, D>(deserializer: D) -> std::result::Result<Option<i32>, D::Error>
where
    D: Deserializer<'de>,
{
    let pin = match Value::deserialize(deserializer)? {
        Value::Number(n) => n.as_i64().and_then(|n| i32::try_from(n).ok()),
        Value::String(s) => {
            let digits = s.trim().trim_start_matches(|c: char| !c.is_ascii_digit());
            digits.parse().ok()
        }
        _ => None,
    };
    Ok(pin)
}

/// Best-effort device id from a registration that failed to parse, so the
/// device can still be told.
pub fn registration_device_id(payload: &[u8]) -> Option<String> {
    let value: Value = serde_json::from_slice(payload).ok()?;
    value
        .get("device_id")
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|id| !id.is_empty())
        .map(str::to_string)
}

/// `device/{id}/lwt`, `device/{id}/status`
#[derive(Debug, Clone, Deserialize)]
pub struct StatusMessage {
    #[serde(default = "default_status")]
    pub status: String,
    pub battery: Option<f64>,
}

fn default_status() -> String {
    "offline".to_string()
}

/// One sensor entry as devices send it. The value is kept raw: whether it is
/// a usable float is for the recorder to decide.
#[derive(Debug, Clone, Deserialize)]
struct RawSample {
    sensor_id: Option<String>,
    value: Option<Value>,
    /// `type` wins over `sensor_type` when both are sent.
    #[serde(rename = "type")]
    kind: Option<String>,
    sensor_type: Option<String>,
    unit: Option<String>,
    name: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
struct RawActuator {
    actuator_id: Option<String>,
    state: Option<Value>,
    #[serde(rename = "type")]
    actuator_type: Option<String>,
}

/// `device/{id}/data`. Entries stay raw so one bad entry cannot sink the
/// rest of the message.
#[derive(Debug, Clone, Deserialize)]
struct DeviceDataMessage {
    device_id: Option<String>,
    #[serde(default)]
    sensors: Vec<Value>,
    #[serde(default)]
    actuators: Vec<Value>,
}

/// `device/{id}/sensor/{sensor_id}/data`
#[derive(Debug, Clone, Deserialize)]
struct SensorDataMessage {
    value: Option<Value>,
    unit: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SensorSample {
    pub sensor_id: String,
    pub value: Value,
    pub sensor_type: Option<String>,
    pub unit: Option<String>,
    pub name: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ActuatorReport {
    pub actuator_id: String,
    pub state: bool,
    pub actuator_type: Option<String>,
}

/// Canonical telemetry event, independent of the layout it arrived in.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct TelemetryBatch {
    pub device_id: String,
    pub samples: Vec<SensorSample>,
    pub actuators: Vec<ActuatorReport>,
    /// Entries dropped during normalization (missing ids/values).
    pub skipped: usize,
}

impl TelemetryBatch {
    fn new(device_id: &str) -> Self {
        Self {
            device_id: device_id.to_string(),
            ..Default::default()
        }
    }

    fn push_sample_entry(&mut self, entry: Value) {
        match serde_json::from_value::<RawSample>(entry) {
            Ok(raw) => self.push_sample(raw),
            Err(_) => self.skipped += 1,
        }
    }

    fn push_actuator_entry(&mut self, entry: Value) {
        match serde_json::from_value::<RawActuator>(entry) {
            Ok(raw) => self.push_actuator(raw),
            Err(_) => self.skipped += 1,
        }
    }

    fn push_sample(&mut self, raw: RawSample) {
        match (raw.sensor_id.filter(|id| !id.is_empty()), raw.value) {
            (Some(sensor_id), Some(value)) if !value.is_null() => self.samples.push(SensorSample {
                sensor_id,
                value,
                sensor_type: raw.kind.or(raw.sensor_type),
                unit: raw.unit,
                name: raw.name,
            }),
            _ => self.skipped += 1,
        }
    }

    fn push_actuator(&mut self, raw: RawActuator) {
        let state = raw.state.as_ref().and_then(parse_state);
        match (raw.actuator_id.filter(|id| !id.is_empty()), state) {
            (Some(actuator_id), Some(state)) => self.actuators.push(ActuatorReport {
                actuator_id,
                state,
                actuator_type: raw.actuator_type,
            }),
            _ => self.skipped += 1,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty() && self.actuators.is_empty()
    }
}

/// Accepts booleans, 0/1 and the usual on/off spellings.
fn parse_state(value: &Value) -> Option<bool> {
    match value {
        Value::Bool(b) => Some(*b),
        Value::Number(n) => n.as_i64().map(|n| n != 0),
        Value::String(s) => match s.to_lowercase().as_str() {
            "true" | "on" | "1" => Some(true),
            "false" | "off" | "0" => Some(false),
            _ => None,
        },
        _ => None,
    }
}

pub fn parse_registration(payload: &[u8]) -> Result<RegistrationRequest> {
    let request: RegistrationRequest = serde_json::from_slice(payload)?;
    if request.sensors.iter().any(|s| s.sensor_id.is_empty())
        || request.actuators.iter().any(|a| a.actuator_id.is_empty())
    {
        return Err(Error::Payload("registration declares an empty entity id".to_string()));
    }
    Ok(request)
}

pub fn parse_status(payload: &[u8]) -> Result<StatusMessage> {
    Ok(serde_json::from_slice(payload)?)
}

/// Current layout: sensors and actuators together. A `device_id` in the body
/// must agree with the topic.
pub fn normalize_device_data(device_id: &str, payload: &[u8]) -> Result<TelemetryBatch> {
    let message: DeviceDataMessage = serde_json::from_slice(payload)?;
    if let Some(body_id) = message.device_id.as_deref() {
        if body_id != device_id {
            return Err(Error::Payload(format!(
                "payload device_id '{}' does not match topic device '{}'",
                body_id, device_id
            )));
        }
    }

    let mut batch = TelemetryBatch::new(device_id);
    for entry in message.sensors {
        batch.push_sample_entry(entry);
    }
    for entry in message.actuators {
        batch.push_actuator_entry(entry);
    }
    Ok(batch)
}

/// Legacy layout: a `sensors` list, or a single sample at the top level.
pub fn normalize_legacy_data(device_id: &str, payload: &[u8]) -> Result<TelemetryBatch> {
    let message: Value = serde_json::from_slice(payload)?;
    let Value::Object(mut fields) = message else {
        return Err(Error::Payload("legacy telemetry must be a JSON object".to_string()));
    };

    let mut batch = TelemetryBatch::new(device_id);
    match fields.remove("sensors") {
        Some(Value::Array(entries)) => {
            for entry in entries {
                batch.push_sample_entry(entry);
            }
        }
        Some(other) => {
            return Err(Error::Payload(format!("'sensors' must be a list, got {}", other)));
        }
        None => batch.push_sample(serde_json::from_value(Value::Object(fields))?),
    }
    Ok(batch)
}

pub fn normalize_sensor_data(device_id: &str, sensor_id: &str, payload: &[u8]) -> Result<TelemetryBatch> {
    let message: SensorDataMessage = serde_json::from_slice(payload)?;
    let mut batch = TelemetryBatch::new(device_id);
    batch.push_sample(RawSample {
        sensor_id: Some(sensor_id.to_string()),
        value: message.value,
        kind: None,
        sensor_type: None,
        unit: message.unit,
        name: None,
    });
    Ok(batch)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_current_layout() {
        let payload = br#"{"device_id":"dev1","sensors":[{"sensor_id":"s1","value":46}],"actuators":[{"actuator_id":"a1","state":true}]}"#;
        let batch = normalize_device_data("dev1", payload).unwrap();

        assert_eq!(batch.device_id, "dev1");
        assert_eq!(batch.samples.len(), 1);
        assert_eq!(batch.samples[0].sensor_id, "s1");
        assert_eq!(batch.samples[0].value, json!(46));
        assert_eq!(
            batch.actuators,
            vec![ActuatorReport {
                actuator_id: "a1".into(),
                state: true,
                actuator_type: None
            }]
        );
        assert_eq!(batch.skipped, 0);
    }

    #[test]
    fn test_current_layout_rejects_mismatched_device() {
        let payload = br#"{"device_id":"other","sensors":[]}"#;
        assert!(normalize_device_data("dev1", payload).is_err());
    }

    #[test]
    fn test_entries_without_id_or_value_are_skipped() {
        let payload = br#"{"sensors":[{"sensor_id":"s1"},{"value":3},{"sensor_id":"s2","value":null},{"sensor_id":"s3","value":"7.5"}],
                          "actuators":[{"actuator_id":"a1","state":"maybe"},{"actuator_id":"a2","state":"on"}]}"#;
        let batch = normalize_device_data("dev1", payload).unwrap();

        assert_eq!(batch.samples.len(), 1);
        assert_eq!(batch.samples[0].sensor_id, "s3");
        assert_eq!(batch.actuators.len(), 1);
        assert!(batch.actuators[0].state);
        assert_eq!(batch.skipped, 4);
    }

    #[test]
    fn test_legacy_single_and_many() {
        let single = normalize_legacy_data("dev1", br#"{"sensor_id":"s1","value":25.5,"type":"temperature"}"#).unwrap();
        assert_eq!(single.samples.len(), 1);
        assert_eq!(single.samples[0].sensor_type.as_deref(), Some("temperature"));

        let many = normalize_legacy_data(
            "dev1",
            br#"{"sensors":[{"sensor_id":"s1","value":25.5},{"sensor_id":"s2","value":60,"sensor_type":"humidity"}]}"#,
        )
        .unwrap();
        assert_eq!(many.samples.len(), 2);
        assert_eq!(many.samples[1].sensor_type.as_deref(), Some("humidity"));
    }

    #[test]
    fn test_legacy_list_keeps_good_entries() {
        let both_types = normalize_legacy_data(
            "dev1",
            br#"{"sensors":[{"sensor_id":"s1","value":21.5},{"sensor_id":"s2","value":60,"type":"humidity","sensor_type":"gas"}]}"#,
        )
        .unwrap();
        assert_eq!(both_types.samples.len(), 2);
        assert_eq!(both_types.samples[1].sensor_type.as_deref(), Some("humidity"));
        assert_eq!(both_types.skipped, 0);

        let mistyped = normalize_legacy_data(
            "dev1",
            br#"{"sensors":[{"sensor_id":"s1","value":21.5},{"sensor_id":"s2","value":60,"unit":5}]}"#,
        )
        .unwrap();
        assert_eq!(mistyped.samples.len(), 1);
        assert_eq!(mistyped.samples[0].sensor_id, "s1");
        assert_eq!(mistyped.skipped, 1);
    }

    #[test]
    fn test_legacy_rejects_non_object_shapes() {
        assert!(normalize_legacy_data("dev1", b"[1,2]").is_err());
        assert!(normalize_legacy_data("dev1", br#"{"sensors":{"s1":1}}"#).is_err());
    }

    #[test]
    fn test_current_layout_skips_mistyped_entry_only() {
        let payload = br#"{"sensors":[{"sensor_id":"s1","value":1},{"sensor_id":7,"value":2}],"actuators":[{"actuator_id":"a1","state":true,"type":3}]}"#;
        let batch = normalize_device_data("dev1", payload).unwrap();
        assert_eq!(batch.samples.len(), 1);
        assert!(batch.actuators.is_empty());
        assert_eq!(batch.skipped, 2);
    }

    #[test]
    fn test_sensor_topic_layout_takes_id_from_topic() {
        let batch = normalize_sensor_data("dev1", "hum_1", br#"{"value":55.0,"unit":"%"}"#).unwrap();
        assert_eq!(batch.samples[0].sensor_id, "hum_1");
        assert_eq!(batch.samples[0].unit.as_deref(), Some("%"));
    }

    #[test]
    fn test_malformed_json() {
        assert!(normalize_device_data("dev1", b"not json").is_err());
        assert!(normalize_legacy_data("dev1", b"[1,2").is_err());
        assert!(parse_registration(b"{").is_err());
    }

    #[test]
    fn test_registration_payload() {
        let payload = br#"{"device_id":"dev1","name":"Kitchen","type":"esp32","ip":"10.0.0.2",
            "sensors":[{"sensor_id":"s1","type":"temperature","pin":4}],
            "actuators":[{"actuator_id":"a1","type":"relay","name":"Light","pin":23}]}"#;
        let request = parse_registration(payload).unwrap();

        assert_eq!(request.device_id.as_deref(), Some("dev1"));
        assert_eq!(request.device_type.as_deref(), Some("esp32"));
        assert_eq!(request.sensors[0].pin, Some(4));
        assert_eq!(request.actuators[0].name.as_deref(), Some("Light"));
    }

    #[test]
    fn test_registration_accepts_labelled_pins() {
        let request = parse_registration(
            br#"{"device_id":"dev1","sensors":[{"sensor_id":"s1","pin":"D4"},{"sensor_id":"s2","pin":"34"},{"sensor_id":"s3","pin":"A"}],
                "actuators":[{"actuator_id":"a1","pin":"GPIO23"},{"actuator_id":"a2","pin":null}]}"#,
        )
        .unwrap();
        let pins: Vec<_> = request.sensors.iter().map(|s| s.pin).collect();
        assert_eq!(pins, vec![Some(4), Some(34), None]);
        assert_eq!(request.actuators[0].pin, Some(23));
        assert_eq!(request.actuators[1].pin, None);
    }

    #[test]
    fn test_device_id_of_unparseable_registration() {
        assert_eq!(
            registration_device_id(br#"{"device_id":"dev1","sensors":"oops"}"#).as_deref(),
            Some("dev1")
        );
        assert_eq!(registration_device_id(br#"{"sensors":[]}"#), None);
        assert_eq!(registration_device_id(b"{"), None);
    }

    #[test]
    fn test_registration_rejects_empty_entity_id() {
        assert!(parse_registration(br#"{"sensors":[{"sensor_id":""}]}"#).is_err());
    }

    #[test]
    fn test_status_defaults_to_offline() {
        let status = parse_status(b"{}").unwrap();
        assert_eq!(status.status, "offline");

        let status = parse_status(br#"{"status":"online","battery":75}"#).unwrap();
        assert_eq!(status.battery, Some(75.0));
    }
}

use rand::Rng;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

#[derive(Debug, Clone, Serialize)]
pub struct Registration {
    pub device_id: String,
    pub name: String,
    #[serde(rename = "type")]
    pub device_type: String,
    pub sensors: Vec<DeclaredSensor>,
    pub actuators: Vec<DeclaredActuator>,
}

#[derive(Debug, Clone, Serialize)]
pub struct DeclaredSensor {
    pub sensor_id: String,
    #[serde(rename = "type")]
    pub sensor_type: String,
    pub name: String,
    pub unit: String,
    pub pin: i32,
}

#[derive(Debug, Clone, Serialize)]
pub struct DeclaredActuator {
    pub actuator_id: String,
    #[serde(rename = "type")]
    pub actuator_type: String,
    pub name: String,
    pub pin: i32,
}

/// `device/{id}/data`
#[derive(Debug, Clone, Serialize)]
pub struct DataMessage {
    pub device_id: String,
    pub sensors: Vec<SensorValue>,
    pub actuators: Vec<ActuatorValue>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SensorValue {
    pub sensor_id: String,
    pub value: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct ActuatorValue {
    pub actuator_id: String,
    pub state: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RegisterResponse {
    pub status: String,
    pub device_id: String,
    #[serde(default)]
    pub message: String,
}

/// Anything the gateway pushes on `device/{id}/command`. Desired-state fields
/// are applied; other keys (instructions) are only logged.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Command {
    pub device_enabled: Option<bool>,
    #[serde(default)]
    pub sensors: BTreeMap<String, bool>,
    #[serde(default)]
    pub actuators: BTreeMap<String, bool>,
    pub action: Option<String>,
}

const TEMPERATURE: &str = "sensor_01";
const HUMIDITY: &str = "sensor_02";
const GAS: &str = "sensor_03";

/// State of one simulated ESP32 board: three sensors, two relays.
#[derive(Debug, Clone)]
pub struct SimulatedDevice {
    pub device_id: String,
    enabled: bool,
    sensors: BTreeMap<String, bool>,
    actuators: BTreeMap<String, bool>,
}

impl SimulatedDevice {
    pub fn new(device_id: String) -> Self {
        Self {
            device_id,
            enabled: true,
            sensors: [TEMPERATURE, HUMIDITY, GAS]
                .into_iter()
                .map(|id| (id.to_string(), true))
                .collect(),
            actuators: ["act_01", "act_02"]
                .into_iter()
                .map(|id| (id.to_string(), false))
                .collect(),
        }
    }

    pub fn registration(&self) -> Registration {
        let sensor = |id: &str, sensor_type: &str, name: &str, unit: &str, pin| DeclaredSensor {
            sensor_id: id.to_string(),
            sensor_type: sensor_type.to_string(),
            name: name.to_string(),
            unit: unit.to_string(),
            pin,
        };
        let relay = |id: &str, name: &str, pin| DeclaredActuator {
            actuator_id: id.to_string(),
            actuator_type: "relay".to_string(),
            name: name.to_string(),
            pin,
        };

        Registration {
            device_id: self.device_id.clone(),
            name: format!("Simulated {}", self.device_id),
            device_type: "esp32".to_string(),
            sensors: vec![
                sensor(TEMPERATURE, "temperature", "Temperature", "°C", 4),
                sensor(HUMIDITY, "humidity", "Humidity", "%", 4),
                sensor(GAS, "gas", "Gas", "ppm", 34),
            ],
            actuators: vec![relay("act_01", "Relay 1", 23), relay("act_02", "Relay 2", 22)],
        }
    }

    /// Next telemetry message, or `None` while the device is disabled.
    pub fn sample(&self, rng: &mut impl Rng) -> Option<DataMessage> {
        if !self.enabled {
            return None;
        }

        let sensors = self
            .sensors
            .iter()
            .filter(|(_, enabled)| **enabled)
            .map(|(id, _)| SensorValue {
                sensor_id: id.clone(),
                value: generate_value(rng, id),
            })
            .collect();
        let actuators = self
            .actuators
            .iter()
            .map(|(id, state)| ActuatorValue {
                actuator_id: id.clone(),
                state: *state,
            })
            .collect();

        Some(DataMessage {
            device_id: self.device_id.clone(),
            sensors,
            actuators,
        })
    }

    /// Applies a pushed command. Unknown sensor or actuator ids are ignored.
    pub fn apply(&mut self, command: &Command) {
        if let Some(enabled) = command.device_enabled {
            self.enabled = enabled;
            if !enabled {
                self.sensors.values_mut().for_each(|s| *s = false);
                self.actuators.values_mut().for_each(|a| *a = false);
            }
        }
        for (id, enabled) in &command.sensors {
            if let Some(slot) = self.sensors.get_mut(id) {
                *slot = *enabled;
            }
        }
        for (id, state) in &command.actuators {
            if let Some(slot) = self.actuators.get_mut(id) {
                *slot = *state;
            }
        }
    }
}

fn round1(value: f64) -> f64 {
    (value * 10.0).round() / 10.0
}

fn generate_value(rng: &mut impl Rng, sensor_id: &str) -> f64 {
    match sensor_id {
        TEMPERATURE => {
            if rng.gen_bool(0.05) {
                round1(rng.gen_range(40.0..50.0)) // 5% over the default limit
            } else {
                round1(rng.gen_range(23.0..27.0))
            }
        }
        HUMIDITY => round1(rng.gen_range(53.0..67.0)),
        _ => {
            if rng.gen_bool(0.02) {
                rng.gen_range(100.0..400.0_f64).round()
            } else {
                rng.gen_range(20.0..80.0_f64).round()
            }
        }
    }
}

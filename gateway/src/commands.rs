//! Command publisher: pushes desired state or one-off instructions to a
//! device's command topic. Fire-and-forget beyond QoS 1; the caller only
//! learns whether the message was handed to the session.

use crate::errors::Result;
use crate::metrics::COMMANDS_TOTAL;
use crate::mqtt::MqttConnection;
use crate::store::Store;
use crate::topics::command_topic;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use tracing::{info, warn};

/// Full desired state of a device.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DesiredState {
    pub device_enabled: bool,
    pub sensors: BTreeMap<String, bool>,
    pub actuators: BTreeMap<String, bool>,
}

/// Imperative instruction, e.g. `{"action": "reboot", "delay": 5}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Instruction {
    pub action: String,
    #[serde(flatten)]
    pub params: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum DeviceCommand {
    DesiredState(DesiredState),
    Instruction(Instruction),
}

impl DeviceCommand {
    fn label(&self) -> &str {
        match self {
            DeviceCommand::DesiredState(_) => "desired-state",
            DeviceCommand::Instruction(instruction) => &instruction.action,
        }
    }
}

/// Publishes `command` on `device/{id}/command`. Returns `false` instead of
/// failing, so state already persisted by the caller is unaffected.
pub fn publish_command(connection: &MqttConnection, device_id: &str, command: &DeviceCommand) -> bool {
    let published = connection.publish_json(&command_topic(device_id), command);
    if published {
        COMMANDS_TOTAL.with_label_values(&["published"]).inc();
        info!("Sent {} command to device {}", command.label(), device_id);
    } else {
        COMMANDS_TOTAL.with_label_values(&["failed"]).inc();
        warn!("Could not send {} command to device {}", command.label(), device_id);
    }
    published
}

/// Builds the desired-state snapshot from what is stored now: each sensor's
/// enabled flag and each actuator's state. `None` if the device is unknown.
pub async fn desired_state<S: Store>(store: &S, device_id: &str) -> Result<Option<DesiredState>> {
    let Some(device) = store.get_device(device_id).await? else {
        return Ok(None);
    };

    let sensors = store
        .list_sensors(device_id)
        .await?
        .into_iter()
        .map(|s| (s.id, s.enabled))
        .collect();
    let actuators = store
        .list_actuators(device_id)
        .await?
        .into_iter()
        .map(|a| (a.id, a.state))
        .collect();

    Ok(Some(DesiredState {
        device_enabled: device.enabled,
        sensors,
        actuators,
    }))
}

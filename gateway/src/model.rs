use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Notification type written for threshold violations.
pub const WARNING: &str = "warning";

/// Device liveness as persisted on the device record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceStatus {
    Online,
    Offline,
}

impl DeviceStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            DeviceStatus::Online => "online",
            DeviceStatus::Offline => "offline",
        }
    }
}

impl fmt::Display for DeviceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DeviceStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "online" => Ok(DeviceStatus::Online),
            "offline" => Ok(DeviceStatus::Offline),
            other => Err(format!("unknown device status '{}'", other)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Device {
    pub id: String,
    pub name: String,
    pub device_type: String,
    pub ip: Option<String>,
    pub enabled: bool,
    pub status: DeviceStatus,
    pub last_seen: Option<DateTime<Utc>>,
    pub access_secret: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Device {
    /// A freshly registered device: offline, enabled, never seen.
    pub fn new(id: String, name: String, device_type: String, ip: Option<String>, now: DateTime<Utc>) -> Self {
        Self {
            id,
            name,
            device_type,
            ip,
            enabled: true,
            status: DeviceStatus::Offline,
            last_seen: None,
            access_secret: None,
            created_at: now,
            updated_at: now,
        }
    }
}

/// Mutable device fields a re-registration may overwrite. `None` leaves the
/// stored value alone.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DeviceMetadata {
    pub name: Option<String>,
    pub device_type: Option<String>,
    pub ip: Option<String>,
}

impl DeviceMetadata {
    pub fn is_empty(&self) -> bool {
        self.name.is_none() && self.device_type.is_none() && self.ip.is_none()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Sensor {
    pub id: String,
    pub device_id: String,
    pub sensor_type: String,
    pub name: String,
    pub unit: String,
    pub pin: i32,
    pub enabled: bool,
    pub min_threshold: Option<f64>,
    pub max_threshold: Option<f64>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Actuator {
    pub id: String,
    pub device_id: String,
    pub actuator_type: String,
    pub name: String,
    pub pin: i32,
    pub state: bool,
    pub enabled: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Append-only sensor reading.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Reading {
    pub sensor_id: String,
    pub device_id: String,
    pub value: f64,
    pub sensor_type: String,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Notification {
    pub id: Uuid,
    pub user_id: String,
    pub device_id: String,
    pub sensor_id: String,
    pub notification_type: String,
    pub message: String,
    pub read: bool,
    pub created_at: DateTime<Utc>,
}

impl Notification {
    pub fn warning(user_id: &str, device_id: &str, sensor_id: &str, message: String, now: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            user_id: user_id.to_string(),
            device_id: device_id.to_string(),
            sensor_id: sensor_id.to_string(),
            notification_type: WARNING.to_string(),
            message,
            read: false,
            created_at: now,
        }
    }
}

//! Device registry: idempotent creation of devices, sensors and actuators.
//!
//! Existing sensors and actuators are never modified here; their declared
//! type, pin and thresholds only matter at creation.

use crate::errors::{Error, Result};
use crate::inference;
use crate::metrics::PROVISIONED_TOTAL;
use crate::model::{Actuator, Device, DeviceMetadata, Sensor};
use crate::payload::{DeclaredActuator, DeclaredSensor, RegistrationRequest, SensorSample};
use crate::store::Store;
use chrono::{DateTime, Utc};
use tracing::{debug, info};

const DEFAULT_DEVICE_TYPE: &str = "generic";

/// What a sensor reference carries besides its id.
#[derive(Debug, Clone, Default)]
pub struct SensorSpec<'a> {
    pub sensor_type: Option<&'a str>,
    pub name: Option<&'a str>,
    pub unit: Option<&'a str>,
    pub pin: Option<i32>,
}

impl<'a> From<&'a DeclaredSensor> for SensorSpec<'a> {
    fn from(declared: &'a DeclaredSensor) -> Self {
        Self {
            sensor_type: declared.sensor_type.as_deref(),
            name: declared.name.as_deref(),
            unit: declared.unit.as_deref(),
            pin: declared.pin,
        }
    }
}

impl<'a> From<&'a SensorSample> for SensorSpec<'a> {
    fn from(sample: &'a SensorSample) -> Self {
        Self {
            sensor_type: sample.sensor_type.as_deref(),
            name: sample.name.as_deref(),
            unit: sample.unit.as_deref(),
            pin: None,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct ActuatorSpec<'a> {
    pub actuator_type: Option<&'a str>,
    pub name: Option<&'a str>,
    pub pin: Option<i32>,
    pub state: bool,
}

impl<'a> From<&'a DeclaredActuator> for ActuatorSpec<'a> {
    fn from(declared: &'a DeclaredActuator) -> Self {
        Self {
            actuator_type: declared.actuator_type.as_deref(),
            name: declared.name.as_deref(),
            pin: declared.pin,
            state: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegistrationOutcome {
    pub device_id: String,
    pub device_created: bool,
    pub sensors_created: usize,
    pub actuators_created: usize,
}

impl RegistrationOutcome {
    pub fn message(&self) -> String {
        let verb = if self.device_created { "registered" } else { "updated" };
        format!(
            "Device {} ({} new sensors, {} new actuators)",
            verb, self.sensors_created, self.actuators_created
        )
    }
}

/// Creates the device when absent, otherwise overwrites only the mutable
/// metadata present in the request. Declared entities are created if missing.
pub async fn register_device<S: Store>(store: &S, request: &RegistrationRequest, now: DateTime<Utc>) -> Result<RegistrationOutcome> {
    let device_id = request
        .device_id
        .as_deref()
        .map(str::trim)
        .filter(|id| !id.is_empty())
        .map(str::to_string)
        .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());

    let metadata = DeviceMetadata {
        name: request.name.clone(),
        device_type: request.device_type.clone(),
        ip: request.ip.clone(),
    };

    let mut device_created = false;
    if store.get_device(&device_id).await?.is_none() {
        let device = Device::new(
            device_id.clone(),
            metadata.name.clone().unwrap_or_else(|| format!("Device {}", device_id)),
            metadata.device_type.clone().unwrap_or_else(|| DEFAULT_DEVICE_TYPE.to_string()),
            metadata.ip.clone(),
            now,
        );
        device_created = store.insert_device(&device).await?;
        if device_created {
            PROVISIONED_TOTAL.with_label_values(&["device"]).inc();
            info!("Registered new device {}", device_id);
        }
    }

    // Also covers losing an insert race against a concurrent registration.
    if !device_created && !metadata.is_empty() {
        store.update_device_metadata(&device_id, &metadata, now).await?;
        debug!("Updated metadata of device {}", device_id);
    }

    let mut sensors_created = 0;
    for declared in &request.sensors {
        if ensure_sensor(store, &device_id, &declared.sensor_id, SensorSpec::from(declared), now)
            .await?
            .1
        {
            sensors_created += 1;
        }
    }

    let mut actuators_created = 0;
    for declared in &request.actuators {
        if ensure_actuator(store, &device_id, &declared.actuator_id, ActuatorSpec::from(declared), now)
            .await?
            .1
        {
            actuators_created += 1;
        }
    }

    Ok(RegistrationOutcome {
        device_id,
        device_created,
        sensors_created,
        actuators_created,
    })
}

pub fn new_sensor(device_id: &str, sensor_id: &str, spec: &SensorSpec<'_>, now: DateTime<Utc>) -> Sensor {
    let sensor_type = inference::resolve_sensor_type(sensor_id, spec.sensor_type, spec.unit);
    let (min_threshold, max_threshold) = inference::default_thresholds(&sensor_type);
    let unit = spec
        .unit
        .map(str::to_string)
        .unwrap_or_else(|| inference::default_unit(&sensor_type).to_string());

    Sensor {
        id: sensor_id.to_string(),
        device_id: device_id.to_string(),
        name: spec
            .name
            .map(str::to_string)
            .unwrap_or_else(|| format!("Sensor {}", sensor_id)),
        sensor_type,
        unit,
        pin: spec.pin.unwrap_or(0),
        enabled: true,
        min_threshold,
        max_threshold,
        created_at: now,
        updated_at: now,
    }
}

pub fn new_actuator(device_id: &str, actuator_id: &str, spec: &ActuatorSpec<'_>, now: DateTime<Utc>) -> Actuator {
    Actuator {
        id: actuator_id.to_string(),
        device_id: device_id.to_string(),
        actuator_type: inference::resolve_actuator_type(actuator_id, spec.actuator_type),
        name: spec
            .name
            .map(str::to_string)
            .unwrap_or_else(|| format!("Actuator {}", actuator_id)),
        pin: spec.pin.unwrap_or(0),
        state: spec.state,
        enabled: true,
        created_at: now,
        updated_at: now,
    }
}

/// Returns the stored sensor, creating it first if needed. The flag reports
/// whether this call created it.
pub async fn ensure_sensor<S: Store>(
    store: &S,
    device_id: &str,
    sensor_id: &str,
    spec: SensorSpec<'_>,
    now: DateTime<Utc>,
) -> Result<(Sensor, bool)> {
    if let Some(sensor) = store.get_sensor(device_id, sensor_id).await? {
        return Ok((sensor, false));
    }

    let sensor = new_sensor(device_id, sensor_id, &spec, now);
    if store.insert_sensor(&sensor).await? {
        PROVISIONED_TOTAL.with_label_values(&["sensor"]).inc();
        info!(
            "Created sensor {} on device {} (type {})",
            sensor_id, device_id, sensor.sensor_type
        );
        return Ok((sensor, true));
    }

    // Someone else created it in the meantime, or the device is gone.
    match store.get_sensor(device_id, sensor_id).await? {
        Some(sensor) => Ok((sensor, false)),
        None => Err(Error::UnknownDevice(device_id.to_string())),
    }
}

pub async fn ensure_actuator<S: Store>(
    store: &S,
    device_id: &str,
    actuator_id: &str,
    spec: ActuatorSpec<'_>,
    now: DateTime<Utc>,
) -> Result<(Actuator, bool)> {
    if let Some(actuator) = store.get_actuator(device_id, actuator_id).await? {
        return Ok((actuator, false));
    }

    let actuator = new_actuator(device_id, actuator_id, &spec, now);
    if store.insert_actuator(&actuator).await? {
        PROVISIONED_TOTAL.with_label_values(&["actuator"]).inc();
        info!(
            "Created actuator {} on device {} (type {})",
            actuator_id, device_id, actuator.actuator_type
        );
        return Ok((actuator, true));
    }

    match store.get_actuator(device_id, actuator_id).await? {
        Some(actuator) => Ok((actuator, false)),
        None => Err(Error::UnknownDevice(device_id.to_string())),
    }
}

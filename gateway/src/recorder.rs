//! Telemetry recorder: appends readings and refreshes device liveness.

use crate::errors::{Error, Result};
use crate::metrics::READINGS_TOTAL;
use crate::model::{Reading, Sensor};
use crate::store::Store;
use chrono::{DateTime, Utc};
use serde_json::Value;
use tracing::{debug, warn};

/// Interprets a raw reading value as a float. Numeric strings are accepted;
/// anything else is an error, never a zero.
pub fn parse_value(value: &Value) -> Result<f64> {
    let parsed = match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse::<f64>().ok(),
        _ => None,
    };
    match parsed {
        Some(v) if v.is_finite() => Ok(v),
        _ => Err(Error::InvalidValue(value.to_string())),
    }
}

/// Appends an immutable reading for `sensor` and marks its device online.
pub async fn record_reading<S: Store>(store: &S, sensor: &Sensor, value: f64, now: DateTime<Utc>) -> Result<Reading> {
    let reading = Reading {
        sensor_id: sensor.id.clone(),
        device_id: sensor.device_id.clone(),
        value,
        sensor_type: sensor.sensor_type.clone(),
        timestamp: now,
    };

    store.append_reading(&reading).await?;
    READINGS_TOTAL.inc();
    debug!(
        "Recorded {} = {} for device {}",
        reading.sensor_id, reading.value, reading.device_id
    );

    touch_device(store, &sensor.device_id, now).await?;
    Ok(reading)
}

/// Stores the state an actuator reports for itself.
pub async fn record_actuator_state<S: Store>(
    store: &S,
    device_id: &str,
    actuator_id: &str,
    state: bool,
    now: DateTime<Utc>,
) -> Result<()> {
    if !store.set_actuator_state(device_id, actuator_id, state, now).await? {
        warn!("Actuator {} on device {} vanished before its state was stored", actuator_id, device_id);
    }
    Ok(())
}

/// Primary liveness signal: online, last seen now.
pub async fn touch_device<S: Store>(store: &S, device_id: &str, now: DateTime<Utc>) -> Result<()> {
    if !store.mark_device_online(device_id, now).await? {
        warn!("Device {} vanished before liveness could be refreshed", device_id);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Device, DeviceStatus};
    use crate::registry::{new_sensor, SensorSpec};
    use crate::store::MemoryStore;
    use serde_json::json;

    #[test]
    fn test_parse_value() {
        assert_eq!(parse_value(&json!(46)).unwrap(), 46.0);
        assert_eq!(parse_value(&json!(-3.25)).unwrap(), -3.25);
        assert_eq!(parse_value(&json!(" 7.5 ")).unwrap(), 7.5);
    }

    #[test]
    fn test_parse_value_rejects_instead_of_coercing() {
        for value in [json!("warm"), json!(""), json!(true), json!(null), json!([1]), json!({"v": 1}), json!("NaN"), json!("inf")] {
            assert!(
                matches!(parse_value(&value), Err(Error::InvalidValue(_))),
                "{} should be rejected",
                value
            );
        }
    }

    #[test]
    fn test_record_reading_marks_device_online() {
        tokio_test::block_on(async {
            let store = MemoryStore::new();
            let then = Utc::now() - chrono::Duration::hours(1);
            store
                .insert_device(&Device::new("dev1".into(), "d".into(), "esp32".into(), None, then))
                .await
                .unwrap();
            let sensor = new_sensor("dev1", "s1", &SensorSpec::default(), then);
            store.insert_sensor(&sensor).await.unwrap();

            let now = Utc::now();
            let reading = record_reading(&store, &sensor, 21.5, now).await.unwrap();

            assert_eq!(reading.timestamp, now);
            assert_eq!(store.readings(), vec![reading]);
            let device = store.get_device("dev1").await.unwrap().unwrap();
            assert_eq!(device.status, DeviceStatus::Online);
            assert_eq!(device.last_seen, Some(now));
        });
    }
}

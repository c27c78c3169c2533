//! Per-message dispatch: classify the topic, normalize the payload, then run
//! registry, recorder and notifier against the store.
//!
//! Failures end at this boundary as log lines and metrics. One bad record
//! never stops the rest of its batch or the next message.

use crate::errors::{Error, Result};
use crate::metrics::{
    DEVICES_OFFLINE_TOTAL, DROPPED_MESSAGES_TOTAL, HANDLE_LATENCY_SECONDS, MESSAGES_TOTAL,
    REJECTED_READINGS_TOTAL, STORE_FAILURES_TOTAL,
};
use crate::mqtt::MqttConnection;
use crate::notifier;
use crate::payload::{self, RegistrationResponse, TelemetryBatch};
use crate::recorder;
use crate::registry::{self, ActuatorSpec, SensorSpec};
use crate::store::Store;
use crate::topics::{register_response_topic, MessageKind};
use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, error, info, warn};

/// What one telemetry message did to the store.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct IngestSummary {
    pub readings: usize,
    pub rejected: usize,
    pub actuators: usize,
    pub notifications: usize,
}

pub struct Gateway<S> {
    store: Arc<S>,
    connection: MqttConnection,
    notification_cooldown: chrono::Duration,
}

impl<S: Store> Gateway<S> {
    pub fn new(store: Arc<S>, connection: MqttConnection, notification_cooldown: chrono::Duration) -> Self {
        Self {
            store,
            connection,
            notification_cooldown,
        }
    }

    pub fn connection(&self) -> &MqttConnection {
        &self.connection
    }

    #[cfg(test)]
    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    pub async fn handle_message(&self, topic: &str, payload: &[u8]) {
        self.handle_message_at(topic, payload, Utc::now()).await
    }

    /// Handles one inbound message as if it arrived at `now`.
    pub async fn handle_message_at(&self, topic: &str, payload: &[u8], now: DateTime<Utc>) {
        let start = Instant::now();
        let kind = MessageKind::parse(topic);
        MESSAGES_TOTAL.with_label_values(&[kind.label()]).inc();

        let result = match kind {
            MessageKind::Register => self.handle_registration(payload, now).await,
            MessageKind::Lwt { device_id } => self.handle_lwt(&device_id, payload, now).await,
            MessageKind::Status { device_id } => self.handle_status(&device_id, payload),
            MessageKind::DeviceData { device_id } => {
                self.ingest_with(payload::normalize_device_data(&device_id, payload), now).await
            }
            MessageKind::LegacyDeviceData { device_id } => {
                self.ingest_with(payload::normalize_legacy_data(&device_id, payload), now).await
            }
            MessageKind::SensorData { device_id, sensor_id } => {
                self.ingest_with(payload::normalize_sensor_data(&device_id, &sensor_id, payload), now)
                    .await
            }
            MessageKind::Unknown => {
                DROPPED_MESSAGES_TOTAL.with_label_values(&["unknown_topic"]).inc();
                warn!("Unknown topic format: {}", topic);
                Ok(())
            }
        };

        if let Err(e) = result {
            match e {
                Error::Json(_) | Error::Payload(_) => {
                    DROPPED_MESSAGES_TOTAL.with_label_values(&["malformed"]).inc();
                    warn!("Dropped malformed message on {}: {}", topic, e);
                }
                Error::UnknownDevice(device_id) => {
                    DROPPED_MESSAGES_TOTAL.with_label_values(&["unknown_device"]).inc();
                    warn!("Dropped message on {} for unknown device {}", topic, device_id);
                }
                other => {
                    STORE_FAILURES_TOTAL.inc();
                    error!("Failed to handle message on {}: {}", topic, other);
                }
            }
        }

        HANDLE_LATENCY_SECONDS.observe(start.elapsed().as_secs_f64());
    }

    async fn handle_registration(&self, payload: &[u8], now: DateTime<Utc>) -> Result<()> {
        let request = match payload::parse_registration(payload) {
            Ok(request) => request,
            Err(e) => {
                // Tell the device when we can tell who it is; otherwise it waits forever.
                if let Some(device_id) = payload::registration_device_id(payload) {
                    self.send_registration_response(&RegistrationResponse::error(
                        &device_id,
                        format!("Invalid registration: {}", e),
                    ));
                }
                return Err(e);
            }
        };
        if request.device_id.as_deref().map_or(true, |id| id.trim().is_empty()) {
            // The allocated id is only reachable through the external layer:
            // the device cannot subscribe to a response topic it does not know.
            warn!("Registration without device_id; the device will not see the response");
        }

        let response = match registry::register_device(self.store.as_ref(), &request, now).await {
            Ok(outcome) => {
                info!(
                    "Registration of {}: created={}, new sensors={}, new actuators={}",
                    outcome.device_id, outcome.device_created, outcome.sensors_created, outcome.actuators_created
                );
                RegistrationResponse::success(&outcome.device_id, outcome.message())
            }
            Err(e) => {
                STORE_FAILURES_TOTAL.inc();
                error!("Registration failed: {}", e);
                let device_id = request.device_id.as_deref().unwrap_or_default();
                if device_id.is_empty() {
                    return Ok(());
                }
                RegistrationResponse::error(device_id, "Registration failed")
            }
        };

        self.send_registration_response(&response);
        Ok(())
    }

    fn send_registration_response(&self, response: &RegistrationResponse) {
        let topic = register_response_topic(&response.device_id);
        if !self.connection.publish_json(&topic, response) {
            warn!("Registration response for {} was not sent", response.device_id);
        }
    }

    async fn handle_lwt(&self, device_id: &str, payload: &[u8], now: DateTime<Utc>) -> Result<()> {
        let status = payload::parse_status(payload)?;
        if status.status != "offline" {
            warn!(
                "Ignoring last will with status '{}' from device {}",
                status.status, device_id
            );
            return Ok(());
        }

        if !self.store.mark_device_offline(device_id, now).await? {
            return Err(Error::UnknownDevice(device_id.to_string()));
        }
        DEVICES_OFFLINE_TOTAL.with_label_values(&["lwt"]).inc();
        info!("Device {} went offline (last will)", device_id);
        Ok(())
    }

    /// Self-reported status is advisory: liveness comes from telemetry and LWT.
    fn handle_status(&self, device_id: &str, payload: &[u8]) -> Result<()> {
        let status = payload::parse_status(payload)?;
        match status.battery {
            Some(battery) => info!(
                "Device {} reports status '{}' (battery {}%)",
                device_id, status.status, battery
            ),
            None => info!("Device {} reports status '{}'", device_id, status.status),
        }
        Ok(())
    }

    async fn ingest_with(&self, batch: Result<TelemetryBatch>, now: DateTime<Utc>) -> Result<()> {
        let summary = self.ingest(batch?, now).await?;
        debug!("Ingested telemetry: {:?}", summary);
        Ok(())
    }

    /// Applies one normalized telemetry message. Entities missing on a known
    /// device are provisioned; an unknown device drops the whole batch.
    pub async fn ingest(&self, batch: TelemetryBatch, now: DateTime<Utc>) -> Result<IngestSummary> {
        let store = self.store.as_ref();
        if store.get_device(&batch.device_id).await?.is_none() {
            return Err(Error::UnknownDevice(batch.device_id));
        }

        let mut summary = IngestSummary {
            rejected: batch.skipped,
            ..Default::default()
        };
        if batch.is_empty() && batch.skipped == 0 {
            debug!("Empty telemetry from device {}", batch.device_id);
            return Ok(summary);
        }
        if batch.skipped > 0 {
            REJECTED_READINGS_TOTAL.inc_by(batch.skipped as f64);
            warn!(
                "Skipped {} incomplete entries from device {}",
                batch.skipped, batch.device_id
            );
        }

        for sample in &batch.samples {
            let value = match recorder::parse_value(&sample.value) {
                Ok(value) => value,
                Err(e) => {
                    REJECTED_READINGS_TOTAL.inc();
                    warn!(
                        "Rejected reading for {}/{}: {}",
                        batch.device_id, sample.sensor_id, e
                    );
                    summary.rejected += 1;
                    continue;
                }
            };

            match self.record_sample(&batch.device_id, sample, value, now).await {
                Ok(created) => {
                    summary.readings += 1;
                    summary.notifications += created;
                }
                Err(e) => {
                    STORE_FAILURES_TOTAL.inc();
                    error!(
                        "Failed to record reading for {}/{}: {}",
                        batch.device_id, sample.sensor_id, e
                    );
                }
            }
        }

        for report in &batch.actuators {
            let spec = ActuatorSpec {
                actuator_type: report.actuator_type.as_deref(),
                state: report.state,
                ..Default::default()
            };
            let result = async {
                let (_, created) =
                    registry::ensure_actuator(store, &batch.device_id, &report.actuator_id, spec, now).await?;
                if !created {
                    recorder::record_actuator_state(store, &batch.device_id, &report.actuator_id, report.state, now)
                        .await?;
                }
                Ok::<_, Error>(())
            }
            .await;

            match result {
                Ok(()) => summary.actuators += 1,
                Err(e) => {
                    STORE_FAILURES_TOTAL.inc();
                    error!(
                        "Failed to store state of actuator {}/{}: {}",
                        batch.device_id, report.actuator_id, e
                    );
                }
            }
        }

        // Readings already refreshed liveness; an actuator-only report still counts.
        if summary.readings == 0 && summary.actuators > 0 {
            recorder::touch_device(store, &batch.device_id, now).await?;
        }

        Ok(summary)
    }

    async fn record_sample(
        &self,
        device_id: &str,
        sample: &payload::SensorSample,
        value: f64,
        now: DateTime<Utc>,
    ) -> Result<usize> {
        let store = self.store.as_ref();
        let (sensor, _) = registry::ensure_sensor(store, device_id, &sample.sensor_id, SensorSpec::from(sample), now).await?;
        let reading = recorder::record_reading(store, &sensor, value, now).await?;

        // The reading is in; an alerting failure must not undo that.
        match notifier::evaluate(store, &sensor, &reading, self.notification_cooldown).await {
            Ok(outcome) => Ok(outcome.created),
            Err(e) => {
                STORE_FAILURES_TOTAL.inc();
                error!("Threshold evaluation failed for {}/{}: {}", device_id, sensor.id, e);
                Ok(0)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MqttConfig;
    use crate::model::{Device, DeviceStatus};
    use crate::store::MemoryStore;
    use chrono::Duration;

    fn gateway() -> (Gateway<MemoryStore>, rumqttc::EventLoop) {
        let (connection, eventloop) = MqttConnection::new(&MqttConfig {
            host: "localhost".into(),
            port: 1883,
            tls: false,
            username: None,
            password: None,
            client_id: "handler-test".into(),
            keep_alive: std::time::Duration::from_secs(30),
            last_will_topic: None,
        });
        let gateway = Gateway::new(Arc::new(MemoryStore::new()), connection, Duration::minutes(5));
        (gateway, eventloop)
    }

    async fn known_device(gateway: &Gateway<MemoryStore>, id: &str) {
        gateway
            .store()
            .insert_device(&Device::new(id.into(), id.into(), "esp32".into(), None, Utc::now()))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_end_to_end_current_format() {
        let (gateway, _eventloop) = gateway();
        let store = gateway.store().clone();
        known_device(&gateway, "dev1").await;
        let (_, _) = registry::ensure_sensor(store.as_ref(), "dev1", "s1", SensorSpec::default(), Utc::now())
            .await
            .unwrap();
        store.set_thresholds("dev1", "s1", None, Some(40.0));
        registry::ensure_actuator(store.as_ref(), "dev1", "a1", ActuatorSpec::default(), Utc::now())
            .await
            .unwrap();
        store.link_user("user1", "dev1");

        let now = Utc::now();
        gateway
            .handle_message_at(
                "device/dev1/data",
                br#"{"device_id":"dev1","sensors":[{"sensor_id":"s1","value":46}],"actuators":[{"actuator_id":"a1","state":true}]}"#,
                now,
            )
            .await;

        let device = store.get_device("dev1").await.unwrap().unwrap();
        assert_eq!(device.status, DeviceStatus::Online);
        assert_eq!(device.last_seen, Some(now));

        let readings = store.readings();
        assert_eq!(readings.len(), 1);
        assert_eq!((readings[0].sensor_id.as_str(), readings[0].value), ("s1", 46.0));

        assert!(store.get_actuator("dev1", "a1").await.unwrap().unwrap().state);

        let notifications = store.notifications();
        assert_eq!(notifications.len(), 1);
        assert_eq!(notifications[0].user_id, "user1");
        assert!(!notifications[0].read);
    }

    #[tokio::test]
    async fn test_unknown_sensor_is_provisioned_once() {
        let (gateway, _eventloop) = gateway();
        known_device(&gateway, "dev1").await;

        gateway
            .handle_message("iot/device/dev1/data", br#"{"sensor_id":"gas_kitchen","value":"55"}"#)
            .await;

        let store = gateway.store();
        assert_eq!(store.sensor_count(), 1);
        let sensor = store.get_sensor("dev1", "gas_kitchen").await.unwrap().unwrap();
        assert_eq!(sensor.sensor_type, "gas");
        assert_eq!(sensor.max_threshold, Some(100.0));
        assert_eq!(store.readings().len(), 1);
    }

    #[tokio::test]
    async fn test_unknown_device_is_not_auto_registered() {
        let (gateway, _eventloop) = gateway();

        gateway
            .handle_message("device/ghost/data", br#"{"sensors":[{"sensor_id":"s1","value":1}]}"#)
            .await;

        let store = gateway.store();
        assert_eq!(store.device_count(), 0);
        assert_eq!(store.sensor_count(), 0);
        assert!(store.readings().is_empty());
    }

    #[tokio::test]
    async fn test_invalid_value_is_rejected_not_zeroed() {
        let (gateway, _eventloop) = gateway();
        known_device(&gateway, "dev1").await;

        let summary = gateway
            .ingest(
                payload::normalize_device_data("dev1", br#"{"sensors":[{"sensor_id":"s1","value":"hot"},{"sensor_id":"s2","value":21}]}"#)
                    .unwrap(),
                Utc::now(),
            )
            .await
            .unwrap();

        assert_eq!(summary.readings, 1);
        assert_eq!(summary.rejected, 1);
        let store = gateway.store();
        assert!(store.get_sensor("dev1", "s1").await.unwrap().is_none());
        assert_eq!(store.readings()[0].value, 21.0);
    }

    #[tokio::test]
    async fn test_malformed_payload_mutates_nothing() {
        let (gateway, _eventloop) = gateway();
        known_device(&gateway, "dev1").await;

        gateway.handle_message("device/dev1/data", b"{not json").await;

        let device = gateway.store().get_device("dev1").await.unwrap().unwrap();
        assert_eq!(device.status, DeviceStatus::Offline);
        assert!(gateway.store().readings().is_empty());
    }

    #[tokio::test]
    async fn test_lwt_sets_offline_immediately() {
        let (gateway, _eventloop) = gateway();
        known_device(&gateway, "dev1").await;
        let now = Utc::now();
        gateway.store().mark_device_online("dev1", now).await.unwrap();

        gateway
            .handle_message_at("device/dev1/lwt", br#"{"status":"offline"}"#, now + Duration::seconds(1))
            .await;

        let device = gateway.store().get_device("dev1").await.unwrap().unwrap();
        assert_eq!(device.status, DeviceStatus::Offline);
    }

    #[tokio::test]
    async fn test_status_message_is_advisory() {
        let (gateway, _eventloop) = gateway();
        known_device(&gateway, "dev1").await;

        gateway
            .handle_message("device/dev1/status", br#"{"status":"online","battery":80}"#)
            .await;

        let device = gateway.store().get_device("dev1").await.unwrap().unwrap();
        assert_eq!(device.status, DeviceStatus::Offline);
    }

    #[tokio::test]
    async fn test_registration_twice_yields_one_of_each() {
        let (gateway, _eventloop) = gateway();
        let payload = br#"{"device_id":"dev1","name":"Hall","type":"esp32",
            "sensors":[{"sensor_id":"s1","type":"temperature"}],"actuators":[{"actuator_id":"a1","type":"relay","name":"Lamp"}]}"#;

        gateway.handle_message("device/register", payload).await;
        gateway.handle_message("device/register", payload).await;

        let store = gateway.store();
        assert_eq!(store.device_count(), 1);
        assert_eq!(store.sensor_count(), 1);
        assert_eq!(store.actuator_count(), 1);
    }

    #[tokio::test]
    async fn test_cooldown_through_the_pipeline() {
        let (gateway, _eventloop) = gateway();
        known_device(&gateway, "dev1").await;
        let store = gateway.store().clone();
        store.link_user("user1", "dev1");

        let t0 = Utc::now();
        let payload = r#"{"value":45,"unit":"°C"}"#.as_bytes();
        gateway.handle_message_at("device/dev1/sensor/temp_1/data", payload, t0).await;
        store.set_thresholds("dev1", "temp_1", None, Some(40.0));

        for offset in [10, 20, 30] {
            gateway
                .handle_message_at("device/dev1/sensor/temp_1/data", payload, t0 + Duration::seconds(offset))
                .await;
        }
        assert_eq!(store.notifications().len(), 1);

        gateway
            .handle_message_at(
                "device/dev1/sensor/temp_1/data",
                payload,
                t0 + Duration::seconds(30) + Duration::minutes(5) + Duration::seconds(1),
            )
            .await;
        assert_eq!(store.notifications().len(), 2);
        assert_eq!(store.readings().len(), 5);
    }

    #[tokio::test]
    async fn test_lwt_with_other_status_is_ignored() {
        let (gateway, _eventloop) = gateway();
        known_device(&gateway, "dev1").await;
        let now = Utc::now();
        gateway.store().mark_device_online("dev1", now).await.unwrap();

        gateway
            .handle_message_at("device/dev1/lwt", br#"{"status":"online"}"#, now + Duration::seconds(1))
            .await;

        let device = gateway.store().get_device("dev1").await.unwrap().unwrap();
        assert_eq!(device.status, DeviceStatus::Online);
        assert_eq!(device.updated_at, now);
    }

    #[tokio::test]
    async fn test_lwt_for_unknown_device_creates_nothing() {
        let (gateway, _eventloop) = gateway();

        gateway.handle_message("device/ghost/lwt", br#"{"status":"offline"}"#).await;

        assert_eq!(gateway.store().device_count(), 0);
    }

    #[tokio::test]
    async fn test_actuator_only_report_brings_device_online() {
        let (gateway, _eventloop) = gateway();
        known_device(&gateway, "dev1").await;
        let now = Utc::now() + Duration::seconds(5);

        gateway
            .handle_message_at(
                "device/dev1/data",
                br#"{"device_id":"dev1","actuators":[{"actuator_id":"relay_1","state":"on"}]}"#,
                now,
            )
            .await;

        let store = gateway.store();
        let device = store.get_device("dev1").await.unwrap().unwrap();
        assert_eq!(device.status, DeviceStatus::Online);
        assert_eq!(device.last_seen, Some(now));
        assert!(store.readings().is_empty());

        let relay = store.get_actuator("dev1", "relay_1").await.unwrap().unwrap();
        assert!(relay.state);
        assert_eq!(relay.actuator_type, "relay");
    }

    #[tokio::test]
    async fn test_legacy_list_with_one_bad_entry_keeps_the_rest() {
        let (gateway, _eventloop) = gateway();
        known_device(&gateway, "dev1").await;

        gateway
            .handle_message(
                "iot/device/dev1/data",
                br#"{"sensors":[{"sensor_id":"s1","value":21.5},{"sensor_id":"s2","value":60,"type":"humidity","sensor_type":"humidity"}]}"#,
            )
            .await;
        gateway
            .handle_message(
                "iot/device/dev1/data",
                br#"{"sensors":[{"sensor_id":"s3","value":22},{"sensor_id":"s4","value":61,"unit":5}]}"#,
            )
            .await;

        let store = gateway.store();
        let mut recorded: Vec<_> = store.readings().into_iter().map(|r| r.sensor_id).collect();
        recorded.sort();
        assert_eq!(recorded, vec!["s1", "s2", "s3"]);
        assert_eq!(store.sensor_count(), 3);
        assert_eq!(
            store.get_sensor("dev1", "s2").await.unwrap().unwrap().sensor_type,
            "humidity"
        );
    }

    #[tokio::test]
    async fn test_registration_with_labelled_pins() {
        let (gateway, _eventloop) = gateway();

        gateway
            .handle_message(
                "device/register",
                br#"{"device_id":"dev1","sensors":[{"sensor_id":"s1","type":"temperature","pin":"D4"}]}"#,
            )
            .await;

        let store = gateway.store();
        assert_eq!(store.device_count(), 1);
        assert_eq!(store.get_sensor("dev1", "s1").await.unwrap().unwrap().pin, 4);
    }

    #[tokio::test]
    async fn test_unreadable_registration_creates_nothing() {
        let (gateway, _eventloop) = gateway();

        gateway
            .handle_message("device/register", br#"{"device_id":"dev1","sensors":"oops"}"#)
            .await;

        assert_eq!(gateway.store().device_count(), 0);
    }

    #[tokio::test]
    async fn test_registration_without_id_still_provisions() {
        let (gateway, _eventloop) = gateway();

        gateway
            .handle_message("device/register", br#"{"name":"anonymous","type":"esp32"}"#)
            .await;

        assert_eq!(gateway.store().device_count(), 1);
    }

    #[tokio::test]
    async fn test_unknown_topic_is_dropped() {
        let (gateway, _eventloop) = gateway();
        known_device(&gateway, "dev1").await;

        gateway.handle_message("telemetry/dev1", br#"{"value":1}"#).await;

        assert!(gateway.store().readings().is_empty());
    }
}

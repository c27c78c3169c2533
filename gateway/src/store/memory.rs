use super::Store;
use crate::errors::Result;
use crate::model::{Actuator, Device, DeviceMetadata, DeviceStatus, Notification, Reading, Sensor};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::sync::{Mutex, MutexGuard};

type EntityKey = (String, String);

/// Readings kept by default; older ones are discarded first.
pub const DEFAULT_READING_LIMIT: usize = 100_000;

#[derive(Debug, Default)]
struct Inner {
    devices: BTreeMap<String, Device>,
    sensors: BTreeMap<EntityKey, Sensor>,
    actuators: BTreeMap<EntityKey, Actuator>,
    readings: VecDeque<Reading>,
    links: BTreeSet<EntityKey>,
    notifications: Vec<Notification>,
}

/// In-process store. Each operation runs under one lock, which gives the same
/// conditional-write guarantees as the SQL backend. Meant for development:
/// only the most recent readings are retained and nothing survives a restart.
#[derive(Debug)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
    reading_limit: usize,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::with_reading_limit(DEFAULT_READING_LIMIT)
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_reading_limit(reading_limit: usize) -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
            reading_limit: reading_limit.max(1),
        }
    }

    pub fn reading_limit(&self) -> usize {
        self.reading_limit
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        // A panic while holding the lock leaves plain data behind; keep serving it.
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Hooks standing in for the external CRUD layer, plus inspection helpers.
#[cfg(test)]
impl MemoryStore {
    /// Links a user to a device, as the external layer does when a device is claimed.
    pub fn link_user(&self, user_id: &str, device_id: &str) {
        self.lock().links.insert((user_id.to_string(), device_id.to_string()));
    }

    pub fn readings(&self) -> Vec<Reading> {
        self.lock().readings.iter().cloned().collect()
    }

    pub fn notifications(&self) -> Vec<Notification> {
        self.lock().notifications.clone()
    }

    pub fn device_count(&self) -> usize {
        self.lock().devices.len()
    }

    pub fn sensor_count(&self) -> usize {
        self.lock().sensors.len()
    }

    pub fn actuator_count(&self) -> usize {
        self.lock().actuators.len()
    }

    /// Marks every notification of a user as read.
    pub fn mark_all_read(&self, user_id: &str) {
        for notification in self.lock().notifications.iter_mut().filter(|n| n.user_id == user_id) {
            notification.read = true;
        }
    }

    /// Replaces a sensor's thresholds the way a manual edit would.
    pub fn set_thresholds(&self, device_id: &str, sensor_id: &str, min: Option<f64>, max: Option<f64>) -> bool {
        match self.lock().sensors.get_mut(&(device_id.to_string(), sensor_id.to_string())) {
            Some(sensor) => {
                sensor.min_threshold = min;
                sensor.max_threshold = max;
                true
            }
            None => false,
        }
    }

    pub fn set_last_seen(&self, device_id: &str, last_seen: Option<DateTime<Utc>>) -> bool {
        match self.lock().devices.get_mut(device_id) {
            Some(device) => {
                device.last_seen = last_seen;
                true
            }
            None => false,
        }
    }
}

fn key(device_id: &str, entity_id: &str) -> EntityKey {
    (device_id.to_string(), entity_id.to_string())
}

fn is_stale(device: &Device, cutoff: DateTime<Utc>) -> bool {
    device.status == DeviceStatus::Online && device.last_seen.map_or(true, |seen| seen < cutoff)
}

#[async_trait]
impl Store for MemoryStore {
    async fn get_device(&self, device_id: &str) -> Result<Option<Device>> {
        Ok(self.lock().devices.get(device_id).cloned())
    }

    async fn insert_device(&self, device: &Device) -> Result<bool> {
        let mut inner = self.lock();
        if inner.devices.contains_key(&device.id) {
            return Ok(false);
        }
        inner.devices.insert(device.id.clone(), device.clone());
        Ok(true)
    }

    async fn update_device_metadata(&self, device_id: &str, metadata: &DeviceMetadata, now: DateTime<Utc>) -> Result<bool> {
        let mut inner = self.lock();
        let Some(device) = inner.devices.get_mut(device_id) else {
            return Ok(false);
        };
        if let Some(name) = &metadata.name {
            device.name = name.clone();
        }
        if let Some(device_type) = &metadata.device_type {
            device.device_type = device_type.clone();
        }
        if let Some(ip) = &metadata.ip {
            device.ip = Some(ip.clone());
        }
        device.updated_at = now;
        Ok(true)
    }

    async fn mark_device_online(&self, device_id: &str, now: DateTime<Utc>) -> Result<bool> {
        let mut inner = self.lock();
        let Some(device) = inner.devices.get_mut(device_id) else {
            return Ok(false);
        };
        device.status = DeviceStatus::Online;
        device.last_seen = Some(now);
        device.updated_at = now;
        Ok(true)
    }

    async fn mark_device_offline(&self, device_id: &str, now: DateTime<Utc>) -> Result<bool> {
        let mut inner = self.lock();
        let Some(device) = inner.devices.get_mut(device_id) else {
            return Ok(false);
        };
        device.status = DeviceStatus::Offline;
        device.updated_at = now;
        Ok(true)
    }

    async fn find_stale_online_devices(&self, cutoff: DateTime<Utc>) -> Result<Vec<String>> {
        Ok(self
            .lock()
            .devices
            .values()
            .filter(|d| is_stale(d, cutoff))
            .map(|d| d.id.clone())
            .collect())
    }

    async fn mark_offline_if_stale(&self, device_id: &str, cutoff: DateTime<Utc>, now: DateTime<Utc>) -> Result<bool> {
        let mut inner = self.lock();
        match inner.devices.get_mut(device_id) {
            Some(device) if is_stale(device, cutoff) => {
                device.status = DeviceStatus::Offline;
                device.updated_at = now;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn get_sensor(&self, device_id: &str, sensor_id: &str) -> Result<Option<Sensor>> {
        Ok(self.lock().sensors.get(&key(device_id, sensor_id)).cloned())
    }

    async fn insert_sensor(&self, sensor: &Sensor) -> Result<bool> {
        let mut inner = self.lock();
        if !inner.devices.contains_key(&sensor.device_id) {
            return Ok(false);
        }
        let k = key(&sensor.device_id, &sensor.id);
        if inner.sensors.contains_key(&k) {
            return Ok(false);
        }
        inner.sensors.insert(k, sensor.clone());
        Ok(true)
    }

    async fn list_sensors(&self, device_id: &str) -> Result<Vec<Sensor>> {
        Ok(self
            .lock()
            .sensors
            .values()
            .filter(|s| s.device_id == device_id)
            .cloned()
            .collect())
    }

    async fn get_actuator(&self, device_id: &str, actuator_id: &str) -> Result<Option<Actuator>> {
        Ok(self.lock().actuators.get(&key(device_id, actuator_id)).cloned())
    }

    async fn insert_actuator(&self, actuator: &Actuator) -> Result<bool> {
        let mut inner = self.lock();
        if !inner.devices.contains_key(&actuator.device_id) {
            return Ok(false);
        }
        let k = key(&actuator.device_id, &actuator.id);
        if inner.actuators.contains_key(&k) {
            return Ok(false);
        }
        inner.actuators.insert(k, actuator.clone());
        Ok(true)
    }

    async fn set_actuator_state(&self, device_id: &str, actuator_id: &str, state: bool, now: DateTime<Utc>) -> Result<bool> {
        let mut inner = self.lock();
        let Some(actuator) = inner.actuators.get_mut(&key(device_id, actuator_id)) else {
            return Ok(false);
        };
        actuator.state = state;
        actuator.updated_at = now;
        Ok(true)
    }

    async fn list_actuators(&self, device_id: &str) -> Result<Vec<Actuator>> {
        Ok(self
            .lock()
            .actuators
            .values()
            .filter(|a| a.device_id == device_id)
            .cloned()
            .collect())
    }

    async fn append_reading(&self, reading: &Reading) -> Result<()> {
        let mut inner = self.lock();
        inner.readings.push_back(reading.clone());
        while inner.readings.len() > self.reading_limit {
            inner.readings.pop_front();
        }
        Ok(())
    }

    async fn linked_users(&self, device_id: &str) -> Result<Vec<String>> {
        Ok(self
            .lock()
            .links
            .iter()
            .filter(|(_, device)| device == device_id)
            .map(|(user, _)| user.clone())
            .collect())
    }

    async fn insert_warning_unless_recent(&self, notification: &Notification, since: DateTime<Utc>) -> Result<bool> {
        let mut inner = self.lock();
        let recent = inner.notifications.iter().any(|n| {
            n.user_id == notification.user_id
                && n.device_id == notification.device_id
                && n.sensor_id == notification.sensor_id
                && n.notification_type == notification.notification_type
                && !n.read
                && n.created_at >= since
        });
        if recent {
            return Ok(false);
        }
        inner.notifications.push(notification.clone());
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn device(id: &str, now: DateTime<Utc>) -> Device {
        Device::new(id.to_string(), id.to_string(), "esp32".to_string(), None, now)
    }

    #[test]
    fn test_insert_device_is_idempotent() {
        tokio_test::block_on(async {
            let store = MemoryStore::new();
            let now = Utc::now();
            assert!(store.insert_device(&device("dev1", now)).await.unwrap());
            assert!(!store.insert_device(&device("dev1", now)).await.unwrap());
            assert_eq!(store.device_count(), 1);
        });
    }

    #[test]
    fn test_conditional_offline_skips_fresh_devices() {
        tokio_test::block_on(async {
            let store = MemoryStore::new();
            let now = Utc::now();
            store.insert_device(&device("dev1", now)).await.unwrap();
            store.mark_device_online("dev1", now).await.unwrap();

            let cutoff = now - Duration::minutes(5);
            assert!(!store.mark_offline_if_stale("dev1", cutoff, now).await.unwrap());

            let later = now + Duration::minutes(10);
            assert!(store
                .mark_offline_if_stale("dev1", later - Duration::minutes(5), later)
                .await
                .unwrap());
            let stored = store.get_device("dev1").await.unwrap().unwrap();
            assert_eq!(stored.status, DeviceStatus::Offline);
        });
    }

    #[test]
    fn test_entities_require_their_device() {
        tokio_test::block_on(async {
            let store = MemoryStore::new();
            let now = Utc::now();
            let actuator = Actuator {
                id: "a1".into(),
                device_id: "ghost".into(),
                actuator_type: "relay".into(),
                name: "a1".into(),
                pin: 0,
                state: false,
                enabled: true,
                created_at: now,
                updated_at: now,
            };
            assert!(!store.insert_actuator(&actuator).await.unwrap());
            assert_eq!(store.actuator_count(), 0);
        });
    }

    #[test]
    fn test_oldest_readings_are_discarded_past_the_limit() {
        tokio_test::block_on(async {
            let store = MemoryStore::with_reading_limit(3);
            let now = Utc::now();
            for i in 0..5 {
                store
                    .append_reading(&Reading {
                        sensor_id: "s1".into(),
                        device_id: "dev1".into(),
                        value: i as f64,
                        sensor_type: "temperature".into(),
                        timestamp: now + Duration::seconds(i),
                    })
                    .await
                    .unwrap();
            }

            let values: Vec<f64> = store.readings().iter().map(|r| r.value).collect();
            assert_eq!(values, vec![2.0, 3.0, 4.0]);
            assert_eq!(MemoryStore::new().reading_limit(), DEFAULT_READING_LIMIT);
        });
    }
}

//! Persistence interface shared by the message handlers, the liveness sweeper
//! and the command endpoints.
//!
//! The external CRUD layer writes the same records concurrently, so every
//! mutation here is a single conditional statement keyed on current state.
//! Nothing is cached between calls.

mod memory;
mod postgres;

pub use memory::MemoryStore;
pub use postgres::PgStore;

use crate::errors::Result;
use crate::model::{Actuator, Device, DeviceMetadata, Notification, Reading, Sensor};
use async_trait::async_trait;
use chrono::{DateTime, Utc};

#[async_trait]
pub trait Store: Send + Sync + 'static {
    async fn get_device(&self, device_id: &str) -> Result<Option<Device>>;

    /// Inserts the device unless one with the same id exists. Returns whether
    /// a row was created.
    async fn insert_device(&self, device: &Device) -> Result<bool>;

    /// Overwrites only the fields present in `metadata`.
    async fn update_device_metadata(&self, device_id: &str, metadata: &DeviceMetadata, now: DateTime<Utc>) -> Result<bool>;

    /// Sets the device online and refreshes `last_seen`.
    async fn mark_device_online(&self, device_id: &str, now: DateTime<Utc>) -> Result<bool>;

    /// Sets the device offline regardless of `last_seen`.
    async fn mark_device_offline(&self, device_id: &str, now: DateTime<Utc>) -> Result<bool>;

    /// Online devices never seen, or last seen before `cutoff`.
    async fn find_stale_online_devices(&self, cutoff: DateTime<Utc>) -> Result<Vec<String>>;

    /// Sets the device offline only if it is still online and still stale.
    async fn mark_offline_if_stale(&self, device_id: &str, cutoff: DateTime<Utc>, now: DateTime<Utc>) -> Result<bool>;

    async fn get_sensor(&self, device_id: &str, sensor_id: &str) -> Result<Option<Sensor>>;

    /// Inserts the sensor unless it exists. An existing sensor is never touched.
    async fn insert_sensor(&self, sensor: &Sensor) -> Result<bool>;

    async fn list_sensors(&self, device_id: &str) -> Result<Vec<Sensor>>;

    async fn get_actuator(&self, device_id: &str, actuator_id: &str) -> Result<Option<Actuator>>;

    async fn insert_actuator(&self, actuator: &Actuator) -> Result<bool>;

    async fn set_actuator_state(&self, device_id: &str, actuator_id: &str, state: bool, now: DateTime<Utc>) -> Result<bool>;

    async fn list_actuators(&self, device_id: &str) -> Result<Vec<Actuator>>;

    async fn append_reading(&self, reading: &Reading) -> Result<()>;

    /// Users currently linked to the device by the external layer.
    async fn linked_users(&self, device_id: &str) -> Result<Vec<String>>;

    /// Inserts `notification` unless the same user already has an unread
    /// notification of the same type for the same sensor created at or after
    /// `since`. Returns whether it was inserted.
    async fn insert_warning_unless_recent(&self, notification: &Notification, since: DateTime<Utc>) -> Result<bool>;
}

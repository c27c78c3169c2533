use super::Store;
use crate::errors::{Error, Result};
use crate::model::{Actuator, Device, DeviceMetadata, DeviceStatus, Notification, Reading, Sensor};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgPool, PgPoolOptions};
use std::time::Duration;
use tracing::info;

const DEVICE_COLUMNS: &str =
    "id, name, device_type, ip, enabled, status, last_seen, access_secret, created_at, updated_at";
const SENSOR_COLUMNS: &str = "id, device_id, sensor_type, name, unit, pin, enabled, min_threshold, max_threshold, created_at, updated_at";
const ACTUATOR_COLUMNS: &str = "id, device_id, actuator_type, name, pin, state, enabled, created_at, updated_at";

#[derive(sqlx::FromRow)]
struct DeviceRow {
    id: String,
    name: String,
    device_type: String,
    ip: Option<String>,
    enabled: bool,
    status: String,
    last_seen: Option<DateTime<Utc>>,
    access_secret: Option<String>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl TryFrom<DeviceRow> for Device {
    type Error = Error;

    fn try_from(row: DeviceRow) -> Result<Self> {
        let status: DeviceStatus = row.status.parse().map_err(Error::Payload)?;
        Ok(Device {
            id: row.id,
            name: row.name,
            device_type: row.device_type,
            ip: row.ip,
            enabled: row.enabled,
            status,
            last_seen: row.last_seen,
            access_secret: row.access_secret,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

#[derive(sqlx::FromRow)]
struct SensorRow {
    id: String,
    device_id: String,
    sensor_type: String,
    name: String,
    unit: String,
    pin: i32,
    enabled: bool,
    min_threshold: Option<f64>,
    max_threshold: Option<f64>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl From<SensorRow> for Sensor {
    fn from(row: SensorRow) -> Self {
        Sensor {
            id: row.id,
            device_id: row.device_id,
            sensor_type: row.sensor_type,
            name: row.name,
            unit: row.unit,
            pin: row.pin,
            enabled: row.enabled,
            min_threshold: row.min_threshold,
            max_threshold: row.max_threshold,
            created_at: row.created_at,
            updated_at: row.updated_at,
        }
    }
}

#[derive(sqlx::FromRow)]
struct ActuatorRow {
    id: String,
    device_id: String,
    actuator_type: String,
    name: String,
    pin: i32,
    state: bool,
    enabled: bool,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl From<ActuatorRow> for Actuator {
    fn from(row: ActuatorRow) -> Self {
        Actuator {
            id: row.id,
            device_id: row.device_id,
            actuator_type: row.actuator_type,
            name: row.name,
            pin: row.pin,
            state: row.state,
            enabled: row.enabled,
            created_at: row.created_at,
            updated_at: row.updated_at,
        }
    }
}

/// Postgres-backed store.
#[derive(Debug, Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    /// Connects and applies pending migrations.
    pub async fn connect(database_url: &str) -> Result<Self> {
        info!("Connecting to database...");
        let pool = PgPoolOptions::new()
            .max_connections(20)
            .acquire_timeout(Duration::from_secs(10))
            .connect(database_url)
            .await?;

        info!("Database connection established");
        info!("Running database migrations...");
        sqlx::migrate!("./migrations").run(&pool).await?;
        info!("Migrations completed");

        Ok(Self { pool })
    }
}

#[async_trait]
impl Store for PgStore {
    async fn get_device(&self, device_id: &str) -> Result<Option<Device>> {
        let query = format!("SELECT {} FROM devices WHERE id = $1", DEVICE_COLUMNS);
        let row = sqlx::query_as::<_, DeviceRow>(&query)
            .bind(device_id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(Device::try_from).transpose()
    }

    async fn insert_device(&self, device: &Device) -> Result<bool> {
        let result = sqlx::query(
            r#"
            INSERT INTO devices (id, name, device_type, ip, enabled, status, last_seen, access_secret, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            ON CONFLICT (id) DO NOTHING
            "#,
        )
        .bind(&device.id)
        .bind(&device.name)
        .bind(&device.device_type)
        .bind(&device.ip)
        .bind(device.enabled)
        .bind(device.status.as_str())
        .bind(device.last_seen)
        .bind(&device.access_secret)
        .bind(device.created_at)
        .bind(device.updated_at)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn update_device_metadata(&self, device_id: &str, metadata: &DeviceMetadata, now: DateTime<Utc>) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE devices
            SET name = COALESCE($2, name),
                device_type = COALESCE($3, device_type),
                ip = COALESCE($4, ip),
                updated_at = $5
            WHERE id = $1
            "#,
        )
        .bind(device_id)
        .bind(&metadata.name)
        .bind(&metadata.device_type)
        .bind(&metadata.ip)
        .bind(now)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn mark_device_online(&self, device_id: &str, now: DateTime<Utc>) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE devices SET status = 'online', last_seen = $2, updated_at = $2 WHERE id = $1",
        )
        .bind(device_id)
        .bind(now)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn mark_device_offline(&self, device_id: &str, now: DateTime<Utc>) -> Result<bool> {
        let result = sqlx::query("UPDATE devices SET status = 'offline', updated_at = $2 WHERE id = $1")
            .bind(device_id)
            .bind(now)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn find_stale_online_devices(&self, cutoff: DateTime<Utc>) -> Result<Vec<String>> {
        let ids = sqlx::query_scalar::<_, String>(
            "SELECT id FROM devices WHERE status = 'online' AND (last_seen IS NULL OR last_seen < $1)",
        )
        .bind(cutoff)
        .fetch_all(&self.pool)
        .await?;
        Ok(ids)
    }

    async fn mark_offline_if_stale(&self, device_id: &str, cutoff: DateTime<Utc>, now: DateTime<Utc>) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE devices SET status = 'offline', updated_at = $3
            WHERE id = $1 AND status = 'online' AND (last_seen IS NULL OR last_seen < $2)
            "#,
        )
        .bind(device_id)
        .bind(cutoff)
        .bind(now)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn get_sensor(&self, device_id: &str, sensor_id: &str) -> Result<Option<Sensor>> {
        let query = format!("SELECT {} FROM sensors WHERE device_id = $1 AND id = $2", SENSOR_COLUMNS);
        let row = sqlx::query_as::<_, SensorRow>(&query)
            .bind(device_id)
            .bind(sensor_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(Sensor::from))
    }

    async fn insert_sensor(&self, sensor: &Sensor) -> Result<bool> {
        let result = sqlx::query(
            r#"
            INSERT INTO sensors (id, device_id, sensor_type, name, unit, pin, enabled, min_threshold, max_threshold, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
            ON CONFLICT (device_id, id) DO NOTHING
            "#,
        )
        .bind(&sensor.id)
        .bind(&sensor.device_id)
        .bind(&sensor.sensor_type)
        .bind(&sensor.name)
        .bind(&sensor.unit)
        .bind(sensor.pin)
        .bind(sensor.enabled)
        .bind(sensor.min_threshold)
        .bind(sensor.max_threshold)
        .bind(sensor.created_at)
        .bind(sensor.updated_at)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn list_sensors(&self, device_id: &str) -> Result<Vec<Sensor>> {
        let query = format!("SELECT {} FROM sensors WHERE device_id = $1 ORDER BY id", SENSOR_COLUMNS);
        let rows = sqlx::query_as::<_, SensorRow>(&query)
            .bind(device_id)
            .fetch_all(&self.pool)
            .await?;
        Ok(rows.into_iter().map(Sensor::from).collect())
    }

    async fn get_actuator(&self, device_id: &str, actuator_id: &str) -> Result<Option<Actuator>> {
        let query = format!("SELECT {} FROM actuators WHERE device_id = $1 AND id = $2", ACTUATOR_COLUMNS);
        let row = sqlx::query_as::<_, ActuatorRow>(&query)
            .bind(device_id)
            .bind(actuator_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(Actuator::from))
    }

    async fn insert_actuator(&self, actuator: &Actuator) -> Result<bool> {
        let result = sqlx::query(
            r#"
            INSERT INTO actuators (id, device_id, actuator_type, name, pin, state, enabled, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            ON CONFLICT (device_id, id) DO NOTHING
            "#,
        )
        .bind(&actuator.id)
        .bind(&actuator.device_id)
        .bind(&actuator.actuator_type)
        .bind(&actuator.name)
        .bind(actuator.pin)
        .bind(actuator.state)
        .bind(actuator.enabled)
        .bind(actuator.created_at)
        .bind(actuator.updated_at)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn set_actuator_state(&self, device_id: &str, actuator_id: &str, state: bool, now: DateTime<Utc>) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE actuators SET state = $3, updated_at = $4 WHERE device_id = $1 AND id = $2",
        )
        .bind(device_id)
        .bind(actuator_id)
        .bind(state)
        .bind(now)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn list_actuators(&self, device_id: &str) -> Result<Vec<Actuator>> {
        let query = format!("SELECT {} FROM actuators WHERE device_id = $1 ORDER BY id", ACTUATOR_COLUMNS);
        let rows = sqlx::query_as::<_, ActuatorRow>(&query)
            .bind(device_id)
            .fetch_all(&self.pool)
            .await?;
        Ok(rows.into_iter().map(Actuator::from).collect())
    }

    async fn append_reading(&self, reading: &Reading) -> Result<()> {
        sqlx::query(
            "INSERT INTO readings (sensor_id, device_id, value, sensor_type, ts) VALUES ($1, $2, $3, $4, $5)",
        )
        .bind(&reading.sensor_id)
        .bind(&reading.device_id)
        .bind(reading.value)
        .bind(&reading.sensor_type)
        .bind(reading.timestamp)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn linked_users(&self, device_id: &str) -> Result<Vec<String>> {
        let users = sqlx::query_scalar::<_, String>(
            "SELECT DISTINCT user_id FROM user_devices WHERE device_id = $1",
        )
        .bind(device_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(users)
    }

    async fn insert_warning_unless_recent(&self, notification: &Notification, since: DateTime<Utc>) -> Result<bool> {
        let mut tx = self.pool.begin().await?;

        // Serializes writers for one (user, device, sensor) until commit, so two
        // gateways cannot both pass the NOT EXISTS check.
        sqlx::query("SELECT pg_advisory_xact_lock(hashtext($1 || '/' || $2 || '/' || $3))")
            .bind(&notification.user_id)
            .bind(&notification.device_id)
            .bind(&notification.sensor_id)
            .execute(&mut *tx)
            .await?;

        let result = sqlx::query(
            r#"
            INSERT INTO notifications (id, user_id, device_id, sensor_id, notification_type, message, read, created_at)
            SELECT $1, $2, $3, $4, $5, $6, $7, $8
            WHERE NOT EXISTS (
                SELECT 1 FROM notifications
                WHERE user_id = $2 AND device_id = $3 AND sensor_id = $4
                  AND notification_type = $5 AND read = FALSE AND created_at >= $9
            )
            "#,
        )
        .bind(notification.id)
        .bind(&notification.user_id)
        .bind(&notification.device_id)
        .bind(&notification.sensor_id)
        .bind(&notification.notification_type)
        .bind(&notification.message)
        .bind(notification.read)
        .bind(notification.created_at)
        .bind(since)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(result.rows_affected() == 1)
    }
}

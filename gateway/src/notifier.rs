//! Threshold evaluation and rate-limited warning notifications.
//!
//! One unread warning per (user, sensor) per cooldown window. Which bound was
//! crossed is not part of the key, so a sensor swinging across both bounds
//! within one window yields a single notification for the first violation.

use crate::errors::Result;
use crate::metrics::NOTIFICATIONS_TOTAL;
use crate::model::{Notification, Reading, Sensor};
use crate::store::Store;
use chrono::Duration;
use std::fmt;
use tracing::{debug, info};

pub const DEFAULT_COOLDOWN_SECS: i64 = 300;

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Violation {
    BelowMin { min: f64, by: f64 },
    AboveMax { max: f64, by: f64 },
}

impl fmt::Display for Violation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Violation::BelowMin { min, by } => write!(f, "below the minimum threshold {} by {:.2}", min, by),
            Violation::AboveMax { max, by } => write!(f, "above the maximum threshold {} by {:.2}", max, by),
        }
    }
}

/// Compares a value against the sensor's configured bounds. Sensors without
/// thresholds never violate.
pub fn check_bounds(sensor: &Sensor, value: f64) -> Option<Violation> {
    if let Some(min) = sensor.min_threshold {
        if value < min {
            return Some(Violation::BelowMin { min, by: min - value });
        }
    }
    if let Some(max) = sensor.max_threshold {
        if value > max {
            return Some(Violation::AboveMax { max, by: value - max });
        }
    }
    None
}

pub fn warning_message(sensor: &Sensor, value: f64, violation: &Violation) -> String {
    let unit = if sensor.unit.is_empty() {
        String::new()
    } else {
        format!(" {}", sensor.unit)
    };
    format!(
        "{} ({}) reading {}{} is {}",
        sensor.name, sensor.sensor_type, value, unit, violation
    )
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct NotifyOutcome {
    pub created: usize,
    pub suppressed: usize,
}

/// Raises a warning to every user linked to the sensor's device, unless that
/// user already has an unread one for this sensor inside the cooldown window.
pub async fn evaluate<S: Store>(store: &S, sensor: &Sensor, reading: &Reading, cooldown: Duration) -> Result<NotifyOutcome> {
    let mut outcome = NotifyOutcome::default();
    let Some(violation) = check_bounds(sensor, reading.value) else {
        return Ok(outcome);
    };

    let message = warning_message(sensor, reading.value, &violation);
    let since = reading.timestamp - cooldown;

    for user_id in store.linked_users(&sensor.device_id).await? {
        let notification = Notification::warning(
            &user_id,
            &sensor.device_id,
            &sensor.id,
            message.clone(),
            reading.timestamp,
        );
        if store.insert_warning_unless_recent(&notification, since).await? {
            NOTIFICATIONS_TOTAL.with_label_values(&["created"]).inc();
            info!("Notified user {}: {}", user_id, message);
            outcome.created += 1;
        } else {
            NOTIFICATIONS_TOTAL.with_label_values(&["suppressed"]).inc();
            debug!(
                "Suppressed warning for user {} on sensor {}/{} (cooldown)",
                user_id, sensor.device_id, sensor.id
            );
            outcome.suppressed += 1;
        }
    }

    Ok(outcome)
}

use crate::notifier::DEFAULT_COOLDOWN_SECS;
use crate::sweeper::{DEFAULT_LIVENESS_TIMEOUT_SECS, DEFAULT_SWEEP_INTERVAL_SECS};
use std::env;
use std::str::FromStr;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct MqttConfig {
    pub host: String,
    pub port: u16,
    pub tls: bool,
    pub username: Option<String>,
    pub password: Option<String>,
    pub client_id: String,
    pub keep_alive: Duration,
    /// Topic for the gateway session's own last will, if any.
    pub last_will_topic: Option<String>,
}

impl MqttConfig {
    pub fn credentials(&self) -> Option<(&str, &str)> {
        match (self.username.as_deref(), self.password.as_deref()) {
            (Some(user), Some(pass)) if !user.is_empty() => Some((user, pass)),
            _ => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct GatewayConfig {
    pub mqtt: MqttConfig,
    pub database_url: Option<String>,
    pub http_addr: String,
    pub liveness_timeout: chrono::Duration,
    pub sweep_interval: Duration,
    pub notification_cooldown: chrono::Duration,
}

fn var_or<T: FromStr>(name: &str, default: T) -> T {
    env::var(name)
        .ok()
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(default)
}

/// Longest accepted timeout or cooldown, about ten years.
const MAX_DURATION_SECS: i64 = 10 * 365 * 24 * 60 * 60;

/// Seconds from the environment. Values that are not positive or too large
/// to subtract from a timestamp fall back to `default`.
fn secs_or(name: &str, default: i64) -> chrono::Duration {
    let secs = var_or(name, default);
    let secs = if (1..=MAX_DURATION_SECS).contains(&secs) { secs } else { default };
    chrono::Duration::try_seconds(secs).unwrap_or_else(|| chrono::Duration::seconds(default))
}

fn var_opt(name: &str) -> Option<String> {
    env::var(name).ok().filter(|v| !v.trim().is_empty())
}

impl GatewayConfig {
    pub fn from_env() -> Self {
        let mqtt = MqttConfig {
            host: env::var("MQTT_BROKER").unwrap_or_else(|_| "localhost".to_string()),
            port: var_or("MQTT_PORT", 8883),
            tls: var_or("MQTT_TLS", true),
            username: var_opt("MQTT_USERNAME"),
            password: var_opt("MQTT_PASSWORD"),
            client_id: var_opt("MQTT_CLIENT_ID")
                .unwrap_or_else(|| format!("gateway-{}", uuid::Uuid::new_v4())),
            keep_alive: Duration::from_secs(var_or("MQTT_KEEP_ALIVE_SECS", 60u64).clamp(5, u64::from(u16::MAX))),
            last_will_topic: var_opt("MQTT_LWT_TOPIC"),
        };

        Self {
            mqtt,
            database_url: var_opt("DATABASE_URL"),
            http_addr: env::var("HTTP_ADDR").unwrap_or_else(|_| "0.0.0.0:8080".to_string()),
            liveness_timeout: secs_or("LIVENESS_TIMEOUT_SECS", DEFAULT_LIVENESS_TIMEOUT_SECS),
            sweep_interval: Duration::from_secs(var_or("SWEEP_INTERVAL_SECS", DEFAULT_SWEEP_INTERVAL_SECS).max(1)),
            notification_cooldown: secs_or("NOTIFICATION_COOLDOWN_SECS", DEFAULT_COOLDOWN_SECS),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mqtt(username: Option<&str>, password: Option<&str>) -> MqttConfig {
        MqttConfig {
            host: "localhost".into(),
            port: 8883,
            tls: true,
            username: username.map(str::to_string),
            password: password.map(str::to_string),
            client_id: "test".into(),
            keep_alive: Duration::from_secs(60),
            last_will_topic: None,
        }
    }

    #[test]
    fn test_credentials_need_both_parts() {
        assert_eq!(mqtt(Some("user"), Some("pw")).credentials(), Some(("user", "pw")));
        assert_eq!(mqtt(Some("user"), None).credentials(), None);
        assert_eq!(mqtt(None, Some("pw")).credentials(), None);
    }

    #[test]
    fn test_unparseable_values_fall_back() {
        assert_eq!(var_or("GATEWAY_TEST_UNSET_VARIABLE", 42u16), 42);
    }

    #[test]
    fn test_out_of_range_durations_fall_back() {
        env::set_var("GATEWAY_TEST_HUGE_TIMEOUT", "99999999999999999");
        assert_eq!(secs_or("GATEWAY_TEST_HUGE_TIMEOUT", 300), chrono::Duration::seconds(300));

        env::set_var("GATEWAY_TEST_NEGATIVE_TIMEOUT", "-5");
        assert_eq!(secs_or("GATEWAY_TEST_NEGATIVE_TIMEOUT", 300), chrono::Duration::seconds(300));

        env::set_var("GATEWAY_TEST_SHORT_TIMEOUT", "90");
        assert_eq!(secs_or("GATEWAY_TEST_SHORT_TIMEOUT", 300), chrono::Duration::seconds(90));
    }
}

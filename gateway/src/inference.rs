//! Type inference for sensors and actuators that show up without a declared
//! type, plus the per-type default thresholds applied at creation.

pub const DEFAULT_SENSOR_TYPE: &str = "temperature";
pub const DEFAULT_ACTUATOR_TYPE: &str = "relay";

const SENSOR_ID_HINTS: &[(&str, &str)] = &[
    ("humidity", "humidity"),
    ("hum", "humidity"),
    ("gas", "gas"),
    ("motion", "motion"),
    ("pir", "motion"),
    ("obstacle", "obstacle"),
    ("light", "light"),
    ("temp", "temperature"),
];

const ACTUATOR_ID_HINTS: &[(&str, &str)] = &[
    ("relay", "relay"),
    ("led", "led"),
    ("motor", "motor"),
    ("servo", "servo"),
    ("buzzer", "buzzer"),
    ("fan", "fan"),
];

/// Infers a sensor type from substrings of its id, defaulting to temperature.
pub fn infer_sensor_type(sensor_id: &str) -> &'static str {
    let id = sensor_id.to_lowercase();
    SENSOR_ID_HINTS
        .iter()
        .find(|(hint, _)| id.contains(hint))
        .map(|(_, kind)| *kind)
        .unwrap_or(DEFAULT_SENSOR_TYPE)
}

/// Infers an actuator type from substrings of its id, defaulting to relay.
pub fn infer_actuator_type(actuator_id: &str) -> &'static str {
    let id = actuator_id.to_lowercase();
    ACTUATOR_ID_HINTS
        .iter()
        .find(|(hint, _)| id.contains(hint))
        .map(|(_, kind)| *kind)
        .unwrap_or(DEFAULT_ACTUATOR_TYPE)
}

/// Maps a measurement unit to a sensor type. Returns `None` for units that
/// say nothing useful, so callers can fall back to the id heuristic.
pub fn infer_sensor_type_from_unit(unit: &str) -> Option<&'static str> {
    let unit = unit.trim().to_lowercase();
    if unit.is_empty() {
        return None;
    }
    if unit.contains("°c") || unit.contains("°f") || unit.contains("celsius") || unit.contains("fahrenheit") {
        Some("temperature")
    } else if unit.contains('%') || unit.contains("percent") {
        Some("humidity")
    } else if unit.contains("lux") || unit == "lm" {
        Some("light")
    } else if unit == "w" || unit == "kw" || unit.contains("watt") {
        Some("energy")
    } else if unit.contains("ppm") {
        Some("gas")
    } else {
        None
    }
}

/// Resolves the type of a sensor being created: declared type wins, then the
/// unit, then the id heuristic.
pub fn resolve_sensor_type(sensor_id: &str, declared: Option<&str>, unit: Option<&str>) -> String {
    if let Some(kind) = declared.map(str::trim).filter(|k| !k.is_empty()) {
        return kind.to_lowercase();
    }
    unit.and_then(infer_sensor_type_from_unit)
        .unwrap_or_else(|| infer_sensor_type(sensor_id))
        .to_string()
}

pub fn resolve_actuator_type(actuator_id: &str, declared: Option<&str>) -> String {
    match declared.map(str::trim).filter(|k| !k.is_empty()) {
        Some(kind) => kind.to_lowercase(),
        None => infer_actuator_type(actuator_id).to_string(),
    }
}

/// Default (min, max) thresholds for a freshly created sensor.
pub fn default_thresholds(sensor_type: &str) -> (Option<f64>, Option<f64>) {
    match sensor_type {
        "temperature" => (Some(10.0), Some(40.0)),
        "humidity" => (Some(30.0), Some(80.0)),
        "gas" => (None, Some(100.0)),
        _ => (None, None),
    }
}

pub fn default_unit(sensor_type: &str) -> &'static str {
    match sensor_type {
        "temperature" => "°C",
        "humidity" => "%",
        "gas" => "ppm",
        "light" => "lux",
        "energy" => "W",
        _ => "",
    }
}

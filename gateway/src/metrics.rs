use lazy_static::lazy_static;
use prometheus::{
    Counter, CounterVec, Encoder, Histogram, HistogramOpts, IntGauge, Opts, Registry, TextEncoder,
};

lazy_static! {
    pub static ref REGISTRY: Registry = Registry::new();
    pub static ref MESSAGES_TOTAL: CounterVec = CounterVec::new(
        Opts::new("gateway_messages_total", "Messages received from MQTT, by kind"),
        &["kind"]
    )
    .unwrap();
    pub static ref DROPPED_MESSAGES_TOTAL: CounterVec = CounterVec::new(
        Opts::new("gateway_dropped_messages_total", "Messages dropped, by reason"),
        &["reason"]
    )
    .unwrap();
    pub static ref READINGS_TOTAL: Counter = Counter::with_opts(Opts::new(
        "gateway_readings_total",
        "Readings appended to the store"
    ))
    .unwrap();
    pub static ref REJECTED_READINGS_TOTAL: Counter = Counter::with_opts(Opts::new(
        "gateway_rejected_readings_total",
        "Readings rejected because the value is not a float"
    ))
    .unwrap();
    pub static ref PROVISIONED_TOTAL: CounterVec = CounterVec::new(
        Opts::new("gateway_provisioned_total", "Entities created, by entity"),
        &["entity"]
    )
    .unwrap();
    pub static ref NOTIFICATIONS_TOTAL: CounterVec = CounterVec::new(
        Opts::new("gateway_notifications_total", "Threshold notifications, by outcome"),
        &["outcome"]
    )
    .unwrap();
    pub static ref DEVICES_OFFLINE_TOTAL: CounterVec = CounterVec::new(
        Opts::new("gateway_devices_offline_total", "Online to offline transitions, by cause"),
        &["cause"]
    )
    .unwrap();
    pub static ref COMMANDS_TOTAL: CounterVec = CounterVec::new(
        Opts::new("gateway_commands_total", "Command publish attempts, by result"),
        &["result"]
    )
    .unwrap();
    pub static ref STORE_FAILURES_TOTAL: Counter = Counter::with_opts(Opts::new(
        "gateway_store_failures_total",
        "Store operations that failed while handling a message or sweeping"
    ))
    .unwrap();
    pub static ref MQTT_CONNECTED: IntGauge = IntGauge::with_opts(Opts::new(
        "gateway_mqtt_connected",
        "1 while the broker session is up"
    ))
    .unwrap();
    pub static ref HANDLE_LATENCY_SECONDS: Histogram = Histogram::with_opts(
        HistogramOpts::new(
            "gateway_handle_latency_seconds",
            "Time taken to handle one inbound message"
        )
        .buckets(vec![
            0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0
        ])
    )
    .unwrap();
}

pub fn init_metrics() {
    REGISTRY.register(Box::new(MESSAGES_TOTAL.clone())).unwrap();
    REGISTRY
        .register(Box::new(DROPPED_MESSAGES_TOTAL.clone()))
        .unwrap();
    REGISTRY.register(Box::new(READINGS_TOTAL.clone())).unwrap();
    REGISTRY
        .register(Box::new(REJECTED_READINGS_TOTAL.clone()))
        .unwrap();
    REGISTRY
        .register(Box::new(PROVISIONED_TOTAL.clone()))
        .unwrap();
    REGISTRY
        .register(Box::new(NOTIFICATIONS_TOTAL.clone()))
        .unwrap();
    REGISTRY
        .register(Box::new(DEVICES_OFFLINE_TOTAL.clone()))
        .unwrap();
    REGISTRY.register(Box::new(COMMANDS_TOTAL.clone())).unwrap();
    REGISTRY
        .register(Box::new(STORE_FAILURES_TOTAL.clone()))
        .unwrap();
    REGISTRY.register(Box::new(MQTT_CONNECTED.clone())).unwrap();
    REGISTRY
        .register(Box::new(HANDLE_LATENCY_SECONDS.clone()))
        .unwrap();
}

pub fn gather_metrics() -> String {
    let encoder = TextEncoder::new();
    let metric_families = REGISTRY.gather();
    let mut buffer = Vec::new();
    encoder.encode(&metric_families, &mut buffer).unwrap();
    String::from_utf8(buffer).unwrap()
}

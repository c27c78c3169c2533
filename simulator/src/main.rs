mod telemetry;

use clap::Parser;
use rumqttc::{AsyncClient, Event, LastWill, MqttOptions, Packet, QoS, Transport};
use std::time::Duration;
use telemetry::{Command, RegisterResponse, SimulatedDevice};
use tracing::{error, info, warn};

/// Simulated ESP32 boards talking to the device gateway.
#[derive(Debug, Clone, Parser)]
struct Args {
    #[arg(long, env = "MQTT_BROKER", default_value = "localhost")]
    broker: String,

    #[arg(long, env = "MQTT_PORT", default_value_t = 1883)]
    port: u16,

    #[arg(long, env = "MQTT_TLS", default_value_t = false)]
    tls: bool,

    #[arg(long, env = "MQTT_USERNAME")]
    username: Option<String>,

    #[arg(long, env = "MQTT_PASSWORD")]
    password: Option<String>,

    /// Number of simulated devices
    #[arg(long, env = "DEVICES", default_value_t = 1)]
    devices: usize,

    /// Seconds between telemetry messages per device
    #[arg(long, env = "INTERVAL_SECS", default_value_t = 5)]
    interval_secs: u64,
}

#[tokio::main]
async fn main() {
    let args = Args::parse();

    // Initialize logging
    tracing_subscriber::fmt::init();

    info!("Starting IoT Simulator");
    info!(
        "Broker: {}:{}, Devices: {}, Interval: {}s",
        args.broker, args.port, args.devices, args.interval_secs
    );

    let mut handles = Vec::with_capacity(args.devices);
    for n in 0..args.devices {
        let args = args.clone();
        handles.push(tokio::spawn(async move {
            run_device(args, SimulatedDevice::new(format!("sim-dev-{:02}", n))).await;
        }));
    }

    tokio::select! {
        _ = wait_all(handles) => {
            warn!("All simulated devices stopped");
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Received shutdown signal");
        }
    }
}

async fn wait_all(handles: Vec<tokio::task::JoinHandle<()>>) {
    for handle in handles {
        if let Err(e) = handle.await {
            error!("Device task panicked: {}", e);
        }
    }
}

fn mqtt_options(args: &Args, device_id: &str) -> MqttOptions {
    let client_id = format!("{}-{}", device_id, uuid::Uuid::new_v4().simple());
    let mut options = MqttOptions::new(client_id, &args.broker, args.port);
    options.set_keep_alive(Duration::from_secs(30));
    options.set_clean_session(true);
    options.set_last_will(LastWill::new(
        format!("device/{}/lwt", device_id),
        r#"{"status":"offline"}"#,
        QoS::AtLeastOnce,
        false,
    ));

    if let (Some(user), Some(pass)) = (&args.username, &args.password) {
        options.set_credentials(user, pass);
    }
    if args.tls {
        options.set_transport(Transport::tls_with_default_config());
    }
    options
}

async fn run_device(args: Args, mut device: SimulatedDevice) {
    let device_id = device.device_id.clone();
    let (client, mut eventloop) = AsyncClient::new(mqtt_options(&args, &device_id), 100);

    let command_topic = format!("device/{}/command", device_id);
    let response_topic = format!("device/{}/register/response", device_id);
    let data_topic = format!("device/{}/data", device_id);

    let mut ticker = tokio::time::interval(Duration::from_secs(args.interval_secs.max(1)));
    let mut connected = false;

    loop {
        tokio::select! {
            event = eventloop.poll() => {
                match event {
                    Ok(Event::Incoming(Packet::ConnAck(_))) => {
                        info!("[{}] Connected to MQTT broker", device_id);
                        connected = true;
                        on_connect(&client, &device, &command_topic, &response_topic);
                    }
                    Ok(Event::Incoming(Packet::Publish(publish))) => {
                        if publish.topic == response_topic {
                            log_register_response(&device_id, &publish.payload);
                        } else if publish.topic == command_topic {
                            match serde_json::from_slice::<Command>(&publish.payload) {
                                Ok(command) => {
                                    if let Some(action) = &command.action {
                                        info!("[{}] Received instruction '{}'", device_id, action);
                                    }
                                    device.apply(&command);
                                    info!("[{}] Applied command: {:?}", device_id, command);
                                }
                                Err(e) => warn!("[{}] Failed to parse command: {}", device_id, e),
                            }
                        }
                    }
                    Ok(_) => {}
                    Err(e) => {
                        connected = false;
                        error!("[{}] MQTT eventloop error: {}", device_id, e);
                        tokio::time::sleep(Duration::from_secs(1)).await;
                    }
                }
            }
            _ = ticker.tick() => {
                if !connected {
                    continue;
                }
                let Some(message) = device.sample(&mut rand::thread_rng()) else {
                    continue;
                };
                let payload = match serde_json::to_vec(&message) {
                    Ok(p) => p,
                    Err(e) => {
                        error!("Failed to serialize telemetry: {}", e);
                        continue;
                    }
                };
                if let Err(e) = client.try_publish(&data_topic, QoS::AtLeastOnce, false, payload) {
                    warn!("[{}] Failed to publish: {}", device_id, e);
                }
            }
        }
    }
}

fn on_connect(client: &AsyncClient, device: &SimulatedDevice, command_topic: &str, response_topic: &str) {
    for topic in [command_topic, response_topic] {
        if let Err(e) = client.try_subscribe(topic, QoS::AtLeastOnce) {
            error!("Failed to subscribe to {}: {}", topic, e);
        }
    }

    match serde_json::to_vec(&device.registration()) {
        Ok(payload) => {
            if let Err(e) = client.try_publish("device/register", QoS::AtLeastOnce, false, payload) {
                error!("Failed to publish registration: {}", e);
            }
        }
        Err(e) => error!("Failed to serialize registration: {}", e),
    }
}

fn log_register_response(device_id: &str, payload: &[u8]) {
    match serde_json::from_slice::<RegisterResponse>(payload) {
        Ok(response) if response.status == "success" => {
            info!("[{}] Registered as {}: {}", device_id, response.device_id, response.message)
        }
        Ok(response) => warn!("[{}] Registration failed: {}", device_id, response.message),
        Err(e) => warn!("[{}] Unreadable registration response: {}", device_id, e),
    }
}

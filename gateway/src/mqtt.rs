//! Broker session: connection options, the `is_connected` flag, and the event
//! loop that feeds inbound publishes to the [`Gateway`].
//!
//! There is no reconnect here. When the session drops the loop returns and
//! the connection stays down until something above restarts it.

use crate::config::MqttConfig;
use crate::errors::Result;
use crate::handler::Gateway;
use crate::metrics::MQTT_CONNECTED;
use crate::store::Store;
use crate::topics::SUBSCRIPTIONS;
use rumqttc::{
    AsyncClient, ConnectReturnCode, Event, EventLoop, LastWill, MqttOptions, Outgoing, Packet, QoS,
    SubscribeFilter, Transport,
};
use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

const REQUEST_CAPACITY: usize = 100;

pub fn mqtt_options(config: &MqttConfig) -> MqttOptions {
    let mut options = MqttOptions::new(&config.client_id, &config.host, config.port);
    options.set_keep_alive(config.keep_alive);
    options.set_clean_session(false);

    match config.credentials() {
        Some((user, pass)) => {
            options.set_credentials(user, pass);
        }
        None => warn!("No MQTT credentials configured, connecting anonymously"),
    }

    if let Some(topic) = &config.last_will_topic {
        options.set_last_will(LastWill::new(
            topic.clone(),
            r#"{"status":"offline"}"#,
            QoS::AtLeastOnce,
            false,
        ));
    }

    if config.tls {
        options.set_transport(Transport::tls_with_default_config());
    }

    options
}

/// Handle to the one broker session of the process. Cheap to clone; all
/// clones share the connected flag.
#[derive(Clone)]
pub struct MqttConnection {
    client: AsyncClient,
    connected: Arc<AtomicBool>,
}

impl MqttConnection {
    /// Builds the client. Nothing is sent until the returned event loop is
    /// polled by [`run_event_loop`].
    pub fn new(config: &MqttConfig) -> (Self, EventLoop) {
        info!(
            "Configuring MQTT session to {}:{} (tls={}, client_id={})",
            config.host, config.port, config.tls, config.client_id
        );
        let (client, eventloop) = AsyncClient::new(mqtt_options(config), REQUEST_CAPACITY);
        let connection = Self {
            client,
            connected: Arc::new(AtomicBool::new(false)),
        };
        (connection, eventloop)
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    fn set_connected(&self, connected: bool) {
        self.connected.store(connected, Ordering::SeqCst);
        MQTT_CONNECTED.set(i64::from(connected));
    }

    /// Queues a QoS 1 publish of `payload` as JSON. Never blocks and never
    /// fails loudly: the result says whether the message was handed to the
    /// session.
    pub fn publish_json<T: Serialize>(&self, topic: &str, payload: &T) -> bool {
        if !self.is_connected() {
            warn!("Not connected to broker, dropping publish to {}", topic);
            return false;
        }

        let bytes = match serde_json::to_vec(payload) {
            Ok(bytes) => bytes,
            Err(e) => {
                error!("Failed to serialize payload for {}: {}", topic, e);
                return false;
            }
        };

        match self.client.try_publish(topic, QoS::AtLeastOnce, false, bytes) {
            Ok(()) => {
                debug!("Published to {}", topic);
                true
            }
            Err(e) => {
                error!("Failed to publish to {}: {}", topic, e);
                false
            }
        }
    }

    pub async fn disconnect(&self) {
        if let Err(e) = self.client.disconnect().await {
            debug!("Disconnect request not delivered: {}", e);
        }
        self.set_connected(false);
    }

    fn subscribe_all(&self) {
        let filters = SUBSCRIPTIONS
            .iter()
            .map(|topic| SubscribeFilter::new(topic.to_string(), QoS::AtLeastOnce));
        match self.client.try_subscribe_many(filters) {
            Ok(()) => info!("Subscribed to {} topic filters with QoS 1", SUBSCRIPTIONS.len()),
            Err(e) => error!("Failed to subscribe: {}", e),
        }
    }
}

/// Drives the session. Inbound publishes are handled inline, one at a time,
/// in delivery order. Returns when the session ends.
pub async fn run_event_loop<S: Store>(mut eventloop: EventLoop, gateway: &Gateway<S>) -> Result<()> {
    let connection = gateway.connection();

    loop {
        match eventloop.poll().await {
            Ok(Event::Incoming(Packet::ConnAck(ack))) => {
                if ack.code == ConnectReturnCode::Success {
                    connection.set_connected(true);
                    info!("Connected to MQTT broker");
                    connection.subscribe_all();
                } else {
                    connection.set_connected(false);
                    error!("Broker refused connection: {:?}", ack.code);
                }
            }
            Ok(Event::Incoming(Packet::Publish(publish))) => {
                debug!(
                    "Received message on topic {}, size: {} bytes",
                    publish.topic,
                    publish.payload.len()
                );
                gateway.handle_message(&publish.topic, &publish.payload).await;
            }
            Ok(Event::Incoming(Packet::Disconnect)) | Ok(Event::Outgoing(Outgoing::Disconnect)) => {
                connection.set_connected(false);
                info!("MQTT session closed");
                return Ok(());
            }
            Ok(_) => {}
            Err(e) => {
                connection.set_connected(false);
                error!("MQTT connection lost: {}", e);
                return Err(e.into());
            }
        }
    }
}

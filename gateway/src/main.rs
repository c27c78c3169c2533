mod commands;
mod config;
mod errors;
mod handler;
mod inference;
mod metrics;
mod model;
mod mqtt;
mod notifier;
mod payload;
mod recorder;
mod registry;
mod rest;
mod store;
mod sweeper;
mod topics;

use axum::{routing::get, Router};
use config::GatewayConfig;
use handler::Gateway;
use mqtt::MqttConnection;
use std::sync::Arc;
use store::{MemoryStore, PgStore, Store};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config = GatewayConfig::from_env();

    info!("Starting IoT Device Gateway");
    info!("MQTT broker: {}:{}", config.mqtt.host, config.mqtt.port);
    info!("HTTP server: {}", config.http_addr);

    // Initialize metrics
    metrics::init_metrics();

    match config.database_url.clone() {
        Some(database_url) => {
            info!("Database: {}", database_url.split('@').last().unwrap_or("***"));
            let store = match PgStore::connect(&database_url).await {
                Ok(store) => store,
                Err(e) => {
                    error!("Failed to connect to database: {}", e);
                    std::process::exit(1);
                }
            };
            run(config, Arc::new(store)).await;
        }
        None => {
            let store = MemoryStore::new();
            warn!(
                "DATABASE_URL not set, keeping state in memory. Development only: \
                 nothing survives a restart and only the last {} readings are kept",
                store.reading_limit()
            );
            run(config, Arc::new(store)).await;
        }
    }
}

async fn run<S: Store>(config: GatewayConfig, store: Arc<S>) {
    let (connection, eventloop) = MqttConnection::new(&config.mqtt);
    let gateway = Arc::new(Gateway::new(
        store.clone(),
        connection.clone(),
        config.notification_cooldown,
    ));

    // A lost session stays down; the HTTP side keeps reporting it.
    let mqtt_gateway = gateway.clone();
    tokio::spawn(async move {
        match mqtt::run_event_loop(eventloop, &mqtt_gateway).await {
            Ok(()) => info!("MQTT task finished"),
            Err(e) => error!("MQTT task failed: {}", e),
        }
    });

    let sweeper_handle = tokio::spawn(sweeper::run_sweeper(
        store.clone(),
        config.sweep_interval,
        config.liveness_timeout,
    ));

    // Build HTTP app with REST API and metrics endpoint
    let app = Router::new()
        .route("/metrics", get(metrics_handler))
        .merge(rest::create_router(store, connection.clone()));

    // Start HTTP server
    let listener = tokio::net::TcpListener::bind(&config.http_addr)
        .await
        .unwrap_or_else(|e| {
            error!("Failed to bind to {}: {}", config.http_addr, e);
            std::process::exit(1);
        });

    info!("HTTP server listening on {}", config.http_addr);

    let server_handle = tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap_or_else(|e| {
            error!("HTTP server error: {}", e);
        });
    });

    tokio::select! {
        _ = sweeper_handle => {
            error!("Liveness sweeper terminated");
        }
        _ = server_handle => {
            error!("HTTP server terminated");
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Received shutdown signal");
        }
    }

    info!("Shutting down");
    connection.disconnect().await;
}

async fn metrics_handler() -> String {
    metrics::gather_metrics()
}

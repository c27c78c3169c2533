use crate::commands::{self, DeviceCommand};
use crate::mqtt::MqttConnection;
use crate::store::Store;
use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::Serialize;
use std::sync::Arc;
use tracing::{error, info};

struct AppState<S> {
    store: Arc<S>,
    connection: MqttConnection,
}

impl<S> Clone for AppState<S> {
    fn clone(&self) -> Self {
        Self {
            store: self.store.clone(),
            connection: self.connection.clone(),
        }
    }
}

#[derive(Debug, Serialize, PartialEq)]
pub struct CommandResponse {
    device_id: String,
    published: bool,
}

#[derive(Debug, Serialize, PartialEq)]
pub struct HealthResponse {
    mqtt_connected: bool,
}

pub fn create_router<S: Store>(store: Arc<S>, connection: MqttConnection) -> Router {
    let state = AppState { store, connection };

    Router::new()
        .route("/health", get(health::<S>))
        .route("/api/v1/devices/:device_id/command", post(send_command::<S>))
        .route("/api/v1/devices/:device_id/sync", post(sync_device::<S>))
        .with_state(state)
}

async fn health<S: Store>(State(state): State<AppState<S>>) -> Json<HealthResponse> {
    Json(HealthResponse {
        mqtt_connected: state.connection.is_connected(),
    })
}

/// Pushes an arbitrary command body to the device as-is.
async fn send_command<S: Store>(
    State(state): State<AppState<S>>,
    Path(device_id): Path<String>,
    Json(command): Json<DeviceCommand>,
) -> Json<CommandResponse> {
    let published = commands::publish_command(&state.connection, &device_id, &command);
    Json(CommandResponse { device_id, published })
}

/// Re-sends the stored desired state, e.g. after the device rebooted.
async fn sync_device<S: Store>(
    State(state): State<AppState<S>>,
    Path(device_id): Path<String>,
) -> Result<Response, AppError> {
    let Some(desired) = commands::desired_state(state.store.as_ref(), &device_id).await? else {
        return Ok((StatusCode::NOT_FOUND, format!("Unknown device: {}", device_id)).into_response());
    };

    info!("Syncing desired state to device {}", device_id);
    let published = commands::publish_command(&state.connection, &device_id, &DeviceCommand::DesiredState(desired));
    Ok(Json(CommandResponse { device_id, published }).into_response())
}

struct AppError(anyhow::Error);

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        error!("API error: {}", self.0);
        (
            StatusCode::INTERNAL_SERVER_ERROR,
            format!("Internal server error: {}", self.0),
        )
            .into_response()
    }
}

impl<E> From<E> for AppError
where
    E: Into<anyhow::Error>,
{
    fn from(err: E) -> Self {
        Self(err.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MqttConfig;
    use crate::model::Device;
    use crate::store::MemoryStore;
    use chrono::Utc;
    use std::time::Duration;

    fn state() -> (AppState<MemoryStore>, rumqttc::EventLoop) {
        let (connection, eventloop) = MqttConnection::new(&MqttConfig {
            host: "localhost".into(),
            port: 1883,
            tls: false,
            username: None,
            password: None,
            client_id: "rest-test".into(),
            keep_alive: Duration::from_secs(30),
            last_will_topic: None,
        });
        let state = AppState {
            store: Arc::new(MemoryStore::new()),
            connection,
        };
        (state, eventloop)
    }

    #[tokio::test]
    async fn test_health_reports_session_state() {
        let (state, _eventloop) = state();
        let Json(body) = health(State(state)).await;
        assert_eq!(body, HealthResponse { mqtt_connected: false });
    }

    #[tokio::test]
    async fn test_command_while_disconnected_reports_not_published() {
        let (state, _eventloop) = state();
        let command: DeviceCommand = serde_json::from_str(r#"{"action":"reboot"}"#).unwrap();

        let Json(body) = send_command(State(state), Path("dev1".to_string()), Json(command)).await;
        assert_eq!(
            body,
            CommandResponse {
                device_id: "dev1".into(),
                published: false
            }
        );
    }

    #[tokio::test]
    async fn test_sync_unknown_device_is_not_found() {
        let (state, _eventloop) = state();
        let response = match sync_device(State(state), Path("ghost".to_string())).await {
            Ok(response) => response,
            Err(_) => panic!("sync of unknown device should not fail"),
        };
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_sync_known_device() {
        let (state, _eventloop) = state();
        state
            .store
            .insert_device(&Device::new("dev1".into(), "d".into(), "esp32".into(), None, Utc::now()))
            .await
            .unwrap();

        let response = match sync_device(State(state), Path("dev1".to_string())).await {
            Ok(response) => response,
            Err(_) => panic!("sync should not fail"),
        };
        assert_eq!(response.status(), StatusCode::OK);
    }
}

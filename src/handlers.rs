use axum::extract::rejection::JsonRejection;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::Json;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::background::BackgroundTaskTracker;
use crate::config::Config;
use crate::error::ThrottlerError;

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub tracker: BackgroundTaskTracker,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct SystemInfo {
    pub environment: String,
    pub version: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub system_info: SystemInfo,
}

#[derive(Debug, Deserialize)]
pub struct NotificationRequest {
    pub recipient: String,
    #[serde(default)]
    pub message: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct NotificationResponse {
    pub status: String,
    pub task_id: String,
}

/// Health check endpoint
pub async fn health_check(State(state): State<AppState>) -> impl IntoResponse {
    Json(HealthResponse {
        status: "available".to_string(),
        system_info: SystemInfo {
            environment: state.config.environment.clone(),
            version: env!("CARGO_PKG_VERSION").to_string(),
        },
    })
}

/// Queue a notification and answer before it is delivered.
pub async fn send_notification(
    State(state): State<AppState>,
    payload: Result<Json<NotificationRequest>, JsonRejection>,
) -> Result<impl IntoResponse, ThrottlerError> {
    let Json(payload) =
        payload.map_err(|rejection| json_error(rejection, state.config.max_body_bytes))?;

    let recipient = payload.recipient.trim().to_string();
    if recipient.is_empty() {
        return Err(ThrottlerError::ValidationError(
            "recipient must be provided".to_string(),
        ));
    }

    let delay = state.config.notification_delay;
    let message = payload.message;
    let task_id = state.tracker.run("notification", async move {
        tokio::time::sleep(delay).await;
        tracing::info!(
            recipient = %recipient,
            message_len = message.len(),
            "notification delivered"
        );
    });

    Ok((
        StatusCode::ACCEPTED,
        Json(NotificationResponse {
            status: "queued".to_string(),
            task_id: task_id.to_string(),
        }),
    ))
}

/// Report a body the JSON extractor refused in the error envelope.
fn json_error(rejection: JsonRejection, body_limit: usize) -> ThrottlerError {
    if rejection.status() == StatusCode::PAYLOAD_TOO_LARGE {
        return ThrottlerError::PayloadTooLarge { limit: body_limit };
    }

    match rejection {
        JsonRejection::JsonSyntaxError(_) => {
            ThrottlerError::BadRequest("body contains badly-formed JSON".to_string())
        }
        JsonRejection::MissingJsonContentType(_) => {
            ThrottlerError::BadRequest("body must be sent as application/json".to_string())
        }
        other => ThrottlerError::BadRequest(other.body_text()),
    }
}

pub async fn not_found() -> ThrottlerError {
    ThrottlerError::NotFound
}

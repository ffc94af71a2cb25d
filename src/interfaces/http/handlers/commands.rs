//! Central system command handler
//!
//! `POST /connections/{charge_point_id}/commands` sends one OCPP Call to the
//! charge point and returns its response payload.

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Deserialize;
use serde_json::Value;
use validator::Validate;

use crate::application::handlers::ocpp_v16::is_cs_to_cp_action;
use crate::application::CommandError;
use crate::interfaces::http::common::{error_response, ApiResponse};
use crate::interfaces::http::router::ApiState;

#[derive(Debug, Deserialize, Validate)]
pub struct CommandRequest {
    #[validate(length(min = 1, max = 64))]
    pub action: String,
    #[serde(default = "empty_object")]
    pub payload: Value,
}

fn empty_object() -> Value {
    Value::Object(Default::default())
}

pub async fn send_command(
    State(state): State<ApiState>,
    Path(charge_point_id): Path<String>,
    Json(request): Json<CommandRequest>,
) -> Response {
    if let Err(e) = request.validate() {
        return error_response(StatusCode::UNPROCESSABLE_ENTITY, e.to_string());
    }
    if !is_cs_to_cp_action(&request.action) {
        return error_response(
            StatusCode::UNPROCESSABLE_ENTITY,
            format!("{} is not a central system action", request.action),
        );
    }
    if !request.payload.is_object() {
        return error_response(StatusCode::UNPROCESSABLE_ENTITY, "payload must be an object");
    }

    match state
        .commands
        .send_command(&charge_point_id, &request.action, request.payload)
        .await
    {
        Ok(payload) => Json(ApiResponse::success(payload)).into_response(),
        Err(e) => error_response(command_status(&e), e.to_string()),
    }
}

fn command_status(error: &CommandError) -> StatusCode {
    match error {
        CommandError::NotConnected(_) => StatusCode::NOT_FOUND,
        CommandError::RemoteInstance { .. } => StatusCode::MISDIRECTED_REQUEST,
        CommandError::Timeout => StatusCode::GATEWAY_TIMEOUT,
        CommandError::CallError { .. } => StatusCode::BAD_GATEWAY,
        CommandError::SendFailed(_) | CommandError::Closed => StatusCode::SERVICE_UNAVAILABLE,
        CommandError::Duplicate(_) => StatusCode::CONFLICT,
        CommandError::Registry(_) => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn payload_defaults_to_empty_object() {
        let request: CommandRequest = serde_json::from_str(r#"{"action":"ClearCache"}"#).unwrap();
        assert!(request.validate().is_ok());
        assert_eq!(request.payload, serde_json::json!({}));
    }

    #[test]
    fn command_errors_map_to_http_status() {
        assert_eq!(
            command_status(&CommandError::NotConnected("CP1".into())),
            StatusCode::NOT_FOUND
        );
        assert_eq!(command_status(&CommandError::Timeout), StatusCode::GATEWAY_TIMEOUT);
        assert_eq!(
            command_status(&CommandError::RemoteInstance {
                charge_point_id: "CP1".into(),
                instance_id: "gw-2".into(),
            }),
            StatusCode::MISDIRECTED_REQUEST
        );
    }
}

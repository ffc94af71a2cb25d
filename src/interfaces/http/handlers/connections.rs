//! Connection introspection handlers

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;

use crate::interfaces::http::common::{error_response, ApiResponse};
use crate::interfaces::http::router::ApiState;
use crate::interfaces::ws::ConnectionSnapshot;

/// `GET /connections`
pub async fn list_connections(
    State(state): State<ApiState>,
) -> Json<ApiResponse<Vec<ConnectionSnapshot>>> {
    Json(ApiResponse::success(state.manager.snapshots()))
}

/// `GET /connections/{charge_point_id}`
pub async fn get_connection(
    State(state): State<ApiState>,
    Path(charge_point_id): Path<String>,
) -> Response {
    match state.manager.snapshot(&charge_point_id) {
        Some(snapshot) => Json(ApiResponse::success(snapshot)).into_response(),
        None => error_response(
            StatusCode::NOT_FOUND,
            format!("Charge point not connected: {}", charge_point_id),
        ),
    }
}

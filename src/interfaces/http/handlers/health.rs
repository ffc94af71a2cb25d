//! Health check handler

use axum::extract::State;
use axum::Json;
use serde::Serialize;

use crate::application::events::EventBusStats;
use crate::application::handlers::ProcessorStats;
use crate::interfaces::http::router::ApiState;
use crate::interfaces::ws::PingStats;

/// Service health response
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
    pub instance_id: String,
    pub uptime_seconds: u64,
    pub active_connections: usize,
    pub max_connections: usize,
    pub pending_requests: usize,
    pub active_transactions: usize,
    pub ping: PingStats,
    pub events: EventBusStats,
    pub processor: ProcessorStats,
}

pub async fn health_check(State(state): State<ApiState>) -> Json<HealthResponse> {
    let status = if state.shutdown.is_triggered() {
        "shutting_down"
    } else {
        "ok"
    };

    Json(HealthResponse {
        status: status.to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        instance_id: state.instance_id.to_string(),
        uptime_seconds: state.started_at.elapsed().as_secs(),
        active_connections: state.manager.count(),
        max_connections: state.manager.max_connections(),
        pending_requests: state.pending.len(),
        active_transactions: state.transactions.active_count(),
        ping: state.manager.ping_stats(),
        events: state.event_bus.stats(),
        processor: state.processor.stats(),
    })
}

//! API router

use std::sync::Arc;
use std::time::Instant;

use axum::routing::{get, post};
use axum::{middleware, Router};
use metrics_exporter_prometheus::PrometheusHandle;
use tower_http::trace::TraceLayer;

use crate::application::events::SharedEventBus;
use crate::application::handlers::OcppV16Processor;
use crate::application::pending::SharedPendingRequests;
use crate::application::SharedCommandSender;
use crate::domain::TransactionStore;
use crate::interfaces::ws::SharedConnectionManager;
use crate::support::shutdown::ShutdownSignal;

use super::handlers::{commands, connections, health, metrics};

/// State shared by every HTTP handler
#[derive(Clone)]
pub struct ApiState {
    pub manager: SharedConnectionManager,
    pub commands: SharedCommandSender,
    pub processor: Arc<OcppV16Processor>,
    pub pending: SharedPendingRequests,
    pub transactions: Arc<TransactionStore>,
    pub event_bus: SharedEventBus,
    pub prometheus: Option<PrometheusHandle>,
    pub shutdown: ShutdownSignal,
    pub instance_id: Arc<str>,
    pub started_at: Instant,
}

/// Create the API router with all routes
pub fn create_api_router(state: ApiState) -> Router {
    Router::new()
        .route("/health", get(health::health_check))
        .route("/connections", get(connections::list_connections))
        .route("/connections/{charge_point_id}", get(connections::get_connection))
        .route(
            "/connections/{charge_point_id}/commands",
            post(commands::send_command),
        )
        .route("/metrics", get(metrics::prometheus_metrics))
        .route_layer(middleware::from_fn(metrics::http_metrics_middleware))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

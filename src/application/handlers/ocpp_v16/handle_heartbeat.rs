//! Heartbeat handler

use chrono::Utc;
use rust_ocpp::v1_6::messages::heart_beat::HeartbeatResponse;
use tracing::{debug, warn};

use super::messages::HeartbeatRequest;
use super::HandlerResult;
use crate::application::handlers::OcppV16Processor;
use crate::application::registry::set_with_timeout;
use crate::domain::events::{DomainEvent, HeartbeatEvent};
use crate::interfaces::ws::dispatcher::DispatchContext;

pub async fn handle_heartbeat(
    processor: &OcppV16Processor,
    ctx: &DispatchContext,
    _req: HeartbeatRequest,
) -> HandlerResult<HeartbeatResponse> {
    let charge_point_id = ctx.charge_point_id();
    let now = Utc::now();

    debug!(charge_point_id, "Heartbeat");
    processor.charge_points.record_heartbeat(charge_point_id, now);

    if let Err(e) = set_with_timeout(
        processor.registry.as_ref(),
        charge_point_id,
        &processor.settings.instance_id,
        processor.settings.registry_ttl,
        processor.settings.registry_write_timeout,
    )
    .await
    {
        warn!(charge_point_id, error = %e, "Failed to refresh registry TTL");
    }

    let event = DomainEvent::HeartbeatReceived(HeartbeatEvent {
        charge_point_id: charge_point_id.to_string(),
        timestamp: now,
    });

    Ok((HeartbeatResponse { current_time: now }, vec![event]))
}

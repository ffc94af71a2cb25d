//! BootNotification handler

use chrono::Utc;
use rust_ocpp::v1_6::messages::boot_notification::BootNotificationResponse;
use rust_ocpp::v1_6::types::RegistrationStatus;
use tracing::{info, warn};

use super::messages::BootNotificationRequest;
use super::HandlerResult;
use crate::application::handlers::OcppV16Processor;
use crate::application::registry::set_with_timeout;
use crate::domain::events::{BootNotificationEvent, DomainEvent};
use crate::domain::BootInfo;
use crate::interfaces::ws::connection::ConnectionState;
use crate::interfaces::ws::dispatcher::DispatchContext;

pub async fn handle_boot_notification(
    processor: &OcppV16Processor,
    ctx: &DispatchContext,
    req: BootNotificationRequest,
) -> HandlerResult<BootNotificationResponse> {
    let charge_point_id = ctx.charge_point_id();
    let now = Utc::now();

    info!(
        charge_point_id,
        vendor = req.charge_point_vendor.as_str(),
        model = req.charge_point_model.as_str(),
        firmware = ?req.firmware_version,
        "BootNotification"
    );

    processor.charge_points.record_boot(
        charge_point_id,
        BootInfo {
            vendor: req.charge_point_vendor.clone(),
            model: req.charge_point_model.clone(),
            serial_number: req.charge_point_serial_number.clone(),
            firmware_version: req.firmware_version.clone(),
        },
        now,
    );

    // Ownership is refreshed on every boot. A slow registry must not hold
    // up the reply.
    if let Err(e) = set_with_timeout(
        processor.registry.as_ref(),
        charge_point_id,
        &processor.settings.instance_id,
        processor.settings.registry_ttl,
        processor.settings.registry_write_timeout,
    )
    .await
    {
        warn!(charge_point_id, error = %e, "Failed to record connection in registry");
    }

    if let Err(e) = ctx.connection.transition(ConnectionState::Registered) {
        warn!(charge_point_id, error = %e, "Could not mark connection registered");
    }

    let event = DomainEvent::BootNotification(BootNotificationEvent {
        charge_point_id: charge_point_id.to_string(),
        vendor: req.charge_point_vendor,
        model: req.charge_point_model,
        serial_number: req.charge_point_serial_number,
        firmware_version: req.firmware_version,
        timestamp: now,
    });

    let response = BootNotificationResponse {
        current_time: now,
        interval: processor.settings.heartbeat_interval.min(i32::MAX as u32),
        status: RegistrationStatus::Accepted,
    };

    Ok((response, vec![event]))
}

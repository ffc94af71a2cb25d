//! FirmwareStatusNotification handler

use rust_ocpp::v1_6::messages::firmware_status_notification::FirmwareStatusNotificationResponse;
use tracing::info;

use super::messages::FirmwareStatusNotificationRequest;
use super::HandlerResult;
use crate::application::handlers::OcppV16Processor;
use crate::interfaces::ws::dispatcher::DispatchContext;

pub async fn handle_firmware_status_notification(
    _processor: &OcppV16Processor,
    ctx: &DispatchContext,
    req: FirmwareStatusNotificationRequest,
) -> HandlerResult<FirmwareStatusNotificationResponse> {
    info!(
        charge_point_id = ctx.charge_point_id(),
        status = req.status.as_str(),
        "FirmwareStatusNotification"
    );
    Ok((FirmwareStatusNotificationResponse {}, Vec::new()))
}

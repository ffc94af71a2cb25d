//! DiagnosticsStatusNotification handler

use rust_ocpp::v1_6::messages::diagnostics_status_notification::DiagnosticsStatusNotificationResponse;
use tracing::info;

use super::messages::DiagnosticsStatusNotificationRequest;
use super::HandlerResult;
use crate::application::handlers::OcppV16Processor;
use crate::interfaces::ws::dispatcher::DispatchContext;

pub async fn handle_diagnostics_status_notification(
    _processor: &OcppV16Processor,
    ctx: &DispatchContext,
    req: DiagnosticsStatusNotificationRequest,
) -> HandlerResult<DiagnosticsStatusNotificationResponse> {
    info!(
        charge_point_id = ctx.charge_point_id(),
        status = req.status.as_str(),
        "DiagnosticsStatusNotification"
    );
    Ok((DiagnosticsStatusNotificationResponse {}, Vec::new()))
}

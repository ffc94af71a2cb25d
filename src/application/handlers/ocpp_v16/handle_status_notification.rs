//! StatusNotification handler

use chrono::Utc;
use rust_ocpp::v1_6::messages::status_notification::StatusNotificationResponse;
use rust_ocpp::v1_6::types::ChargePointStatus;
use tracing::info;

use super::messages::StatusNotificationRequest;
use super::HandlerResult;
use crate::application::handlers::OcppV16Processor;
use crate::domain::events::{ConnectorStatusChangedEvent, DomainEvent};
use crate::domain::{ConnectorStatus, StatusChange};
use crate::interfaces::ws::dispatcher::DispatchContext;

fn connector_status(status: &ChargePointStatus) -> ConnectorStatus {
    match status {
        ChargePointStatus::Available => ConnectorStatus::Available,
        ChargePointStatus::Preparing => ConnectorStatus::Preparing,
        ChargePointStatus::Charging => ConnectorStatus::Charging,
        ChargePointStatus::SuspendedEV => ConnectorStatus::SuspendedEV,
        ChargePointStatus::SuspendedEVSE => ConnectorStatus::SuspendedEVSE,
        ChargePointStatus::Finishing => ConnectorStatus::Finishing,
        ChargePointStatus::Reserved => ConnectorStatus::Reserved,
        ChargePointStatus::Unavailable => ConnectorStatus::Unavailable,
        ChargePointStatus::Faulted => ConnectorStatus::Faulted,
    }
}

pub async fn handle_status_notification(
    processor: &OcppV16Processor,
    ctx: &DispatchContext,
    req: StatusNotificationRequest,
) -> HandlerResult<StatusNotificationResponse> {
    let charge_point_id = ctx.charge_point_id();
    let status = connector_status(&req.status);

    info!(
        charge_point_id,
        connector_id = req.connector_id,
        %status,
        error_code = req.error_code.as_str(),
        "StatusNotification"
    );

    let change = processor.charge_points.update_connector_status(
        charge_point_id,
        req.connector_id,
        status,
        Some(req.error_code.clone()),
        req.info.clone(),
    );

    let events = match change {
        StatusChange::Changed { old } => {
            vec![DomainEvent::ConnectorStatusChanged(ConnectorStatusChangedEvent {
                charge_point_id: charge_point_id.to_string(),
                connector_id: req.connector_id,
                old_status: old.to_string(),
                new_status: status.to_string(),
                error_code: Some(req.error_code),
                info: req.info,
                timestamp: req.timestamp.unwrap_or_else(Utc::now),
            })]
        }
        StatusChange::Created | StatusChange::Unchanged => Vec::new(),
    };

    Ok((StatusNotificationResponse {}, events))
}

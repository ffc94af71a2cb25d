//! StopTransaction handler

use rust_ocpp::v1_6::messages::stop_transaction::StopTransactionResponse;
use tracing::{info, warn};

use super::handle_authorize::id_tag_info;
use super::messages::StopTransactionRequest;
use super::HandlerResult;
use crate::application::handlers::OcppV16Processor;
use crate::domain::events::{DomainEvent, TransactionStoppedEvent};
use crate::interfaces::ws::dispatcher::DispatchContext;

pub async fn handle_stop_transaction(
    processor: &OcppV16Processor,
    ctx: &DispatchContext,
    req: StopTransactionRequest,
) -> HandlerResult<StopTransactionResponse> {
    let charge_point_id = ctx.charge_point_id();
    let transaction_id = req.transaction_id;

    // idTagInfo is only returned when the charge point sent an idTag.
    let response = StopTransactionResponse {
        id_tag_info: req.id_tag.as_deref().map(|tag| id_tag_info(processor, tag)),
    };

    let Some(tx) = processor.transactions.stop(
        charge_point_id,
        transaction_id,
        req.meter_stop,
        req.reason.clone(),
        req.timestamp,
    ) else {
        warn!(
            charge_point_id,
            transaction_id,
            meter_stop = req.meter_stop,
            "StopTransaction for unknown, foreign or already stopped transaction"
        );
        return Ok((response, Vec::new()));
    };

    let energy_used_kwh = tx.energy_consumed_kwh().unwrap_or_default();

    info!(
        charge_point_id,
        transaction_id,
        meter_start = tx.meter_start,
        meter_stop = req.meter_stop,
        energy_used_kwh,
        reason = ?req.reason,
        "StopTransaction"
    );

    let event = DomainEvent::TransactionStopped(TransactionStoppedEvent {
        charge_point_id: charge_point_id.to_string(),
        connector_id: tx.connector_id,
        transaction_id,
        id_tag: req.id_tag.or(Some(tx.id_tag)),
        meter_start: tx.meter_start,
        meter_stop: req.meter_stop,
        energy_used_kwh,
        reason: req.reason,
        timestamp: req.timestamp,
    });

    Ok((response, vec![event]))
}

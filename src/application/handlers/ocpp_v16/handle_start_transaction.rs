//! StartTransaction handler

use rust_ocpp::v1_6::messages::start_transaction::StartTransactionResponse;
use tracing::info;

use super::handle_authorize::id_tag_info;
use super::messages::StartTransactionRequest;
use super::HandlerResult;
use crate::application::handlers::OcppV16Processor;
use crate::domain::events::{DomainEvent, TransactionStartedEvent};
use crate::interfaces::ws::dispatcher::DispatchContext;

pub async fn handle_start_transaction(
    processor: &OcppV16Processor,
    ctx: &DispatchContext,
    req: StartTransactionRequest,
) -> HandlerResult<StartTransactionResponse> {
    let charge_point_id = ctx.charge_point_id();
    let id_tag_info = id_tag_info(processor, &req.id_tag);

    // A transaction id is allocated even for a rejected tag; the charge
    // point ends that session with a StopTransaction of its own.
    let tx = processor.transactions.start(
        charge_point_id,
        req.connector_id,
        &req.id_tag,
        req.meter_start,
        req.timestamp,
    );

    info!(
        charge_point_id,
        connector_id = req.connector_id,
        transaction_id = tx.id,
        id_tag = req.id_tag.as_str(),
        meter_start = req.meter_start,
        status = ?id_tag_info.status,
        "StartTransaction"
    );

    let event = DomainEvent::TransactionStarted(TransactionStartedEvent {
        charge_point_id: charge_point_id.to_string(),
        connector_id: req.connector_id,
        transaction_id: tx.id,
        id_tag: req.id_tag,
        meter_start: req.meter_start,
        timestamp: req.timestamp,
    });

    Ok((
        StartTransactionResponse {
            transaction_id: tx.id,
            id_tag_info,
        },
        vec![event],
    ))
}

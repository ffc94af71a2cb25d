//! DataTransfer handler

use rust_ocpp::v1_6::messages::data_transfer::DataTransferResponse;
use rust_ocpp::v1_6::types::DataTransferStatus;
use tracing::info;

use super::messages::DataTransferRequest;
use super::HandlerResult;
use crate::application::handlers::OcppV16Processor;
use crate::interfaces::ws::dispatcher::DispatchContext;

pub async fn handle_data_transfer(
    _processor: &OcppV16Processor,
    ctx: &DispatchContext,
    req: DataTransferRequest,
) -> HandlerResult<DataTransferResponse> {
    info!(
        charge_point_id = ctx.charge_point_id(),
        vendor_id = req.vendor_id.as_str(),
        message_id = ?req.message_id,
        data_len = req.data.as_ref().map(|d| d.len()).unwrap_or(0),
        "DataTransfer"
    );

    Ok((
        DataTransferResponse {
            status: DataTransferStatus::Accepted,
            data: None,
        },
        Vec::new(),
    ))
}

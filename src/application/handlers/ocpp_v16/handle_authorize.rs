//! Authorize handler

use chrono::Utc;
use rust_ocpp::v1_6::messages::authorize::AuthorizeResponse;
use rust_ocpp::v1_6::types::{AuthorizationStatus, IdTagInfo};
use tracing::info;

use super::messages::AuthorizeRequest;
use super::HandlerResult;
use crate::application::handlers::OcppV16Processor;
use crate::domain::events::{AuthorizationEvent, DomainEvent};
use crate::interfaces::ws::dispatcher::DispatchContext;

/// Authorization decision for an id tag. Everything not on the block list
/// is accepted.
pub(super) fn id_tag_info(processor: &OcppV16Processor, id_tag: &str) -> IdTagInfo {
    let status = if processor.is_blocked(id_tag) {
        AuthorizationStatus::Blocked
    } else {
        AuthorizationStatus::Accepted
    };
    IdTagInfo {
        status,
        expiry_date: None,
        parent_id_tag: None,
    }
}

pub async fn handle_authorize(
    processor: &OcppV16Processor,
    ctx: &DispatchContext,
    req: AuthorizeRequest,
) -> HandlerResult<AuthorizeResponse> {
    let id_tag_info = id_tag_info(processor, &req.id_tag);

    info!(
        charge_point_id = ctx.charge_point_id(),
        id_tag = req.id_tag.as_str(),
        status = ?id_tag_info.status,
        "Authorize"
    );

    let event = DomainEvent::AuthorizationResult(AuthorizationEvent {
        charge_point_id: ctx.charge_point_id().to_string(),
        id_tag: req.id_tag,
        status: format!("{:?}", id_tag_info.status),
        timestamp: Utc::now(),
    });

    Ok((AuthorizeResponse { id_tag_info }, vec![event]))
}

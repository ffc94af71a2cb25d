//! OCPP 1.6 Action handlers
//!
//! Routes action names to their handlers. Each handler receives the
//! validated request and returns the typed response together with the
//! domain events it produced; the processor publishes the events only when
//! the handler succeeds.

use serde::Serialize;
use serde_json::Value;

use crate::application::handlers::OcppV16Processor;
use crate::domain::events::DomainEvent;
use crate::interfaces::ws::dispatcher::DispatchContext;

pub mod messages;

mod handle_authorize;
mod handle_boot_notification;
mod handle_data_transfer;
mod handle_diagnostics_status_notification;
mod handle_firmware_status_notification;
mod handle_heartbeat;
mod handle_meter_values;
mod handle_start_transaction;
mod handle_status_notification;
mod handle_stop_transaction;

pub use handle_authorize::handle_authorize;
pub use handle_boot_notification::handle_boot_notification;
pub use handle_data_transfer::handle_data_transfer;
pub use handle_diagnostics_status_notification::handle_diagnostics_status_notification;
pub use handle_firmware_status_notification::handle_firmware_status_notification;
pub use handle_heartbeat::handle_heartbeat;
pub use handle_meter_values::handle_meter_values;
pub use handle_start_transaction::handle_start_transaction;
pub use handle_status_notification::handle_status_notification;
pub use handle_stop_transaction::handle_stop_transaction;

pub use messages::{decode, CallFailure};

/// Typed response plus the events to publish on success
pub type HandlerResult<T> = Result<(T, Vec<DomainEvent>), CallFailure>;

/// Actions a charge point may send
pub const SUPPORTED_ACTIONS: &[&str] = &[
    "Authorize",
    "BootNotification",
    "DataTransfer",
    "DiagnosticsStatusNotification",
    "FirmwareStatusNotification",
    "Heartbeat",
    "MeterValues",
    "StartTransaction",
    "StatusNotification",
    "StopTransaction",
];

fn encode<T: Serialize>(result: HandlerResult<T>) -> Result<(Value, Vec<DomainEvent>), CallFailure> {
    let (response, events) = result?;
    let payload = serde_json::to_value(&response)
        .map_err(|e| CallFailure::internal(format!("failed to encode response: {}", e)))?;
    Ok((payload, events))
}

/// Routes OCPP 1.6 actions to their respective handlers.
///
/// The caller has already checked `action` against `SUPPORTED_ACTIONS`.
pub async fn action_matcher(
    processor: &OcppV16Processor,
    ctx: &DispatchContext,
    action: &str,
    payload: Value,
) -> Result<(Value, Vec<DomainEvent>), CallFailure> {
    match action {
        "Authorize" => encode(handle_authorize(processor, ctx, decode(payload)?).await),
        "BootNotification" => {
            encode(handle_boot_notification(processor, ctx, decode(payload)?).await)
        }
        "DataTransfer" => encode(handle_data_transfer(processor, ctx, decode(payload)?).await),
        "DiagnosticsStatusNotification" => encode(
            handle_diagnostics_status_notification(processor, ctx, decode(payload)?).await,
        ),
        "FirmwareStatusNotification" => encode(
            handle_firmware_status_notification(processor, ctx, decode(payload)?).await,
        ),
        "Heartbeat" => encode(handle_heartbeat(processor, ctx, decode(payload)?).await),
        "MeterValues" => encode(handle_meter_values(processor, ctx, decode(payload)?).await),
        "StartTransaction" => {
            encode(handle_start_transaction(processor, ctx, decode(payload)?).await)
        }
        "StatusNotification" => {
            encode(handle_status_notification(processor, ctx, decode(payload)?).await)
        }
        "StopTransaction" => {
            encode(handle_stop_transaction(processor, ctx, decode(payload)?).await)
        }
        other => Err(CallFailure::new(
            crate::support::ocpp_frame::CallErrorCode::NotImplemented,
            format!("Unknown action {}", other),
        )),
    }
}

/// Check if the action is a CS→CP action (should never arrive from a CP).
pub fn is_cs_to_cp_action(action: &str) -> bool {
    matches!(
        action,
        "CancelReservation"
            | "ChangeAvailability"
            | "ChangeConfiguration"
            | "ClearCache"
            | "ClearChargingProfile"
            | "GetCompositeSchedule"
            | "GetConfiguration"
            | "GetDiagnostics"
            | "GetLocalListVersion"
            | "RemoteStartTransaction"
            | "RemoteStopTransaction"
            | "ReserveNow"
            | "Reset"
            | "SendLocalList"
            | "SetChargingProfile"
            | "TriggerMessage"
            | "UnlockConnector"
            | "UpdateFirmware"
    )
}

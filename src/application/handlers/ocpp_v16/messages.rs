//! OCPP 1.6 request payloads
//!
//! Inbound requests are decoded into these structs and validated before a
//! handler sees them. String limits follow the OCPP 1.6 CiString types.
//! Responses use the `rust_ocpp::v1_6` message types directly.

use chrono::{DateTime, Utc};
use rust_ocpp::v1_6::types::{ChargePointStatus, Measurand, UnitOfMeasure};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use validator::{Validate, ValidationError, ValidationErrors};

use crate::support::ocpp_frame::CallErrorCode;

/// A request that must be answered with a CallError
#[derive(Debug, Clone, PartialEq, Error)]
#[error("{code}: {description}")]
pub struct CallFailure {
    pub code: CallErrorCode,
    pub description: String,
}

impl CallFailure {
    pub fn new(code: CallErrorCode, description: impl Into<String>) -> Self {
        Self {
            code,
            description: description.into(),
        }
    }

    pub fn internal(description: impl Into<String>) -> Self {
        Self::new(CallErrorCode::InternalError, description)
    }
}

/// Deserialize and validate a Call payload.
pub fn decode<T>(payload: Value) -> Result<T, CallFailure>
where
    T: DeserializeOwned + Validate,
{
    let request: T = serde_json::from_value(payload).map_err(|e| {
        let message = e.to_string();
        let code = if message.starts_with("missing field") {
            CallErrorCode::OccurenceConstraintViolation
        } else if message.starts_with("unknown variant") {
            CallErrorCode::PropertyConstraintViolation
        } else {
            CallErrorCode::TypeConstraintViolation
        };
        CallFailure::new(code, message)
    })?;

    request.validate().map_err(|errors| {
        CallFailure::new(
            CallErrorCode::PropertyConstraintViolation,
            describe_validation_errors(&errors),
        )
    })?;
    Ok(request)
}

fn describe_validation_errors(errors: &ValidationErrors) -> String {
    let mut field_errors: Vec<String> = errors
        .field_errors()
        .iter()
        .flat_map(|(field, errs)| {
            errs.iter().map(move |e| {
                let msg = e
                    .message
                    .as_ref()
                    .map(|m| m.to_string())
                    .unwrap_or_else(|| e.code.to_string());
                format!("{}: {}", field, msg)
            })
        })
        .collect();
    field_errors.sort();

    if field_errors.is_empty() {
        // Nested errors (MeterValues) only show up in the Display form.
        errors.to_string()
    } else {
        field_errors.join("; ")
    }
}

fn one_of(value: &str, allowed: &[&str], code: &'static str) -> Result<(), ValidationError> {
    if allowed.contains(&value) {
        Ok(())
    } else {
        Err(ValidationError::new(code))
    }
}

const CHARGE_POINT_ERROR_CODES: &[&str] = &[
    "ConnectorLockFailure",
    "EVCommunicationError",
    "GroundFailure",
    "HighTemperature",
    "InternalError",
    "LocalListConflict",
    "NoError",
    "OtherError",
    "OverCurrentFailure",
    "PowerMeterFailure",
    "PowerSwitchFailure",
    "ReaderFailure",
    "ResetFailure",
    "UnderVoltage",
    "OverVoltage",
    "WeakSignal",
];

const STOP_REASONS: &[&str] = &[
    "EmergencyStop",
    "EVDisconnected",
    "HardReset",
    "Local",
    "Other",
    "PowerLoss",
    "Reboot",
    "Remote",
    "SoftReset",
    "UnlockCommand",
    "DeAuthorized",
];

const FIRMWARE_STATUSES: &[&str] = &[
    "Downloaded",
    "DownloadFailed",
    "Downloading",
    "Idle",
    "InstallationFailed",
    "Installing",
    "Installed",
];

const DIAGNOSTICS_STATUSES: &[&str] = &["Idle", "Uploaded", "UploadFailed", "Uploading"];

fn validate_error_code(value: &str) -> Result<(), ValidationError> {
    one_of(value, CHARGE_POINT_ERROR_CODES, "unknown_error_code")
}

fn validate_stop_reason(value: &str) -> Result<(), ValidationError> {
    one_of(value, STOP_REASONS, "unknown_reason")
}

fn validate_firmware_status(value: &str) -> Result<(), ValidationError> {
    one_of(value, FIRMWARE_STATUSES, "unknown_firmware_status")
}

fn validate_diagnostics_status(value: &str) -> Result<(), ValidationError> {
    one_of(value, DIAGNOSTICS_STATUSES, "unknown_diagnostics_status")
}

#[derive(Debug, Clone, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct BootNotificationRequest {
    #[validate(length(min = 1, max = 20))]
    pub charge_point_vendor: String,
    #[validate(length(min = 1, max = 20))]
    pub charge_point_model: String,
    #[validate(length(max = 25))]
    pub charge_point_serial_number: Option<String>,
    #[validate(length(max = 25))]
    pub charge_box_serial_number: Option<String>,
    #[validate(length(max = 50))]
    pub firmware_version: Option<String>,
    #[validate(length(max = 20))]
    pub iccid: Option<String>,
    #[validate(length(max = 20))]
    pub imsi: Option<String>,
    #[validate(length(max = 25))]
    pub meter_type: Option<String>,
    #[validate(length(max = 25))]
    pub meter_serial_number: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct HeartbeatRequest {}

#[derive(Debug, Clone, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct AuthorizeRequest {
    #[validate(length(min = 1, max = 20))]
    pub id_tag: String,
}

#[derive(Debug, Clone, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct StatusNotificationRequest {
    pub connector_id: u32,
    #[validate(custom(function = "validate_error_code"))]
    pub error_code: String,
    #[validate(length(max = 50))]
    pub info: Option<String>,
    pub status: ChargePointStatus,
    pub timestamp: Option<DateTime<Utc>>,
    #[validate(length(max = 255))]
    pub vendor_id: Option<String>,
    #[validate(length(max = 50))]
    pub vendor_error_code: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct StartTransactionRequest {
    #[validate(range(min = 1))]
    pub connector_id: u32,
    #[validate(length(min = 1, max = 20))]
    pub id_tag: String,
    pub meter_start: i32,
    pub reservation_id: Option<i32>,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct StopTransactionRequest {
    #[validate(length(min = 1, max = 20))]
    pub id_tag: Option<String>,
    pub meter_stop: i32,
    pub timestamp: DateTime<Utc>,
    pub transaction_id: i32,
    #[validate(custom(function = "validate_stop_reason"))]
    pub reason: Option<String>,
    pub transaction_data: Option<Vec<MeterValue>>,
}

#[derive(Debug, Clone, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct MeterValuesRequest {
    pub connector_id: u32,
    pub transaction_id: Option<i32>,
    #[validate(length(min = 1), nested)]
    pub meter_value: Vec<MeterValue>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct MeterValue {
    pub timestamp: DateTime<Utc>,
    #[validate(length(min = 1))]
    pub sampled_value: Vec<SampledValue>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SampledValue {
    pub value: String,
    pub context: Option<String>,
    pub format: Option<String>,
    pub measurand: Option<Measurand>,
    pub phase: Option<String>,
    pub location: Option<String>,
    pub unit: Option<UnitOfMeasure>,
}

#[derive(Debug, Clone, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct DataTransferRequest {
    #[validate(length(min = 1, max = 255))]
    pub vendor_id: String,
    #[validate(length(max = 50))]
    pub message_id: Option<String>,
    pub data: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct FirmwareStatusNotificationRequest {
    #[validate(custom(function = "validate_firmware_status"))]
    pub status: String,
}

#[derive(Debug, Clone, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct DiagnosticsStatusNotificationRequest {
    #[validate(custom(function = "validate_diagnostics_status"))]
    pub status: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn boot_notification_decodes() {
        let req: BootNotificationRequest = decode(json!({
            "chargePointVendor": "Acme",
            "chargePointModel": "X1",
            "firmwareVersion": "1.0.0"
        }))
        .unwrap();
        assert_eq!(req.charge_point_vendor, "Acme");
        assert_eq!(req.firmware_version.as_deref(), Some("1.0.0"));
    }

    #[test]
    fn missing_required_field_is_occurrence_violation() {
        let err = decode::<BootNotificationRequest>(json!({"chargePointVendor": "Acme"})).unwrap_err();
        assert_eq!(err.code, CallErrorCode::OccurenceConstraintViolation);
        assert!(err.description.contains("chargePointModel"));
    }

    #[test]
    fn wrong_type_is_type_violation() {
        let err = decode::<AuthorizeRequest>(json!({"idTag": 42})).unwrap_err();
        assert_eq!(err.code, CallErrorCode::TypeConstraintViolation);
    }

    #[test]
    fn over_long_string_is_property_violation() {
        let err = decode::<AuthorizeRequest>(json!({"idTag": "X".repeat(21)})).unwrap_err();
        assert_eq!(err.code, CallErrorCode::PropertyConstraintViolation);
        assert!(err.description.contains("length"));
    }

    #[test]
    fn unknown_enum_value_is_property_violation() {
        let err = decode::<StatusNotificationRequest>(json!({
            "connectorId": 1,
            "errorCode": "NoError",
            "status": "Sleeping"
        }))
        .unwrap_err();
        assert_eq!(err.code, CallErrorCode::PropertyConstraintViolation);

        let err = decode::<StatusNotificationRequest>(json!({
            "connectorId": 1,
            "errorCode": "Melted",
            "status": "Available"
        }))
        .unwrap_err();
        assert_eq!(err.code, CallErrorCode::PropertyConstraintViolation);
    }

    #[test]
    fn connector_zero_rejected_for_start_transaction() {
        let err = decode::<StartTransactionRequest>(json!({
            "connectorId": 0,
            "idTag": "TAG",
            "meterStart": 0,
            "timestamp": "2024-01-01T00:00:00Z"
        }))
        .unwrap_err();
        assert_eq!(err.code, CallErrorCode::PropertyConstraintViolation);
    }

    #[test]
    fn meter_values_require_samples() {
        let err = decode::<MeterValuesRequest>(json!({
            "connectorId": 1,
            "meterValue": []
        }))
        .unwrap_err();
        assert_eq!(err.code, CallErrorCode::PropertyConstraintViolation);

        let req: MeterValuesRequest = decode(json!({
            "connectorId": 1,
            "transactionId": 5,
            "meterValue": [{
                "timestamp": "2024-01-01T00:00:00Z",
                "sampledValue": [{"value": "1234", "measurand": "Energy.Active.Import.Register", "unit": "Wh"}]
            }]
        }))
        .unwrap();
        assert_eq!(req.meter_value[0].sampled_value[0].value, "1234");
    }

    #[test]
    fn heartbeat_accepts_empty_object() {
        assert!(decode::<HeartbeatRequest>(json!({})).is_ok());
    }
}

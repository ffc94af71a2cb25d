//! OCPP-J message framing
//!
//! The JSON-array envelope shared by every OCPP version:
//!
//! - **Call**       `[2, "<messageId>", "<action>", {<payload>}]`
//! - **CallResult** `[3, "<messageId>", {<payload>}]`
//! - **CallError**  `[4, "<messageId>", "<errorCode>", "<errorDescription>", {<errorDetails>}]`
//!
//! Arity is fixed by the message type. Frames that break it are rejected here,
//! before any action handler sees them.

use std::fmt;

use serde_json::Value;
use thiserror::Error;

// ── Message-type constants ─────────────────────────────────────

const MSG_TYPE_CALL: u64 = 2;
const MSG_TYPE_CALL_RESULT: u64 = 3;
const MSG_TYPE_CALL_ERROR: u64 = 4;

/// Maximum length of a message id (OCPP-J `uniqueId`).
pub const MAX_MESSAGE_ID_LEN: usize = 36;

// ── MessageType ────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageType {
    Call,
    CallResult,
    CallError,
}

impl MessageType {
    pub fn from_code(code: u64) -> Option<Self> {
        match code {
            MSG_TYPE_CALL => Some(Self::Call),
            MSG_TYPE_CALL_RESULT => Some(Self::CallResult),
            MSG_TYPE_CALL_ERROR => Some(Self::CallError),
            _ => None,
        }
    }

    pub fn code(&self) -> u64 {
        match self {
            Self::Call => MSG_TYPE_CALL,
            Self::CallResult => MSG_TYPE_CALL_RESULT,
            Self::CallError => MSG_TYPE_CALL_ERROR,
        }
    }
}

// ── CallErrorCode ──────────────────────────────────────────────

/// OCPP-J error codes carried in a `CallError`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallErrorCode {
    NotImplemented,
    NotSupported,
    InternalError,
    ProtocolError,
    SecurityError,
    FormationViolation,
    PropertyConstraintViolation,
    OccurenceConstraintViolation,
    TypeConstraintViolation,
    GenericError,
}

impl CallErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::NotImplemented => "NotImplemented",
            Self::NotSupported => "NotSupported",
            Self::InternalError => "InternalError",
            Self::ProtocolError => "ProtocolError",
            Self::SecurityError => "SecurityError",
            Self::FormationViolation => "FormationViolation",
            Self::PropertyConstraintViolation => "PropertyConstraintViolation",
            // Spelling follows the OCPP-J specification.
            Self::OccurenceConstraintViolation => "OccurenceConstraintViolation",
            Self::TypeConstraintViolation => "TypeConstraintViolation",
            Self::GenericError => "GenericError",
        }
    }
}

impl fmt::Display for CallErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ── OcppFrame ──────────────────────────────────────────────────

/// A parsed OCPP-J frame (version-agnostic transport envelope).
#[derive(Debug, Clone, PartialEq)]
pub enum OcppFrame {
    /// `[2, messageId, action, payload]`
    Call {
        message_id: String,
        action: String,
        payload: Value,
    },
    /// `[3, messageId, payload]`
    CallResult { message_id: String, payload: Value },
    /// `[4, messageId, errorCode, errorDescription, errorDetails?]`
    CallError {
        message_id: String,
        error_code: String,
        error_description: String,
        error_details: Value,
    },
}

impl OcppFrame {
    // ── Parsing ────────────────────────────────────────────

    /// Parse raw JSON text into an `OcppFrame`.
    pub fn parse(text: &str) -> Result<Self, FrameError> {
        let value: Value =
            serde_json::from_str(text).map_err(|e| FrameError::InvalidJson(e.to_string()))?;
        Self::from_value(value)
    }

    /// Decode an already-parsed JSON value.
    pub fn from_value(value: Value) -> Result<Self, FrameError> {
        let mut arr = match value {
            Value::Array(arr) => arr,
            _ => return Err(FrameError::NotAnArray),
        };

        if arr.is_empty() {
            return Err(FrameError::EmptyArray);
        }

        let code = arr[0].as_u64().ok_or(FrameError::InvalidMessageType)?;
        let msg_type = MessageType::from_code(code).ok_or(FrameError::UnknownMessageType(code))?;

        let arity_ok = match msg_type {
            MessageType::Call => arr.len() == 4,
            MessageType::CallResult => arr.len() == 3,
            MessageType::CallError => arr.len() == 4 || arr.len() == 5,
        };
        if !arity_ok {
            return Err(FrameError::BadArity {
                message_type: msg_type,
                got: arr.len(),
            });
        }

        let message_id = parse_message_id(&arr[1])?;

        match msg_type {
            MessageType::Call => {
                let payload = arr.pop().unwrap_or(Value::Null);
                let action = arr[2]
                    .as_str()
                    .filter(|a| !a.is_empty())
                    .ok_or(FrameError::FieldTypeMismatch("action must be a non-empty string"))?
                    .to_string();
                if !payload.is_object() {
                    return Err(FrameError::FieldTypeMismatch("payload must be an object"));
                }
                Ok(Self::Call {
                    message_id,
                    action,
                    payload,
                })
            }
            MessageType::CallResult => {
                let payload = arr.pop().unwrap_or(Value::Null);
                if !payload.is_object() {
                    return Err(FrameError::FieldTypeMismatch("payload must be an object"));
                }
                Ok(Self::CallResult {
                    message_id,
                    payload,
                })
            }
            MessageType::CallError => {
                let error_details = if arr.len() == 5 {
                    arr.pop().unwrap_or_default()
                } else {
                    Value::Object(Default::default())
                };
                let error_code = arr[2]
                    .as_str()
                    .ok_or(FrameError::FieldTypeMismatch("errorCode must be a string"))?
                    .to_string();
                let error_description = arr[3]
                    .as_str()
                    .ok_or(FrameError::FieldTypeMismatch(
                        "errorDescription must be a string",
                    ))?
                    .to_string();
                Ok(Self::CallError {
                    message_id,
                    error_code,
                    error_description,
                    error_details,
                })
            }
        }
    }

    // ── Serialization ──────────────────────────────────────

    /// Serialize this frame to its JSON wire form.
    pub fn serialize(&self) -> String {
        let arr = match self {
            Self::Call {
                message_id,
                action,
                payload,
            } => Value::Array(vec![
                Value::Number(MSG_TYPE_CALL.into()),
                Value::String(message_id.clone()),
                Value::String(action.clone()),
                payload.clone(),
            ]),

            Self::CallResult {
                message_id,
                payload,
            } => Value::Array(vec![
                Value::Number(MSG_TYPE_CALL_RESULT.into()),
                Value::String(message_id.clone()),
                payload.clone(),
            ]),

            Self::CallError {
                message_id,
                error_code,
                error_description,
                error_details,
            } => Value::Array(vec![
                Value::Number(MSG_TYPE_CALL_ERROR.into()),
                Value::String(message_id.clone()),
                Value::String(error_code.clone()),
                Value::String(error_description.clone()),
                error_details.clone(),
            ]),
        };

        arr.to_string()
    }

    // ── Helpers ────────────────────────────────────────────

    pub fn message_id(&self) -> &str {
        match self {
            Self::Call { message_id, .. }
            | Self::CallResult { message_id, .. }
            | Self::CallError { message_id, .. } => message_id,
        }
    }

    pub fn message_type(&self) -> MessageType {
        match self {
            Self::Call { .. } => MessageType::Call,
            Self::CallResult { .. } => MessageType::CallResult,
            Self::CallError { .. } => MessageType::CallError,
        }
    }

    /// Build a `CallError` reply for a given message id.
    pub fn error_response(
        message_id: impl Into<String>,
        error_code: CallErrorCode,
        error_description: impl Into<String>,
    ) -> Self {
        Self::CallError {
            message_id: message_id.into(),
            error_code: error_code.as_str().to_string(),
            error_description: error_description.into(),
            error_details: Value::Object(Default::default()),
        }
    }
}

fn parse_message_id(value: &Value) -> Result<String, FrameError> {
    let id = value
        .as_str()
        .ok_or(FrameError::FieldTypeMismatch("messageId must be a string"))?;
    if id.is_empty() || id.len() > MAX_MESSAGE_ID_LEN {
        return Err(FrameError::InvalidMessageId(id.len()));
    }
    Ok(id.to_string())
}

/// Best-effort extraction of the message id from a frame that failed to
/// decode, so a `FormationViolation` can still be correlated by the peer.
pub fn salvage_message_id(value: &Value) -> Option<String> {
    let arr = value.as_array()?;
    let code = arr.first()?.as_u64()?;
    if code != MSG_TYPE_CALL {
        return None;
    }
    parse_message_id(arr.get(1)?).ok()
}

// ── Errors ─────────────────────────────────────────────────────

/// Structural errors raised while decoding an OCPP-J envelope.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FrameError {
    #[error("Message of {size} bytes exceeds limit of {limit} bytes")]
    TooLarge { size: usize, limit: usize },
    #[error("Invalid JSON: {0}")]
    InvalidJson(String),
    #[error("OCPP message is not a JSON array")]
    NotAnArray,
    #[error("Empty OCPP message array")]
    EmptyArray,
    #[error("Message type is not a number")]
    InvalidMessageType,
    #[error("Unknown message type: {0}")]
    UnknownMessageType(u64),
    #[error("{message_type:?} frame has {got} elements")]
    BadArity {
        message_type: MessageType,
        got: usize,
    },
    #[error("Message id must be 1..={} characters, got {0}", MAX_MESSAGE_ID_LEN)]
    InvalidMessageId(usize),
    #[error("Field type mismatch: {0}")]
    FieldTypeMismatch(&'static str),
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn parse_call() {
        let text = r#"[2,"abc123","BootNotification",{"chargePointVendor":"Vendor","chargePointModel":"Model"}]"#;
        match OcppFrame::parse(text).unwrap() {
            OcppFrame::Call {
                message_id,
                action,
                payload,
            } => {
                assert_eq!(message_id, "abc123");
                assert_eq!(action, "BootNotification");
                assert_eq!(payload["chargePointVendor"], "Vendor");
            }
            other => panic!("Expected Call frame, got {:?}", other),
        }
    }

    #[test]
    fn parse_call_error_without_details() {
        let frame = OcppFrame::parse(r#"[4,"abc","NotImplemented","nope"]"#).unwrap();
        match frame {
            OcppFrame::CallError {
                error_code,
                error_details,
                ..
            } => {
                assert_eq!(error_code, "NotImplemented");
                assert_eq!(error_details, json!({}));
            }
            other => panic!("Expected CallError frame, got {:?}", other),
        }
    }

    #[test]
    fn rejects_unknown_message_type() {
        assert_eq!(
            OcppFrame::parse(r#"[5,"id",{}]"#),
            Err(FrameError::UnknownMessageType(5))
        );
        assert_eq!(
            OcppFrame::parse(r#"[1,"id","Heartbeat",{}]"#),
            Err(FrameError::UnknownMessageType(1))
        );
    }

    #[test]
    fn rejects_wrong_arity() {
        assert!(matches!(
            OcppFrame::parse(r#"[2,"id","Heartbeat"]"#),
            Err(FrameError::BadArity { got: 3, .. })
        ));
        assert!(matches!(
            OcppFrame::parse(r#"[2,"id","Heartbeat",{},{}]"#),
            Err(FrameError::BadArity { got: 5, .. })
        ));
        assert!(matches!(
            OcppFrame::parse(r#"[3,"id",{},{}]"#),
            Err(FrameError::BadArity { got: 4, .. })
        ));
        assert!(matches!(
            OcppFrame::parse(r#"[4,"id","GenericError"]"#),
            Err(FrameError::BadArity { got: 3, .. })
        ));
    }

    #[test]
    fn rejects_non_array_and_bad_ids() {
        assert_eq!(OcppFrame::parse(r#"{"a":1}"#), Err(FrameError::NotAnArray));
        assert!(matches!(OcppFrame::parse("[2,"), Err(FrameError::InvalidJson(_))));
        assert_eq!(
            OcppFrame::parse(r#"[2,"","Heartbeat",{}]"#),
            Err(FrameError::InvalidMessageId(0))
        );
        let long_id = "x".repeat(MAX_MESSAGE_ID_LEN + 1);
        let text = format!(r#"[2,"{}","Heartbeat",{{}}]"#, long_id);
        assert_eq!(
            OcppFrame::parse(&text),
            Err(FrameError::InvalidMessageId(MAX_MESSAGE_ID_LEN + 1))
        );
        assert!(matches!(
            OcppFrame::parse(r#"[2,42,"Heartbeat",{}]"#),
            Err(FrameError::FieldTypeMismatch(_))
        ));
    }

    #[test]
    fn decode_of_encode_is_identity() {
        let frames = vec![
            OcppFrame::Call {
                message_id: "id1".into(),
                action: "Heartbeat".into(),
                payload: json!({}),
            },
            OcppFrame::CallResult {
                message_id: "id2".into(),
                payload: json!({"currentTime": "2024-01-01T00:00:00Z"}),
            },
            OcppFrame::CallError {
                message_id: "id3".into(),
                error_code: "GenericError".into(),
                error_description: "Something went wrong".into(),
                error_details: json!({"hint": "retry"}),
            },
        ];
        for frame in frames {
            assert_eq!(OcppFrame::parse(&frame.serialize()).unwrap(), frame);
        }
    }

    #[test]
    fn salvage_reads_id_from_broken_call() {
        let value = json!([2, "m-1", 17, {}]);
        assert!(OcppFrame::from_value(value.clone()).is_err());
        assert_eq!(salvage_message_id(&value).as_deref(), Some("m-1"));
        assert_eq!(salvage_message_id(&json!([3, "m-1"])), None);
    }
}

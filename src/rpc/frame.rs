//! OCPP-J message framing
//!
//! The transport envelope is a JSON array:
//!
//! - **Call**       `[2, "<uniqueId>", "<action>", {<payload>}]`
//! - **CallResult** `[3, "<uniqueId>", {<payload>}]`
//! - **CallError**  `[4, "<uniqueId>", "<errorCode>", "<errorDescription>", {<errorDetails>}]`

use serde_json::Value;
use std::fmt;

const MSG_TYPE_CALL: u64 = 2;
const MSG_TYPE_CALL_RESULT: u64 = 3;
const MSG_TYPE_CALL_ERROR: u64 = 4;

/// Standard OCPP-J error codes carried in a CALLERROR frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RpcErrorCode {
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

impl RpcErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::NotImplemented => "NotImplemented",
            Self::NotSupported => "NotSupported",
            Self::InternalError => "InternalError",
            Self::ProtocolError => "ProtocolError",
            Self::SecurityError => "SecurityError",
            Self::FormationViolation => "FormationViolation",
            Self::PropertyConstraintViolation => "PropertyConstraintViolation",
            // The OCPP 1.6 specification spells it this way.
            Self::OccurenceConstraintViolation => "OccurenceConstraintViolation",
            Self::TypeConstraintViolation => "TypeConstraintViolation",
            Self::GenericError => "GenericError",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "NotImplemented" => Some(Self::NotImplemented),
            "NotSupported" => Some(Self::NotSupported),
            "InternalError" => Some(Self::InternalError),
            "ProtocolError" => Some(Self::ProtocolError),
            "SecurityError" => Some(Self::SecurityError),
            "FormationViolation" => Some(Self::FormationViolation),
            "PropertyConstraintViolation" => Some(Self::PropertyConstraintViolation),
            "OccurenceConstraintViolation" => Some(Self::OccurenceConstraintViolation),
            "TypeConstraintViolation" => Some(Self::TypeConstraintViolation),
            "GenericError" => Some(Self::GenericError),
            _ => None,
        }
    }
}

impl fmt::Display for RpcErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A parsed OCPP-J frame.
#[derive(Debug, Clone)]
pub enum Frame {
    Call {
        unique_id: String,
        action: String,
        payload: Value,
    },
    CallResult {
        unique_id: String,
        payload: Value,
    },
    CallError {
        unique_id: String,
        error_code: String,
        error_description: String,
        error_details: Value,
    },
}

impl Frame {
    /// Parse a raw JSON text into a [`Frame`].
    ///
    /// On malformed input the error carries the unique id when one could be
    /// recovered, so the peer can still be answered with a CALLERROR.
    pub fn parse(text: &str) -> Result<Self, FrameError> {
        let arr: Vec<Value> = serde_json::from_str(text)
            .map_err(|e| FrameError::InvalidJson(e.to_string()))?;

        if arr.is_empty() {
            return Err(FrameError::EmptyArray);
        }

        let msg_type = arr[0].as_u64().ok_or(FrameError::InvalidMessageType {
            unique_id: recover_unique_id(&arr),
        })?;

        match msg_type {
            MSG_TYPE_CALL => Self::parse_call(&arr),
            MSG_TYPE_CALL_RESULT => Self::parse_call_result(&arr),
            MSG_TYPE_CALL_ERROR => Self::parse_call_error(&arr),
            other => Err(FrameError::UnknownMessageType {
                message_type: other,
                unique_id: recover_unique_id(&arr),
            }),
        }
    }

    fn parse_call(arr: &[Value]) -> Result<Self, FrameError> {
        if arr.len() != 4 {
            return Err(FrameError::WrongArity {
                expected: 4,
                got: arr.len(),
                unique_id: recover_unique_id(arr),
            });
        }
        let unique_id = string_field(arr, 1, "uniqueId")?;
        let action = string_field(arr, 2, "action")?;
        Ok(Self::Call {
            unique_id,
            action,
            payload: arr[3].clone(),
        })
    }

    fn parse_call_result(arr: &[Value]) -> Result<Self, FrameError> {
        if arr.len() != 3 {
            return Err(FrameError::WrongArity {
                expected: 3,
                got: arr.len(),
                unique_id: recover_unique_id(arr),
            });
        }
        let unique_id = string_field(arr, 1, "uniqueId")?;
        Ok(Self::CallResult {
            unique_id,
            payload: arr[2].clone(),
        })
    }

    fn parse_call_error(arr: &[Value]) -> Result<Self, FrameError> {
        if arr.len() != 5 {
            return Err(FrameError::WrongArity {
                expected: 5,
                got: arr.len(),
                unique_id: recover_unique_id(arr),
            });
        }
        let unique_id = string_field(arr, 1, "uniqueId")?;
        let error_code = string_field(arr, 2, "errorCode")?;
        let error_description = string_field(arr, 3, "errorDescription")?;
        Ok(Self::CallError {
            unique_id,
            error_code,
            error_description,
            error_details: arr[4].clone(),
        })
    }

    /// Serialize this frame to its JSON wire form.
    pub fn serialize(&self) -> String {
        let arr: Value = match self {
            Self::Call {
                unique_id,
                action,
                payload,
            } => Value::Array(vec![
                Value::Number(MSG_TYPE_CALL.into()),
                Value::String(unique_id.clone()),
                Value::String(action.clone()),
                payload.clone(),
            ]),
            Self::CallResult { unique_id, payload } => Value::Array(vec![
                Value::Number(MSG_TYPE_CALL_RESULT.into()),
                Value::String(unique_id.clone()),
                payload.clone(),
            ]),
            Self::CallError {
                unique_id,
                error_code,
                error_description,
                error_details,
            } => Value::Array(vec![
                Value::Number(MSG_TYPE_CALL_ERROR.into()),
                Value::String(unique_id.clone()),
                Value::String(error_code.clone()),
                Value::String(error_description.clone()),
                error_details.clone(),
            ]),
        };
        // serde_json::to_string on a Value never fails
        serde_json::to_string(&arr).unwrap()
    }

    pub fn unique_id(&self) -> &str {
        match self {
            Self::Call { unique_id, .. }
            | Self::CallResult { unique_id, .. }
            | Self::CallError { unique_id, .. } => unique_id,
        }
    }

    /// Build a CALLERROR frame answering `unique_id`.
    pub fn error(
        unique_id: impl Into<String>,
        code: RpcErrorCode,
        description: impl Into<String>,
    ) -> Self {
        Self::CallError {
            unique_id: unique_id.into(),
            error_code: code.as_str().to_string(),
            error_description: description.into(),
            error_details: Value::Object(Default::default()),
        }
    }
}

fn string_field(arr: &[Value], index: usize, name: &'static str) -> Result<String, FrameError> {
    arr[index]
        .as_str()
        .map(str::to_string)
        .ok_or(FrameError::FieldTypeMismatch {
            field: name,
            unique_id: recover_unique_id(arr),
        })
}

/// Best-effort extraction of the unique id from a malformed frame.
fn recover_unique_id(arr: &[Value]) -> Option<String> {
    arr.get(1).and_then(Value::as_str).map(str::to_string)
}

/// Errors raised while parsing an OCPP-J frame.
#[derive(Debug, thiserror::Error, PartialEq)]
pub enum FrameError {
    #[error("invalid JSON: {0}")]
    InvalidJson(String),
    #[error("empty message array")]
    EmptyArray,
    #[error("message type id is not a number")]
    InvalidMessageType { unique_id: Option<String> },
    #[error("unknown message type id: {message_type}")]
    UnknownMessageType {
        message_type: u64,
        unique_id: Option<String>,
    },
    #[error("expected {expected} fields, got {got}")]
    WrongArity {
        expected: usize,
        got: usize,
        unique_id: Option<String>,
    },
    #[error("field type mismatch: {field} must be a string")]
    FieldTypeMismatch {
        field: &'static str,
        unique_id: Option<String>,
    },
}

impl FrameError {
    /// Unique id of the offending frame, when it could be recovered.
    pub fn unique_id(&self) -> Option<&str> {
        match self {
            Self::InvalidJson(_) | Self::EmptyArray => None,
            Self::InvalidMessageType { unique_id }
            | Self::UnknownMessageType { unique_id, .. }
            | Self::WrongArity { unique_id, .. }
            | Self::FieldTypeMismatch { unique_id, .. } => unique_id.as_deref(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_call() {
        let text = r#"[2,"abc123","BootNotification",{"chargePointVendor":"Vendor","chargePointModel":"Model"}]"#;
        match Frame::parse(text).unwrap() {
            Frame::Call {
                unique_id,
                action,
                payload,
            } => {
                assert_eq!(unique_id, "abc123");
                assert_eq!(action, "BootNotification");
                assert_eq!(payload["chargePointVendor"], "Vendor");
            }
            _ => panic!("Expected Call frame"),
        }
    }

    #[test]
    fn parse_call_result() {
        let text = r#"[3,"abc123",{"status":"Accepted","currentTime":"2025-01-01T00:00:00Z","interval":300}]"#;
        match Frame::parse(text).unwrap() {
            Frame::CallResult { unique_id, payload } => {
                assert_eq!(unique_id, "abc123");
                assert_eq!(payload["status"], "Accepted");
            }
            _ => panic!("Expected CallResult frame"),
        }
    }

    #[test]
    fn parse_call_error() {
        let text = r#"[4,"abc123","NotImplemented","Action not supported",{}]"#;
        match Frame::parse(text).unwrap() {
            Frame::CallError {
                unique_id,
                error_code,
                error_description,
                ..
            } => {
                assert_eq!(unique_id, "abc123");
                assert_eq!(error_code, "NotImplemented");
                assert_eq!(error_description, "Action not supported");
            }
            _ => panic!("Expected CallError frame"),
        }
    }

    #[test]
    fn wrong_arity_recovers_unique_id() {
        let err = Frame::parse(r#"[2,"id-7","Heartbeat"]"#).unwrap_err();
        assert_eq!(err.unique_id(), Some("id-7"));
    }

    #[test]
    fn unknown_message_type() {
        let err = Frame::parse(r#"[9,"id-1",{}]"#).unwrap_err();
        match err {
            FrameError::UnknownMessageType { message_type, .. } => assert_eq!(message_type, 9),
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn roundtrip_call() {
        let frame = Frame::Call {
            unique_id: "id1".into(),
            action: "Heartbeat".into(),
            payload: serde_json::json!({}),
        };
        let parsed = Frame::parse(&frame.serialize()).unwrap();
        assert_eq!(parsed.unique_id(), "id1");
        assert!(matches!(parsed, Frame::Call { .. }));
    }

    #[test]
    fn roundtrip_error() {
        let frame = Frame::error("id3", RpcErrorCode::GenericError, "Something went wrong");
        let parsed = Frame::parse(&frame.serialize()).unwrap();
        assert!(matches!(parsed, Frame::CallError { .. }));
        assert_eq!(parsed.unique_id(), "id3");
    }

    #[test]
    fn error_code_wire_spelling() {
        assert_eq!(
            RpcErrorCode::OccurenceConstraintViolation.as_str(),
            "OccurenceConstraintViolation"
        );
        assert_eq!(
            RpcErrorCode::parse("FormationViolation"),
            Some(RpcErrorCode::FormationViolation)
        );
        assert_eq!(RpcErrorCode::parse("NoSuchCode"), None);
    }
}

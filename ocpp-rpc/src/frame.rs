//! OCPP-J message framing
//!
//! OCPP-J carries JSON arrays over WebSocket text frames:
//! - CALL: [2, messageId, action, payload]
//! - CALLRESULT: [3, messageId, payload]
//! - CALLERROR: [4, messageId, errorCode, errorDescription, errorDetails]
//!
//! Inbound frames are size-capped before they reach the JSON parser. A frame
//! over the cap still gets a best-effort header recovery so a too-large CALL
//! can be answered with a CALLERROR instead of silently dropped.

use serde_json::Value;

use crate::error::{ErrorCode, RpcError};

/// Hard cap on inbound frame size handed to the JSON parser.
pub const DEFAULT_MAX_FRAME_SIZE: usize = 16 * 1024;

/// OCPP-J message type identifiers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageType {
    Call = 2,
    CallResult = 3,
    CallError = 4,
}

/// CALL frame (request).
#[derive(Debug, Clone)]
pub struct CallFrame {
    pub message_id: String,
    pub action: String,
    pub payload: Value,
}

/// CALLRESULT frame (success response).
#[derive(Debug, Clone)]
pub struct CallResultFrame {
    pub message_id: String,
    pub payload: Value,
}

/// CALLERROR frame (error response).
#[derive(Debug, Clone)]
pub struct CallErrorFrame {
    pub message_id: String,
    pub error_code: String,
    pub error_description: String,
    pub error_details: Value,
}

impl CallErrorFrame {
    pub fn new(message_id: impl Into<String>, code: ErrorCode, description: impl Into<String>) -> Self {
        Self {
            message_id: message_id.into(),
            error_code: code.as_str().to_string(),
            error_description: description.into(),
            error_details: Value::Object(serde_json::Map::new()),
        }
    }
}

/// A classified OCPP-J frame.
#[derive(Debug, Clone)]
pub enum OcppFrame {
    Call(CallFrame),
    CallResult(CallResultFrame),
    CallError(CallErrorFrame),
}

impl OcppFrame {
    /// Parse an OCPP-J frame from raw text.
    ///
    /// Input longer than `max_size` is rejected with `FrameTooLarge`; callers
    /// should then try [`OcppFrame::recover_header`] on the same bytes.
    pub fn parse(text: &str, max_size: usize) -> Result<Self, RpcError> {
        if text.len() > max_size {
            return Err(RpcError::FrameTooLarge {
                size: text.len(),
                max: max_size,
            });
        }
        Self::parse_array(serde_json::from_str(text)?)
    }

    fn parse_array(array: Vec<Value>) -> Result<Self, RpcError> {
        if array.is_empty() {
            return Err(RpcError::InvalidFormat);
        }

        let msg_type = array[0].as_i64().ok_or(RpcError::InvalidFormat)?;

        match msg_type {
            2 => {
                if array.len() != 4 {
                    return Err(RpcError::InvalidFormat);
                }
                let message_id = array[1].as_str().ok_or(RpcError::InvalidFormat)?.to_string();
                let action = array[2].as_str().ok_or(RpcError::InvalidFormat)?.to_string();

                Ok(OcppFrame::Call(CallFrame {
                    message_id,
                    action,
                    payload: array[3].clone(),
                }))
            }
            3 => {
                if array.len() != 3 {
                    return Err(RpcError::InvalidFormat);
                }
                let message_id = array[1].as_str().ok_or(RpcError::InvalidFormat)?.to_string();

                Ok(OcppFrame::CallResult(CallResultFrame {
                    message_id,
                    payload: array[2].clone(),
                }))
            }
            4 => {
                if array.len() != 5 {
                    return Err(RpcError::InvalidFormat);
                }
                let message_id = array[1].as_str().ok_or(RpcError::InvalidFormat)?.to_string();
                let error_code = array[2].as_str().ok_or(RpcError::InvalidFormat)?.to_string();
                let error_description = array[3].as_str().unwrap_or("").to_string();

                Ok(OcppFrame::CallError(CallErrorFrame {
                    message_id,
                    error_code,
                    error_description,
                    error_details: array[4].clone(),
                }))
            }
            other => Err(RpcError::UnknownMessageType(other)),
        }
    }

    /// Best-effort header recovery for an over-capacity frame.
    ///
    /// Scans for the first `{` (start of the payload object), truncates there
    /// and closes the array with `"}]"`, yielding `[type, id, action, {}]`.
    /// Recovers enough of a CALL to answer it with a CALLERROR; any other
    /// frame type is not worth recovering and the caller drops it.
    pub fn recover_header(text: &str) -> Option<Self> {
        let brace = text.find('{')?;
        let mut truncated = text[..=brace].to_string();
        truncated.push_str("}]");
        let array: Vec<Value> = serde_json::from_str(&truncated).ok()?;
        Self::parse_array(array).ok()
    }

    /// Message correlation id, present in every frame type.
    pub fn message_id(&self) -> &str {
        match self {
            OcppFrame::Call(c) => &c.message_id,
            OcppFrame::CallResult(r) => &r.message_id,
            OcppFrame::CallError(e) => &e.message_id,
        }
    }

    /// Serialize to the OCPP-J wire format.
    pub fn to_wire(&self) -> Result<String, RpcError> {
        let array = match self {
            OcppFrame::Call(c) => serde_json::json!([
                MessageType::Call as i32,
                &c.message_id,
                &c.action,
                &c.payload
            ]),
            OcppFrame::CallResult(r) => serde_json::json!([
                MessageType::CallResult as i32,
                &r.message_id,
                &r.payload
            ]),
            OcppFrame::CallError(e) => serde_json::json!([
                MessageType::CallError as i32,
                &e.message_id,
                &e.error_code,
                &e.error_description,
                &e.error_details
            ]),
        };
        Ok(serde_json::to_string(&array)?)
    }
}

//! Error taxonomy for the protocol engine.

use serde_json::Value;
use thiserror::Error;

/// OCPP-J RPC framework error codes, as they appear on the wire in a
/// CALLERROR frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
    FormatViolation,
    GenericError,
    InternalError,
    NotImplemented,
    NotSupported,
    OccurrenceConstraintViolation,
    PropertyConstraintViolation,
    ProtocolError,
    SecurityError,
    TypeConstraintViolation,
}

impl ErrorCode {
    /// Wire spelling of the error code.
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::FormatViolation => "FormatViolation",
            ErrorCode::GenericError => "GenericError",
            ErrorCode::InternalError => "InternalError",
            ErrorCode::NotImplemented => "NotImplemented",
            ErrorCode::NotSupported => "NotSupported",
            ErrorCode::OccurrenceConstraintViolation => "OccurrenceConstraintViolation",
            ErrorCode::PropertyConstraintViolation => "PropertyConstraintViolation",
            ErrorCode::ProtocolError => "ProtocolError",
            ErrorCode::SecurityError => "SecurityError",
            ErrorCode::TypeConstraintViolation => "TypeConstraintViolation",
        }
    }
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An application-level error reported by an Operation, delivered to the
/// remote peer as a CALLERROR.
#[derive(Debug, Clone)]
pub struct OperationError {
    pub code: ErrorCode,
    pub description: String,
    pub details: Value,
}

impl OperationError {
    pub fn new(code: ErrorCode, description: impl Into<String>) -> Self {
        Self {
            code,
            description: description.into(),
            details: Value::Object(serde_json::Map::new()),
        }
    }

    pub fn with_details(mut self, details: Value) -> Self {
        self.details = details;
        self
    }
}

/// Errors raised inside the protocol engine.
#[derive(Debug, Error)]
pub enum RpcError {
    #[error("JSON parse error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("invalid message format")]
    InvalidFormat,

    #[error("unknown message type: {0}")]
    UnknownMessageType(i64),

    #[error("frame exceeds capacity: {size} > {max}")]
    FrameTooLarge { size: usize, max: usize },

    #[error("message id mismatch: expected {expected}, got {got}")]
    IdMismatch { expected: String, got: String },

    #[error("storage error: {0}")]
    Storage(#[from] std::io::Error),
}

//! The pluggable Operation capability
//!
//! Every concrete OCPP message type implements [`Operation`]. The engine
//! treats operations as opaque: it asks for a request payload, feeds back
//! confirmations and errors, and mirrors the same surface for the inbound
//! direction. Suspension is explicit: an operation that is not ready simply
//! reports so and is polled again on the next tick.

use serde_json::Value;

use crate::error::{ErrorCode, OperationError};

/// Outcome of asking an operation for its request payload.
#[derive(Debug)]
pub enum RequestPayload {
    /// Payload is ready to be sent.
    Ready(Value),
    /// Payload cannot be produced yet (e.g. waiting on a sensor reading).
    /// The engine retries on a later tick; queue order is preserved.
    NotReady,
}

/// Outcome of asking an operation for its response payload.
#[derive(Debug)]
pub enum ResponsePayload {
    /// Response is ready to be sent as a CALLRESULT.
    Ready(Value),
    /// Response is not ready yet; the inbound queue retries the same front
    /// entry next tick.
    Pending,
    /// The operation rejects the request; sent as a CALLERROR.
    Failed(OperationError),
}

/// Capability implemented by every concrete OCPP message type.
///
/// Outbound direction: `create_request_payload` → `process_confirmation` /
/// `process_error`. Inbound direction: `process_request` →
/// `create_response_payload`.
pub trait Operation: Send {
    /// The OCPP action name, e.g. `"StartTransaction"`.
    fn operation_type(&self) -> &str;

    /// Produce the CALL payload, or report that it is not ready yet.
    fn create_request_payload(&mut self) -> RequestPayload {
        RequestPayload::Ready(Value::Object(serde_json::Map::new()))
    }

    /// Consume the CALLRESULT payload for a request this operation sent.
    fn process_confirmation(&mut self, _payload: &Value) {}

    /// Consume a CALLERROR for a request this operation sent.
    ///
    /// Returns `true` if the error is fatal for this operation (the request
    /// aborts), `false` to keep the request alive for another attempt.
    fn process_error(&mut self, _code: &str, _description: &str, _details: &Value) -> bool {
        true
    }

    /// Consume an inbound CALL payload.
    fn process_request(&mut self, _payload: &Value) {}

    /// Produce the response payload for an inbound CALL.
    fn create_response_payload(&mut self) -> ResponsePayload {
        ResponsePayload::Failed(OperationError::new(
            ErrorCode::InternalError,
            "operation does not accept requests",
        ))
    }

    /// Operation-specific state blob for the persistent queue. `None` means
    /// the operation has no state beyond its request payload.
    fn snapshot(&self) -> Option<Value> {
        None
    }

    /// Rebuild operation state from a stored blob written by [`snapshot`].
    ///
    /// [`snapshot`]: Operation::snapshot
    fn restore(&mut self, _blob: &Value) {}
}

/// Fallback operation for inbound actions nobody registered.
///
/// Always answers with a `NotImplemented` CALLERROR so the central system
/// gets a deterministic outcome instead of a dropped frame.
pub struct NotImplemented {
    action: String,
}

impl NotImplemented {
    pub fn new(action: impl Into<String>) -> Self {
        Self {
            action: action.into(),
        }
    }
}

impl Operation for NotImplemented {
    fn operation_type(&self) -> &str {
        &self.action
    }

    fn create_response_payload(&mut self) -> ResponsePayload {
        ResponsePayload::Failed(OperationError::new(
            ErrorCode::NotImplemented,
            format!("action {} is not supported", self.action),
        ))
    }
}

//! Reset (CSMS → charge point)
//!
//! The station accepts the reset and records it in the shared state; the
//! embedding application observes `pending_reset` and performs the actual
//! restart once any running transaction has been wound down.

use serde::Deserialize;
use serde_json::Value;
use tracing::{info, warn};

use ocpp_rpc::{ErrorCode, Operation, OperationError, ResponsePayload};

use crate::state::{ResetKind, SharedState};

#[derive(Debug, Deserialize)]
struct ResetRequest {
    #[serde(rename = "type")]
    kind: ResetKind,
}

pub struct Reset {
    state: SharedState,
    kind: Option<ResetKind>,
    malformed: bool,
}

impl Reset {
    pub fn new(state: SharedState) -> Self {
        Self {
            state,
            kind: None,
            malformed: false,
        }
    }
}

impl Operation for Reset {
    fn operation_type(&self) -> &str {
        "Reset"
    }

    fn process_request(&mut self, payload: &Value) {
        match serde_json::from_value::<ResetRequest>(payload.clone()) {
            Ok(request) => self.kind = Some(request.kind),
            Err(e) => {
                warn!("unparseable Reset request: {}", e);
                self.malformed = true;
            }
        }
    }

    fn create_response_payload(&mut self) -> ResponsePayload {
        if self.malformed {
            return ResponsePayload::Failed(OperationError::new(
                ErrorCode::FormatViolation,
                "invalid Reset payload",
            ));
        }
        let Some(kind) = self.kind else {
            return ResponsePayload::Failed(OperationError::new(
                ErrorCode::FormatViolation,
                "missing Reset type",
            ));
        };

        info!(kind = ?kind, "reset requested by CSMS");
        self.state.lock().pending_reset = Some(kind);
        ResponsePayload::Ready(serde_json::json!({"status": "Accepted"}))
    }
}

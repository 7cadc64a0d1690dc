//! Heartbeat
//!
//! Keep-alive with an empty request payload. Volatile traffic: a lost
//! Heartbeat costs nothing, the next one is already scheduled.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

use ocpp_rpc::{Operation, RequestPayload};

use crate::state::SharedState;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HeartbeatResponse {
    pub current_time: DateTime<Utc>,
}

pub struct Heartbeat {
    state: SharedState,
}

impl Heartbeat {
    pub fn new(state: SharedState) -> Self {
        Self { state }
    }
}

impl Operation for Heartbeat {
    fn operation_type(&self) -> &str {
        "Heartbeat"
    }

    fn create_request_payload(&mut self) -> RequestPayload {
        RequestPayload::Ready(serde_json::json!({}))
    }

    fn process_confirmation(&mut self, payload: &Value) {
        self.state.lock().last_heartbeat = Some(Utc::now());
        if let Ok(response) = serde_json::from_value::<HeartbeatResponse>(payload.clone()) {
            debug!(current_time = %response.current_time, "heartbeat acknowledged");
        }
    }
}

//! BootNotification
//!
//! First message after connecting. The response decides whether the station
//! is registered and how often to heartbeat; a Pending/Rejected response
//! carries the retry interval instead.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::warn;

use ocpp_rpc::{Operation, RequestPayload};

use crate::state::{RegistrationStatus, SharedState};

use super::payload_or_not_ready;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BootNotificationRequest {
    pub charge_point_vendor: String,
    pub charge_point_model: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub charge_point_serial_number: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub firmware_version: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BootNotificationResponse {
    pub status: RegistrationStatus,
    pub current_time: DateTime<Utc>,
    pub interval: i64,
}

pub struct BootNotification {
    request: BootNotificationRequest,
    state: SharedState,
}

impl BootNotification {
    pub fn new(request: BootNotificationRequest, state: SharedState) -> Self {
        Self { request, state }
    }
}

impl Operation for BootNotification {
    fn operation_type(&self) -> &str {
        "BootNotification"
    }

    fn create_request_payload(&mut self) -> RequestPayload {
        payload_or_not_ready(&self.request)
    }

    fn process_confirmation(&mut self, payload: &Value) {
        match serde_json::from_value::<BootNotificationResponse>(payload.clone()) {
            Ok(response) => {
                self.state
                    .lock()
                    .apply_registration(response.status, response.interval);
            }
            Err(e) => warn!("unparseable BootNotification response: {}", e),
        }
    }
}

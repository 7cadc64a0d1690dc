//! StatusNotification
//!
//! Reports a connector status transition. The confirmation payload is empty.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use ocpp_rpc::{Operation, RequestPayload};

use crate::state::ChargePointStatus;

use super::payload_or_not_ready;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusNotificationRequest {
    pub connector_id: u32,
    pub error_code: String,
    pub status: ChargePointStatus,
    pub timestamp: DateTime<Utc>,
}

pub struct StatusNotification {
    request: StatusNotificationRequest,
}

impl StatusNotification {
    pub fn new(connector_id: u32, status: ChargePointStatus) -> Self {
        Self {
            request: StatusNotificationRequest {
                connector_id,
                error_code: "NoError".to_string(),
                status,
                timestamp: Utc::now(),
            },
        }
    }
}

impl Operation for StatusNotification {
    fn operation_type(&self) -> &str {
        "StatusNotification"
    }

    fn create_request_payload(&mut self) -> RequestPayload {
        payload_or_not_ready(&self.request)
    }
}

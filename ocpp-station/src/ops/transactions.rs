//! StartTransaction / StopTransaction
//!
//! The billing-critical pair. Both live in the persistent send queue: their
//! request state is written to the operation store before the first send and
//! restored after a power loss, so a charging session is never lost or
//! double-reported.
//!
//! StopTransaction may be enqueued before StartTransaction has been
//! confirmed; it resolves the transaction id from the shared state and
//! reports "not ready" until the id exists. Head-of-line ordering in the
//! queue guarantees the start is confirmed first.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{info, warn};

use ocpp_rpc::{Operation, RequestPayload};

use crate::state::{ActiveTransaction, SharedState};

use super::payload_or_not_ready;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AuthorizationStatus {
    Accepted,
    Blocked,
    Expired,
    Invalid,
    ConcurrentTx,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IdTagInfo {
    pub status: AuthorizationStatus,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StartTransactionRequest {
    pub connector_id: u32,
    pub id_tag: String,
    pub meter_start: i64,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StartTransactionResponse {
    pub id_tag_info: IdTagInfo,
    pub transaction_id: i64,
}

pub struct StartTransaction {
    request: Option<StartTransactionRequest>,
    state: SharedState,
}

impl StartTransaction {
    pub fn new(connector_id: u32, id_tag: impl Into<String>, meter_start: i64, state: SharedState) -> Self {
        Self {
            request: Some(StartTransactionRequest {
                connector_id,
                id_tag: id_tag.into(),
                meter_start,
                timestamp: Utc::now(),
            }),
            state,
        }
    }

    /// Empty shell for the restore path; the stored blob fills it in.
    pub fn restored(state: SharedState) -> Self {
        Self {
            request: None,
            state,
        }
    }
}

impl Operation for StartTransaction {
    fn operation_type(&self) -> &str {
        "StartTransaction"
    }

    fn create_request_payload(&mut self) -> RequestPayload {
        match &self.request {
            Some(request) => payload_or_not_ready(request),
            None => RequestPayload::NotReady,
        }
    }

    fn process_confirmation(&mut self, payload: &Value) {
        let response = match serde_json::from_value::<StartTransactionResponse>(payload.clone()) {
            Ok(r) => r,
            Err(e) => {
                warn!("unparseable StartTransaction response: {}", e);
                return;
            }
        };

        let Some(request) = &self.request else {
            return;
        };

        if response.id_tag_info.status == AuthorizationStatus::Accepted {
            info!(
                transaction_id = response.transaction_id,
                connector_id = request.connector_id,
                id_tag = %request.id_tag,
                "transaction started"
            );
            self.state.lock().transaction = Some(ActiveTransaction {
                transaction_id: response.transaction_id,
                connector_id: request.connector_id,
                id_tag: request.id_tag.clone(),
                meter_start: request.meter_start,
                started_at: request.timestamp,
            });
        } else {
            warn!(
                status = ?response.id_tag_info.status,
                id_tag = %request.id_tag,
                "transaction authorization failed"
            );
        }
    }

    fn snapshot(&self) -> Option<Value> {
        self.request
            .as_ref()
            .and_then(|r| serde_json::to_value(r).ok())
    }

    fn restore(&mut self, blob: &Value) {
        match serde_json::from_value(blob.clone()) {
            Ok(request) => self.request = Some(request),
            Err(e) => warn!("unparseable StartTransaction record: {}", e),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct StopTransactionSnapshot {
    #[serde(skip_serializing_if = "Option::is_none")]
    transaction_id: Option<i64>,
    meter_stop: i64,
    timestamp: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    reason: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct StopTransactionRequest {
    transaction_id: i64,
    meter_stop: i64,
    timestamp: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    reason: Option<String>,
}

pub struct StopTransaction {
    transaction_id: Option<i64>,
    meter_stop: i64,
    timestamp: DateTime<Utc>,
    reason: Option<String>,
    state: SharedState,
}

impl StopTransaction {
    pub fn new(meter_stop: i64, reason: Option<String>, state: SharedState) -> Self {
        // The id may not exist yet if the start is still unconfirmed; it is
        // resolved lazily in create_request_payload.
        let transaction_id = state.lock().transaction.as_ref().map(|t| t.transaction_id);
        Self {
            transaction_id,
            meter_stop,
            timestamp: Utc::now(),
            reason,
            state,
        }
    }

    pub fn restored(state: SharedState) -> Self {
        Self {
            transaction_id: None,
            meter_stop: 0,
            timestamp: Utc::now(),
            reason: None,
            state,
        }
    }
}

impl Operation for StopTransaction {
    fn operation_type(&self) -> &str {
        "StopTransaction"
    }

    fn create_request_payload(&mut self) -> RequestPayload {
        if self.transaction_id.is_none() {
            self.transaction_id = self
                .state
                .lock()
                .transaction
                .as_ref()
                .map(|t| t.transaction_id);
        }
        let Some(transaction_id) = self.transaction_id else {
            return RequestPayload::NotReady;
        };

        payload_or_not_ready(&StopTransactionRequest {
            transaction_id,
            meter_stop: self.meter_stop,
            timestamp: self.timestamp,
            reason: self.reason.clone(),
        })
    }

    fn process_confirmation(&mut self, _payload: &Value) {
        let mut state = self.state.lock();
        if let Some(tx) = state.transaction.take() {
            info!(
                transaction_id = tx.transaction_id,
                energy_wh = self.meter_stop - tx.meter_start,
                "transaction stopped"
            );
        }
    }

    fn snapshot(&self) -> Option<Value> {
        serde_json::to_value(StopTransactionSnapshot {
            transaction_id: self.transaction_id,
            meter_stop: self.meter_stop,
            timestamp: self.timestamp,
            reason: self.reason.clone(),
        })
        .ok()
    }

    fn restore(&mut self, blob: &Value) {
        match serde_json::from_value::<StopTransactionSnapshot>(blob.clone()) {
            Ok(snapshot) => {
                self.transaction_id = snapshot.transaction_id;
                self.meter_stop = snapshot.meter_stop;
                self.timestamp = snapshot.timestamp;
                self.reason = snapshot.reason;
            }
            Err(e) => warn!("unparseable StopTransaction record: {}", e),
        }
    }
}

//! Concrete OCPP 1.6 operations
//!
//! Each message type implements the engine's `Operation` trait: it produces
//! its request payload, consumes the confirmation and updates the shared
//! station state. Transaction messages additionally snapshot/restore their
//! state for the persistent queue.

pub mod boot_notification;
pub mod heartbeat;
pub mod meter_values;
pub mod reset;
pub mod status_notification;
pub mod transactions;

pub use boot_notification::{BootNotification, BootNotificationRequest, BootNotificationResponse};
pub use heartbeat::{Heartbeat, HeartbeatResponse};
pub use meter_values::{MeterSample, MeterValues, Sampler};
pub use reset::Reset;
pub use status_notification::{StatusNotification, StatusNotificationRequest};
pub use transactions::{
    AuthorizationStatus, IdTagInfo, StartTransaction, StartTransactionRequest,
    StartTransactionResponse, StopTransaction,
};

use ocpp_rpc::RequestPayload;
use serde::Serialize;
use tracing::error;

/// Serialize a payload struct, falling back to a retry on the next tick if
/// serialization ever fails (it does not for these types).
pub(crate) fn payload_or_not_ready<T: Serialize>(value: &T) -> RequestPayload {
    match serde_json::to_value(value) {
        Ok(v) => RequestPayload::Ready(v),
        Err(e) => {
            error!("payload serialization failed: {}", e);
            RequestPayload::NotReady
        }
    }
}

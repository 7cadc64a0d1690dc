//! Charge point runtime state
//!
//! Shared between the concrete operations (which update it when
//! confirmations arrive) and the embedding application. Single lock, held
//! only for short reads/writes from within engine ticks.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::info;

/// Registration status from BootNotification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub enum RegistrationStatus {
    Accepted,
    Pending,
    Rejected,
}

/// OCPP 1.6 connector status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChargePointStatus {
    Available,
    Preparing,
    Charging,
    Finishing,
    Unavailable,
    Faulted,
}

/// Reset kind requested by the CSMS.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ResetKind {
    Hard,
    Soft,
}

/// The transaction currently running on a connector.
#[derive(Debug, Clone)]
pub struct ActiveTransaction {
    pub transaction_id: i64,
    pub connector_id: u32,
    pub id_tag: String,
    pub meter_start: i64,
    pub started_at: DateTime<Utc>,
}

/// Mutable charge point state.
#[derive(Debug)]
pub struct StationState {
    /// Outcome of the last BootNotification, `None` before the first one.
    pub registration: Option<RegistrationStatus>,

    /// Heartbeat interval granted by the CSMS.
    pub heartbeat_interval: Duration,

    /// When the last Heartbeat was issued.
    pub last_heartbeat: Option<DateTime<Utc>>,

    /// Per-connector status, index 0 = connector 1.
    pub connectors: Vec<ChargePointStatus>,

    /// The running transaction, if any.
    pub transaction: Option<ActiveTransaction>,

    /// A reset the CSMS asked for; the application observes and executes it.
    pub pending_reset: Option<ResetKind>,
}

impl StationState {
    pub fn new(connector_count: u32) -> Self {
        Self {
            registration: None,
            heartbeat_interval: Duration::from_secs(300),
            last_heartbeat: None,
            connectors: vec![ChargePointStatus::Available; connector_count as usize],
            transaction: None,
            pending_reset: None,
        }
    }

    /// Registered means the CSMS accepted our BootNotification.
    pub fn is_registered(&self) -> bool {
        self.registration == Some(RegistrationStatus::Accepted)
    }

    /// Whether a Heartbeat should be issued now.
    pub fn heartbeat_due(&self, now: DateTime<Utc>) -> bool {
        if !self.is_registered() {
            return false;
        }
        match self.last_heartbeat {
            None => true,
            Some(last) => {
                now.signed_duration_since(last).num_seconds()
                    >= self.heartbeat_interval.as_secs() as i64
            }
        }
    }

    /// Apply the BootNotification response.
    pub fn apply_registration(&mut self, status: RegistrationStatus, interval_secs: i64) {
        self.registration = Some(status);
        if interval_secs > 0 {
            self.heartbeat_interval = Duration::from_secs(interval_secs as u64);
        }
        match status {
            RegistrationStatus::Accepted => {
                info!(interval_secs, "registered with CSMS");
            }
            RegistrationStatus::Pending => {
                info!(interval_secs, "boot pending, will retry");
            }
            RegistrationStatus::Rejected => {
                info!("boot rejected by CSMS");
            }
        }
    }

    pub fn set_connector_status(&mut self, connector_id: u32, status: ChargePointStatus) {
        if connector_id >= 1 {
            if let Some(slot) = self.connectors.get_mut(connector_id as usize - 1) {
                *slot = status;
            }
        }
    }

    pub fn connector_status(&self, connector_id: u32) -> Option<ChargePointStatus> {
        if connector_id >= 1 {
            self.connectors.get(connector_id as usize - 1).copied()
        } else {
            None
        }
    }
}

/// Handle shared between the station, its operations and the application.
pub type SharedState = Arc<Mutex<StationState>>;

pub fn shared(connector_count: u32) -> SharedState {
    Arc::new(Mutex::new(StationState::new(connector_count)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_heartbeat_due_only_when_registered() {
        let mut state = StationState::new(1);
        let now = Utc::now();
        assert!(!state.heartbeat_due(now));

        state.apply_registration(RegistrationStatus::Accepted, 60);
        assert!(state.heartbeat_due(now));

        state.last_heartbeat = Some(now);
        assert!(!state.heartbeat_due(now));
        assert!(state.heartbeat_due(now + chrono::Duration::seconds(61)));
    }

    #[test]
    fn test_rejected_boot_does_not_register() {
        let mut state = StationState::new(1);
        state.apply_registration(RegistrationStatus::Rejected, 120);
        assert!(!state.is_registered());
        assert_eq!(state.heartbeat_interval, Duration::from_secs(120));
    }

    #[test]
    fn test_connector_status_one_based() {
        let mut state = StationState::new(2);
        state.set_connector_status(2, ChargePointStatus::Charging);
        assert_eq!(state.connector_status(2), Some(ChargePointStatus::Charging));
        assert_eq!(state.connector_status(1), Some(ChargePointStatus::Available));
        assert_eq!(state.connector_status(0), None);
        assert_eq!(state.connector_status(3), None);
    }
}

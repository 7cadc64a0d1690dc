//! Station wiring
//!
//! Composes the protocol engine with the concrete operations: three send
//! queues (pre-boot, default, transactions), the inbound registry, the
//! persistent store for transaction messages, BootNotification retry and
//! Heartbeat scheduling.
//!
//! Queue layout:
//! - `preboot`: always active; carries BootNotification only.
//! - `default`: volatile traffic (Heartbeat, StatusNotification,
//!   MeterValues); gated until the CSMS accepts us.
//! - `transactions`: persistent, crash-safe; gated the same way.

use std::time::{Duration, Instant};

use chrono::Utc;
use tracing::{info, warn};

use ocpp_rpc::{
    Connection, Engine, FileOpStore, FileStoreConfig, OperationRegistry, PersistentQueue, Request,
    RpcError, VolatileQueue,
};

use crate::config::StationConfig;
use crate::ops::{
    BootNotification, BootNotificationRequest, Heartbeat, MeterValues, Reset, Sampler,
    StartTransaction, StatusNotification, StopTransaction,
};
use crate::state::{self, ChargePointStatus, SharedState};

pub const QUEUE_PREBOOT: &str = "preboot";
pub const QUEUE_DEFAULT: &str = "default";
pub const QUEUE_TRANSACTIONS: &str = "transactions";

/// A charge point client: engine, queues and scheduling in one value.
pub struct Station<C: Connection> {
    config: StationConfig,
    state: SharedState,
    engine: Engine<C>,
    gates_open: bool,
    was_connected: bool,
    last_boot_attempt: Option<Instant>,
}

impl<C: Connection> Station<C> {
    pub fn new(config: StationConfig, connection: C) -> Result<Self, RpcError> {
        Self::new_with_registry(config, connection, |_| {})
    }

    /// Build a station, letting the host firmware register vendor operations
    /// on the registry before the engine takes ownership of it.
    pub fn new_with_registry(
        config: StationConfig,
        connection: C,
        customize: impl FnOnce(&mut OperationRegistry),
    ) -> Result<Self, RpcError> {
        let state = state::shared(config.connector_count);

        let mut registry = OperationRegistry::new();
        {
            let s = state.clone();
            registry.register("Reset", move || Box::new(Reset::new(s.clone())));
        }
        {
            let s = state.clone();
            registry.register_restore("StartTransaction", move || {
                Box::new(StartTransaction::restored(s.clone()))
            });
        }
        {
            let s = state.clone();
            registry.register_restore("StopTransaction", move || {
                Box::new(StopTransaction::restored(s.clone()))
            });
        }
        customize(&mut registry);

        let mut engine = Engine::new(connection, registry);
        engine.add_queue(VolatileQueue::new(QUEUE_PREBOOT));
        engine.add_queue(VolatileQueue::gated(QUEUE_DEFAULT));

        let store = FileOpStore::new(FileStoreConfig {
            dir: config.data_dir.clone(),
            fsync_on_write: config.fsync_on_write,
        })?;
        engine.add_queue(PersistentQueue::gated(QUEUE_TRANSACTIONS, store));
        engine.restore();

        Ok(Self {
            config,
            state,
            engine,
            gates_open: false,
            was_connected: false,
            last_boot_attempt: None,
        })
    }

    /// Shared station state, also handed to every operation.
    pub fn state(&self) -> SharedState {
        self.state.clone()
    }

    pub fn engine(&self) -> &Engine<C> {
        &self.engine
    }

    pub fn engine_mut(&mut self) -> &mut Engine<C> {
        &mut self.engine
    }

    /// Advance the station by one pass: scheduling first, then one engine
    /// tick. Call this from the application main loop.
    pub fn tick(&mut self) {
        let now = Instant::now();
        self.watch_link();
        self.maybe_send_boot(now);
        self.open_gates_if_registered();
        self.maybe_send_heartbeat();
        self.engine.tick();
    }

    /// Losing the link invalidates the registration; OCPP requires a fresh
    /// BootNotification on every connection.
    fn watch_link(&mut self) {
        let connected = self.engine.connection().is_connected();
        if self.was_connected && !connected {
            warn!("link lost, re-registration required");
            self.state.lock().registration = None;
            self.engine.set_queue_active(QUEUE_DEFAULT, false);
            self.engine.set_queue_active(QUEUE_TRANSACTIONS, false);
            self.gates_open = false;
            self.last_boot_attempt = None;
        }
        self.was_connected = connected;
    }

    fn maybe_send_boot(&mut self, now: Instant) {
        if !self.engine.connection().is_connected() {
            return;
        }
        if self.engine.queue_len(QUEUE_PREBOOT) > 0 {
            return;
        }

        let retry_interval = {
            let state = self.state.lock();
            if state.is_registered() {
                return;
            }
            match state.registration {
                // A Pending/Rejected response dictates the retry spacing.
                Some(_) => state.heartbeat_interval,
                None => self.config.boot_retry_interval,
            }
        };

        let due = match self.last_boot_attempt {
            None => true,
            Some(at) => now.duration_since(at) >= retry_interval,
        };
        if !due {
            return;
        }

        let request = BootNotificationRequest {
            charge_point_vendor: self.config.vendor.clone(),
            charge_point_model: self.config.model.clone(),
            charge_point_serial_number: self.config.serial_number.clone(),
            firmware_version: self.config.firmware_version.clone(),
        };
        let operation = BootNotification::new(request, self.state.clone());

        info!("sending BootNotification");
        self.engine.enqueue(
            QUEUE_PREBOOT,
            Request::new(Box::new(operation)).with_timeout(self.config.request_timeout),
        );
        self.last_boot_attempt = Some(now);
    }

    fn open_gates_if_registered(&mut self) {
        if self.gates_open || !self.state.lock().is_registered() {
            return;
        }
        info!("registration accepted, opening send queues");
        self.engine.set_queue_active(QUEUE_DEFAULT, true);
        self.engine.set_queue_active(QUEUE_TRANSACTIONS, true);
        self.gates_open = true;
    }

    fn maybe_send_heartbeat(&mut self) {
        let due = {
            let mut state = self.state.lock();
            if state.heartbeat_due(Utc::now()) {
                // Marked at enqueue so one slow tick cannot flood the queue;
                // the confirmation refreshes it again.
                state.last_heartbeat = Some(Utc::now());
                true
            } else {
                false
            }
        };
        if due {
            let operation = Heartbeat::new(self.state.clone());
            self.engine.enqueue(
                QUEUE_DEFAULT,
                Request::new(Box::new(operation)).with_timeout(self.config.request_timeout),
            );
        }
    }

    /// Report a connector status transition.
    pub fn status_notification(&mut self, connector_id: u32, status: ChargePointStatus) {
        self.state.lock().set_connector_status(connector_id, status);
        let operation = StatusNotification::new(connector_id, status);
        self.engine.enqueue(
            QUEUE_DEFAULT,
            Request::new(Box::new(operation)).with_timeout(self.config.request_timeout),
        );
    }

    /// Send meter samples pulled from the given sampler.
    pub fn meter_values(&mut self, connector_id: u32, sampler: Sampler) {
        let transaction_id = self
            .state
            .lock()
            .transaction
            .as_ref()
            .map(|t| t.transaction_id);
        let operation = MeterValues::new(connector_id, transaction_id, sampler);
        self.engine.enqueue(
            QUEUE_DEFAULT,
            Request::new(Box::new(operation)).with_timeout(self.config.request_timeout),
        );
    }

    /// Begin a charging transaction. Persisted before the first send; no
    /// timeout, retried until the CSMS answers.
    pub fn start_transaction(&mut self, connector_id: u32, id_tag: impl Into<String>, meter_start: i64) {
        let operation = StartTransaction::new(connector_id, id_tag, meter_start, self.state.clone());
        self.engine.enqueue(
            QUEUE_TRANSACTIONS,
            Request::new(Box::new(operation))
                .with_timeout(Duration::ZERO)
                .with_retries(u32::MAX, self.config.transaction_retry_interval),
        );
    }

    /// End the running charging transaction.
    pub fn stop_transaction(&mut self, meter_stop: i64, reason: Option<String>) {
        let operation = StopTransaction::new(meter_stop, reason, self.state.clone());
        self.engine.enqueue(
            QUEUE_TRANSACTIONS,
            Request::new(Box::new(operation))
                .with_timeout(Duration::ZERO)
                .with_retries(u32::MAX, self.config.transaction_retry_interval),
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ocpp_rpc::{LoopbackConnection, OcppFrame};
    use tempfile::tempdir;

    fn test_config(dir: &std::path::Path) -> StationConfig {
        let mut config = StationConfig::new("CS001", "ws://localhost/ocpp").with_data_dir(dir);
        config.fsync_on_write = false;
        config
    }

    fn station(dir: &std::path::Path) -> Station<LoopbackConnection> {
        Station::new(test_config(dir), LoopbackConnection::new()).expect("station builds")
    }

    fn sent(station: &Station<LoopbackConnection>) -> Vec<OcppFrame> {
        station
            .engine()
            .connection()
            .sent
            .iter()
            .map(|t| OcppFrame::parse(t, usize::MAX).expect("valid frame"))
            .collect()
    }

    fn accept_boot(station: &mut Station<LoopbackConnection>) {
        station.tick();
        let frames = sent(station);
        let boot = frames.last().expect("boot frame sent");
        match boot {
            OcppFrame::Call(call) => assert_eq!(call.action, "BootNotification"),
            _ => panic!("Expected Call"),
        }
        let reply = format!(
            r#"[3,"{}",{{"status":"Accepted","currentTime":"2026-01-20T12:00:00Z","interval":600}}]"#,
            boot.message_id()
        );
        station.engine_mut().connection_mut().push_incoming(reply);
        station.tick();
    }

    #[test]
    fn test_boot_flow_opens_gates() {
        let dir = tempdir().unwrap();
        let mut station = station(dir.path());

        accept_boot(&mut station);
        assert!(station.state().lock().is_registered());

        // First registered tick schedules a Heartbeat on the now-open
        // default queue.
        station.tick();
        station.tick();
        let frames = sent(&station);
        let heartbeat = frames.iter().any(|f| {
            matches!(f, OcppFrame::Call(call) if call.action == "Heartbeat")
        });
        assert!(heartbeat);
    }

    #[test]
    fn test_nothing_leaves_gated_queues_before_boot() {
        let dir = tempdir().unwrap();
        let mut station = station(dir.path());

        station.status_notification(1, ChargePointStatus::Preparing);
        station.start_transaction(1, "TAG-1", 100);

        station.tick();
        station.tick();

        let frames = sent(&station);
        // Only the BootNotification may be in flight.
        assert_eq!(frames.len(), 1);
        assert!(matches!(
            &frames[0],
            OcppFrame::Call(call) if call.action == "BootNotification"
        ));
    }

    #[test]
    fn test_boot_retries_after_timeout() {
        let dir = tempdir().unwrap();
        let mut config = test_config(dir.path());
        config.boot_retry_interval = Duration::ZERO;
        config.request_timeout = Duration::from_millis(1);
        let mut station =
            Station::new(config, LoopbackConnection::new()).expect("station builds");

        station.tick();
        assert_eq!(sent(&station).len(), 1);

        // Let the unanswered boot time out, then the next tick re-sends.
        std::thread::sleep(Duration::from_millis(5));
        station.tick();
        station.tick();
        assert!(sent(&station).len() >= 2);
    }

    #[test]
    fn test_transaction_order_start_before_stop() {
        let dir = tempdir().unwrap();
        let mut station = station(dir.path());
        accept_boot(&mut station);

        station.start_transaction(1, "TAG-1", 1000);
        // Stop enqueued while the start is still unconfirmed.
        station.stop_transaction(2000, Some("Local".into()));

        station.tick();
        let frames = sent(&station);
        let start = frames
            .iter()
            .find_map(|f| match f {
                OcppFrame::Call(call) if call.action == "StartTransaction" => {
                    Some(call.message_id.clone())
                }
                _ => None,
            })
            .expect("start sent");

        let reply = format!(
            r#"[3,"{}",{{"idTagInfo":{{"status":"Accepted"}},"transactionId":42}}]"#,
            start
        );
        station.engine_mut().connection_mut().push_incoming(reply);
        station.tick();
        station.tick();

        let frames = sent(&station);
        let stop = frames.iter().find_map(|f| match f {
            OcppFrame::Call(call) if call.action == "StopTransaction" => Some(call),
            _ => None,
        });
        let stop = stop.expect("stop sent after start confirmed");
        assert_eq!(stop.payload["transactionId"], 42);
        assert_eq!(stop.payload["meterStop"], 2000);
    }

    #[test]
    fn test_start_transaction_replays_after_restart() {
        let dir = tempdir().unwrap();

        let original_id = {
            let mut station = station(dir.path());
            accept_boot(&mut station);
            station.start_transaction(1, "TAG-1", 1000);
            station.tick();

            let frames = sent(&station);
            frames
                .iter()
                .find_map(|f| match f {
                    OcppFrame::Call(call) if call.action == "StartTransaction" => {
                        Some(call.message_id.clone())
                    }
                    _ => None,
                })
                .expect("start sent")
            // Station dropped without a confirmation: the power loss.
        };

        let mut station = station(dir.path());
        accept_boot(&mut station);
        station.tick();
        station.tick();

        let frames = sent(&station);
        let replayed = frames
            .iter()
            .find_map(|f| match f {
                OcppFrame::Call(call) if call.action == "StartTransaction" => {
                    Some(call.message_id.clone())
                }
                _ => None,
            })
            .expect("start replayed after restart");
        assert_eq!(replayed, original_id);
    }

    #[test]
    fn test_confirmed_transaction_not_replayed() {
        let dir = tempdir().unwrap();

        {
            let mut station = station(dir.path());
            accept_boot(&mut station);
            station.start_transaction(1, "TAG-1", 1000);
            station.tick();

            let frames = sent(&station);
            let start_id = frames
                .iter()
                .find_map(|f| match f {
                    OcppFrame::Call(call) if call.action == "StartTransaction" => {
                        Some(call.message_id.clone())
                    }
                    _ => None,
                })
                .expect("start sent");

            let reply = format!(
                r#"[3,"{}",{{"idTagInfo":{{"status":"Accepted"}},"transactionId":42}}]"#,
                start_id
            );
            station.engine_mut().connection_mut().push_incoming(reply);
            station.tick();
        }

        let mut station = station(dir.path());
        accept_boot(&mut station);
        station.tick();
        station.tick();

        let frames = sent(&station);
        let replayed = frames
            .iter()
            .any(|f| matches!(f, OcppFrame::Call(call) if call.action == "StartTransaction"));
        assert!(!replayed, "confirmed transaction must not be sent twice");
    }

    #[test]
    fn test_reset_request_round_trip() {
        let dir = tempdir().unwrap();
        let mut station = station(dir.path());
        accept_boot(&mut station);

        station
            .engine_mut()
            .connection_mut()
            .push_incoming(r#"[2,"r-1","Reset",{"type":"Soft"}]"#);
        station.tick();
        station.tick();

        let frames = sent(&station);
        let reply = frames.iter().find_map(|f| match f {
            OcppFrame::CallResult(result) if result.message_id == "r-1" => Some(result),
            _ => None,
        });
        assert_eq!(reply.expect("reset answered").payload["status"], "Accepted");
        assert_eq!(
            station.state().lock().pending_reset,
            Some(crate::state::ResetKind::Soft)
        );
    }

    #[test]
    fn test_disconnect_forces_reregistration() {
        let dir = tempdir().unwrap();
        let mut station = station(dir.path());
        accept_boot(&mut station);
        assert!(station.state().lock().is_registered());

        station.engine_mut().connection_mut().connected = false;
        station.tick();
        assert!(!station.state().lock().is_registered());

        // Reconnect: a fresh BootNotification goes out.
        station.engine_mut().connection_mut().connected = true;
        station.tick();
        let frames = sent(&station);
        let boots = frames
            .iter()
            .filter(|f| matches!(f, OcppFrame::Call(call) if call.action == "BootNotification"))
            .count();
        assert!(boots >= 2);
    }
}

//! # OCPP Station
//!
//! An OCPP 1.6 charge point client built on the `ocpp-rpc` engine.
//!
//! This crate supplies everything the engine treats as a collaborator: the
//! concrete message types (BootNotification, Heartbeat, StatusNotification,
//! MeterValues, StartTransaction, StopTransaction, Reset), the shared
//! charge-point state they update, the WebSocket transport, and the
//! [`Station`] composition that wires queues, registry and scheduling
//! together.
//!
//! ## Usage
//!
//! ```no_run
//! use ocpp_station::{Station, StationConfig, WsConfig, WsConnection};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = StationConfig::new(
//!         "CS001",
//!         "ws://localhost:8180/steve/websocket/CentralSystemService",
//!     );
//!
//!     let connection = WsConnection::spawn(WsConfig::for_station(&config));
//!     let mut station = Station::new(config, connection)?;
//!
//!     let mut ticker = tokio::time::interval(std::time::Duration::from_millis(100));
//!     loop {
//!         ticker.tick().await;
//!         station.tick();
//!     }
//! }
//! ```

pub mod config;
pub mod ops;
pub mod state;
pub mod station;
pub mod ws;

pub use config::StationConfig;
pub use state::{
    ActiveTransaction, ChargePointStatus, RegistrationStatus, ResetKind, SharedState, StationState,
};
pub use station::{Station, QUEUE_DEFAULT, QUEUE_PREBOOT, QUEUE_TRANSACTIONS};
pub use ws::{WsConfig, WsConnection};

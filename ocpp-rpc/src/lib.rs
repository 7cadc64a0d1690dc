//! # OCPP-J RPC Engine
//!
//! Request/response protocol engine for OCPP-J, the JSON-over-WebSocket
//! binding of the Open Charge Point Protocol. This crate is the reusable
//! core of a charge point client: framing and classification of the three
//! OCPP-J message types, ordered outbound/inbound queues, message-id
//! matching, timeout and bounded retry, and crash-safe persistence for
//! billing-critical operations.
//!
//! ## Architecture
//!
//! ```text
//! Central system (CSMS)
//!       │ WebSocket, OCPP-J arrays
//!       ▼
//! ┌────────────────────────────────────────────┐
//! │ Engine (one tick per main-loop pass)       │
//! │  ┌───────┐ ┌─────────────┐ ┌────────────┐  │
//! │  │ Codec │ │ Send queues │ │  Inbound   │  │
//! │  │       │ │ (op_nr ord.)│ │  queue     │  │
//! │  └───────┘ └──────┬──────┘ └────────────┘  │
//! │            ┌──────┴──────┐ ┌────────────┐  │
//! │            │  Registry   │ │  OpStore   │  │
//! │            └─────────────┘ └────────────┘  │
//! └────────────────────────────────────────────┘
//!       ▲ Operation trait objects
//!       │
//! Concrete message types (BootNotification, StartTransaction, ...)
//! ```
//!
//! The engine is single-threaded and poll-driven: the embedding application
//! calls [`Engine::tick`] from its main loop, and every callback invoked
//! from within a tick must be non-blocking. Message business logic lives
//! outside this crate, behind the [`Operation`] trait.

pub mod connection;
pub mod engine;
pub mod error;
pub mod frame;
pub mod operation;
pub mod queue;
pub mod registry;
pub mod request;
pub mod store;

pub use connection::{Connection, LoopbackConnection};
pub use engine::{Engine, EngineConfig};
pub use error::{ErrorCode, OperationError, RpcError};
pub use frame::{CallErrorFrame, CallFrame, CallResultFrame, OcppFrame};
pub use operation::{NotImplemented, Operation, RequestPayload, ResponsePayload};
pub use queue::{InboundQueue, SendQueue, VolatileQueue};
pub use registry::OperationRegistry;
pub use request::{MessageIdSource, Request};
pub use store::{FileOpStore, FileStoreConfig, MemoryOpStore, OpRecord, OpStore, PersistentQueue};

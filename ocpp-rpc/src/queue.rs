//! Request queues
//!
//! Outbound traffic lives in named send queues. Each queue is a strict FIFO
//! with head-of-line blocking: only the front entry may be in flight, later
//! entries wait even if ready. Ordering *across* queues comes from the
//! `op_nr` sequence number every request gets at enqueue time: the engine
//! sends from whichever queue currently holds the globally smallest front
//! `op_nr`, so independently-produced traffic stays totally ordered without
//! any shared structure.
//!
//! [`VolatileQueue`] is memory-only and loses its contents on reboot, which
//! is fine for idempotent traffic (Heartbeat, status reports). The durable
//! variant lives in [`crate::store`].

use std::collections::VecDeque;

use crate::registry::OperationRegistry;
use crate::request::{MessageIdSource, Request};

/// A named, ordered holding area for outbound requests.
pub trait SendQueue: Send {
    fn name(&self) -> &str;

    /// Gated queues (the pre-boot pattern) are skipped by send selection but
    /// still tick their timeouts.
    fn is_active(&self) -> bool;

    fn set_active(&mut self, active: bool);

    /// `op_nr` of the front entry; `None` is the "no operation" sentinel.
    fn front_op_nr(&self) -> Option<u64>;

    fn front_mut(&mut self) -> Option<&mut Request>;

    fn pop_front(&mut self) -> Option<Request>;

    /// Append a request. The engine has already tagged it with its `op_nr`
    /// (and, for durable queues, its message id).
    fn push(&mut self, request: Request);

    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Durable queues persist the message id before the request may be sent,
    /// so the engine assigns ids eagerly for them.
    fn is_durable(&self) -> bool {
        false
    }

    /// Called just before the confirmed front entry is popped; durable queues
    /// record the confirmation here.
    fn note_front_concluded(&mut self, _request: &Request) {}

    /// Rebuild queue contents from storage at boot. Returns the number of
    /// restored requests. Volatile queues have nothing to restore.
    fn restore(
        &mut self,
        _registry: &OperationRegistry,
        _ids: &mut MessageIdSource,
        _next_op_nr: &mut u64,
    ) -> usize {
        0
    }
}

/// Plain in-memory FIFO send queue.
pub struct VolatileQueue {
    name: String,
    active: bool,
    entries: VecDeque<Request>,
}

impl VolatileQueue {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            active: true,
            entries: VecDeque::new(),
        }
    }

    /// Create the queue in the gated state.
    pub fn gated(name: impl Into<String>) -> Self {
        let mut queue = Self::new(name);
        queue.active = false;
        queue
    }
}

impl SendQueue for VolatileQueue {
    fn name(&self) -> &str {
        &self.name
    }

    fn is_active(&self) -> bool {
        self.active
    }

    fn set_active(&mut self, active: bool) {
        self.active = active;
    }

    fn front_op_nr(&self) -> Option<u64> {
        self.entries.front().map(|r| r.op_nr())
    }

    fn front_mut(&mut self) -> Option<&mut Request> {
        self.entries.front_mut()
    }

    fn pop_front(&mut self) -> Option<Request> {
        self.entries.pop_front()
    }

    fn push(&mut self, request: Request) {
        self.entries.push_back(request);
    }

    fn len(&self) -> usize {
        self.entries.len()
    }
}

/// FIFO of received CALLs awaiting their response.
///
/// Only the front entry is ever asked for its response payload; a `Pending`
/// front blocks the rest so responses leave in arrival order.
#[derive(Default)]
pub struct InboundQueue {
    entries: VecDeque<Request>,
}

impl InboundQueue {
    pub fn new() -> Self {
        Self {
            entries: VecDeque::new(),
        }
    }

    pub fn push(&mut self, request: Request) {
        self.entries.push_back(request);
    }

    pub fn front_mut(&mut self) -> Option<&mut Request> {
        self.entries.front_mut()
    }

    pub fn pop_front(&mut self) -> Option<Request> {
        self.entries.pop_front()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

//! Dispatcher engine
//!
//! Single-threaded, poll-driven core that ties codec, queues and registry
//! together. The embedding application calls [`Engine::tick`] from its main
//! loop; one tick performs one bounded pass:
//!
//! 1. timeout/retry bookkeeping for every queue front (also while offline),
//! 2. nothing else while the transport is down,
//! 3. one response attempt for the inbound front,
//! 4. one send attempt for the globally lowest-`op_nr` front across the
//!    active send queues (only when no request is awaiting its reply),
//! 5. one inbound frame decoded and routed.
//!
//! All mutable protocol state (queues, registry, the message-id counter and
//! the `op_nr` counter) lives in this one value; there are no process-wide
//! statics.

use std::time::Instant;

use tracing::{debug, error, info, warn};

use crate::connection::Connection;
use crate::error::{ErrorCode, RpcError};
use crate::frame::{CallErrorFrame, CallResultFrame, OcppFrame, DEFAULT_MAX_FRAME_SIZE};
use crate::operation::ResponsePayload;
use crate::queue::{InboundQueue, SendQueue};
use crate::registry::OperationRegistry;
use crate::request::{MessageIdSource, Request, TickOutcome};

/// Engine tuning knobs.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Hard cap on inbound frame size (bytes).
    pub max_frame_size: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
        }
    }
}

/// The protocol engine.
pub struct Engine<C: Connection> {
    connection: C,
    config: EngineConfig,
    registry: OperationRegistry,
    ids: MessageIdSource,
    next_op_nr: u64,
    queues: Vec<Box<dyn SendQueue>>,
    inbound: InboundQueue,
}

impl<C: Connection> Engine<C> {
    pub fn new(connection: C, registry: OperationRegistry) -> Self {
        Self::with_config(connection, registry, EngineConfig::default())
    }

    pub fn with_config(connection: C, registry: OperationRegistry, config: EngineConfig) -> Self {
        Self {
            connection,
            config,
            registry,
            ids: MessageIdSource::new(),
            next_op_nr: 1,
            queues: Vec::new(),
            inbound: InboundQueue::new(),
        }
    }

    /// Install a send queue. Queues are polled in registration order, but
    /// ordering between them comes from `op_nr`, not position.
    pub fn add_queue(&mut self, queue: impl SendQueue + 'static) {
        self.queues.push(Box::new(queue));
    }

    /// Replay persisted operations into their queues and re-seed the id and
    /// `op_nr` counters. Call once at boot, before the first enqueue.
    pub fn restore(&mut self) -> usize {
        let registry = &self.registry;
        let mut restored = 0;
        for queue in &mut self.queues {
            restored += queue.restore(registry, &mut self.ids, &mut self.next_op_nr);
        }
        if restored > 0 {
            info!(restored, "persisted operations replayed");
        }
        restored
    }

    /// Gate or un-gate a queue (the pre-boot pattern).
    pub fn set_queue_active(&mut self, name: &str, active: bool) -> bool {
        match self.queues.iter_mut().find(|q| q.name() == name) {
            Some(queue) => {
                queue.set_active(active);
                true
            }
            None => false,
        }
    }

    /// Append a request to a named send queue, tagging it with the next
    /// `op_nr`. Requests for durable queues get their message id here so the
    /// persisted header is complete before the first send. An unknown queue
    /// name drops (and thereby aborts) the request.
    pub fn enqueue(&mut self, queue_name: &str, mut request: Request) -> bool {
        let Some(queue) = self.queues.iter_mut().find(|q| q.name() == queue_name) else {
            error!(queue = queue_name, "no such send queue, dropping request");
            return false;
        };

        request.set_op_nr(self.next_op_nr);
        self.next_op_nr += 1;
        if queue.is_durable() {
            request.ensure_message_id(&mut self.ids);
        }

        debug!(
            queue = queue_name,
            action = request.operation_type(),
            op_nr = request.op_nr(),
            "request enqueued"
        );
        queue.push(request);
        true
    }

    pub fn connection(&self) -> &C {
        &self.connection
    }

    pub fn connection_mut(&mut self) -> &mut C {
        &mut self.connection
    }

    pub fn queue_len(&self, name: &str) -> usize {
        self.queues
            .iter()
            .find(|q| q.name() == name)
            .map(|q| q.len())
            .unwrap_or(0)
    }

    pub fn inbound_len(&self) -> usize {
        self.inbound.len()
    }

    /// Advance the engine by one pass.
    pub fn tick(&mut self) {
        self.tick_at(Instant::now());
    }

    /// Tick with an explicit time, the seam the timeout tests drive.
    pub fn tick_at(&mut self, now: Instant) {
        self.tick_timeouts(now);

        if !self.connection.is_connected() {
            return;
        }

        let responded = self.tick_inbound();
        if !responded {
            self.tick_outbound(now);
        }
        self.tick_receive();
    }

    /// Step 1: timeout and retry bookkeeping for every queue front. Runs
    /// regardless of link state so local bounds keep advancing offline.
    fn tick_timeouts(&mut self, now: Instant) {
        for queue in &mut self.queues {
            let Some(front) = queue.front_mut() else {
                continue;
            };
            match front.advance(now) {
                TickOutcome::TimedOut => {
                    if let Some(mut request) = queue.pop_front() {
                        request.execute_timeout();
                        queue.note_front_concluded(&request);
                    }
                }
                TickOutcome::Resend => {
                    debug!(queue = queue.name(), "attempt unanswered, freeing the line");
                }
                TickOutcome::Keep => {}
            }
        }
    }

    /// Step 3: one response attempt for the inbound front. A `Pending` front
    /// blocks the queue so responses keep arrival order. Returns whether a
    /// frame went out.
    fn tick_inbound(&mut self) -> bool {
        let Some(front) = self.inbound.front_mut() else {
            return false;
        };
        let message_id = front.message_id().unwrap_or_default().to_string();

        let frame = match front.operation_mut().create_response_payload() {
            ResponsePayload::Pending => return false,
            ResponsePayload::Ready(payload) => OcppFrame::CallResult(CallResultFrame {
                message_id,
                payload,
            }),
            ResponsePayload::Failed(err) => OcppFrame::CallError(CallErrorFrame {
                message_id,
                error_code: err.code.as_str().to_string(),
                error_description: err.description,
                error_details: err.details,
            }),
        };

        if self.transmit(&frame) {
            self.inbound.pop_front();
            true
        } else {
            false
        }
    }

    /// Step 4: if nothing is awaiting a reply, send from the queue holding
    /// the globally smallest front `op_nr`.
    fn tick_outbound(&mut self, now: Instant) {
        let any_in_flight = self
            .queues
            .iter_mut()
            .any(|q| matches!(q.front_mut(), Some(r) if r.is_sent()));
        if any_in_flight {
            return;
        }

        let mut best: Option<(usize, u64)> = None;
        for (idx, queue) in self.queues.iter().enumerate() {
            if !queue.is_active() {
                continue;
            }
            if let Some(op_nr) = queue.front_op_nr() {
                if best.map_or(true, |(_, lowest)| op_nr < lowest) {
                    best = Some((idx, op_nr));
                }
            }
        }
        let Some((idx, _)) = best else {
            return;
        };

        let text = {
            let Some(front) = self.queues[idx].front_mut() else {
                return;
            };
            if !front.can_attempt(now) {
                return;
            }
            match front.create_request(&mut self.ids) {
                Some(frame) => match frame.to_wire() {
                    Ok(text) => text,
                    Err(e) => {
                        error!("failed to encode request: {}", e);
                        return;
                    }
                },
                // Payload not ready yet; same front retried next tick.
                None => return,
            }
        };

        if self.connection.send_text(&text) {
            let queue = &mut self.queues[idx];
            if let Some(front) = queue.front_mut() {
                front.mark_sent(now);
            }
            debug!(queue = queue.name(), "request sent");
        }
    }

    /// Step 5: decode and route one inbound frame.
    fn tick_receive(&mut self) {
        let Some(text) = self.connection.poll_incoming() else {
            return;
        };

        match OcppFrame::parse(&text, self.config.max_frame_size) {
            Ok(OcppFrame::Call(call)) => {
                debug!(action = %call.action, message_id = %call.message_id, "CALL received");
                let operation = self.registry.make_inbound(&call);
                self.inbound.push(Request::inbound(operation, call.message_id));
            }
            Ok(frame) => self.route_response(frame),
            Err(RpcError::FrameTooLarge { size, max }) => {
                warn!(size, max, "inbound frame over capacity, attempting header recovery");
                match OcppFrame::recover_header(&text) {
                    Some(OcppFrame::Call(call)) => {
                        let reply = CallErrorFrame::new(
                            call.message_id,
                            ErrorCode::FormatViolation,
                            "message too large",
                        );
                        self.transmit(&OcppFrame::CallError(reply));
                    }
                    // A response too large to parse cannot be answered; the
                    // peer's own retry/timeout takes over.
                    _ => warn!("dropping unrecoverable oversized frame"),
                }
            }
            Err(e) => warn!("ignoring malformed frame: {}", e),
        }
    }

    /// Match a CALLRESULT/CALLERROR against the sent front. Mismatched ids
    /// and late duplicates are logged and otherwise inert.
    fn route_response(&mut self, frame: OcppFrame) {
        for queue in &mut self.queues {
            let Some(front) = queue.front_mut() else {
                continue;
            };
            if !front.is_sent() {
                continue;
            }
            if front.receive_response(&frame) {
                if front.is_concluded() {
                    if let Some(request) = queue.pop_front() {
                        queue.note_front_concluded(&request);
                    }
                }
                return;
            }
        }
        debug!(
            message_id = frame.message_id(),
            "response matches no in-flight request, ignoring"
        );
    }

    fn transmit(&mut self, frame: &OcppFrame) -> bool {
        match frame.to_wire() {
            Ok(text) => self.connection.send_text(&text),
            Err(e) => {
                // Unserializable Value payloads do not occur in practice;
                // drop rather than wedge the queue front.
                error!("failed to encode frame: {}", e);
                true
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::LoopbackConnection;
    use crate::error::OperationError;
    use crate::operation::{Operation, RequestPayload};
    use crate::queue::VolatileQueue;
    use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    struct Ping;

    impl Operation for Ping {
        fn operation_type(&self) -> &str {
            "Heartbeat"
        }
    }

    fn engine_with_queue(names: &[&str]) -> Engine<LoopbackConnection> {
        let mut engine = Engine::new(LoopbackConnection::new(), OperationRegistry::new());
        for name in names {
            engine.add_queue(VolatileQueue::new(*name));
        }
        engine
    }

    fn sent_frames(engine: &Engine<LoopbackConnection>) -> &[String] {
        &engine.connection().sent
    }

    #[test]
    fn test_single_flight_per_queue() {
        let mut engine = engine_with_queue(&["default"]);
        engine.enqueue("default", Request::new(Box::new(Ping)));
        engine.enqueue("default", Request::new(Box::new(Ping)));

        engine.tick();
        assert_eq!(sent_frames(&engine).len(), 1);

        // Head-of-line blocking: nothing else leaves until a response lands.
        engine.tick();
        engine.tick();
        assert_eq!(sent_frames(&engine).len(), 1);

        let sent = OcppFrame::parse(&sent_frames(&engine)[0], usize::MAX).unwrap();
        let reply = format!(r#"[3,"{}",{{}}]"#, sent.message_id());
        engine.connection_mut().push_incoming(reply);
        engine.tick(); // consumes the response
        engine.tick(); // second request may now go out
        assert_eq!(sent_frames(&engine).len(), 2);
    }

    #[test]
    fn test_cross_queue_lowest_op_nr_first() {
        let mut engine = engine_with_queue(&["a", "b"]);

        // Interleaved enqueue: a:1, b:2, a:3
        engine.enqueue("a", Request::new(Box::new(Ping)));
        engine.enqueue("b", Request::new(Box::new(Ping)));
        engine.enqueue("a", Request::new(Box::new(Ping)));

        let mut order = Vec::new();
        for _ in 0..3 {
            engine.tick();
            let sent = sent_frames(&engine).last().unwrap().clone();
            let frame = OcppFrame::parse(&sent, usize::MAX).unwrap();
            order.push(frame.message_id().to_string());
            let reply = format!(r#"[3,"{}",{{}}]"#, frame.message_id());
            engine.connection_mut().push_incoming(reply);
            engine.tick();
        }

        // Total order across queues follows op_nr, i.e. enqueue order.
        assert_eq!(order.len(), 3);
        let ids: Vec<u64> = order.iter().map(|s| s.parse().unwrap()).collect();
        assert!(ids[0] < ids[1] && ids[1] < ids[2]);
    }

    #[test]
    fn test_cross_queue_front_op_nr_selection() {
        // Queue fronts manufactured directly: a holds op_nr 5, b holds 3.
        let mut a = VolatileQueue::new("a");
        let mut req_a = Request::new(Box::new(Ping));
        req_a.set_op_nr(5);
        a.push(req_a);

        let mut b = VolatileQueue::new("b");
        let mut req_b = Request::new(Box::new(Ping));
        req_b.set_op_nr(3);
        b.push(req_b);

        let mut engine = Engine::new(LoopbackConnection::new(), OperationRegistry::new());
        engine.add_queue(a);
        engine.add_queue(b);

        engine.tick();
        assert_eq!(sent_frames(&engine).len(), 1);
        assert_eq!(engine.queue_len("b"), 1); // b's front is the one in flight
        assert_eq!(engine.queue_len("a"), 1);
        // and it is queue b that owns the sent request
        let sent = OcppFrame::parse(&sent_frames(&engine)[0], usize::MAX).unwrap();
        let reply = format!(r#"[3,"{}",{{}}]"#, sent.message_id());
        engine.connection_mut().push_incoming(reply);
        engine.tick();
        assert_eq!(engine.queue_len("b"), 0);
        assert_eq!(engine.queue_len("a"), 1);
    }

    #[test]
    fn test_gated_queue_does_not_send() {
        let mut engine = Engine::new(LoopbackConnection::new(), OperationRegistry::new());
        engine.add_queue(VolatileQueue::gated("preboot-gated"));
        engine.enqueue("preboot-gated", Request::new(Box::new(Ping)));

        engine.tick();
        assert!(sent_frames(&engine).is_empty());

        engine.set_queue_active("preboot-gated", true);
        engine.tick();
        assert_eq!(sent_frames(&engine).len(), 1);
    }

    #[test]
    fn test_mismatched_response_is_noop() {
        let confirmed = Arc::new(AtomicU32::new(0));
        let c = confirmed.clone();

        let mut engine = engine_with_queue(&["default"]);
        engine.enqueue(
            "default",
            Request::new(Box::new(Ping)).on_confirmation(move |_| {
                c.fetch_add(1, Ordering::SeqCst);
            }),
        );

        engine.tick();
        engine.connection_mut().push_incoming(r#"[3,"wrong-id",{}]"#);
        engine.tick();

        assert_eq!(confirmed.load(Ordering::SeqCst), 0);
        assert_eq!(engine.queue_len("default"), 1); // still awaiting its reply
    }

    #[test]
    fn test_late_duplicate_response_is_noop() {
        let mut engine = engine_with_queue(&["default"]);
        engine.enqueue("default", Request::new(Box::new(Ping)));

        engine.tick();
        let sent = OcppFrame::parse(&sent_frames(&engine)[0], usize::MAX).unwrap();
        let reply = format!(r#"[3,"{}",{{}}]"#, sent.message_id());

        engine.connection_mut().push_incoming(reply.clone());
        engine.tick();
        assert_eq!(engine.queue_len("default"), 0);

        // The same response delivered again matches nothing and changes
        // nothing.
        engine.connection_mut().push_incoming(reply);
        engine.tick();
        assert_eq!(engine.queue_len("default"), 0);
        assert_eq!(sent_frames(&engine).len(), 1);
    }

    #[test]
    fn test_timeout_pops_front_and_continues_offline() {
        let fired = Arc::new(AtomicU32::new(0));
        let f = fired.clone();

        let mut engine = engine_with_queue(&["default"]);
        engine.enqueue(
            "default",
            Request::new(Box::new(Ping))
                .with_timeout(Duration::from_millis(5000))
                .on_timeout(move || {
                    f.fetch_add(1, Ordering::SeqCst);
                }),
        );

        // Offline: no sends, but bookkeeping advances.
        engine.connection_mut().connected = false;
        let start = Instant::now();
        engine.tick_at(start);
        assert!(sent_frames(&engine).is_empty());

        engine.tick_at(start + Duration::from_millis(5001));
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        assert_eq!(engine.queue_len("default"), 0);

        // Extra ticks re-fire nothing.
        engine.tick_at(start + Duration::from_millis(6000));
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_not_ready_operation_holds_the_front() {
        struct GatedOp {
            ready: Arc<AtomicBool>,
        }
        impl Operation for GatedOp {
            fn operation_type(&self) -> &str {
                "MeterValues"
            }
            fn create_request_payload(&mut self) -> RequestPayload {
                if self.ready.load(Ordering::SeqCst) {
                    RequestPayload::Ready(serde_json::json!({}))
                } else {
                    RequestPayload::NotReady
                }
            }
        }

        let ready = Arc::new(AtomicBool::new(false));
        let mut engine = engine_with_queue(&["default"]);
        engine.enqueue(
            "default",
            Request::new(Box::new(GatedOp { ready: ready.clone() })),
        );
        engine.enqueue("default", Request::new(Box::new(Ping)));

        engine.tick();
        engine.tick();
        // Front not ready: nothing sent, and the ready request behind it
        // must not jump the line.
        assert!(sent_frames(&engine).is_empty());

        ready.store(true, Ordering::SeqCst);
        engine.tick();
        assert_eq!(sent_frames(&engine).len(), 1);
        let frame = OcppFrame::parse(&sent_frames(&engine)[0], usize::MAX).unwrap();
        match frame {
            OcppFrame::Call(call) => assert_eq!(call.action, "MeterValues"),
            _ => panic!("Expected Call"),
        }
    }

    #[test]
    fn test_inbound_call_gets_response() {
        struct Accepting;
        impl Operation for Accepting {
            fn operation_type(&self) -> &str {
                "Reset"
            }
            fn create_response_payload(&mut self) -> ResponsePayload {
                ResponsePayload::Ready(serde_json::json!({"status": "Accepted"}))
            }
        }

        let mut registry = OperationRegistry::new();
        registry.register("Reset", || Box::new(Accepting));

        let mut engine = Engine::new(LoopbackConnection::new(), registry);
        engine.connection_mut().push_incoming(r#"[2,"r-1","Reset",{"type":"Soft"}]"#);

        engine.tick(); // decode, enqueue inbound
        engine.tick(); // respond
        let frames = sent_frames(&engine);
        assert_eq!(frames.len(), 1);
        let frame = OcppFrame::parse(&frames[0], usize::MAX).unwrap();
        match frame {
            OcppFrame::CallResult(result) => {
                assert_eq!(result.message_id, "r-1");
                assert_eq!(result.payload["status"], "Accepted");
            }
            _ => panic!("Expected CallResult"),
        }
    }

    #[test]
    fn test_pending_response_preserves_order() {
        struct Slow {
            polls: Arc<AtomicU32>,
        }
        impl Operation for Slow {
            fn operation_type(&self) -> &str {
                "Slow"
            }
            fn create_response_payload(&mut self) -> ResponsePayload {
                if self.polls.fetch_add(1, Ordering::SeqCst) < 2 {
                    ResponsePayload::Pending
                } else {
                    ResponsePayload::Ready(serde_json::json!({"slow": true}))
                }
            }
        }
        struct Fast;
        impl Operation for Fast {
            fn operation_type(&self) -> &str {
                "Fast"
            }
            fn create_response_payload(&mut self) -> ResponsePayload {
                ResponsePayload::Ready(serde_json::json!({"fast": true}))
            }
        }

        let polls = Arc::new(AtomicU32::new(0));
        let p = polls.clone();
        let mut registry = OperationRegistry::new();
        registry.register("Slow", move || Box::new(Slow { polls: p.clone() }));
        registry.register("Fast", || Box::new(Fast));

        let mut engine = Engine::new(LoopbackConnection::new(), registry);
        engine.connection_mut().push_incoming(r#"[2,"s-1","Slow",{}]"#);
        engine.connection_mut().push_incoming(r#"[2,"f-1","Fast",{}]"#);

        for _ in 0..6 {
            engine.tick();
        }

        let frames = sent_frames(&engine);
        assert_eq!(frames.len(), 2);
        // The pending front never lets the fast response overtake it.
        assert!(frames[0].contains("s-1"));
        assert!(frames[1].contains("f-1"));
    }

    #[test]
    fn test_unknown_action_answers_not_implemented() {
        let mut engine = Engine::new(LoopbackConnection::new(), OperationRegistry::new());
        engine.connection_mut().push_incoming(r#"[2,"u-1","Mystery",{}]"#);

        engine.tick();
        engine.tick();

        let frames = sent_frames(&engine);
        assert_eq!(frames.len(), 1);
        let frame = OcppFrame::parse(&frames[0], usize::MAX).unwrap();
        match frame {
            OcppFrame::CallError(err) => {
                assert_eq!(err.message_id, "u-1");
                assert_eq!(err.error_code, "NotImplemented");
            }
            _ => panic!("Expected CallError"),
        }
    }

    #[test]
    fn test_oversized_call_answered_with_call_error() {
        let mut engine = Engine::with_config(
            LoopbackConnection::new(),
            OperationRegistry::new(),
            EngineConfig { max_frame_size: 64 },
        );

        let huge = "x".repeat(256);
        let text = format!(r#"[2,"id1","Foo",{{"huge":"{}""#, huge);
        engine.connection_mut().push_incoming(text);

        engine.tick();

        let frames = sent_frames(&engine);
        assert_eq!(frames.len(), 1);
        let frame = OcppFrame::parse(&frames[0], usize::MAX).unwrap();
        match frame {
            OcppFrame::CallError(err) => {
                assert_eq!(err.message_id, "id1");
                assert!(err.error_description.contains("too large"));
            }
            _ => panic!("Expected CallError"),
        }
    }

    #[test]
    fn test_oversized_result_is_dropped() {
        let mut engine = Engine::with_config(
            LoopbackConnection::new(),
            OperationRegistry::new(),
            EngineConfig { max_frame_size: 64 },
        );

        let huge = "x".repeat(256);
        let text = format!(r#"[3,"id2",{{"blob":"{}""#, huge);
        engine.connection_mut().push_incoming(text);

        engine.tick();
        assert!(sent_frames(&engine).is_empty());
    }

    #[test]
    fn test_failed_response_becomes_call_error() {
        struct Rejecting;
        impl Operation for Rejecting {
            fn operation_type(&self) -> &str {
                "Reset"
            }
            fn create_response_payload(&mut self) -> ResponsePayload {
                ResponsePayload::Failed(OperationError::new(
                    ErrorCode::InternalError,
                    "resetting is not possible right now",
                ))
            }
        }

        let mut registry = OperationRegistry::new();
        registry.register("Reset", || Box::new(Rejecting));

        let mut engine = Engine::new(LoopbackConnection::new(), registry);
        engine.connection_mut().push_incoming(r#"[2,"r-9","Reset",{}]"#);
        engine.tick();
        engine.tick();

        let frame = OcppFrame::parse(&sent_frames(&engine)[0], usize::MAX).unwrap();
        match frame {
            OcppFrame::CallError(err) => {
                assert_eq!(err.message_id, "r-9");
                assert_eq!(err.error_code, "InternalError");
            }
            _ => panic!("Expected CallError"),
        }
    }

    #[test]
    fn test_malformed_non_call_ignored() {
        let mut engine = engine_with_queue(&["default"]);
        engine.connection_mut().push_incoming("this is not json");
        engine.connection_mut().push_incoming(r#"[9,"x",{}]"#);
        engine.tick();
        engine.tick();
        assert!(sent_frames(&engine).is_empty());
        assert_eq!(engine.inbound_len(), 0);
    }
}

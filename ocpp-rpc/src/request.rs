//! Request lifecycle
//!
//! A [`Request`] wraps one [`Operation`] with the protocol bookkeeping the
//! engine needs: message id, timeout, retry attempts and the lifecycle
//! callbacks. Lifecycle:
//!
//! ```text
//! Created → Sent → { Confirmed | Errored(abort) | TimedOut } → Destroyed
//! ```
//!
//! `on_abort` fires exactly once on any non-Confirmed exit, including queue
//! teardown (it runs from `Drop` if no terminal event claimed it earlier).

use std::time::{Duration, Instant};

use serde_json::Value;
use tracing::{debug, warn};

use crate::frame::{CallFrame, OcppFrame};
use crate::operation::{Operation, RequestPayload};

/// Default timeout for outbound requests.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// Default number of send attempts before a request is left to time out.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 1;

/// Monotonic message-id source with a restorable baseline.
///
/// Ids are decimal strings from a counter owned by the engine context.
/// Restoring persisted operations feeds their stored ids back through
/// [`observe`] so a rebooted station never reuses an id.
///
/// [`observe`]: MessageIdSource::observe
#[derive(Debug)]
pub struct MessageIdSource {
    next: u64,
}

impl MessageIdSource {
    pub fn new() -> Self {
        Self { next: 1 }
    }

    /// Produce the next unique message id.
    pub fn next_id(&mut self) -> String {
        let id = self.next;
        self.next += 1;
        id.to_string()
    }

    /// Raise the counter baseline above an already-used id. Never goes
    /// backward.
    pub fn observe(&mut self, message_id: &str) {
        if let Ok(n) = message_id.parse::<u64>() {
            if n >= self.next {
                self.next = n + 1;
            }
        }
    }
}

impl Default for MessageIdSource {
    fn default() -> Self {
        Self::new()
    }
}

type ConfirmationCallback = Box<dyn FnOnce(&Value) + Send>;
type ErrorCallback = Box<dyn FnOnce(&str, &str, &Value) + Send>;
type VoidCallback = Box<dyn FnOnce() + Send>;

/// Outcome of one tick of timeout/retry bookkeeping on a queue front.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickOutcome {
    /// Nothing to do; request stays where it is.
    Keep,
    /// The current attempt went unanswered; the request may be re-sent.
    Resend,
    /// The request timed out; pop it and destroy it.
    TimedOut,
}

/// One outbound (or inbound) protocol operation with its bookkeeping.
pub struct Request {
    operation: Box<dyn Operation>,
    message_id: Option<String>,
    op_nr: u64,

    timeout: Duration,
    timeout_start: Option<Instant>,

    sent: bool,
    confirmed: bool,
    timed_out: bool,

    attempt_nr: u32,
    max_attempts: u32,
    retry_interval: Duration,
    last_attempt: Option<Instant>,

    on_confirmation: Option<ConfirmationCallback>,
    on_error: Option<ErrorCallback>,
    on_abort: Option<VoidCallback>,
    on_timeout: Option<VoidCallback>,
    on_send: Option<VoidCallback>,

    abort_fired: bool,
    timeout_fired: bool,
}

impl Request {
    pub fn new(operation: Box<dyn Operation>) -> Self {
        Self {
            operation,
            message_id: None,
            op_nr: 0,
            timeout: DEFAULT_TIMEOUT,
            timeout_start: None,
            sent: false,
            confirmed: false,
            timed_out: false,
            attempt_nr: 0,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            retry_interval: Duration::from_secs(1),
            last_attempt: None,
            on_confirmation: None,
            on_error: None,
            on_abort: None,
            on_timeout: None,
            on_send: None,
            abort_fired: false,
            timeout_fired: false,
        }
    }

    /// Build a request for the inbound direction with the id the peer chose.
    pub fn inbound(operation: Box<dyn Operation>, message_id: impl Into<String>) -> Self {
        let mut req = Self::new(operation);
        req.message_id = Some(message_id.into());
        req
    }

    /// Rebuild a request from a persisted record: it keeps its original
    /// message id and `op_nr`, never times out, and retries until answered.
    pub fn restored(
        operation: Box<dyn Operation>,
        message_id: impl Into<String>,
        op_nr: u64,
        retry_interval: Duration,
    ) -> Self {
        let mut req = Self::new(operation)
            .with_timeout(Duration::ZERO)
            .with_retries(u32::MAX, retry_interval);
        req.message_id = Some(message_id.into());
        req.op_nr = op_nr;
        req
    }

    /// Set the total timeout. `Duration::ZERO` disables the timeout.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Allow up to `max_attempts` sends, spaced by a linear backoff of
    /// `retry_interval × attempt_nr`.
    pub fn with_retries(mut self, max_attempts: u32, retry_interval: Duration) -> Self {
        self.max_attempts = max_attempts.max(1);
        self.retry_interval = retry_interval;
        self
    }

    pub fn on_confirmation(mut self, f: impl FnOnce(&Value) + Send + 'static) -> Self {
        self.on_confirmation = Some(Box::new(f));
        self
    }

    pub fn on_error(mut self, f: impl FnOnce(&str, &str, &Value) + Send + 'static) -> Self {
        self.on_error = Some(Box::new(f));
        self
    }

    pub fn on_abort(mut self, f: impl FnOnce() + Send + 'static) -> Self {
        self.on_abort = Some(Box::new(f));
        self
    }

    pub fn on_timeout(mut self, f: impl FnOnce() + Send + 'static) -> Self {
        self.on_timeout = Some(Box::new(f));
        self
    }

    pub fn on_send(mut self, f: impl FnOnce() + Send + 'static) -> Self {
        self.on_send = Some(Box::new(f));
        self
    }

    pub fn operation(&self) -> &dyn Operation {
        self.operation.as_ref()
    }

    pub fn operation_mut(&mut self) -> &mut dyn Operation {
        self.operation.as_mut()
    }

    pub fn operation_type(&self) -> &str {
        self.operation.operation_type()
    }

    /// The message id, if one has been assigned yet.
    pub fn message_id(&self) -> Option<&str> {
        self.message_id.as_deref()
    }

    /// Lazily assign the message id, exactly once.
    pub fn ensure_message_id(&mut self, ids: &mut MessageIdSource) -> &str {
        if self.message_id.is_none() {
            self.message_id = Some(ids.next_id());
        }
        self.message_id.as_deref().unwrap_or_default()
    }

    pub fn op_nr(&self) -> u64 {
        self.op_nr
    }

    pub fn set_op_nr(&mut self, op_nr: u64) {
        self.op_nr = op_nr;
    }

    pub fn is_sent(&self) -> bool {
        self.sent
    }

    pub fn is_confirmed(&self) -> bool {
        self.confirmed
    }

    pub fn is_timed_out(&self) -> bool {
        self.timed_out
    }

    /// A concluded request has reached a terminal state and can be popped.
    pub fn is_concluded(&self) -> bool {
        self.confirmed || self.timed_out || self.abort_fired
    }

    /// Whether a (re-)send attempt is allowed right now. Applies the linear
    /// retry backoff and the attempt bound.
    pub fn can_attempt(&self, now: Instant) -> bool {
        if self.sent || self.is_concluded() || self.attempt_nr >= self.max_attempts {
            return false;
        }
        match self.last_attempt {
            None => true,
            Some(last) => now.duration_since(last) >= self.backoff(),
        }
    }

    /// Linear backoff, capped so long-lived retry loops stay bounded.
    fn backoff(&self) -> Duration {
        self.retry_interval * self.attempt_nr.min(10)
    }

    /// Ask the operation for the CALL frame to send. `None` means the
    /// payload is not ready yet; the engine retries next tick.
    pub fn create_request(&mut self, ids: &mut MessageIdSource) -> Option<OcppFrame> {
        match self.operation.create_request_payload() {
            RequestPayload::NotReady => None,
            RequestPayload::Ready(payload) => {
                self.ensure_message_id(ids);
                Some(OcppFrame::Call(CallFrame {
                    message_id: self.message_id.clone().unwrap_or_default(),
                    action: self.operation.operation_type().to_string(),
                    payload,
                }))
            }
        }
    }

    /// Mark a successful transmission of the CALL frame.
    pub fn mark_sent(&mut self, now: Instant) {
        self.sent = true;
        self.attempt_nr += 1;
        self.last_attempt = Some(now);
        self.timeout_start.get_or_insert(now);
        if let Some(f) = self.on_send.take() {
            f();
        }
    }

    /// Feed a response frame to this request.
    ///
    /// Returns `false` without mutating any state when the message id does
    /// not match; a mismatched or late-duplicate response is inert.
    pub fn receive_response(&mut self, frame: &OcppFrame) -> bool {
        let Some(my_id) = self.message_id.as_deref() else {
            return false;
        };
        if frame.message_id() != my_id {
            debug!(
                expected = my_id,
                got = frame.message_id(),
                "response id mismatch, ignoring"
            );
            return false;
        }

        match frame {
            OcppFrame::CallResult(result) => {
                self.operation.process_confirmation(&result.payload);
                self.confirmed = true;
                if let Some(f) = self.on_confirmation.take() {
                    f(&result.payload);
                }
                // Successful close permanently suppresses on_abort.
                self.on_abort = None;
                true
            }
            OcppFrame::CallError(err) => {
                let abortive = self.operation.process_error(
                    &err.error_code,
                    &err.error_description,
                    &err.error_details,
                );
                if abortive {
                    warn!(
                        action = self.operation.operation_type(),
                        code = %err.error_code,
                        "request aborted by CALLERROR"
                    );
                    if let Some(f) = self.on_error.take() {
                        f(&err.error_code, &err.error_description, &err.error_details);
                    }
                    self.execute_abort();
                } else {
                    debug!(
                        action = self.operation.operation_type(),
                        code = %err.error_code,
                        "non-fatal CALLERROR, will retry"
                    );
                    self.sent = false;
                }
                true
            }
            OcppFrame::Call(_) => false,
        }
    }

    /// One pass of timeout/retry bookkeeping; called by the engine for queue
    /// fronts on every tick, connected or not.
    pub fn advance(&mut self, now: Instant) -> TickOutcome {
        // Timeout clock starts the first time this request reaches a front.
        self.timeout_start.get_or_insert(now);

        if self.is_timeout_exceeded(now) {
            return TickOutcome::TimedOut;
        }

        if self.sent {
            // An unanswered attempt frees the line again once the retry
            // backoff elapses, as long as attempts remain.
            if self.attempt_nr < self.max_attempts {
                if let Some(last) = self.last_attempt {
                    if now.duration_since(last) >= self.backoff() {
                        self.sent = false;
                        return TickOutcome::Resend;
                    }
                }
            }
        }

        TickOutcome::Keep
    }

    /// Compare elapsed time against the timeout period. Zero disables.
    pub fn is_timeout_exceeded(&self, now: Instant) -> bool {
        if self.timeout.is_zero() {
            return false;
        }
        match self.timeout_start {
            Some(start) => now.duration_since(start) > self.timeout,
            None => false,
        }
    }

    /// Enter the TimedOut terminal state. `on_timeout` and `on_abort` each
    /// fire at most once no matter how often this is re-checked.
    pub fn execute_timeout(&mut self) {
        if !self.timeout_fired {
            self.timeout_fired = true;
            self.timed_out = true;
            warn!(
                action = self.operation.operation_type(),
                message_id = self.message_id.as_deref().unwrap_or("-"),
                "request timed out"
            );
            if let Some(f) = self.on_timeout.take() {
                f();
            }
        }
        self.execute_abort();
    }

    fn execute_abort(&mut self) {
        if self.confirmed || self.abort_fired {
            return;
        }
        self.abort_fired = true;
        if let Some(f) = self.on_abort.take() {
            f();
        }
    }
}

impl Drop for Request {
    fn drop(&mut self) {
        // Teardown counts as a non-Confirmed exit.
        self.execute_abort();
    }
}

impl std::fmt::Debug for Request {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Request")
            .field("action", &self.operation.operation_type())
            .field("message_id", &self.message_id)
            .field("op_nr", &self.op_nr)
            .field("sent", &self.sent)
            .field("confirmed", &self.confirmed)
            .field("timed_out", &self.timed_out)
            .field("attempt_nr", &self.attempt_nr)
            .finish()
    }
}

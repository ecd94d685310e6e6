//! Message receivers and the sending surface bound to them.
//!
//! A handler is a trait object registered with a loop; the loop resolves
//! the routing token at dispatch and invokes `handle_message` on its own
//! thread. The `HandlerRef` returned by registration is the producer-side
//! surface: it creates messages addressed to the handler and translates
//! sends and scans into queue operations.

use crate::looper::Looper;
use crate::message::{HandlerId, Message};
use crate::time::{self, MicroInstant};
use std::any::Any;
use std::sync::{Arc, Weak};

/// User-extensible message receiver.
///
/// `handle_message` is invoked on the loop thread for every message routed
/// to the handler. Panics are caught at the dispatch boundary and logged;
/// they never stop the loop.
pub trait Handler: Send + Sync {
    /// Process one message.
    fn handle_message(&self, msg: Message);
}

/// Sending surface for a registered [`Handler`].
///
/// Cloneable and thread-safe; holds only the routing id and a weak loop
/// reference, so it never keeps the handler or the loop alive. Once the
/// loop is gone every send returns `false`.
#[derive(Clone)]
pub struct HandlerRef {
    id: HandlerId,
    looper: Weak<Looper>,
}

impl HandlerRef {
    pub(crate) fn new(id: HandlerId, looper: Weak<Looper>) -> Self {
        Self { id, looper }
    }

    /// The routing id of the underlying handler.
    pub fn id(&self) -> HandlerId {
        self.id
    }

    /// The owning loop, if still alive.
    pub fn looper(&self) -> Option<Arc<Looper>> {
        self.looper.upgrade()
    }

    // ========================================================================
    // Message factories
    // ========================================================================

    /// New message routed to this handler.
    pub fn obtain_message(&self, what: i32) -> Message {
        Message::with_target(self.id, what)
    }

    /// New message with the three scalar arguments filled in.
    pub fn obtain_message_args(&self, what: i32, arg1: i32, arg2: i32, arg3: i32) -> Message {
        let mut msg = self.obtain_message(what);
        msg.arg1 = arg1;
        msg.arg2 = arg2;
        msg.arg3 = arg3;
        msg
    }

    /// New message with the opaque correlation token set.
    pub fn obtain_message_token(&self, what: i32, token: u64) -> Message {
        let mut msg = self.obtain_message(what);
        msg.token = token;
        msg
    }

    /// New message carrying a shared payload object.
    pub fn obtain_message_payload(
        &self,
        what: i32,
        payload: Arc<dyn Any + Send + Sync>,
    ) -> Message {
        let mut msg = self.obtain_message(what);
        msg.payload = Some(payload);
        msg
    }

    // ========================================================================
    // Sending
    // ========================================================================

    /// Enqueue for immediate processing.
    pub fn send_message(&self, msg: Message) -> bool {
        self.send_message_at_time(msg, time::uptime_micros())
    }

    /// Enqueue to run after `delay_ms` milliseconds.
    pub fn send_message_delayed(&self, msg: Message, delay_ms: u64) -> bool {
        self.send_message_at_time(msg, time::when_after_ms(delay_ms))
    }

    /// Enqueue to run at the absolute time `when_us`.
    pub fn send_message_at_time(&self, mut msg: Message, when_us: MicroInstant) -> bool {
        msg.target = self.id;
        match self.looper.upgrade() {
            Some(looper) => looper.event_queue().enqueue_message(msg, when_us),
            None => false,
        }
    }

    // ========================================================================
    // Queue scans
    // ========================================================================

    /// Whether a message with this `what` is queued for the handler.
    pub fn has_messages(&self, what: i32) -> bool {
        self.looper
            .upgrade()
            .map(|looper| looper.event_queue().has_message(self.id, what, None))
            .unwrap_or(false)
    }

    /// As [`has_messages`](Self::has_messages), also matching the opaque
    /// token.
    pub fn has_messages_token(&self, what: i32, token: u64) -> bool {
        self.looper
            .upgrade()
            .map(|looper| looper.event_queue().has_message(self.id, what, Some(token)))
            .unwrap_or(false)
    }

    /// Remove every queued message with this `what`. Returns `true` if
    /// anything was removed.
    pub fn remove_messages(&self, what: i32) -> bool {
        self.looper
            .upgrade()
            .map(|looper| looper.event_queue().remove_messages(self.id, what, None))
            .unwrap_or(false)
    }

    /// As [`remove_messages`](Self::remove_messages), also matching the
    /// opaque token.
    pub fn remove_messages_token(&self, what: i32, token: u64) -> bool {
        self.looper
            .upgrade()
            .map(|looper| {
                looper
                    .event_queue()
                    .remove_messages(self.id, what, Some(token))
            })
            .unwrap_or(false)
    }
}

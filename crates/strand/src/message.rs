//! Addressed work items routed to handlers on the loop thread.
//!
//! A message is plain owned data: the queue owns ordering and the looper
//! resolves the routing token, so messages carry no back-pointers into the
//! runtime.

use crate::time::MicroInstant;
use std::any::Any;
use std::fmt;
use std::sync::Arc;

/// Routing token identifying a registered [`Handler`](crate::Handler).
///
/// Ids are drawn from a per-looper counter starting at 1; `0` means the
/// message is not routed to any handler.
pub type HandlerId = u64;

/// A unit of work addressed to a handler.
///
/// `what` discriminates the message for the receiving handler; the three
/// scalar arguments and the opaque `token` carry small payloads without
/// allocation, and `payload` carries a shared object for anything larger.
#[derive(Clone)]
pub struct Message {
    pub(crate) target: HandlerId,
    pub(crate) when: MicroInstant,

    /// Message type code.
    pub what: i32,
    /// First scalar argument.
    pub arg1: i32,
    /// Second scalar argument.
    pub arg2: i32,
    /// Third scalar argument.
    pub arg3: i32,
    /// Opaque correlation scalar, matched by `has_messages` / `remove_messages`.
    pub token: u64,
    /// Shared payload object.
    pub payload: Option<Arc<dyn Any + Send + Sync>>,
}

impl Message {
    /// Create an unrouted message with the given type code.
    ///
    /// Messages bound for a handler are normally created through the
    /// [`HandlerRef::obtain_message`](crate::HandlerRef::obtain_message)
    /// factories, which attach the routing target.
    pub fn new(what: i32) -> Self {
        Self {
            target: 0,
            when: 0,
            what,
            arg1: 0,
            arg2: 0,
            arg3: 0,
            token: 0,
            payload: None,
        }
    }

    pub(crate) fn with_target(target: HandlerId, what: i32) -> Self {
        let mut msg = Self::new(what);
        msg.target = target;
        msg
    }

    /// The handler this message is routed to (0 if unrouted).
    pub fn target(&self) -> HandlerId {
        self.target
    }

    /// Scheduled execution time, stamped when the message is enqueued.
    pub fn when(&self) -> MicroInstant {
        self.when
    }

    /// Downcast the payload to a concrete type.
    pub fn payload_as<T: Any + Send + Sync>(&self) -> Option<Arc<T>> {
        self.payload.clone().and_then(|p| p.downcast::<T>().ok())
    }
}

impl fmt::Debug for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Message")
            .field("target", &self.target)
            .field("what", &self.what)
            .field("arg1", &self.arg1)
            .field("arg2", &self.arg2)
            .field("arg3", &self.arg3)
            .field("token", &self.token)
            .field("has_payload", &self.payload.is_some())
            .field("when", &self.when)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_message_is_unrouted() {
        let msg = Message::new(3);
        assert_eq!(msg.target(), 0);
        assert_eq!(msg.what, 3);
        assert_eq!(msg.when(), 0);
        assert!(msg.payload.is_none());
    }

    #[test]
    fn test_payload_downcast() {
        let mut msg = Message::new(1);
        msg.payload = Some(Arc::new(String::from("hello")));

        let s = msg.payload_as::<String>().expect("payload type");
        assert_eq!(*s, "hello");
        assert!(msg.payload_as::<i32>().is_none());
    }

    #[test]
    fn test_clone_shares_payload() {
        let mut msg = Message::new(1);
        msg.payload = Some(Arc::new(42i32));
        let copy = msg.clone();
        assert!(Arc::ptr_eq(
            &msg.payload_as::<i32>().unwrap(),
            &copy.payload_as::<i32>().unwrap()
        ));
    }
}

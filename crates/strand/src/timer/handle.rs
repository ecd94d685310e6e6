//! RAII handle to a live kernel timer.

use crate::looper::Looper;
use crate::timer::TimerId;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

/// Move-only owner of a live timer.
///
/// Dropping the handle cancels the timer; moving it transfers the cancel
/// obligation. The handle and the hub's record share one atomic cancelled
/// flag, so a move needs no bookkeeping and cancellation is a double
/// fence: the flag suppresses an in-flight expiration while the record
/// teardown disarms the kernel timer. Either alone is sufficient.
pub struct TimerHandle {
    id: TimerId,
    looper: Weak<Looper>,
    cancelled: Arc<AtomicBool>,
}

impl TimerHandle {
    pub(crate) fn new(id: TimerId, looper: Weak<Looper>, cancelled: Arc<AtomicBool>) -> Self {
        Self {
            id,
            looper,
            cancelled,
        }
    }

    /// The timer's unique id (`0` if creation failed).
    pub fn id(&self) -> TimerId {
        self.id
    }

    /// Cancel the timer. Idempotent; safe to call after expiry.
    pub fn cancel(&self) {
        if self.cancelled.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Some(looper) = self.looper.upgrade() {
            looper.cancel_timer_internal(self.id);
        }
    }

    /// Whether the timer is armed: not cancelled and still known to the
    /// hub of a live loop.
    pub fn is_active(&self) -> bool {
        if self.cancelled.load(Ordering::Acquire) {
            return false;
        }
        self.looper
            .upgrade()
            .map(|looper| looper.has_timer_internal(self.id))
            .unwrap_or(false)
    }

    /// Re-arm with a new one-shot delay, clearing the cancelled flag.
    ///
    /// A periodic timer becomes one-shot. Returns `false` if the timer is
    /// unknown or the kernel rejected the rearm (the record keeps its
    /// prior state).
    pub fn restart(&self, delay_ms: u64) -> bool {
        self.looper
            .upgrade()
            .map(|looper| looper.restart_timer_internal(self.id, delay_ms))
            .unwrap_or(false)
    }
}

impl Drop for TimerHandle {
    fn drop(&mut self) {
        if !self.cancelled.load(Ordering::Acquire) {
            self.cancel();
        }
    }
}

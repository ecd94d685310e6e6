//! Unified time-ordered event queue.
//!
//! One min-heap holds both messages and callables, keyed by
//! `(when, insertion sequence)` so items due at the same instant dispatch
//! in the order they were enqueued. Producers on any thread insert and wake
//! the single consumer; the consumer blocks until the earliest item is due
//! or the queue is quit.

use crate::error::{panic_message, TaskError};
use crate::future::{TaskFuture, TaskSettler};
use crate::message::{HandlerId, Message};
use crate::time::{self, MicroInstant};
use parking_lot::{Condvar, Mutex};
use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::time::Duration;

/// One-shot, move-only unit of work executed on the loop thread.
pub type Thunk = Box<dyn FnOnce() + Send>;

/// An item pulled off the queue, ready for dispatch.
pub enum QueueItem {
    /// Routed message for a handler.
    Message(Message),
    /// Direct callable; ownership transfers to the dispatcher.
    Callable(Thunk),
}

struct QueueEntry {
    when: MicroInstant,
    seq: u64,
    item: QueueItem,
}

// Reverse ordering for min-heap: earliest `when` first, ties broken FIFO
// by insertion sequence.
impl Ord for QueueEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .when
            .cmp(&self.when)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

impl PartialOrd for QueueEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for QueueEntry {
    fn eq(&self, other: &Self) -> bool {
        self.when == other.when && self.seq == other.seq
    }
}

impl Eq for QueueEntry {}

struct QueueInner {
    heap: BinaryHeap<QueueEntry>,
    next_seq: u64,
    quit: bool,
    started: bool,
}

/// Thread-safe producer/consumer store for messages and callables.
pub struct EventQueue {
    inner: Mutex<QueueInner>,
    changed: Condvar,
}

impl EventQueue {
    /// Create an empty queue.
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(QueueInner {
                heap: BinaryHeap::new(),
                next_seq: 0,
                quit: false,
                started: false,
            }),
            changed: Condvar::new(),
        }
    }

    /// Enqueue a message for execution at the absolute time `when_us`.
    ///
    /// Returns `false` once the queue has been quit. Safe from any thread.
    pub fn enqueue_message(&self, mut message: Message, when_us: MicroInstant) -> bool {
        {
            let mut inner = self.inner.lock();
            if inner.quit {
                return false;
            }
            message.when = when_us;
            let seq = inner.next_seq;
            inner.next_seq += 1;
            inner.heap.push(QueueEntry {
                when: when_us,
                seq,
                item: QueueItem::Message(message),
            });
        }
        self.changed.notify_one();
        true
    }

    /// Enqueue a callable at the front of the due ordering.
    ///
    /// The returned future settles with the callable's return value, with
    /// the panic it raised, or with [`TaskError::Shutdown`] if the queue is
    /// already quit.
    pub fn enqueue_callable<F, R>(&self, func: F) -> TaskFuture<R>
    where
        F: FnOnce() -> R + Send + 'static,
        R: Send + 'static,
    {
        self.enqueue_thunk(func, 0)
    }

    /// Enqueue a callable delayed by `delay_ms` milliseconds.
    pub fn enqueue_callable_delayed<F, R>(&self, delay_ms: u64, func: F) -> TaskFuture<R>
    where
        F: FnOnce() -> R + Send + 'static,
        R: Send + 'static,
    {
        self.enqueue_thunk(func, time::when_after_ms(delay_ms))
    }

    fn enqueue_thunk<F, R>(&self, func: F, when: MicroInstant) -> TaskFuture<R>
    where
        F: FnOnce() -> R + Send + 'static,
        R: Send + 'static,
    {
        let (future, settler) = TaskFuture::channel();
        let thunk: Thunk = Box::new(move || run_and_settle(func, settler));
        let wake = {
            let mut inner = self.inner.lock();
            if inner.quit {
                // Dropping the thunk drops the settler, which reports
                // Shutdown to the future.
                return future;
            }
            let seq = inner.next_seq;
            inner.next_seq += 1;
            inner.heap.push(QueueEntry {
                when,
                seq,
                item: QueueItem::Callable(thunk),
            });
            // Immediate items always wake the consumer; delayed items only
            // once it has started polling.
            when == 0 || inner.started
        };
        if wake {
            self.changed.notify_one();
        }
        future
    }

    /// Block until the earliest item is due and return it.
    ///
    /// Returns `None` only after [`quit`](Self::quit). Spurious and timed
    /// wakes are absorbed internally; readiness and the quit flag are
    /// re-checked under the lock after every wake.
    pub fn poll_next(&self) -> Option<QueueItem> {
        let mut inner = self.inner.lock();
        inner.started = true;
        loop {
            if inner.quit {
                return None;
            }
            match inner.heap.peek().map(|entry| entry.when) {
                Some(when) => {
                    let now = time::uptime_micros();
                    if when <= now {
                        let entry = inner.heap.pop().expect("heap is non-empty");
                        return Some(entry.item);
                    }
                    self.changed
                        .wait_for(&mut inner, Duration::from_micros(when - now));
                }
                None => {
                    self.changed.wait(&mut inner);
                }
            }
        }
    }

    /// Legacy message-only poll: drops a callable item if one was due.
    ///
    /// Retained for handler-message compatibility; prefer
    /// [`poll_next`](Self::poll_next).
    pub fn poll_message(&self) -> Option<Message> {
        match self.poll_next() {
            Some(QueueItem::Message(msg)) => Some(msg),
            _ => None,
        }
    }

    /// Whether a queued message matches `target`, `what`, and (when given)
    /// the opaque token. Scans message items only.
    pub fn has_message(&self, target: HandlerId, what: i32, token: Option<u64>) -> bool {
        let inner = self.inner.lock();
        inner.heap.iter().any(|entry| match &entry.item {
            QueueItem::Message(msg) => {
                msg.target == target
                    && msg.what == what
                    && token.map_or(true, |t| msg.token == t)
            }
            QueueItem::Callable(_) => false,
        })
    }

    /// Remove all queued messages matching `target`, `what`, and (when
    /// given) the opaque token. Returns `true` if anything was removed.
    pub fn remove_messages(&self, target: HandlerId, what: i32, token: Option<u64>) -> bool {
        let mut inner = self.inner.lock();
        let before = inner.heap.len();
        let entries = std::mem::take(&mut inner.heap).into_vec();
        inner.heap = entries
            .into_iter()
            .filter(|entry| match &entry.item {
                QueueItem::Message(msg) => {
                    !(msg.target == target
                        && msg.what == what
                        && token.map_or(true, |t| msg.token == t))
                }
                QueueItem::Callable(_) => true,
            })
            .collect();
        inner.heap.len() != before
    }

    /// Signal shutdown: pending waiters wake and `poll_next` returns
    /// `None`. Idempotent.
    pub fn quit(&self) {
        {
            let mut inner = self.inner.lock();
            inner.quit = true;
        }
        self.changed.notify_all();
    }

    /// Whether shutdown has been signalled.
    pub fn is_quit(&self) -> bool {
        self.inner.lock().quit
    }

    /// Number of queued items.
    pub fn len(&self) -> usize {
        self.inner.lock().heap.len()
    }

    /// Whether the queue holds no items.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Current monotonic uptime in microseconds.
    pub fn uptime_micros(&self) -> MicroInstant {
        time::uptime_micros()
    }
}

impl Default for EventQueue {
    fn default() -> Self {
        Self::new()
    }
}

fn run_and_settle<F, R>(func: F, settler: TaskSettler<R>)
where
    F: FnOnce() -> R,
{
    match catch_unwind(AssertUnwindSafe(func)) {
        Ok(value) => settler.settle(Ok(value)),
        Err(payload) => settler.settle(Err(TaskError::Panicked(panic_message(payload)))),
    }
}

//! Loop driver: owns the queue, runs the single consumer thread, and
//! coordinates timers, handlers, promises, and shutdown.

use crate::error::panic_message;
use crate::future::TaskFuture;
use crate::handler::{Handler, HandlerRef};
use crate::message::{HandlerId, Message};
use crate::promise::Promise;
use crate::queue::{EventQueue, QueueItem, Thunk};
use crate::timer::{TimerHandle, TimerHub, TimerId};
use crate::work;
use parking_lot::{Mutex, RwLock};
use rustc_hash::FxHashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, error, trace};

/// Dispatches taking longer than this get a warning in debug builds;
/// CPU-bound work belongs on `post_work`.
#[cfg(debug_assertions)]
const CPU_BOUND_THRESHOLD: Duration = Duration::from_secs(3);

/// Single-threaded event loop.
///
/// All user callbacks — message handlers, posted callables, timer
/// callbacks, promise continuations — run on the loop's consumer thread.
/// Producers on any thread submit work through the thread-safe `post*`
/// APIs. The consumer thread starts in [`Looper::new`] and is joined when
/// the last `Arc` drops (or detached if that happens on the loop thread
/// itself).
pub struct Looper {
    queue: Arc<EventQueue>,
    running: Arc<AtomicBool>,
    thread: Mutex<Option<JoinHandle<()>>>,
    timers: Mutex<Option<Arc<TimerHub>>>,
    handlers: RwLock<FxHashMap<HandlerId, Weak<dyn Handler>>>,
    next_handler_id: AtomicU64,
    this: Weak<Looper>,
}

impl Looper {
    /// Create a loop and start its consumer thread.
    pub fn new() -> Arc<Looper> {
        let looper = Arc::new_cyclic(|weak| Looper {
            queue: Arc::new(EventQueue::new()),
            running: Arc::new(AtomicBool::new(true)),
            thread: Mutex::new(None),
            timers: Mutex::new(None),
            handlers: RwLock::new(FxHashMap::default()),
            next_handler_id: AtomicU64::new(1),
            this: weak.clone(),
        });

        let queue = looper.queue.clone();
        let running = looper.running.clone();
        let weak = Arc::downgrade(&looper);
        let handle = thread::Builder::new()
            .name("strand-loop".to_string())
            .spawn(move || run_loop(queue, weak, running))
            .expect("Failed to spawn loop thread");
        *looper.thread.lock() = Some(handle);

        looper
    }

    // ========================================================================
    // Post API
    // ========================================================================

    /// Post a callable for immediate execution on the loop thread.
    pub fn post<F, R>(&self, func: F) -> TaskFuture<R>
    where
        F: FnOnce() -> R + Send + 'static,
        R: Send + 'static,
    {
        self.queue.enqueue_callable(func)
    }

    /// Post a callable to run after `delay_ms` milliseconds.
    pub fn post_delayed<F, R>(&self, delay_ms: u64, func: F) -> TaskFuture<R>
    where
        F: FnOnce() -> R + Send + 'static,
        R: Send + 'static,
    {
        self.queue.enqueue_callable_delayed(delay_ms, func)
    }

    /// Arm a one-shot timer that runs `func` after `timeout_ms`; the
    /// returned handle cancels it.
    pub fn post_with_timeout<F>(&self, func: F, timeout_ms: u64) -> TimerHandle
    where
        F: FnOnce() + Send + 'static,
    {
        let slot = Mutex::new(Some(func));
        self.add_timer(
            move || {
                if let Some(func) = slot.lock().take() {
                    func();
                }
            },
            timeout_ms,
        )
    }

    // ========================================================================
    // Promise / worker API
    // ========================================================================

    /// Create an unsettled promise. Continuations attached with this loop
    /// as target run on its thread.
    pub fn create_promise<T: Send + 'static>(&self) -> Promise<T> {
        Promise::new()
    }

    /// Run a CPU-bound function on a worker thread; the returned promise
    /// settles on this loop with the result.
    pub fn post_work<F, R>(&self, func: F) -> Promise<R>
    where
        F: FnOnce() -> R + Send + 'static,
        R: Send + 'static,
    {
        work::spawn_work(self, func, None)
    }

    /// As [`post_work`](Self::post_work), but the promise settles with
    /// [`TaskError::Timeout`](crate::TaskError::Timeout) if the deadline
    /// passes first. The computation keeps running; its late result is
    /// discarded.
    pub fn post_work_with_timeout<F, R>(&self, func: F, timeout: Duration) -> Promise<R>
    where
        F: FnOnce() -> R + Send + 'static,
        R: Send + 'static,
    {
        work::spawn_work(self, func, Some(timeout))
    }

    // ========================================================================
    // Timer API
    // ========================================================================

    /// Arm a one-shot timer firing after `delay_ms` milliseconds.
    pub fn add_timer<F>(&self, callback: F, delay_ms: u64) -> TimerHandle
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.new_timer(Arc::new(callback), delay_ms, false)
    }

    /// Duration flavor of [`add_timer`](Self::add_timer).
    pub fn add_timer_after<F>(&self, callback: F, delay: Duration) -> TimerHandle
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.new_timer(Arc::new(callback), delay.as_millis() as u64, false)
    }

    /// Arm a periodic timer firing every `interval_ms` milliseconds until
    /// cancelled.
    pub fn add_periodic_timer<F>(&self, callback: F, interval_ms: u64) -> TimerHandle
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.new_timer(Arc::new(callback), interval_ms, true)
    }

    /// Duration flavor of [`add_periodic_timer`](Self::add_periodic_timer).
    pub fn add_periodic_timer_every<F>(&self, callback: F, interval: Duration) -> TimerHandle
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.new_timer(Arc::new(callback), interval.as_millis() as u64, true)
    }

    /// Number of currently armed timers.
    pub fn active_timer_count(&self) -> usize {
        self.timers
            .lock()
            .as_ref()
            .map(|hub| hub.active_count())
            .unwrap_or(0)
    }

    fn new_timer(
        &self,
        callback: Arc<dyn Fn() + Send + Sync>,
        delay_ms: u64,
        periodic: bool,
    ) -> TimerHandle {
        let cancelled = Arc::new(AtomicBool::new(false));
        let id = self
            .timer_hub()
            .map(|hub| hub.create_timer(callback, delay_ms, periodic, cancelled.clone()))
            .unwrap_or(0);
        if id == 0 {
            // Born cancelled: the handle is inactive and its drop is a
            // no-op.
            cancelled.store(true, Ordering::Release);
            error!(delay_ms, periodic, "timer creation failed");
        }
        TimerHandle::new(id, self.this.clone(), cancelled)
    }

    /// The hub is created on first timer use.
    fn timer_hub(&self) -> Option<Arc<TimerHub>> {
        let mut guard = self.timers.lock();
        if guard.is_none() {
            match TimerHub::new(self.this.clone()) {
                Ok(hub) => *guard = Some(hub),
                Err(err) => {
                    error!("failed to initialize timer hub: {err}");
                    return None;
                }
            }
        }
        guard.clone()
    }

    pub(crate) fn cancel_timer_internal(&self, id: TimerId) -> bool {
        self.timers
            .lock()
            .as_ref()
            .map(|hub| hub.cancel_timer(id))
            .unwrap_or(false)
    }

    pub(crate) fn has_timer_internal(&self, id: TimerId) -> bool {
        self.timers
            .lock()
            .as_ref()
            .map(|hub| hub.has_timer(id))
            .unwrap_or(false)
    }

    pub(crate) fn restart_timer_internal(&self, id: TimerId, delay_ms: u64) -> bool {
        self.timers
            .lock()
            .as_ref()
            .map(|hub| hub.restart_timer(id, delay_ms))
            .unwrap_or(false)
    }

    // ========================================================================
    // Handler routing
    // ========================================================================

    /// Register a message handler; the returned ref creates and sends
    /// messages routed to it.
    pub fn register_handler<H>(&self, handler: &Arc<H>) -> HandlerRef
    where
        H: Handler + 'static,
    {
        let id = self.next_handler_id.fetch_add(1, Ordering::Relaxed);
        let weak: Weak<H> = Arc::downgrade(handler);
        let weak: Weak<dyn Handler> = weak;
        self.handlers.write().insert(id, weak);
        HandlerRef::new(id, self.this.clone())
    }

    /// Drop the registry entry; queued messages for the id are discarded
    /// at dispatch.
    pub fn unregister_handler(&self, id: HandlerId) {
        self.handlers.write().remove(&id);
    }

    pub(crate) fn dispatch_message(&self, msg: Message) {
        let target = msg.target();
        let what = msg.what;
        let handler = self.handlers.read().get(&target).and_then(Weak::upgrade);
        match handler {
            Some(handler) => {
                let start = Instant::now();
                if let Err(payload) =
                    catch_unwind(AssertUnwindSafe(|| handler.handle_message(msg)))
                {
                    error!(
                        handler = target,
                        what,
                        "message handler panicked: {}",
                        panic_message(payload)
                    );
                }
                warn_if_cpu_bound("message handler", start.elapsed());
            }
            None => trace!(handler = target, what, "dropping message for unknown handler"),
        }
    }

    // ========================================================================
    // Lifecycle
    // ========================================================================

    /// Direct access to the underlying queue, for legacy message code and
    /// tests.
    pub fn event_queue(&self) -> Arc<EventQueue> {
        self.queue.clone()
    }

    /// Request the loop to exit; pending items are abandoned. Idempotent.
    pub fn exit(&self) {
        self.running.store(false, Ordering::Release);
        self.queue.quit();
    }

    /// Whether the consumer thread is still dispatching.
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Whether the calling thread is the loop's consumer thread.
    pub fn is_loop_thread(&self) -> bool {
        self.thread
            .lock()
            .as_ref()
            .map(|handle| handle.thread().id() == thread::current().id())
            .unwrap_or(false)
    }

    pub(crate) fn weak(&self) -> Weak<Looper> {
        self.this.clone()
    }
}

impl Drop for Looper {
    fn drop(&mut self) {
        self.running.store(false, Ordering::Release);
        // Timers first: cancels every live timer and joins the timer
        // thread before the queue stops accepting their callbacks.
        if let Some(hub) = self.timers.lock().take() {
            hub.shutdown();
        }
        self.queue.quit();
        if let Some(handle) = self.thread.lock().take() {
            if handle.thread().id() == thread::current().id() {
                // Dropped from a posted callable: joining here would
                // deadlock the loop thread on itself.
                drop(handle);
            } else {
                let _ = handle.join();
            }
        }
    }
}

fn run_loop(queue: Arc<EventQueue>, looper: Weak<Looper>, running: Arc<AtomicBool>) {
    debug!("event loop started");
    while running.load(Ordering::Acquire) {
        match queue.poll_next() {
            None => {
                if queue.is_quit() {
                    break;
                }
            }
            Some(QueueItem::Message(msg)) => match looper.upgrade() {
                Some(looper) => looper.dispatch_message(msg),
                None => break,
            },
            Some(QueueItem::Callable(thunk)) => dispatch_callable(thunk),
        }
    }
    running.store(false, Ordering::Release);
    debug!("event loop exited");
}

fn dispatch_callable(thunk: Thunk) {
    let start = Instant::now();
    // Posted callables capture their own panics into the task future;
    // this is the outer fence keeping the loop alive.
    if let Err(payload) = catch_unwind(AssertUnwindSafe(thunk)) {
        error!("panic escaped a posted callable: {}", panic_message(payload));
    }
    warn_if_cpu_bound("callable", start.elapsed());
}

#[cfg(debug_assertions)]
fn warn_if_cpu_bound(context: &str, elapsed: Duration) {
    if elapsed >= CPU_BOUND_THRESHOLD {
        tracing::warn!(
            "{context} ran for {elapsed:?} on the loop thread; move CPU-bound work to post_work"
        );
    }
}

#[cfg(not(debug_assertions))]
fn warn_if_cpu_bound(_context: &str, _elapsed: Duration) {}

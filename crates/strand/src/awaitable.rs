//! Coroutine adapters: `Future`s that schedule work through a loop and
//! resume with the outcome.
//!
//! Each adapter is a small state machine: the first poll schedules the
//! work, the completion callable runs on the owning loop's thread (storing
//! the outcome and invoking the waker there), and a second completion is
//! ignored. Polling an adapter again after it returned `Ready` is a bug
//! and panics.

use crate::error::{panic_message, TaskError};
use crate::looper::Looper;
use parking_lot::Mutex;
use std::future::Future;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::pin::Pin;
use std::sync::{Arc, Weak};
use std::task::{Context, Poll, Waker};
use std::thread;
use std::time::Duration;

struct AwaitCell<T> {
    outcome: Option<Result<T, TaskError>>,
    completed: bool,
    taken: bool,
    waker: Option<Waker>,
}

impl<T> AwaitCell<T> {
    fn new() -> Arc<Mutex<Self>> {
        Arc::new(Mutex::new(Self {
            outcome: None,
            completed: false,
            taken: false,
            waker: None,
        }))
    }
}

/// First completion wins; later calls are no-ops (double-resume guard).
fn complete<T>(shared: &Arc<Mutex<AwaitCell<T>>>, outcome: Result<T, TaskError>) {
    let waker = {
        let mut cell = shared.lock();
        if cell.completed {
            return;
        }
        cell.completed = true;
        cell.outcome = Some(outcome);
        cell.waker.take()
    };
    if let Some(waker) = waker {
        waker.wake();
    }
}

/// Completes with `Shutdown` if the scheduled callable is dropped without
/// running (queue already quit), so the awaiting coroutine never hangs.
struct CompleteOnDrop<T> {
    shared: Arc<Mutex<AwaitCell<T>>>,
}

impl<T> Drop for CompleteOnDrop<T> {
    fn drop(&mut self) {
        complete(&self.shared, Err(TaskError::Shutdown));
    }
}

fn poll_cell<T>(
    shared: &Arc<Mutex<AwaitCell<T>>>,
    cx: &mut Context<'_>,
    name: &str,
) -> Option<Result<T, TaskError>> {
    let mut cell = shared.lock();
    if let Some(outcome) = cell.outcome.take() {
        cell.taken = true;
        return Some(outcome);
    }
    assert!(!cell.taken, "{name} polled after completion");
    cell.waker = Some(cx.waker().clone());
    None
}

type BoxedFn<T> = Box<dyn FnOnce() -> T + Send>;

// ============================================================================
// Delay
// ============================================================================

/// Suspend for a duration; resumes on the loop thread.
pub fn delay(looper: &Arc<Looper>, delay: Duration) -> Delay {
    Delay {
        looper: Arc::downgrade(looper),
        delay_ms: delay.as_millis() as u64,
        shared: AwaitCell::new(),
        scheduled: false,
    }
}

/// Future returned by [`delay`].
pub struct Delay {
    looper: Weak<Looper>,
    delay_ms: u64,
    shared: Arc<Mutex<AwaitCell<()>>>,
    scheduled: bool,
}

impl Future for Delay {
    type Output = Result<(), TaskError>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        if let Some(outcome) = poll_cell(&this.shared, cx, "Delay") {
            return Poll::Ready(outcome);
        }
        if !this.scheduled {
            this.scheduled = true;
            match this.looper.upgrade() {
                Some(looper) => {
                    let guard = CompleteOnDrop {
                        shared: this.shared.clone(),
                    };
                    let _ = looper.post_delayed(this.delay_ms, move || {
                        complete(&guard.shared, Ok(()));
                    });
                }
                None => complete(&this.shared, Err(TaskError::Shutdown)),
            }
        }
        Poll::Pending
    }
}

// ============================================================================
// Work
// ============================================================================

/// Run `func` on a worker thread; resume on the loop thread with its
/// result (or the panic it raised).
pub fn work<T, F>(looper: &Arc<Looper>, func: F) -> WorkFuture<T>
where
    F: FnOnce() -> T + Send + 'static,
    T: Send + 'static,
{
    WorkFuture {
        looper: Arc::downgrade(looper),
        func: Some(Box::new(func)),
        shared: AwaitCell::new(),
        scheduled: false,
    }
}

/// Future returned by [`work`].
pub struct WorkFuture<T> {
    looper: Weak<Looper>,
    func: Option<BoxedFn<T>>,
    shared: Arc<Mutex<AwaitCell<T>>>,
    scheduled: bool,
}

impl<T: Send + 'static> Future for WorkFuture<T> {
    type Output = Result<T, TaskError>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        if let Some(outcome) = poll_cell(&this.shared, cx, "WorkFuture") {
            return Poll::Ready(outcome);
        }
        if !this.scheduled {
            this.scheduled = true;
            let func = this.func.take().expect("work scheduled once");
            let shared = this.shared.clone();
            let weak = this.looper.clone();
            thread::Builder::new()
                .name("strand-work".to_string())
                .spawn(move || {
                    let guard = CompleteOnDrop { shared };
                    let outcome = catch_unwind(AssertUnwindSafe(func))
                        .map_err(|payload| TaskError::Panicked(panic_message(payload)));
                    match weak.upgrade() {
                        Some(looper) => {
                            let _ = looper.post(move || {
                                complete(&guard.shared, outcome);
                            });
                        }
                        None => complete(&guard.shared, Err(TaskError::Shutdown)),
                    }
                })
                .expect("Failed to spawn work thread");
        }
        Poll::Pending
    }
}

// ============================================================================
// Post
// ============================================================================

/// Run `func` on the loop thread; resume with its result.
pub fn post<T, F>(looper: &Arc<Looper>, func: F) -> PostFuture<T>
where
    F: FnOnce() -> T + Send + 'static,
    T: Send + 'static,
{
    PostFuture {
        looper: Arc::downgrade(looper),
        func: Some(Box::new(func)),
        shared: AwaitCell::new(),
        scheduled: false,
    }
}

/// Future returned by [`post`].
pub struct PostFuture<T> {
    looper: Weak<Looper>,
    func: Option<BoxedFn<T>>,
    shared: Arc<Mutex<AwaitCell<T>>>,
    scheduled: bool,
}

impl<T: Send + 'static> Future for PostFuture<T> {
    type Output = Result<T, TaskError>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        if let Some(outcome) = poll_cell(&this.shared, cx, "PostFuture") {
            return Poll::Ready(outcome);
        }
        if !this.scheduled {
            this.scheduled = true;
            match this.looper.upgrade() {
                Some(looper) => {
                    let guard = CompleteOnDrop {
                        shared: this.shared.clone(),
                    };
                    let func = this.func.take().expect("post scheduled once");
                    let _ = looper.post(move || {
                        let outcome = catch_unwind(AssertUnwindSafe(func))
                            .map_err(|payload| TaskError::Panicked(panic_message(payload)));
                        complete(&guard.shared, outcome);
                    });
                }
                None => complete(&this.shared, Err(TaskError::Shutdown)),
            }
        }
        Poll::Pending
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::executor::block_on;
    use std::time::Instant;

    #[test]
    fn test_delay_waits_at_least_requested() {
        let looper = Looper::new();
        let start = Instant::now();
        assert_eq!(block_on(delay(&looper, Duration::from_millis(80))), Ok(()));
        assert!(start.elapsed() >= Duration::from_millis(80));
    }

    #[test]
    fn test_delay_on_dead_loop_reports_shutdown() {
        let looper = Looper::new();
        looper.exit();
        thread::sleep(Duration::from_millis(30));
        assert_eq!(
            block_on(delay(&looper, Duration::from_millis(10))),
            Err(TaskError::Shutdown)
        );
    }

    #[test]
    fn test_work_runs_off_loop_and_returns_value() {
        let looper = Looper::new();
        let loop_id = looper.post(|| thread::current().id()).wait().unwrap();

        let worker_id = block_on(work(&looper, || thread::current().id())).unwrap();
        assert_ne!(worker_id, loop_id);
        assert_ne!(worker_id, thread::current().id());
    }

    #[test]
    fn test_work_carries_panic() {
        let looper = Looper::new();
        let outcome = block_on(work(&looper, || -> i32 { panic!("offloaded bug") }));
        assert_eq!(outcome, Err(TaskError::Panicked("offloaded bug".into())));
    }

    #[test]
    fn test_post_runs_on_loop_thread() {
        let looper = Looper::new();
        let loop_id = looper.post(|| thread::current().id()).wait().unwrap();

        let seen = block_on(post(&looper, || thread::current().id())).unwrap();
        assert_eq!(seen, loop_id);
    }

    #[test]
    fn test_post_on_quit_loop_reports_shutdown() {
        let looper = Looper::new();
        looper.exit();
        thread::sleep(Duration::from_millis(30));
        assert_eq!(
            block_on(post(&looper, || 1)),
            Err(TaskError::Shutdown)
        );
    }
}

//! Result channel for posted callables.
//!
//! Every `enqueue_callable` wraps the user function so its return value or
//! caught panic settles a [`TaskFuture`] exactly once. The future supports
//! both blocking waits (producer-thread style) and `await`.

use crate::error::TaskError;
use parking_lot::{Condvar, Mutex};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll, Waker};
use std::time::{Duration, Instant};

struct FutureCell<T> {
    outcome: Option<Result<T, TaskError>>,
    settled: bool,
    taken: bool,
    waker: Option<Waker>,
}

struct SharedCell<T> {
    cell: Mutex<FutureCell<T>>,
    ready: Condvar,
}

/// Handle to the eventual result of a posted callable.
///
/// Settled exactly once: with the callable's return value, with
/// [`TaskError::Panicked`] if it panicked, or with [`TaskError::Shutdown`]
/// if the queue was quit before the callable could run. Dropping the future
/// does not cancel the callable.
pub struct TaskFuture<T> {
    shared: Arc<SharedCell<T>>,
}

/// Producer half; settles the cell at most once. Dropping an unsettled
/// settler (the callable was discarded without running) settles with
/// [`TaskError::Shutdown`] so waiters never hang.
pub(crate) struct TaskSettler<T> {
    shared: Option<Arc<SharedCell<T>>>,
}

impl<T> TaskFuture<T> {
    pub(crate) fn channel() -> (TaskFuture<T>, TaskSettler<T>) {
        let shared = Arc::new(SharedCell {
            cell: Mutex::new(FutureCell {
                outcome: None,
                settled: false,
                taken: false,
                waker: None,
            }),
            ready: Condvar::new(),
        });
        (
            TaskFuture {
                shared: shared.clone(),
            },
            TaskSettler {
                shared: Some(shared),
            },
        )
    }

    /// Block until the callable has run and return its outcome.
    ///
    /// # Panics
    /// Panics if the result was already extracted through `poll` or
    /// [`try_take`](Self::try_take).
    pub fn wait(self) -> Result<T, TaskError> {
        let mut cell = self.shared.cell.lock();
        loop {
            if let Some(outcome) = cell.outcome.take() {
                cell.taken = true;
                return outcome;
            }
            assert!(!cell.taken, "task result already taken");
            self.shared.ready.wait(&mut cell);
        }
    }

    /// Block for at most `timeout`; `None` if the result is not ready yet.
    pub fn wait_timeout(&self, timeout: Duration) -> Option<Result<T, TaskError>> {
        let deadline = Instant::now() + timeout;
        let mut cell = self.shared.cell.lock();
        loop {
            if let Some(outcome) = cell.outcome.take() {
                cell.taken = true;
                return Some(outcome);
            }
            assert!(!cell.taken, "task result already taken");
            let now = Instant::now();
            if now >= deadline {
                return None;
            }
            self.shared.ready.wait_for(&mut cell, deadline - now);
        }
    }

    /// Take the outcome if the callable has already run.
    pub fn try_take(&self) -> Option<Result<T, TaskError>> {
        let mut cell = self.shared.cell.lock();
        let outcome = cell.outcome.take();
        if outcome.is_some() {
            cell.taken = true;
        }
        outcome
    }

    /// Whether the future has been settled (result may already be taken).
    pub fn is_ready(&self) -> bool {
        self.shared.cell.lock().settled
    }
}

impl<T> Future for TaskFuture<T> {
    type Output = Result<T, TaskError>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let mut cell = self.shared.cell.lock();
        if let Some(outcome) = cell.outcome.take() {
            cell.taken = true;
            return Poll::Ready(outcome);
        }
        assert!(!cell.taken, "TaskFuture polled after completion");
        cell.waker = Some(cx.waker().clone());
        Poll::Pending
    }
}

impl<T> TaskSettler<T> {
    pub(crate) fn settle(mut self, outcome: Result<T, TaskError>) {
        if let Some(shared) = self.shared.take() {
            Self::store(&shared, outcome);
        }
    }

    fn store(shared: &SharedCell<T>, outcome: Result<T, TaskError>) {
        let waker = {
            let mut cell = shared.cell.lock();
            if cell.settled {
                return;
            }
            cell.settled = true;
            cell.outcome = Some(outcome);
            cell.waker.take()
        };
        shared.ready.notify_all();
        if let Some(waker) = waker {
            waker.wake();
        }
    }
}

impl<T> Drop for TaskSettler<T> {
    fn drop(&mut self) {
        if let Some(shared) = self.shared.take() {
            Self::store(&shared, Err(TaskError::Shutdown));
        }
    }
}

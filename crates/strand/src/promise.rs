//! Settle-once promise state with loop-affine callback delivery.
//!
//! A `State` holds either a value, an error, or nothing, plus at most one
//! continuation and one error handler, each bound to a target loop.
//! Settling and attaching are both short critical sections; the matching
//! callback is posted onto its loop, never invoked inline, so promise
//! callbacks serialize with the rest of that loop's work.

use crate::error::{panic_message, TaskError};
use crate::looper::Looper;
use parking_lot::Mutex;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

type ContFn<T> = Box<dyn FnOnce(T) + Send>;
type ErrFn = Box<dyn FnOnce(TaskError) + Send>;

#[derive(Clone, Copy, PartialEq, Eq)]
enum SettledKind {
    Value,
    Error,
}

struct StateInner<T> {
    value: Option<T>,
    error: Option<TaskError>,
    settled: Option<SettledKind>,
    continuation: Option<(Arc<Looper>, ContFn<T>)>,
    error_handler: Option<(Arc<Looper>, ErrFn)>,
    continuation_dispatched: bool,
    error_dispatched: bool,
}

pub(crate) struct State<T> {
    inner: Mutex<StateInner<T>>,
}

impl<T: Send + 'static> State<T> {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            inner: Mutex::new(StateInner {
                value: None,
                error: None,
                settled: None,
                continuation: None,
                error_handler: None,
                continuation_dispatched: false,
                error_dispatched: false,
            }),
        })
    }

    /// Empty -> Value. No-op once settled. An attached continuation is
    /// scheduled on its loop.
    fn set_value(&self, value: T) {
        let dispatch = {
            let mut inner = self.inner.lock();
            if inner.settled.is_some() {
                return;
            }
            inner.settled = Some(SettledKind::Value);
            match inner.continuation.take() {
                Some((looper, func)) => {
                    inner.continuation_dispatched = true;
                    Some((looper, func, value))
                }
                None => {
                    inner.value = Some(value);
                    None
                }
            }
        };
        if let Some((looper, func, value)) = dispatch {
            let _ = looper.post(move || func(value));
        }
    }

    /// Empty -> Error. No-op once settled. An attached error handler is
    /// scheduled on its loop.
    fn set_exception(&self, error: TaskError) {
        let dispatch = {
            let mut inner = self.inner.lock();
            if inner.settled.is_some() {
                return;
            }
            inner.settled = Some(SettledKind::Error);
            match inner.error_handler.take() {
                Some((looper, func)) => {
                    inner.error_dispatched = true;
                    Some((looper, func, error))
                }
                None => {
                    inner.error = Some(error);
                    None
                }
            }
        };
        if let Some((looper, func, error)) = dispatch {
            let _ = looper.post(move || func(error));
        }
    }

    /// Attach (or, before dispatch, replace) the continuation. If the
    /// state already holds a value the continuation is scheduled now; an
    /// error state belongs to the error handler.
    fn set_continuation(&self, looper: Arc<Looper>, func: ContFn<T>) {
        let dispatch = {
            let mut inner = self.inner.lock();
            match inner.settled {
                None => {
                    inner.continuation = Some((looper, func));
                    None
                }
                Some(SettledKind::Value) => {
                    if inner.continuation_dispatched {
                        None
                    } else {
                        inner.continuation_dispatched = true;
                        inner.value.take().map(|value| (looper, func, value))
                    }
                }
                Some(SettledKind::Error) => None,
            }
        };
        if let Some((looper, func, value)) = dispatch {
            let _ = looper.post(move || func(value));
        }
    }

    /// Symmetric to [`set_continuation`](Self::set_continuation).
    fn set_error_handler(&self, looper: Arc<Looper>, func: ErrFn) {
        let dispatch = {
            let mut inner = self.inner.lock();
            match inner.settled {
                None => {
                    inner.error_handler = Some((looper, func));
                    None
                }
                Some(SettledKind::Error) => {
                    if inner.error_dispatched {
                        None
                    } else {
                        inner.error_dispatched = true;
                        inner.error.take().map(|error| (looper, func, error))
                    }
                }
                Some(SettledKind::Value) => None,
            }
        };
        if let Some((looper, func, error)) = dispatch {
            let _ = looper.post(move || func(error));
        }
    }
}

/// Settle-once promise whose callbacks run on a nominated loop.
///
/// Clones share one state; whichever clone settles first wins and later
/// settles are no-ops. `then` and `catch_error` return a fresh downstream
/// promise, so chains read top to bottom:
///
/// ```no_run
/// use strand::Looper;
///
/// let looper = Looper::new();
/// let promise = looper.create_promise::<i32>();
/// promise
///     .then(&looper, |x| x * 2)
///     .then(&looper, |x| println!("got {x}"));
/// promise.set_value(21);
/// ```
pub struct Promise<T> {
    state: Arc<State<T>>,
}

impl<T> Clone for Promise<T> {
    fn clone(&self) -> Self {
        Self {
            state: self.state.clone(),
        }
    }
}

impl<T: Send + 'static> Promise<T> {
    /// Create an unsettled promise.
    pub fn new() -> Self {
        Self { state: State::new() }
    }

    /// Resolve with a value; no-op if already settled.
    pub fn set_value(&self, value: T) {
        self.state.set_value(value);
    }

    /// Reject with an error; no-op if already settled.
    pub fn set_exception(&self, error: TaskError) {
        self.state.set_exception(error);
    }

    /// Chain a continuation on `looper`. The downstream promise settles
    /// with `func`'s return value; a panic in `func` or an error in this
    /// promise forwards to the downstream error path.
    pub fn then<U, F>(&self, looper: &Arc<Looper>, func: F) -> Promise<U>
    where
        F: FnOnce(T) -> U + Send + 'static,
        U: Send + 'static,
    {
        let next = Promise::new();

        let downstream = next.clone();
        self.state.set_continuation(
            looper.clone(),
            Box::new(move |value| {
                match catch_unwind(AssertUnwindSafe(move || func(value))) {
                    Ok(result) => downstream.set_value(result),
                    Err(payload) => {
                        downstream.set_exception(TaskError::Panicked(panic_message(payload)))
                    }
                }
            }),
        );

        let downstream = next.clone();
        self.state.set_error_handler(
            looper.clone(),
            Box::new(move |error| downstream.set_exception(error)),
        );

        next
    }

    /// Chain an error handler on `looper`. Values pass through unchanged;
    /// the handler may recover with `Ok` or forward with `Err`.
    pub fn catch_error<F>(&self, looper: &Arc<Looper>, func: F) -> Promise<T>
    where
        F: FnOnce(TaskError) -> Result<T, TaskError> + Send + 'static,
    {
        let next = Promise::new();

        let downstream = next.clone();
        self.state.set_continuation(
            looper.clone(),
            Box::new(move |value| downstream.set_value(value)),
        );

        let downstream = next.clone();
        self.state.set_error_handler(
            looper.clone(),
            Box::new(move |error| {
                match catch_unwind(AssertUnwindSafe(move || func(error))) {
                    Ok(Ok(recovered)) => downstream.set_value(recovered),
                    Ok(Err(forwarded)) => downstream.set_exception(forwarded),
                    Err(payload) => {
                        downstream.set_exception(TaskError::Panicked(panic_message(payload)))
                    }
                }
            }),
        );

        next
    }
}

impl Promise<()> {
    /// Mark a unit promise as completed.
    pub fn resolve(&self) {
        self.set_value(());
    }
}

impl<T: Send + 'static> Default for Promise<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicI32, Ordering};
    use std::thread;
    use std::time::Duration;

    fn settle_time() {
        thread::sleep(Duration::from_millis(80));
    }

    #[test]
    fn test_then_after_settle_runs_on_loop() {
        let looper = Looper::new();
        let promise = looper.create_promise::<i32>();
        promise.set_value(21);

        let seen = Arc::new(AtomicI32::new(0));
        let sink = seen.clone();
        promise.then(&looper, move |x| {
            sink.store(x * 2, Ordering::SeqCst);
        });
        settle_time();
        assert_eq!(seen.load(Ordering::SeqCst), 42);
    }

    #[test]
    fn test_settle_after_then() {
        let looper = Looper::new();
        let promise = looper.create_promise::<i32>();

        let seen = Arc::new(AtomicI32::new(0));
        let sink = seen.clone();
        promise.then(&looper, move |x| {
            sink.store(x, Ordering::SeqCst);
        });
        promise.set_value(7);
        settle_time();
        assert_eq!(seen.load(Ordering::SeqCst), 7);
    }

    #[test]
    fn test_second_settle_is_noop() {
        let looper = Looper::new();
        let promise = looper.create_promise::<i32>();
        promise.set_value(1);
        promise.set_value(2);
        promise.set_exception(TaskError::Timeout);

        let seen = Arc::new(AtomicI32::new(0));
        let sink = seen.clone();
        promise.then(&looper, move |x| {
            sink.fetch_add(x, Ordering::SeqCst);
        });
        settle_time();
        assert_eq!(seen.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_error_forwards_through_then_chain() {
        let looper = Looper::new();
        let promise = looper.create_promise::<i32>();

        let hits = Arc::new(AtomicI32::new(0));
        let errors = Arc::new(AtomicI32::new(0));
        let h = hits.clone();
        let e = errors.clone();
        promise
            .then(&looper, move |x| {
                h.fetch_add(x, Ordering::SeqCst);
                x
            })
            .catch_error(&looper, move |err| {
                assert_eq!(err, TaskError::Timeout);
                e.fetch_add(1, Ordering::SeqCst);
                Err(err)
            });

        promise.set_exception(TaskError::Timeout);
        settle_time();
        assert_eq!(hits.load(Ordering::SeqCst), 0);
        assert_eq!(errors.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_catch_error_recovers_value() {
        let looper = Looper::new();
        let promise = looper.create_promise::<i32>();

        let seen = Arc::new(AtomicI32::new(0));
        let sink = seen.clone();
        promise
            .catch_error(&looper, |_| Ok(-1))
            .then(&looper, move |x| {
                sink.store(x, Ordering::SeqCst);
            });

        promise.set_exception(TaskError::Panicked("boom".into()));
        settle_time();
        assert_eq!(seen.load(Ordering::SeqCst), -1);
    }

    #[test]
    fn test_panicking_continuation_rejects_downstream() {
        let looper = Looper::new();
        let promise = looper.create_promise::<i32>();

        let errors = Arc::new(AtomicI32::new(0));
        let e = errors.clone();
        promise
            .then(&looper, |_: i32| -> i32 { panic!("chain bug") })
            .catch_error(&looper, move |err| {
                assert!(matches!(err, TaskError::Panicked(_)));
                e.fetch_add(1, Ordering::SeqCst);
                Err(err)
            });

        promise.set_value(1);
        settle_time();
        assert_eq!(errors.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_unit_promise_resolve() {
        let looper = Looper::new();
        let promise = looper.create_promise::<()>();

        let hits = Arc::new(AtomicI32::new(0));
        let h = hits.clone();
        promise.then(&looper, move |()| {
            h.fetch_add(1, Ordering::SeqCst);
        });
        promise.resolve();
        promise.resolve();
        settle_time();
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_value_transformation_chain() {
        let looper = Looper::new();
        let promise = looper.create_promise::<i32>();

        let seen: Arc<Mutex<String>> = Arc::new(Mutex::new(String::new()));
        let sink = seen.clone();
        promise
            .then(&looper, |x| x * 2)
            .then(&looper, |x| format!("result: {x}"))
            .then(&looper, move |s| {
                *sink.lock() = s;
            });

        promise.set_value(21);
        settle_time();
        assert_eq!(&*seen.lock(), "result: 42");
    }
}

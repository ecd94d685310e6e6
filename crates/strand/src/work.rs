//! Off-loop worker for CPU-bound tasks.
//!
//! The worker runs the user function on its own OS thread and posts the
//! outcome back onto the loop, where it settles the promise. A timeout is
//! just a delayed callable settling the same promise with
//! [`TaskError::Timeout`]; the settle-once state machine makes the race
//! with the worker benign, and a computation that outlives its deadline
//! keeps running with its result discarded.

use crate::error::{panic_message, TaskError};
use crate::looper::Looper;
use crate::promise::Promise;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::thread;
use std::time::Duration;

pub(crate) fn spawn_work<F, R>(looper: &Looper, func: F, timeout: Option<Duration>) -> Promise<R>
where
    F: FnOnce() -> R + Send + 'static,
    R: Send + 'static,
{
    let promise = Promise::new();

    if let Some(timeout) = timeout {
        let deadline = promise.clone();
        let _ = looper.post_delayed(timeout.as_millis() as u64, move || {
            deadline.set_exception(TaskError::Timeout);
        });
    }

    let settle = promise.clone();
    let weak = looper.weak();
    thread::Builder::new()
        .name("strand-work".to_string())
        .spawn(move || {
            let outcome = catch_unwind(AssertUnwindSafe(func))
                .map_err(|payload| TaskError::Panicked(panic_message(payload)));
            if let Some(looper) = weak.upgrade() {
                let _ = looper.post(move || match outcome {
                    Ok(value) => settle.set_value(value),
                    Err(error) => settle.set_exception(error),
                });
            }
        })
        .expect("Failed to spawn work thread");

    promise
}

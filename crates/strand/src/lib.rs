//! Single-threaded event loop runtime.
//!
//! One consumer thread drains a unified time-ordered queue of messages and
//! callables; kernel timers, a settle-once promise pair, an off-loop
//! worker, and `Future`-based awaitables are layered on top. Producers on
//! any thread post work; user callbacks always run on the loop thread.
//!
//! ```no_run
//! use strand::Looper;
//!
//! let looper = Looper::new();
//!
//! // Post a callable and block on its result.
//! let doubled = looper.post(|| 21 * 2).wait().unwrap();
//! assert_eq!(doubled, 42);
//!
//! // Arm a timer; dropping the handle cancels it.
//! let tick = looper.add_periodic_timer(|| println!("tick"), 1000);
//!
//! // Offload CPU-bound work and chain the result back onto the loop.
//! looper
//!     .post_work(|| (1..=10u64).product::<u64>())
//!     .then(&looper, |n| println!("10! = {n}"));
//!
//! tick.cancel();
//! ```

pub mod awaitable;
mod error;
mod future;
mod handler;
mod looper;
mod message;
mod promise;
mod queue;
mod time;
mod timer;
mod work;

pub use error::TaskError;
pub use future::TaskFuture;
pub use handler::{Handler, HandlerRef};
pub use looper::Looper;
pub use message::{HandlerId, Message};
pub use promise::Promise;
pub use queue::{EventQueue, QueueItem, Thunk};
pub use time::{uptime_micros, MicroInstant};
pub use timer::{TimerHandle, TimerId};

//! Kernel-backed timers: the user-facing RAII handle and the timerfd/epoll
//! hub that demultiplexes expirations onto the owning loop.

mod handle;
mod hub;

pub use handle::TimerHandle;
pub(crate) use hub::TimerHub;

/// Unique identifier for a live timer.
///
/// Ids are drawn from a per-hub atomic counter starting at 1 and are never
/// reused for the life of a loop; `0` marks a handle whose timer failed to
/// arm.
pub type TimerId = u64;

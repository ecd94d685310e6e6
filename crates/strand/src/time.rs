//! Monotonic microsecond clock used for all scheduling.

use std::sync::OnceLock;
use std::time::Instant;

/// Microseconds since the process-wide monotonic origin.
///
/// All queue and timer scheduling is expressed in this unit; millisecond
/// APIs convert on entry.
pub type MicroInstant = u64;

static ORIGIN: OnceLock<Instant> = OnceLock::new();

/// Current monotonic uptime in microseconds.
///
/// The origin is fixed the first time any part of the runtime asks for the
/// time, so values are comparable across threads for the life of the
/// process.
pub fn uptime_micros() -> MicroInstant {
    ORIGIN.get_or_init(Instant::now).elapsed().as_micros() as MicroInstant
}

/// Absolute execution time for an item delayed by `delay_ms` from now.
pub(crate) fn when_after_ms(delay_ms: u64) -> MicroInstant {
    uptime_micros().saturating_add(delay_ms.saturating_mul(1000))
}

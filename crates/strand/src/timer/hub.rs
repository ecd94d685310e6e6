//! timerfd/epoll timer backend.
//!
//! Each timer owns a kernel timerfd registered with one epoll instance. A
//! dedicated thread waits on the demultiplexer with a bounded timeout and
//! converts expirations into callables posted onto the owning loop. The
//! user callback runs only on the loop thread, after the cancelled flag
//! has been checked on both sides of the hand-off.

use crate::looper::Looper;
use crate::timer::TimerId;
use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use std::io;
use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::thread::{self, JoinHandle};
use tracing::{debug, error, trace};

const MAX_EVENTS: usize = 64;
const WAIT_TIMEOUT_MS: libc::c_int = 100;

struct TimerRecord {
    fd: RawFd,
    callback: Arc<dyn Fn() + Send + Sync>,
    periodic: bool,
    interval_ms: u64,
    cancelled: Arc<AtomicBool>,
}

/// Owner of the kernel timers of one loop.
pub(crate) struct TimerHub {
    epoll_fd: RawFd,
    records: Mutex<FxHashMap<TimerId, TimerRecord>>,
    next_id: AtomicU64,
    running: AtomicBool,
    closed: AtomicBool,
    thread: Mutex<Option<JoinHandle<()>>>,
    looper: Weak<Looper>,
}

impl TimerHub {
    /// Create the epoll instance and start the demultiplexer thread.
    pub(crate) fn new(looper: Weak<Looper>) -> io::Result<Arc<TimerHub>> {
        let epoll_fd = unsafe { libc::epoll_create1(libc::EPOLL_CLOEXEC) };
        if epoll_fd < 0 {
            return Err(io::Error::last_os_error());
        }

        let hub = Arc::new(TimerHub {
            epoll_fd,
            records: Mutex::new(FxHashMap::default()),
            next_id: AtomicU64::new(1),
            running: AtomicBool::new(true),
            closed: AtomicBool::new(false),
            thread: Mutex::new(None),
            looper,
        });

        let worker = Arc::clone(&hub);
        let handle = thread::Builder::new()
            .name("strand-timer".to_string())
            .spawn(move || worker.demux_loop())
            .expect("Failed to spawn timer thread");
        *hub.thread.lock() = Some(handle);

        Ok(hub)
    }

    /// Arm a new timer. Returns an id >= 1, or 0 if the kernel resources
    /// could not be created (no record is left behind).
    pub(crate) fn create_timer(
        &self,
        callback: Arc<dyn Fn() + Send + Sync>,
        delay_ms: u64,
        periodic: bool,
        cancelled: Arc<AtomicBool>,
    ) -> TimerId {
        if !self.running.load(Ordering::Acquire) {
            return 0;
        }

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let fd = match create_timer_fd(delay_ms, periodic) {
            Ok(fd) => fd,
            Err(err) => {
                error!(id, delay_ms, periodic, "failed to create timerfd: {err}");
                return 0;
            }
        };

        let mut event = libc::epoll_event {
            events: libc::EPOLLIN as u32,
            u64: id,
        };
        if unsafe { libc::epoll_ctl(self.epoll_fd, libc::EPOLL_CTL_ADD, fd, &mut event) } < 0 {
            let err = io::Error::last_os_error();
            error!(id, "failed to register timerfd with epoll: {err}");
            unsafe { libc::close(fd) };
            return 0;
        }

        self.records.lock().insert(
            id,
            TimerRecord {
                fd,
                callback,
                periodic,
                interval_ms: delay_ms,
                cancelled,
            },
        );
        debug!(id, delay_ms, periodic, "timer armed");
        id
    }

    /// Tear down the kernel timer and remove the record.
    pub(crate) fn cancel_timer(&self, id: TimerId) -> bool {
        let removed = self.remove_record(id);
        if removed {
            debug!(id, "timer cancelled");
        }
        removed
    }

    pub(crate) fn has_timer(&self, id: TimerId) -> bool {
        self.records.lock().contains_key(&id)
    }

    /// Reprogram an existing timer with a new one-shot delay, clearing its
    /// cancelled flag. A periodic timer is converted to one-shot. Returns
    /// `false` for unknown ids or if the kernel rejects the rearm, leaving
    /// the record in its prior state.
    pub(crate) fn restart_timer(&self, id: TimerId, delay_ms: u64) -> bool {
        let mut records = self.records.lock();
        let Some(record) = records.get_mut(&id) else {
            return false;
        };
        if let Err(err) = arm_timer_fd(record.fd, delay_ms, false) {
            error!(id, delay_ms, "failed to rearm timerfd: {err}");
            return false;
        }
        record.cancelled.store(false, Ordering::Release);
        record.periodic = false;
        record.interval_ms = delay_ms;
        true
    }

    pub(crate) fn active_count(&self) -> usize {
        self.records.lock().len()
    }

    /// Stop the demultiplexer thread and tear down every live timer.
    /// Idempotent.
    pub(crate) fn shutdown(&self) {
        self.running.store(false, Ordering::Release);
        if let Some(handle) = self.thread.lock().take() {
            if handle.thread().id() == thread::current().id() {
                drop(handle);
            } else {
                let _ = handle.join();
            }
        }
        if !self.closed.swap(true, Ordering::AcqRel) {
            let drained: Vec<TimerRecord> = {
                let mut records = self.records.lock();
                records.drain().map(|(_, record)| record).collect()
            };
            for record in drained {
                record.cancelled.store(true, Ordering::Release);
                self.teardown_fd(record.fd);
            }
            unsafe { libc::close(self.epoll_fd) };
        }
    }

    fn demux_loop(&self) {
        let mut events: [libc::epoll_event; MAX_EVENTS] = unsafe { std::mem::zeroed() };

        while self.running.load(Ordering::Acquire) {
            let count = unsafe {
                libc::epoll_wait(
                    self.epoll_fd,
                    events.as_mut_ptr(),
                    MAX_EVENTS as libc::c_int,
                    WAIT_TIMEOUT_MS,
                )
            };
            if count < 0 {
                let err = io::Error::last_os_error();
                if err.raw_os_error() == Some(libc::EINTR) {
                    continue;
                }
                // Fatal demultiplexer failure: stop arming new timers and
                // terminate only this thread.
                error!("timer demultiplexer failed: {err}");
                self.running.store(false, Ordering::Release);
                break;
            }

            for event in &events[..count as usize] {
                self.handle_expiry(event.u64);
            }
        }
        trace!("timer thread exiting");
    }

    fn handle_expiry(&self, id: TimerId) {
        let (callback, cancelled, periodic) = {
            let mut records = self.records.lock();
            let Some(record) = records.get(&id) else {
                return;
            };
            if record.cancelled.load(Ordering::Acquire) {
                drain_expirations(record.fd);
                let record = records.remove(&id).expect("record exists");
                drop(records);
                self.teardown_fd(record.fd);
                return;
            }
            // Drain the expiration count while the record still owns the
            // descriptor; a racing cancel may close it once we unlock.
            drain_expirations(record.fd);
            trace!(
                id,
                periodic = record.periodic,
                interval_ms = record.interval_ms,
                "timer expired"
            );
            (
                record.callback.clone(),
                record.cancelled.clone(),
                record.periodic,
            )
        };

        if cancelled.load(Ordering::Acquire) {
            self.remove_record(id);
            return;
        }

        if let Some(looper) = self.looper.upgrade() {
            let flag = cancelled.clone();
            let _ = looper.post(move || {
                // Final check on the loop thread; a cancel may have raced
                // the posted callable.
                if !flag.load(Ordering::Acquire) {
                    callback();
                }
            });
        }

        if !periodic {
            self.remove_record(id);
        }
    }

    fn remove_record(&self, id: TimerId) -> bool {
        let record = self.records.lock().remove(&id);
        match record {
            Some(record) => {
                self.teardown_fd(record.fd);
                true
            }
            None => false,
        }
    }

    fn teardown_fd(&self, fd: RawFd) {
        unsafe {
            libc::epoll_ctl(self.epoll_fd, libc::EPOLL_CTL_DEL, fd, std::ptr::null_mut());
            libc::close(fd);
        }
    }
}

impl Drop for TimerHub {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Read and discard the timerfd expiration count. The descriptor is
/// non-blocking, so a racing drain simply reports EAGAIN.
fn drain_expirations(fd: RawFd) {
    let mut expirations: u64 = 0;
    unsafe {
        libc::read(
            fd,
            &mut expirations as *mut u64 as *mut libc::c_void,
            std::mem::size_of::<u64>(),
        );
    }
}

fn create_timer_fd(delay_ms: u64, periodic: bool) -> io::Result<RawFd> {
    let fd = unsafe {
        libc::timerfd_create(
            libc::CLOCK_MONOTONIC,
            libc::TFD_CLOEXEC | libc::TFD_NONBLOCK,
        )
    };
    if fd < 0 {
        return Err(io::Error::last_os_error());
    }
    if let Err(err) = arm_timer_fd(fd, delay_ms, periodic) {
        unsafe { libc::close(fd) };
        return Err(err);
    }
    Ok(fd)
}

fn arm_timer_fd(fd: RawFd, delay_ms: u64, periodic: bool) -> io::Result<()> {
    // An all-zero it_value disarms a timerfd; clamp so a zero delay fires
    // on the next tick instead of never.
    let nanos = (delay_ms % 1000) * 1_000_000;
    let value = libc::timespec {
        tv_sec: (delay_ms / 1000) as libc::time_t,
        tv_nsec: if delay_ms == 0 { 1 } else { nanos as libc::c_long },
    };
    let interval = if periodic {
        value
    } else {
        libc::timespec {
            tv_sec: 0,
            tv_nsec: 0,
        }
    };
    let spec = libc::itimerspec {
        it_interval: interval,
        it_value: value,
    };
    if unsafe { libc::timerfd_settime(fd, 0, &spec, std::ptr::null_mut()) } < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

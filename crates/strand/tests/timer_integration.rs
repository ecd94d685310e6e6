//! End-to-end scenarios for timers: RAII cancellation, periodic firing,
//! move and restart semantics.

use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use strand::{Looper, TimerHandle};

#[test]
fn test_dropped_handle_cancels_one_shot() {
    let looper = Looper::new();
    let fired = Arc::new(AtomicI32::new(0));

    let f = fired.clone();
    let timer = looper.add_timer(
        move || {
            f.fetch_add(1, Ordering::SeqCst);
        },
        100,
    );
    assert!(timer.is_active());
    drop(timer);

    thread::sleep(Duration::from_millis(250));
    assert_eq!(fired.load(Ordering::SeqCst), 0);
    assert_eq!(looper.active_timer_count(), 0);
}

#[test]
fn test_one_shot_fires_once_and_disarms() {
    let looper = Looper::new();
    let fired = Arc::new(AtomicI32::new(0));

    let f = fired.clone();
    let timer = looper.add_timer(
        move || {
            f.fetch_add(1, Ordering::SeqCst);
        },
        50,
    );
    thread::sleep(Duration::from_millis(200));
    assert_eq!(fired.load(Ordering::SeqCst), 1);
    assert!(!timer.is_active());
    assert_eq!(looper.active_timer_count(), 0);
}

#[test]
fn test_periodic_fires_until_cancelled() {
    let looper = Looper::new();
    let ticks = Arc::new(AtomicI32::new(0));

    let t = ticks.clone();
    let timer = looper.add_periodic_timer(
        move || {
            t.fetch_add(1, Ordering::SeqCst);
        },
        50,
    );

    thread::sleep(Duration::from_millis(260));
    timer.cancel();
    let at_cancel = ticks.load(Ordering::SeqCst);
    assert!(
        (4..=6).contains(&at_cancel),
        "expected 4..=6 ticks, got {at_cancel}"
    );

    thread::sleep(Duration::from_millis(100));
    assert_eq!(ticks.load(Ordering::SeqCst), at_cancel);
    assert!(!timer.is_active());
}

#[test]
fn test_cancel_is_idempotent() {
    let looper = Looper::new();
    let timer = looper.add_timer(|| {}, 5_000);
    assert!(timer.is_active());
    timer.cancel();
    timer.cancel();
    assert!(!timer.is_active());
    assert_eq!(looper.active_timer_count(), 0);
}

#[test]
fn test_moved_handle_keeps_cancel_obligation() {
    let looper = Looper::new();
    let fired = Arc::new(AtomicI32::new(0));

    let f = fired.clone();
    let timer = looper.add_timer(
        move || {
            f.fetch_add(1, Ordering::SeqCst);
        },
        120,
    );
    let id = timer.id();

    // Move into a new binding and cancel through it.
    let moved: TimerHandle = timer;
    assert_eq!(moved.id(), id);
    assert!(moved.is_active());
    moved.cancel();

    thread::sleep(Duration::from_millis(250));
    assert_eq!(fired.load(Ordering::SeqCst), 0);
}

#[test]
fn test_move_into_container_preserves_timer() {
    let looper = Looper::new();
    let fired = Arc::new(AtomicI32::new(0));

    let f = fired.clone();
    let mut slots: Vec<TimerHandle> = Vec::new();
    slots.push(looper.add_timer(
        move || {
            f.fetch_add(1, Ordering::SeqCst);
        },
        60,
    ));

    thread::sleep(Duration::from_millis(180));
    assert_eq!(fired.load(Ordering::SeqCst), 1);
    slots.clear();
}

#[test]
fn test_restart_postpones_pending_one_shot() {
    let looper = Looper::new();
    let fired = Arc::new(AtomicI32::new(0));

    let f = fired.clone();
    let timer = looper.add_timer(
        move || {
            f.fetch_add(1, Ordering::SeqCst);
        },
        5_000,
    );
    assert!(timer.restart(60));

    thread::sleep(Duration::from_millis(200));
    assert_eq!(fired.load(Ordering::SeqCst), 1);
}

#[test]
fn test_restart_converts_periodic_to_one_shot() {
    let looper = Looper::new();
    let ticks = Arc::new(AtomicI32::new(0));

    let t = ticks.clone();
    let timer = looper.add_periodic_timer(
        move || {
            t.fetch_add(1, Ordering::SeqCst);
        },
        40,
    );
    assert!(timer.restart(40));

    thread::sleep(Duration::from_millis(250));
    assert_eq!(ticks.load(Ordering::SeqCst), 1);
}

#[test]
fn test_restart_after_cancel_fails() {
    let looper = Looper::new();
    let timer = looper.add_timer(|| {}, 1_000);
    timer.cancel();
    assert!(!timer.restart(50));
}

#[test]
fn test_timer_callback_runs_on_loop_thread() {
    let looper = Looper::new();
    let loop_id = looper.post(|| thread::current().id()).wait().unwrap();
    let on_loop = Arc::new(AtomicBool::new(false));

    let flag = on_loop.clone();
    let _timer = looper.add_timer(
        move || {
            flag.store(thread::current().id() == loop_id, Ordering::SeqCst);
        },
        40,
    );
    thread::sleep(Duration::from_millis(150));
    assert!(on_loop.load(Ordering::SeqCst));
}

#[test]
fn test_duration_flavors() {
    let looper = Looper::new();
    let fired = Arc::new(AtomicI32::new(0));

    let f = fired.clone();
    let _one_shot = looper.add_timer_after(
        move || {
            f.fetch_add(1, Ordering::SeqCst);
        },
        Duration::from_millis(40),
    );
    let f = fired.clone();
    let periodic = looper.add_periodic_timer_every(
        move || {
            f.fetch_add(10, Ordering::SeqCst);
        },
        Duration::from_millis(60),
    );

    thread::sleep(Duration::from_millis(160));
    periodic.cancel();
    let total = fired.load(Ordering::SeqCst);
    assert!(total >= 11, "one-shot and at least one periodic tick: {total}");
}

#[test]
fn test_looper_drop_cancels_live_timers() {
    let fired = Arc::new(AtomicI32::new(0));
    {
        let looper = Looper::new();
        let f = fired.clone();
        let _timer = looper.add_timer(
            move || {
                f.fetch_add(1, Ordering::SeqCst);
            },
            150,
        );
        assert_eq!(looper.active_timer_count(), 1);
        // Looper drops here; the hub must tear the timer down first.
    }
    thread::sleep(Duration::from_millis(300));
    assert_eq!(fired.load(Ordering::SeqCst), 0);
}

#[test]
fn test_active_timer_count_tracks_lifecycle() {
    let looper = Looper::new();
    assert_eq!(looper.active_timer_count(), 0);

    let a = looper.add_timer(|| {}, 5_000);
    let b = looper.add_periodic_timer(|| {}, 5_000);
    assert_eq!(looper.active_timer_count(), 2);

    a.cancel();
    assert_eq!(looper.active_timer_count(), 1);
    drop(b);
    assert_eq!(looper.active_timer_count(), 0);
}

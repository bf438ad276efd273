//! Idle heuristic, driven by hand and through a live engine timer.

mod common;

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use common::{new_engine, test_config};
use openworkers_native_engine::idle::{GcRequester, IdleMonitor};
use openworkers_native_engine::{GcKind, IdleConfig, LoopMode};

#[derive(Default)]
struct Recorder(AtomicU64);

impl Recorder {
    fn count(&self) -> u64 {
        self.0.load(Ordering::SeqCst)
    }
}

impl GcRequester for Recorder {
    fn request_full_gc(&self) {
        self.0.fetch_add(1, Ordering::SeqCst);
    }
}

fn foreground() -> IdleConfig {
    IdleConfig {
        start_in_background: false,
        ..IdleConfig::default()
    }
}

#[test]
fn test_high_ratio_triggers_once_then_cools_down() {
    let monitor = IdleMonitor::new(foreground(), 0);
    let recorder = Recorder::default();

    // Idle for the whole run.
    monitor.notify_looper_idle_start(0, 0);

    let next = monitor.interval_monitor(1_000, &recorder);
    assert_eq!(next, Duration::from_secs(1));
    assert_eq!(recorder.count(), 0);

    let next = monitor.interval_monitor(2_000, &recorder);
    assert_eq!(next, Duration::from_secs(90));
    assert_eq!(recorder.count(), 1);

    // Still idle, but inside the cooldown.
    for tick in 3..=91 {
        monitor.interval_monitor(tick * 1_000, &recorder);
    }
    assert_eq!(recorder.count(), 1);

    monitor.interval_monitor(92_000, &recorder);
    assert_eq!(recorder.count(), 2);
    assert_eq!(monitor.trigger_count(), 2);
}

#[test]
fn test_busy_loop_never_triggers_in_foreground() {
    let monitor = IdleMonitor::new(foreground(), 0);
    let recorder = Recorder::default();

    for tick in 1..=30i64 {
        // 10% idle per second.
        let start = tick * 1_000 - 1_000;
        monitor.notify_looper_idle_start(start, 1_000);
        monitor.notify_looper_idle_end(start + 100);
        monitor.interval_monitor(tick * 1_000, &recorder);
    }

    assert_eq!(recorder.count(), 0);
}

#[test]
fn test_quiet_background_engine_triggers() {
    let monitor = IdleMonitor::new(IdleConfig::default(), 0);
    let recorder = Recorder::default();
    assert!(monitor.is_in_background());

    for tick in 1..=4 {
        monitor.interval_monitor(tick * 1_000, &recorder);
    }
    assert_eq!(recorder.count(), 0);

    monitor.interval_monitor(5_000, &recorder);
    assert_eq!(recorder.count(), 1);
}

#[test]
fn test_chatty_background_engine_does_not_trigger() {
    let monitor = IdleMonitor::new(IdleConfig::default(), 0);
    let recorder = Recorder::default();

    for tick in 1..=20i64 {
        // Many short waits per tick: notify count stays above the threshold.
        for _ in 0..5 {
            monitor.notify_looper_idle_start(tick * 1_000 - 10, 0);
            monitor.notify_looper_idle_end(tick * 1_000 - 9);
        }
        monitor.interval_monitor(tick * 1_000, &recorder);
    }

    assert_eq!(recorder.count(), 0);
}

#[test]
fn test_engine_timer_requests_collection() {
    let idle = IdleConfig {
        idle_monitoring_interval: Duration::from_millis(10),
        sleep_monitoring_interval: Duration::from_secs(60),
        idle_inbackground_check_length: 1,
        ..IdleConfig::default()
    };
    let config = test_config().with_idle_monitor(true).with_idle(idle);
    let (mut engine, _registry) = new_engine(config);
    let handle = engine.handle();

    // Keep the loop alive until the monitor's request wakes it.
    handle.increase_waiting_requests();
    while engine.runtime().gc_count() == 0 {
        engine.run_loop(LoopMode::Once).unwrap();
    }
    handle.decrease_waiting_requests();

    assert_eq!(engine.idle_snapshot().trigger_count, 1);
    assert_eq!(engine.runtime().gc_count(), 1);
}

#[test]
fn test_handle_requests_coalesce() {
    let (mut engine, _registry) = new_engine(test_config());
    let handle = engine.handle();

    handle.request_collection(GcKind::Idle);
    handle.request_collection(GcKind::Full);
    handle.request_collection(GcKind::Idle);
    engine.run_loop(LoopMode::NoWait).unwrap();

    assert_eq!(engine.runtime().gc_count(), 1);
}

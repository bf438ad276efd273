//! Idle monitor: decides when the loop is quiet enough for a full collection.

use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use std::time::Duration;

use super::ring_buffer::RingBuffer;
use crate::config::IdleConfig;

/// Receiver of the monitor's collection requests.
///
/// Called from the monitor's timer thread, so implementations must only
/// touch thread-safe state.
pub trait GcRequester {
    fn request_full_gc(&self);
}

/// Rolling statistics, reset together on every trigger.
struct IdleStats {
    start_record_timestamp: i64,
    last_full_gc: Option<i64>,
    low_idle_notify_cycles: usize,
    high_idle_ratio_count: u32,
    recorded_notify_counts: RingBuffer<i64>,
}

/// Point-in-time view of the monitor, for diagnostics and tests.
#[derive(Debug, Clone, PartialEq)]
pub struct IdleSnapshot {
    pub idle: bool,
    pub in_background: bool,
    /// Idle notifications since the last tick
    pub idle_notify_count: i64,
    pub total_idle_duration_ms: i64,
    pub low_idle_notify_cycles: usize,
    pub high_idle_ratio_count: u32,
    /// Per-tick idle notify counts, oldest first
    pub recorded_notify_counts: Vec<i64>,
    pub last_idle_budget_micros: u64,
    pub trigger_count: u64,
}

/// Tracks loop idleness and asks for a full collection when it is cheap.
///
/// Flags and counters fed by the loop thread are atomics; the rolling window
/// is only touched by the periodic tick and guarded by a mutex.
pub struct IdleMonitor {
    config: IdleConfig,
    idle_state: AtomicBool,
    in_background: AtomicBool,
    idle_notify_count: AtomicI64,
    notify_timestamp: AtomicI64,
    total_idle_duration: AtomicI64,
    last_idle_budget_micros: AtomicU64,
    trigger_count: AtomicU64,
    stats: Mutex<IdleStats>,
}

impl IdleMonitor {
    pub fn new(config: IdleConfig, now_ms: i64) -> Self {
        let window = RingBuffer::new(config.idle_check_interval_length);
        let in_background = config.start_in_background;

        Self {
            config,
            idle_state: AtomicBool::new(false),
            in_background: AtomicBool::new(in_background),
            idle_notify_count: AtomicI64::new(0),
            notify_timestamp: AtomicI64::new(0),
            total_idle_duration: AtomicI64::new(0),
            last_idle_budget_micros: AtomicU64::new(0),
            trigger_count: AtomicU64::new(0),
            stats: Mutex::new(IdleStats {
                start_record_timestamp: now_ms,
                last_full_gc: None,
                low_idle_notify_cycles: 0,
                high_idle_ratio_count: 0,
                recorded_notify_counts: window,
            }),
        }
    }

    pub fn config(&self) -> &IdleConfig {
        &self.config
    }

    #[inline]
    pub fn is_idle(&self) -> bool {
        self.idle_state.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn is_in_background(&self) -> bool {
        self.in_background.load(Ordering::Relaxed)
    }

    /// Number of collections this monitor has requested.
    pub fn trigger_count(&self) -> u64 {
        self.trigger_count.load(Ordering::Relaxed)
    }

    /// The loop is about to block for up to `idle_budget_micros`.
    pub fn notify_looper_idle_start(&self, timestamp_ms: i64, idle_budget_micros: u64) {
        self.notify_timestamp.store(timestamp_ms, Ordering::Relaxed);
        self.last_idle_budget_micros
            .store(idle_budget_micros, Ordering::Relaxed);
        self.idle_state.store(true, Ordering::Relaxed);
    }

    /// The loop resumed. An end without a matching start is ignored.
    pub fn notify_looper_idle_end(&self, timestamp_ms: i64) {
        if !self.idle_state.swap(false, Ordering::Relaxed) {
            return;
        }

        let started = self.notify_timestamp.load(Ordering::Relaxed);
        let duration = (timestamp_ms - started).max(0);
        self.total_idle_duration
            .fetch_add(duration, Ordering::Relaxed);
        self.idle_notify_count.fetch_add(1, Ordering::Relaxed);
    }

    pub fn notify_change_background_state(&self, in_background: bool) {
        let previous = self.in_background.swap(in_background, Ordering::Relaxed);
        if previous == in_background {
            return;
        }

        log::debug!(
            "Idle monitor: application moved to {}",
            if in_background {
                "background"
            } else {
                "foreground"
            }
        );
        // Low-notify cycles are judged against a state-specific length.
        self.lock_stats().low_idle_notify_cycles = 0;
    }

    /// Periodic tick.
    ///
    /// Folds the tick's notify count into the window, updates the
    /// high-ratio streak and runs the trigger decision. Returns the delay
    /// before the next tick.
    pub fn interval_monitor(&self, now_ms: i64, requester: &dyn GcRequester) -> Duration {
        let mut stats = self.lock_stats();

        let notify_count = self.idle_notify_count.swap(0, Ordering::Relaxed);
        stats.recorded_notify_counts.push(notify_count);

        let ratio = self.idle_ratio_locked(&stats, now_ms);
        if ratio > self.config.idle_ratio {
            stats.high_idle_ratio_count += 1;
        } else {
            stats.high_idle_ratio_count = 0;
        }

        tracing::trace!(
            "Idle tick: ratio={:.4}, notifies={}, high_streak={}, low_cycles={}",
            ratio,
            notify_count,
            stats.high_idle_ratio_count,
            stats.low_idle_notify_cycles
        );

        if self.should_try_trigger_gc_locked(&mut stats, now_ms) {
            self.trigger_locked(&mut stats, now_ms, requester);
            return self.config.sleep_monitoring_interval;
        }

        self.config.idle_monitoring_interval
    }

    /// Decision step of the heuristic.
    ///
    /// A positive decision triggers right away: the window resets, the
    /// cooldown starts and `requester` is asked for a full collection, so a
    /// second call returns false until the cooldown elapsed. A declined
    /// decision counts as one more low-idle-notify cycle.
    pub fn should_try_trigger_gc(&self, now_ms: i64, requester: &dyn GcRequester) -> bool {
        let mut stats = self.lock_stats();
        if !self.should_try_trigger_gc_locked(&mut stats, now_ms) {
            return false;
        }
        self.trigger_locked(&mut stats, now_ms, requester);
        true
    }

    /// Whether recent ticks saw few idle notifications for long enough.
    ///
    /// The required number of cycles depends on the background flag.
    pub fn check_low_notify_state(&self) -> bool {
        let stats = self.lock_stats();
        self.check_low_notify_state_locked(&stats)
    }

    /// Ratio of idle time to wall time since the last reset, counting an
    /// idle span still in progress.
    pub fn idle_ratio(&self, now_ms: i64) -> f64 {
        let stats = self.lock_stats();
        self.idle_ratio_locked(&stats, now_ms)
    }

    /// Reset the rolling window and counters, starting a new measurement at
    /// `now_ms`.
    pub fn clear_idle_stats(&self, now_ms: i64) {
        let mut stats = self.lock_stats();
        self.clear_idle_stats_locked(&mut stats, now_ms);
    }

    pub fn snapshot(&self) -> IdleSnapshot {
        let stats = self.lock_stats();
        IdleSnapshot {
            idle: self.is_idle(),
            in_background: self.is_in_background(),
            idle_notify_count: self.idle_notify_count.load(Ordering::Relaxed),
            total_idle_duration_ms: self.total_idle_duration.load(Ordering::Relaxed),
            low_idle_notify_cycles: stats.low_idle_notify_cycles,
            high_idle_ratio_count: stats.high_idle_ratio_count,
            recorded_notify_counts: stats.recorded_notify_counts.iter().copied().collect(),
            last_idle_budget_micros: self.last_idle_budget_micros.load(Ordering::Relaxed),
            trigger_count: self.trigger_count(),
        }
    }

    fn lock_stats(&self) -> std::sync::MutexGuard<'_, IdleStats> {
        self.stats.lock().expect("idle monitor stats poisoned")
    }

    fn should_try_trigger_gc_locked(&self, stats: &mut IdleStats, now_ms: i64) -> bool {
        if let Some(last) = stats.last_full_gc {
            let cooldown = duration_ms(self.config.min_trigger_fullgc_interval);
            if now_ms - last < cooldown {
                return false;
            }
        }

        if stats.high_idle_ratio_count >= self.config.double_interval_check {
            return true;
        }

        if self.is_in_background() && self.check_low_notify_state_locked(stats) {
            return true;
        }

        stats.low_idle_notify_cycles += 1;
        false
    }

    fn check_low_notify_state_locked(&self, stats: &IdleStats) -> bool {
        let required = if self.is_in_background() {
            self.config.idle_inbackground_check_length
        } else {
            self.config.idle_check_length
        };

        stats.low_idle_notify_cycles >= required
            && stats.recorded_notify_counts.sum(0, |acc, n| acc + n)
                < self.config.low_idle_notify_threshold
    }

    fn idle_ratio_locked(&self, stats: &IdleStats, now_ms: i64) -> f64 {
        let elapsed = now_ms - stats.start_record_timestamp;
        if elapsed <= 0 {
            return 0.0;
        }

        let mut idle = self.total_idle_duration.load(Ordering::Relaxed);
        if self.is_idle() {
            let started = self
                .notify_timestamp
                .load(Ordering::Relaxed)
                .max(stats.start_record_timestamp);
            idle += (now_ms - started).max(0);
        }

        (idle as f64 / elapsed as f64).min(1.0)
    }

    fn clear_idle_stats_locked(&self, stats: &mut IdleStats, now_ms: i64) {
        stats.start_record_timestamp = now_ms;
        stats.low_idle_notify_cycles = 0;
        stats.high_idle_ratio_count = 0;
        stats.recorded_notify_counts.reset();
        self.total_idle_duration.store(0, Ordering::Relaxed);
        self.idle_notify_count.store(0, Ordering::Relaxed);
    }

    fn trigger_locked(&self, stats: &mut IdleStats, now_ms: i64, requester: &dyn GcRequester) {
        self.clear_idle_stats_locked(stats, now_ms);
        stats.last_full_gc = Some(now_ms);
        let count = self.trigger_count.fetch_add(1, Ordering::Relaxed) + 1;

        log::info!(
            "Idle monitor requesting full collection (#{}, background={})",
            count,
            self.is_in_background()
        );
        requester.request_full_gc();
    }
}

fn duration_ms(d: Duration) -> i64 {
    i64::try_from(d.as_millis()).unwrap_or(i64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Recorder(AtomicU64);

    impl GcRequester for Recorder {
        fn request_full_gc(&self) {
            self.0.fetch_add(1, Ordering::Relaxed);
        }
    }

    fn foreground() -> IdleConfig {
        IdleConfig {
            start_in_background: false,
            ..IdleConfig::default()
        }
    }

    #[test]
    fn test_idle_start_end_accumulates() {
        let monitor = IdleMonitor::new(foreground(), 0);
        monitor.notify_looper_idle_start(100, 5_000);
        assert!(monitor.is_idle());
        monitor.notify_looper_idle_end(150);
        assert!(!monitor.is_idle());

        let snap = monitor.snapshot();
        assert_eq!(snap.total_idle_duration_ms, 50);
        assert_eq!(snap.idle_notify_count, 1);
        assert_eq!(snap.last_idle_budget_micros, 5_000);
    }

    #[test]
    fn test_unmatched_idle_end_is_ignored() {
        let monitor = IdleMonitor::new(foreground(), 0);
        monitor.notify_looper_idle_end(10);
        assert_eq!(monitor.snapshot().idle_notify_count, 0);
    }

    #[test]
    fn test_idle_ratio_counts_in_progress_span() {
        let monitor = IdleMonitor::new(foreground(), 0);
        monitor.notify_looper_idle_start(0, 0);
        assert!((monitor.idle_ratio(1_000) - 1.0).abs() < 1e-9);

        monitor.notify_looper_idle_end(500);
        assert!((monitor.idle_ratio(1_000) - 0.5).abs() < 1e-9);
    }

    #[test]
    fn test_declined_decision_counts_low_cycle() {
        let monitor = IdleMonitor::new(foreground(), 0);
        let recorder = Recorder(AtomicU64::new(0));
        assert!(!monitor.should_try_trigger_gc(1_000, &recorder));
        assert!(!monitor.should_try_trigger_gc(2_000, &recorder));
        assert_eq!(monitor.snapshot().low_idle_notify_cycles, 2);
    }

    #[test]
    fn test_foreground_low_notify_needs_longer_history() {
        let monitor = IdleMonitor::new(foreground(), 0);
        let recorder = Recorder(AtomicU64::new(0));

        for tick in 1..=5 {
            monitor.interval_monitor(tick * 1_000, &recorder);
        }
        assert!(!monitor.check_low_notify_state());

        for tick in 6..=20 {
            monitor.interval_monitor(tick * 1_000, &recorder);
        }
        // Enough quiet cycles, but only backgrounded engines trigger on it.
        assert!(monitor.check_low_notify_state());
        assert_eq!(recorder.0.load(Ordering::Relaxed), 0);
    }

    #[test]
    fn test_background_switch_resets_low_cycles() {
        let monitor = IdleMonitor::new(foreground(), 0);
        monitor.should_try_trigger_gc(1_000, &Recorder(AtomicU64::new(0)));
        monitor.notify_change_background_state(true);
        assert!(monitor.is_in_background());
        assert_eq!(monitor.snapshot().low_idle_notify_cycles, 0);
    }

    #[test]
    fn test_positive_decision_triggers_once_per_cooldown() {
        let config = IdleConfig {
            double_interval_check: 0,
            ..foreground()
        };
        let monitor = IdleMonitor::new(config, 0);
        let recorder = Recorder(AtomicU64::new(0));

        assert!(monitor.should_try_trigger_gc(1_000, &recorder));
        assert!(!monitor.should_try_trigger_gc(1_001, &recorder));
        assert!(!monitor.should_try_trigger_gc(1_002, &recorder));
        assert_eq!(recorder.0.load(Ordering::Relaxed), 1);
        assert_eq!(monitor.trigger_count(), 1);

        // Cooldown measured from the trigger.
        assert!(!monitor.should_try_trigger_gc(90_999, &recorder));
        assert!(monitor.should_try_trigger_gc(91_000, &recorder));
        assert_eq!(recorder.0.load(Ordering::Relaxed), 2);
    }

    #[test]
    fn test_clear_idle_stats() {
        let monitor = IdleMonitor::new(foreground(), 0);
        let recorder = Recorder(AtomicU64::new(0));
        monitor.notify_looper_idle_start(0, 0);
        monitor.notify_looper_idle_end(10);
        monitor.interval_monitor(1_000, &recorder);

        monitor.clear_idle_stats(2_000);
        let snap = monitor.snapshot();
        assert!(snap.recorded_notify_counts.is_empty());
        assert_eq!(snap.total_idle_duration_ms, 0);
        assert_eq!(snap.low_idle_notify_cycles, 0);
    }
}

//! Engine configuration.
//!
//! Defaults mirror the values the idle heuristic was tuned with; every
//! threshold can be overridden since none of them is structural.

use std::time::Duration;

// ============================================================================
// Defaults
// ============================================================================

/// Default number of native worker threads per engine
pub const DEFAULT_WORKER_THREADS: usize = 4;

/// Default maximum number of queued (not yet executing) work items
pub const DEFAULT_MAX_QUEUED_WORK: usize = 1024;

/// Monitoring cycles needed before a low-notify decision in the foreground
pub const IDLE_CHECK_LENGTH: usize = 15;

/// Monitoring cycles needed before a low-notify decision in the background
pub const IDLE_INBACKGROUND_CHECK_LENGTH: usize = 4;

/// Capacity of the idle-notify ring buffer
pub const IDLE_CHECK_INTERVAL_LENGTH: usize = 5;

/// Minimum time between two triggered full collections
pub const MIN_TRIGGER_FULLGC_INTERVAL: Duration = Duration::from_secs(90);

/// Idle notifications over the window below which the loop counts as quiet
pub const LOW_IDLE_NOTIFY_THRESHOLD: i64 = 10;

/// Period of the monitor tick
pub const IDLE_MONITORING_INTERVAL: Duration = Duration::from_secs(1);

/// Period of the monitor tick right after a collection was triggered
pub const SLEEP_MONITORING_INTERVAL: Duration = Duration::from_secs(90);

/// Smallest idle window worth an idle-time collection
pub const MIN_TRIGGER_GC_IDLE_INTERVAL: Duration = Duration::from_millis(30);

/// Idle ratio above which an interval counts as "confidently idle"
pub const IDLE_RATIO: f64 = 0.985;

/// Consecutive high-ratio intervals required to trigger
pub const DOUBLE_INTERVAL_CHECK: u32 = 2;

const ENV_WORKER_THREADS: &str = "NATIVE_ENGINE_WORKER_THREADS";
const ENV_MAX_QUEUED_WORK: &str = "NATIVE_ENGINE_MAX_QUEUED_WORK";
const ENV_IDLE_MONITOR: &str = "NATIVE_ENGINE_IDLE_MONITOR";

// ============================================================================
// Idle heuristic
// ============================================================================

/// Thresholds of the idle collection heuristic.
#[derive(Debug, Clone, PartialEq)]
pub struct IdleConfig {
    /// Low-notify cycles required while in the foreground
    pub idle_check_length: usize,
    /// Low-notify cycles required while in the background
    pub idle_inbackground_check_length: usize,
    /// Ring buffer capacity (number of recent ticks summed)
    pub idle_check_interval_length: usize,
    /// Cooldown between two triggered full collections
    pub min_trigger_fullgc_interval: Duration,
    /// Ring buffer sum below which the loop is considered quiet
    pub low_idle_notify_threshold: i64,
    /// Regular tick period
    pub idle_monitoring_interval: Duration,
    /// Tick period after a trigger
    pub sleep_monitoring_interval: Duration,
    /// Minimum idle window for an idle-time collection
    pub min_trigger_gc_idle_interval: Duration,
    /// High idle ratio threshold (exclusive)
    pub idle_ratio: f64,
    /// Consecutive high-ratio ticks required
    pub double_interval_check: u32,
    /// Initial background flag. Hosts report foreground explicitly.
    pub start_in_background: bool,
}

impl Default for IdleConfig {
    fn default() -> Self {
        Self {
            idle_check_length: IDLE_CHECK_LENGTH,
            idle_inbackground_check_length: IDLE_INBACKGROUND_CHECK_LENGTH,
            idle_check_interval_length: IDLE_CHECK_INTERVAL_LENGTH,
            min_trigger_fullgc_interval: MIN_TRIGGER_FULLGC_INTERVAL,
            low_idle_notify_threshold: LOW_IDLE_NOTIFY_THRESHOLD,
            idle_monitoring_interval: IDLE_MONITORING_INTERVAL,
            sleep_monitoring_interval: SLEEP_MONITORING_INTERVAL,
            min_trigger_gc_idle_interval: MIN_TRIGGER_GC_IDLE_INTERVAL,
            idle_ratio: IDLE_RATIO,
            double_interval_check: DOUBLE_INTERVAL_CHECK,
            start_in_background: true,
        }
    }
}

// ============================================================================
// Engine
// ============================================================================

/// Configuration for one [`Engine`](crate::Engine).
#[derive(Debug, Clone, PartialEq)]
pub struct EngineConfig {
    /// Native worker threads executing async work
    pub worker_threads: usize,
    /// Maximum queued work items (backpressure)
    /// When the queue is full, new work is refused with `QueueFull`
    pub max_queued_work: usize,
    /// Spawn the idle monitor timer thread
    pub enable_idle_monitor: bool,
    /// Idle heuristic thresholds
    pub idle: IdleConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            worker_threads: DEFAULT_WORKER_THREADS,
            max_queued_work: DEFAULT_MAX_QUEUED_WORK,
            enable_idle_monitor: true,
            idle: IdleConfig::default(),
        }
    }
}

impl EngineConfig {
    /// Defaults, overridden by `NATIVE_ENGINE_*` environment variables.
    ///
    /// Unparsable values are ignored with a warning.
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Some(threads) = env_parse::<usize>(ENV_WORKER_THREADS) {
            config.worker_threads = threads;
        }

        if let Some(max) = env_parse::<usize>(ENV_MAX_QUEUED_WORK) {
            config.max_queued_work = max;
        }

        if let Some(enabled) = env_parse::<bool>(ENV_IDLE_MONITOR) {
            config.enable_idle_monitor = enabled;
        }

        log::info!(
            "Engine config: worker_threads={}, max_queued_work={}, idle_monitor={}",
            config.worker_threads,
            config.max_queued_work,
            config.enable_idle_monitor
        );

        config
    }

    pub fn with_worker_threads(mut self, threads: usize) -> Self {
        self.worker_threads = threads;
        self
    }

    pub fn with_max_queued_work(mut self, max: usize) -> Self {
        self.max_queued_work = max;
        self
    }

    pub fn with_idle_monitor(mut self, enabled: bool) -> Self {
        self.enable_idle_monitor = enabled;
        self
    }

    pub fn with_idle(mut self, idle: IdleConfig) -> Self {
        self.idle = idle;
        self
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    let raw = std::env::var(key).ok()?;

    match raw.trim().parse::<T>() {
        Ok(value) => Some(value),
        Err(_) => {
            log::warn!("Ignoring invalid value for {}: {:?}", key, raw);
            None
        }
    }
}

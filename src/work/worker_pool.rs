//! Native worker pool executing jobs off the runtime thread.
//!
//! Features:
//! - Fixed set of named worker threads per engine
//! - Priority lanes (QoS), FIFO within a lane
//! - Bounded queue with backpressure (`QueueFull`)
//! - Shutdown abandons queued jobs instead of running them

use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread;

use crate::error::{EngineError, Result};

// ============================================================================
// Jobs
// ============================================================================

/// Scheduling priority of a job. Higher variants are dequeued first.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Qos {
    Background,
    Utility,
    #[default]
    Default,
    UserInitiated,
}

impl Qos {
    const LANES: usize = 4;

    fn lane(self) -> usize {
        self as usize
    }
}

/// Unit of work handed to the pool.
pub trait Job: Send + 'static {
    /// Run on a worker thread.
    fn run(self: Box<Self>);

    /// Called instead of `run` when the pool shuts down before the job was
    /// picked up.
    fn abandon(self: Box<Self>);

    /// A cancelled job no longer needs a worker and may be dropped from the
    /// queue without running.
    fn is_cancelled(&self) -> bool {
        false
    }
}

// ============================================================================
// Configuration
// ============================================================================

/// Configuration for a worker pool
#[derive(Clone, Debug)]
pub struct PoolConfig {
    /// Number of worker threads (at least one is spawned)
    pub threads: usize,
    /// Maximum jobs waiting in queue (backpressure)
    /// When the queue is full, new jobs are refused
    pub max_queued: usize,
    /// Thread name prefix, suffixed with the worker index
    pub name_prefix: String,
}

// ============================================================================
// Pool
// ============================================================================

struct PoolQueue {
    lanes: [VecDeque<Box<dyn Job>>; Qos::LANES],
    len: usize,
    shutdown: bool,
}

impl PoolQueue {
    fn pop(&mut self) -> Option<Box<dyn Job>> {
        let job = self.lanes.iter_mut().rev().find_map(|lane| lane.pop_front())?;
        self.len -= 1;
        Some(job)
    }

    fn drain(&mut self) -> Vec<Box<dyn Job>> {
        self.len = 0;
        self.lanes
            .iter_mut()
            .rev()
            .flat_map(|lane| lane.drain(..))
            .collect()
    }

    /// Drop cancelled jobs, returning how many were removed.
    fn purge_cancelled(&mut self) -> usize {
        for lane in &mut self.lanes {
            lane.retain(|job| !job.is_cancelled());
        }
        let len = self.lanes.iter().map(VecDeque::len).sum();
        let purged = self.len - len;
        self.len = len;
        purged
    }
}

#[derive(Default)]
struct PoolCounters {
    submitted: AtomicUsize,
    rejected: AtomicUsize,
    completed: AtomicUsize,
    abandoned: AtomicUsize,
    running: AtomicUsize,
}

struct PoolShared {
    queue: Mutex<PoolQueue>,
    available: Condvar,
    counters: PoolCounters,
    max_queued: usize,
}

impl PoolShared {
    fn lock_queue(&self) -> std::sync::MutexGuard<'_, PoolQueue> {
        self.queue.lock().expect("worker pool queue poisoned")
    }
}

/// Statistics for a worker pool
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolStats {
    /// Worker threads spawned
    pub threads: usize,
    /// Jobs currently waiting
    pub queued: usize,
    /// Jobs currently running
    pub running: usize,
    pub submitted: usize,
    pub rejected: usize,
    pub completed: usize,
    pub abandoned: usize,
}

/// Fixed-size pool of native worker threads.
pub struct WorkerPool {
    shared: Arc<PoolShared>,
    threads: Vec<thread::JoinHandle<()>>,
}

impl WorkerPool {
    pub fn new(config: PoolConfig) -> Result<Self> {
        let shared = Arc::new(PoolShared {
            queue: Mutex::new(PoolQueue {
                lanes: Default::default(),
                len: 0,
                shutdown: false,
            }),
            available: Condvar::new(),
            counters: PoolCounters::default(),
            max_queued: config.max_queued,
        });

        let mut pool = Self {
            shared,
            threads: Vec::new(),
        };

        let count = config.threads.max(1);
        for index in 0..count {
            let shared = pool.shared.clone();
            let handle = thread::Builder::new()
                .name(format!("{}-{}", config.name_prefix, index))
                .spawn(move || worker_loop(shared))
                .map_err(EngineError::ThreadSpawn)?;
            pool.threads.push(handle);
        }

        log::debug!(
            "Worker pool started: threads={}, max_queued={}",
            count,
            config.max_queued
        );
        Ok(pool)
    }

    /// Queue `job` on the `qos` lane.
    ///
    /// Fails with `QueueFull` when `max_queued` live jobs are already waiting
    /// and with `PoolShutDown` after [`WorkerPool::shutdown`]. Cancelled jobs
    /// still queued are purged before refusing. On failure the job is dropped
    /// without running.
    pub fn submit(&self, job: Box<dyn Job>, qos: Qos) -> Result<()> {
        let mut queue = self.shared.lock_queue();

        if queue.shutdown {
            self.shared.counters.rejected.fetch_add(1, Ordering::Relaxed);
            return Err(EngineError::PoolShutDown);
        }

        if queue.len >= self.shared.max_queued {
            let purged = queue.purge_cancelled();
            if purged > 0 {
                log::trace!("Purged {} cancelled jobs from a full queue", purged);
            }
        }

        if queue.len >= self.shared.max_queued {
            self.shared.counters.rejected.fetch_add(1, Ordering::Relaxed);
            log::warn!(
                "Work queue full ({}/{}), rejecting job",
                queue.len,
                self.shared.max_queued
            );
            return Err(EngineError::QueueFull(queue.len));
        }

        queue.lanes[qos.lane()].push_back(job);
        queue.len += 1;
        self.shared.counters.submitted.fetch_add(1, Ordering::Relaxed);
        drop(queue);

        self.shared.available.notify_one();
        Ok(())
    }

    /// Stop accepting jobs, abandon the queued ones and join the workers.
    ///
    /// Jobs already running finish first. Calling it again is a no-op.
    pub fn shutdown(&mut self) {
        let abandoned = {
            let mut queue = self.shared.lock_queue();
            if queue.shutdown && self.threads.is_empty() {
                return;
            }
            queue.shutdown = true;
            queue.drain()
        };
        self.shared.available.notify_all();

        if !abandoned.is_empty() {
            log::debug!("Abandoning {} queued jobs on shutdown", abandoned.len());
        }
        for job in abandoned {
            self.shared.counters.abandoned.fetch_add(1, Ordering::Relaxed);
            job.abandon();
        }

        for handle in self.threads.drain(..) {
            if let Err(e) = handle.join() {
                log::error!("Worker thread panicked: {:?}", e);
            }
        }
    }

    pub fn is_shut_down(&self) -> bool {
        self.shared.lock_queue().shutdown
    }

    pub fn stats(&self) -> PoolStats {
        let queued = self.shared.lock_queue().len;
        let counters = &self.shared.counters;

        PoolStats {
            threads: self.threads.len(),
            queued,
            running: counters.running.load(Ordering::Relaxed),
            submitted: counters.submitted.load(Ordering::Relaxed),
            rejected: counters.rejected.load(Ordering::Relaxed),
            completed: counters.completed.load(Ordering::Relaxed),
            abandoned: counters.abandoned.load(Ordering::Relaxed),
        }
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl fmt::Debug for WorkerPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkerPool")
            .field("stats", &self.stats())
            .finish()
    }
}

fn worker_loop(shared: Arc<PoolShared>) {
    loop {
        let job = {
            let mut queue = shared.lock_queue();
            loop {
                if queue.shutdown {
                    return;
                }
                if let Some(job) = queue.pop() {
                    break job;
                }
                queue = shared
                    .available
                    .wait(queue)
                    .expect("worker pool queue poisoned");
            }
        };

        shared.counters.running.fetch_add(1, Ordering::Relaxed);
        job.run();
        shared.counters.running.fetch_sub(1, Ordering::Relaxed);
        shared.counters.completed.fetch_add(1, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;
    use std::time::Duration;

    struct SendJob {
        tag: u32,
        tx: mpsc::Sender<(u32, bool)>,
    }

    impl Job for SendJob {
        fn run(self: Box<Self>) {
            let _ = self.tx.send((self.tag, true));
        }

        fn abandon(self: Box<Self>) {
            let _ = self.tx.send((self.tag, false));
        }
    }

    /// Blocks its worker until released.
    struct GateJob {
        started: mpsc::Sender<()>,
        release: mpsc::Receiver<()>,
    }

    impl Job for GateJob {
        fn run(self: Box<Self>) {
            let _ = self.started.send(());
            let _ = self.release.recv_timeout(Duration::from_secs(10));
        }

        fn abandon(self: Box<Self>) {}
    }

    /// Reports itself cancelled while `cancelled` is set.
    struct FlagJob {
        cancelled: Arc<std::sync::atomic::AtomicBool>,
        tx: mpsc::Sender<u32>,
    }

    impl Job for FlagJob {
        fn run(self: Box<Self>) {
            let _ = self.tx.send(1);
        }

        fn abandon(self: Box<Self>) {
            let _ = self.tx.send(0);
        }

        fn is_cancelled(&self) -> bool {
            self.cancelled.load(Ordering::SeqCst)
        }
    }

    fn config(threads: usize, max_queued: usize) -> PoolConfig {
        PoolConfig {
            threads,
            max_queued,
            name_prefix: "test-worker".into(),
        }
    }

    fn block_single_worker(pool: &WorkerPool) -> mpsc::Sender<()> {
        let (started_tx, started_rx) = mpsc::channel();
        let (release_tx, release_rx) = mpsc::channel();
        pool.submit(
            Box::new(GateJob {
                started: started_tx,
                release: release_rx,
            }),
            Qos::Default,
        )
        .unwrap();
        started_rx.recv_timeout(Duration::from_secs(5)).unwrap();
        release_tx
    }

    #[test]
    fn test_runs_submitted_jobs() {
        let pool = WorkerPool::new(config(2, 16)).unwrap();
        let (tx, rx) = mpsc::channel();
        for tag in 0..4 {
            pool.submit(Box::new(SendJob { tag, tx: tx.clone() }), Qos::Default)
                .unwrap();
        }

        let mut seen: Vec<u32> = (0..4)
            .map(|_| rx.recv_timeout(Duration::from_secs(5)).unwrap().0)
            .collect();
        seen.sort();
        assert_eq!(seen, vec![0, 1, 2, 3]);
    }

    #[test]
    fn test_higher_qos_runs_first() {
        let pool = WorkerPool::new(config(1, 16)).unwrap();
        let release = block_single_worker(&pool);

        let (tx, rx) = mpsc::channel();
        pool.submit(Box::new(SendJob { tag: 1, tx: tx.clone() }), Qos::Background)
            .unwrap();
        pool.submit(Box::new(SendJob { tag: 2, tx: tx.clone() }), Qos::Default)
            .unwrap();
        pool.submit(Box::new(SendJob { tag: 3, tx: tx.clone() }), Qos::UserInitiated)
            .unwrap();
        pool.submit(Box::new(SendJob { tag: 4, tx }), Qos::Default)
            .unwrap();
        release.send(()).unwrap();

        let order: Vec<u32> = (0..4)
            .map(|_| rx.recv_timeout(Duration::from_secs(5)).unwrap().0)
            .collect();
        assert_eq!(order, vec![3, 2, 4, 1]);
    }

    #[test]
    fn test_queue_full_rejects() {
        let pool = WorkerPool::new(config(1, 1)).unwrap();
        let release = block_single_worker(&pool);

        let (tx, _rx) = mpsc::channel();
        pool.submit(Box::new(SendJob { tag: 1, tx: tx.clone() }), Qos::Default)
            .unwrap();
        let err = pool
            .submit(Box::new(SendJob { tag: 2, tx }), Qos::Default)
            .unwrap_err();
        assert!(matches!(err, EngineError::QueueFull(1)));
        assert_eq!(pool.stats().rejected, 1);

        release.send(()).unwrap();
    }

    #[test]
    fn test_full_queue_purges_cancelled_jobs() {
        let pool = WorkerPool::new(config(1, 1)).unwrap();
        let release = block_single_worker(&pool);

        let cancelled = Arc::new(std::sync::atomic::AtomicBool::new(false));
        let (flag_tx, flag_rx) = mpsc::channel();
        pool.submit(
            Box::new(FlagJob {
                cancelled: cancelled.clone(),
                tx: flag_tx,
            }),
            Qos::Default,
        )
        .unwrap();

        // Live job still holds the slot.
        let (tx, rx) = mpsc::channel();
        assert!(matches!(
            pool.submit(Box::new(SendJob { tag: 1, tx: tx.clone() }), Qos::Default),
            Err(EngineError::QueueFull(1))
        ));

        cancelled.store(true, Ordering::SeqCst);
        pool.submit(Box::new(SendJob { tag: 2, tx }), Qos::Default)
            .unwrap();
        assert_eq!(pool.stats().queued, 1);

        release.send(()).unwrap();
        assert_eq!(rx.recv_timeout(Duration::from_secs(5)).unwrap(), (2, true));
        // Purged without running or abandoning.
        assert!(flag_rx.recv_timeout(Duration::from_millis(50)).is_err());
        assert_eq!(pool.stats().rejected, 1);
    }

    #[test]
    fn test_shutdown_abandons_queued_jobs() {
        let mut pool = WorkerPool::new(config(1, 16)).unwrap();
        let release = block_single_worker(&pool);

        let (tx, rx) = mpsc::channel();
        pool.submit(Box::new(SendJob { tag: 7, tx: tx.clone() }), Qos::Default)
            .unwrap();

        // Release the gate only once shutdown has drained the queue.
        let releaser = thread::spawn(move || {
            thread::sleep(Duration::from_millis(50));
            let _ = release.send(());
        });
        pool.shutdown();
        releaser.join().unwrap();

        assert_eq!(rx.recv_timeout(Duration::from_secs(5)).unwrap(), (7, false));
        assert!(pool.is_shut_down());
        assert!(matches!(
            pool.submit(Box::new(SendJob { tag: 8, tx }), Qos::Default),
            Err(EngineError::PoolShutDown)
        ));

        let stats = pool.stats();
        assert_eq!(stats.abandoned, 1);
        assert_eq!(stats.threads, 0);
    }
}

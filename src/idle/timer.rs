//! Periodic tick on a dedicated thread.
//!
//! The thread sleeps until the next deadline or until the timer is dropped.
//! Each tick returns the delay before the following one, so the period can
//! change from tick to tick.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc;
use std::thread;
use std::time::Duration;

use crate::error::{EngineError, Result};

/// RAII handle to a ticking thread. Dropping it cancels and joins the thread.
pub struct IntervalTimer {
    /// Channel to send cancellation signal to the timer thread
    cancel_tx: Option<mpsc::Sender<()>>,
    /// Handle to join the timer thread
    thread_handle: Option<thread::JoinHandle<()>>,
    /// Ticks fired so far
    ticks: Arc<AtomicU64>,
}

impl IntervalTimer {
    /// Spawn a timer thread named `name`.
    ///
    /// `tick` first runs after `initial_delay`; afterwards after whatever
    /// delay the previous call returned.
    pub fn spawn<F>(name: &str, initial_delay: Duration, mut tick: F) -> Result<Self>
    where
        F: FnMut() -> Duration + Send + 'static,
    {
        let (cancel_tx, cancel_rx) = mpsc::channel::<()>();
        let ticks = Arc::new(AtomicU64::new(0));
        let ticks_clone = ticks.clone();

        let thread_handle = thread::Builder::new()
            .name(name.into())
            .spawn(move || {
                let mut delay = initial_delay;

                loop {
                    match cancel_rx.recv_timeout(delay) {
                        Err(mpsc::RecvTimeoutError::Timeout) => {
                            ticks_clone.fetch_add(1, Ordering::Relaxed);
                            delay = tick();
                        }
                        // Cancelled, or the timer was dropped
                        Ok(()) | Err(mpsc::RecvTimeoutError::Disconnected) => break,
                    }
                }
            })
            .map_err(EngineError::ThreadSpawn)?;

        Ok(Self {
            cancel_tx: Some(cancel_tx),
            thread_handle: Some(thread_handle),
            ticks,
        })
    }

    pub fn ticks(&self) -> u64 {
        self.ticks.load(Ordering::Relaxed)
    }
}

impl Drop for IntervalTimer {
    fn drop(&mut self) {
        if let Some(cancel_tx) = self.cancel_tx.take() {
            // Ignore error if thread already exited
            let _ = cancel_tx.send(());
        }

        if let Some(handle) = self.thread_handle.take() {
            if let Err(e) = handle.join() {
                log::error!("Interval timer thread panicked: {:?}", e);
            }
        }
    }
}

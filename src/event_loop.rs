//! Engine event loop plumbing.
//!
//! Anything that must run on the runtime thread reaches it as a
//! [`LoopMessage`] through a [`LoopSender`]. The loop side is:
//!
//! 1. Drain the message channel without blocking
//! 2. Process the drained messages in batch
//! 3. Run the safepoint (pending collection requests)

use std::fmt;
use std::sync::{Arc, RwLock};

use tokio::sync::{Notify, mpsc};

use crate::error::{EngineError, Result};
use crate::work::WorkCompletion;

/// How [`Engine::run_loop`](crate::Engine::run_loop) runs.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum LoopMode {
    /// Run until nothing keeps the loop alive
    #[default]
    Default,
    /// Block for at least one message if the loop is alive, process, return
    Once,
    /// Process what is ready, never block
    NoWait,
}

pub(crate) enum LoopMessage {
    WorkDone(WorkCompletion),
    Wake,
}

impl fmt::Debug for LoopMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LoopMessage::WorkDone(c) => write!(f, "WorkDone({:?})", c.id),
            LoopMessage::Wake => f.write_str("Wake"),
        }
    }
}

/// Host hook invoked whenever the loop has something to process.
pub type PostTask = Arc<dyn Fn() + Send + Sync>;

/// Sends a loop message and tells the host through its post-task hook.
///
/// A message wakes the loop through the channel itself. The `Notify` is only
/// for flag-only wakes (collection requests, waiting-request changes), so a
/// delivered message never leaves a stale permit behind.
#[derive(Clone)]
pub(crate) struct LoopSender {
    tx: mpsc::UnboundedSender<LoopMessage>,
    notify: Arc<Notify>,
    post_task: Arc<RwLock<Option<PostTask>>>,
}

impl LoopSender {
    pub fn new(tx: mpsc::UnboundedSender<LoopMessage>) -> Self {
        Self {
            tx,
            notify: Arc::new(Notify::new()),
            post_task: Arc::new(RwLock::new(None)),
        }
    }

    /// Returns false when the loop side is gone.
    pub fn send(&self, msg: LoopMessage) -> bool {
        if self.tx.send(msg).is_err() {
            return false;
        }

        self.trigger_post_task();
        true
    }

    /// Wake a blocked loop without a message, after setting a flag the loop
    /// checks. Stores a permit if the loop is not waiting yet, so the wake
    /// is never lost.
    pub fn wake(&self) {
        self.notify.notify_one();
        self.trigger_post_task();
    }

    pub fn notify(&self) -> &Notify {
        &self.notify
    }

    pub fn set_post_task(&self, task: Option<PostTask>) {
        *self.post_task.write().expect("post task lock poisoned") = task;
    }

    pub fn trigger_post_task(&self) {
        let task = self
            .post_task
            .read()
            .expect("post task lock poisoned")
            .clone();

        if let Some(task) = task {
            task();
        }
    }
}

/// Something that can run the loop side.
pub(crate) trait EventLoopRuntime {
    fn loop_rx_mut(&mut self) -> &mut mpsc::UnboundedReceiver<LoopMessage>;

    fn process_message(&mut self, msg: LoopMessage);

    /// Service requests that were posted as flags rather than messages.
    /// Returns how many were serviced.
    fn safepoint(&mut self) -> usize;
}

/// Drain and process all pending messages, then run the safepoint.
///
/// `pending` may already hold messages received elsewhere (e.g. by a
/// blocking wait); they are processed first. Returns the number of messages
/// processed plus the number of requests serviced at the safepoint.
pub(crate) fn drain_and_process<R: EventLoopRuntime>(
    runtime: &mut R,
    pending: &mut Vec<LoopMessage>,
) -> Result<usize> {
    // 1. Drain without blocking
    let mut closed = false;
    loop {
        match runtime.loop_rx_mut().try_recv() {
            Ok(msg) => pending.push(msg),
            Err(mpsc::error::TryRecvError::Empty) => break,
            Err(mpsc::error::TryRecvError::Disconnected) => {
                closed = true;
                break;
            }
        }
    }

    // 2. Process in batch
    let processed = pending.len();
    for msg in pending.drain(..) {
        runtime.process_message(msg);
    }

    // 3. Safepoint
    let serviced = runtime.safepoint();

    if closed && processed == 0 {
        return Err(EngineError::Generic("Event loop channel closed".into()));
    }
    Ok(processed + serviced)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct FakeRuntime {
        rx: mpsc::UnboundedReceiver<LoopMessage>,
        processed: usize,
        safepoints: usize,
    }

    impl EventLoopRuntime for FakeRuntime {
        fn loop_rx_mut(&mut self) -> &mut mpsc::UnboundedReceiver<LoopMessage> {
            &mut self.rx
        }

        fn process_message(&mut self, _msg: LoopMessage) {
            self.processed += 1;
        }

        fn safepoint(&mut self) -> usize {
            self.safepoints += 1;
            0
        }
    }

    #[test]
    fn test_drain_processes_buffered_then_received() {
        let (tx, rx) = mpsc::unbounded_channel();
        let sender = LoopSender::new(tx);
        let mut runtime = FakeRuntime {
            rx,
            processed: 0,
            safepoints: 0,
        };

        assert!(sender.send(LoopMessage::Wake));
        assert!(sender.send(LoopMessage::Wake));
        let mut pending = vec![LoopMessage::Wake];

        assert_eq!(drain_and_process(&mut runtime, &mut pending).unwrap(), 3);
        assert_eq!(runtime.processed, 3);
        assert_eq!(runtime.safepoints, 1);
        assert!(pending.is_empty());

        assert_eq!(drain_and_process(&mut runtime, &mut pending).unwrap(), 0);
        assert_eq!(runtime.safepoints, 2);
    }

    #[test]
    fn test_closed_channel_is_an_error() {
        let (tx, rx) = mpsc::unbounded_channel();
        drop(tx);
        let mut runtime = FakeRuntime {
            rx,
            processed: 0,
            safepoints: 0,
        };

        assert!(drain_and_process(&mut runtime, &mut Vec::new()).is_err());
    }

    fn has_stored_permit(sender: &LoopSender) -> bool {
        let rt = tokio::runtime::Builder::new_current_thread()
            .build()
            .unwrap();
        rt.block_on(async {
            tokio::select! {
                biased;

                _ = sender.notify().notified() => true,
                _ = std::future::ready(()) => false,
            }
        })
    }

    #[test]
    fn test_message_leaves_no_wake_permit() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let sender = LoopSender::new(tx);

        assert!(sender.send(LoopMessage::Wake));
        assert!(rx.try_recv().is_ok());
        assert!(!has_stored_permit(&sender));

        // Flag-only wakes must not be lost.
        sender.wake();
        assert!(has_stored_permit(&sender));
        assert!(!has_stored_permit(&sender));
    }

    #[test]
    fn test_post_task_runs_on_send() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let sender = LoopSender::new(tx);
        let calls = Arc::new(AtomicUsize::new(0));
        let calls_clone = calls.clone();
        sender.set_post_task(Some(Arc::new(move || {
            calls_clone.fetch_add(1, Ordering::Relaxed);
        })));

        sender.send(LoopMessage::Wake);
        sender.wake();
        assert_eq!(calls.load(Ordering::Relaxed), 2);

        sender.set_post_task(None);
        sender.wake();
        assert_eq!(calls.load(Ordering::Relaxed), 2);
    }
}

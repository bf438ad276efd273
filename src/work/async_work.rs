//! Async work items: execute on a pool thread, complete on the runtime thread.

use std::any::Any;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex};

use super::worker_pool::Job;
use crate::error::Status;
use crate::event_loop::{LoopMessage, LoopSender};

/// Type-erased work payload, moved to the worker and back.
pub type WorkData = Box<dyn Any + Send>;

pub(crate) type ExecuteFn = Box<dyn FnOnce(&mut (dyn Any + Send)) + Send>;

/// Identifier of a queued work item. Never reused within an engine.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct WorkId(pub(crate) u64);

impl WorkId {
    #[inline]
    pub fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Debug for WorkId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "WorkId({})", self.0)
    }
}

#[repr(u8)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WorkState {
    Queued = 0,
    Executing = 1,
    Completed = 2,
    Cancelled = 3,
}

impl WorkState {
    fn from_u8(v: u8) -> WorkState {
        match v {
            0 => WorkState::Queued,
            1 => WorkState::Executing,
            2 => WorkState::Completed,
            _ => WorkState::Cancelled,
        }
    }
}

/// How a work item ended, as seen by the pool.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum WorkOutcome {
    Completed,
    Cancelled,
    /// `execute` panicked
    Failed(String),
}

impl WorkOutcome {
    pub fn status(&self) -> Status {
        match self {
            WorkOutcome::Completed => Status::Ok,
            WorkOutcome::Cancelled => Status::Cancelled,
            WorkOutcome::Failed(_) => Status::GenericFailure,
        }
    }
}

/// Posted to the loop once a work item is done or cancelled.
pub(crate) struct WorkCompletion {
    pub id: WorkId,
    pub outcome: WorkOutcome,
    pub data: WorkData,
}

/// State shared between the runtime thread and the worker.
///
/// The state machine is a single atomic. Whoever wins the CAS out of
/// `Queued` takes the payload, so execute and cancel never both see it.
pub(crate) struct WorkShared {
    id: WorkId,
    name: String,
    state: AtomicU8,
    payload: Mutex<Option<(ExecuteFn, WorkData)>>,
}

impl WorkShared {
    pub fn new(id: WorkId, name: String, execute: ExecuteFn, data: WorkData) -> Arc<Self> {
        Arc::new(Self {
            id,
            name,
            state: AtomicU8::new(WorkState::Queued as u8),
            payload: Mutex::new(Some((execute, data))),
        })
    }

    pub fn id(&self) -> WorkId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn state(&self) -> WorkState {
        WorkState::from_u8(self.state.load(Ordering::Acquire))
    }

    fn transition(&self, from: WorkState, to: WorkState) -> bool {
        self.state
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    fn take_payload(&self) -> Option<(ExecuteFn, WorkData)> {
        self.payload.lock().expect("work payload poisoned").take()
    }

    /// Queued to Cancelled. Returns the data to hand to `complete`, or
    /// `None` if execution already started.
    pub fn cancel(&self) -> Option<WorkData> {
        if !self.transition(WorkState::Queued, WorkState::Cancelled) {
            return None;
        }
        self.take_payload().map(|(_, data)| data)
    }

    /// Run `execute` on the calling (worker) thread. Returns `None` if the
    /// item was cancelled first.
    pub fn execute(&self) -> Option<(WorkOutcome, WorkData)> {
        if !self.transition(WorkState::Queued, WorkState::Executing) {
            return None;
        }
        let (execute, mut data) = self.take_payload()?;

        let outcome = match panic::catch_unwind(AssertUnwindSafe(|| execute(data.as_mut()))) {
            Ok(()) => WorkOutcome::Completed,
            Err(payload) => {
                let message = panic_message(payload.as_ref());
                log::error!("Async work '{}' panicked: {}", self.name, message);
                WorkOutcome::Failed(message)
            }
        };

        self.state
            .store(WorkState::Completed as u8, Ordering::Release);
        Some((outcome, data))
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

/// Pool job for one work item.
pub(crate) struct AsyncWorkJob {
    shared: Arc<WorkShared>,
    sender: LoopSender,
}

impl AsyncWorkJob {
    pub fn new(shared: Arc<WorkShared>, sender: LoopSender) -> Self {
        Self { shared, sender }
    }

    fn post(&self, outcome: WorkOutcome, data: WorkData) {
        let completion = WorkCompletion {
            id: self.shared.id(),
            outcome,
            data,
        };
        if !self.sender.send(LoopMessage::WorkDone(completion)) {
            log::debug!(
                "Dropping completion of '{}': engine is gone",
                self.shared.name()
            );
        }
    }
}

impl Job for AsyncWorkJob {
    fn run(self: Box<Self>) {
        match self.shared.execute() {
            Some((outcome, data)) => self.post(outcome, data),
            None => tracing::trace!("Skipping cancelled work {:?}", self.shared.id()),
        }
    }

    fn abandon(self: Box<Self>) {
        if let Some(data) = self.shared.cancel() {
            self.post(WorkOutcome::Cancelled, data);
        }
    }

    fn is_cancelled(&self) -> bool {
        self.shared.state() == WorkState::Cancelled
    }
}

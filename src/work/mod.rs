//! Async work bridge.
//!
//! A work item pairs an `execute` closure, run on a native pool thread with
//! no runtime access, with a `complete` closure run later on the runtime
//! thread. The engine owns the outstanding-work counter that keeps its loop
//! alive while items are in flight.
//!
//! ```text
//!   runtime thread                 pool thread
//!   ──────────────                 ───────────
//!   queue_async_work ──submit──▶   Queued → Executing
//!   (counter += 1)                 execute(&mut data)
//!                                  Completed
//!   run_loop ◀────WorkDone(data)── post
//!   (counter -= 1)
//!   complete(engine, status, data)
//! ```
//!
//! Cancellation only wins while the item is still `Queued`; `complete` then
//! runs with `Status::Cancelled` and the data it was queued with.

mod async_work;
mod worker_pool;

pub use async_work::{WorkData, WorkId, WorkState};
pub use worker_pool::{Job, PoolConfig, PoolStats, Qos, WorkerPool};

pub(crate) use async_work::{AsyncWorkJob, ExecuteFn, WorkCompletion, WorkOutcome, WorkShared};

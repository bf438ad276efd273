//! Engine facade: one runtime instance and everything bridged to it.
//!
//! An [`Engine`] lives on the thread that created it (it is `!Send`, the
//! runtime it owns is not thread-safe). Other threads talk to it through an
//! [`EngineHandle`], which only touches atomics, the idle monitor and the
//! loop channel.

use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU8, AtomicUsize, Ordering};
use std::time::Duration;

use tokio::sync::mpsc;

use crate::config::EngineConfig;
use crate::error::{EngineError, ExtendedErrorInfo, Result, Status};
use crate::event_loop::{
    self, EventLoopRuntime, LoopMessage, LoopMode, LoopSender, PostTask,
};
use crate::gc::{FinalizeReport, Finalizer, ReferenceId, ReferenceManager, Strength};
use crate::idle::{GcRequester, IdleMonitor, IdleSnapshot, IntervalTimer};
use crate::platform::{self, EngineId, EngineRegistry};
use crate::runtime::{GcKind, GcOutcome, Heap, ScriptRuntime, Value};
use crate::work::{
    AsyncWorkJob, ExecuteFn, PoolConfig, PoolStats, Qos, WorkCompletion, WorkData, WorkId,
    WorkOutcome, WorkShared, WorkState, WorkerPool,
};

/// Completion callback of a work item, run on the runtime thread.
pub type CompleteFn = Box<dyn FnOnce(&mut Engine, Status, WorkData)>;

/// Receives exceptions left pending by completion callbacks.
pub type UncaughtExceptionHandler = Box<dyn FnMut(&mut dyn ScriptRuntime, Value)>;

type InstanceFinalizer = Box<dyn FnOnce(Box<dyn Any>)>;

const GC_NONE: u8 = 0;
const GC_IDLE: u8 = 1;
const GC_FULL: u8 = 2;

/// Idle budget reported for a wait that only ends when woken.
const UNBOUNDED_IDLE_BUDGET: u64 = 0;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct CleanupHookId(u64);

/// What one collection pass did, runtime side and reference side.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CollectionReport {
    pub gc: GcOutcome,
    pub finalize: FinalizeReport,
}

struct PendingWork {
    shared: Arc<WorkShared>,
    complete: CompleteFn,
}

struct InstanceData {
    data: Box<dyn Any>,
    finalizer: Option<InstanceFinalizer>,
}

impl InstanceData {
    fn finalize(self) {
        if let Some(finalizer) = self.finalizer {
            finalizer(self.data);
        }
    }
}

// ============================================================================
// Thread-safe side
// ============================================================================

struct EngineShared {
    id: EngineId,
    registry: EngineRegistry,
    sender: LoopSender,
    outstanding_work: AtomicUsize,
    waiting_requests: AtomicUsize,
    pending_gc: AtomicU8,
    stopping: AtomicBool,
    idle: IdleMonitor,
}

impl EngineShared {
    fn request_collection(&self, kind: GcKind) {
        let code = match kind {
            GcKind::Idle => GC_IDLE,
            GcKind::Full => GC_FULL,
        };
        self.pending_gc.fetch_max(code, Ordering::AcqRel);
        self.sender.wake();
    }

    fn take_gc_request(&self) -> Option<GcKind> {
        match self.pending_gc.swap(GC_NONE, Ordering::AcqRel) {
            GC_IDLE => Some(GcKind::Idle),
            GC_FULL => Some(GcKind::Full),
            _ => None,
        }
    }
}

/// Thread-safe companion of an [`Engine`].
///
/// Every method may be called from any thread.
#[derive(Clone)]
pub struct EngineHandle {
    shared: Arc<EngineShared>,
}

impl EngineHandle {
    pub fn id(&self) -> EngineId {
        self.shared.id
    }

    /// Whether the engine is still registered (not yet dropped).
    pub fn is_alive(&self) -> bool {
        self.shared.registry.is_alive(self.shared.id)
    }

    /// Ask the loop to run a collection pass at its next safepoint.
    ///
    /// Requests coalesce; a full request supersedes an idle one.
    pub fn request_collection(&self, kind: GcKind) {
        tracing::trace!("{} collection requested for {}", kind_name(kind), self.id());
        self.shared.request_collection(kind);
    }

    /// Wake the loop. A loop run in `LoopMode::Once` returns after it.
    pub fn wake(&self) {
        self.shared.sender.send(LoopMessage::Wake);
    }

    pub fn notify_application_state(&self, in_background: bool) {
        self.shared.idle.notify_change_background_state(in_background);
    }

    /// High memory pressure requests a full collection.
    pub fn notify_memory_pressure(&self, high: bool) {
        if high {
            log::debug!("{}: high memory pressure", self.id());
            self.request_collection(GcKind::Full);
        }
    }

    pub fn outstanding_work(&self) -> usize {
        self.shared.outstanding_work.load(Ordering::Acquire)
    }

    /// Keep the loop alive for a request served outside the work pool.
    pub fn increase_waiting_requests(&self) {
        self.shared.waiting_requests.fetch_add(1, Ordering::AcqRel);
    }

    pub fn decrease_waiting_requests(&self) {
        let result = self.shared.waiting_requests.fetch_update(
            Ordering::AcqRel,
            Ordering::Acquire,
            |n| n.checked_sub(1),
        );
        if result.is_err() {
            log::warn!("{}: waiting request counter already at zero", self.id());
            return;
        }
        self.shared.sender.wake();
    }

    pub fn has_waiting_request(&self) -> bool {
        self.shared.waiting_requests.load(Ordering::Acquire) > 0
    }

    pub fn is_stopping(&self) -> bool {
        self.shared.stopping.load(Ordering::Acquire)
    }

    pub fn idle_snapshot(&self) -> IdleSnapshot {
        self.shared.idle.snapshot()
    }

    pub fn trigger_post_task(&self) {
        self.shared.sender.trigger_post_task();
    }
}

impl GcRequester for EngineHandle {
    fn request_full_gc(&self) {
        self.request_collection(GcKind::Full);
    }
}

impl fmt::Debug for EngineHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EngineHandle")
            .field("id", &self.shared.id)
            .field("outstanding_work", &self.outstanding_work())
            .finish()
    }
}

fn kind_name(kind: GcKind) -> &'static str {
    match kind {
        GcKind::Idle => "Idle",
        GcKind::Full => "Full",
    }
}

// ============================================================================
// Engine
// ============================================================================

/// Per-thread runtime instance.
pub struct Engine {
    config: EngineConfig,
    shared: Arc<EngineShared>,
    runtime: Box<dyn ScriptRuntime>,
    references: ReferenceManager,
    pool: WorkerPool,
    pending_work: HashMap<WorkId, PendingWork>,
    next_work_id: u64,
    loop_rt: tokio::runtime::Runtime,
    loop_rx: mpsc::UnboundedReceiver<LoopMessage>,
    message_buf: Vec<LoopMessage>,
    idle_timer: Option<IntervalTimer>,
    uncaught_handler: Option<UncaughtExceptionHandler>,
    cleanup_hooks: Vec<(CleanupHookId, Box<dyn FnOnce()>)>,
    next_cleanup_id: u64,
    instance_data: Option<InstanceData>,
    last_error: ExtendedErrorInfo,
}

impl Engine {
    /// Engine over the in-crate [`Heap`] runtime.
    pub fn new(config: EngineConfig, registry: &EngineRegistry) -> Result<Self> {
        Self::with_runtime(config, registry, Box::new(Heap::new()))
    }

    pub fn with_runtime(
        config: EngineConfig,
        registry: &EngineRegistry,
        runtime: Box<dyn ScriptRuntime>,
    ) -> Result<Self> {
        let loop_rt = tokio::runtime::Builder::new_current_thread()
            .build()
            .map_err(EngineError::LoopInit)?;
        let (tx, loop_rx) = mpsc::unbounded_channel();

        let id = registry.register();
        let shared = Arc::new(EngineShared {
            id,
            registry: registry.clone(),
            sender: LoopSender::new(tx),
            outstanding_work: AtomicUsize::new(0),
            waiting_requests: AtomicUsize::new(0),
            pending_gc: AtomicU8::new(GC_NONE),
            stopping: AtomicBool::new(false),
            idle: IdleMonitor::new(config.idle.clone(), platform::monotonic_millis()),
        });

        let threads = Self::spawn_threads(&config, &shared);
        let (pool, idle_timer) = match threads {
            Ok(threads) => threads,
            Err(e) => {
                registry.unregister(id);
                return Err(e);
            }
        };

        log::debug!(
            "{} created: worker_threads={}, idle_monitor={}",
            id,
            config.worker_threads,
            config.enable_idle_monitor
        );

        Ok(Self {
            config,
            shared,
            runtime,
            references: ReferenceManager::new(),
            pool,
            pending_work: HashMap::new(),
            next_work_id: 1,
            loop_rt,
            loop_rx,
            message_buf: Vec::new(),
            idle_timer,
            uncaught_handler: None,
            cleanup_hooks: Vec::new(),
            next_cleanup_id: 1,
            instance_data: None,
            last_error: ExtendedErrorInfo::default(),
        })
    }

    fn spawn_threads(
        config: &EngineConfig,
        shared: &Arc<EngineShared>,
    ) -> Result<(WorkerPool, Option<IntervalTimer>)> {
        let pool = WorkerPool::new(PoolConfig {
            threads: config.worker_threads,
            max_queued: config.max_queued_work,
            name_prefix: format!("{}-worker", shared.id),
        })?;

        if !config.enable_idle_monitor {
            return Ok((pool, None));
        }

        let handle = EngineHandle {
            shared: shared.clone(),
        };
        let timer = IntervalTimer::spawn(
            &format!("{}-idle", shared.id),
            config.idle.idle_monitoring_interval,
            move || {
                handle
                    .shared
                    .idle
                    .interval_monitor(platform::monotonic_millis(), &handle)
            },
        )?;

        Ok((pool, Some(timer)))
    }

    pub fn id(&self) -> EngineId {
        self.shared.id
    }

    pub fn handle(&self) -> EngineHandle {
        EngineHandle {
            shared: self.shared.clone(),
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn runtime(&self) -> &dyn ScriptRuntime {
        self.runtime.as_ref()
    }

    pub fn runtime_mut(&mut self) -> &mut dyn ScriptRuntime {
        self.runtime.as_mut()
    }

    // ------------------------------------------------------------------------
    // Last error
    // ------------------------------------------------------------------------

    pub fn last_error(&self) -> &ExtendedErrorInfo {
        &self.last_error
    }

    pub fn clear_last_error(&mut self) {
        self.last_error = ExtendedErrorInfo::default();
    }

    fn set_last_error(&mut self, status: Status) {
        self.last_error = ExtendedErrorInfo {
            status,
            message: status.message(),
            engine_error_code: 0,
        };
    }

    fn record<T>(&mut self, result: Result<T>) -> Result<T> {
        match &result {
            Ok(_) => self.clear_last_error(),
            Err(e) => self.set_last_error(e.status()),
        }
        result
    }

    // ------------------------------------------------------------------------
    // References
    // ------------------------------------------------------------------------

    /// Wrap `value` in a reference owned by the caller, who must delete it.
    pub fn create_reference(
        &mut self,
        value: Value,
        initial_ref_count: u32,
        finalizer: Option<Finalizer>,
    ) -> Result<ReferenceId> {
        let result = self.references.create(
            self.runtime.as_mut(),
            value,
            initial_ref_count,
            finalizer,
            false,
        );
        self.record(result)
    }

    /// Wrap `value` in a reference that removes itself once finalized.
    /// Still alive at engine drop, it is finalized then.
    pub fn create_self_owned_reference(
        &mut self,
        value: Value,
        initial_ref_count: u32,
        finalizer: Option<Finalizer>,
    ) -> Result<ReferenceId> {
        let result = self.references.create(
            self.runtime.as_mut(),
            value,
            initial_ref_count,
            finalizer,
            true,
        );
        self.record(result)
    }

    pub fn reference_ref(&mut self, id: ReferenceId) -> Result<u32> {
        let result = self.references.add_ref(self.runtime.as_mut(), id);
        self.record(result)
    }

    pub fn reference_unref(&mut self, id: ReferenceId) -> Result<u32> {
        let result = self.references.unref(self.runtime.as_mut(), id);
        self.record(result)
    }

    /// Current value; `Ok(None)` once collected.
    pub fn reference_get(&mut self, id: ReferenceId) -> Result<Option<Value>> {
        let result = self.references.get(self.runtime.as_ref(), id);
        self.record(result)
    }

    pub fn reference_count(&self, id: ReferenceId) -> Result<u32> {
        self.references.count(id)
    }

    pub fn reference_strength(&self, id: ReferenceId) -> Result<Strength> {
        self.references.strength(id)
    }

    pub fn reference_final_run(&self, id: ReferenceId) -> Result<bool> {
        self.references.final_run(id)
    }

    /// Finalizer user data of a reference not yet finalized.
    pub fn reference_data(&self, id: ReferenceId) -> Result<Option<&dyn Any>> {
        self.references.data(id)
    }

    /// Release a reference now. Safe to call more than once.
    pub fn delete_reference(&mut self, id: ReferenceId) -> bool {
        self.references.delete(self.runtime.as_mut(), id)
    }

    pub fn reference_len(&self) -> usize {
        self.references.len()
    }

    // ------------------------------------------------------------------------
    // Async work
    // ------------------------------------------------------------------------

    /// Run `execute(&mut data)` on a worker thread, then
    /// `complete(engine, status, data)` on this thread from `run_loop`.
    pub fn queue_async_work<T, E, C>(
        &mut self,
        name: &str,
        execute: E,
        complete: C,
        data: T,
    ) -> Result<WorkId>
    where
        T: Send + 'static,
        E: FnOnce(&mut T) + Send + 'static,
        C: FnOnce(&mut Engine, Status, T) + 'static,
    {
        self.queue_async_work_with_qos(name, execute, complete, data, Qos::Default)
    }

    pub fn queue_async_work_with_qos<T, E, C>(
        &mut self,
        name: &str,
        execute: E,
        complete: C,
        data: T,
        qos: Qos,
    ) -> Result<WorkId>
    where
        T: Send + 'static,
        E: FnOnce(&mut T) + Send + 'static,
        C: FnOnce(&mut Engine, Status, T) + 'static,
    {
        let work_name = name.to_string();
        let execute: ExecuteFn = Box::new(move |data: &mut (dyn Any + Send)| {
            match data.downcast_mut::<T>() {
                Some(data) => execute(data),
                None => log::error!("Async work '{}' received foreign data", work_name),
            }
        });

        let work_name = name.to_string();
        let complete: CompleteFn = Box::new(
            move |engine: &mut Engine, status: Status, data: WorkData| match data.downcast::<T>() {
                Ok(data) => complete(engine, status, *data),
                Err(_) => log::error!("Async work '{}' returned foreign data", work_name),
            },
        );

        let result = self.submit_work(name, execute, complete, Box::new(data), qos);
        self.record(result)
    }

    fn submit_work(
        &mut self,
        name: &str,
        execute: ExecuteFn,
        complete: CompleteFn,
        data: WorkData,
        qos: Qos,
    ) -> Result<WorkId> {
        if name.is_empty() {
            return Err(EngineError::invalid_arg("async work needs a resource name"));
        }
        if self.shared.stopping.load(Ordering::Acquire) {
            return Err(EngineError::Closing);
        }

        let id = WorkId(self.next_work_id);
        self.next_work_id += 1;
        let work = WorkShared::new(id, name.to_string(), execute, data);

        // Counted before submission so the loop cannot see a finished item
        // that was never counted.
        self.shared.outstanding_work.fetch_add(1, Ordering::AcqRel);

        let job = AsyncWorkJob::new(work.clone(), self.shared.sender.clone());
        if let Err(e) = self.pool.submit(Box::new(job), qos) {
            self.release_outstanding();
            log::warn!("Failed to queue async work '{}': {}", name, e);
            return Err(e);
        }

        tracing::trace!("Queued async work '{}' as {:?} ({:?})", name, id, qos);
        self.pending_work.insert(
            id,
            PendingWork {
                shared: work,
                complete,
            },
        );
        Ok(id)
    }

    /// Cancel a work item that has not started executing.
    ///
    /// On success its `complete` runs from the loop with `Status::Cancelled`.
    /// Returns false once execution started, or for unknown ids.
    pub fn cancel_async_work(&mut self, id: WorkId) -> bool {
        let data = self
            .pending_work
            .get(&id)
            .and_then(|pending| pending.shared.cancel());

        let Some(data) = data else {
            self.set_last_error(Status::GenericFailure);
            return false;
        };

        self.clear_last_error();
        let completion = WorkCompletion {
            id,
            outcome: WorkOutcome::Cancelled,
            data,
        };
        self.shared
            .sender
            .send(LoopMessage::WorkDone(completion));
        true
    }

    /// State of a work item whose completion has not run yet.
    pub fn work_state(&self, id: WorkId) -> Option<WorkState> {
        self.pending_work.get(&id).map(|p| p.shared.state())
    }

    pub fn outstanding_work(&self) -> usize {
        self.shared.outstanding_work.load(Ordering::Acquire)
    }

    pub fn pool_stats(&self) -> PoolStats {
        self.pool.stats()
    }

    fn release_outstanding(&self) {
        let result = self.shared.outstanding_work.fetch_update(
            Ordering::AcqRel,
            Ordering::Acquire,
            |n| n.checked_sub(1),
        );
        debug_assert!(result.is_ok(), "outstanding work counter underflow");
        if result.is_err() {
            log::error!("{}: outstanding work counter underflow", self.id());
        }
    }

    fn complete_work(&mut self, completion: WorkCompletion) {
        let Some(pending) = self.pending_work.remove(&completion.id) else {
            log::warn!("Completion for unknown work {:?}", completion.id);
            return;
        };

        // Before `complete`, so it observes an accurate count even if it
        // queues more work.
        self.release_outstanding();

        let status = completion.outcome.status();
        tracing::trace!(
            "Completing async work '{}' ({:?}) with {:?}",
            pending.shared.name(),
            completion.id,
            status
        );

        // Exception scope: set aside (and keep alive) anything already
        // pending so only what `complete` throws is reported.
        let outer = self
            .runtime
            .take_pending_exception()
            .map(|value| (value, self.runtime.add_root(value)));

        (pending.complete)(self, status, completion.data);

        if self.runtime.has_pending_exception() {
            self.handle_uncaught_exception();
        }

        if let Some((value, root)) = outer {
            self.runtime.remove_root(root);
            self.runtime.throw(value);
        }
    }

    // ------------------------------------------------------------------------
    // Loop
    // ------------------------------------------------------------------------

    /// Whether anything still keeps the loop running.
    pub fn is_loop_alive(&self) -> bool {
        self.outstanding_work() > 0
            || self.shared.waiting_requests.load(Ordering::Acquire) > 0
            || self.shared.pending_gc.load(Ordering::Acquire) != GC_NONE
            || !self.message_buf.is_empty()
            || !self.loop_rx.is_empty()
    }

    /// Run the loop on the calling thread. Returns whether it is still alive.
    ///
    /// Completions, collection requests and wakes are all processed here.
    /// Blocking waits are reported to the idle monitor.
    pub fn run_loop(&mut self, mode: LoopMode) -> Result<bool> {
        loop {
            let mut buf = std::mem::take(&mut self.message_buf);
            let processed = event_loop::drain_and_process(self, &mut buf);
            self.message_buf = buf;
            let processed = processed?;

            let alive = self.is_loop_alive();
            match mode {
                LoopMode::NoWait => return Ok(alive),
                LoopMode::Once if processed > 0 => return Ok(alive),
                _ => {}
            }
            if !alive {
                return Ok(false);
            }

            self.wait_for_messages();
        }
    }

    fn wait_for_messages(&mut self) {
        let shared = self.shared.clone();
        shared
            .idle
            .notify_looper_idle_start(platform::monotonic_millis(), UNBOUNDED_IDLE_BUDGET);

        let rx = &mut self.loop_rx;
        let notify = shared.sender.notify();
        let msg = self.loop_rt.block_on(async {
            tokio::select! {
                biased;

                msg = rx.recv() => msg,
                _ = notify.notified() => None,
            }
        });

        shared
            .idle
            .notify_looper_idle_end(platform::monotonic_millis());

        if let Some(msg) = msg {
            self.message_buf.push(msg);
        }
    }

    /// Install the host hook run whenever the loop has work to process.
    pub fn set_post_task<F>(&mut self, task: F)
    where
        F: Fn() + Send + Sync + 'static,
    {
        let task: PostTask = Arc::new(task);
        self.shared.sender.set_post_task(Some(task));
    }

    pub fn clear_post_task(&mut self) {
        self.shared.sender.set_post_task(None);
    }

    pub fn trigger_post_task(&self) {
        self.shared.sender.trigger_post_task();
    }

    // ------------------------------------------------------------------------
    // Exceptions
    // ------------------------------------------------------------------------

    pub fn throw(&mut self, value: Value) -> Result<()> {
        let result = if self.runtime.is_live(value) {
            self.runtime.throw(value);
            Ok(())
        } else {
            Err(EngineError::invalid_arg("cannot throw a collected value"))
        };
        self.record(result)
    }

    pub fn throw_error(&mut self, message: &str) -> Result<()> {
        let error = self.runtime.create_error(message);
        self.throw(error)
    }

    pub fn is_exception_pending(&self) -> bool {
        self.runtime.has_pending_exception()
    }

    pub fn get_and_clear_last_exception(&mut self) -> Option<Value> {
        self.runtime.take_pending_exception()
    }

    pub fn register_uncaught_exception_handler<F>(&mut self, handler: F)
    where
        F: FnMut(&mut dyn ScriptRuntime, Value) + 'static,
    {
        self.uncaught_handler = Some(Box::new(handler));
    }

    /// Hand the pending exception, if any, to the uncaught handler and clear
    /// it. Without a handler it is logged. Returns whether there was one.
    pub fn handle_uncaught_exception(&mut self) -> bool {
        let Some(exception) = self.runtime.take_pending_exception() else {
            return false;
        };

        match self.uncaught_handler.as_mut() {
            Some(handler) => handler(self.runtime.as_mut(), exception),
            None => log::error!(
                "{}: uncaught exception: {}",
                self.shared.id,
                describe(self.runtime.as_ref(), exception)
            ),
        }
        true
    }

    // ------------------------------------------------------------------------
    // Collection and host signals
    // ------------------------------------------------------------------------

    /// Run a collection pass now and deliver finalize messages.
    pub fn collect_garbage(&mut self, kind: GcKind) -> CollectionReport {
        let gc = self.runtime.collect_garbage(kind);
        let finalize = self.references.on_collection(self.runtime.as_mut());

        log::debug!(
            "{}: {} collection freed {} cells, finalized {} references",
            self.shared.id,
            kind_name(kind),
            gc.collected,
            finalize.finalized
        );

        CollectionReport { gc, finalize }
    }

    /// The host has `idle_micros` of idle time; long enough windows get an
    /// idle collection.
    pub fn notify_idle_time(&mut self, idle_micros: u64) -> Option<CollectionReport> {
        let window = Duration::from_micros(idle_micros);
        if window < self.config.idle.min_trigger_gc_idle_interval {
            return None;
        }
        Some(self.collect_garbage(GcKind::Idle))
    }

    pub fn notify_application_state(&self, in_background: bool) {
        self.handle().notify_application_state(in_background);
    }

    pub fn notify_memory_pressure(&self, high: bool) {
        self.handle().notify_memory_pressure(high);
    }

    pub fn idle_snapshot(&self) -> IdleSnapshot {
        self.shared.idle.snapshot()
    }

    // ------------------------------------------------------------------------
    // Cleanup hooks, instance data, stopping
    // ------------------------------------------------------------------------

    pub fn add_cleanup_hook<F>(&mut self, hook: F) -> CleanupHookId
    where
        F: FnOnce() + 'static,
    {
        let id = CleanupHookId(self.next_cleanup_id);
        self.next_cleanup_id += 1;
        self.cleanup_hooks.push((id, Box::new(hook)));
        id
    }

    pub fn remove_cleanup_hook(&mut self, id: CleanupHookId) -> Result<()> {
        let result = match self.cleanup_hooks.iter().position(|(hook, _)| *hook == id) {
            Some(index) => {
                drop(self.cleanup_hooks.remove(index));
                Ok(())
            }
            None => Err(EngineError::invalid_arg(format!(
                "unknown cleanup hook {:?}",
                id
            ))),
        };
        self.record(result)
    }

    /// Run registered hooks, most recent first. Returns how many ran.
    pub fn run_cleanup(&mut self) -> usize {
        let hooks = std::mem::take(&mut self.cleanup_hooks);
        let count = hooks.len();
        for (_, hook) in hooks.into_iter().rev() {
            hook();
        }
        count
    }

    pub fn set_instance_data<T: Any>(&mut self, data: T) {
        self.replace_instance_data(InstanceData {
            data: Box::new(data),
            finalizer: None,
        });
    }

    /// Like [`Engine::set_instance_data`], with a finalizer run when the data
    /// is replaced or the engine is dropped.
    pub fn set_instance_data_with_finalizer<T, F>(&mut self, data: T, finalizer: F)
    where
        T: Any,
        F: FnOnce(T) + 'static,
    {
        let finalizer: InstanceFinalizer = Box::new(move |data: Box<dyn Any>| {
            if let Ok(data) = data.downcast::<T>() {
                finalizer(*data);
            }
        });
        self.replace_instance_data(InstanceData {
            data: Box::new(data),
            finalizer: Some(finalizer),
        });
    }

    fn replace_instance_data(&mut self, data: InstanceData) {
        if let Some(previous) = self.instance_data.replace(data) {
            previous.finalize();
        }
    }

    pub fn instance_data<T: Any>(&self) -> Option<&T> {
        self.instance_data.as_ref()?.data.downcast_ref::<T>()
    }

    pub fn instance_data_mut<T: Any>(&mut self) -> Option<&mut T> {
        self.instance_data.as_mut()?.data.downcast_mut::<T>()
    }

    /// While stopping, new async work is refused with `Closing`. Queued work
    /// still completes.
    pub fn set_stopping(&mut self, stopping: bool) {
        self.shared.stopping.store(stopping, Ordering::Release);
    }

    pub fn is_stopping(&self) -> bool {
        self.shared.stopping.load(Ordering::Acquire)
    }
}

impl EventLoopRuntime for Engine {
    fn loop_rx_mut(&mut self) -> &mut mpsc::UnboundedReceiver<LoopMessage> {
        &mut self.loop_rx
    }

    fn process_message(&mut self, msg: LoopMessage) {
        match msg {
            LoopMessage::WorkDone(completion) => self.complete_work(completion),
            LoopMessage::Wake => {}
        }
    }

    fn safepoint(&mut self) -> usize {
        match self.shared.take_gc_request() {
            Some(kind) => {
                self.collect_garbage(kind);
                1
            }
            None => 0,
        }
    }
}

fn describe(runtime: &dyn ScriptRuntime, value: Value) -> String {
    if let Some(message) = runtime.read_error_message(value) {
        return format!("Error: {}", message);
    }
    if let Some(s) = runtime.read_string(value) {
        return s.to_string();
    }
    format!("{:?}", value)
}

impl Drop for Engine {
    fn drop(&mut self) {
        // Joins the timer thread; no collection request after this point.
        drop(self.idle_timer.take());

        let hooks = self.run_cleanup();
        self.pool.shutdown();

        if !self.pending_work.is_empty() {
            log::debug!(
                "{}: dropping {} pending completions",
                self.shared.id,
                self.pending_work.len()
            );
            self.pending_work.clear();
        }

        let torn_down = self.references.teardown(self.runtime.as_mut());

        if let Some(data) = self.instance_data.take() {
            data.finalize();
        }

        self.shared.registry.unregister(self.shared.id);
        log::debug!(
            "{} destroyed (cleanup hooks: {}, self-owned references: {})",
            self.shared.id,
            hooks,
            torn_down
        );
    }
}

impl fmt::Debug for Engine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Engine")
            .field("id", &self.shared.id)
            .field("references", &self.references)
            .field("pending_work", &self.pending_work.len())
            .field("outstanding_work", &self.outstanding_work())
            .finish()
    }
}

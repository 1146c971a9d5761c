//! Context: per-process, per-device owner of streams, pools, and models.
//!
//! Every task-submission entry point lives here. Each one follows the same
//! contract: allocate a descriptor from the target stream's pool, populate
//! it (resolving kernel modules and staging oversized arguments), then
//! either hand it to the driver or, when the stream is in capture mode,
//! redirect it to the capture's internal stream and record it into the
//! model. Nothing stays allocated on an error path.

use std::cell::Cell;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::ThreadId;
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use tracing::{debug, info, warn};

use crate::capture::{
    CaptureGraph, CaptureInfo, CaptureMode, CaptureModel, CaptureState, ModelId, ModelInfo,
};
use crate::error::{Result, RuntimeError};
use crate::runtime::Runtime;
use crate::stream::{CaptureStatus, Stream, StreamFlags, StreamId, TaskGroupStatus};
use crate::module_pool::{ModuleId, ModuleTable};
use crate::task::{
    ControlCommand, CopyKind, NotifyId, TaskId, TaskPayload,
};
use crate::task_group::{TaskGroup, TaskGroupId};

/// Identifiers of a successfully placed task, kept for later query.
#[derive(Debug, Clone, Copy)]
pub struct TaskTicket {
    /// Stream the task landed on (the capture stream's public face when
    /// recording).
    pub stream: StreamId,
    /// Task identity.
    pub task: TaskId,
    /// Sequence number on the receiving stream.
    pub seq: u64,
}

/// Bump region inside the overflow-scratch device buffer.
struct Scratch {
    base: u64,
    size: usize,
    used: usize,
}

impl Scratch {
    fn alloc(&mut self, len: usize) -> Result<u64> {
        let available = self.size - self.used;
        if len > available {
            return Err(RuntimeError::ScratchExhausted {
                needed: len,
                available,
            });
        }
        let ptr = self.base + self.used as u64;
        self.used += len;
        Ok(ptr)
    }

    fn reset(&mut self) {
        self.used = 0;
    }
}

/// Capture-scope bookkeeping, serialized by the capture lock.
#[derive(Default)]
struct CaptureScopes {
    /// Active captures begun in `Global` mode.
    global_active: usize,
    /// All active captures.
    total_active: usize,
    /// Active captures per beginning thread.
    per_thread: HashMap<ThreadId, usize>,
    /// Per-thread capture-interaction mode overrides.
    thread_modes: HashMap<ThreadId, CaptureMode>,
}

impl CaptureScopes {
    fn note_begin(&mut self, mode: CaptureMode, thread: ThreadId) {
        self.total_active += 1;
        if mode == CaptureMode::Global {
            self.global_active += 1;
        }
        *self.per_thread.entry(thread).or_insert(0) += 1;
    }

    fn note_end(&mut self, mode: CaptureMode, thread: ThreadId) {
        self.total_active = self.total_active.saturating_sub(1);
        if mode == CaptureMode::Global {
            self.global_active = self.global_active.saturating_sub(1);
        }
        if let Some(count) = self.per_thread.get_mut(&thread) {
            *count = count.saturating_sub(1);
        }
    }

    fn thread_mode(&self, thread: ThreadId) -> CaptureMode {
        self.thread_modes
            .get(&thread)
            .copied()
            .unwrap_or(CaptureMode::Global)
    }
}

/// Statistics counters.
#[derive(Default)]
struct ContextCounters {
    tasks_submitted: AtomicU64,
    tasks_recorded: AtomicU64,
    captures_begun: AtomicU64,
    captures_finished: AtomicU64,
}

/// Statistics snapshot for a context.
#[derive(Debug, Clone)]
pub struct ContextStats {
    /// Streams in the arena, the default stream included.
    pub streams: usize,
    /// Tasks handed to the driver.
    pub tasks_submitted: u64,
    /// Tasks recorded into capture graphs.
    pub tasks_recorded: u64,
    /// Captures begun.
    pub captures_begun: u64,
    /// Captures that reached `Finished`.
    pub captures_finished: u64,
    /// Live models.
    pub live_models: usize,
}

/// Per-process, per-device owner of streams, pools, and capture models.
pub struct Context {
    runtime: Arc<Runtime>,
    /// Stream arena. Streams are exclusively owned here; everything else
    /// refers to them by id.
    streams: RwLock<HashMap<StreamId, Arc<Stream>>>,
    /// Streams not currently bound to any model.
    free_streams: Mutex<HashSet<StreamId>>,
    default_stream: StreamId,
    module_table: ModuleTable,
    /// Registered kernel images, loaded lazily on first launch.
    kernel_images: Mutex<HashMap<ModuleId, Arc<Vec<u8>>>>,
    models: Mutex<HashMap<ModelId, CaptureModel>>,
    /// Serializes capture begin/end and guards the scope table.
    capture_lock: Mutex<CaptureScopes>,
    notifies: Mutex<HashSet<NotifyId>>,
    scratch: Mutex<Scratch>,
    /// Device fault latched during synchronization; submissions
    /// short-circuit with it until cleared administratively.
    fault: Mutex<Option<String>>,
    last_submission: Mutex<Option<TaskTicket>>,
    next_stream_id: AtomicU64,
    next_model_id: AtomicU64,
    next_notify_id: AtomicU64,
    next_group_id: AtomicU64,
    task_ids: Arc<AtomicU64>,
    counters: ContextCounters,
    torn_down: AtomicBool,
}

impl Context {
    /// Create a context on `runtime`, with its default stream and scratch
    /// buffer.
    pub(crate) fn new(runtime: Arc<Runtime>) -> Result<Self> {
        let scratch_size = runtime.config().scratch_bytes;
        let scratch_base = runtime.driver().alloc_device_memory(scratch_size)?;
        let config = runtime.config().clone();

        let ctx = Self {
            runtime,
            streams: RwLock::new(HashMap::new()),
            free_streams: Mutex::new(HashSet::new()),
            // The first stream created below receives id 0.
            default_stream: StreamId::new(0),
            module_table: ModuleTable::new(
                config.module_chunk_size,
                config.module_isolation_width,
            ),
            kernel_images: Mutex::new(HashMap::new()),
            models: Mutex::new(HashMap::new()),
            capture_lock: Mutex::new(CaptureScopes::default()),
            notifies: Mutex::new(HashSet::new()),
            scratch: Mutex::new(Scratch {
                base: scratch_base,
                size: scratch_size,
                used: 0,
            }),
            fault: Mutex::new(None),
            last_submission: Mutex::new(None),
            next_stream_id: AtomicU64::new(0),
            next_model_id: AtomicU64::new(0),
            next_notify_id: AtomicU64::new(0),
            next_group_id: AtomicU64::new(0),
            task_ids: Arc::new(AtomicU64::new(0)),
            counters: ContextCounters::default(),
            torn_down: AtomicBool::new(false),
        };

        let default_id = ctx.create_stream_inner(StreamFlags::default(), false)?;
        debug_assert_eq!(default_id, ctx.default_stream);
        info!(default_stream = %default_id, "context created");
        Ok(ctx)
    }

    /// The runtime this context was created on.
    pub fn runtime(&self) -> &Arc<Runtime> {
        &self.runtime
    }

    /// The always-present default stream.
    pub fn default_stream(&self) -> StreamId {
        self.default_stream
    }

    /// Statistics snapshot.
    pub fn stats(&self) -> ContextStats {
        ContextStats {
            streams: self.streams.read().len(),
            tasks_submitted: self.counters.tasks_submitted.load(Ordering::Relaxed),
            tasks_recorded: self.counters.tasks_recorded.load(Ordering::Relaxed),
            captures_begun: self.counters.captures_begun.load(Ordering::Relaxed),
            captures_finished: self.counters.captures_finished.load(Ordering::Relaxed),
            live_models: self.models.lock().len(),
        }
    }

    /// Stream/task identifiers of the most recent successful submission.
    pub fn last_submission(&self) -> Option<TaskTicket> {
        *self.last_submission.lock()
    }

    /// Statistics snapshot for one stream.
    pub fn stream_stats(&self, id: StreamId) -> Result<crate::stream::StreamStats> {
        Ok(self.public_stream(id)?.stats())
    }

    // =========================================================================
    // Streams
    // =========================================================================

    fn stream_any(&self, id: StreamId) -> Result<Arc<Stream>> {
        self.streams
            .read()
            .get(&id)
            .cloned()
            .ok_or(RuntimeError::StreamNotFound(id))
    }

    /// Caller-visible stream lookup; internal capture streams are hidden.
    fn public_stream(&self, id: StreamId) -> Result<Arc<Stream>> {
        let stream = self.stream_any(id)?;
        if stream.is_internal() {
            return Err(RuntimeError::StreamNotFound(id));
        }
        Ok(stream)
    }

    fn create_stream_inner(&self, flags: StreamFlags, internal: bool) -> Result<StreamId> {
        let queue = self.runtime.driver().create_queue_pair()?;
        let id = StreamId::new(self.next_stream_id.fetch_add(1, Ordering::AcqRel));
        let config = self.runtime.config();
        let stream = Arc::new(Stream::new(
            id,
            queue,
            flags,
            internal,
            config.task_pool_capacity,
            config.task_pool_overflow,
            Arc::clone(&self.task_ids),
        ));
        self.streams.write().insert(id, stream);
        if !internal {
            self.free_streams.lock().insert(id);
        }
        debug!(stream = %id, queue = %queue, internal, "created stream");
        Ok(id)
    }

    /// Create a stream with `flags`.
    pub fn create_stream(&self, flags: StreamFlags) -> Result<StreamId> {
        self.create_stream_inner(flags, false)
    }

    /// Destroy a stream, recycling anything still in flight.
    ///
    /// The default stream, capturing streams, and streams bound to a model
    /// cannot be destroyed.
    pub fn destroy_stream(&self, id: StreamId) -> Result<()> {
        if id == self.default_stream {
            return Err(RuntimeError::InvalidArgument(
                "the default stream cannot be destroyed".into(),
            ));
        }
        let stream = self.public_stream(id)?;
        if stream.is_capturing() {
            return Err(RuntimeError::StreamCaptured(id));
        }
        if stream.model_count() > 0 {
            return Err(RuntimeError::StreamBound(id));
        }
        stream.reclaim_pass(&self.runtime);
        let leftover = stream.resource_clear();
        if leftover > 0 {
            warn!(stream = %id, leftover, "destroying stream with tasks in flight");
        }
        self.runtime.driver().destroy_queue_pair(stream.queue())?;
        self.streams.write().remove(&id);
        self.free_streams.lock().remove(&id);
        debug!(stream = %id, "destroyed stream");
        Ok(())
    }

    fn bind_stream_to_model(&self, stream: &Arc<Stream>) {
        stream.bind_model();
        self.free_streams.lock().remove(&stream.id());
    }

    fn unbind_stream_from_model(&self, stream: &Arc<Stream>) {
        if stream.unbind_model() == 0 && !stream.is_internal() {
            self.free_streams.lock().insert(stream.id());
        }
    }

    /// Streams currently owned by the context and not bound to any model.
    pub fn free_stream_ids(&self) -> Vec<StreamId> {
        self.free_streams.lock().iter().copied().collect()
    }

    // =========================================================================
    // Kernel modules and notifies
    // =========================================================================

    /// Register a kernel image for pool-managed lazy loading.
    pub fn register_kernel(&self, image: Vec<u8>) -> ModuleId {
        let id = self.module_table.allocate_id();
        self.kernel_images.lock().insert(id, Arc::new(image));
        id
    }

    fn resolve_module(&self, id: ModuleId) -> Result<u64> {
        let image = self
            .kernel_images
            .lock()
            .get(&id)
            .cloned()
            .ok_or(RuntimeError::ModuleNotFound(id))?;
        self.module_table
            .get_or_create(id, || self.runtime.driver().load_kernel(&image))
    }

    /// Drop one reference on a loaded module.
    pub fn release_module(&self, id: ModuleId) -> Result<()> {
        self.module_table.release(id)
    }

    /// Opportunistic whole-pool reclamation sweep over the module table.
    ///
    /// Walks pools behind the isolation window and frees each one whose
    /// slots are all unreferenced. Returns the number of pools reclaimed.
    pub fn try_recycle_module_pools(&self) -> Result<usize> {
        self.module_table
            .recycle_sweep(|handle| self.runtime.driver().unload_kernel(handle))
    }

    /// Create a cross-stream notification object.
    pub fn create_notify(&self) -> NotifyId {
        let id = NotifyId::new(self.next_notify_id.fetch_add(1, Ordering::AcqRel) + 1);
        self.notifies.lock().insert(id);
        id
    }

    /// Destroy a notification object.
    pub fn destroy_notify(&self, id: NotifyId) -> Result<()> {
        if self.notifies.lock().remove(&id) {
            Ok(())
        } else {
            Err(RuntimeError::NotifyNotFound(id))
        }
    }

    fn check_notify(&self, id: NotifyId) -> Result<()> {
        if self.notifies.lock().contains(&id) {
            Ok(())
        } else {
            Err(RuntimeError::NotifyNotFound(id))
        }
    }

    // =========================================================================
    // Fault latch
    // =========================================================================

    fn check_fault(&self) -> Result<()> {
        match self.fault.lock().as_ref() {
            Some(message) => Err(RuntimeError::DeviceFault(message.clone())),
            None => Ok(()),
        }
    }

    /// Latch a device fault and invalidate every live capture.
    fn latch_fault(&self, message: &str) {
        {
            let mut fault = self.fault.lock();
            if fault.is_none() {
                *fault = Some(message.to_string());
            }
        }
        warn!(fault = message, "device fault latched on context");
        let mut models = self.models.lock();
        for model in models.values_mut() {
            if model.state() == CaptureState::Capturing {
                model.invalidate();
                let id = model.id();
                for member in model.members().to_vec() {
                    if let Ok(stream) = self.stream_any(member.public) {
                        stream.set_capture(CaptureStatus::Invalidated { model: id });
                    }
                }
            }
        }
    }

    /// The latched fault message, if any.
    pub fn latched_fault(&self) -> Option<String> {
        self.fault.lock().clone()
    }

    /// Administratively clear a latched fault.
    pub fn clear_fault(&self) {
        *self.fault.lock() = None;
    }

    // =========================================================================
    // Task submission
    // =========================================================================

    /// Common submission path: allocate, populate, then submit or record.
    fn dispatch<F>(&self, stream_id: StreamId, build: F) -> Result<TaskTicket>
    where
        F: FnOnce(&Self) -> Result<TaskPayload>,
    {
        self.check_fault()?;
        let stream = self.public_stream(stream_id)?;
        match stream.capture_status() {
            CaptureStatus::Invalidated { .. } => Err(RuntimeError::CaptureInvalidated),
            CaptureStatus::Active { model, .. } => self.record_with(model, stream_id, build),
            CaptureStatus::None => self.submit_live(&stream, build),
        }
    }

    fn submit_live<F>(&self, stream: &Arc<Stream>, build: F) -> Result<TaskTicket>
    where
        F: FnOnce(&Self) -> Result<TaskPayload>,
    {
        let mut task = stream.alloc_task(TaskPayload::Control {
            cmd: ControlCommand::Noop,
        })?;
        match build(self) {
            Ok(payload) => task.payload = payload,
            Err(err) => {
                stream.recycle_task(task);
                return Err(err);
            }
        }
        if let Err(err) = self.runtime.driver().submit_task(&task) {
            stream.recycle_task(task);
            return Err(err);
        }
        let ticket = TaskTicket {
            stream: stream.id(),
            task: task.id,
            seq: task.seq,
        };
        stream.note_submitted(task);
        self.counters.tasks_submitted.fetch_add(1, Ordering::Relaxed);
        *self.last_submission.lock() = Some(ticket);
        Ok(ticket)
    }

    /// Capture-mode path: redirect to the internal capture stream and
    /// record into the model instead of submitting.
    fn record_with<F>(&self, model_id: ModelId, public: StreamId, build: F) -> Result<TaskTicket>
    where
        F: FnOnce(&Self) -> Result<TaskPayload>,
    {
        let internal_id = {
            let models = self.models.lock();
            let model = models
                .get(&model_id)
                .ok_or(RuntimeError::ModelNotFound(model_id))?;
            model
                .member_internal(public)
                .ok_or(RuntimeError::StreamNotCaptured(public))?
        };
        let internal = self.stream_any(internal_id)?;

        let mut task = match internal.alloc_task(TaskPayload::Control {
            cmd: ControlCommand::Noop,
        }) {
            Ok(task) => task,
            Err(err) => {
                if let Some(model) = self.models.lock().get_mut(&model_id) {
                    model.latch_fault(err.to_string());
                }
                return Err(err);
            }
        };
        match build(self) {
            Ok(payload) => task.payload = payload,
            Err(err) => {
                internal.recycle_task(task);
                if let Some(model) = self.models.lock().get_mut(&model_id) {
                    model.latch_fault(err.to_string());
                }
                return Err(err);
            }
        }

        let group = match self.public_stream(public)?.group_status() {
            TaskGroupStatus::Sampling(group) => Some(group),
            _ => None,
        };

        let mut models = self.models.lock();
        let model = models
            .get_mut(&model_id)
            .ok_or(RuntimeError::ModelNotFound(model_id))?;
        let node = match model.record(public, &task) {
            Ok(node) => node,
            Err(err) => {
                internal.recycle_task(task);
                return Err(err);
            }
        };
        if let Some(group) = group {
            if let Some(group) = model.group_mut(group) {
                group.push_node(node);
            }
        }
        drop(models);

        let ticket = TaskTicket {
            stream: public,
            task: task.id,
            seq: task.seq,
        };
        internal.recycle_task(task);
        self.counters.tasks_recorded.fetch_add(1, Ordering::Relaxed);
        *self.last_submission.lock() = Some(ticket);
        Ok(ticket)
    }

    /// Launch a pool-managed kernel by module id and tiling key.
    pub fn launch_kernel(
        &self,
        stream: StreamId,
        module: ModuleId,
        tiling_key: u32,
        block_dim: u32,
        args: &[u8],
    ) -> Result<TaskTicket> {
        if block_dim == 0 {
            return Err(RuntimeError::InvalidArgument(
                "block_dim must be non-zero".into(),
            ));
        }
        let took_ref = Cell::new(false);
        let result = self.dispatch(stream, |ctx| {
            let handle = ctx.resolve_module(module)?;
            took_ref.set(true);
            let args = ctx.load_args(args)?;
            Ok(TaskPayload::KernelLaunch {
                module: Some(module),
                handle,
                tiling_key,
                block_dim,
                args,
            })
        });
        if result.is_err() && took_ref.get() {
            // Give back the reference the failed launch took.
            let _ = self.module_table.release(module);
        }
        result
    }

    /// Launch a kernel by raw device entry handle.
    pub fn launch_kernel_ptr(
        &self,
        stream: StreamId,
        entry: u64,
        block_dim: u32,
        args: &[u8],
    ) -> Result<TaskTicket> {
        if block_dim == 0 {
            return Err(RuntimeError::InvalidArgument(
                "block_dim must be non-zero".into(),
            ));
        }
        self.dispatch(stream, |ctx| {
            let args = ctx.load_args(args)?;
            Ok(TaskPayload::KernelLaunch {
                module: None,
                handle: entry,
                tiling_key: 0,
                block_dim,
                args,
            })
        })
    }

    fn load_args(&self, bytes: &[u8]) -> Result<crate::task::ArgBlock> {
        if bytes.len() <= self.runtime.config().inline_arg_bytes {
            return Ok(crate::task::ArgBlock::Inline(bytes.to_vec()));
        }
        let ptr = self.scratch.lock().alloc(bytes.len())?;
        self.runtime.driver().copy_sync(ptr, bytes)?;
        Ok(crate::task::ArgBlock::Staged {
            ptr,
            len: bytes.len(),
        })
    }

    /// Submit an asynchronous memory copy.
    pub fn memcpy(
        &self,
        stream: StreamId,
        dst: u64,
        src: u64,
        len: usize,
        kind: CopyKind,
    ) -> Result<TaskTicket> {
        if len == 0 {
            return Err(RuntimeError::InvalidArgument("zero-length copy".into()));
        }
        self.dispatch(stream, |_| Ok(TaskPayload::Memcpy { dst, src, len, kind }))
    }

    /// Submit an asynchronous memory fill.
    pub fn memset(
        &self,
        stream: StreamId,
        dst: u64,
        value: u8,
        len: usize,
    ) -> Result<TaskTicket> {
        if len == 0 {
            return Err(RuntimeError::InvalidArgument("zero-length fill".into()));
        }
        self.dispatch(stream, |_| Ok(TaskPayload::Memset { dst, value, len }))
    }

    /// Record (signal) a notify on a stream.
    pub fn notify_record(&self, stream: StreamId, notify: NotifyId) -> Result<TaskTicket> {
        self.check_notify(notify)?;
        self.dispatch(stream, |_| Ok(TaskPayload::NotifyRecord { notify }))
    }

    /// Wait on a notify on a stream.
    ///
    /// If the notify was recorded inside a live capture and this stream is
    /// not yet a member, the stream transparently joins that capture; this
    /// is how fan-out dependency graphs are captured from ordinary
    /// multi-stream code.
    pub fn notify_wait(&self, stream: StreamId, notify: NotifyId) -> Result<TaskTicket> {
        self.check_notify(notify)?;
        self.maybe_join_capture(stream, notify)?;
        self.dispatch(stream, |_| Ok(TaskPayload::NotifyWait { notify }))
    }

    /// Submit a stream-switch control task.
    pub fn stream_switch(&self, stream: StreamId, target: StreamId) -> Result<TaskTicket> {
        self.public_stream(target)?;
        self.dispatch(stream, |_| {
            Ok(TaskPayload::Control {
                cmd: ControlCommand::Switch { target },
            })
        })
    }

    /// Submit a stream-activate control task.
    pub fn stream_set_active(&self, stream: StreamId) -> Result<TaskTicket> {
        self.dispatch(stream, |_| {
            Ok(TaskPayload::Control {
                cmd: ControlCommand::SetActive,
            })
        })
    }

    /// Register a device range for debug dumps.
    pub fn debug_register(&self, stream: StreamId, addr: u64, len: usize) -> Result<TaskTicket> {
        self.dispatch(stream, |_| {
            Ok(TaskPayload::Control {
                cmd: ControlCommand::DebugRegister { addr, len },
            })
        })
    }

    /// Unregister a debug range.
    pub fn debug_unregister(&self, stream: StreamId, addr: u64) -> Result<TaskTicket> {
        self.dispatch(stream, |_| {
            Ok(TaskPayload::Control {
                cmd: ControlCommand::DebugUnregister { addr },
            })
        })
    }

    // =========================================================================
    // Synchronization
    // =========================================================================

    /// Synchronize one stream with a timeout.
    pub fn stream_synchronize(&self, stream: StreamId, timeout: Duration) -> Result<()> {
        let stream = self.public_stream(stream)?;
        let result = stream.synchronize(&self.runtime, timeout);
        if let Err(RuntimeError::DeviceFault(message)) = &result {
            self.latch_fault(message);
        }
        result
    }

    /// Forcibly drain and reset one stream's queue pair.
    pub fn stream_abort(&self, stream: StreamId) -> Result<()> {
        let stream = self.public_stream(stream)?;
        stream.abort(&self.runtime)
    }

    /// Synchronize every stream in the context.
    ///
    /// Performs a best-effort non-blocking reclamation pass first, then
    /// synchronizes each stream not flagged do-not-sync in turn, the
    /// default stream last. The first non-OK result is remembered and
    /// returned after the remaining streams are attempted; deadline expiry
    /// and device abort terminate the operation immediately.
    pub fn synchronize(&self, timeout: Duration) -> Result<()> {
        let clock = self.runtime.clock();
        let deadline = clock.now() + timeout;

        {
            let scopes = self.capture_lock.lock();
            if scopes.total_active > 0
                && scopes.thread_mode(std::thread::current().id()) != CaptureMode::Relaxed
            {
                return Err(RuntimeError::CaptureScopeConflict(CaptureMode::Global));
            }
        }

        let streams: Vec<Arc<Stream>> = {
            let arena = self.streams.read();
            arena
                .values()
                .filter(|s| !s.is_internal() && !s.flags().do_not_sync)
                .cloned()
                .collect()
        };

        // Reduce blocking time before the per-stream waits.
        for stream in &streams {
            stream.reclaim_pass(&self.runtime);
        }

        let mut first_err: Option<RuntimeError> = None;
        let mut sync_one = |stream: &Arc<Stream>| -> Result<()> {
            match stream.synchronize_until(&self.runtime, deadline, timeout) {
                Ok(()) => Ok(()),
                Err(err) => {
                    if let RuntimeError::DeviceFault(message) = &err {
                        self.latch_fault(message);
                    }
                    if err.aborts_sync() {
                        return Err(err);
                    }
                    if first_err.is_none() {
                        first_err = Some(err);
                    }
                    Ok(())
                }
            }
        };

        for stream in streams.iter().filter(|s| s.id() != self.default_stream) {
            sync_one(stream)?;
        }
        if let Some(default) = streams.iter().find(|s| s.id() == self.default_stream) {
            sync_one(default)?;
        }

        match first_err {
            Some(err) => Err(err),
            None => {
                // Everything drained; staged arguments are dead.
                self.scratch.lock().reset();
                Ok(())
            }
        }
    }

    // =========================================================================
    // Capture
    // =========================================================================

    /// Begin capturing a stream's submissions into a new model.
    pub fn begin_capture(&self, stream_id: StreamId, mode: CaptureMode) -> Result<ModelId> {
        if stream_id == self.default_stream {
            return Err(RuntimeError::Unsupported(
                "the default stream cannot be captured".into(),
            ));
        }
        let stream = self.public_stream(stream_id)?;
        let mut scopes = self.capture_lock.lock();

        if stream.capture_status() != CaptureStatus::None {
            return Err(RuntimeError::StreamCaptured(stream_id));
        }
        let thread = std::thread::current().id();
        match mode {
            CaptureMode::Global if scopes.total_active > 0 => {
                return Err(RuntimeError::CaptureScopeConflict(mode));
            }
            CaptureMode::ThreadLocal
                if scopes.per_thread.get(&thread).copied().unwrap_or(0) > 0 =>
            {
                return Err(RuntimeError::CaptureScopeConflict(mode));
            }
            _ if scopes.global_active > 0 => {
                return Err(RuntimeError::CaptureScopeConflict(CaptureMode::Global));
            }
            _ => {}
        }

        let internal_id = self.create_stream_inner(
            StreamFlags {
                do_not_sync: true,
                ..StreamFlags::default()
            },
            true,
        )?;
        let internal = self.stream_any(internal_id)?;

        let model_id = ModelId::new(self.next_model_id.fetch_add(1, Ordering::AcqRel) + 1);
        let model = CaptureModel::new(model_id, mode, stream_id, internal_id, thread);

        self.bind_stream_to_model(&internal);
        self.bind_stream_to_model(&stream);
        stream.set_capture(CaptureStatus::Active {
            model: model_id,
            capture_stream: internal_id,
        });
        self.models.lock().insert(model_id, model);
        scopes.note_begin(mode, thread);
        self.counters.captures_begun.fetch_add(1, Ordering::Relaxed);

        info!(stream = %stream_id, model = %model_id, ?mode, "capture begun");
        Ok(model_id)
    }

    /// Transparently join `stream` to the capture that recorded `notify`,
    /// if one exists and the stream is not already a member.
    fn maybe_join_capture(&self, stream_id: StreamId, notify: NotifyId) -> Result<()> {
        let stream = self.public_stream(stream_id)?;
        if stream.capture_status() != CaptureStatus::None {
            return Ok(());
        }
        let _scopes = self.capture_lock.lock();
        // Re-check under the lock: an end-capture may have raced us.
        if stream.capture_status() != CaptureStatus::None {
            return Ok(());
        }
        let model_id = {
            let models = self.models.lock();
            models
                .values()
                .find(|m| m.state() == CaptureState::Capturing && m.recorded_notify(notify))
                .map(|m| m.id())
        };
        let Some(model_id) = model_id else {
            return Ok(());
        };

        let internal_id = self.create_stream_inner(
            StreamFlags {
                do_not_sync: true,
                ..StreamFlags::default()
            },
            true,
        )?;
        let internal = self.stream_any(internal_id)?;

        let mut models = self.models.lock();
        let model = models
            .get_mut(&model_id)
            .ok_or(RuntimeError::ModelNotFound(model_id))?;
        model.add_member(stream_id, internal_id, false);
        drop(models);

        self.bind_stream_to_model(&internal);
        self.bind_stream_to_model(&stream);
        stream.set_capture(CaptureStatus::Active {
            model: model_id,
            capture_stream: internal_id,
        });
        debug!(stream = %stream_id, model = %model_id, "stream joined capture");
        Ok(())
    }

    /// Explicitly add a stream to a live capture model.
    pub fn model_add_stream(&self, model_id: ModelId, stream_id: StreamId) -> Result<()> {
        let stream = self.public_stream(stream_id)?;
        let _scopes = self.capture_lock.lock();
        if stream.capture_status() != CaptureStatus::None {
            return Err(RuntimeError::StreamCaptured(stream_id));
        }
        {
            let models = self.models.lock();
            let model = models
                .get(&model_id)
                .ok_or(RuntimeError::ModelNotFound(model_id))?;
            if model.state() != CaptureState::Capturing {
                return Err(RuntimeError::CaptureInvalidated);
            }
        }
        let internal_id = self.create_stream_inner(
            StreamFlags {
                do_not_sync: true,
                ..StreamFlags::default()
            },
            true,
        )?;
        let internal = self.stream_any(internal_id)?;

        let mut models = self.models.lock();
        let model = models
            .get_mut(&model_id)
            .ok_or(RuntimeError::ModelNotFound(model_id))?;
        model.add_member(stream_id, internal_id, true);
        drop(models);

        self.bind_stream_to_model(&internal);
        self.bind_stream_to_model(&stream);
        stream.set_capture(CaptureStatus::Active {
            model: model_id,
            capture_stream: internal_id,
        });
        Ok(())
    }

    /// End a capture, validating and finalizing the recorded graph.
    ///
    /// Any failure destroys the model and resets every member stream to
    /// capture status `None`.
    pub fn end_capture(&self, stream_id: StreamId) -> Result<ModelId> {
        let stream = self.public_stream(stream_id)?;
        let mut scopes = self.capture_lock.lock();

        let model_id = match stream.capture_status() {
            CaptureStatus::None => return Err(RuntimeError::StreamNotCaptured(stream_id)),
            CaptureStatus::Invalidated { model } => {
                self.destroy_capture_locked(&mut scopes, model);
                return Err(RuntimeError::CaptureInvalidated);
            }
            CaptureStatus::Active { model, .. } => model,
        };

        // Pre-finalization checks. Each failure destroys the model.
        let check = {
            let models = self.models.lock();
            let model = models
                .get(&model_id)
                .ok_or(RuntimeError::ModelNotFound(model_id))?;
            if model.origin() != stream_id {
                Err(RuntimeError::CaptureUnmatched(stream_id))
            } else if model.mode() != CaptureMode::Relaxed
                && model.begin_thread() != std::thread::current().id()
            {
                Err(RuntimeError::CaptureWrongThread)
            } else if let Some(fault) = model.latched_fault() {
                Err(fault)
            } else {
                model.validate()
            }
        };
        if let Err(err) = check {
            self.destroy_capture_locked(&mut scopes, model_id);
            return Err(err);
        }

        // Allocate a completion notify per auxiliary branch so a replay
        // executor can observe each branch finish, then freeze the graph.
        let aux: Vec<StreamId> = {
            let models = self.models.lock();
            let model = models
                .get(&model_id)
                .ok_or(RuntimeError::ModelNotFound(model_id))?;
            model
                .members()
                .iter()
                .filter(|m| m.public != stream_id)
                .map(|m| m.public)
                .collect()
        };
        let mode;
        let begin_thread;
        {
            let mut models = self.models.lock();
            let model = models
                .get_mut(&model_id)
                .ok_or(RuntimeError::ModelNotFound(model_id))?;
            for member in aux {
                let notify = NotifyId::new(self.next_notify_id.fetch_add(1, Ordering::AcqRel) + 1);
                self.notifies.lock().insert(notify);
                let seq = model.task_count() as u64 + 1;
                model.append_completion_notify(member, notify, seq);
            }
            model.finalize();
            mode = model.mode();
            begin_thread = model.begin_thread();

            // Release every member back to the free set and tear down the
            // internal capture streams.
            for member in model.members().to_vec() {
                if let Ok(public) = self.stream_any(member.public) {
                    public.set_capture(CaptureStatus::None);
                    public.set_group(TaskGroupStatus::None);
                    self.unbind_stream_from_model(&public);
                }
                self.destroy_internal_stream(member.internal);
            }
        }

        scopes.note_end(mode, begin_thread);
        self.counters.captures_finished.fetch_add(1, Ordering::Relaxed);
        info!(stream = %stream_id, model = %model_id, "capture finished");
        Ok(model_id)
    }

    /// Poison a live capture after a driver-detected fault.
    pub fn terminate_capture(&self, model_id: ModelId) -> Result<()> {
        let mut models = self.models.lock();
        let model = models
            .get_mut(&model_id)
            .ok_or(RuntimeError::ModelNotFound(model_id))?;
        if model.state() != CaptureState::Capturing {
            return Ok(());
        }
        model.invalidate();
        for member in model.members().to_vec() {
            if let Ok(stream) = self.stream_any(member.public) {
                stream.set_capture(CaptureStatus::Invalidated { model: model_id });
            }
        }
        warn!(model = %model_id, "capture invalidated");
        Ok(())
    }

    fn destroy_internal_stream(&self, id: StreamId) {
        let removed = self.streams.write().remove(&id);
        if let Some(stream) = removed {
            stream.resource_clear();
            if let Err(err) = self.runtime.driver().destroy_queue_pair(stream.queue()) {
                warn!(stream = %id, %err, "failed to destroy capture stream queue");
            }
        }
    }

    /// Destroy a capture's streams-and-scopes footprint and drop the model.
    fn destroy_capture_locked(&self, scopes: &mut CaptureScopes, model_id: ModelId) {
        let removed = self.models.lock().remove(&model_id);
        let Some(model) = removed else {
            return;
        };
        for member in model.members() {
            if let Ok(public) = self.stream_any(member.public) {
                public.set_capture(CaptureStatus::None);
                public.set_group(TaskGroupStatus::None);
                self.unbind_stream_from_model(&public);
            }
            self.destroy_internal_stream(member.internal);
        }
        if model.state() != CaptureState::Finished {
            scopes.note_end(model.mode(), model.begin_thread());
        }
        debug!(model = %model_id, "capture model destroyed");
    }

    /// Destroy a model in any state.
    pub fn destroy_model(&self, model_id: ModelId) -> Result<()> {
        let mut scopes = self.capture_lock.lock();
        if !self.models.lock().contains_key(&model_id) {
            return Err(RuntimeError::ModelNotFound(model_id));
        }
        self.destroy_capture_locked(&mut scopes, model_id);
        Ok(())
    }

    /// Capture status report for a stream.
    pub fn capture_info(&self, stream_id: StreamId) -> Result<CaptureInfo> {
        let stream = self.public_stream(stream_id)?;
        let status = stream.capture_status();
        let model = status.model();
        let recorded_tasks = model
            .and_then(|id| self.models.lock().get(&id).map(|m| m.task_count()))
            .unwrap_or(0);
        Ok(CaptureInfo {
            status,
            model,
            recorded_tasks,
        })
    }

    /// Summary of a model.
    pub fn model_info(&self, model_id: ModelId) -> Result<ModelInfo> {
        let models = self.models.lock();
        let model = models
            .get(&model_id)
            .ok_or(RuntimeError::ModelNotFound(model_id))?;
        Ok(ModelInfo {
            id: model_id,
            state: model.state(),
            recorded_tasks: model.task_count(),
            member_streams: model.members().len(),
        })
    }

    /// Run `f` against a model's recorded graph.
    pub fn with_model_graph<R>(
        &self,
        model_id: ModelId,
        f: impl FnOnce(&CaptureGraph) -> R,
    ) -> Result<R> {
        let models = self.models.lock();
        let model = models
            .get(&model_id)
            .ok_or(RuntimeError::ModelNotFound(model_id))?;
        Ok(f(model.graph()))
    }

    /// Swap the calling thread's capture-interaction mode, returning the
    /// previous one.
    pub fn exchange_thread_capture_mode(&self, mode: CaptureMode) -> CaptureMode {
        let thread = std::thread::current().id();
        let mut scopes = self.capture_lock.lock();
        let previous = scopes.thread_mode(thread);
        scopes.thread_modes.insert(thread, mode);
        previous
    }

    // =========================================================================
    // Task groups
    // =========================================================================

    /// Open a task group on a capturing stream.
    ///
    /// Issues the device-dependent number of no-op priming tasks for queue
    /// alignment, then transitions the stream to sampling.
    pub fn begin_task_group(&self, stream_id: StreamId) -> Result<()> {
        let stream = self.public_stream(stream_id)?;
        let _guard = stream.group_mutex().lock();

        if stream.group_status() != TaskGroupStatus::None {
            return Err(RuntimeError::TaskGroupOpen(stream_id));
        }
        let model_id = match stream.capture_status() {
            CaptureStatus::Active { model, .. } => model,
            _ => return Err(RuntimeError::TaskGroupState(stream_id)),
        };

        let priming = self.runtime.driver().device_properties().priming_task_count;
        for _ in 0..priming {
            self.record_with(model_id, stream_id, |_| {
                Ok(TaskPayload::Control {
                    cmd: ControlCommand::Noop,
                })
            })?;
        }

        let group_id = TaskGroupId::new(self.next_group_id.fetch_add(1, Ordering::AcqRel) + 1);
        let mut models = self.models.lock();
        let model = models
            .get_mut(&model_id)
            .ok_or(RuntimeError::ModelNotFound(model_id))?;
        model.insert_group(TaskGroup::new(group_id, stream_id));
        drop(models);

        stream.set_group(TaskGroupStatus::Sampling(group_id));
        debug!(stream = %stream_id, group = %group_id, "task group opened");
        Ok(())
    }

    /// Close the open task group, returning its update handle.
    ///
    /// If the model latched an error or was invalidated while sampling,
    /// the group is discarded and the error returned instead.
    pub fn end_task_group(&self, stream_id: StreamId) -> Result<TaskGroupId> {
        let stream = self.public_stream(stream_id)?;
        let _guard = stream.group_mutex().lock();

        let group_id = match stream.group_status() {
            TaskGroupStatus::Sampling(group) => group,
            _ => return Err(RuntimeError::TaskGroupState(stream_id)),
        };
        let model_id = match stream.capture_status() {
            CaptureStatus::Active { model, .. } => model,
            _ => {
                stream.set_group(TaskGroupStatus::None);
                return Err(RuntimeError::CaptureInvalidated);
            }
        };

        let mut models = self.models.lock();
        let model = models
            .get_mut(&model_id)
            .ok_or(RuntimeError::ModelNotFound(model_id))?;
        if model.state() == CaptureState::Invalidated {
            model.remove_group(group_id);
            drop(models);
            stream.set_group(TaskGroupStatus::None);
            return Err(RuntimeError::CaptureInvalidated);
        }
        if let Some(fault) = model.latched_fault() {
            model.remove_group(group_id);
            drop(models);
            stream.set_group(TaskGroupStatus::None);
            return Err(fault);
        }
        match model.group_mut(group_id) {
            Some(group) => group.seal(),
            None => {
                drop(models);
                stream.set_group(TaskGroupStatus::None);
                return Err(RuntimeError::TaskGroupNotFound(group_id));
            }
        }
        drop(models);

        stream.set_group(TaskGroupStatus::None);
        debug!(stream = %stream_id, group = %group_id, "task group sealed");
        Ok(group_id)
    }

    fn model_for_group(&self, group: TaskGroupId) -> Result<ModelId> {
        let models = self.models.lock();
        models
            .values()
            .find(|m| m.group(group).is_some())
            .map(|m| m.id())
            .ok_or(RuntimeError::TaskGroupNotFound(group))
    }

    /// Acquire the single-updater latch on a sealed task group.
    pub fn begin_task_update(&self, stream_id: StreamId, group: TaskGroupId) -> Result<()> {
        let stream = self.public_stream(stream_id)?;
        let _guard = stream.group_mutex().lock();

        if stream.group_status() != TaskGroupStatus::None {
            return Err(RuntimeError::TaskGroupState(stream_id));
        }
        let model_id = self.model_for_group(group)?;
        let mut models = self.models.lock();
        let model = models
            .get_mut(&model_id)
            .ok_or(RuntimeError::ModelNotFound(model_id))?;
        if model.state() != CaptureState::Finished {
            return Err(RuntimeError::TaskGroupState(stream_id));
        }
        model
            .group_mut(group)
            .ok_or(RuntimeError::TaskGroupNotFound(group))?
            .begin_update(stream_id)?;
        drop(models);

        stream.set_group(TaskGroupStatus::Updating(group));
        Ok(())
    }

    /// Rewrite one recorded task in a group under update.
    pub fn update_task(
        &self,
        stream_id: StreamId,
        group: TaskGroupId,
        index: usize,
        payload: TaskPayload,
    ) -> Result<()> {
        let stream = self.public_stream(stream_id)?;
        if stream.group_status() != TaskGroupStatus::Updating(group) {
            return Err(RuntimeError::TaskGroupState(stream_id));
        }
        let model_id = self.model_for_group(group)?;
        let mut models = self.models.lock();
        let model = models
            .get_mut(&model_id)
            .ok_or(RuntimeError::ModelNotFound(model_id))?;
        let node = model
            .group_mut(group)
            .ok_or(RuntimeError::TaskGroupNotFound(group))?
            .mark_rewritten(index)?;
        model.rewrite_node(node, payload)
    }

    /// Release the update latch.
    ///
    /// Fails unless every task in the group's index was rewritten.
    pub fn end_task_update(&self, stream_id: StreamId, group: TaskGroupId) -> Result<()> {
        let stream = self.public_stream(stream_id)?;
        let _guard = stream.group_mutex().lock();

        if stream.group_status() != TaskGroupStatus::Updating(group) {
            return Err(RuntimeError::TaskGroupState(stream_id));
        }
        let model_id = self.model_for_group(group)?;
        let result = {
            let mut models = self.models.lock();
            let model = models
                .get_mut(&model_id)
                .ok_or(RuntimeError::ModelNotFound(model_id))?;
            model
                .group_mut(group)
                .ok_or(RuntimeError::TaskGroupNotFound(group))?
                .end_update(stream_id)
        };
        stream.set_group(TaskGroupStatus::None);
        result
    }

    // =========================================================================
    // Teardown
    // =========================================================================

    /// Tear the context down: models first, then streams, then the scratch
    /// buffer. Per-stream failures are logged and teardown continues.
    pub fn teardown(&self) -> Result<()> {
        if self.torn_down.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        info!("context teardown begun");

        let model_ids: Vec<ModelId> = self.models.lock().keys().copied().collect();
        {
            let mut scopes = self.capture_lock.lock();
            for model_id in model_ids {
                self.destroy_capture_locked(&mut scopes, model_id);
            }
        }

        if let Err(err) = self.try_recycle_module_pools() {
            warn!(%err, "module pool sweep failed during teardown");
        }

        let stream_ids: Vec<StreamId> = {
            let arena = self.streams.read();
            arena
                .keys()
                .copied()
                .filter(|id| *id != self.default_stream)
                .collect()
        };
        for id in stream_ids {
            if let Err(err) = self.teardown_stream(id) {
                warn!(stream = %id, %err, "stream teardown failed; continuing");
            }
        }
        if let Err(err) = self.teardown_stream(self.default_stream) {
            warn!(stream = %self.default_stream, %err, "default stream teardown failed");
        }

        let scratch_base = self.scratch.lock().base;
        if let Err(err) = self.runtime.driver().free_device_memory(scratch_base) {
            warn!(%err, "failed to free scratch buffer");
        }
        info!("context teardown complete");
        Ok(())
    }

    fn teardown_stream(&self, id: StreamId) -> Result<()> {
        let removed = self.streams.write().remove(&id);
        let Some(stream) = removed else {
            return Ok(());
        };
        self.free_streams.lock().remove(&id);
        stream.reclaim_pass(&self.runtime);
        stream.resource_clear();
        self.runtime.driver().destroy_queue_pair(stream.queue())
    }
}

impl Drop for Context {
    fn drop(&mut self) {
        if !self.torn_down.load(Ordering::Acquire) {
            let _ = self.teardown();
        }
    }
}

impl std::fmt::Debug for Context {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Context")
            .field("default_stream", &self.default_stream)
            .field("streams", &self.streams.read().len())
            .field("models", &self.models.lock().len())
            .finish_non_exhaustive()
    }
}

//! Streams: ordered, asynchronously drained task queues.
//!
//! A stream is bound to one hardware queue pair for its whole life. Tasks
//! submitted on it execute in submission order; cross-stream order exists
//! only where a notify record/wait pair or a capture-graph edge creates it.
//!
//! The stream also carries the two per-stream state machines the context
//! drives: capture status (`None / Active / Invalidated`) and task-group
//! status (`None / Sampling / Updating`).

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::capture::ModelId;
use crate::driver::{DeviceStatus, QueueId, QueuePairStatus};
use crate::error::{Result, RuntimeError};
use crate::runtime::Runtime;
use crate::task::{Task, TaskPayload};
use crate::task_group::TaskGroupId;
use crate::task_pool::{TaskPool, TaskPoolStats};

/// Stream identity within a context.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(transparent)]
pub struct StreamId(pub u64);

impl StreamId {
    /// Create a stream id.
    pub const fn new(id: u64) -> Self {
        StreamId(id)
    }
}

impl std::fmt::Display for StreamId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "stream-{}", self.0)
    }
}

/// Scheduling priority hint for a stream's queue pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StreamPriority {
    /// Default priority.
    #[default]
    Normal,
    /// Elevated priority.
    High,
}

/// Creation flags for a stream.
#[derive(Debug, Clone, Copy, Default)]
pub struct StreamFlags {
    /// Queue priority hint.
    pub priority: StreamPriority,
    /// Exclude this stream from context-wide synchronization.
    pub do_not_sync: bool,
}

/// Capture status of a stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CaptureStatus {
    /// Not capturing.
    None,
    /// Member of a live capture; submissions are redirected to the
    /// internal capture stream.
    Active {
        /// Model recording this stream.
        model: ModelId,
        /// Internal capture stream receiving the redirected tasks.
        capture_stream: StreamId,
    },
    /// The capture faulted; capture operations are rejected until the
    /// capture is ended or destroyed.
    Invalidated {
        /// Model that was recording this stream.
        model: ModelId,
    },
}

impl CaptureStatus {
    /// Model this stream belongs to, if any.
    pub fn model(&self) -> Option<ModelId> {
        match self {
            Self::None => None,
            Self::Active { model, .. } | Self::Invalidated { model } => Some(*model),
        }
    }
}

/// Task-group status of a stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskGroupStatus {
    /// No group open.
    None,
    /// Recording tasks into an open group.
    Sampling(TaskGroupId),
    /// Rewriting a finished group.
    Updating(TaskGroupId),
}

/// Failure mode latched on a stream during administrative recovery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureMode {
    /// The stream is being force-drained by [`Stream::abort`].
    Aborting,
    /// The queue pair faulted and has not been restored.
    Faulted,
}

/// Mutable per-stream state guarded by one mutex.
#[derive(Debug)]
struct StreamState {
    capture: CaptureStatus,
    group: TaskGroupStatus,
    failure: Option<FailureMode>,
    model_count: usize,
}

/// Statistics snapshot for one stream.
#[derive(Debug, Clone)]
pub struct StreamStats {
    /// Highest sequence number handed to the driver.
    pub submitted_seq: u64,
    /// Tasks currently in flight.
    pub inflight: usize,
    /// Task pool statistics.
    pub pool: TaskPoolStats,
    /// Latched failure mode, if any.
    pub failure: Option<FailureMode>,
}

/// An ordered task queue bound to one hardware queue pair.
pub struct Stream {
    id: StreamId,
    queue: QueueId,
    flags: StreamFlags,
    /// Internal capture streams record instead of submitting and are
    /// invisible to the public API.
    internal: bool,
    state: Mutex<StreamState>,
    /// Checked by the submission path to break livelocks while an abort
    /// is force-draining the queue.
    aborting: AtomicBool,
    pool: TaskPool,
    /// Tasks handed to the driver, ordered by sequence number.
    inflight: Mutex<VecDeque<Task>>,
    submitted_seq: AtomicU64,
    /// Serializes synchronize against abort/clean/restore.
    sync_lock: Mutex<()>,
    /// Serializes task-group transitions on this stream.
    group_lock: Mutex<()>,
}

impl Stream {
    /// Create a stream bound to `queue`.
    pub(crate) fn new(
        id: StreamId,
        queue: QueueId,
        flags: StreamFlags,
        internal: bool,
        pool_capacity: usize,
        pool_overflow: usize,
        task_ids: Arc<AtomicU64>,
    ) -> Self {
        Self {
            id,
            queue,
            flags,
            internal,
            state: Mutex::new(StreamState {
                capture: CaptureStatus::None,
                group: TaskGroupStatus::None,
                failure: None,
                model_count: 0,
            }),
            aborting: AtomicBool::new(false),
            pool: TaskPool::new(id, queue, pool_capacity, pool_overflow, task_ids),
            inflight: Mutex::new(VecDeque::new()),
            submitted_seq: AtomicU64::new(0),
            sync_lock: Mutex::new(()),
            group_lock: Mutex::new(()),
        }
    }

    /// Stream identity.
    pub fn id(&self) -> StreamId {
        self.id
    }

    /// Hardware queue pair this stream drains into.
    pub fn queue(&self) -> QueueId {
        self.queue
    }

    /// Creation flags.
    pub fn flags(&self) -> StreamFlags {
        self.flags
    }

    pub(crate) fn is_internal(&self) -> bool {
        self.internal
    }

    /// Current capture status.
    pub fn capture_status(&self) -> CaptureStatus {
        self.state.lock().capture
    }

    /// True while the stream is a member of a live capture.
    pub fn is_capturing(&self) -> bool {
        matches!(self.state.lock().capture, CaptureStatus::Active { .. })
    }

    /// Current task-group status.
    pub fn group_status(&self) -> TaskGroupStatus {
        self.state.lock().group
    }

    /// Latched failure mode, if any.
    pub fn failure_mode(&self) -> Option<FailureMode> {
        self.state.lock().failure
    }

    /// Statistics snapshot.
    pub fn stats(&self) -> StreamStats {
        StreamStats {
            submitted_seq: self.submitted_seq.load(Ordering::Acquire),
            inflight: self.inflight.lock().len(),
            pool: self.pool.stats(),
            failure: self.state.lock().failure,
        }
    }

    // --- state transitions driven by the context ---

    pub(crate) fn set_capture(&self, capture: CaptureStatus) {
        self.state.lock().capture = capture;
    }

    pub(crate) fn set_group(&self, group: TaskGroupStatus) {
        self.state.lock().group = group;
    }

    pub(crate) fn bind_model(&self) {
        self.state.lock().model_count += 1;
    }

    /// Returns the model count after unbinding.
    pub(crate) fn unbind_model(&self) -> usize {
        let mut state = self.state.lock();
        state.model_count = state.model_count.saturating_sub(1);
        state.model_count
    }

    pub(crate) fn model_count(&self) -> usize {
        self.state.lock().model_count
    }

    pub(crate) fn group_mutex(&self) -> &Mutex<()> {
        &self.group_lock
    }

    // --- allocation and submission bookkeeping ---

    /// Allocate a task descriptor from this stream's pool.
    pub(crate) fn alloc_task(&self, payload: TaskPayload) -> Result<Task> {
        if self.aborting.load(Ordering::Acquire) {
            return Err(RuntimeError::StreamAborting(self.id));
        }
        self.pool.alloc(payload)
    }

    /// Return an unsubmitted descriptor to the pool.
    pub(crate) fn recycle_task(&self, task: Task) {
        self.pool.recycle(task);
    }

    /// Record a successfully submitted task.
    pub(crate) fn note_submitted(&self, task: Task) {
        self.submitted_seq.fetch_max(task.seq, Ordering::AcqRel);
        self.inflight.lock().push_back(task);
    }

    /// Recycle every in-flight task whose sequence number the completion
    /// watermark has passed. Non-blocking. Returns the number reclaimed.
    pub(crate) fn reclaim_completed(&self, completed: u64) -> usize {
        let mut inflight = self.inflight.lock();
        let mut reclaimed = 0;
        while inflight
            .front()
            .map(|task| task.seq <= completed)
            .unwrap_or(false)
        {
            if let Some(task) = inflight.pop_front() {
                self.pool.recycle(task);
                reclaimed += 1;
            }
        }
        reclaimed
    }

    /// Best-effort reclamation pass against the driver's current watermark.
    pub(crate) fn reclaim_pass(&self, rt: &Runtime) -> usize {
        match rt.driver().completed_seq(self.queue) {
            Ok(completed) => self.reclaim_completed(completed),
            Err(_) => 0,
        }
    }

    // --- synchronization ---

    /// Block until every task submitted so far has drained, or `timeout`
    /// elapses, or the device reports abort/fault.
    ///
    /// Fails immediately with `StreamCaptured` while the stream is in
    /// capture mode.
    pub fn synchronize(&self, rt: &Runtime, timeout: Duration) -> Result<()> {
        let deadline = rt.clock().now() + timeout;
        self.synchronize_until(rt, deadline, timeout)
    }

    /// Deadline form of [`synchronize`](Self::synchronize); `reported` is
    /// the caller's original timeout, carried into the error.
    pub(crate) fn synchronize_until(
        &self,
        rt: &Runtime,
        deadline: Instant,
        reported: Duration,
    ) -> Result<()> {
        if self.is_capturing() {
            return Err(RuntimeError::StreamCaptured(self.id));
        }
        let _guard = self.sync_lock.lock();
        let target = self.submitted_seq.load(Ordering::Acquire);
        let driver = rt.driver();
        let clock = rt.clock();
        loop {
            match driver.device_status() {
                DeviceStatus::Ok => {}
                DeviceStatus::Abort => return Err(RuntimeError::DeviceTaskAbort),
                DeviceStatus::Fault => {
                    return Err(RuntimeError::DeviceFault(format!(
                        "fault while draining {}",
                        self.id
                    )))
                }
            }
            let completed = driver.completed_seq(self.queue)?;
            self.reclaim_completed(completed);
            if completed >= target {
                return Ok(());
            }
            // Deadline is re-checked every iteration so callers are never
            // stalled appreciably past the requested bound.
            if clock.now() >= deadline {
                return Err(RuntimeError::StreamSyncTimeout(reported));
            }
            clock.sleep(rt.config().sync_poll_interval);
        }
    }

    // --- administrative queue recovery ---

    /// Drop all pending entries from the queue pair.
    pub fn clean_queue(&self, rt: &Runtime) -> Result<()> {
        let _guard = self.sync_lock.lock();
        rt.driver().clean_queue_pair(self.queue)
    }

    /// Recycle every in-flight task without waiting for completions.
    pub fn resource_clear(&self) -> usize {
        let mut inflight = self.inflight.lock();
        let mut reclaimed = 0;
        while let Some(task) = inflight.pop_front() {
            self.pool.recycle(task);
            reclaimed += 1;
        }
        reclaimed
    }

    /// Reset the queue pair after a clean or terminate.
    pub fn restore(&self, rt: &Runtime) -> Result<()> {
        let _guard = self.sync_lock.lock();
        rt.driver().restore_queue_pair(self.queue)
    }

    /// Forcibly drain and reset this stream's queue pair.
    ///
    /// Sets the aborting flag (the submission path rejects new work while
    /// it is up), cleans the queue, sends the kill command, polls the queue
    /// pair until the terminate is acknowledged, reclaims every in-flight
    /// task, restores the pair, and clears the failure mode. Any step
    /// failure is returned immediately without attempting later steps.
    pub fn abort(&self, rt: &Runtime) -> Result<()> {
        self.aborting.store(true, Ordering::Release);
        self.state.lock().failure = Some(FailureMode::Aborting);
        let _guard = self.sync_lock.lock();

        let driver = rt.driver();
        let clock = rt.clock();
        debug!(stream = %self.id, queue = %self.queue, "aborting stream");

        driver.clean_queue_pair(self.queue)?;
        driver.kill_queue_pair(self.queue)?;

        let timeout = rt.config().abort_timeout;
        let deadline = clock.now() + timeout;
        loop {
            match driver.queue_pair_status(self.queue)? {
                QueuePairStatus::TerminateAck => break,
                status => {
                    if clock.now() >= deadline {
                        warn!(stream = %self.id, ?status, "abort poll timed out");
                        return Err(RuntimeError::WaitTimeout(timeout));
                    }
                    clock.sleep(rt.config().abort_poll_interval);
                }
            }
        }

        let reclaimed = self.resource_clear();
        driver.restore_queue_pair(self.queue)?;

        self.state.lock().failure = None;
        self.aborting.store(false, Ordering::Release);
        debug!(stream = %self.id, reclaimed, "stream abort complete");
        Ok(())
    }
}

impl std::fmt::Debug for Stream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Stream")
            .field("id", &self.id)
            .field("queue", &self.queue)
            .field("internal", &self.internal)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::ControlCommand;

    fn make_stream() -> Stream {
        Stream::new(
            StreamId::new(1),
            QueueId::new(0),
            StreamFlags::default(),
            false,
            8,
            2,
            Arc::new(AtomicU64::new(0)),
        )
    }

    fn noop() -> TaskPayload {
        TaskPayload::Control {
            cmd: ControlCommand::Noop,
        }
    }

    #[test]
    fn test_capture_status_transitions() {
        let stream = make_stream();
        assert_eq!(stream.capture_status(), CaptureStatus::None);
        assert!(!stream.is_capturing());

        stream.set_capture(CaptureStatus::Active {
            model: ModelId::new(1),
            capture_stream: StreamId::new(9),
        });
        assert!(stream.is_capturing());
        assert_eq!(stream.capture_status().model(), Some(ModelId::new(1)));

        stream.set_capture(CaptureStatus::None);
        assert!(!stream.is_capturing());
    }

    #[test]
    fn test_submission_bookkeeping_and_reclaim() {
        let stream = make_stream();
        for _ in 0..3 {
            let task = stream.alloc_task(noop()).unwrap();
            stream.note_submitted(task);
        }
        assert_eq!(stream.stats().inflight, 3);
        assert_eq!(stream.stats().submitted_seq, 3);

        assert_eq!(stream.reclaim_completed(2), 2);
        assert_eq!(stream.stats().inflight, 1);

        assert_eq!(stream.reclaim_completed(3), 1);
        assert_eq!(stream.stats().inflight, 0);
        assert_eq!(stream.stats().pool.outstanding, 0);
    }

    #[test]
    fn test_alloc_rejected_while_aborting() {
        let stream = make_stream();
        stream.aborting.store(true, Ordering::Release);
        let err = stream.alloc_task(noop()).unwrap_err();
        assert!(matches!(err, RuntimeError::StreamAborting(_)));
    }

    #[test]
    fn test_resource_clear_recycles_everything() {
        let stream = make_stream();
        for _ in 0..5 {
            let task = stream.alloc_task(noop()).unwrap();
            stream.note_submitted(task);
        }
        assert_eq!(stream.resource_clear(), 5);
        assert_eq!(stream.stats().pool.outstanding, 0);
    }

    #[test]
    fn test_model_binding_counts() {
        let stream = make_stream();
        stream.bind_model();
        stream.bind_model();
        assert_eq!(stream.model_count(), 2);
        assert_eq!(stream.unbind_model(), 1);
        assert_eq!(stream.unbind_model(), 0);
        assert_eq!(stream.unbind_model(), 0);
    }
}

//! Driver boundary: the abstract capability of the device driver / HAL.
//!
//! The runtime never talks to hardware directly; everything below the
//! queue-pair line goes through [`Driver`]. Backends implement this trait
//! (see the `taskstream-sim` crate for the in-process simulator used by
//! tests).

use std::time::Duration;

use crate::error::Result;
use crate::task::{Task, TaskId};

/// Identity of a hardware command queue pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(transparent)]
pub struct QueueId(pub u32);

impl QueueId {
    /// Create a queue id.
    pub const fn new(id: u32) -> Self {
        QueueId(id)
    }
}

impl std::fmt::Display for QueueId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "queue-{}", self.0)
    }
}

/// Coarse device health as reported by the driver.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceStatus {
    /// Device operating normally.
    Ok,
    /// Device requested an administrative abort of outstanding work.
    Abort,
    /// Device reported a hardware fault.
    Fault,
}

/// State of a single queue pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueuePairStatus {
    /// No outstanding entries.
    Idle,
    /// Entries are in flight.
    Busy,
    /// The queue pair faulted and needs a restore.
    Faulted,
    /// A kill command has been acknowledged; the pair is safe to restore.
    TerminateAck,
}

/// Static properties of the device the driver fronts.
#[derive(Debug, Clone, Copy)]
pub struct DeviceProperties {
    /// Number of no-op priming tasks a task group must issue for queue
    /// alignment on this device generation.
    pub priming_task_count: usize,
    /// Hardware queue depth per queue pair.
    pub queue_depth: usize,
}

impl Default for DeviceProperties {
    fn default() -> Self {
        Self {
            priming_task_count: 2,
            queue_depth: 1024,
        }
    }
}

/// One completed task as reported by the driver.
#[derive(Debug, Clone, Copy)]
pub struct Completion {
    /// Queue the task completed on.
    pub queue: QueueId,
    /// Identity of the completed task.
    pub task: TaskId,
    /// Sequence number of the completed task on its stream.
    pub seq: u64,
}

/// A batch of completions returned from [`Driver::wait_event`].
#[derive(Debug, Clone, Default)]
pub struct CompletionBatch {
    /// Completions in driver-reported order.
    pub completions: Vec<Completion>,
}

impl CompletionBatch {
    /// True if the batch carries no completions.
    pub fn is_empty(&self) -> bool {
        self.completions.is_empty()
    }
}

/// Abstract driver capability consumed by the runtime.
///
/// Implementations must be safe to call from multiple threads; the runtime
/// never holds one of its own locks across a call into the driver, so a
/// blocking implementation ([`wait_event`](Driver::wait_event)) does not
/// stall unrelated runtime operations.
pub trait Driver: Send + Sync {
    /// Static device properties.
    fn device_properties(&self) -> DeviceProperties;

    /// Current device health.
    fn device_status(&self) -> DeviceStatus;

    /// Allocate a hardware queue pair.
    fn create_queue_pair(&self) -> Result<QueueId>;

    /// Release a queue pair.
    fn destroy_queue_pair(&self, queue: QueueId) -> Result<()>;

    /// Current state of a queue pair.
    fn queue_pair_status(&self, queue: QueueId) -> Result<QueuePairStatus>;

    /// Drop all pending (not yet executing) entries from a queue pair.
    fn clean_queue_pair(&self, queue: QueueId) -> Result<()>;

    /// Send the kill command to a queue pair. Acknowledgement is reported
    /// asynchronously via [`queue_pair_status`](Driver::queue_pair_status)
    /// returning [`QueuePairStatus::TerminateAck`].
    fn kill_queue_pair(&self, queue: QueueId) -> Result<()>;

    /// Reset a cleaned or terminated queue pair for reuse.
    fn restore_queue_pair(&self, queue: QueueId) -> Result<()>;

    /// Place one task on its queue.
    fn submit_task(&self, task: &Task) -> Result<()>;

    /// Place a batch of tasks on their queues, in order.
    fn submit_batch(&self, tasks: &[Task]) -> Result<()> {
        for task in tasks {
            self.submit_task(task)?;
        }
        Ok(())
    }

    /// Highest stream sequence number the queue has completed.
    fn completed_seq(&self, queue: QueueId) -> Result<u64>;

    /// Block until at least one completion is available or `timeout`
    /// elapses. An empty batch on return means the wait timed out.
    fn wait_event(&self, timeout: Duration) -> Result<CompletionBatch>;

    /// Allocate device memory, returning its device address.
    fn alloc_device_memory(&self, size: usize) -> Result<u64>;

    /// Free device memory previously allocated.
    fn free_device_memory(&self, ptr: u64) -> Result<()>;

    /// Synchronous host-to-device copy.
    fn copy_sync(&self, dst: u64, src: &[u8]) -> Result<()>;

    /// Load a kernel image, returning the device entry handle.
    fn load_kernel(&self, image: &[u8]) -> Result<u64>;

    /// Unload a previously loaded kernel image.
    fn unload_kernel(&self, handle: u64) -> Result<()>;
}

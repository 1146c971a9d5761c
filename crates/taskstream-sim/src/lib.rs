//! # taskstream-sim
//!
//! In-process simulated driver backend for the taskstream runtime.
//!
//! [`SimDriver`] implements the [`Driver`] boundary against in-memory
//! queue pairs. By default every submitted task retires instantly; tests
//! flip queues into manual mode to script completions, stalls, kill
//! acknowledgement delays, and device faults. It is the analogue of a CPU
//! fallback backend: no hardware, same contract.

#![warn(missing_docs)]
#![warn(clippy::all)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use tracing::debug;

use taskstream_core::driver::{
    Completion, CompletionBatch, DeviceProperties, DeviceStatus, Driver, QueueId, QueuePairStatus,
};
use taskstream_core::error::{Result, RuntimeError};
use taskstream_core::task::{Task, TaskId, TaskTag};

/// One simulated queue pair.
#[derive(Debug, Default)]
struct SimQueue {
    /// Submitted but not yet retired entries, in order.
    pending: Vec<(TaskId, u64)>,
    /// Highest retired sequence number.
    completed_seq: u64,
    /// Entries never retire while set.
    stalled: bool,
    /// Remaining status polls before a kill is acknowledged.
    kill_pending: Option<usize>,
}

/// Scriptable behavior knobs.
#[derive(Debug)]
struct SimBehavior {
    /// Retire each task the moment it is submitted.
    auto_complete: bool,
    /// Fail every submission with this message.
    submit_error: Option<String>,
    /// Status polls a kill waits for before acknowledging.
    kill_ack_polls: usize,
}

impl Default for SimBehavior {
    fn default() -> Self {
        Self {
            auto_complete: true,
            submit_error: None,
            kill_ack_polls: 0,
        }
    }
}

/// Simulated driver backend.
pub struct SimDriver {
    props: DeviceProperties,
    queues: RwLock<HashMap<QueueId, Mutex<SimQueue>>>,
    next_queue: AtomicU32,
    device_status: Mutex<DeviceStatus>,
    behavior: Mutex<SimBehavior>,
    /// Completions not yet drained through `wait_event`.
    completions: Mutex<Vec<Completion>>,
    /// Bump allocator for device addresses.
    next_ptr: AtomicU64,
    allocations: Mutex<HashMap<u64, usize>>,
    kernels: Mutex<HashMap<u64, usize>>,
    next_kernel: AtomicU64,
    kernels_unloaded: AtomicU64,
    bytes_copied: AtomicU64,
    submitted_by_tag: Mutex<HashMap<TaskTag, u64>>,
}

impl SimDriver {
    /// Create a driver that retires every task instantly.
    pub fn new() -> Self {
        Self::with_properties(DeviceProperties::default())
    }

    /// Create a driver with explicit device properties.
    pub fn with_properties(props: DeviceProperties) -> Self {
        Self {
            props,
            queues: RwLock::new(HashMap::new()),
            next_queue: AtomicU32::new(0),
            device_status: Mutex::new(DeviceStatus::Ok),
            behavior: Mutex::new(SimBehavior::default()),
            completions: Mutex::new(Vec::new()),
            next_ptr: AtomicU64::new(0x1000_0000),
            allocations: Mutex::new(HashMap::new()),
            kernels: Mutex::new(HashMap::new()),
            next_kernel: AtomicU64::new(0x8000_0000),
            kernels_unloaded: AtomicU64::new(0),
            bytes_copied: AtomicU64::new(0),
            submitted_by_tag: Mutex::new(HashMap::new()),
        }
    }

    /// Create a driver whose queues retire tasks only when scripted.
    pub fn manual() -> Self {
        let driver = Self::new();
        driver.behavior.lock().auto_complete = false;
        driver
    }

    // --- test controls ---

    /// Override the reported device status.
    pub fn set_device_status(&self, status: DeviceStatus) {
        *self.device_status.lock() = status;
    }

    /// Stall or unstall a queue; stalled queues never retire work.
    pub fn set_stalled(&self, queue: QueueId, stalled: bool) {
        if let Some(q) = self.queues.read().get(&queue) {
            q.lock().stalled = stalled;
        }
    }

    /// Fail every subsequent submission with `message`, or stop failing.
    pub fn set_submit_error(&self, message: Option<&str>) {
        self.behavior.lock().submit_error = message.map(String::from);
    }

    /// Number of status polls a kill waits before acknowledging.
    pub fn set_kill_ack_polls(&self, polls: usize) {
        self.behavior.lock().kill_ack_polls = polls;
    }

    /// Retire every pending entry up to and including `seq`.
    pub fn complete_up_to(&self, queue: QueueId, seq: u64) {
        let queues = self.queues.read();
        let Some(q) = queues.get(&queue) else {
            return;
        };
        let mut q = q.lock();
        let mut retired = Vec::new();
        q.pending.retain(|&(task, task_seq)| {
            if task_seq <= seq {
                retired.push((task, task_seq));
                false
            } else {
                true
            }
        });
        if seq > q.completed_seq {
            q.completed_seq = seq;
        }
        drop(q);
        let mut completions = self.completions.lock();
        for (task, task_seq) in retired {
            completions.push(Completion {
                queue,
                task,
                seq: task_seq,
            });
        }
    }

    /// Retire everything pending on a queue.
    pub fn complete_all(&self, queue: QueueId) {
        let high = {
            let queues = self.queues.read();
            match queues.get(&queue) {
                Some(q) => q.lock().pending.iter().map(|&(_, s)| s).max().unwrap_or(0),
                None => return,
            }
        };
        if high > 0 {
            self.complete_up_to(queue, high);
        }
    }

    // --- observers ---

    /// Entries submitted and not yet retired.
    pub fn pending_count(&self, queue: QueueId) -> usize {
        self.queues
            .read()
            .get(&queue)
            .map(|q| q.lock().pending.len())
            .unwrap_or(0)
    }

    /// Kernel images currently loaded.
    pub fn loaded_kernels(&self) -> usize {
        self.kernels.lock().len()
    }

    /// Kernel images unloaded over the driver's lifetime.
    pub fn unloaded_kernels(&self) -> u64 {
        self.kernels_unloaded.load(Ordering::Relaxed)
    }

    /// Total bytes moved through `copy_sync`.
    pub fn bytes_copied(&self) -> u64 {
        self.bytes_copied.load(Ordering::Relaxed)
    }

    /// Tasks submitted carrying the given payload tag.
    pub fn submitted_with_tag(&self, tag: TaskTag) -> u64 {
        self.submitted_by_tag.lock().get(&tag).copied().unwrap_or(0)
    }

    /// Outstanding device allocations.
    pub fn live_allocations(&self) -> usize {
        self.allocations.lock().len()
    }
}

impl Default for SimDriver {
    fn default() -> Self {
        Self::new()
    }
}

impl Driver for SimDriver {
    fn device_properties(&self) -> DeviceProperties {
        self.props
    }

    fn device_status(&self) -> DeviceStatus {
        *self.device_status.lock()
    }

    fn create_queue_pair(&self) -> Result<QueueId> {
        let id = QueueId::new(self.next_queue.fetch_add(1, Ordering::AcqRel));
        self.queues.write().insert(id, Mutex::new(SimQueue::default()));
        debug!(queue = %id, "created simulated queue pair");
        Ok(id)
    }

    fn destroy_queue_pair(&self, queue: QueueId) -> Result<()> {
        self.queues
            .write()
            .remove(&queue)
            .map(|_| ())
            .ok_or_else(|| RuntimeError::Driver(format!("unknown queue pair {queue}")))
    }

    fn queue_pair_status(&self, queue: QueueId) -> Result<QueuePairStatus> {
        let queues = self.queues.read();
        let q = queues
            .get(&queue)
            .ok_or_else(|| RuntimeError::Driver(format!("unknown queue pair {queue}")))?;
        let mut q = q.lock();
        if let Some(polls) = q.kill_pending {
            if polls == 0 {
                return Ok(QueuePairStatus::TerminateAck);
            }
            q.kill_pending = Some(polls - 1);
            return Ok(QueuePairStatus::Busy);
        }
        if q.pending.is_empty() {
            Ok(QueuePairStatus::Idle)
        } else {
            Ok(QueuePairStatus::Busy)
        }
    }

    fn clean_queue_pair(&self, queue: QueueId) -> Result<()> {
        let queues = self.queues.read();
        let q = queues
            .get(&queue)
            .ok_or_else(|| RuntimeError::Driver(format!("unknown queue pair {queue}")))?;
        q.lock().pending.clear();
        Ok(())
    }

    fn kill_queue_pair(&self, queue: QueueId) -> Result<()> {
        let polls = self.behavior.lock().kill_ack_polls;
        let queues = self.queues.read();
        let q = queues
            .get(&queue)
            .ok_or_else(|| RuntimeError::Driver(format!("unknown queue pair {queue}")))?;
        q.lock().kill_pending = Some(polls);
        Ok(())
    }

    fn restore_queue_pair(&self, queue: QueueId) -> Result<()> {
        let queues = self.queues.read();
        let q = queues
            .get(&queue)
            .ok_or_else(|| RuntimeError::Driver(format!("unknown queue pair {queue}")))?;
        let mut q = q.lock();
        q.pending.clear();
        q.kill_pending = None;
        Ok(())
    }

    fn submit_task(&self, task: &Task) -> Result<()> {
        if let Some(message) = self.behavior.lock().submit_error.clone() {
            return Err(RuntimeError::Driver(message));
        }
        let queues = self.queues.read();
        let q = queues
            .get(&task.queue)
            .ok_or_else(|| RuntimeError::Driver(format!("unknown queue pair {}", task.queue)))?;
        let mut q = q.lock();
        *self.submitted_by_tag.lock().entry(task.tag()).or_insert(0) += 1;

        if self.behavior.lock().auto_complete && !q.stalled {
            q.completed_seq = q.completed_seq.max(task.seq);
            self.completions.lock().push(Completion {
                queue: task.queue,
                task: task.id,
                seq: task.seq,
            });
        } else {
            q.pending.push((task.id, task.seq));
        }
        Ok(())
    }

    fn completed_seq(&self, queue: QueueId) -> Result<u64> {
        let queues = self.queues.read();
        let q = queues
            .get(&queue)
            .ok_or_else(|| RuntimeError::Driver(format!("unknown queue pair {queue}")))?;
        let completed_seq = q.lock().completed_seq;
        Ok(completed_seq)
    }

    fn wait_event(&self, _timeout: Duration) -> Result<CompletionBatch> {
        let completions = std::mem::take(&mut *self.completions.lock());
        Ok(CompletionBatch { completions })
    }

    fn alloc_device_memory(&self, size: usize) -> Result<u64> {
        if size == 0 {
            return Err(RuntimeError::DeviceAllocFailed { size });
        }
        let aligned = (size + 0xff) & !0xff;
        let ptr = self.next_ptr.fetch_add(aligned as u64, Ordering::AcqRel);
        self.allocations.lock().insert(ptr, size);
        Ok(ptr)
    }

    fn free_device_memory(&self, ptr: u64) -> Result<()> {
        self.allocations
            .lock()
            .remove(&ptr)
            .map(|_| ())
            .ok_or_else(|| RuntimeError::Driver(format!("unknown device pointer {ptr:#x}")))
    }

    fn copy_sync(&self, _dst: u64, src: &[u8]) -> Result<()> {
        self.bytes_copied
            .fetch_add(src.len() as u64, Ordering::Relaxed);
        Ok(())
    }

    fn load_kernel(&self, image: &[u8]) -> Result<u64> {
        if image.is_empty() {
            return Err(RuntimeError::InvalidArgument("empty kernel image".into()));
        }
        let handle = self.next_kernel.fetch_add(1, Ordering::AcqRel);
        self.kernels.lock().insert(handle, image.len());
        Ok(handle)
    }

    fn unload_kernel(&self, handle: u64) -> Result<()> {
        self.kernels
            .lock()
            .remove(&handle)
            .map(|_| {
                self.kernels_unloaded.fetch_add(1, Ordering::Relaxed);
            })
            .ok_or_else(|| RuntimeError::Driver(format!("unknown kernel handle {handle:#x}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use taskstream_core::stream::StreamId;
    use taskstream_core::task::{ControlCommand, TaskPayload};

    fn task(queue: QueueId, seq: u64) -> Task {
        Task {
            id: TaskId::new(seq),
            stream: StreamId::new(1),
            queue,
            seq,
            payload: TaskPayload::Control {
                cmd: ControlCommand::Noop,
            },
        }
    }

    #[test]
    fn test_auto_complete_retires_instantly() {
        let driver = SimDriver::new();
        let queue = driver.create_queue_pair().unwrap();

        driver.submit_task(&task(queue, 1)).unwrap();
        driver.submit_task(&task(queue, 2)).unwrap();

        assert_eq!(driver.completed_seq(queue).unwrap(), 2);
        assert_eq!(driver.pending_count(queue), 0);
    }

    #[test]
    fn test_manual_mode_requires_scripted_completion() {
        let driver = SimDriver::manual();
        let queue = driver.create_queue_pair().unwrap();

        driver.submit_task(&task(queue, 1)).unwrap();
        driver.submit_task(&task(queue, 2)).unwrap();
        assert_eq!(driver.completed_seq(queue).unwrap(), 0);
        assert_eq!(driver.pending_count(queue), 2);

        driver.complete_up_to(queue, 1);
        assert_eq!(driver.completed_seq(queue).unwrap(), 1);
        assert_eq!(driver.pending_count(queue), 1);

        driver.complete_all(queue);
        assert_eq!(driver.completed_seq(queue).unwrap(), 2);
    }

    #[test]
    fn test_kill_ack_after_polls() {
        let driver = SimDriver::manual();
        driver.set_kill_ack_polls(2);
        let queue = driver.create_queue_pair().unwrap();

        driver.kill_queue_pair(queue).unwrap();
        assert_eq!(
            driver.queue_pair_status(queue).unwrap(),
            QueuePairStatus::Busy
        );
        assert_eq!(
            driver.queue_pair_status(queue).unwrap(),
            QueuePairStatus::Busy
        );
        assert_eq!(
            driver.queue_pair_status(queue).unwrap(),
            QueuePairStatus::TerminateAck
        );
    }

    #[test]
    fn test_wait_event_drains_completions() {
        let driver = SimDriver::new();
        let queue = driver.create_queue_pair().unwrap();
        driver.submit_task(&task(queue, 1)).unwrap();

        let batch = driver.wait_event(Duration::from_millis(1)).unwrap();
        assert_eq!(batch.completions.len(), 1);
        assert!(driver.wait_event(Duration::from_millis(1)).unwrap().is_empty());
    }

    #[test]
    fn test_kernel_load_unload_ledger() {
        let driver = SimDriver::new();
        let h = driver.load_kernel(&[1, 2, 3]).unwrap();
        assert_eq!(driver.loaded_kernels(), 1);
        driver.unload_kernel(h).unwrap();
        assert_eq!(driver.loaded_kernels(), 0);
        assert_eq!(driver.unloaded_kernels(), 1);
        assert!(driver.unload_kernel(h).is_err());
    }

    #[test]
    fn test_device_memory_ledger() {
        let driver = SimDriver::new();
        let ptr = driver.alloc_device_memory(1024).unwrap();
        assert_eq!(driver.live_allocations(), 1);
        driver.free_device_memory(ptr).unwrap();
        assert_eq!(driver.live_allocations(), 0);
    }

    #[test]
    fn test_submit_error_injection() {
        let driver = SimDriver::new();
        let queue = driver.create_queue_pair().unwrap();
        driver.set_submit_error(Some("queue full"));
        assert!(driver.submit_task(&task(queue, 1)).is_err());
        driver.set_submit_error(None);
        driver.submit_task(&task(queue, 1)).unwrap();
    }
}

//! Per-stream task descriptor pool.
//!
//! Each stream owns a [`TaskPool`] sized by
//! [`RuntimeConfig::task_pool_capacity`](crate::config::RuntimeConfig) plus
//! a bounded overflow allowance. Allocation advances the stream's sequence
//! counter, which synchronization later uses for drain-up-to-N queries and
//! capture recording uses for graph ordering.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::driver::QueueId;
use crate::error::{Result, RuntimeError};
use crate::stream::StreamId;
use crate::task::{Task, TaskId, TaskPayload};

/// Pool statistics snapshot.
#[derive(Debug, Clone, Default)]
pub struct TaskPoolStats {
    /// Descriptors currently allocated and not yet recycled.
    pub outstanding: usize,
    /// Free slots remaining (capacity + overflow - outstanding).
    pub free_slots: usize,
    /// Total allocations served.
    pub total_allocs: u64,
    /// Allocations served from the recycled free list.
    pub recycled_hits: u64,
}

/// Fixed-capacity descriptor pool with a bounded overflow path.
pub struct TaskPool {
    stream: StreamId,
    queue: QueueId,
    capacity: usize,
    overflow: usize,
    /// Recycled descriptors awaiting reuse.
    free: Mutex<Vec<Task>>,
    outstanding: AtomicUsize,
    next_seq: AtomicU64,
    /// Context-wide task id source, shared across all pools.
    task_ids: Arc<AtomicU64>,
    total_allocs: AtomicU64,
    recycled_hits: AtomicU64,
}

impl TaskPool {
    /// Create a pool for `stream` bound to `queue`.
    pub fn new(
        stream: StreamId,
        queue: QueueId,
        capacity: usize,
        overflow: usize,
        task_ids: Arc<AtomicU64>,
    ) -> Self {
        Self {
            stream,
            queue,
            capacity,
            overflow,
            free: Mutex::new(Vec::with_capacity(capacity.min(256))),
            outstanding: AtomicUsize::new(0),
            next_seq: AtomicU64::new(0),
            task_ids,
            total_allocs: AtomicU64::new(0),
            recycled_hits: AtomicU64::new(0),
        }
    }

    /// Allocate a descriptor carrying `payload`.
    ///
    /// Fails with `ResourceExhausted` once the primary capacity and the
    /// overflow allowance are both in use. On success the stream's sequence
    /// counter has advanced by one.
    pub fn alloc(&self, payload: TaskPayload) -> Result<Task> {
        let limit = self.capacity + self.overflow;
        // Reserve a slot before touching the free list so concurrent
        // allocators cannot overshoot the limit.
        let mut reserved = self.outstanding.load(Ordering::Acquire);
        loop {
            if reserved >= limit {
                return Err(RuntimeError::TaskPoolExhausted {
                    stream: self.stream,
                });
            }
            match self.outstanding.compare_exchange_weak(
                reserved,
                reserved + 1,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => break,
                Err(current) => reserved = current,
            }
        }

        let seq = self.next_seq.fetch_add(1, Ordering::AcqRel) + 1;
        let id = TaskId::new(self.task_ids.fetch_add(1, Ordering::AcqRel) + 1);
        self.total_allocs.fetch_add(1, Ordering::Relaxed);

        let task = match self.free.lock().pop() {
            Some(mut recycled) => {
                self.recycled_hits.fetch_add(1, Ordering::Relaxed);
                recycled.id = id;
                recycled.stream = self.stream;
                recycled.queue = self.queue;
                recycled.seq = seq;
                recycled.payload = payload;
                recycled
            }
            None => Task {
                id,
                stream: self.stream,
                queue: self.queue,
                seq,
                payload,
            },
        };
        Ok(task)
    }

    /// Return a descriptor to the pool.
    ///
    /// Consumes the task by value; a descriptor cannot be recycled twice.
    pub fn recycle(&self, task: Task) {
        let mut free = self.free.lock();
        if free.len() < self.capacity {
            free.push(task);
        }
        drop(free);
        self.outstanding.fetch_sub(1, Ordering::AcqRel);
    }

    /// Free slots remaining before allocation fails.
    pub fn free_slots(&self) -> usize {
        let limit = self.capacity + self.overflow;
        limit.saturating_sub(self.outstanding.load(Ordering::Acquire))
    }

    /// Sequence number of the most recent allocation.
    pub fn current_seq(&self) -> u64 {
        self.next_seq.load(Ordering::Acquire)
    }

    /// Statistics snapshot.
    pub fn stats(&self) -> TaskPoolStats {
        TaskPoolStats {
            outstanding: self.outstanding.load(Ordering::Acquire),
            free_slots: self.free_slots(),
            total_allocs: self.total_allocs.load(Ordering::Relaxed),
            recycled_hits: self.recycled_hits.load(Ordering::Relaxed),
        }
    }
}

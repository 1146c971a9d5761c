//! Task descriptors: the unit of asynchronous work submitted to a queue.
//!
//! A [`Task`] is a fixed-shape descriptor carrying a type-tagged payload.
//! Task shapes are closed and fixed at compile time, so dispatch is a
//! `match` on [`TaskTag`] rather than virtual calls.

use crate::driver::QueueId;
use crate::module_pool::ModuleId;
use crate::stream::StreamId;

/// Unique task identity within a context.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, PartialOrd, Ord)]
#[repr(transparent)]
pub struct TaskId(pub u64);

impl TaskId {
    /// Sentinel for a descriptor that has not been allocated.
    pub const INVALID: TaskId = TaskId(0);

    /// Create a task id.
    pub const fn new(id: u64) -> Self {
        TaskId(id)
    }

    /// True once the descriptor has been allocated.
    pub const fn is_valid(&self) -> bool {
        self.0 != 0
    }
}

impl std::fmt::Display for TaskId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "task-{}", self.0)
    }
}

/// Identity of a cross-stream notification object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(transparent)]
pub struct NotifyId(pub u64);

impl NotifyId {
    /// Create a notify id.
    pub const fn new(id: u64) -> Self {
        NotifyId(id)
    }
}

impl std::fmt::Display for NotifyId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "notify-{}", self.0)
    }
}

/// Discriminant for [`TaskPayload`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TaskTag {
    /// Kernel launch.
    KernelLaunch,
    /// Memory copy.
    Memcpy,
    /// Memory fill.
    Memset,
    /// Notify record (signal).
    NotifyRecord,
    /// Notify wait.
    NotifyWait,
    /// Stream control command.
    Control,
}

/// Kernel arguments, either inline in the descriptor or staged to device
/// memory when they exceed the inline limit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ArgBlock {
    /// Arguments small enough to travel inside the descriptor.
    Inline(Vec<u8>),
    /// Arguments staged into the context's scratch buffer.
    Staged {
        /// Device address of the staged block.
        ptr: u64,
        /// Length in bytes.
        len: usize,
    },
}

impl ArgBlock {
    /// Length of the argument block in bytes.
    pub fn len(&self) -> usize {
        match self {
            Self::Inline(bytes) => bytes.len(),
            Self::Staged { len, .. } => *len,
        }
    }

    /// True if the block is empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Shape of a memory copy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CopyKind {
    /// Contiguous copy.
    Linear,
    /// Pitched 2D copy.
    Plane2d {
        /// Destination row pitch in bytes.
        dst_pitch: usize,
        /// Source row pitch in bytes.
        src_pitch: usize,
        /// Row width in bytes.
        width: usize,
        /// Number of rows.
        height: usize,
    },
    /// Copy combined with an elementwise reduction at the destination.
    Reduce(ReduceOp),
}

/// Reduction operator for [`CopyKind::Reduce`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReduceOp {
    /// Elementwise sum.
    Sum,
    /// Elementwise maximum.
    Max,
    /// Elementwise minimum.
    Min,
}

/// Stream control commands carried by [`TaskPayload::Control`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlCommand {
    /// Queue-alignment no-op.
    Noop,
    /// Redirect subsequent execution to another stream.
    Switch {
        /// Stream to switch to.
        target: StreamId,
    },
    /// Mark the stream active for conditional execution.
    SetActive,
    /// Register a device address range for debug dumps.
    DebugRegister {
        /// Base device address.
        addr: u64,
        /// Range length in bytes.
        len: usize,
    },
    /// Unregister a previously registered debug range.
    DebugUnregister {
        /// Base device address.
        addr: u64,
    },
}

/// Type-specific portion of a task descriptor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskPayload {
    /// Launch a loaded kernel.
    KernelLaunch {
        /// Module the kernel was loaded from, if pool-managed.
        module: Option<ModuleId>,
        /// Resolved device entry handle.
        handle: u64,
        /// Tiling key selecting the precompiled variant.
        tiling_key: u32,
        /// Block dimension for the launch.
        block_dim: u32,
        /// Marshalled kernel arguments.
        args: ArgBlock,
    },
    /// Copy between device addresses.
    Memcpy {
        /// Destination device address.
        dst: u64,
        /// Source device address.
        src: u64,
        /// Bytes to copy.
        len: usize,
        /// Copy shape.
        kind: CopyKind,
    },
    /// Fill a device range with a byte value.
    Memset {
        /// Destination device address.
        dst: u64,
        /// Fill value.
        value: u8,
        /// Bytes to fill.
        len: usize,
    },
    /// Signal a notify object.
    NotifyRecord {
        /// Notify to signal.
        notify: NotifyId,
    },
    /// Wait until a notify object is signaled.
    NotifyWait {
        /// Notify to wait on.
        notify: NotifyId,
    },
    /// Stream control command.
    Control {
        /// The command.
        cmd: ControlCommand,
    },
}

impl TaskPayload {
    /// Returns the discriminant tag.
    pub fn tag(&self) -> TaskTag {
        match self {
            Self::KernelLaunch { .. } => TaskTag::KernelLaunch,
            Self::Memcpy { .. } => TaskTag::Memcpy,
            Self::Memset { .. } => TaskTag::Memset,
            Self::NotifyRecord { .. } => TaskTag::NotifyRecord,
            Self::NotifyWait { .. } => TaskTag::NotifyWait,
            Self::Control { .. } => TaskTag::Control,
        }
    }
}

/// A fixed-shape work descriptor bound to one stream.
///
/// Allocated from the owning stream's pool immediately before submission.
/// Ownership moves to the stream's in-flight list on successful submission
/// and back to the pool once the driver's completion watermark passes the
/// task's sequence number. Taking `Task` by value in the recycle path makes
/// double-recycle unrepresentable.
#[derive(Debug, Clone)]
pub struct Task {
    /// Context-unique identity.
    pub id: TaskId,
    /// Owning stream.
    pub stream: StreamId,
    /// Hardware queue the stream is bound to.
    pub queue: QueueId,
    /// Position in the stream's submission order.
    pub seq: u64,
    /// Type-specific payload.
    pub payload: TaskPayload,
}

impl Task {
    /// Returns the payload tag.
    pub fn tag(&self) -> TaskTag {
        self.payload.tag()
    }
}

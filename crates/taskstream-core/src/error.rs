//! Error types for the taskstream runtime.
//!
//! All fallible operations return [`Result`]. Variants carry enough context
//! to identify the stream, model, or pool involved; [`RuntimeError::kind`]
//! groups them into the coarse taxonomy callers branch on.

use std::time::Duration;

use crate::capture::{CaptureMode, ModelId};
use crate::module_pool::ModuleId;
use crate::stream::StreamId;
use crate::task::NotifyId;
use crate::task_group::TaskGroupId;

/// Result type for all runtime operations.
pub type Result<T> = std::result::Result<T, RuntimeError>;

/// Coarse error classification.
///
/// Every [`RuntimeError`] variant maps to exactly one kind. Callers that do
/// not care about the specific failure (retry loops, test assertions) match
/// on the kind instead of the variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// A caller-supplied argument was malformed or out of range.
    InvalidArgument,
    /// A pool, queue, or buffer had no capacity left.
    ResourceExhausted,
    /// A stream, model, module, or notify lookup missed.
    NotFound,
    /// An operation was attempted in an incompatible state.
    StateConflict,
    /// A blocking operation exceeded its deadline.
    Timeout,
    /// The device or driver reported a hardware-level failure.
    DeviceFault,
    /// The feature is not available on the current device generation.
    Unsupported,
}

/// Errors produced by the taskstream runtime.
#[derive(Debug, thiserror::Error)]
pub enum RuntimeError {
    /// Malformed caller input.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// The stream's task pool and its overflow allowance are both in use.
    #[error("task pool exhausted on stream {stream}")]
    TaskPoolExhausted {
        /// Stream whose pool is full.
        stream: StreamId,
    },

    /// The argument scratch buffer cannot hold the staged payload.
    #[error("scratch buffer exhausted: need {needed} bytes, {available} free")]
    ScratchExhausted {
        /// Bytes the staging request needed.
        needed: usize,
        /// Bytes currently free in the scratch buffer.
        available: usize,
    },

    /// Device memory allocation failed.
    #[error("device allocation of {size} bytes failed")]
    DeviceAllocFailed {
        /// Requested allocation size.
        size: usize,
    },

    /// No stream with this id is owned by the context.
    #[error("stream {0} not found")]
    StreamNotFound(StreamId),

    /// No model with this id is registered on the context.
    #[error("model {0} not found")]
    ModelNotFound(ModelId),

    /// No kernel image was registered under this module id.
    #[error("module {0} not found")]
    ModuleNotFound(ModuleId),

    /// The notify object was never created or already destroyed.
    #[error("notify {0} not found")]
    NotifyNotFound(NotifyId),

    /// No task group with this handle exists on any live model.
    #[error("task group {0} not found")]
    TaskGroupNotFound(TaskGroupId),

    /// The stream is in capture mode and cannot perform this operation.
    #[error("stream {0} is capturing")]
    StreamCaptured(StreamId),

    /// The stream has no capture to end.
    #[error("stream {0} is not capturing")]
    StreamNotCaptured(StreamId),

    /// A capture must be ended by the stream that began it.
    #[error("capture on stream {0} can only be ended by its originating stream")]
    CaptureUnmatched(StreamId),

    /// A non-relaxed capture was ended from a different thread than the one
    /// that began it.
    #[error("capture ended from a different thread than it was begun on")]
    CaptureWrongThread,

    /// The capture was invalidated by a device fault and must be ended or
    /// destroyed before the stream is usable again.
    #[error("capture was invalidated by a device fault")]
    CaptureInvalidated,

    /// A joined stream was never synchronized back into the capture origin.
    #[error("stream {0} was never joined back to the capture origin")]
    StreamUnjoined(StreamId),

    /// The requested capture mode conflicts with a capture already active
    /// in the process.
    #[error("capture scope conflict with an active {0:?}-mode capture")]
    CaptureScopeConflict(CaptureMode),

    /// The stream already has an open task group.
    #[error("stream {0} already has an open task group")]
    TaskGroupOpen(StreamId),

    /// The task-group operation does not match the stream's group status.
    #[error("task group state mismatch on stream {0}")]
    TaskGroupState(StreamId),

    /// Another stream currently holds the task group's update latch.
    #[error("task group {0} is already being updated")]
    TaskGroupUpdateHeld(TaskGroupId),

    /// The update pass did not rewrite every task in the group.
    #[error("task group {group} update incomplete: {remaining} tasks not rewritten")]
    TaskGroupUpdateIncomplete {
        /// Group whose update was ended early.
        group: TaskGroupId,
        /// Number of recorded tasks left untouched.
        remaining: usize,
    },

    /// The stream is still bound to one or more models.
    #[error("stream {0} is bound to a model")]
    StreamBound(StreamId),

    /// The stream is being aborted; submissions are rejected to break
    /// potential livelocks.
    #[error("stream {0} is being aborted")]
    StreamAborting(StreamId),

    /// Stream synchronization exceeded the caller's deadline.
    #[error("stream synchronize timed out after {0:?}")]
    StreamSyncTimeout(Duration),

    /// A status-poll loop (abort, queue drain) exceeded its hard deadline.
    #[error("wait timed out after {0:?}")]
    WaitTimeout(Duration),

    /// The device reported an administrative task abort.
    #[error("device reported task abort")]
    DeviceTaskAbort,

    /// The device or driver reported a hardware fault.
    #[error("device fault: {0}")]
    DeviceFault(String),

    /// The driver rejected an operation.
    #[error("driver error: {0}")]
    Driver(String),

    /// Feature gated off for the current device generation.
    #[error("unsupported: {0}")]
    Unsupported(String),
}

impl RuntimeError {
    /// Returns the coarse classification for this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::InvalidArgument(_) => ErrorKind::InvalidArgument,
            Self::TaskPoolExhausted { .. }
            | Self::ScratchExhausted { .. }
            | Self::DeviceAllocFailed { .. } => ErrorKind::ResourceExhausted,
            Self::StreamNotFound(_)
            | Self::ModelNotFound(_)
            | Self::ModuleNotFound(_)
            | Self::NotifyNotFound(_)
            | Self::TaskGroupNotFound(_) => ErrorKind::NotFound,
            Self::StreamCaptured(_)
            | Self::StreamNotCaptured(_)
            | Self::CaptureUnmatched(_)
            | Self::CaptureWrongThread
            | Self::CaptureInvalidated
            | Self::StreamUnjoined(_)
            | Self::CaptureScopeConflict(_)
            | Self::TaskGroupOpen(_)
            | Self::TaskGroupState(_)
            | Self::TaskGroupUpdateHeld(_)
            | Self::TaskGroupUpdateIncomplete { .. }
            | Self::StreamBound(_)
            | Self::StreamAborting(_) => ErrorKind::StateConflict,
            Self::StreamSyncTimeout(_) | Self::WaitTimeout(_) => ErrorKind::Timeout,
            Self::DeviceTaskAbort | Self::DeviceFault(_) | Self::Driver(_) => {
                ErrorKind::DeviceFault
            }
            Self::Unsupported(_) => ErrorKind::Unsupported,
        }
    }

    /// True for errors that must terminate a multi-stream synchronize
    /// immediately instead of being remembered for later.
    pub(crate) fn aborts_sync(&self) -> bool {
        matches!(self, Self::DeviceTaskAbort) || self.kind() == ErrorKind::Timeout
    }
}

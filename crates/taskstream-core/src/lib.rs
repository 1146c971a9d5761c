//! # taskstream-core
//!
//! Host-side command-stream runtime for compute accelerators.
//!
//! This crate turns high-level "launch a kernel / copy memory / wait on a
//! notify" calls into asynchronous work items on hardware command queues,
//! and can record a sequence of such calls into a replayable execution
//! graph instead of submitting them (capture mode).
//!
//! ## Core Abstractions
//!
//! - [`Runtime`] - explicit top-level owner of the driver, clock, and config
//! - [`Context`] - per-device owner of streams, pools, and capture models
//! - [`Stream`] - ordered task queue bound to one hardware queue pair
//! - [`CaptureModel`] - recorded, replayable task graph
//! - [`Driver`] - the abstract driver/HAL boundary backends implement
//!
//! ## Example
//!
//! ```ignore
//! use taskstream_core::prelude::*;
//!
//! let runtime = Runtime::builder().driver(driver).build()?;
//! let ctx = runtime.create_context()?;
//! let stream = ctx.create_stream(StreamFlags::default())?;
//! let model = ctx.begin_capture(stream, CaptureMode::Relaxed)?;
//! ctx.launch_kernel(stream, module, 0, 64, &args)?;
//! let model = ctx.end_capture(stream)?;
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![deny(unsafe_op_in_unsafe_fn)]

pub mod capture;
pub mod clock;
pub mod config;
pub mod context;
pub mod driver;
pub mod error;
pub mod module_pool;
pub mod runtime;
pub mod stream;
pub mod task;
pub mod task_group;
pub mod task_pool;

/// Prelude module for convenient imports.
pub mod prelude {
    pub use crate::capture::{
        CaptureGraph, CaptureInfo, CaptureMode, CaptureModel, CaptureNode, CaptureState, ModelId,
        ModelInfo,
    };
    pub use crate::clock::{Clock, SystemClock, VirtualClock};
    pub use crate::config::{RuntimeConfig, RuntimeConfigBuilder};
    pub use crate::context::{Context, ContextStats, TaskTicket};
    pub use crate::driver::{
        Completion, CompletionBatch, DeviceProperties, DeviceStatus, Driver, QueueId,
        QueuePairStatus,
    };
    pub use crate::error::{ErrorKind, Result, RuntimeError};
    pub use crate::module_pool::{ModuleId, ModuleTable, ModuleTableStats};
    pub use crate::runtime::{Runtime, RuntimeBuilder};
    pub use crate::stream::{
        CaptureStatus, FailureMode, Stream, StreamFlags, StreamId, StreamPriority, StreamStats,
        TaskGroupStatus,
    };
    pub use crate::task::{
        ArgBlock, ControlCommand, CopyKind, NotifyId, ReduceOp, Task, TaskId, TaskPayload, TaskTag,
    };
    pub use crate::task_group::{TaskGroup, TaskGroupId};
    pub use crate::task_pool::{TaskPool, TaskPoolStats};
}

// Re-exports for convenience
pub use capture::{CaptureMode, CaptureModel, CaptureState, ModelId};
pub use clock::{Clock, SystemClock, VirtualClock};
pub use config::RuntimeConfig;
pub use context::{Context, TaskTicket};
pub use driver::{DeviceStatus, Driver, QueueId};
pub use error::{ErrorKind, Result, RuntimeError};
pub use module_pool::ModuleId;
pub use runtime::{Runtime, RuntimeBuilder};
pub use stream::{CaptureStatus, Stream, StreamFlags, StreamId};
pub use task::{NotifyId, Task, TaskId, TaskPayload};
pub use task_group::TaskGroupId;

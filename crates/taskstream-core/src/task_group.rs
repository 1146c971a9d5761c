//! Task groups: named, atomically updatable sub-sequences of a capture.
//!
//! A group is recorded on one capture stream between the begin/end group
//! operations, then later rewritten as a unit through the update protocol.
//! The single-updater latch guarantees at most one stream rewrites a group
//! at a time; ending an update without rewriting every recorded task is a
//! state conflict.

use std::collections::HashSet;

use crate::error::{Result, RuntimeError};
use crate::stream::StreamId;

/// Opaque task-group handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(transparent)]
pub struct TaskGroupId(pub u64);

impl TaskGroupId {
    /// Create a task group id.
    pub const fn new(id: u64) -> Self {
        TaskGroupId(id)
    }
}

impl std::fmt::Display for TaskGroupId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "group-{}", self.0)
    }
}

/// A bounded sub-sequence of recorded tasks, owned by its capture model.
#[derive(Debug)]
pub struct TaskGroup {
    id: TaskGroupId,
    /// Public stream the group was recorded on.
    stream: StreamId,
    /// Graph node indices in record order.
    nodes: Vec<usize>,
    /// Closed by the end-group operation; only sealed groups accept
    /// updates.
    sealed: bool,
    /// Single-updater latch.
    is_update: bool,
    /// Stream currently holding the update latch.
    updater: Option<StreamId>,
    /// Node indices rewritten during the current update pass.
    rewritten: HashSet<usize>,
}

impl TaskGroup {
    pub(crate) fn new(id: TaskGroupId, stream: StreamId) -> Self {
        Self {
            id,
            stream,
            nodes: Vec::new(),
            sealed: false,
            is_update: false,
            updater: None,
            rewritten: HashSet::new(),
        }
    }

    /// Group identity.
    pub fn id(&self) -> TaskGroupId {
        self.id
    }

    /// Stream the group was recorded on.
    pub fn stream(&self) -> StreamId {
        self.stream
    }

    /// Number of recorded tasks in the group.
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// True if the group recorded nothing.
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Graph node indices in record order.
    pub fn nodes(&self) -> &[usize] {
        &self.nodes
    }

    /// True while a stream holds the update latch.
    pub fn is_updating(&self) -> bool {
        self.is_update
    }

    pub(crate) fn push_node(&mut self, node: usize) {
        self.nodes.push(node);
    }

    pub(crate) fn seal(&mut self) {
        self.sealed = true;
    }

    /// Acquire the update latch for `stream`.
    pub(crate) fn begin_update(&mut self, stream: StreamId) -> Result<()> {
        if !self.sealed {
            return Err(RuntimeError::TaskGroupState(self.stream));
        }
        if self.is_update {
            return Err(RuntimeError::TaskGroupUpdateHeld(self.id));
        }
        self.is_update = true;
        self.updater = Some(stream);
        self.rewritten.clear();
        Ok(())
    }

    /// Graph node index for the group-relative `index`, recording it as
    /// rewritten.
    pub(crate) fn mark_rewritten(&mut self, index: usize) -> Result<usize> {
        if !self.is_update {
            return Err(RuntimeError::TaskGroupState(self.stream));
        }
        let node = *self.nodes.get(index).ok_or_else(|| {
            RuntimeError::InvalidArgument(format!(
                "task index {index} out of range for {}",
                self.id
            ))
        })?;
        self.rewritten.insert(index);
        Ok(node)
    }

    /// Release the update latch.
    ///
    /// Fails unless every task in the group's index was rewritten; the
    /// latch is released either way so a failed pass can be retried.
    pub(crate) fn end_update(&mut self, stream: StreamId) -> Result<()> {
        if !self.is_update || self.updater != Some(stream) {
            return Err(RuntimeError::TaskGroupState(self.stream));
        }
        self.is_update = false;
        self.updater = None;
        let remaining = self.nodes.len() - self.rewritten.len();
        if remaining > 0 {
            self.rewritten.clear();
            return Err(RuntimeError::TaskGroupUpdateIncomplete {
                group: self.id,
                remaining,
            });
        }
        self.rewritten.clear();
        Ok(())
    }
}

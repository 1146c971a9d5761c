//! Capture models: recorded, replayable task graphs.
//!
//! While a stream is in capture mode, the context redirects its
//! submissions to a dedicated internal capture stream and records them
//! into a [`CaptureGraph`] instead of handing them to the driver. Other
//! streams join the same capture transparently the moment they wait on a
//! notify that was recorded inside it; that is how fan-out/fan-in graphs
//! are captured from what looks like ordinary multi-stream code.
//!
//! The model's life is `Capturing -> {Finished | Invalidated}`. Ending a
//! capture validates that every joined stream was synchronized back into
//! the originating stream, allocates a completion notify per auxiliary
//! branch for the replay executor, and freezes the graph.

use std::collections::HashMap;
use std::thread::ThreadId;

use crate::error::{Result, RuntimeError};
use crate::stream::{CaptureStatus, StreamId};
use crate::task::{NotifyId, Task, TaskPayload, TaskTag};
use crate::task_group::{TaskGroup, TaskGroupId};

/// Capture model identity within a context.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(transparent)]
pub struct ModelId(pub u64);

impl ModelId {
    /// Create a model id.
    pub const fn new(id: u64) -> Self {
        ModelId(id)
    }
}

impl std::fmt::Display for ModelId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "model-{}", self.0)
    }
}

/// Scope rule governing concurrent captures in one process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum CaptureMode {
    /// No other stream in the context may be captured concurrently.
    #[default]
    Global,
    /// No second capture may be begun on the same thread.
    ThreadLocal,
    /// Concurrent captures allowed; the capture may also be ended from a
    /// different thread than the one that began it.
    Relaxed,
}

/// Lifecycle state of a capture model.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CaptureState {
    /// Streams are recording into the model.
    Capturing,
    /// The graph was validated and frozen.
    Finished,
    /// A driver fault poisoned the capture.
    Invalidated,
}

/// One stream participating in a capture.
#[derive(Debug, Clone)]
pub(crate) struct CaptureMember {
    /// The caller-visible stream.
    pub public: StreamId,
    /// The internal capture stream receiving redirected submissions.
    pub internal: StreamId,
    /// Added via the explicit model-add operation rather than a join.
    pub explicit: bool,
    /// The origin has recorded a wait on a notify this member recorded.
    pub joined_back: bool,
    /// Most recently recorded node for this member, for ordering edges.
    pub last_node: Option<usize>,
}

/// One recorded task.
#[derive(Debug, Clone)]
pub struct CaptureNode {
    /// Public stream the task was submitted on.
    pub stream: StreamId,
    /// Sequence number on the internal capture stream.
    pub seq: u64,
    /// Recorded payload.
    pub payload: TaskPayload,
}

/// The recorded graph: nodes in record order plus explicit ordering edges.
#[derive(Debug, Default)]
pub struct CaptureGraph {
    nodes: Vec<CaptureNode>,
    edges: Vec<(usize, usize)>,
    finalized: bool,
}

impl CaptureGraph {
    /// Number of recorded tasks.
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// True if nothing was recorded.
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Recorded nodes in record order.
    pub fn nodes(&self) -> &[CaptureNode] {
        &self.nodes
    }

    /// Ordering edges as `(before, after)` node indices.
    pub fn edges(&self) -> &[(usize, usize)] {
        &self.edges
    }

    /// True once the graph has been frozen by a successful capture end.
    pub fn is_finalized(&self) -> bool {
        self.finalized
    }

    fn record(&mut self, node: CaptureNode) -> usize {
        let index = self.nodes.len();
        self.nodes.push(node);
        index
    }

    fn add_edge(&mut self, before: usize, after: usize) {
        self.edges.push((before, after));
    }

    fn finalize(&mut self) {
        self.finalized = true;
    }

    /// Rewrite the payload of one recorded node. Only permitted on a
    /// finalized graph (task-group update path).
    pub(crate) fn rewrite(&mut self, index: usize, payload: TaskPayload) -> Result<()> {
        if !self.finalized {
            return Err(RuntimeError::InvalidArgument(
                "graph is still recording".into(),
            ));
        }
        match self.nodes.get_mut(index) {
            Some(node) => {
                node.payload = payload;
                Ok(())
            }
            None => Err(RuntimeError::InvalidArgument(format!(
                "node index {index} out of range"
            ))),
        }
    }
}

/// A recorded, replayable execution graph under construction or finished.
pub struct CaptureModel {
    id: ModelId,
    mode: CaptureMode,
    origin: StreamId,
    begin_thread: ThreadId,
    state: CaptureState,
    members: Vec<CaptureMember>,
    /// Notify id -> (recording node, recording public stream).
    notify_nodes: HashMap<NotifyId, (usize, StreamId)>,
    graph: CaptureGraph,
    /// Completion notifies allocated at capture end, one per auxiliary
    /// member, in member order.
    completion_notifies: Vec<NotifyId>,
    /// Task groups recorded on this model. Groups cannot outlive it.
    groups: HashMap<TaskGroupId, TaskGroup>,
    /// Fault message latched by a failed record.
    record_fault: Option<String>,
}

impl CaptureModel {
    /// Create a model originating from `origin`, with its internal capture
    /// stream already created by the context.
    pub(crate) fn new(
        id: ModelId,
        mode: CaptureMode,
        origin: StreamId,
        internal: StreamId,
        begin_thread: ThreadId,
    ) -> Self {
        let mut model = Self {
            id,
            mode,
            origin,
            begin_thread,
            state: CaptureState::Capturing,
            members: Vec::new(),
            notify_nodes: HashMap::new(),
            graph: CaptureGraph::default(),
            completion_notifies: Vec::new(),
            groups: HashMap::new(),
            record_fault: None,
        };
        model.members.push(CaptureMember {
            public: origin,
            internal,
            explicit: false,
            // The origin needs no join-back edge to itself.
            joined_back: true,
            last_node: None,
        });
        model
    }

    /// Model identity.
    pub fn id(&self) -> ModelId {
        self.id
    }

    /// Capture scope mode.
    pub fn mode(&self) -> CaptureMode {
        self.mode
    }

    /// Stream that began the capture.
    pub fn origin(&self) -> StreamId {
        self.origin
    }

    /// Thread that began the capture.
    pub fn begin_thread(&self) -> ThreadId {
        self.begin_thread
    }

    /// Current lifecycle state.
    pub fn state(&self) -> CaptureState {
        self.state
    }

    /// Number of recorded tasks.
    pub fn task_count(&self) -> usize {
        self.graph.len()
    }

    /// The recorded graph.
    pub fn graph(&self) -> &CaptureGraph {
        &self.graph
    }

    /// Completion notifies allocated for auxiliary branches at capture end.
    pub fn completion_notifies(&self) -> &[NotifyId] {
        &self.completion_notifies
    }

    pub(crate) fn members(&self) -> &[CaptureMember] {
        &self.members
    }

    pub(crate) fn member_internal(&self, stream: StreamId) -> Option<StreamId> {
        self.members
            .iter()
            .find(|m| m.public == stream)
            .map(|m| m.internal)
    }

    /// Add a joined or explicitly attached member stream.
    pub(crate) fn add_member(&mut self, public: StreamId, internal: StreamId, explicit: bool) {
        self.members.push(CaptureMember {
            public,
            internal,
            explicit,
            joined_back: false,
            last_node: None,
        });
    }

    /// The model that recorded `notify`, if any capture recorded it.
    pub(crate) fn recorded_notify(&self, notify: NotifyId) -> bool {
        self.notify_nodes.contains_key(&notify)
    }

    pub(crate) fn latch_fault(&mut self, message: impl Into<String>) {
        if self.record_fault.is_none() {
            self.record_fault = Some(message.into());
        }
    }

    pub(crate) fn latched_fault(&self) -> Option<RuntimeError> {
        self.record_fault
            .as_ref()
            .map(|msg| RuntimeError::Driver(msg.clone()))
    }

    /// Record one redirected task into the graph.
    ///
    /// Chains an ordering edge from the member's previously recorded node,
    /// resolves notify waits against recorded notify records, and marks a
    /// member joined-back when the origin waits on a notify the member
    /// recorded. Returns the node index.
    pub(crate) fn record(&mut self, public: StreamId, task: &Task) -> Result<usize> {
        if self.state != CaptureState::Capturing {
            return Err(RuntimeError::CaptureInvalidated);
        }
        let member = self
            .members
            .iter()
            .position(|m| m.public == public)
            .ok_or(RuntimeError::StreamNotCaptured(public))?;

        let node = self.graph.record(CaptureNode {
            stream: public,
            seq: task.seq,
            payload: task.payload.clone(),
        });
        if let Some(prev) = self.members[member].last_node {
            self.graph.add_edge(prev, node);
        }
        self.members[member].last_node = Some(node);

        match task.payload {
            TaskPayload::NotifyRecord { notify } => {
                self.notify_nodes.insert(notify, (node, public));
            }
            TaskPayload::NotifyWait { notify } => {
                if let Some(&(record_node, recorder)) = self.notify_nodes.get(&notify) {
                    self.graph.add_edge(record_node, node);
                    // A wait on the origin for a notify recorded by an
                    // auxiliary member is that member's join-back edge.
                    if public == self.origin && recorder != self.origin {
                        if let Some(aux) =
                            self.members.iter_mut().find(|m| m.public == recorder)
                        {
                            aux.joined_back = true;
                        }
                    }
                }
            }
            _ => {}
        }
        Ok(node)
    }

    /// Validate the recorded structure ahead of finalization.
    ///
    /// Every member that is neither the origin nor explicitly attached
    /// must have joined back into the origin. A capture containing only
    /// the origin is trivially valid.
    pub(crate) fn validate(&self) -> Result<()> {
        for member in &self.members {
            if member.public == self.origin || member.explicit {
                continue;
            }
            if !member.joined_back {
                return Err(RuntimeError::StreamUnjoined(member.public));
            }
        }
        Ok(())
    }

    /// Append a completion-notify record node at the tail of `member`'s
    /// recorded chain so a replay executor can observe the branch finish.
    pub(crate) fn append_completion_notify(
        &mut self,
        member_public: StreamId,
        notify: NotifyId,
        seq: u64,
    ) {
        let node = self.graph.record(CaptureNode {
            stream: member_public,
            seq,
            payload: TaskPayload::NotifyRecord { notify },
        });
        if let Some(member) = self.members.iter_mut().find(|m| m.public == member_public) {
            if let Some(prev) = member.last_node {
                self.graph.add_edge(prev, node);
            }
            member.last_node = Some(node);
        }
        self.notify_nodes.insert(notify, (node, member_public));
        self.completion_notifies.push(notify);
    }

    /// Freeze the graph and mark the model finished.
    pub(crate) fn finalize(&mut self) {
        self.graph.finalize();
        self.state = CaptureState::Finished;
    }

    /// Poison the model after a driver-detected fault.
    pub(crate) fn invalidate(&mut self) {
        self.state = CaptureState::Invalidated;
    }

    // --- task groups ---

    pub(crate) fn insert_group(&mut self, group: TaskGroup) {
        self.groups.insert(group.id(), group);
    }

    pub(crate) fn remove_group(&mut self, id: TaskGroupId) -> Option<TaskGroup> {
        self.groups.remove(&id)
    }

    pub(crate) fn group(&self, id: TaskGroupId) -> Option<&TaskGroup> {
        self.groups.get(&id)
    }

    pub(crate) fn group_mut(&mut self, id: TaskGroupId) -> Option<&mut TaskGroup> {
        self.groups.get_mut(&id)
    }

    pub(crate) fn rewrite_node(&mut self, index: usize, payload: TaskPayload) -> Result<()> {
        self.graph.rewrite(index, payload)
    }

    /// Node indices whose payload is a queue-alignment no-op are counted
    /// separately by diagnostics; everything else is caller work.
    pub fn recorded_work(&self) -> usize {
        self.graph
            .nodes()
            .iter()
            .filter(|n| n.payload.tag() != TaskTag::Control)
            .count()
    }
}

impl std::fmt::Debug for CaptureModel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CaptureModel")
            .field("id", &self.id)
            .field("mode", &self.mode)
            .field("origin", &self.origin)
            .field("state", &self.state)
            .field("tasks", &self.graph.len())
            .field("members", &self.members.len())
            .finish()
    }
}

/// Capture status report for one stream.
#[derive(Debug, Clone, Copy)]
pub struct CaptureInfo {
    /// The stream's capture status.
    pub status: CaptureStatus,
    /// Model the stream belongs to, if any.
    pub model: Option<ModelId>,
    /// Tasks recorded so far on the owning model.
    pub recorded_tasks: usize,
}

/// Summary of a capture model.
#[derive(Debug, Clone, Copy)]
pub struct ModelInfo {
    /// Model identity.
    pub id: ModelId,
    /// Lifecycle state.
    pub state: CaptureState,
    /// Recorded task count, including priming and completion records.
    pub recorded_tasks: usize,
    /// Number of member streams, the origin included.
    pub member_streams: usize,
}

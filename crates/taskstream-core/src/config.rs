//! Runtime configuration.
//!
//! [`RuntimeConfig`] collects every tunable the runtime consults: pool
//! sizes, the scratch buffer, and the poll cadences of the blocking
//! operations. Build one with [`RuntimeConfig::builder`], or start from a
//! preset and adjust.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Result, RuntimeError};

/// Tunables for a [`Runtime`](crate::runtime::Runtime).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeConfig {
    /// Primary task-pool capacity per stream.
    pub task_pool_capacity: usize,
    /// Additional overflow allocations allowed past the primary capacity.
    pub task_pool_overflow: usize,
    /// Kernel arguments up to this size travel inline in the descriptor;
    /// larger blocks are staged through the scratch buffer.
    pub inline_arg_bytes: usize,
    /// Size of the per-context overflow scratch device buffer.
    pub scratch_bytes: usize,
    /// Slots per module pool chunk.
    pub module_chunk_size: usize,
    /// Number of pools behind the most-recently-used pool that the
    /// reclamation sweep leaves untouched.
    pub module_isolation_width: usize,
    /// Poll cadence of stream/context synchronize.
    pub sync_poll_interval: Duration,
    /// Poll cadence of the abort status loop.
    pub abort_poll_interval: Duration,
    /// Hard deadline for the abort status loop.
    pub abort_timeout: Duration,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            task_pool_capacity: 1024,
            task_pool_overflow: 128,
            inline_arg_bytes: 256,
            scratch_bytes: 1 << 20,
            module_chunk_size: 64,
            module_isolation_width: 2,
            sync_poll_interval: Duration::from_millis(1),
            abort_poll_interval: Duration::from_millis(5),
            abort_timeout: Duration::from_secs(60),
        }
    }
}

impl RuntimeConfig {
    /// Start building a configuration.
    pub fn builder() -> RuntimeConfigBuilder {
        RuntimeConfigBuilder::default()
    }

    /// Small pools and fast polls for unit and integration tests.
    pub fn for_testing() -> Self {
        Self {
            task_pool_capacity: 16,
            task_pool_overflow: 4,
            inline_arg_bytes: 64,
            scratch_bytes: 4096,
            module_chunk_size: 4,
            module_isolation_width: 1,
            sync_poll_interval: Duration::from_millis(1),
            abort_poll_interval: Duration::from_millis(1),
            abort_timeout: Duration::from_millis(100),
        }
    }

    /// Validate invariants the runtime depends on.
    pub fn validate(&self) -> Result<()> {
        if self.task_pool_capacity == 0 {
            return Err(RuntimeError::InvalidArgument(
                "task_pool_capacity must be non-zero".into(),
            ));
        }
        if self.module_chunk_size == 0 {
            return Err(RuntimeError::InvalidArgument(
                "module_chunk_size must be non-zero".into(),
            ));
        }
        if self.sync_poll_interval.is_zero() || self.abort_poll_interval.is_zero() {
            return Err(RuntimeError::InvalidArgument(
                "poll intervals must be non-zero".into(),
            ));
        }
        if self.abort_timeout < self.abort_poll_interval {
            return Err(RuntimeError::InvalidArgument(
                "abort_timeout must cover at least one poll interval".into(),
            ));
        }
        Ok(())
    }
}

/// Builder for [`RuntimeConfig`].
#[derive(Debug, Default)]
pub struct RuntimeConfigBuilder {
    config: Option<RuntimeConfig>,
}

impl RuntimeConfigBuilder {
    fn config(&mut self) -> &mut RuntimeConfig {
        self.config.get_or_insert_with(RuntimeConfig::default)
    }

    /// Set the per-stream task pool capacity.
    pub fn task_pool_capacity(mut self, capacity: usize) -> Self {
        self.config().task_pool_capacity = capacity;
        self
    }

    /// Set the task pool overflow allowance.
    pub fn task_pool_overflow(mut self, overflow: usize) -> Self {
        self.config().task_pool_overflow = overflow;
        self
    }

    /// Set the inline argument limit.
    pub fn inline_arg_bytes(mut self, bytes: usize) -> Self {
        self.config().inline_arg_bytes = bytes;
        self
    }

    /// Set the scratch buffer size.
    pub fn scratch_bytes(mut self, bytes: usize) -> Self {
        self.config().scratch_bytes = bytes;
        self
    }

    /// Set the module pool chunk size.
    pub fn module_chunk_size(mut self, slots: usize) -> Self {
        self.config().module_chunk_size = slots;
        self
    }

    /// Set the module reclamation isolation window.
    pub fn module_isolation_width(mut self, pools: usize) -> Self {
        self.config().module_isolation_width = pools;
        self
    }

    /// Set the synchronize poll cadence.
    pub fn sync_poll_interval(mut self, interval: Duration) -> Self {
        self.config().sync_poll_interval = interval;
        self
    }

    /// Set the abort poll cadence.
    pub fn abort_poll_interval(mut self, interval: Duration) -> Self {
        self.config().abort_poll_interval = interval;
        self
    }

    /// Set the abort hard deadline.
    pub fn abort_timeout(mut self, timeout: Duration) -> Self {
        self.config().abort_timeout = timeout;
        self
    }

    /// Validate and produce the configuration.
    pub fn build(mut self) -> Result<RuntimeConfig> {
        let config = self.config().clone();
        config.validate()?;
        Ok(config)
    }
}

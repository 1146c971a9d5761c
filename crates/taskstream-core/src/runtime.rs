//! Runtime: the explicit top-level object everything hangs off.
//!
//! There is no global state in this crate. A [`Runtime`] owns the driver
//! handle, the clock, and the configuration; contexts are created from it
//! and share it by `Arc`. Test harnesses construct one per test with a
//! simulated driver and a virtual clock.

use std::sync::Arc;

use crate::clock::{Clock, SystemClock};
use crate::config::RuntimeConfig;
use crate::context::Context;
use crate::driver::Driver;
use crate::error::{Result, RuntimeError};

/// Top-level runtime owning the driver, clock, and configuration.
pub struct Runtime {
    driver: Arc<dyn Driver>,
    clock: Arc<dyn Clock>,
    config: RuntimeConfig,
}

impl Runtime {
    /// Start building a runtime.
    pub fn builder() -> RuntimeBuilder {
        RuntimeBuilder::new()
    }

    /// The driver handle.
    pub fn driver(&self) -> &dyn Driver {
        self.driver.as_ref()
    }

    /// The time source.
    pub fn clock(&self) -> &dyn Clock {
        self.clock.as_ref()
    }

    /// The configuration.
    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    /// Create a context on this runtime.
    pub fn create_context(self: &Arc<Self>) -> Result<Context> {
        Context::new(Arc::clone(self))
    }
}

impl std::fmt::Debug for Runtime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Runtime")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

/// Builder for [`Runtime`].
pub struct RuntimeBuilder {
    driver: Option<Arc<dyn Driver>>,
    clock: Option<Arc<dyn Clock>>,
    config: Option<RuntimeConfig>,
}

impl RuntimeBuilder {
    /// Create a new builder.
    pub fn new() -> Self {
        Self {
            driver: None,
            clock: None,
            config: None,
        }
    }

    /// Set the driver backend. Required.
    pub fn driver(mut self, driver: Arc<dyn Driver>) -> Self {
        self.driver = Some(driver);
        self
    }

    /// Override the time source (defaults to [`SystemClock`]).
    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    /// Set the configuration (defaults to [`RuntimeConfig::default`]).
    pub fn config(mut self, config: RuntimeConfig) -> Self {
        self.config = Some(config);
        self
    }

    /// Validate and build the runtime.
    pub fn build(self) -> Result<Arc<Runtime>> {
        let driver = self.driver.ok_or_else(|| {
            RuntimeError::InvalidArgument("a driver backend is required".into())
        })?;
        let config = self.config.unwrap_or_default();
        config.validate()?;
        Ok(Arc::new(Runtime {
            driver,
            clock: self.clock.unwrap_or_else(|| Arc::new(SystemClock)),
            config,
        }))
    }
}

impl Default for RuntimeBuilder {
    fn default() -> Self {
        Self::new()
    }
}

//! Orchestrator builder for fluent configuration

use std::sync::Arc;

use stasis_clock::{ClockCompensator, ClockSource, SystemClockSource};
use stasis_core::{StasisConfig, StasisResult};
use stasis_timer::TimerConfig;

use crate::freeze::{FreezeMechanism, SignalStopFreeze};
use crate::orchestrator::CheckpointOrchestrator;

// ============================================================================
// Orchestrator Builder Pattern
// ============================================================================

/// Builder for [`CheckpointOrchestrator`]
///
/// ```ignore
/// use stasis_engine::CheckpointOrchestrator;
/// use stasis_core::StasisConfig;
///
/// // Production defaults: OS clocks, SIGSTOP-based freeze
/// let orchestrator = CheckpointOrchestrator::builder().build()?;
///
/// // Settings from stasis.toml
/// let config = StasisConfig::from_file("/var/lib/app/stasis.toml".as_ref())?;
/// let orchestrator = CheckpointOrchestrator::builder().config(config).build()?;
/// ```
pub struct OrchestratorBuilder {
    config: StasisConfig,
    clock_source: Option<Arc<dyn ClockSource>>,
    freeze: Option<Arc<dyn FreezeMechanism>>,
}

impl OrchestratorBuilder {
    /// Create new builder with defaults
    pub fn new() -> Self {
        Self {
            config: StasisConfig::default(),
            clock_source: None,
            freeze: None,
        }
    }

    /// Use these settings instead of the defaults
    pub fn config(mut self, config: StasisConfig) -> Self {
        self.config = config;
        self
    }

    /// Read raw clocks from `source` (default: operating system clocks)
    pub fn clock_source(mut self, source: Arc<dyn ClockSource>) -> Self {
        self.clock_source = Some(source);
        self
    }

    /// Freeze through `mechanism` (default: [`SignalStopFreeze`])
    pub fn freeze_mechanism(mut self, mechanism: Arc<dyn FreezeMechanism>) -> Self {
        self.freeze = Some(mechanism);
        self
    }

    /// Build the orchestrator
    ///
    /// # Errors
    ///
    /// Returns `InvalidConfig` if the configuration does not validate.
    pub fn build(self) -> StasisResult<Arc<CheckpointOrchestrator>> {
        self.config.validate()?;
        let timer_config = TimerConfig::from_config(&self.config)?;

        let source = self
            .clock_source
            .unwrap_or_else(|| Arc::new(SystemClockSource::new()) as Arc<dyn ClockSource>);
        let clock = Arc::new(ClockCompensator::new(
            source,
            self.config.min_restore_advance(),
        ));
        let freeze = self
            .freeze
            .unwrap_or_else(|| Arc::new(SignalStopFreeze::new()) as Arc<dyn FreezeMechanism>);

        Ok(Arc::new(CheckpointOrchestrator::from_parts(
            self.config,
            timer_config,
            clock,
            freeze,
        )))
    }
}

impl Default for OrchestratorBuilder {
    fn default() -> Self {
        Self::new()
    }
}

//! Stasis - checkpoint/restore coordination for long-running processes
//!
//! Stasis lets a running process be frozen to an image and resumed later,
//! possibly on another host, while keeping time-derived observables
//! consistent:
//! - monotonic time never runs backwards
//! - wall-clock time reflects the real gap
//! - pending timer tasks keep their remaining delay
//! - uptime excludes time spent frozen
//!
//! # Quick Start
//!
//! ```ignore
//! use stasis::{hook_fn, CheckpointOrchestrator, TaskSpec};
//! use std::time::Duration;
//!
//! let orchestrator = CheckpointOrchestrator::builder().build()?;
//!
//! orchestrator.register_pre_checkpoint(hook_fn("close-sockets", || Ok(())));
//! orchestrator.register_post_restore(hook_fn("reconnect", || Ok(())));
//!
//! let timer = orchestrator.new_timer("jobs")?;
//! timer.schedule(TaskSpec::after(Duration::from_secs(30)), || flush())?;
//!
//! // Blocks until the process is resumed
//! let outcome = orchestrator.checkpoint("/var/lib/app/checkpoint")?;
//! ```
//!
//! # Architecture
//!
//! - [`ClockCompensator`]: compensated monotonic and wall-clock reads
//! - [`HookRegistry`]: pre-checkpoint and post-restore hooks
//! - [`Timer`]: scheduled tasks re-based across restores
//! - [`CheckpointOrchestrator`]: drives the whole cycle

pub use stasis_clock::{
    testing::ManualClockSource, ClockCompensator, ClockSource, MonotonicReader, SystemClockSource,
    TimeSource,
};
pub use stasis_core::{
    CheckpointId, CheckpointParticipant, CheckpointPhase, EpochPair, HookPhase,
    MissedFiringPolicy, MonotonicTime, RestoreContext, RestoreRecord, StasisConfig, StasisError,
    StasisResult, WallTime, CONFIG_FILE_NAME,
};
pub use stasis_engine::{
    install_process_orchestrator, process_orchestrator, testing::SimulatedFreeze,
    CheckpointMarker, CheckpointMetrics, CheckpointOrchestrator, CheckpointOutcome, FreezeError,
    FreezeMechanism, OrchestratorBuilder, ResumeSignal, SafepointGate, SignalStopFreeze,
    WorkerToken,
};
pub use stasis_hooks::{
    hook_fn, FnHook, Hook, HookError, HookFailureRecord, HookHandle, HookRegistry,
    PostRestoreReport,
};
pub use stasis_timer::{Deadline, Recurrence, TaskHandle, TaskSpec, Timer, TimerConfig, TimerStats};

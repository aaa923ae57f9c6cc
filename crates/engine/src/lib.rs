//! Checkpoint orchestration for Stasis
//!
//! This crate drives the whole freeze/resume sequence:
//! - CheckpointOrchestrator: state machine, hook and participant coordination
//! - OrchestratorBuilder: config, clock source, freeze mechanism
//! - FreezeMechanism: the external suspend-and-snapshot call (`SignalStopFreeze`)
//! - SafepointGate: barrier that parks ordinary worker threads
//! - process: optional process-wide orchestrator slot
//! - testing: `SimulatedFreeze` for tests
//!
//! The orchestrator is the only component that knows the order in which
//! hooks, participants and the clock compensator are driven.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod builder;
pub mod freeze;
pub mod orchestrator;
pub mod process;
pub mod safepoint;
pub mod testing;

pub use builder::OrchestratorBuilder;
pub use freeze::{CheckpointMarker, FreezeError, FreezeMechanism, ResumeSignal, SignalStopFreeze};
pub use orchestrator::{CheckpointMetrics, CheckpointOrchestrator, CheckpointOutcome};
pub use process::{install_process_orchestrator, process_orchestrator};
pub use safepoint::{SafepointGate, WorkerToken};

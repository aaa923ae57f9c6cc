//! Checkpoint-aware scheduled tasks for Stasis
//!
//! - Timer: single dispatcher thread over a deadline-ordered heap
//! - TaskSpec: relative (`after`) or absolute (`at`) deadlines, optionally periodic
//! - TaskHandle: per-task cancellation and fire count
//!
//! A `Timer` is a `CheckpointParticipant`. On resume it re-bases relative
//! deadlines by the virtual delay that was still outstanding at checkpoint,
//! so time spent frozen never counts toward a relative delay, and re-reads the
//! wall clock for absolute deadlines.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod task;
pub mod timer;

pub use task::{Deadline, Recurrence, TaskHandle, TaskSpec};
pub use timer::{Timer, TimerConfig, TimerStats};

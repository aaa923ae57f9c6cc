//! Core types and traits for Stasis
//!
//! This crate defines the foundational types used throughout the system:
//! - MonotonicTime / WallTime: signed nanosecond time values on the two timelines
//! - EpochPair / RestoreRecord / RestoreContext: one freeze/resume cycle
//! - CheckpointId / CheckpointPhase / HookPhase: identifiers and state
//! - StasisError: error taxonomy
//! - StasisConfig: `stasis.toml` configuration
//! - CheckpointParticipant: the quiesce/resume contract

#![warn(missing_docs)]
#![warn(clippy::all)]

// Module declarations
pub mod config;
pub mod error;
pub mod time;
pub mod traits;
pub mod types;

// Re-export commonly used types and traits
pub use config::{MissedFiringPolicy, StasisConfig, CONFIG_FILE_NAME};
pub use error::{StasisError, StasisResult};
pub use time::{duration_to_nanos, nanos_to_duration, MonotonicTime, WallTime};
pub use traits::CheckpointParticipant;
pub use types::{
    CheckpointId, CheckpointPhase, EpochPair, HookPhase, RestoreContext, RestoreRecord,
};

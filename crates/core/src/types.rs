//! Records and identifiers shared by every layer
//!
//! - CheckpointId: unique identifier of one checkpoint attempt
//! - CheckpointPhase: orchestrator state machine position
//! - HookPhase: which hook sequence a hook belongs to
//! - EpochPair / RestoreRecord: the compensator's view of one freeze/resume cycle
//! - RestoreContext: what participants receive to re-base their pending work

use crate::time::{MonotonicTime, WallTime};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use uuid::Uuid;

/// Unique identifier of one checkpoint attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CheckpointId(Uuid);

impl CheckpointId {
    /// Create a new random id
    pub fn new() -> Self {
        CheckpointId(Uuid::new_v4())
    }

    /// Underlying UUID
    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for CheckpointId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for CheckpointId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Position of the orchestrator in the checkpoint state machine
///
/// ```text
/// Idle → PreHookRunning → Quiescing → Frozen → Restoring → PostHookRunning → Idle
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CheckpointPhase {
    /// No checkpoint in progress
    Idle,
    /// Running pre-checkpoint hooks
    PreHookRunning,
    /// Pausing participants and recording the epoch
    Quiescing,
    /// Control handed to the external freeze mechanism
    Frozen,
    /// Control returned; installing the compensation offset
    Restoring,
    /// Running post-restore hooks
    PostHookRunning,
}

impl CheckpointPhase {
    /// Whether a checkpoint attempt is active
    pub fn is_active(&self) -> bool {
        !matches!(self, CheckpointPhase::Idle)
    }

    /// Whether a cancellation request can still take effect
    pub fn is_cancellable(&self) -> bool {
        matches!(self, CheckpointPhase::PreHookRunning)
    }
}

impl fmt::Display for CheckpointPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            CheckpointPhase::Idle => "idle",
            CheckpointPhase::PreHookRunning => "pre-hook-running",
            CheckpointPhase::Quiescing => "quiescing",
            CheckpointPhase::Frozen => "frozen",
            CheckpointPhase::Restoring => "restoring",
            CheckpointPhase::PostHookRunning => "post-hook-running",
        };
        f.write_str(name)
    }
}

/// Which ordered hook sequence a hook belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum HookPhase {
    /// Runs before the process is frozen
    PreCheckpoint,
    /// Runs after the process resumes
    PostRestore,
}

impl fmt::Display for HookPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HookPhase::PreCheckpoint => f.write_str("pre-checkpoint"),
            HookPhase::PostRestore => f.write_str("post-restore"),
        }
    }
}

/// Clock readings captured the instant a checkpoint is initiated
///
/// Immutable once recorded for a given checkpoint attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct EpochPair {
    /// Compensated monotonic time at checkpoint
    pub virtual_monotonic: MonotonicTime,
    /// Wall clock at checkpoint
    pub wall_clock: WallTime,
}

/// Clock readings captured the instant execution resumes after a restore
///
/// Exactly one record exists per restore event; a fresh one replaces the prior.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RestoreRecord {
    /// Restore instant (strictly after the checkpoint wall clock)
    pub wall_clock_at_restore: WallTime,
    /// Wall-clock gap between checkpoint and restore, clamped to be non-negative
    pub real_elapsed_since_checkpoint: Duration,
    /// How far the monotonic timeline was advanced across the gap
    ///
    /// At least the configured minimum restore advance.
    pub applied_advance: Duration,
    /// Compensation offset installed for raw monotonic reads
    pub offset_nanos: i64,
    /// Whether the wall clock was observed running backwards
    pub clock_regressed: bool,
    /// 1 for the first restore, incremented on each subsequent one
    pub generation: u64,
}

/// Everything a participant needs to re-base its pending work after a restore
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RestoreContext {
    /// Attempt that produced this restore
    pub checkpoint_id: CheckpointId,
    /// Epoch recorded before the freeze
    pub epoch: EpochPair,
    /// Record produced on resume
    pub record: RestoreRecord,
}

impl RestoreContext {
    /// Portion of a relative deadline that had not yet elapsed at checkpoint
    ///
    /// Zero when the deadline had already passed before the freeze.
    pub fn remaining_at_checkpoint(&self, deadline: MonotonicTime) -> Duration {
        deadline.saturating_duration_since(self.epoch.virtual_monotonic)
    }
}

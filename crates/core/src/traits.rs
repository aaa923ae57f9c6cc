//! Core traits for checkpoint participation
//!
//! Any subsystem that owns threads or scheduled work implements
//! [`CheckpointParticipant`] so the orchestrator can park it before the
//! freeze and hand it the restore context afterwards.

use std::time::Duration;

use crate::error::StasisResult;
use crate::types::RestoreContext;

/// A subsystem that must be paused across a checkpoint
///
/// Thread safety: all methods are called from the checkpoint-driving thread
/// while other threads may still be using the participant (requires Send + Sync).
///
/// # Lifecycle
///
/// ```text
/// quiesce(timeout)  ... freeze ...  resume(Some(ctx))   restore completed
/// quiesce(timeout)  ... failure ... resume(None)        attempt aborted
/// ```
pub trait CheckpointParticipant: Send + Sync {
    /// Human-readable name for logging
    fn name(&self) -> &str;

    /// Whether to park before pre-checkpoint hooks run
    ///
    /// Participants that only run scheduled work park early, so work a hook
    /// schedules cannot run before the freeze. Worker threads park after the
    /// hooks, which may still depend on them.
    fn parks_before_hooks(&self) -> bool {
        false
    }

    /// Park every thread owned by this participant
    ///
    /// Must not return `Ok` until no owned thread can observe a clock value or
    /// run scheduled work. Returns `QuiesceTimeout` if that cannot be achieved
    /// within `timeout`. A participant that fails to park must leave itself
    /// running; the orchestrator only resumes participants that parked.
    ///
    /// # Errors
    ///
    /// Returns an error if the participant cannot be parked.
    fn quiesce(&self, timeout: Duration) -> StasisResult<()>;

    /// Release parked threads
    ///
    /// With `Some(ctx)` a restore completed: pending work must be re-based
    /// against `ctx` *before* any owned thread is released. With `None` the
    /// attempt was aborted and work continues on the unchanged timeline.
    fn resume(&self, restore: Option<&RestoreContext>);
}
